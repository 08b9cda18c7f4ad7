// Copyright 2025 itscheems
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
	io,
	path::{Path, PathBuf},
	thread::{self, JoinHandle},
};

use crossbeam::channel::{Receiver, Sender, bounded, select};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::{
	store::{StoreError, load_json, save_json},
	types::is_closed,
};

#[derive(Debug, Error)]
pub enum IdError {
	#[error("Failed to load id counter: {0}")]
	Store(#[from] StoreError),
	#[error("Id generator for {0} has stopped")]
	Stopped(String),
	#[error("Failed to spawn id generator thread: {0}")]
	Spawn(#[source] io::Error),
}

/// On-disk counter: the last id that was prepared for hand-out
#[derive(Debug, Default, Serialize, Deserialize)]
struct Counter {
	id: u64,
}

/// Monotonic order id allocator for one coin pair
///
/// A background thread keeps exactly one id ready. Each id is written to
/// the counter file before it is offered on a rendezvous channel, so an id
/// that any caller has seen is always on disk, and a restarted generator
/// resumes strictly above it. Ids prepared but never taken are skipped,
/// never reused.
///
/// The thread stops when `closing` is closed (all its senders dropped),
/// when the generator is dropped, or when the counter cannot be written.
/// After that `get_id` fails with [`IdError::Stopped`].
pub struct IdGenerator {
	pair: String,
	path: PathBuf,
	ids: Receiver<u64>,
	stop: Option<Sender<()>>,
	thread_handle: Option<JoinHandle<()>>,
}

impl IdGenerator {
	/// Load the counter at `path` and start handing out ids above it.
	///
	/// A missing counter file starts the sequence at 1.
	pub fn start(
		pair: impl Into<String>,
		path: impl Into<PathBuf>,
		closing: Receiver<()>,
	) -> Result<Self, IdError> {
		let pair = pair.into();
		let path = path.into();
		let last = load_json::<Counter>(&path)?.unwrap_or_default().id;

		let (id_tx, ids) = bounded(0);
		let (stop, stopped) = bounded(0);

		let thread_pair = pair.clone();
		let thread_path = path.clone();
		let thread_handle = thread::Builder::new()
			.name(format!("idgen-{}", pair))
			.spawn(move || {
				info!(target: "idgen", pair = %thread_pair, last = last, "Id generator started");
				Self::run_loop(&thread_pair, &thread_path, last, &id_tx, &closing, &stopped);
				info!(target: "idgen", pair = %thread_pair, "Id generator stopped");
			})
			.map_err(IdError::Spawn)?;

		Ok(Self {
			pair,
			path,
			ids,
			stop: Some(stop),
			thread_handle: Some(thread_handle),
		})
	}

	fn run_loop(
		pair: &str,
		path: &Path,
		mut last: u64,
		ids: &Sender<u64>,
		closing: &Receiver<()>,
		stopped: &Receiver<()>,
	) {
		loop {
			if is_closed(closing) {
				return;
			}

			let Some(next) = last.checked_add(1) else {
				error!(target: "idgen", pair = pair, "Id space exhausted");
				return;
			};

			// Durability before visibility
			if let Err(e) = save_json(path, &Counter { id: next }) {
				error!(
					target: "idgen",
					pair = pair,
					id = next,
					error = %e,
					"Failed to persist id counter, halting id allocation"
				);
				return;
			}
			last = next;

			select! {
				send(ids, next) -> res => {
					if res.is_err() {
						return;
					}
					debug!(target: "idgen", pair = pair, id = next, "Id handed out");
				}
				recv(closing) -> _ => return,
				recv(stopped) -> _ => return,
			}
		}
	}

	/// Take the next id, blocking until the generator has one ready
	pub fn get_id(&self) -> Result<u64, IdError> {
		self.ids
			.recv()
			.map_err(|_| IdError::Stopped(self.pair.clone()))
	}

	pub fn pair(&self) -> &str {
		&self.pair
	}

	/// Location of the counter file
	pub fn path(&self) -> &Path {
		&self.path
	}
}

impl Drop for IdGenerator {
	fn drop(&mut self) {
		drop(self.stop.take());
		if let Some(handle) = self.thread_handle.take() {
			let _ = handle.join();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::{fs, time::Duration};
	use tempfile::TempDir;

	fn read_counter(path: &Path) -> u64 {
		load_json::<Counter>(path).unwrap().unwrap().id
	}

	#[test]
	fn test_id_generator_empty() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("test_sky.id");
		let (_closing_tx, closing) = bounded::<()>(0);

		let idg = IdGenerator::start("test/sky", &path, closing).unwrap();
		assert_eq!(idg.get_id().unwrap(), 1);
		drop(idg);

		assert!(read_counter(&path) >= 1);
	}

	#[test]
	fn test_id_generator_resumes_from_file() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("test1_sky.id");
		save_json(&path, &Counter { id: 4 }).unwrap();

		let (_closing_tx, closing) = bounded::<()>(0);
		let idg = IdGenerator::start("test1/sky", &path, closing).unwrap();
		for i in 1..10 {
			assert_eq!(idg.get_id().unwrap(), 4 + i);
		}
		drop(idg);

		// the last handed-out id is always durable
		assert!(read_counter(&path) >= 13);
	}

	#[test]
	fn test_closing_stops_generator() {
		let dir = TempDir::new().unwrap();
		let (closing_tx, closing) = bounded::<()>(0);
		let idg = IdGenerator::start("btc/sky", dir.path().join("btc_sky.id"), closing).unwrap();
		assert_eq!(idg.get_id().unwrap(), 1);

		drop(closing_tx);
		thread::sleep(Duration::from_millis(100));

		assert!(matches!(idg.get_id(), Err(IdError::Stopped(_))));
	}

	#[test]
	fn test_write_failure_halts_generator() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("missing").join("btc_sky.id");
		let (_closing_tx, closing) = bounded::<()>(0);

		let idg = IdGenerator::start("btc/sky", &path, closing).unwrap();
		assert!(matches!(idg.get_id(), Err(IdError::Stopped(_))));
		assert!(!path.exists());
	}

	#[test]
	fn test_corrupt_counter_is_rejected() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("btc_sky.id");
		fs::write(&path, b"not a counter").unwrap();
		let (_closing_tx, closing) = bounded::<()>(0);

		let result = IdGenerator::start("btc/sky", &path, closing);
		assert!(matches!(result, Err(IdError::Store(StoreError::Json { .. }))));
	}

	#[test]
	fn test_concurrent_callers_get_distinct_ids() {
		let dir = TempDir::new().unwrap();
		let (_closing_tx, closing) = bounded::<()>(0);
		let idg = std::sync::Arc::new(
			IdGenerator::start("btc/sky", dir.path().join("btc_sky.id"), closing).unwrap(),
		);

		let callers: Vec<_> = (0..4)
			.map(|_| {
				let idg = idg.clone();
				thread::spawn(move || (0..50).map(|_| idg.get_id().unwrap()).collect::<Vec<_>>())
			})
			.collect();

		let mut all: Vec<u64> = callers.into_iter().flat_map(|c| c.join().unwrap()).collect();
		all.sort_unstable();
		all.dedup();
		assert_eq!(all.len(), 200);
		assert_eq!(all.first(), Some(&1));
		assert_eq!(all.last(), Some(&200));
	}
}

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

//! On-disk state of the matching core
//!
//! A single data directory holds, per coin pair `base/quote`:
//! - `base_quote.ord`: the book checkpoint (`{"bids": [...], "asks": [...]}`,
//!   plus `"pending": [...]` while touched orders wait for settlement)
//! - `base_quote.id`: the order id counter (`{"id": N}`)
//!
//! Every write goes to a temporary file that is synced and then renamed
//! over the target, and the directory is synced after the rename, so a
//! crash or power loss leaves either the old or the new content.

use std::{
	fs::{self, File},
	io::{self, Write},
	path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{orderbook::BookSnapshot, types::Order};

/// Extension of book checkpoint files
pub const BOOK_EXT: &str = "ord";
/// Extension of id counter files
pub const ID_EXT: &str = "id";

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("I/O error on {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: io::Error,
	},
	#[error("Malformed JSON in {path}: {source}")]
	Json {
		path: PathBuf,
		#[source]
		source: serde_json::Error,
	},
	#[error("Invalid coin pair: {0:?} (expected \"base/quote\")")]
	InvalidPair(String),
}

impl StoreError {
	fn io(path: &Path, source: io::Error) -> Self {
		Self::Io {
			path: path.to_path_buf(),
			source,
		}
	}
}

/// Everything a pair persists: its book and the touched orders that
/// settlement has not taken yet
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
	#[serde(flatten)]
	pub book: BookSnapshot,
	/// Oldest first
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub pending: Vec<Order>,
}

impl From<BookSnapshot> for Checkpoint {
	fn from(book: BookSnapshot) -> Self {
		Self {
			book,
			pending: Vec::new(),
		}
	}
}

/// Check that a coin pair is two non-empty `/`-separated segments that
/// survive the round trip through a file name.
pub fn validate_pair(pair: &str) -> Result<(), StoreError> {
	let mut parts = pair.split('/');
	let ok = match (parts.next(), parts.next(), parts.next()) {
		(Some(base), Some(quote), None) => [base, quote]
			.iter()
			.all(|s| !s.is_empty() && !s.contains(['_', '.', '\\'])),
		_ => false,
	};
	if ok {
		Ok(())
	} else {
		Err(StoreError::InvalidPair(pair.to_string()))
	}
}

/// File stem for a pair: `btc/sky` -> `btc_sky`
pub fn pair_stem(pair: &str) -> Result<String, StoreError> {
	validate_pair(pair)?;
	Ok(pair.replacen('/', "_", 1))
}

/// Inverse of [`pair_stem`]: `btc_sky` -> `btc/sky`
pub fn pair_from_stem(stem: &str) -> Result<String, StoreError> {
	let pair = stem.replacen('_', "/", 1);
	validate_pair(&pair)?;
	Ok(pair)
}

/// Path of the id counter file for a pair
pub fn id_path(dir: &Path, pair: &str) -> Result<PathBuf, StoreError> {
	Ok(dir.join(format!("{}.{}", pair_stem(pair)?, ID_EXT)))
}

/// Serialize `value` to `path` atomically
pub fn save_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
	let data = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Json {
		path: path.to_path_buf(),
		source,
	})?;

	let mut tmp = path.as_os_str().to_owned();
	tmp.push(".tmp");
	let tmp = PathBuf::from(tmp);

	let mut file = File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
	file.write_all(&data).map_err(|e| StoreError::io(&tmp, e))?;
	file.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
	drop(file);

	fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))?;
	sync_dir(&parent_dir(path))
}

/// Directory holding `path`; `.` for a bare file name
fn parent_dir(path: &Path) -> PathBuf {
	match path.parent() {
		Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
		_ => PathBuf::from("."),
	}
}

/// Make a rename inside `dir` durable
#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), StoreError> {
	File::open(dir)
		.and_then(|d| d.sync_all())
		.map_err(|e| StoreError::io(dir, e))
}

// Directory handles cannot be synced here; rename durability is up to the filesystem
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), StoreError> {
	Ok(())
}

/// Load a JSON value, `Ok(None)` if the file does not exist
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
	let data = match fs::read(path) {
		Ok(data) => data,
		Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
		Err(e) => return Err(StoreError::io(path, e)),
	};
	serde_json::from_slice(&data)
		.map(Some)
		.map_err(|source| StoreError::Json {
			path: path.to_path_buf(),
			source,
		})
}

/// Directory of book checkpoints, one file per coin pair
#[derive(Debug, Clone)]
pub struct BookStore {
	dir: PathBuf,
}

impl BookStore {
	/// Open (and create if needed) the data directory
	pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
		let dir = dir.into();
		fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
		Ok(Self { dir })
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	pub fn book_path(&self, pair: &str) -> Result<PathBuf, StoreError> {
		Ok(self.dir.join(format!("{}.{}", pair_stem(pair)?, BOOK_EXT)))
	}

	pub fn id_path(&self, pair: &str) -> Result<PathBuf, StoreError> {
		id_path(&self.dir, pair)
	}

	pub fn save(&self, pair: &str, checkpoint: &Checkpoint) -> Result<(), StoreError> {
		let path = self.book_path(pair)?;
		save_json(&path, checkpoint)?;
		debug!(
			target: "store",
			pair = pair,
			bids = checkpoint.book.bids.len(),
			asks = checkpoint.book.asks.len(),
			pending = checkpoint.pending.len(),
			"Book checkpoint written"
		);
		Ok(())
	}

	pub fn load(&self, pair: &str) -> Result<Option<Checkpoint>, StoreError> {
		load_json(&self.book_path(pair)?)
	}

	/// Read every book checkpoint in the directory, sorted by pair.
	///
	/// Files without the book extension are skipped; a checkpoint whose
	/// name does not decode to a coin pair is skipped with a warning.
	pub fn load_all(&self) -> Result<Vec<(String, Checkpoint)>, StoreError> {
		let entries = fs::read_dir(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;

		let mut books = Vec::new();
		for entry in entries {
			let path = entry.map_err(|e| StoreError::io(&self.dir, e))?.path();
			if path.extension().and_then(|e| e.to_str()) != Some(BOOK_EXT) {
				continue;
			}
			let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
				continue;
			};
			let pair = match pair_from_stem(stem) {
				Ok(pair) => pair,
				Err(e) => {
					warn!(target: "store", path = %path.display(), error = %e, "Skipping book file");
					continue;
				}
			};
			if let Some(checkpoint) = load_json::<Checkpoint>(&path)? {
				books.push((pair, checkpoint));
			}
		}

		books.sort_by(|a, b| a.0.cmp(&b.0));
		Ok(books)
	}
}

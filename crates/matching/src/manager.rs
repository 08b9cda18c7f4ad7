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
	collections::VecDeque,
	io, mem,
	path::PathBuf,
	sync::{
		Arc, Mutex, MutexGuard, PoisonError,
		atomic::{AtomicBool, Ordering},
	},
	thread::{self, JoinHandle},
	time::Duration,
};

use crossbeam::channel::{Receiver, Sender, TrySendError, bounded, select, tick};
use dashmap::{DashMap, mapref::entry::Entry};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
	idgen::{IdError, IdGenerator},
	orderbook::Book,
	store::{BookStore, Checkpoint, StoreError, validate_pair},
	types::{Order, Side},
};

#[derive(Debug, Error)]
pub enum ManagerError {
	#[error("Coin pair is empty")]
	EmptyPair,
	#[error("Invalid coin pair: {0:?}")]
	InvalidPair(String),
	#[error("Book of coin pair {0} already exists")]
	BookExists(String),
	#[error("Book not found: {0}")]
	BookNotFound(String),
	#[error("Order channel of coin pair {0} already registered")]
	ChanExists(String),
	#[error("No order channel registered for coin pair {0}")]
	ChanNotRegistered(String),
	#[error("Invalid order {id}: {reason}")]
	InvalidOrder { id: u64, reason: &'static str },
	#[error("Manager is already running")]
	AlreadyRunning,
	#[error("Id generator for {0} is not running")]
	IdGeneratorNotRunning(String),
	#[error("Matching worker for {0} panicked")]
	WorkerPanicked(String),
	#[error("Failed to spawn matching worker: {0}")]
	Spawn(#[source] io::Error),
	#[error(transparent)]
	Id(#[from] IdError),
	#[error(transparent)]
	Store(#[from] StoreError),
}

/// Owner of every coin pair's book
///
/// The manager is the explicit registry of the matching core: books and
/// their settlement channels are registered up front, then `start` spawns
/// one independent matching worker and one id generator per pair. Pairs
/// share nothing; a slow or stuck pair never delays another.
///
/// Orders submitted through `add_order` are only appended. Crossing happens
/// on the worker's next tick, which:
/// 1. runs `Book::match_orders` and queues every touched order in the
///    pair's outbox
/// 2. checkpoints the book together with the outbox
/// 3. sends the outbox to the pair's settlement channel, oldest first
///
/// An order leaves the outbox only once settlement has taken it. Whatever
/// is still queued at shutdown is part of the final checkpoint and is sent
/// first after the next start, so a fill reaches settlement at least once.
pub struct Manager {
	store: BookStore,
	books: DashMap<String, Arc<PairState>>,
	chans: DashMap<String, Sender<Order>>,
	idgens: DashMap<String, Arc<IdGenerator>>,
	running: AtomicBool,
}

impl Manager {
	/// Create an empty manager persisting into `data_dir`
	pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self, ManagerError> {
		Ok(Self {
			store: BookStore::open(data_dir)?,
			books: DashMap::new(),
			chans: DashMap::new(),
			idgens: DashMap::new(),
			running: AtomicBool::new(false),
		})
	}

	/// Create a manager and register every book checkpointed in `data_dir`.
	///
	/// Resting orders in a checkpoint must pass the same checks as
	/// `add_order` and sit on the right side of the book.
	pub fn load(data_dir: impl Into<PathBuf>) -> Result<Self, ManagerError> {
		let manager = Self::new(data_dir)?;
		for (pair, checkpoint) in manager.store.load_all()? {
			validate_resting(&checkpoint.book.bids, Side::Bid)?;
			validate_resting(&checkpoint.book.asks, Side::Ask)?;
			info!(
				target: "manager",
				pair = %pair,
				bids = checkpoint.book.bids.len(),
				asks = checkpoint.book.asks.len(),
				pending = checkpoint.pending.len(),
				"Loaded book from checkpoint"
			);
			manager.insert_pair(
				&pair,
				Book::from_snapshot(checkpoint.book),
				checkpoint.pending,
			)?;
		}
		Ok(manager)
	}

	pub fn store(&self) -> &BookStore {
		&self.store
	}

	/// Register the book of a coin pair. Each pair can be registered once,
	/// and only before the manager starts.
	pub fn add_book(&self, pair: &str, book: Book) -> Result<(), ManagerError> {
		self.insert_pair(pair, book, Vec::new())
	}

	fn insert_pair(&self, pair: &str, book: Book, pending: Vec<Order>) -> Result<(), ManagerError> {
		check_pair(pair)?;
		self.ensure_stopped()?;

		match self.books.entry(pair.to_string()) {
			Entry::Occupied(_) => Err(ManagerError::BookExists(pair.to_string())),
			Entry::Vacant(slot) => {
				slot.insert(Arc::new(PairState::new(book, pending)));
				debug!(target: "manager", pair = pair, "Book registered");
				Ok(())
			}
		}
	}

	pub fn has_book(&self, pair: &str) -> bool {
		self.books.contains_key(pair)
	}

	/// Registered coin pairs, sorted
	pub fn pairs(&self) -> Vec<String> {
		let mut pairs: Vec<String> = self.books.iter().map(|e| e.key().clone()).collect();
		pairs.sort();
		pairs
	}

	/// Independent copy of a pair's book, for read-only queries
	pub fn get_book(&self, pair: &str) -> Result<Book, ManagerError> {
		Ok(self.pair(pair)?.book.copy())
	}

	/// One side of a pair's book in priority order, restricted to `[start, end)`
	pub fn get_orders(
		&self,
		pair: &str,
		side: Side,
		start: usize,
		end: usize,
	) -> Result<Vec<Order>, ManagerError> {
		Ok(self.pair(pair)?.book.orders(side, start, end))
	}

	/// Touched orders that settlement has not taken yet, oldest first
	pub fn pending_orders(&self, pair: &str) -> Result<Vec<Order>, ManagerError> {
		Ok(self.pair(pair)?.outbox().iter().cloned().collect())
	}

	/// Bind the channel that receives the orders touched by matching
	pub fn register_order_chan(&self, pair: &str, chan: Sender<Order>) -> Result<(), ManagerError> {
		self.ensure_stopped()?;
		if !self.has_book(pair) {
			return Err(ManagerError::BookNotFound(pair.to_string()));
		}

		match self.chans.entry(pair.to_string()) {
			Entry::Occupied(_) => Err(ManagerError::ChanExists(pair.to_string())),
			Entry::Vacant(slot) => {
				slot.insert(chan);
				Ok(())
			}
		}
	}

	/// Append an order to its side of the pair's book.
	///
	/// The order must already carry its allocated id. Matching happens on
	/// the pair worker's next tick, not here.
	pub fn add_order(&self, pair: &str, order: Order) -> Result<(), ManagerError> {
		let state = self.pair(pair)?;
		validate_order(&order)?;

		debug!(
			target: "manager",
			pair = pair,
			id = order.id,
			side = %order.side,
			price = order.price,
			amount = order.amount,
			"Order added"
		);
		state.book.add_order(order);
		Ok(())
	}

	/// Allocate the next order id of a pair. Blocks until the pair's id
	/// generator has one ready.
	pub fn next_order_id(&self, pair: &str) -> Result<u64, ManagerError> {
		let idgen = self
			.idgens
			.get(pair)
			.map(|g| g.value().clone())
			.ok_or_else(|| ManagerError::IdGeneratorNotRunning(pair.to_string()))?;
		Ok(idgen.get_id()?)
	}

	/// Write a pair's checkpoint (book and undelivered orders) now
	pub fn checkpoint(&self, pair: &str) -> Result<(), ManagerError> {
		self.pair(pair)?.checkpoint(&self.store, pair)?;
		Ok(())
	}

	/// Write the checkpoint of every pair
	pub fn checkpoint_all(&self) -> Result<(), ManagerError> {
		for pair in self.pairs() {
			self.checkpoint(&pair)?;
		}
		Ok(())
	}

	/// Start one matching worker and one id generator per registered pair.
	///
	/// Every pair needs an order channel. Workers match every `tick` and
	/// stop when `closing` is closed (every sender dropped), including while
	/// blocked on a full settlement channel. A manager starts at most once;
	/// a failed start leaves nothing running and can be retried.
	pub fn start(&self, tick: Duration, closing: Receiver<()>) -> Result<MatchingWorkers, ManagerError> {
		if self
			.running
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.is_err()
		{
			return Err(ManagerError::AlreadyRunning);
		}

		let result = self.spawn_workers(tick, closing);
		if result.is_err() {
			self.running.store(false, Ordering::Release);
		}
		result
	}

	fn spawn_workers(&self, tick: Duration, closing: Receiver<()>) -> Result<MatchingWorkers, ManagerError> {
		let pairs = self.pairs();

		let mut targets = Vec::with_capacity(pairs.len());
		for pair in &pairs {
			let out = self
				.chans
				.get(pair)
				.map(|c| c.value().clone())
				.ok_or_else(|| ManagerError::ChanNotRegistered(pair.clone()))?;
			targets.push((pair.clone(), self.pair(pair)?, out));
		}

		// Every counter must load before anything runs
		let mut idgens = Vec::with_capacity(pairs.len());
		for pair in &pairs {
			let idgen = IdGenerator::start(pair.as_str(), self.store.id_path(pair)?, closing.clone())?;
			idgens.push((pair.clone(), idgen));
		}

		let (halt, halted) = bounded(0);
		let mut workers = MatchingWorkers {
			halt: Some(halt),
			handles: Vec::with_capacity(pairs.len()),
		};
		for (pair, state, out) in targets {
			let worker = PairWorker {
				pair: pair.clone(),
				state,
				out,
				store: self.store.clone(),
				closing: closing.clone(),
				halted: halted.clone(),
				tick,
			};

			// On error `workers` drops, which halts and joins what already runs
			let handle = thread::Builder::new()
				.name(format!("match-{}", pair))
				.spawn(move || worker.run())
				.map_err(ManagerError::Spawn)?;
			workers.handles.push((pair, handle));
		}

		for (pair, idgen) in idgens {
			self.idgens.insert(pair, Arc::new(idgen));
		}

		info!(
			target: "manager",
			pairs = workers.handles.len(),
			tick_ms = tick.as_millis() as u64,
			"Matching manager started"
		);
		Ok(workers)
	}

	/// `start`, then block until every pair worker has stopped
	pub fn run(&self, tick: Duration, closing: Receiver<()>) -> Result<(), ManagerError> {
		self.start(tick, closing)?.join()
	}

	fn pair(&self, pair: &str) -> Result<Arc<PairState>, ManagerError> {
		self.books
			.get(pair)
			.map(|b| b.value().clone())
			.ok_or_else(|| ManagerError::BookNotFound(pair.to_string()))
	}

	fn ensure_stopped(&self) -> Result<(), ManagerError> {
		if self.running.load(Ordering::Acquire) {
			Err(ManagerError::AlreadyRunning)
		} else {
			Ok(())
		}
	}
}

/// A registered pair: its book and the outbox of touched orders that
/// settlement has not taken yet
struct PairState {
	book: Book,
	outbox: Mutex<VecDeque<Order>>,
}

impl PairState {
	fn new(book: Book, pending: Vec<Order>) -> Self {
		Self {
			book,
			outbox: Mutex::new(pending.into()),
		}
	}

	fn outbox(&self) -> MutexGuard<'_, VecDeque<Order>> {
		// The queue stays consistent even if a holder panicked
		self.outbox.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Run a matching pass and queue what it touched. Holding the outbox
	/// lock keeps a concurrent checkpoint from seeing the fills in neither
	/// the book nor the outbox.
	fn match_pass(&self) -> usize {
		let mut outbox = self.outbox();
		let touched = self.book.match_orders();
		let count = touched.len();
		outbox.extend(touched);
		count
	}

	/// Save book and outbox as one checkpoint. Returns the book revision
	/// the checkpoint covers.
	fn checkpoint(&self, store: &BookStore, pair: &str) -> Result<u64, StoreError> {
		let outbox = self.outbox();
		let revision = self.book.revision();
		let checkpoint = Checkpoint {
			book: self.book.snapshot(),
			pending: outbox.iter().cloned().collect(),
		};
		store.save(pair, &checkpoint)?;
		Ok(revision)
	}
}

/// Join handles of the per-pair matching workers
///
/// Dropping it without `join` stops the workers and waits for them.
pub struct MatchingWorkers {
	halt: Option<Sender<()>>,
	handles: Vec<(String, JoinHandle<()>)>,
}

impl MatchingWorkers {
	pub fn pairs(&self) -> impl Iterator<Item = &str> {
		self.handles.iter().map(|(pair, _)| pair.as_str())
	}

	/// Wait for every worker to stop. Reports the first worker that
	/// panicked, after all of them have been joined.
	pub fn join(mut self) -> Result<(), ManagerError> {
		let mut result = Ok(());
		for (pair, handle) in mem::take(&mut self.handles) {
			if handle.join().is_err() {
				error!(target: "manager", pair = %pair, "Matching worker panicked");
				if result.is_ok() {
					result = Err(ManagerError::WorkerPanicked(pair));
				}
			}
		}
		result
	}
}

impl Drop for MatchingWorkers {
	fn drop(&mut self) {
		drop(self.halt.take());
		for (pair, handle) in self.handles.drain(..) {
			if handle.join().is_err() {
				error!(target: "manager", pair = %pair, "Matching worker panicked");
			}
		}
	}
}

struct PairWorker {
	pair: String,
	state: Arc<PairState>,
	out: Sender<Order>,
	store: BookStore,
	closing: Receiver<()>,
	halted: Receiver<()>,
	tick: Duration,
}

impl PairWorker {
	fn run(self) {
		info!(
			target: "matching",
			pair = %self.pair,
			pending = self.state.outbox().len(),
			"Matching worker started"
		);
		let ticker = tick(self.tick);
		let mut saved = None;
		let mut delivered = false;

		// Leftovers of the previous run go out before any new fill
		let mut running = self.publish(&mut delivered);
		while running {
			select! {
				recv(self.closing) -> _ => break,
				recv(self.halted) -> _ => break,
				recv(ticker) -> _ => {
					let touched = self.state.match_pass();
					if touched > 0 {
						debug!(
							target: "matching",
							pair = %self.pair,
							touched = touched,
							"Matching pass filled orders"
						);
					}
					if self.checkpoint_if_changed(&mut saved, &mut delivered) {
						running = self.publish(&mut delivered);
					}
				}
			}
		}

		self.checkpoint_if_changed(&mut saved, &mut delivered);
		let pending = self.state.outbox().len();
		if pending > 0 {
			warn!(
				target: "matching",
				pair = %self.pair,
				pending = pending,
				"Stopped with undelivered orders, kept in checkpoint for redelivery"
			);
		}
		info!(target: "matching", pair = %self.pair, "Matching worker stopped");
	}

	/// Checkpoint if the book changed or orders were delivered since the
	/// last checkpoint. Returns whether the checkpoint on disk is current.
	fn checkpoint_if_changed(&self, saved: &mut Option<u64>, delivered: &mut bool) -> bool {
		if *saved == Some(self.state.book.revision()) && !*delivered {
			return true;
		}
		match self.state.checkpoint(&self.store, &self.pair) {
			Ok(revision) => {
				*saved = Some(revision);
				*delivered = false;
				true
			}
			Err(e) => {
				error!(
					target: "matching",
					pair = %self.pair,
					error = %e,
					"Failed to checkpoint book, holding fills until the next tick"
				);
				false
			}
		}
	}

	/// Hand the outbox to settlement, oldest first. A full channel is
	/// waited on; returns false if the worker was told to stop meanwhile.
	fn publish(&self, delivered: &mut bool) -> bool {
		loop {
			let Some(order) = self.state.outbox().front().cloned() else {
				return true;
			};

			let order = match self.out.try_send(order) {
				Ok(()) => {
					self.state.outbox().pop_front();
					*delivered = true;
					continue;
				}
				Err(TrySendError::Full(order)) => {
					warn!(
						target: "matching",
						pair = %self.pair,
						id = order.id,
						"Settlement channel full, waiting"
					);
					order
				}
				Err(TrySendError::Disconnected(order)) => {
					self.log_disconnected(&order);
					return true;
				}
			};

			select! {
				send(self.out, order) -> res => match res {
					Ok(()) => {
						self.state.outbox().pop_front();
						*delivered = true;
					}
					Err(e) => {
						self.log_disconnected(&e.into_inner());
						return true;
					}
				},
				recv(self.closing) -> _ => return false,
				recv(self.halted) -> _ => return false,
			}
		}
	}

	fn log_disconnected(&self, order: &Order) {
		error!(
			target: "matching",
			pair = %self.pair,
			id = order.id,
			rest_amt = order.rest_amt,
			pending = self.state.outbox().len(),
			"Settlement channel disconnected, keeping orders for redelivery"
		);
	}
}

fn check_pair(pair: &str) -> Result<(), ManagerError> {
	if pair.is_empty() {
		return Err(ManagerError::EmptyPair);
	}
	validate_pair(pair).map_err(|_| ManagerError::InvalidPair(pair.to_string()))
}

fn validate_resting(orders: &[Order], side: Side) -> Result<(), ManagerError> {
	for order in orders {
		if order.side != side {
			return Err(ManagerError::InvalidOrder {
				id: order.id,
				reason: "resting on the wrong side of the book",
			});
		}
		validate_order(order)?;
	}
	Ok(())
}

fn validate_order(order: &Order) -> Result<(), ManagerError> {
	let reason = if order.price == 0 {
		"price is zero"
	} else if order.amount == 0 {
		"amount is zero"
	} else if order.rest_amt == 0 {
		"nothing left to fill"
	} else if order.rest_amt > order.amount {
		"rest amount exceeds amount"
	} else {
		return Ok(());
	};
	Err(ManagerError::InvalidOrder {
		id: order.id,
		reason,
	})
}

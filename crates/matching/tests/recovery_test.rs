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

use std::{fs, mem, time::Duration};

use crossbeam::channel::bounded;
use tempfile::TempDir;

use skyex_matching::{
	Book, BookStore, Checkpoint, IdGenerator, Manager, ManagerError, Order, Side,
};

const TICK: Duration = Duration::from_millis(20);
const WAIT: Duration = Duration::from_secs(5);

fn create_test_order(id: u64, side: Side, price: u64, created_at: u64) -> Order {
	Order {
		id,
		account_id: "test_account".to_string(),
		side,
		price,
		amount: 1,
		rest_amt: 1,
		created_at,
	}
}

#[test]
fn test_load_manager_from_checkpoint() {
	let dir = TempDir::new().unwrap();

	// Phase 1: write a checkpoint the way a previous run would have
	let book = Book::new();
	for order in [
		create_test_order(1, Side::Bid, 100, 132424),
		create_test_order(2, Side::Bid, 102, 132425),
		create_test_order(3, Side::Bid, 103, 132428),
		create_test_order(4, Side::Bid, 101, 132429),
		create_test_order(5, Side::Bid, 103, 132430),
		create_test_order(6, Side::Ask, 100, 132424),
		create_test_order(7, Side::Ask, 102, 132425),
		create_test_order(8, Side::Ask, 101, 132429),
		create_test_order(9, Side::Ask, 103, 132428),
		create_test_order(10, Side::Ask, 103, 132438),
	] {
		book.add_order(order);
	}
	BookStore::open(dir.path())
		.unwrap()
		.save("test/sky", &book.snapshot().into())
		.unwrap();

	// Phase 2: recover
	let manager = Manager::load(dir.path()).unwrap();
	assert_eq!(manager.pairs(), vec!["test/sky".to_string()]);
	let recovered = manager.get_book("test/sky").unwrap();
	assert_eq!(recovered.snapshot(), book.snapshot());
}

#[test]
fn test_load_creates_missing_directory() {
	let dir = TempDir::new().unwrap();
	let data_dir = dir.path().join("data").join("orders");

	let manager = Manager::load(&data_dir).unwrap();
	assert!(manager.pairs().is_empty());
	assert!(data_dir.is_dir());
}

#[test]
fn test_load_rejects_corrupt_checkpoint() {
	let dir = TempDir::new().unwrap();
	fs::write(dir.path().join("btc_sky.ord"), b"[1, 2").unwrap();

	assert!(matches!(
		Manager::load(dir.path()),
		Err(ManagerError::Store(_))
	));
}

#[test]
fn test_fills_are_durable_before_settlement_sees_them() {
	let dir = TempDir::new().unwrap();
	let manager = Manager::new(dir.path()).unwrap();
	manager.add_book("btc/sky", Book::new()).unwrap();
	let (tx, rx) = bounded(10);
	manager.register_order_chan("btc/sky", tx).unwrap();

	let (closing_tx, closing) = bounded::<()>(0);
	let workers = manager.start(TICK, closing).unwrap();

	let mut bid = Order::new("alice", Side::Bid, 100, 5).with_id(1);
	bid.created_at = 10;
	let mut ask = Order::new("bob", Side::Ask, 100, 2).with_id(2);
	ask.created_at = 11;
	manager.add_order("btc/sky", bid).unwrap();
	manager.add_order("btc/sky", ask).unwrap();

	let first = rx.recv_timeout(WAIT).unwrap();
	assert_eq!(first.id, 1);
	assert_eq!(first.rest_amt, 3);

	// the checkpoint already reflects what settlement was just told
	let on_disk = manager.store().load("btc/sky").unwrap().unwrap();
	assert_eq!(on_disk.book.bids.len(), 1);
	assert_eq!(on_disk.book.bids[0].rest_amt, 3);
	assert!(on_disk.book.asks.is_empty());

	drop(closing_tx);
	workers.join().unwrap();
}

#[test]
fn test_restart_resumes_book_and_ids() {
	let dir = TempDir::new().unwrap();

	// Phase 1: first run, interrupted by a clean shutdown
	let last_id = {
		let manager = Manager::new(dir.path()).unwrap();
		manager.add_book("btc/sky", Book::new()).unwrap();
		let (tx, _rx) = bounded(10);
		manager.register_order_chan("btc/sky", tx).unwrap();

		let (closing_tx, closing) = bounded::<()>(0);
		let workers = manager.start(TICK, closing).unwrap();

		let mut last_id = 0;
		for price in [100, 101, 102] {
			last_id = manager.next_order_id("btc/sky").unwrap();
			manager
				.add_order(
					"btc/sky",
					Order::new("alice", Side::Ask, price, 1).with_id(last_id),
				)
				.unwrap();
		}

		drop(closing_tx);
		workers.join().unwrap();
		last_id
	};

	// Phase 2: restart from the same directory
	let manager = Manager::load(dir.path()).unwrap();
	let asks = manager.get_orders("btc/sky", Side::Ask, 0, 10).unwrap();
	assert_eq!(
		asks.iter().map(|o| o.price).collect::<Vec<_>>(),
		vec![100, 101, 102]
	);

	let (tx, _rx) = bounded(10);
	manager.register_order_chan("btc/sky", tx).unwrap();
	let (closing_tx, closing) = bounded::<()>(0);
	let workers = manager.start(TICK, closing).unwrap();

	assert!(manager.next_order_id("btc/sky").unwrap() > last_id);

	drop(closing_tx);
	workers.join().unwrap();
}

#[test]
fn test_ids_stay_unique_across_a_crash() {
	let dir = TempDir::new().unwrap();
	let path = dir.path().join("btc_sky.id");

	let (closing_tx, closing) = bounded::<()>(0);
	let first = IdGenerator::start("btc/sky", &path, closing).unwrap();
	let mut ids: Vec<u64> = (0..5).map(|_| first.get_id().unwrap()).collect();

	// No shutdown path runs: the process just disappears
	mem::forget(first);
	mem::forget(closing_tx);

	let (_closing_tx, closing) = bounded::<()>(0);
	let second = IdGenerator::start("btc/sky", &path, closing).unwrap();
	ids.extend((0..5).map(|_| second.get_id().unwrap()));

	assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids not strictly increasing: {:?}", ids);
}

#[test]
fn test_checkpoint_all_writes_every_pair() {
	let dir = TempDir::new().unwrap();
	let manager = Manager::new(dir.path()).unwrap();
	for pair in ["btc/sky", "sky/btc"] {
		manager.add_book(pair, Book::new()).unwrap();
	}
	manager
		.add_order("sky/btc", create_test_order(1, Side::Bid, 7, 1))
		.unwrap();

	manager.checkpoint_all().unwrap();

	let store = BookStore::open(dir.path()).unwrap();
	assert_eq!(store.load("btc/sky").unwrap(), Some(Checkpoint::default()));
	assert_eq!(store.load("sky/btc").unwrap().unwrap().book.bids.len(), 1);
}

#[test]
fn test_fills_stuck_at_shutdown_are_redelivered_after_restart() {
	let dir = TempDir::new().unwrap();

	// Phase 1: settlement stalls with one slot taken
	let (stalled_rx, touched_ids) = {
		let manager = Manager::new(dir.path()).unwrap();
		manager.add_book("btc/sky", Book::new()).unwrap();
		let (tx, rx) = bounded(1);
		manager.register_order_chan("btc/sky", tx).unwrap();

		for (id, price) in [(1, 100), (2, 102), (3, 103)] {
			manager
				.add_order("btc/sky", create_test_order(id, Side::Bid, price, id))
				.unwrap();
		}
		for (id, price) in [(4, 100), (5, 102), (6, 103)] {
			manager
				.add_order("btc/sky", create_test_order(id, Side::Ask, price, id))
				.unwrap();
		}

		let (closing_tx, closing) = bounded::<()>(0);
		let workers = manager.start(TICK, closing).unwrap();
		std::thread::sleep(TICK * 15);
		drop(closing_tx);
		workers.join().unwrap();

		let mut ids: Vec<u64> = manager
			.pending_orders("btc/sky")
			.unwrap()
			.iter()
			.map(|o| o.id)
			.collect();
		let in_channel: Vec<u64> = rx.try_iter().map(|o| o.id).collect();
		assert_eq!(in_channel.len(), 1);
		ids.extend(&in_channel);
		(in_channel, ids)
	};

	// 103/100 and 102/102 cross; bid 100 against ask 103 does not
	let mut expected = touched_ids.clone();
	expected.sort_unstable();
	assert_eq!(expected, vec![2, 3, 4, 5]);

	// Phase 2: restart, every fill not yet taken reaches settlement
	let manager = Manager::load(dir.path()).unwrap();
	assert_eq!(manager.pending_orders("btc/sky").unwrap().len(), 3);
	let (tx, rx) = bounded(10);
	manager.register_order_chan("btc/sky", tx).unwrap();
	let (closing_tx, closing) = bounded::<()>(0);
	let workers = manager.start(TICK, closing).unwrap();

	let mut received: Vec<u64> = (0..3).map(|_| rx.recv_timeout(WAIT).unwrap().id).collect();
	received.extend(&stalled_rx);
	received.sort_unstable();
	assert_eq!(received, expected);

	drop(closing_tx);
	workers.join().unwrap();
	assert!(manager.pending_orders("btc/sky").unwrap().is_empty());
	assert!(manager.store().load("btc/sky").unwrap().unwrap().pending.is_empty());

	let book = manager.get_book("btc/sky").unwrap();
	assert_eq!((book.len_bids(), book.len_asks()), (1, 1));
}

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

use std::sync::{
	Mutex, MutexGuard,
	atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};

use crate::types::{Order, Side, ask_priority, bid_priority, priority};

/// Plain, serializable view of a book: both sides in priority order.
///
/// This is the on-disk checkpoint format (`{"bids": [...], "asks": [...]}`)
/// and the value handed out for read-only order book queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookSnapshot {
	pub bids: Vec<Order>,
	pub asks: Vec<Order>,
}

/// Order book for a single coin pair
///
/// Bids and asks live in two independent collections, each behind its own
/// lock, so an insert on one side never waits for a reader of the other.
/// Inserts only append; ordering is established by `match_orders`, which
/// holds both locks for the whole pass.
///
/// Lock order is always bids, then asks.
#[derive(Debug, Default)]
pub struct Book {
	bids: Mutex<Vec<Order>>,
	asks: Mutex<Vec<Order>>,
	/// Bumped on every insert and on every pass that filled something
	revision: AtomicU64,
}

impl Book {
	pub fn new() -> Self {
		Self::default()
	}

	/// Rebuild a book from a checkpoint
	pub fn from_snapshot(snapshot: BookSnapshot) -> Self {
		Self {
			bids: Mutex::new(snapshot.bids),
			asks: Mutex::new(snapshot.asks),
			revision: AtomicU64::new(0),
		}
	}

	pub fn add_bid(&self, bid: Order) {
		lock(&self.bids, Side::Bid).push(bid);
		self.revision.fetch_add(1, Ordering::Release);
	}

	pub fn add_ask(&self, ask: Order) {
		lock(&self.asks, Side::Ask).push(ask);
		self.revision.fetch_add(1, Ordering::Release);
	}

	/// Append the order to the side it belongs to
	pub fn add_order(&self, order: Order) {
		match order.side {
			Side::Bid => self.add_bid(order),
			Side::Ask => self.add_ask(order),
		}
	}

	/// Deep copy of the book, independent of the live one.
	///
	/// Each side is copied under its own lock (bids first), so the copy
	/// never blocks matching for longer than one `Vec` clone.
	pub fn copy(&self) -> Book {
		let bids = lock(&self.bids, Side::Bid).clone();
		let asks = lock(&self.asks, Side::Ask).clone();
		Book {
			bids: Mutex::new(bids),
			asks: Mutex::new(asks),
			revision: AtomicU64::new(self.revision()),
		}
	}

	/// Copy both sides, sorted by price/time priority
	pub fn snapshot(&self) -> BookSnapshot {
		let mut bids = lock(&self.bids, Side::Bid).clone();
		let mut asks = lock(&self.asks, Side::Ask).clone();
		bids.sort_by(bid_priority);
		asks.sort_by(ask_priority);
		BookSnapshot { bids, asks }
	}

	/// Orders of one side in priority order, restricted to `[start, end)`.
	///
	/// Out-of-range bounds are clamped, so paging past the end yields an
	/// empty list rather than an error.
	pub fn orders(&self, side: Side, start: usize, end: usize) -> Vec<Order> {
		let mut orders = match side {
			Side::Bid => lock(&self.bids, side).clone(),
			Side::Ask => lock(&self.asks, side).clone(),
		};
		orders.sort_by(priority(side));

		let end = end.min(orders.len());
		let start = start.min(end);
		orders.drain(start..end).collect()
	}

	/// Highest resting bid price
	pub fn best_bid(&self) -> Option<u64> {
		lock(&self.bids, Side::Bid).iter().map(|o| o.price).max()
	}

	/// Lowest resting ask price
	pub fn best_ask(&self) -> Option<u64> {
		lock(&self.asks, Side::Ask).iter().map(|o| o.price).min()
	}

	pub fn len_bids(&self) -> usize {
		lock(&self.bids, Side::Bid).len()
	}

	pub fn len_asks(&self) -> usize {
		lock(&self.asks, Side::Ask).len()
	}

	pub fn is_empty(&self) -> bool {
		self.len_bids() == 0 && self.len_asks() == 0
	}

	pub fn revision(&self) -> u64 {
		self.revision.load(Ordering::Acquire)
	}

	/// Cross every matchable bid and ask, in price/time priority.
	///
	/// Both sides are sorted (bids by descending price, asks by ascending
	/// price, earlier orders first at the same price), then the best bid
	/// and best ask are filled against each other by
	/// `min(bid.rest_amt, ask.rest_amt)` for as long as the bid price is at
	/// least the ask price. Fully filled orders leave the book.
	///
	/// Returns each order touched in this pass exactly once, in the order it
	/// was first filled, carrying its state at the end of the pass. When the
	/// call returns the book is crossing-free.
	///
	/// # Panics
	///
	/// Panics if a resting order is on the wrong side of the book or has a
	/// `rest_amt` outside `1..=amount`. Such an order can only come from a
	/// bug upstream, and matching on it would corrupt balances.
	pub fn match_orders(&self) -> Vec<Order> {
		let mut bids = lock(&self.bids, Side::Bid);
		let mut asks = lock(&self.asks, Side::Ask);

		bids.sort_by(bid_priority);
		asks.sort_by(ask_priority);

		let mut touched = Vec::new();
		let mut last_bid = None;
		let mut last_ask = None;
		let (mut bi, mut ai) = (0, 0);

		while bi < bids.len() && ai < asks.len() {
			let bid = &mut bids[bi];
			let ask = &mut asks[ai];
			if bid.price < ask.price {
				break;
			}
			assert_resting(bid, Side::Bid);
			assert_resting(ask, Side::Ask);

			let fill = bid.rest_amt.min(ask.rest_amt);
			bid.rest_amt -= fill;
			ask.rest_amt -= fill;

			if last_bid != Some(bi) {
				touched.push((Side::Bid, bi));
				last_bid = Some(bi);
			}
			if last_ask != Some(ai) {
				touched.push((Side::Ask, ai));
				last_ask = Some(ai);
			}

			if bid.rest_amt == 0 {
				bi += 1;
			}
			if ask.rest_amt == 0 {
				ai += 1;
			}
		}

		let matched: Vec<Order> = touched
			.into_iter()
			.map(|(side, idx)| match side {
				Side::Bid => bids[idx].clone(),
				Side::Ask => asks[idx].clone(),
			})
			.collect();

		// Fills always consume each side from the front, so the fully
		// filled orders form a prefix.
		bids.drain(..bi);
		asks.drain(..ai);

		if !matched.is_empty() {
			self.revision.fetch_add(1, Ordering::Release);
		}
		matched
	}
}

impl Clone for Book {
	fn clone(&self) -> Self {
		self.copy()
	}
}

impl From<BookSnapshot> for Book {
	fn from(snapshot: BookSnapshot) -> Self {
		Self::from_snapshot(snapshot)
	}
}

fn lock(side: &Mutex<Vec<Order>>, which: Side) -> MutexGuard<'_, Vec<Order>> {
	// A poisoned side means a matching pass panicked halfway through; the
	// orders can no longer be trusted.
	side.lock()
		.unwrap_or_else(|_| panic!("{} side of the book is poisoned", which))
}

fn assert_resting(order: &Order, side: Side) {
	assert_eq!(
		order.side, side,
		"order {} sits on the {} side but is a {} order",
		order.id, side, order.side
	);
	assert!(
		order.rest_amt > 0 && order.rest_amt <= order.amount,
		"order {} has rest_amt {} outside 1..={}",
		order.id,
		order.rest_amt,
		order.amount
	);
}

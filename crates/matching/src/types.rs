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

use std::{cmp::Ordering, fmt, str::FromStr, time::SystemTime};

use crossbeam::channel::{Receiver, TryRecvError};
use serde::{Deserialize, Serialize};

/// Order side (bid or ask)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
	Bid,
	Ask,
}

impl Side {
	pub fn as_str(&self) -> &'static str {
		match self {
			Side::Bid => "bid",
			Side::Ask => "ask",
		}
	}
}

impl fmt::Display for Side {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, thiserror::Error)]
#[error("unknown order side: {0}")]
pub struct ParseSideError(String);

impl FromStr for Side {
	type Err = ParseSideError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"bid" => Ok(Side::Bid),
			"ask" => Ok(Side::Ask),
			_ => Err(ParseSideError(s.to_string())),
		}
	}
}

/// A resting order in one coin pair's book.
///
/// Everything except `rest_amt` is fixed once the order enters a book.
/// `rest_amt` only ever decreases, and an order whose `rest_amt` reaches
/// zero is removed from the book by the matching pass that filled it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
	/// Per-pair monotonic identifier, allocated before the order is booked
	pub id: u64,
	/// Owner of the order (hex-encoded account key)
	pub account_id: String,
	pub side: Side,
	/// Integer unit price
	pub price: u64,
	/// Originally requested quantity
	pub amount: u64,
	/// Quantity still waiting to be filled
	pub rest_amt: u64,
	/// Unix timestamp (seconds), only used to break ties at equal price
	pub created_at: u64,
}

impl Order {
	/// Build a fresh, unfilled order stamped with the current time.
	///
	/// The id is left at zero; the caller assigns the one allocated by
	/// the pair's id generator.
	pub fn new(account_id: impl Into<String>, side: Side, price: u64, amount: u64) -> Self {
		Self {
			id: 0,
			account_id: account_id.into(),
			side,
			price,
			amount,
			rest_amt: amount,
			created_at: unix_now(),
		}
	}

	pub fn with_id(mut self, id: u64) -> Self {
		self.id = id;
		self
	}

	/// Quantity filled so far
	pub fn filled(&self) -> u64 {
		self.amount.saturating_sub(self.rest_amt)
	}

	pub fn is_filled(&self) -> bool {
		self.rest_amt == 0
	}
}

/// Bid priority: highest price first, then earliest creation, then lowest id.
pub fn bid_priority(a: &Order, b: &Order) -> Ordering {
	b.price
		.cmp(&a.price)
		.then_with(|| a.created_at.cmp(&b.created_at))
		.then_with(|| a.id.cmp(&b.id))
}

/// Ask priority: lowest price first, then earliest creation, then lowest id.
pub fn ask_priority(a: &Order, b: &Order) -> Ordering {
	a.price
		.cmp(&b.price)
		.then_with(|| a.created_at.cmp(&b.created_at))
		.then_with(|| a.id.cmp(&b.id))
}

/// Priority comparator for the given side of the book
pub fn priority(side: Side) -> fn(&Order, &Order) -> Ordering {
	match side {
		Side::Bid => bid_priority,
		Side::Ask => ask_priority,
	}
}

pub(crate) fn unix_now() -> u64 {
	SystemTime::now()
		.duration_since(SystemTime::UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or_default()
}

/// Whether a `closing` signal has fired.
///
/// Closing is signalled by dropping every sender; a message sent on the
/// channel counts too, but only wakes one receiver.
pub(crate) fn is_closed(closing: &Receiver<()>) -> bool {
	!matches!(closing.try_recv(), Err(TryRecvError::Empty))
}

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

//! Matching engine service entry point
//!
//! This binary wires up:
//! - Book recovery from the data directory
//! - One settlement consumer per coin pair
//! - The matching manager (matching workers and id generators)

use std::{
	sync::Arc,
	thread::{self, JoinHandle},
};

use anyhow::{Context, Result};
use crossbeam::channel::{Receiver, bounded, select};
use tokio::signal;
use tracing::{error, info, warn};

use skyex_matching::{Book, Manager, Order, config::MatchingConfig, logging};

#[tokio::main]
async fn main() -> Result<()> {
	logging::init_logging()?;

	let config = MatchingConfig::from_env().unwrap_or_else(|e| {
		warn!(target: "server", error = %e, "Using default configuration");
		MatchingConfig::default()
	});

	info!(target: "server", "Starting Skyex Matching Engine");
	info!(target: "server", "Data directory: {}", config.data_dir.display());
	info!(target: "server", "Match tick: {}ms", config.match_tick_ms);

	// Phase 1: Recover books
	let manager = Arc::new(
		Manager::load(&config.data_dir)
			.with_context(|| format!("Failed to load books from {}", config.data_dir.display()))?,
	);
	for pair in &config.pairs {
		if !manager.has_book(pair) {
			manager
				.add_book(pair, Book::new())
				.with_context(|| format!("Failed to register coin pair {}", pair))?;
			info!(target: "server", pair = %pair, "Registered empty book");
		}
	}

	// Phase 2: Settlement channels and consumers
	let (closing_tx, closing) = bounded::<()>(0);
	let mut consumers = Vec::new();
	for pair in manager.pairs() {
		let (tx, rx) = bounded(config.order_chan_capacity);
		manager.register_order_chan(&pair, tx)?;
		consumers.push(spawn_settlement_logger(pair, rx, closing.clone())?);
	}

	// Phase 3: Matching workers and id generators
	let workers = manager
		.start(config.match_tick(), closing)
		.context("Failed to start matching manager")?;
	info!(target: "server", pairs = ?manager.pairs(), "Matching engine running");

	signal::ctrl_c()
		.await
		.context("Failed to listen for shutdown signal")?;
	info!(target: "server", "Shutting down...");

	drop(closing_tx);
	tokio::task::spawn_blocking(move || workers.join())
		.await
		.context("Matching workers join task failed")??;
	join_settlement_consumers(consumers);

	manager.checkpoint_all().context("Final checkpoint failed")?;
	info!(target: "server", "Shutdown complete");
	Ok(())
}

/// Join every consumer, logging the ones that panicked. Returns how many
/// did.
fn join_settlement_consumers(consumers: Vec<JoinHandle<()>>) -> usize {
	let mut panicked = 0;
	for consumer in consumers {
		let name = consumer.thread().name().unwrap_or("settle").to_string();
		if consumer.join().is_err() {
			error!(target: "server", thread = %name, "Settlement consumer panicked");
			panicked += 1;
		}
	}
	panicked
}

/// Stand-in for the settlement service: logs every fill it receives
fn spawn_settlement_logger(
	pair: String,
	orders: Receiver<Order>,
	closing: Receiver<()>,
) -> Result<JoinHandle<()>> {
	thread::Builder::new()
		.name(format!("settle-{}", pair))
		.spawn(move || {
			let log = |order: Order| {
				info!(
					target: "settlement",
					pair = %pair,
					id = order.id,
					account = %order.account_id,
					side = %order.side,
					price = order.price,
					filled = order.filled(),
					rest = order.rest_amt,
					"Order matched"
				);
			};

			loop {
				select! {
					recv(orders) -> msg => match msg {
						Ok(order) => log(order),
						Err(_) => return,
					},
					recv(closing) -> _ => break,
				}
			}
			orders.try_iter().for_each(log);
		})
		.context("Failed to spawn settlement consumer")
}

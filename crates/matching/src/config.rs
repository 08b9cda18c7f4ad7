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

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

// Logging configuration constants
/// Default log level (can be overridden by RUST_LOG environment variable)
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default log directory component name
pub const LOG_COMPONENT_NAME: &str = "matching";

/// Default console output enabled (can be overridden by LOG_TO_CONSOLE environment variable)
pub const DEFAULT_LOG_TO_CONSOLE: bool = false;

// Matching configuration constants
/// Default directory of book checkpoints and id counters (MATCHING_DATA_DIR)
pub const DEFAULT_DATA_DIR: &str = "data/orders";

/// Default interval between two matching passes, in milliseconds (MATCHING_MATCH_TICK_MS)
pub const DEFAULT_MATCH_TICK_MS: u64 = 1_000;

/// Default capacity of each pair's settlement channel (MATCHING_ORDER_CHAN_CAPACITY)
pub const DEFAULT_ORDER_CHAN_CAPACITY: usize = 1_024;

/// Environment variable prefix
const ENV_PREFIX: &str = "MATCHING";

/// Matching engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
	/// Directory holding `*.ord` book checkpoints and `*.id` counters
	pub data_dir: PathBuf,
	/// Milliseconds between matching passes
	pub match_tick_ms: u64,
	/// Capacity of each pair's settlement channel
	pub order_chan_capacity: usize,
	/// Coin pairs to serve even when no checkpoint exists yet
	pub pairs: Vec<String>,
}

impl Default for MatchingConfig {
	fn default() -> Self {
		Self {
			data_dir: PathBuf::from(DEFAULT_DATA_DIR),
			match_tick_ms: DEFAULT_MATCH_TICK_MS,
			order_chan_capacity: DEFAULT_ORDER_CHAN_CAPACITY,
			pairs: vec!["btc/sky".to_string()],
		}
	}
}

impl MatchingConfig {
	/// Load configuration from environment variables
	///
	/// `MATCHING_PAIRS` is a comma separated list, e.g. `btc/sky,sky/btc`.
	pub fn from_env() -> Result<Self, config::ConfigError> {
		let cfg = config::Config::builder()
			.add_source(environment())
			.build()?;

		cfg.try_deserialize()
	}

	/// Load configuration from file, with environment variables on top
	pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
		let cfg = config::Config::builder()
			.add_source(config::File::with_name(path))
			.add_source(environment())
			.build()?;

		cfg.try_deserialize()
	}

	pub fn match_tick(&self) -> Duration {
		Duration::from_millis(self.match_tick_ms)
	}
}

fn environment() -> config::Environment {
	config::Environment::with_prefix(ENV_PREFIX)
		.try_parsing(true)
		.list_separator(",")
		.with_list_parse_key("pairs")
}

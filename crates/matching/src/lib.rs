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

//! Skyex Matching Engine
//!
//! Periodic price/time priority matching of limit orders, one independent
//! book per coin pair.
//!
//! Architecture:
//! - `Manager` registers books, accepts orders and runs one matching worker
//!   per pair on a fixed tick
//! - Every order touched by a matching pass is sent, with its new
//!   `rest_amt`, to the pair's settlement channel
//! - Books are checkpointed as JSON files and reloaded on start
//! - `IdGenerator` hands out per-pair order ids that stay unique across
//!   crashes

pub mod config;
pub mod idgen;
pub mod logging;
pub mod manager;
pub mod orderbook;
pub mod store;
pub mod types;

pub use idgen::{IdError, IdGenerator};
pub use manager::{Manager, ManagerError, MatchingWorkers};
pub use orderbook::{Book, BookSnapshot};
pub use store::{BookStore, Checkpoint, StoreError};
pub use types::*;

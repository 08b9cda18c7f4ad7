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

//! Logging initialization for the matching service
//!
//! # Configuration
//!
//! - `RUST_LOG`: Log level filter (default: `info`)
//!   - Per target: `RUST_LOG=info,matching=debug,idgen=warn`
//!
//! - `LOG_DIR`: Root directory for log files (default: `{project_root}/logs`)
//!   - Log files are created in `{LOG_DIR}/matching/`
//!
//! - `LOG_TO_CONSOLE`: Also write to stderr (default: `false`)
//!   - `true`, `1` or `yes` enable it
//!
//! # Log File Format
//!
//! - Rotation: one file per day (UTC), `matching.{date}.log`
//! - Format: UTC timestamp, thread name, log level, target, message, fields
//! - ANSI colors only on the console

use std::{
	env,
	path::{Path, PathBuf},
	sync::OnceLock,
};

use anyhow::{Context, Result};
use tracing::info;
use tracing_appender::{
	non_blocking,
	rolling::{self, Rotation},
};
use tracing_subscriber::{
	EnvFilter, fmt, layer::SubscriberExt, registry::Registry, util::SubscriberInitExt,
};

use crate::config::{DEFAULT_LOG_LEVEL, DEFAULT_LOG_TO_CONSOLE, LOG_COMPONENT_NAME};

// Flushes buffered lines on exit
static LOG_GUARD: OnceLock<non_blocking::WorkerGuard> = OnceLock::new();

/// Walk up from the working directory to the workspace root
fn find_project_root() -> PathBuf {
	if let Ok(mut current) = env::current_dir() {
		loop {
			let cargo_toml = current.join("Cargo.toml");
			if let Ok(content) = std::fs::read_to_string(&cargo_toml)
				&& content.contains("[workspace]")
			{
				return current;
			}
			if !current.pop() {
				break;
			}
		}
	}

	env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn log_root() -> PathBuf {
	env::var("LOG_DIR")
		.map(PathBuf::from)
		.unwrap_or_else(|_| find_project_root().join("logs"))
}

fn log_to_console() -> bool {
	env::var("LOG_TO_CONSOLE")
		.map(|v| v == "true" || v == "1" || v == "yes")
		.unwrap_or(DEFAULT_LOG_TO_CONSOLE)
}

fn setup_file_logging(log_dir: &Path) -> Result<non_blocking::NonBlocking> {
	let file_appender = rolling::RollingFileAppender::builder()
		.rotation(Rotation::DAILY)
		.filename_prefix(LOG_COMPONENT_NAME)
		.filename_suffix("log")
		.build(log_dir)
		.with_context(|| {
			format!(
				"Failed to create rolling file appender in {}",
				log_dir.display()
			)
		})?;

	let (file_writer, guard) = non_blocking(file_appender);
	LOG_GUARD.set(guard).ok();

	Ok(file_writer)
}

/// Initialize logging with file output and optional console output
///
/// See the module documentation for the environment variables. Fails if
/// the log directory cannot be created or a global subscriber is already
/// installed.
pub fn init_logging() -> Result<()> {
	dotenv::dotenv().ok();

	let log_level = env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string());

	let log_dir = log_root().join(LOG_COMPONENT_NAME);
	std::fs::create_dir_all(&log_dir)
		.with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;

	let file_writer = setup_file_logging(&log_dir)?;
	let console = log_to_console();

	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));

	let file_layer = fmt::layer()
		.with_writer(file_writer)
		.with_timer(fmt::time::UtcTime::rfc_3339())
		.with_thread_names(true)
		.with_target(true)
		.with_ansi(false);

	let console_layer = console.then(|| {
		fmt::layer()
			.with_writer(std::io::stderr)
			.with_timer(fmt::time::UtcTime::rfc_3339())
			.with_thread_names(true)
			.with_target(true)
			.with_ansi(true)
	});

	Registry::default()
		.with(filter)
		.with(file_layer)
		.with(console_layer)
		.try_init()
		.context("Failed to install tracing subscriber")?;

	info!(target: "server", "Log level: {}", log_level);
	info!(target: "server", "Log directory: {}", log_dir.display());
	info!(
		target: "server",
		"Log file base name: {}.YYYY-MM-DD.log (daily rolling)",
		LOG_COMPONENT_NAME
	);
	if console {
		info!(target: "server", "Console output: enabled");
	}

	Ok(())
}

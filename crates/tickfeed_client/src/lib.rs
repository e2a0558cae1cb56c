#![forbid(unsafe_code)]

pub mod client;
pub mod config;
pub mod connection;
pub mod decoder;
pub mod dedup;
pub mod heartbeat;
pub mod pump;
pub mod queue;
pub mod relay;
pub mod resolver;
pub mod retry;
pub mod socket;

use std::fmt;

use tickfeed_domain::DonationEvent;
use tracing::{debug, error, info, warn};

pub use client::IngestClient;
pub use config::ClientConfig;
pub use connection::Phase;
pub use resolver::{AccessTokens, ChannelResolver, HttpResolver, HttpResolverConfig, ResolveError};
pub use socket::{BoxFuture, WsConnector, WsStream};

/// A token or credential that never shows up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
	Debug,
	Info,
	Warn,
	Error,
}

/// A log line produced off the consumer thread, replayed on the next tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
	pub level: LogLevel,
	pub message: String,
}

impl LogLine {
	/// Emit through `tracing` at the line's level.
	pub fn emit(&self) {
		match self.level {
			LogLevel::Debug => debug!(relayed = true, "{}", self.message),
			LogLevel::Info => info!(relayed = true, "{}", self.message),
			LogLevel::Warn => warn!(relayed = true, "{}", self.message),
			LogLevel::Error => error!(relayed = true, "{}", self.message),
		}
	}
}

/// Host-side consumer of drained events.
///
/// Every method is invoked on the thread that calls [`IngestClient::tick`]. A panic
/// inside a callback is caught and logged; the pump keeps going.
pub trait DownstreamSink: Send {
	/// One non-duplicate event (donation or chat pseudo-donation).
	fn on_donation_event(&mut self, event: DonationEvent);

	/// Human-readable connection status changed.
	fn on_status(&mut self, _status: &str) {}

	/// A relayed background log line.
	fn on_log(&mut self, line: &LogLine) {
		line.emit();
	}
}

/// Point-in-time counters for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStats {
	pub phase: Phase,
	pub chat_dropped: u64,
	pub donation_dropped: u64,
	pub decode_errors: u64,
	pub nested_decode_errors: u64,
	pub dedup_suppressed: u64,
	pub forwarded: u64,
	pub sink_panics: u64,
	pub fast_retry_attempts: u32,
	pub log_lines_dropped: u64,
}

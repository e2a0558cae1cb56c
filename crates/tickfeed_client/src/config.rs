#![forbid(unsafe_code)]

use std::time::Duration;

use tickfeed_protocol::{DEFAULT_MAX_FRAME_SIZE, WireProfile};

use crate::socket::WsConnector;

pub const DEFAULT_WS_URL: &str = "wss://kr-ss{shard}.chat.naver.com/chat";
const SHARD_PLACEHOLDER: &str = "{shard}";
const SHARD_COUNT: u32 = 9;

/// Ingestion client configuration.
#[derive(Clone)]
pub struct ClientConfig {
	/// Chat server url. `{shard}` is replaced with the shard for the chat channel.
	pub ws_url: String,
	pub wire: WireProfile,

	pub fast_retry_max_attempts: u32,
	pub fast_retry_delay: Duration,
	pub slow_retry_interval: Duration,
	pub channel_watch_interval: Duration,
	pub heartbeat_interval: Duration,

	pub queue_capacity: usize,
	pub drop_log_every: u64,
	pub parse_error_log_every: u64,
	pub dedup_ttl: Duration,
	pub dedup_cleanup_threshold: usize,
	/// Max events forwarded per tick across both queues.
	pub tick_budget: usize,
	pub log_relay_capacity: usize,
	pub max_frame_bytes: usize,

	/// Override websocket connect (tests).
	pub ws_connector: Option<WsConnector>,
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			ws_url: DEFAULT_WS_URL.to_string(),
			wire: WireProfile::default(),
			fast_retry_max_attempts: 3,
			fast_retry_delay: Duration::from_secs(5),
			slow_retry_interval: Duration::from_secs(30),
			channel_watch_interval: Duration::from_secs(30),
			heartbeat_interval: Duration::from_secs(15),
			queue_capacity: 1000,
			drop_log_every: 100,
			parse_error_log_every: 100,
			dedup_ttl: Duration::from_millis(1000),
			dedup_cleanup_threshold: 512,
			tick_budget: 10,
			log_relay_capacity: 4096,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			ws_connector: None,
		}
	}
}

impl ClientConfig {
	/// Chat server url for `chat_channel_id`.
	pub fn ws_url_for(&self, chat_channel_id: &str) -> String {
		if !self.ws_url.contains(SHARD_PLACEHOLDER) {
			return self.ws_url.clone();
		}
		self.ws_url
			.replace(SHARD_PLACEHOLDER, &chat_shard(chat_channel_id).to_string())
	}
}

/// Server shard (1..=9) the platform assigns to a chat channel.
pub fn chat_shard(chat_channel_id: &str) -> u32 {
	let sum: u32 = chat_channel_id.bytes().map(u32::from).fold(0, u32::wrapping_add);
	sum % SHARD_COUNT + 1
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults() {
		let cfg = ClientConfig::default();
		assert_eq!(cfg.fast_retry_max_attempts, 3);
		assert_eq!(cfg.fast_retry_delay, Duration::from_secs(5));
		assert_eq!(cfg.slow_retry_interval, Duration::from_secs(30));
		assert_eq!(cfg.tick_budget, 10);
		assert_eq!(cfg.queue_capacity, 1000);
		assert_eq!(cfg.dedup_ttl, Duration::from_millis(1000));
	}

	#[test]
	fn shard_substitution() {
		let cfg = ClientConfig::default();
		// "ab" = 97 + 98 = 195; 195 % 9 + 1 = 7
		assert_eq!(chat_shard("ab"), 7);
		assert_eq!(cfg.ws_url_for("ab"), "wss://kr-ss7.chat.naver.com/chat");

		let plain = ClientConfig {
			ws_url: "ws://127.0.0.1:9/chat".to_string(),
			..ClientConfig::default()
		};
		assert_eq!(plain.ws_url_for("ab"), "ws://127.0.0.1:9/chat");
	}
}

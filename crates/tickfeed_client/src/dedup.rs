#![forbid(unsafe_code)]

use std::collections::HashMap;

/// Sliding-window set of recently seen dedupe keys.
///
/// Only the consumer thread touches it. Cleanup is amortized: once the table grows
/// past `cleanup_threshold`, one pass evicts every expired entry.
#[derive(Debug)]
pub struct DedupFilter {
	ttl_ms: i64,
	cleanup_threshold: usize,
	seen: HashMap<String, i64>,
}

impl DedupFilter {
	pub fn new(ttl_ms: i64, cleanup_threshold: usize) -> Self {
		Self {
			ttl_ms,
			cleanup_threshold,
			seen: HashMap::new(),
		}
	}

	/// True if `key` was recorded within the TTL; the entry is then left untouched.
	/// Otherwise records `now_ms` for `key` and returns false.
	pub fn is_duplicate(&mut self, key: &str, now_ms: i64) -> bool {
		if let Some(&seen_at) = self.seen.get(key)
			&& now_ms - seen_at <= self.ttl_ms
		{
			return true;
		}
		self.seen.insert(key.to_string(), now_ms);
		false
	}

	/// Evict expired entries if the table is over the threshold. Returns the number evicted.
	pub fn cleanup(&mut self, now_ms: i64) -> usize {
		if self.seen.len() <= self.cleanup_threshold {
			return 0;
		}
		let before = self.seen.len();
		let ttl = self.ttl_ms;
		self.seen.retain(|_, seen_at| now_ms - *seen_at <= ttl);
		before - self.seen.len()
	}

	pub fn len(&self) -> usize {
		self.seen.len()
	}

	pub fn is_empty(&self) -> bool {
		self.seen.is_empty()
	}
}

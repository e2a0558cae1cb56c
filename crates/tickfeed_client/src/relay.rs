#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::{LogLevel, LogLine};

/// Bounded buffer of log lines written by socket and timer tasks.
///
/// The consumer drains it once per tick so every line reaches the host's logger on
/// the host's own thread. When full, the incoming line is dropped and counted.
pub struct LogRelay {
	lines: Mutex<VecDeque<LogLine>>,
	capacity: usize,
	dropped: AtomicU64,
}

impl LogRelay {
	pub fn new(capacity: usize) -> Self {
		Self {
			lines: Mutex::new(VecDeque::new()),
			capacity: capacity.max(1),
			dropped: AtomicU64::new(0),
		}
	}

	pub fn push(&self, level: LogLevel, message: impl Into<String>) {
		let mut lines = self.lines.lock();
		if lines.len() >= self.capacity {
			self.dropped.fetch_add(1, Ordering::Relaxed);
			return;
		}
		lines.push_back(LogLine {
			level,
			message: message.into(),
		});
	}

	pub fn debug(&self, message: impl Into<String>) {
		self.push(LogLevel::Debug, message);
	}

	pub fn info(&self, message: impl Into<String>) {
		self.push(LogLevel::Info, message);
	}

	pub fn warn(&self, message: impl Into<String>) {
		self.push(LogLevel::Warn, message);
	}

	/// Take every buffered line, oldest first.
	pub fn drain(&self) -> VecDeque<LogLine> {
		std::mem::take(&mut *self.lines.lock())
	}

	pub fn len(&self) -> usize {
		self.lines.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn dropped(&self) -> u64 {
		self.dropped.load(Ordering::Relaxed)
	}
}

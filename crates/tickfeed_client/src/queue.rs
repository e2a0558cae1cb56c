#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::relay::LogRelay;

struct QueueShared {
	name: &'static str,
	dropped: AtomicU64,
	log_every: u64,
	relay: Arc<LogRelay>,
}

/// Producer half of a bounded ingress queue. Never blocks.
pub struct IngressSender<T> {
	tx: mpsc::Sender<T>,
	shared: Arc<QueueShared>,
}

impl<T> Clone for IngressSender<T> {
	fn clone(&self) -> Self {
		Self {
			tx: self.tx.clone(),
			shared: self.shared.clone(),
		}
	}
}

/// Consumer half, owned by the tick pump.
pub struct IngressReceiver<T> {
	rx: mpsc::Receiver<T>,
	shared: Arc<QueueShared>,
}

/// Create a bounded queue named `name` (used in logs and the drop metric label).
pub fn ingress_queue<T>(
	name: &'static str,
	capacity: usize,
	log_every: u64,
	relay: Arc<LogRelay>,
) -> (IngressSender<T>, IngressReceiver<T>) {
	let (tx, rx) = mpsc::channel(capacity.max(1));
	let shared = Arc::new(QueueShared {
		name,
		dropped: AtomicU64::new(0),
		log_every: log_every.max(1),
		relay,
	});
	(
		IngressSender {
			tx,
			shared: shared.clone(),
		},
		IngressReceiver { rx, shared },
	)
}

impl<T> IngressSender<T> {
	/// Enqueue without waiting. When the queue is full the incoming item is dropped.
	pub fn push(&self, item: T) -> bool {
		match self.tx.try_send(item) {
			Ok(()) => true,
			Err(TrySendError::Full(_)) => {
				let n = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
				metrics::counter!("tickfeed_queue_dropped_total", "queue" => self.shared.name).increment(1);
				if n == 1 || n % self.shared.log_every == 0 {
					self.shared
						.relay
						.warn(format!("{} queue full; dropped incoming event (total_dropped={n})", self.shared.name));
				}
				false
			}
			Err(TrySendError::Closed(_)) => false,
		}
	}

	pub fn dropped(&self) -> u64 {
		self.shared.dropped.load(Ordering::Relaxed)
	}
}

impl<T> IngressReceiver<T> {
	pub fn try_pop(&mut self) -> Option<T> {
		self.rx.try_recv().ok()
	}

	pub fn len(&self) -> usize {
		self.rx.len()
	}

	pub fn is_empty(&self) -> bool {
		self.rx.is_empty()
	}

	pub fn dropped(&self) -> u64 {
		self.shared.dropped.load(Ordering::Relaxed)
	}

	pub fn name(&self) -> &'static str {
		self.shared.name
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn queue(capacity: usize, log_every: u64) -> (IngressSender<u32>, IngressReceiver<u32>, Arc<LogRelay>) {
		let relay = Arc::new(LogRelay::new(64));
		let (tx, rx) = ingress_queue("test", capacity, log_every, relay.clone());
		(tx, rx, relay)
	}

	#[test]
	fn overflow_drops_newest_and_counts_exactly() {
		let (tx, mut rx, _relay) = queue(1000, 100);
		for i in 0..1005 {
			tx.push(i);
		}

		assert_eq!(rx.len(), 1000);
		assert_eq!(rx.dropped(), 5);
		assert_eq!(tx.dropped(), 5);

		assert_eq!(rx.try_pop(), Some(0));
		let mut last = 0;
		while let Some(v) = rx.try_pop() {
			last = v;
		}
		assert_eq!(last, 999, "the oldest items survive overflow");
	}

	#[test]
	fn drop_logging_is_rate_limited() {
		let (tx, _rx, relay) = queue(1, 3);
		tx.push(0);
		for i in 0..7 {
			tx.push(i);
		}
		// drops #1, #3 and #6 are logged
		assert_eq!(relay.len(), 3);
	}

	#[test]
	fn producers_on_other_threads() {
		let (tx, mut rx, _relay) = queue(50, 100);
		let handles: Vec<_> = (0..4)
			.map(|_| {
				let tx = tx.clone();
				std::thread::spawn(move || {
					for i in 0..25 {
						tx.push(i);
					}
				})
			})
			.collect();
		for h in handles {
			h.join().expect("producer thread");
		}

		let mut n = 0;
		while rx.try_pop().is_some() {
			n += 1;
		}
		assert_eq!(n + rx.dropped() as usize, 100);
		assert_eq!(n, 50);
	}
}

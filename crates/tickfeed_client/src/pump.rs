#![forbid(unsafe_code)]

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tickfeed_domain::{ChatEvent, DonationEvent};
use tracing::warn;

use crate::DownstreamSink;
use crate::dedup::DedupFilter;
use crate::queue::IngressReceiver;

/// Outcome of one drain pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
	pub dequeued: usize,
	pub forwarded: usize,
	pub duplicates: usize,
	pub sink_panics: usize,
}

/// Per-tick event drain: donations first, then chat, under one shared budget.
pub struct TickPump {
	chat_rx: IngressReceiver<ChatEvent>,
	donation_rx: IngressReceiver<DonationEvent>,
	dedup: DedupFilter,
	budget: usize,
	forwarded_total: u64,
	suppressed_total: u64,
	sink_panics_total: u64,
}

#[derive(Clone, Copy)]
enum Kind {
	Donation,
	Chat,
}

impl Kind {
	fn label(self) -> &'static str {
		match self {
			Kind::Donation => "donation",
			Kind::Chat => "chat",
		}
	}
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
	if let Some(s) = payload.downcast_ref::<&'static str>() {
		s
	} else if let Some(s) = payload.downcast_ref::<String>() {
		s.as_str()
	} else {
		"<non-string panic>"
	}
}

impl TickPump {
	pub fn new(
		chat_rx: IngressReceiver<ChatEvent>,
		donation_rx: IngressReceiver<DonationEvent>,
		dedup: DedupFilter,
		budget: usize,
	) -> Self {
		Self {
			chat_rx,
			donation_rx,
			dedup,
			budget,
			forwarded_total: 0,
			suppressed_total: 0,
			sink_panics_total: 0,
		}
	}

	/// Forward at most `budget` events to `sink`. Chat events go out as pseudo-donations.
	pub fn drain(&mut self, now_ms: i64, sink: &mut dyn DownstreamSink) -> DrainReport {
		let mut report = DrainReport::default();
		let mut budget = self.budget;

		while budget > 0 {
			let Some(ev) = self.donation_rx.try_pop() else {
				break;
			};
			budget -= 1;
			self.forward(ev, Kind::Donation, now_ms, sink, &mut report);
		}

		while budget > 0 {
			let Some(chat) = self.chat_rx.try_pop() else {
				break;
			};
			budget -= 1;
			self.forward(DonationEvent::from_chat(&chat), Kind::Chat, now_ms, sink, &mut report);
		}

		report
	}

	fn forward(
		&mut self,
		ev: DonationEvent,
		kind: Kind,
		now_ms: i64,
		sink: &mut dyn DownstreamSink,
		report: &mut DrainReport,
	) {
		report.dequeued += 1;

		if self.dedup.is_duplicate(ev.dedupe_key(), now_ms) {
			report.duplicates += 1;
			self.suppressed_total += 1;
			metrics::counter!("tickfeed_dedup_suppressed_total").increment(1);
			return;
		}

		match catch_unwind(AssertUnwindSafe(|| sink.on_donation_event(ev))) {
			Ok(()) => {
				report.forwarded += 1;
				self.forwarded_total += 1;
				metrics::counter!("tickfeed_events_forwarded_total", "kind" => kind.label()).increment(1);
			}
			Err(payload) => {
				report.sink_panics += 1;
				self.sink_panics_total += 1;
				metrics::counter!("tickfeed_sink_panics_total").increment(1);
				warn!(kind = kind.label(), panic = panic_message(payload.as_ref()), "downstream sink panicked; event dropped");
			}
		}
	}

	/// Opportunistic dedup table cleanup.
	pub fn cleanup(&mut self, now_ms: i64) -> usize {
		self.dedup.cleanup(now_ms)
	}

	pub fn chat_dropped(&self) -> u64 {
		self.chat_rx.dropped()
	}

	pub fn donation_dropped(&self) -> u64 {
		self.donation_rx.dropped()
	}

	pub fn pending(&self) -> (usize, usize) {
		(self.donation_rx.len(), self.chat_rx.len())
	}

	pub fn forwarded_total(&self) -> u64 {
		self.forwarded_total
	}

	pub fn suppressed_total(&self) -> u64 {
		self.suppressed_total
	}

	pub fn sink_panics_total(&self) -> u64 {
		self.sink_panics_total
	}
}

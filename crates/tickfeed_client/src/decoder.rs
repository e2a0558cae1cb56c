#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tickfeed_domain::{ChatEvent, DonationEvent};
use tickfeed_protocol::{ServerFrame, decode_frame};

use crate::queue::IngressSender;
use crate::relay::LogRelay;

const RAW_SAMPLE_CHARS: usize = 200;
const ANONYMOUS_DONOR: &str = "anonymous";

/// Decode error counters shared between the socket task and the consumer.
#[derive(Debug, Default)]
pub struct DecodeCounters {
	parse_errors: AtomicU64,
	nested_errors: AtomicU64,
}

impl DecodeCounters {
	pub fn parse_errors(&self) -> u64 {
		self.parse_errors.load(Ordering::Relaxed)
	}

	pub fn nested_errors(&self) -> u64 {
		self.nested_errors.load(Ordering::Relaxed)
	}

	pub fn reset(&self) {
		self.parse_errors.store(0, Ordering::Relaxed);
		self.nested_errors.store(0, Ordering::Relaxed);
	}
}

/// What the socket task has to do after a frame was decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameAction {
	None,
	/// Server ping; answer with a heartbeat right away.
	ReplyHeartbeat,
	HandshakeAck {
		session_id: String,
	},
}

/// Turns raw text frames into canonical events and pushes them into the ingress queues.
///
/// Runs on the socket task. Never fails: a bad frame is counted and dropped.
pub struct FrameDecoder {
	chat_channel_id: String,
	chat_tx: IngressSender<ChatEvent>,
	donation_tx: IngressSender<DonationEvent>,
	counters: Arc<DecodeCounters>,
	relay: Arc<LogRelay>,
	max_frame_bytes: usize,
	log_every: u64,
	acks_without_sid: AtomicU64,
}

impl FrameDecoder {
	pub fn new(
		chat_channel_id: impl Into<String>,
		chat_tx: IngressSender<ChatEvent>,
		donation_tx: IngressSender<DonationEvent>,
		counters: Arc<DecodeCounters>,
		relay: Arc<LogRelay>,
		max_frame_bytes: usize,
		log_every: u64,
	) -> Self {
		Self {
			chat_channel_id: chat_channel_id.into(),
			chat_tx,
			donation_tx,
			counters,
			relay,
			max_frame_bytes,
			log_every: log_every.max(1),
			acks_without_sid: AtomicU64::new(0),
		}
	}

	pub fn handle_text(&self, raw: &str, now_ms: i64) -> FrameAction {
		let frame = match decode_frame(raw, self.max_frame_bytes) {
			Ok(f) => f,
			Err(e) => {
				let n = self.counters.parse_errors.fetch_add(1, Ordering::Relaxed) + 1;
				metrics::counter!("tickfeed_decode_errors_total").increment(1);
				if self.should_log(n) {
					self.relay.warn(format!(
						"dropping undecodable frame (count={n}): {e}; sample={}",
						truncate(raw, RAW_SAMPLE_CHARS)
					));
				}
				return FrameAction::None;
			}
		};

		match frame {
			ServerFrame::Ping => FrameAction::ReplyHeartbeat,
			ServerFrame::Connected { session_id: Some(sid) } => FrameAction::HandshakeAck { session_id: sid },
			ServerFrame::Connected { session_id: None } => {
				let n = self.acks_without_sid.fetch_add(1, Ordering::Relaxed) + 1;
				if self.should_log(n) {
					self.relay.warn(format!("handshake ack without sid; ignoring (count={n})"));
				}
				FrameAction::None
			}
			ServerFrame::ChatBatch {
				chat_channel_id,
				records,
				malformed,
			} => {
				self.note_nested(malformed as u64);
				let channel_id = chat_channel_id.as_deref().unwrap_or(&self.chat_channel_id);
				for r in records {
					if r.nested_error {
						self.note_nested(1);
					}
					let nickname = r.nickname.or_else(|| r.user_id.clone());
					let ev = ChatEvent::new(now_ms, channel_id, r.user_id, nickname, r.message, r.msg_time_ms);
					self.chat_tx.push(ev);
				}
				FrameAction::None
			}
			ServerFrame::DonationBatch { records, malformed, .. } => {
				self.note_nested(malformed as u64);
				for r in records {
					if r.nested_error {
						self.note_nested(1);
					}
					let donor = r
						.nickname
						.or_else(|| r.user_id.clone())
						.unwrap_or_else(|| ANONYMOUS_DONOR.to_string());
					let ev = DonationEvent::new(now_ms, donor, r.pay_amount, r.message, r.donation_id, r.donation_type);
					self.donation_tx.push(ev);
				}
				FrameAction::None
			}
			ServerFrame::Other { .. } => FrameAction::None,
		}
	}

	/// First occurrence and every Nth after it.
	fn should_log(&self, n: u64) -> bool {
		n == 1 || n % self.log_every == 0
	}

	fn note_nested(&self, n: u64) {
		if n == 0 {
			return;
		}
		let total = self.counters.nested_errors.fetch_add(n, Ordering::Relaxed) + n;
		metrics::counter!("tickfeed_nested_decode_errors_total").increment(n);
		if total == n || total / self.log_every != (total - n) / self.log_every {
			self.relay
				.debug(format!("malformed nested payload in batch (count={total})"));
		}
	}
}

fn truncate(s: &str, max_chars: usize) -> &str {
	match s.char_indices().nth(max_chars) {
		Some((idx, _)) => &s[..idx],
		None => s,
	}
}

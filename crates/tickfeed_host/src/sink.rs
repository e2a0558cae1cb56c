#![forbid(unsafe_code)]

use tickfeed_client::DownstreamSink;
use tickfeed_domain::DonationEvent;
use tracing::info;

/// Downstream sink that logs every forwarded event.
#[derive(Debug, Default)]
pub struct LoggingSink {
	donations: u64,
	chats: u64,
}

impl DownstreamSink for LoggingSink {
	fn on_donation_event(&mut self, event: DonationEvent) {
		if event.is_donation() {
			self.donations += 1;
			info!(
				donor = event.donor(),
				amount = event.amount(),
				kind = event.donation_type().unwrap_or("-"),
				message = event.message().unwrap_or(""),
				seen = self.donations,
				"donation"
			);
		} else {
			self.chats += 1;
			info!(from = event.donor(), message = event.message().unwrap_or(""), seen = self.chats, "chat");
		}
	}

	fn on_status(&mut self, status: &str) {
		info!(%status, "ingest status");
	}
}

#[cfg(test)]
mod tests {
	use tickfeed_domain::ChatEvent;

	use super::*;

	#[test]
	fn counts_by_kind() {
		let mut sink = LoggingSink::default();
		sink.on_donation_event(DonationEvent::new(0, "Kim", 1000, None, Some("D1".into()), None));
		let chat = ChatEvent::new(0, "N1", Some("u1".into()), Some("Lee".into()), "hello", 1);
		sink.on_donation_event(DonationEvent::from_chat(&chat));
		sink.on_donation_event(DonationEvent::from_chat(&chat));

		assert_eq!(sink.donations, 1);
		assert_eq!(sink.chats, 2);
	}
}

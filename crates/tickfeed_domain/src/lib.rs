#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Platform channel identifier (the broadcaster's channel).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct ChannelId(String);

impl ChannelId {
	/// Create a non-empty `ChannelId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for ChannelId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ChannelId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelId::new(s.to_string())
	}
}

/// Chat-channel identifier for a live broadcast.
///
/// The platform issues a new one whenever a stream restarts, so it is re-resolved
/// periodically and compared against the value the current session was opened with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct ChatChannelId(String);

impl ChatChannelId {
	/// Create a non-empty `ChatChannelId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		if id.chars().any(char::is_whitespace) {
			return Err(ParseIdError::InvalidFormat(format!("whitespace in chat channel id: {id:?}")));
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for ChatChannelId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ChatChannelId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChatChannelId::new(s.to_string())
	}
}

/// Dedupe key for a chat message: `server_msg_time_ms|user_id|message`.
pub fn chat_dedupe_key(server_msg_time_ms: i64, user_id: Option<&str>, message: &str) -> String {
	format!("{server_msg_time_ms}|{}|{message}", user_id.unwrap_or_default())
}

/// Dedupe key for a donation.
///
/// Uses the platform-assigned donation id when present and non-blank, otherwise
/// `don:donor|amount|message`.
pub fn donation_dedupe_key(donation_id: Option<&str>, donor: &str, amount: i64, message: Option<&str>) -> String {
	match donation_id.filter(|id| !id.trim().is_empty()) {
		Some(id) => format!("don:{id}"),
		None => format!("don:{donor}|{amount}|{}", message.unwrap_or_default()),
	}
}

/// Normalized chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChatEvent {
	received_at_utc_ms: i64,
	channel_id: String,
	user_id: Option<String>,
	nickname: Option<String>,
	message: String,
	server_msg_time_ms: i64,
	dedupe_key: String,
}

impl ChatEvent {
	pub fn new(
		received_at_utc_ms: i64,
		channel_id: impl Into<String>,
		user_id: Option<String>,
		nickname: Option<String>,
		message: impl Into<String>,
		server_msg_time_ms: i64,
	) -> Self {
		let message = message.into();
		let dedupe_key = chat_dedupe_key(server_msg_time_ms, user_id.as_deref(), &message);
		Self {
			received_at_utc_ms,
			channel_id: channel_id.into(),
			user_id,
			nickname,
			message,
			server_msg_time_ms,
			dedupe_key,
		}
	}

	pub fn received_at_utc_ms(&self) -> i64 {
		self.received_at_utc_ms
	}
	pub fn channel_id(&self) -> &str {
		&self.channel_id
	}
	pub fn user_id(&self) -> Option<&str> {
		self.user_id.as_deref()
	}
	pub fn nickname(&self) -> Option<&str> {
		self.nickname.as_deref()
	}
	pub fn message(&self) -> &str {
		&self.message
	}
	pub fn server_msg_time_ms(&self) -> i64 {
		self.server_msg_time_ms
	}
	pub fn dedupe_key(&self) -> &str {
		&self.dedupe_key
	}
}

/// Normalized donation.
///
/// Chat messages are also delivered downstream as pseudo-donations (`amount == 0`,
/// `is_donation == false`) so the consumer handles a single event type.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DonationEvent {
	received_at_utc_ms: i64,
	donor: String,
	amount: i64,
	message: Option<String>,
	donation_id: Option<String>,
	donation_type: Option<String>,
	is_donation: bool,
	dedupe_key: String,
}

impl DonationEvent {
	pub fn new(
		received_at_utc_ms: i64,
		donor: impl Into<String>,
		amount: i64,
		message: Option<String>,
		donation_id: Option<String>,
		donation_type: Option<String>,
	) -> Self {
		let donor = donor.into();
		let dedupe_key = donation_dedupe_key(donation_id.as_deref(), &donor, amount, message.as_deref());
		Self {
			received_at_utc_ms,
			donor,
			amount,
			message,
			donation_id,
			donation_type,
			is_donation: true,
			dedupe_key,
		}
	}

	/// Chat-derived pseudo-donation. Keeps the chat event's dedupe key.
	pub fn from_chat(chat: &ChatEvent) -> Self {
		let donor = chat
			.nickname()
			.or(chat.user_id())
			.map(str::to_string)
			.unwrap_or_default();
		Self {
			received_at_utc_ms: chat.received_at_utc_ms(),
			donor,
			amount: 0,
			message: Some(chat.message().to_string()),
			donation_id: None,
			donation_type: None,
			is_donation: false,
			dedupe_key: chat.dedupe_key().to_string(),
		}
	}

	pub fn received_at_utc_ms(&self) -> i64 {
		self.received_at_utc_ms
	}
	pub fn donor(&self) -> &str {
		&self.donor
	}
	pub fn amount(&self) -> i64 {
		self.amount
	}
	pub fn message(&self) -> Option<&str> {
		self.message.as_deref()
	}
	pub fn donation_id(&self) -> Option<&str> {
		self.donation_id.as_deref()
	}
	pub fn donation_type(&self) -> Option<&str> {
		self.donation_type.as_deref()
	}
	pub fn is_donation(&self) -> bool {
		self.is_donation
	}
	pub fn dedupe_key(&self) -> &str {
		&self.dedupe_key
	}
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;

	use super::*;

	#[test]
	fn chat_key_joins_time_user_and_message() {
		let ev = ChatEvent::new(1, "cc", Some("u1".into()), Some("Kim".into()), "hello", 1700000000123);
		assert_eq!(ev.dedupe_key(), "1700000000123|u1|hello");
	}

	#[test]
	fn chat_key_with_missing_user_leaves_slot_empty() {
		let ev = ChatEvent::new(1, "cc", None, None, "hi", 5);
		assert_eq!(ev.dedupe_key(), "5||hi");
	}

	#[test]
	fn donation_key_prefers_donation_id() {
		let ev = DonationEvent::new(0, "Kim", 5000, Some("hi".into()), Some("D1".into()), None);
		assert_eq!(ev.dedupe_key(), "don:D1");
		assert!(ev.is_donation());
	}

	#[test]
	fn donation_key_falls_back_when_id_blank() {
		let ev = DonationEvent::new(0, "Kim", 5000, Some("hi".into()), Some("   ".into()), None);
		assert_eq!(ev.dedupe_key(), "don:Kim|5000|hi");

		let ev = DonationEvent::new(0, "Kim", 1000, None, None, None);
		assert_eq!(ev.dedupe_key(), "don:Kim|1000|");
	}

	#[test]
	fn pseudo_donation_from_chat() {
		let chat = ChatEvent::new(42, "cc", Some("u1".into()), None, "gg", 7);
		let don = DonationEvent::from_chat(&chat);
		assert_eq!(don.amount(), 0);
		assert!(!don.is_donation());
		assert_eq!(don.donor(), "u1");
		assert_eq!(don.message(), Some("gg"));
		assert_eq!(don.dedupe_key(), chat.dedupe_key());
		assert_eq!(don.received_at_utc_ms(), 42);
	}

	#[test]
	fn ids_reject_empty() {
		assert_eq!(ChannelId::new("  "), Err(ParseIdError::Empty));
		assert!(ChatChannelId::new("N1 x").is_err());
		assert_eq!(ChatChannelId::from_str("N1abc").map(|c| c.into_string()), Ok("N1abc".to_string()));
	}

	proptest! {
		#[test]
		fn chat_key_is_deterministic(t in any::<i64>(), uid in proptest::option::of("[a-z0-9]{0,12}"), msg in ".{0,40}") {
			let a = ChatEvent::new(0, "cc", uid.clone(), None, msg.clone(), t);
			let b = ChatEvent::new(99, "other", uid.clone(), Some("nick".into()), msg.clone(), t);
			prop_assert_eq!(a.dedupe_key(), b.dedupe_key());
			prop_assert_eq!(a.dedupe_key(), chat_dedupe_key(t, uid.as_deref(), &msg));
		}

		#[test]
		fn donation_key_ignores_everything_but_id_when_present(id in "[A-Za-z0-9]{1,16}", donor in ".{0,10}", amount in 0i64..1_000_000) {
			let a = DonationEvent::new(0, donor.clone(), amount, None, Some(id.clone()), None);
			let b = DonationEvent::new(1, "someone else", amount + 1, Some("x".into()), Some(id.clone()), Some("CHAT".into()));
			prop_assert_eq!(a.dedupe_key(), b.dedupe_key());
			prop_assert_eq!(a.dedupe_key(), format!("don:{id}"));
		}
	}
}

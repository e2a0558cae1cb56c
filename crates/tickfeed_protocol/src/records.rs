#![forbid(unsafe_code)]

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// One chat message from a `93101` batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRecord {
	pub message: String,
	pub user_id: Option<String>,
	pub nickname: Option<String>,
	/// Server timestamp; 0 when the record carried none.
	pub msg_time_ms: i64,
	/// The embedded `profile` JSON was present but unreadable.
	pub nested_error: bool,
}

/// One donation from a `93102` batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DonationRecord {
	pub message: Option<String>,
	pub user_id: Option<String>,
	pub nickname: Option<String>,
	pub pay_amount: i64,
	pub donation_id: Option<String>,
	pub donation_type: Option<String>,
	/// The embedded `extras` JSON was missing or unreadable.
	pub nested_error: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawChat {
	#[serde(default, alias = "content")]
	msg: Option<String>,
	#[serde(default, alias = "userId")]
	uid: Option<String>,
	#[serde(default)]
	profile: Option<Value>,
	#[serde(default, alias = "messageTime")]
	msg_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDonation {
	#[serde(default, alias = "content")]
	msg: Option<String>,
	#[serde(default, alias = "userId")]
	uid: Option<String>,
	#[serde(default)]
	extras: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Profile {
	#[serde(default)]
	nickname: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Extras {
	#[serde(default)]
	nickname: Option<String>,
	#[serde(default)]
	pay_amount: Option<Amount>,
	#[serde(default)]
	donation_id: Option<String>,
	#[serde(default)]
	donation_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Amount {
	Int(i64),
	Float(f64),
	Text(String),
}

impl Amount {
	fn value(&self) -> Option<i64> {
		match self {
			Amount::Int(n) => Some(*n),
			Amount::Float(f) if f.is_finite() => Some(*f as i64),
			Amount::Float(_) => None,
			Amount::Text(s) => s.trim().parse().ok(),
		}
	}
}

/// Outcome of the second decode stage for an embedded JSON field.
enum Nested<T> {
	Absent,
	Parsed(T),
	Malformed,
}

/// Embedded payloads arrive either as JSON text or, from some servers, as a plain object.
fn nested<T: DeserializeOwned>(v: Option<Value>) -> Nested<T> {
	let parsed = match v {
		None | Some(Value::Null) => return Nested::Absent,
		Some(Value::String(s)) if s.trim().is_empty() => return Nested::Absent,
		Some(Value::String(s)) => serde_json::from_str::<Option<T>>(&s),
		Some(other) => serde_json::from_value::<Option<T>>(other),
	};
	match parsed {
		Ok(Some(t)) => Nested::Parsed(t),
		Ok(None) => Nested::Absent,
		Err(_) => Nested::Malformed,
	}
}

fn non_blank(s: Option<String>) -> Option<String> {
	s.filter(|s| !s.trim().is_empty())
}

fn batch_items(bdy: Value) -> Vec<Value> {
	match bdy {
		Value::Array(items) => items,
		Value::Null => Vec::new(),
		other => vec![other],
	}
}

/// Decode a chat batch body. Records with an empty message are skipped.
pub(crate) fn decode_chat_batch(bdy: Value) -> (Vec<ChatRecord>, usize) {
	let mut out = Vec::new();
	let mut malformed = 0;

	for item in batch_items(bdy) {
		let Ok(raw) = serde_json::from_value::<RawChat>(item) else {
			malformed += 1;
			continue;
		};

		let Some(message) = raw.msg.filter(|m| !m.is_empty()) else {
			continue;
		};

		let (nickname, nested_error) = match nested::<Profile>(raw.profile) {
			Nested::Parsed(p) => (non_blank(p.nickname), false),
			Nested::Absent => (None, false),
			Nested::Malformed => (None, true),
		};

		out.push(ChatRecord {
			message,
			user_id: non_blank(raw.uid),
			nickname,
			msg_time_ms: raw.msg_time.unwrap_or(0),
			nested_error,
		});
	}

	(out, malformed)
}

/// Decode a donation batch body.
pub(crate) fn decode_donation_batch(bdy: Value) -> (Vec<DonationRecord>, usize) {
	let mut out = Vec::new();
	let mut malformed = 0;

	for item in batch_items(bdy) {
		let Ok(raw) = serde_json::from_value::<RawDonation>(item) else {
			malformed += 1;
			continue;
		};

		let record = match nested::<Extras>(raw.extras) {
			Nested::Parsed(extras) => DonationRecord {
				message: raw.msg,
				user_id: non_blank(raw.uid),
				nickname: non_blank(extras.nickname),
				pay_amount: extras.pay_amount.as_ref().and_then(Amount::value).unwrap_or(0),
				donation_id: non_blank(extras.donation_id),
				donation_type: non_blank(extras.donation_type),
				nested_error: false,
			},
			Nested::Absent | Nested::Malformed => DonationRecord {
				message: raw.msg,
				user_id: non_blank(raw.uid),
				nickname: None,
				pay_amount: 0,
				donation_id: None,
				donation_type: None,
				nested_error: true,
			},
		};
		out.push(record);
	}

	(out, malformed)
}

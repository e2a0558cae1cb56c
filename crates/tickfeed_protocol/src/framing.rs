#![forbid(unsafe_code)]

use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

use crate::records::{ChatRecord, DonationRecord, decode_chat_batch, decode_donation_batch};
use crate::version;

/// Default maximum text frame size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 2 * 1024 * 1024; // 2 MiB

#[derive(Debug, Error)]
pub enum ProtocolError {
	#[error("json decode error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("frame has no numeric cmd field")]
	MissingCommand,

	#[error("json encode error: {0}")]
	Encode(#[source] serde_json::Error),
}

/// Envelope command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
	Ping,
	Connect,
	Heartbeat,
	Connected,
	Chat,
	Donation,
}

impl Command {
	pub const fn code(self) -> i64 {
		match self {
			Command::Ping => 0,
			Command::Connect => 100,
			Command::Heartbeat => 10000,
			Command::Connected => 10100,
			Command::Chat => 93101,
			Command::Donation => 93102,
		}
	}

	pub const fn from_code(code: i64) -> Option<Self> {
		match code {
			0 => Some(Command::Ping),
			100 => Some(Command::Connect),
			10000 => Some(Command::Heartbeat),
			10100 => Some(Command::Connected),
			93101 => Some(Command::Chat),
			93102 => Some(Command::Donation),
			_ => None,
		}
	}
}

/// Values stamped into every outgoing envelope and the handshake body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireProfile {
	pub ver: String,
	pub svcid: String,
	pub dev_type: u32,
	pub auth: String,
}

impl Default for WireProfile {
	fn default() -> Self {
		Self {
			ver: version::ENVELOPE_VERSION.to_string(),
			svcid: version::SERVICE_ID.to_string(),
			dev_type: version::DEVICE_TYPE,
			auth: version::AUTH_READ.to_string(),
		}
	}
}

#[derive(Serialize)]
struct OutgoingEnvelope<'a> {
	ver: &'a str,
	cmd: i64,
	svcid: &'a str,
	cid: &'a str,
	tid: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	bdy: Option<Value>,
}

fn encode(
	profile: &WireProfile,
	cmd: Command,
	cid: &str,
	tid: u64,
	bdy: Option<Value>,
) -> Result<String, ProtocolError> {
	let env = OutgoingEnvelope {
		ver: &profile.ver,
		cmd: cmd.code(),
		svcid: &profile.svcid,
		cid,
		tid: tid.to_string(),
		bdy,
	};
	serde_json::to_string(&env).map_err(ProtocolError::Encode)
}

/// Build the connect/handshake frame (cmd 100) for anonymous read access.
pub fn connect_frame(
	profile: &WireProfile,
	cid: &str,
	tid: u64,
	access_token: &str,
	extra_token: Option<&str>,
) -> Result<String, ProtocolError> {
	let bdy = json!({
		"uid": Value::Null,
		"devType": profile.dev_type,
		"accTkn": access_token,
		"extraTkn": extra_token,
		"auth": profile.auth,
	});
	encode(profile, Command::Connect, cid, tid, Some(bdy))
}

/// Build the client heartbeat frame (cmd 10000).
pub fn heartbeat_frame(profile: &WireProfile, cid: &str, tid: u64) -> Result<String, ProtocolError> {
	encode(profile, Command::Heartbeat, cid, tid, None)
}

/// A decoded server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
	Ping,
	Connected {
		session_id: Option<String>,
	},
	ChatBatch {
		chat_channel_id: Option<String>,
		records: Vec<ChatRecord>,
		/// Records in the batch whose shape could not be decoded.
		malformed: usize,
	},
	DonationBatch {
		chat_channel_id: Option<String>,
		records: Vec<DonationRecord>,
		malformed: usize,
	},
	Other {
		cmd: i64,
	},
}

/// Decode one text frame.
///
/// Only the envelope is validated here; a malformed record inside a batch is
/// counted in `malformed` and never fails the frame.
pub fn decode_frame(raw: &str, max_frame_size: usize) -> Result<ServerFrame, ProtocolError> {
	if raw.len() > max_frame_size {
		return Err(ProtocolError::FrameTooLarge {
			len: raw.len(),
			max: max_frame_size,
		});
	}

	let mut value: Value = serde_json::from_str(raw)?;
	let cmd = value
		.get("cmd")
		.and_then(Value::as_i64)
		.ok_or(ProtocolError::MissingCommand)?;

	let cid = value.get("cid").and_then(Value::as_str).map(str::to_string);
	let bdy = value.get_mut("bdy").map(Value::take).unwrap_or(Value::Null);

	let frame = match Command::from_code(cmd) {
		Some(Command::Ping) => ServerFrame::Ping,
		Some(Command::Connected) => ServerFrame::Connected {
			session_id: bdy
				.get("sid")
				.and_then(Value::as_str)
				.filter(|s| !s.is_empty())
				.map(str::to_string),
		},
		Some(Command::Chat) => {
			let (records, malformed) = decode_chat_batch(bdy);
			ServerFrame::ChatBatch {
				chat_channel_id: cid,
				records,
				malformed,
			}
		}
		Some(Command::Donation) => {
			let (records, malformed) = decode_donation_batch(bdy);
			ServerFrame::DonationBatch {
				chat_channel_id: cid,
				records,
				malformed,
			}
		}
		_ => ServerFrame::Other { cmd },
	};

	Ok(frame)
}

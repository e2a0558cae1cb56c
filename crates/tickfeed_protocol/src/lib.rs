#![forbid(unsafe_code)]

pub mod framing;
pub mod records;

pub use framing::{
	Command, DEFAULT_MAX_FRAME_SIZE, ProtocolError, ServerFrame, WireProfile, connect_frame, decode_frame,
	heartbeat_frame,
};
pub use records::{ChatRecord, DonationRecord};

/// Protocol version constants.
pub mod version {
	/// Envelope `ver` sent on every outgoing frame.
	pub const ENVELOPE_VERSION: &str = "2";
	/// Envelope `svcid`.
	pub const SERVICE_ID: &str = "game";
	/// Handshake `devType`.
	pub const DEVICE_TYPE: u32 = 2001;
	/// Handshake `auth` for anonymous read access.
	pub const AUTH_READ: &str = "READ";
}

#![forbid(unsafe_code)]

pub mod source {
	use thiserror::Error;

	const CHANNEL_ID_LEN: usize = 32;

	#[derive(Debug, Error, Clone, PartialEq, Eq)]
	pub enum SourceError {
		#[error("source must be non-empty (expected a channel url or 32-character channel id)")]
		Empty,
		#[error("unrecognized source (expected https://<host>/<id>, https://<host>/live/<id> or a bare id): {0}")]
		Unrecognized(String),
	}

	/// A user-entered stream source reduced to its channel id.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct SourceUrl {
		pub host: Option<String>,
		pub channel_id: String,
	}

	fn is_channel_id(s: &str) -> bool {
		s.len() == CHANNEL_ID_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
	}

	impl SourceUrl {
		/// Parse a channel url or a bare channel id.
		///
		/// Accepted shapes, scheme optional, query/fragment/trailing slash ignored:
		/// `<id>`, `<host>/<id>`, `<host>/live/<id>`.
		pub fn parse(s: &str) -> Result<Self, SourceError> {
			let s = s.trim();
			if s.is_empty() {
				return Err(SourceError::Empty);
			}

			if is_channel_id(s) {
				return Ok(Self {
					host: None,
					channel_id: s.to_ascii_lowercase(),
				});
			}

			let rest = s
				.strip_prefix("https://")
				.or_else(|| s.strip_prefix("http://"))
				.unwrap_or(s);
			let rest = rest.split(['?', '#']).next().unwrap_or_default();

			let mut segments = rest.split('/').filter(|seg| !seg.is_empty());
			let host = segments
				.next()
				.filter(|h| h.contains('.') || h.contains(':'))
				.ok_or_else(|| SourceError::Unrecognized(s.to_string()))?;

			let path: Vec<&str> = segments.collect();
			let id = match path.as_slice() {
				[id] => *id,
				["live", id] => *id,
				_ => return Err(SourceError::Unrecognized(s.to_string())),
			};

			if !is_channel_id(id) {
				return Err(SourceError::Unrecognized(s.to_string()));
			}

			Ok(Self {
				host: Some(host.to_ascii_lowercase()),
				channel_id: id.to_ascii_lowercase(),
			})
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		const ID: &str = "0123456789abcdef0123456789abcdef";

		#[test]
		fn parses_bare_id() {
			let s = SourceUrl::parse(ID).unwrap();
			assert_eq!(s.channel_id, ID);
			assert!(s.host.is_none());
		}

		#[test]
		fn parses_channel_and_live_urls() {
			for input in [
				format!("https://chzzk.naver.com/{ID}"),
				format!("https://chzzk.naver.com/live/{ID}"),
				format!("chzzk.naver.com/live/{ID}/"),
				format!("https://chzzk.naver.com/live/{ID}?from=share#top"),
			] {
				let s = SourceUrl::parse(&input).unwrap();
				assert_eq!(s.channel_id, ID, "input: {input}");
				assert_eq!(s.host.as_deref(), Some("chzzk.naver.com"));
			}
		}

		#[test]
		fn normalizes_id_case() {
			let s = SourceUrl::parse(&ID.to_ascii_uppercase()).unwrap();
			assert_eq!(s.channel_id, ID);
		}

		#[test]
		fn rejects_empty_and_garbage() {
			assert_eq!(SourceUrl::parse("   "), Err(SourceError::Empty));
			assert!(SourceUrl::parse("hello").is_err());
			assert!(SourceUrl::parse("https://chzzk.naver.com/").is_err());
			assert!(SourceUrl::parse("https://chzzk.naver.com/live/short").is_err());
			assert!(SourceUrl::parse(&format!("https://chzzk.naver.com/video/x/{ID}")).is_err());
		}
	}
}

pub mod time {
	use std::time::{Duration, SystemTime, UNIX_EPOCH};

	/// Current Unix time in milliseconds.
	#[inline]
	pub fn unix_ms_now() -> i64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or(Duration::from_secs(0))
			.as_millis() as i64
	}
}

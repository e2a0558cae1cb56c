#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tickfeed_domain::{ChannelId, ChatChannelId};
use tickfeed_util::source::SourceUrl;
use url::Url;

use crate::SecretString;

pub const DEFAULT_API_BASE_URL: &str = "https://api.chzzk.naver.com";
pub const DEFAULT_CHAT_API_BASE_URL: &str = "https://comm-api.game.naver.com";

const LIVE_STATUS_OPEN: &str = "OPEN";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
	#[error("invalid input: {0}")]
	InvalidInput(String),

	#[error("stream not live: {0}")]
	NotLive(String),

	#[error("token unavailable: {0}")]
	Token(String),

	#[error("http error: {0}")]
	Http(String),
}

/// Short-lived credentials for one chat connection.
#[derive(Debug, Clone)]
pub struct AccessTokens {
	pub access_token: SecretString,
	pub extra_token: Option<SecretString>,
}

/// Resolves user input into the identifiers and tokens a chat session needs.
#[async_trait]
pub trait ChannelResolver: Send + Sync {
	async fn resolve_channel_id(&self, source: &str) -> Result<ChannelId, ResolveError>;

	/// Fails with [`ResolveError::NotLive`] when the channel is not broadcasting.
	async fn resolve_live_chat_channel_id(&self, channel: &ChannelId) -> Result<ChatChannelId, ResolveError>;

	async fn fetch_access_token(&self, chat_channel: &ChatChannelId) -> Result<AccessTokens, ResolveError>;
}

#[derive(Debug, Clone)]
pub struct HttpResolverConfig {
	pub api_base_url: String,
	pub chat_api_base_url: String,
	pub user_agent: String,
	pub request_timeout: Duration,
}

impl Default for HttpResolverConfig {
	fn default() -> Self {
		Self {
			api_base_url: DEFAULT_API_BASE_URL.to_string(),
			chat_api_base_url: DEFAULT_CHAT_API_BASE_URL.to_string(),
			user_agent: format!("tickfeed/{}", env!("CARGO_PKG_VERSION")),
			request_timeout: Duration::from_secs(10),
		}
	}
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
	content: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveStatusContent {
	#[serde(default)]
	status: Option<String>,
	#[serde(default)]
	chat_channel_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessTokenContent {
	#[serde(default)]
	access_token: Option<String>,
	#[serde(default)]
	extra_token: Option<String>,
}

/// Resolver backed by the platform's public HTTP API.
#[derive(Clone)]
pub struct HttpResolver {
	http: reqwest::Client,
	api_base_url: Url,
	chat_api_base_url: Url,
}

impl HttpResolver {
	pub fn new(cfg: HttpResolverConfig) -> anyhow::Result<Self> {
		use anyhow::Context;

		let http = reqwest::Client::builder()
			.user_agent(cfg.user_agent)
			.timeout(cfg.request_timeout)
			.build()
			.context("build http client")?;
		let api_base_url = Url::parse(&cfg.api_base_url).context("parse api_base_url")?;
		let chat_api_base_url = Url::parse(&cfg.chat_api_base_url).context("parse chat_api_base_url")?;

		Ok(Self {
			http,
			api_base_url,
			chat_api_base_url,
		})
	}

	async fn get_content<T: serde::de::DeserializeOwned>(&self, url: Url, label: &str) -> Result<Option<T>, ResolveError> {
		let resp = self
			.http
			.get(url)
			.send()
			.await
			.map_err(|e| ResolveError::Http(format!("{label} send: {e}")))?;

		let status = resp.status();
		if status == StatusCode::NOT_FOUND {
			return Ok(None);
		}
		if !status.is_success() {
			return Err(ResolveError::Http(format!("{label} status={status}")));
		}

		let body = resp
			.text()
			.await
			.map_err(|e| ResolveError::Http(format!("{label} read body: {e}")))?;
		let parsed: ApiEnvelope<T> =
			serde_json::from_str(&body).map_err(|e| ResolveError::Http(format!("{label} parse json: {e}")))?;
		Ok(parsed.content)
	}
}

#[async_trait]
impl ChannelResolver for HttpResolver {
	async fn resolve_channel_id(&self, source: &str) -> Result<ChannelId, ResolveError> {
		let parsed = SourceUrl::parse(source).map_err(|e| ResolveError::InvalidInput(e.to_string()))?;
		ChannelId::new(parsed.channel_id).map_err(|e| ResolveError::InvalidInput(e.to_string()))
	}

	async fn resolve_live_chat_channel_id(&self, channel: &ChannelId) -> Result<ChatChannelId, ResolveError> {
		let url = self
			.api_base_url
			.join(&format!("/polling/v2/channels/{channel}/live-status"))
			.map_err(|e| ResolveError::InvalidInput(format!("live-status url: {e}")))?;

		let content: Option<LiveStatusContent> = self.get_content(url, "GET live-status").await?;
		let Some(content) = content else {
			return Err(ResolveError::NotLive(format!("no live status for channel {channel}")));
		};

		if content.status.as_deref() != Some(LIVE_STATUS_OPEN) {
			return Err(ResolveError::NotLive(format!(
				"channel {channel} status={}",
				content.status.as_deref().unwrap_or("unknown")
			)));
		}

		content
			.chat_channel_id
			.and_then(|id| ChatChannelId::new(id).ok())
			.ok_or_else(|| ResolveError::NotLive(format!("channel {channel} has no chat channel")))
	}

	async fn fetch_access_token(&self, chat_channel: &ChatChannelId) -> Result<AccessTokens, ResolveError> {
		let mut url = self
			.chat_api_base_url
			.join("/nng_main/v1/chats/access-token")
			.map_err(|e| ResolveError::InvalidInput(format!("access-token url: {e}")))?;
		url.query_pairs_mut()
			.append_pair("channelId", chat_channel.as_str())
			.append_pair("chatType", "STREAMING");

		let content: Option<AccessTokenContent> = self
			.get_content(url, "GET access-token")
			.await
			.map_err(|e| ResolveError::Token(e.to_string()))?;

		let Some(AccessTokenContent {
			access_token: Some(access_token),
			extra_token,
		}) = content
		else {
			return Err(ResolveError::Token("response has no accessToken".to_string()));
		};

		Ok(AccessTokens {
			access_token: SecretString::new(access_token),
			extra_token: extra_token.filter(|t| !t.is_empty()).map(SecretString::new),
		})
	}
}

#[cfg(test)]
mod tests {
	use tokio::io::{AsyncReadExt, AsyncWriteExt};
	use tokio::net::TcpListener;
	use tokio::sync::oneshot;

	use super::*;

	const CHANNEL: &str = "0123456789abcdef0123456789abcdef";

	fn resolver() -> HttpResolver {
		HttpResolver::new(HttpResolverConfig::default()).expect("http resolver")
	}

	/// Answer exactly one request with `status` and `body`; yields the request line.
	async fn serve_once(status: &'static str, body: &'static str) -> (HttpResolver, oneshot::Receiver<String>) {
		let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
		let base = format!("http://{}", listener.local_addr().expect("addr"));
		let (line_tx, line_rx) = oneshot::channel();

		tokio::spawn(async move {
			let (mut stream, _) = listener.accept().await.expect("accept");
			let mut buf = Vec::new();
			let mut chunk = [0u8; 1024];
			while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
				let n = stream.read(&mut chunk).await.expect("read request");
				if n == 0 {
					break;
				}
				buf.extend_from_slice(&chunk[..n]);
			}
			let request = String::from_utf8_lossy(&buf);
			let _ = line_tx.send(request.lines().next().unwrap_or_default().to_string());

			let response = format!(
				"HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
				body.len()
			);
			stream.write_all(response.as_bytes()).await.expect("write response");
			let _ = stream.shutdown().await;
		});

		let resolver = HttpResolver::new(HttpResolverConfig {
			api_base_url: base.clone(),
			chat_api_base_url: base,
			request_timeout: Duration::from_secs(5),
			..HttpResolverConfig::default()
		})
		.expect("http resolver");
		(resolver, line_rx)
	}

	fn channel() -> ChannelId {
		ChannelId::new(CHANNEL).expect("channel id")
	}

	#[tokio::test]
	async fn open_stream_yields_chat_channel() {
		let (r, line) = serve_once("200 OK", r#"{"code":200,"content":{"status":"OPEN","chatChannelId":"N1abc"}}"#).await;
		let id = r.resolve_live_chat_channel_id(&channel()).await.expect("live");
		assert_eq!(id.as_str(), "N1abc");

		let line = line.await.expect("request line");
		assert!(line.starts_with(&format!("GET /polling/v2/channels/{CHANNEL}/live-status ")), "{line}");
	}

	#[tokio::test]
	async fn closed_stream_is_not_live() {
		let (r, _) = serve_once("200 OK", r#"{"content":{"status":"CLOSE","chatChannelId":"N1abc"}}"#).await;
		let err = r.resolve_live_chat_channel_id(&channel()).await.unwrap_err();
		assert!(matches!(err, ResolveError::NotLive(_)), "{err:?}");
	}

	#[tokio::test]
	async fn missing_channel_is_not_live() {
		let (r, _) = serve_once("404 Not Found", r#"{"code":404}"#).await;
		let err = r.resolve_live_chat_channel_id(&channel()).await.unwrap_err();
		assert!(matches!(err, ResolveError::NotLive(_)), "{err:?}");
	}

	#[tokio::test]
	async fn open_without_chat_channel_is_not_live() {
		let (r, _) = serve_once("200 OK", r#"{"content":{"status":"OPEN"}}"#).await;
		let err = r.resolve_live_chat_channel_id(&channel()).await.unwrap_err();
		assert!(matches!(err, ResolveError::NotLive(_)), "{err:?}");
	}

	#[tokio::test]
	async fn server_error_is_http_error() {
		let (r, _) = serve_once("500 Internal Server Error", "{}").await;
		let err = r.resolve_live_chat_channel_id(&channel()).await.unwrap_err();
		match err {
			ResolveError::Http(msg) => assert!(msg.contains("status=500"), "{msg}"),
			other => panic!("expected http error, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn access_token_sends_channel_and_chat_type() {
		let (r, line) = serve_once("200 OK", r#"{"content":{"accessToken":"tok-1","extraToken":""}}"#).await;
		let chat = ChatChannelId::new("N1abc").expect("chat id");
		let tokens = r.fetch_access_token(&chat).await.expect("tokens");
		assert_eq!(tokens.access_token.expose(), "tok-1");
		assert!(tokens.extra_token.is_none());

		let line = line.await.expect("request line");
		assert!(line.starts_with("GET /nng_main/v1/chats/access-token?"), "{line}");
		assert!(line.contains("channelId=N1abc"), "{line}");
		assert!(line.contains("chatType=STREAMING"), "{line}");
	}

	#[tokio::test]
	async fn access_token_missing_is_token_error() {
		let (r, _) = serve_once("200 OK", r#"{"content":{"extraToken":"x"}}"#).await;
		let chat = ChatChannelId::new("N1abc").expect("chat id");
		let err = r.fetch_access_token(&chat).await.unwrap_err();
		assert!(matches!(err, ResolveError::Token(_)), "{err:?}");
	}

	#[tokio::test]
	async fn access_token_server_error_is_token_error() {
		let (r, _) = serve_once("503 Service Unavailable", "{}").await;
		let chat = ChatChannelId::new("N1abc").expect("chat id");
		let err = r.fetch_access_token(&chat).await.unwrap_err();
		match err {
			ResolveError::Token(msg) => assert!(msg.contains("status=503"), "{msg}"),
			other => panic!("expected token error, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn channel_id_from_url() {
		let r = resolver();
		let id = r
			.resolve_channel_id("https://chzzk.naver.com/live/0123456789abcdef0123456789abcdef")
			.await
			.expect("resolve");
		assert_eq!(id.as_str(), "0123456789abcdef0123456789abcdef");
	}

	#[tokio::test]
	async fn bad_url_is_invalid_input() {
		let r = resolver();
		let err = r.resolve_channel_id("not a channel").await.unwrap_err();
		assert!(matches!(err, ResolveError::InvalidInput(_)));
	}

	#[test]
	fn tokens_are_redacted_in_debug() {
		let t = AccessTokens {
			access_token: SecretString::new("secret-token"),
			extra_token: None,
		};
		assert!(!format!("{t:?}").contains("secret-token"));
	}
}

#![forbid(unsafe_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tickfeed_protocol::{WireProfile, connect_frame, heartbeat_frame};
use tickfeed_util::time::unix_ms_now;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use url::Url;

use crate::connection::SessionSignal;
use crate::decoder::{FrameAction, FrameDecoder};
use crate::relay::LogRelay;
use crate::resolver::AccessTokens;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<WsStream>> + Send + Sync>;

async fn connect_chat_ws(url: Url) -> anyhow::Result<WsStream> {
	let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
		.await
		.context("connect_async to chat ws")?;
	Ok(ws)
}

pub fn default_connector() -> WsConnector {
	Arc::new(|url: Url| Box::pin(async move { connect_chat_ws(url).await }) as BoxFuture<'static, anyhow::Result<WsStream>>)
}

/// Per-connection state readable from the heartbeat task and the consumer.
pub struct SessionShared {
	generation: u64,
	chat_channel_id: String,
	next_tid: AtomicU64,
	open: AtomicBool,
	session_id: Mutex<Option<String>>,
	outbound: mpsc::UnboundedSender<String>,
}

impl SessionShared {
	pub fn generation(&self) -> u64 {
		self.generation
	}

	pub fn chat_channel_id(&self) -> &str {
		&self.chat_channel_id
	}

	/// Next outgoing sequence number, starting at 1.
	pub fn next_tid(&self) -> u64 {
		self.next_tid.fetch_add(1, Ordering::Relaxed)
	}

	pub fn is_open(&self) -> bool {
		self.open.load(Ordering::Acquire)
	}

	pub fn session_id(&self) -> Option<String> {
		self.session_id.lock().clone()
	}

	pub fn has_session(&self) -> bool {
		self.session_id.lock().is_some()
	}

	/// Queue a heartbeat frame for the socket task to write.
	pub fn queue_heartbeat(&self, wire: &WireProfile) -> bool {
		if !self.is_open() {
			return false;
		}
		match heartbeat_frame(wire, &self.chat_channel_id, self.next_tid()) {
			Ok(frame) => self.outbound.send(frame).is_ok(),
			Err(_) => false,
		}
	}
}

/// Everything a socket task needs for one connection attempt.
pub struct SessionParams {
	pub generation: u64,
	pub url: Url,
	pub chat_channel_id: String,
	pub tokens: AccessTokens,
	pub wire: WireProfile,
	pub connector: WsConnector,
	pub decoder: FrameDecoder,
	pub signals: mpsc::UnboundedSender<SessionSignal>,
	pub relay: Arc<LogRelay>,
}

/// Owner-side handle of a running socket task.
pub struct SocketHandle {
	shared: Arc<SessionShared>,
	close_tx: Option<oneshot::Sender<()>>,
	task: JoinHandle<()>,
}

impl SocketHandle {
	/// Start the socket task. Returns immediately; progress is reported as [`SessionSignal`]s.
	pub fn spawn(handle: &Handle, params: SessionParams) -> Self {
		let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
		let (close_tx, close_rx) = oneshot::channel();
		let shared = Arc::new(SessionShared {
			generation: params.generation,
			chat_channel_id: params.chat_channel_id.clone(),
			next_tid: AtomicU64::new(1),
			open: AtomicBool::new(false),
			session_id: Mutex::new(None),
			outbound: outbound_tx,
		});

		let task = handle.spawn(run_session(params, shared.clone(), close_rx, outbound_rx));

		Self {
			shared,
			close_tx: Some(close_tx),
			task,
		}
	}

	pub fn shared(&self) -> &Arc<SessionShared> {
		&self.shared
	}

	pub fn is_finished(&self) -> bool {
		self.task.is_finished()
	}

	/// Ask the task to close the socket. Best-effort; emits no signal.
	pub fn close(mut self) {
		self.shared.open.store(false, Ordering::Release);
		if let Some(tx) = self.close_tx.take() {
			let _ = tx.send(());
		}
	}
}

async fn run_session(
	params: SessionParams,
	shared: Arc<SessionShared>,
	mut close_rx: oneshot::Receiver<()>,
	mut outbound_rx: mpsc::UnboundedReceiver<String>,
) {
	let SessionParams {
		generation,
		url,
		chat_channel_id,
		tokens,
		wire,
		connector,
		decoder,
		signals,
		relay,
	} = params;

	let closed = |reason: String| {
		shared.open.store(false, Ordering::Release);
		let _ = signals.send(SessionSignal::SocketClosed { generation, reason });
	};

	let mut ws = tokio::select! {
		_ = &mut close_rx => return,
		res = (connector)(url.clone()) => match res {
			Ok(ws) => ws,
			Err(e) => {
				relay.warn(format!("chat socket connect failed (url={url}): {e:#}"));
				closed(format!("connect failed: {e}"));
				return;
			}
		}
	};

	shared.open.store(true, Ordering::Release);

	let handshake = match connect_frame(
		&wire,
		&chat_channel_id,
		shared.next_tid(),
		tokens.access_token.expose(),
		tokens.extra_token.as_ref().map(|t| t.expose()),
	) {
		Ok(f) => f,
		Err(e) => {
			let _ = ws.close(None).await;
			closed(format!("encode handshake: {e}"));
			return;
		}
	};

	if let Err(e) = ws.send(Message::Text(handshake.into())).await {
		closed(format!("send handshake: {e}"));
		return;
	}
	let _ = signals.send(SessionSignal::SocketOpened { generation });
	relay.debug(format!("chat socket open; handshake sent (generation={generation})"));

	let reason = loop {
		tokio::select! {
			_ = &mut close_rx => {
				shared.open.store(false, Ordering::Release);
				let _ = ws.close(None).await;
				return;
			}

			Some(frame) = outbound_rx.recv() => {
				if let Err(e) = ws.send(Message::Text(frame.into())).await {
					break format!("send failed: {e}");
				}
				metrics::counter!("tickfeed_heartbeats_sent_total").increment(1);
			}

			msg = ws.next() => {
				let Some(msg) = msg else {
					break "stream ended".to_string();
				};

				let msg = match msg {
					Ok(m) => m,
					Err(e) => break format!("read error: {e}"),
				};

				match msg {
					Message::Text(t) => match decoder.handle_text(t.as_str(), unix_ms_now()) {
						FrameAction::ReplyHeartbeat => {
							let frame = match heartbeat_frame(&wire, &chat_channel_id, shared.next_tid()) {
								Ok(f) => f,
								Err(e) => {
									relay.warn(format!("encode heartbeat reply: {e}"));
									continue;
								}
							};
							if let Err(e) = ws.send(Message::Text(frame.into())).await {
								break format!("send heartbeat reply: {e}");
							}
							metrics::counter!("tickfeed_heartbeats_sent_total").increment(1);
						}
						FrameAction::HandshakeAck { session_id } => {
							*shared.session_id.lock() = Some(session_id.clone());
							let _ = signals.send(SessionSignal::HandshakeAcked { generation, session_id });
						}
						FrameAction::None => {}
					},

					Message::Ping(p) => {
						let _ = ws.send(Message::Pong(p)).await;
					}

					Message::Close(frame) => {
						break format!("closed by server: {frame:?}");
					}

					_ => {}
				}
			}
		}
	};

	relay.info(format!("chat socket closed (generation={generation}): {reason}"));
	closed(reason);
}

#[cfg(test)]
pub(crate) mod tests_support {
	use super::*;

	/// An open session with a session id and no task behind it.
	pub(crate) fn shared_for_test(
		generation: u64,
		chat_channel_id: &str,
	) -> (Arc<SessionShared>, mpsc::UnboundedReceiver<String>) {
		let (tx, rx) = mpsc::unbounded_channel();
		let shared = Arc::new(SessionShared {
			generation,
			chat_channel_id: chat_channel_id.to_string(),
			next_tid: AtomicU64::new(1),
			open: AtomicBool::new(true),
			session_id: Mutex::new(Some("S-test".to_string())),
			outbound: tx,
		});
		(shared, rx)
	}
}

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tickfeed_domain::{ChannelId, ChatChannelId, ChatEvent, DonationEvent};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::SecretString;
use crate::config::ClientConfig;
use crate::decoder::{DecodeCounters, FrameDecoder};
use crate::heartbeat::HeartbeatSender;
use crate::queue::IngressSender;
use crate::relay::LogRelay;
use crate::resolver::{AccessTokens, ChannelResolver, ResolveError};
use crate::retry::{ReconnectReason, RetryPlan, RetryPolicy, RetryScheduler};
use crate::socket::{SessionParams, SocketHandle, WsConnector, default_connector};

pub mod status {
	pub const IDLE: &str = "Idle";
	pub const CONNECTING: &str = "Connecting";
	pub const CONNECTED: &str = "Connected";
	pub const DISCONNECTED: &str = "Disconnected";
	pub const INVALID_INPUT: &str = "Disconnected: invalid input";
	pub const NOT_LIVE: &str = "Disconnected: stream not live";
	pub const LIVE_STATUS_FAILED: &str = "Disconnected: live status unavailable";
	pub const TOKEN_FAILED: &str = "Disconnected: token fetch failed";
	pub const BAD_CHAT_URL: &str = "Disconnected: invalid chat server url";
	pub const RECONNECT_DISABLED: &str = "Disconnected: reconnect disabled";
}

/// `5s` for whole seconds, `50ms` below one second, `1.5s` otherwise.
fn fmt_delay(d: Duration) -> String {
	if d < Duration::from_secs(1) {
		format!("{}ms", d.as_millis())
	} else if d.subsec_millis() == 0 {
		format!("{}s", d.as_secs())
	} else {
		format!("{:.1}s", d.as_secs_f32())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Phase {
	#[default]
	Disconnected = 0,
	ResolvingChannel = 1,
	ResolvingLiveChat = 2,
	FetchingToken = 3,
	SocketConnecting = 4,
	HandshakeSent = 5,
	Connected = 6,
}

impl Phase {
	pub fn as_str(self) -> &'static str {
		match self {
			Phase::Disconnected => "disconnected",
			Phase::ResolvingChannel => "resolving_channel",
			Phase::ResolvingLiveChat => "resolving_live_chat",
			Phase::FetchingToken => "fetching_token",
			Phase::SocketConnecting => "socket_connecting",
			Phase::HandshakeSent => "handshake_sent",
			Phase::Connected => "connected",
		}
	}

	fn from_u8(v: u8) -> Self {
		match v {
			1 => Phase::ResolvingChannel,
			2 => Phase::ResolvingLiveChat,
			3 => Phase::FetchingToken,
			4 => Phase::SocketConnecting,
			5 => Phase::HandshakeSent,
			6 => Phase::Connected,
			_ => Phase::Disconnected,
		}
	}
}

impl fmt::Display for Phase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Lock-free mirror of the phase for background readers. Written only by the consumer.
#[derive(Debug, Default)]
pub struct PhaseCell(AtomicU8);

impl PhaseCell {
	pub fn new(phase: Phase) -> Self {
		Self(AtomicU8::new(phase as u8))
	}

	pub fn load(&self) -> Phase {
		Phase::from_u8(self.0.load(Ordering::Acquire))
	}

	pub fn store(&self, phase: Phase) {
		self.0.store(phase as u8, Ordering::Release);
	}
}

/// Results of asynchronous steps, delivered to the consumer in order.
///
/// Every signal carries the generation of the connection attempt that produced it;
/// the manager ignores anything from an older attempt.
#[derive(Debug)]
pub enum SessionSignal {
	ChannelResolved {
		generation: u64,
		result: Result<ChannelId, ResolveError>,
	},
	LiveChatResolved {
		generation: u64,
		result: Result<ChatChannelId, ResolveError>,
	},
	TokenFetched {
		generation: u64,
		result: Result<AccessTokens, ResolveError>,
	},
	SocketOpened {
		generation: u64,
	},
	HandshakeAcked {
		generation: u64,
		session_id: String,
	},
	SocketClosed {
		generation: u64,
		reason: String,
	},
	WatchResolved {
		generation: u64,
		result: Result<ChatChannelId, ResolveError>,
	},
}

impl SessionSignal {
	pub fn generation(&self) -> u64 {
		match self {
			SessionSignal::ChannelResolved { generation, .. }
			| SessionSignal::LiveChatResolved { generation, .. }
			| SessionSignal::TokenFetched { generation, .. }
			| SessionSignal::SocketOpened { generation }
			| SessionSignal::HandshakeAcked { generation, .. }
			| SessionSignal::SocketClosed { generation, .. }
			| SessionSignal::WatchResolved { generation, .. } => *generation,
		}
	}
}

/// Everything that belongs to one connection attempt. Reset as a whole.
#[derive(Default)]
pub struct ConnectionState {
	/// 0 while idle.
	pub generation: u64,
	pub attempt_id: Option<Uuid>,
	pub phase: Phase,
	pub channel_id: Option<ChannelId>,
	pub chat_channel_id: Option<ChatChannelId>,
	pub access_token: Option<SecretString>,
	pub extra_token: Option<SecretString>,
	pub session_id: Option<String>,
	pub handshake_sent: bool,
	/// Owns the outgoing sequence counter.
	pub socket: Option<SocketHandle>,
}

/// Drives the connect pipeline and the handshake state machine.
///
/// Lives on the consumer thread. Pipeline steps run on the runtime and report back
/// through [`SessionSignal`]s, so no method here ever waits on the network.
pub struct ConnectionManager {
	handle: Handle,
	cfg: ClientConfig,
	resolver: Arc<dyn ChannelResolver>,
	connector: WsConnector,
	source_url: String,
	state: ConnectionState,
	generation_seq: u64,
	phase: Arc<PhaseCell>,
	signals_tx: mpsc::UnboundedSender<SessionSignal>,
	signals_rx: mpsc::UnboundedReceiver<SessionSignal>,
	heartbeat: HeartbeatSender,
	retry: RetryScheduler,
	reconnect_enabled: bool,
	user_disconnected: bool,
	/// Last attempt ended in a retryable failure and nothing is in flight.
	retry_pending: bool,
	relay: Arc<LogRelay>,
	chat_tx: IngressSender<ChatEvent>,
	donation_tx: IngressSender<DonationEvent>,
	counters: Arc<DecodeCounters>,
	status: String,
}

impl ConnectionManager {
	pub fn new(
		handle: Handle,
		cfg: ClientConfig,
		resolver: Arc<dyn ChannelResolver>,
		relay: Arc<LogRelay>,
		chat_tx: IngressSender<ChatEvent>,
		donation_tx: IngressSender<DonationEvent>,
	) -> Self {
		let (signals_tx, signals_rx) = mpsc::unbounded_channel();
		let connector = cfg.ws_connector.clone().unwrap_or_else(default_connector);
		let retry = RetryScheduler::new(
			handle.clone(),
			RetryPolicy {
				fast_max_attempts: cfg.fast_retry_max_attempts,
				fast_delay: cfg.fast_retry_delay,
				slow_interval: cfg.slow_retry_interval,
				watch_interval: cfg.channel_watch_interval,
			},
		);

		Self {
			handle,
			cfg,
			resolver,
			connector,
			source_url: String::new(),
			state: ConnectionState::default(),
			generation_seq: 0,
			phase: Arc::new(PhaseCell::new(Phase::Disconnected)),
			signals_tx,
			signals_rx,
			heartbeat: HeartbeatSender::new(),
			retry,
			reconnect_enabled: true,
			user_disconnected: true,
			retry_pending: false,
			relay,
			chat_tx,
			donation_tx,
			counters: Arc::new(DecodeCounters::default()),
			status: status::IDLE.to_string(),
		}
	}

	pub fn set_source_url(&mut self, source_url: impl Into<String>) {
		self.source_url = source_url.into();
	}

	pub fn source_url(&self) -> &str {
		&self.source_url
	}

	pub fn phase(&self) -> Phase {
		self.state.phase
	}

	pub fn state(&self) -> &ConnectionState {
		&self.state
	}

	pub fn status(&self) -> &str {
		&self.status
	}

	pub fn session_id(&self) -> Option<&str> {
		self.state.session_id.as_deref()
	}

	pub fn counters(&self) -> &Arc<DecodeCounters> {
		&self.counters
	}

	pub fn retry(&self) -> &RetryScheduler {
		&self.retry
	}

	pub fn heartbeat_running(&self) -> bool {
		self.heartbeat.is_running()
	}

	fn set_phase(&mut self, phase: Phase) {
		self.state.phase = phase;
		self.phase.store(phase);
	}

	fn set_status(&mut self, status: impl Into<String>) {
		self.status = status.into();
	}

	fn sync_disabled_flag(&self) {
		self.retry
			.flags()
			.set_disabled(self.user_disconnected || !self.reconnect_enabled);
	}

	/// Explicit connect from the user: clears the disabled flag and restarts every timer and counter.
	pub fn user_connect(&mut self) {
		self.user_disconnected = false;
		self.retry.reset();
		self.sync_disabled_flag();
		self.connect();
	}

	/// Explicit disconnect from the user: nothing reconnects until the next `user_connect`.
	pub fn user_disconnect(&mut self) {
		self.user_disconnected = true;
		self.retry_pending = false;
		self.sync_disabled_flag();
		self.retry.reset();
		self.disconnect();
		self.set_status(status::DISCONNECTED);
		info!("disconnected by user");
	}

	pub fn set_reconnect_enabled(&mut self, enabled: bool) {
		self.reconnect_enabled = enabled;
		self.sync_disabled_flag();
		if !enabled {
			self.retry.stop_retries();
			self.retry.flags().clear_requests();
			if self.retry_pending {
				self.set_status(status::RECONNECT_DISABLED);
			}
		} else if !self.user_disconnected && self.retry_pending && self.state.phase == Phase::Disconnected {
			self.retry.arm_slow();
			let every = fmt_delay(self.cfg.slow_retry_interval);
			self.set_status(format!("Reconnecting every {every}"));
		}
		info!(enabled, "reconnect setting changed");
	}

	/// Start the pipeline from scratch. Returns immediately.
	pub fn connect(&mut self) {
		self.disconnect();
		self.retry_pending = false;

		self.generation_seq += 1;
		let generation = self.generation_seq;
		let attempt_id = Uuid::new_v4();
		self.state.generation = generation;
		self.state.attempt_id = Some(attempt_id);
		self.set_phase(Phase::ResolvingChannel);
		self.set_status(status::CONNECTING);
		info!(generation, %attempt_id, source = %self.source_url, "connecting");

		let resolver = self.resolver.clone();
		let tx = self.signals_tx.clone();
		let source = self.source_url.clone();
		self.handle.spawn(async move {
			let result = resolver.resolve_channel_id(&source).await;
			let _ = tx.send(SessionSignal::ChannelResolved { generation, result });
		});
	}

	/// Stop heartbeat and watch, close the socket, clear the session. Safe from any state.
	pub fn disconnect(&mut self) {
		self.heartbeat.stop();
		self.retry.stop_watch();
		if let Some(socket) = self.state.socket.take() {
			socket.close();
		}
		self.state = ConnectionState::default();
		self.set_phase(Phase::Disconnected);
	}

	/// Drop the per-session fields but keep the attempt (generation, ids, watch).
	fn teardown_session(&mut self) {
		self.heartbeat.stop();
		if let Some(socket) = self.state.socket.take() {
			socket.close();
		}
		self.state.access_token = None;
		self.state.extra_token = None;
		self.state.session_id = None;
		self.state.handshake_sent = false;
		self.set_phase(Phase::Disconnected);
	}

	/// Unexpected loss of the socket. Hands over to the retry ladder.
	pub fn on_disconnected(&mut self, reason: &str) {
		warn!(reason, generation = self.state.generation, "chat connection lost");
		self.teardown_session();
		self.retry.stop_watch();
		self.retry_pending = true;

		let status = match self.retry.schedule_after_disconnect() {
			Some(RetryPlan::Fast { attempt, max, delay }) => {
				format!("Reconnecting in {} (attempt {attempt}/{max})", fmt_delay(delay))
			}
			Some(RetryPlan::Slow { interval }) => format!("Reconnecting every {}", fmt_delay(interval)),
			None => status::DISCONNECTED.to_string(),
		};
		self.set_status(status);
	}

	/// Apply every signal that has arrived since the last call.
	pub fn apply_signals(&mut self) -> usize {
		let mut n = 0;
		while let Ok(signal) = self.signals_rx.try_recv() {
			self.apply_signal(signal);
			n += 1;
		}
		n
	}

	pub fn apply_signal(&mut self, signal: SessionSignal) {
		let generation = signal.generation();
		if generation == 0 || generation != self.state.generation {
			debug!(generation, current = self.state.generation, "ignoring stale session signal");
			return;
		}

		match signal {
			SessionSignal::ChannelResolved { result, .. } => match result {
				Ok(channel) => {
					info!(%channel, "channel resolved");
					self.state.channel_id = Some(channel.clone());
					self.set_phase(Phase::ResolvingLiveChat);
					self.spawn_live_chat_resolve(channel, false);
				}
				Err(e) => {
					warn!(error = %e, source = %self.source_url, "channel resolution failed");
					self.disconnect();
					self.set_status(status::INVALID_INPUT);
				}
			},

			SessionSignal::LiveChatResolved { result, .. } => match result {
				Ok(chat_channel) => {
					info!(%chat_channel, "live chat channel resolved");
					self.state.chat_channel_id = Some(chat_channel.clone());
					self.retry.set_baseline(chat_channel.clone());
					self.retry.start_watch();
					self.set_phase(Phase::FetchingToken);
					self.spawn_token_fetch(chat_channel);
				}
				Err(e) => {
					warn!(error = %e, "live chat resolution failed");
					let failed = match e {
						ResolveError::NotLive(_) => status::NOT_LIVE,
						_ => status::LIVE_STATUS_FAILED,
					};
					self.disconnect();
					self.set_status(failed);
					self.retry_pending = true;
					if !self.retry.flags().is_disabled() {
						self.retry.arm_slow();
						let every = fmt_delay(self.cfg.slow_retry_interval);
						self.set_status(format!("Waiting for stream (retry every {every})"));
					}
				}
			},

			SessionSignal::TokenFetched { result, .. } => match result {
				Ok(tokens) => self.open_socket(tokens),
				Err(e) => {
					warn!(error = %e, "access token fetch failed");
					self.teardown_session();
					self.set_status(status::TOKEN_FAILED);
					self.retry_pending = true;
				}
			},

			SessionSignal::SocketOpened { .. } => {
				if self.state.phase == Phase::SocketConnecting {
					self.state.handshake_sent = true;
					self.set_phase(Phase::HandshakeSent);
				}
			}

			SessionSignal::HandshakeAcked { session_id, .. } => self.on_handshake_ack(session_id),

			SessionSignal::SocketClosed { reason, .. } => {
				if self.state.socket.is_some() {
					self.on_disconnected(&reason);
				}
			}

			SessionSignal::WatchResolved { result, .. } => {
				self.apply_watch_result(result);
			}
		}
	}

	fn spawn_live_chat_resolve(&self, channel: ChannelId, watch: bool) {
		let generation = self.state.generation;
		let resolver = self.resolver.clone();
		let tx = self.signals_tx.clone();
		self.handle.spawn(async move {
			let result = resolver.resolve_live_chat_channel_id(&channel).await;
			let signal = if watch {
				SessionSignal::WatchResolved { generation, result }
			} else {
				SessionSignal::LiveChatResolved { generation, result }
			};
			let _ = tx.send(signal);
		});
	}

	fn spawn_token_fetch(&self, chat_channel: ChatChannelId) {
		let generation = self.state.generation;
		let resolver = self.resolver.clone();
		let tx = self.signals_tx.clone();
		self.handle.spawn(async move {
			let result = resolver.fetch_access_token(&chat_channel).await;
			let _ = tx.send(SessionSignal::TokenFetched { generation, result });
		});
	}

	fn open_socket(&mut self, tokens: AccessTokens) {
		let Some(chat_channel) = self.state.chat_channel_id.clone() else {
			warn!("token arrived without a chat channel; dropping");
			return;
		};

		let raw_url = self.cfg.ws_url_for(chat_channel.as_str());
		let url = match Url::parse(&raw_url) {
			Ok(u) => u,
			Err(e) => {
				warn!(error = %e, url = %raw_url, "invalid chat server url");
				self.disconnect();
				self.set_status(status::BAD_CHAT_URL);
				return;
			}
		};

		self.state.access_token = Some(tokens.access_token.clone());
		self.state.extra_token = tokens.extra_token.clone();

		let decoder = FrameDecoder::new(
			chat_channel.as_str(),
			self.chat_tx.clone(),
			self.donation_tx.clone(),
			self.counters.clone(),
			self.relay.clone(),
			self.cfg.max_frame_bytes,
			self.cfg.parse_error_log_every,
		);

		let params = SessionParams {
			generation: self.state.generation,
			url,
			chat_channel_id: chat_channel.into_string(),
			tokens,
			wire: self.cfg.wire.clone(),
			connector: self.connector.clone(),
			decoder,
			signals: self.signals_tx.clone(),
			relay: self.relay.clone(),
		};

		self.set_phase(Phase::SocketConnecting);
		self.state.socket = Some(SocketHandle::spawn(&self.handle, params));
	}

	fn on_handshake_ack(&mut self, session_id: String) {
		let Some(shared) = self.state.socket.as_ref().map(|s| s.shared().clone()) else {
			return;
		};

		self.state.session_id = Some(session_id.clone());
		self.retry_pending = false;
		self.counters.reset();
		self.retry.on_connected();
		self.set_phase(Phase::Connected);
		self.heartbeat.start(
			&self.handle,
			self.cfg.heartbeat_interval,
			self.phase.clone(),
			shared,
			self.cfg.wire.clone(),
			self.relay.clone(),
		);
		self.set_status(status::CONNECTED);
		info!(session_id = %session_id, generation = self.state.generation, "chat session established");
	}

	/// Tick step: act on a pending reconnect request.
	pub fn handle_reconnect_request(&mut self) -> Option<ReconnectReason> {
		let reason = self.retry.flags().take_reconnect()?;
		if self.retry.flags().is_disabled() {
			return None;
		}
		if reason.is_retry() && self.state.phase == Phase::Connected {
			debug!(%reason, "retry fired after reconnect; ignoring");
			return None;
		}

		metrics::counter!("tickfeed_reconnect_requests_total", "reason" => reason.label()).increment(1);
		info!(%reason, "reconnecting");
		self.connect();
		Some(reason)
	}

	/// Tick step: start a channel-watch check if the timer asked for one.
	pub fn handle_watch_request(&mut self) -> bool {
		if !self.retry.flags().take_watch() || self.retry.flags().is_disabled() {
			return false;
		}
		self.start_watch_check()
	}

	fn start_watch_check(&mut self) -> bool {
		if self.state.generation == 0 {
			return false;
		}
		let Some(channel) = self.state.channel_id.clone() else {
			return false;
		};
		self.spawn_live_chat_resolve(channel, true);
		true
	}

	/// Compare a watch re-resolve with the baseline and request a reconnect if needed.
	pub fn apply_watch_result(&mut self, result: Result<ChatChannelId, ResolveError>) -> Option<ReconnectReason> {
		let current = match result {
			Ok(id) => id,
			Err(e) => {
				debug!(error = %e, "channel watch re-resolve failed");
				return None;
			}
		};

		let reason = match self.retry.baseline().cloned() {
			None => {
				self.retry.set_baseline(current);
				return None;
			}
			Some(baseline) if baseline != current => {
				info!(old = %baseline, new = %current, "chat channel rotated");
				self.retry.set_baseline(current);
				ReconnectReason::ChannelChanged
			}
			Some(_) if self.state.phase != Phase::Connected => ReconnectReason::NotConnected,
			Some(_) => return None,
		};

		self.retry.flags().request_reconnect(reason);
		Some(reason)
	}

	/// Tear everything down for good (client drop).
	pub fn shutdown(&mut self) {
		self.retry.reset();
		self.disconnect();
	}
}

#[cfg(test)]
mod tests {

	use async_trait::async_trait;
	use parking_lot::Mutex;

	use super::*;
	use crate::queue::ingress_queue;

	#[derive(Default)]
	struct ScriptedResolver {
		live: Mutex<Vec<Result<ChatChannelId, ResolveError>>>,
		token: Mutex<Option<Result<AccessTokens, ResolveError>>>,
	}

	fn chat(id: &str) -> ChatChannelId {
		ChatChannelId::new(id).expect("chat channel id")
	}

	#[async_trait]
	impl ChannelResolver for ScriptedResolver {
		async fn resolve_channel_id(&self, source: &str) -> Result<ChannelId, ResolveError> {
			if source.is_empty() {
				return Err(ResolveError::InvalidInput("empty".into()));
			}
			ChannelId::new(source).map_err(|e| ResolveError::InvalidInput(e.to_string()))
		}

		async fn resolve_live_chat_channel_id(&self, _channel: &ChannelId) -> Result<ChatChannelId, ResolveError> {
			let mut live = self.live.lock();
			if live.len() > 1 {
				live.remove(0)
			} else {
				live.first().cloned().unwrap_or(Ok(chat("N1")))
			}
		}

		async fn fetch_access_token(&self, _chat: &ChatChannelId) -> Result<AccessTokens, ResolveError> {
			self.token.lock().clone().unwrap_or(Err(ResolveError::Token("scripted".into())))
		}
	}

	fn manager(resolver: Arc<ScriptedResolver>) -> ConnectionManager {
		let relay = Arc::new(LogRelay::new(256));
		let (chat_tx, _chat_rx) = ingress_queue("chat", 16, 100, relay.clone());
		let (donation_tx, _donation_rx) = ingress_queue("donation", 16, 100, relay.clone());
		let cfg = ClientConfig {
			ws_url: "ws://127.0.0.1:9/chat".to_string(),
			..ClientConfig::default()
		};
		ConnectionManager::new(Handle::current(), cfg, resolver, relay, chat_tx, donation_tx)
	}

	async fn pump_until(m: &mut ConnectionManager, mut done: impl FnMut(&ConnectionManager) -> bool) {
		tokio::time::timeout(Duration::from_secs(2), async {
			loop {
				m.apply_signals();
				if done(m) {
					return;
				}
				tokio::time::sleep(Duration::from_millis(5)).await;
			}
		})
		.await
		.expect("condition reached within timeout");
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn invalid_input_schedules_nothing() {
		let mut m = manager(Arc::new(ScriptedResolver::default()));
		m.set_source_url("");
		m.user_connect();
		assert_eq!(m.status(), status::CONNECTING);

		pump_until(&mut m, |m| m.status() == status::INVALID_INPUT).await;
		assert_eq!(m.phase(), Phase::Disconnected);
		assert!(!m.retry().is_slow_armed());
		assert!(!m.retry().is_fast_armed());
		assert!(!m.retry().is_watch_armed());
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn not_live_arms_slow_loop() {
		let resolver = Arc::new(ScriptedResolver::default());
		resolver.live.lock().push(Err(ResolveError::NotLive("offline".into())));
		let mut m = manager(resolver);
		m.set_source_url("chan");
		m.user_connect();

		pump_until(&mut m, |m| m.retry().is_slow_armed()).await;
		assert_eq!(m.phase(), Phase::Disconnected);
		assert_eq!(m.status(), "Waiting for stream (retry every 30s)");
		assert_eq!(m.retry().state().fast_attempts, 0);
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn token_failure_keeps_watch_but_arms_no_retry() {
		let mut m = manager(Arc::new(ScriptedResolver::default()));
		m.set_source_url("chan");
		m.user_connect();

		pump_until(&mut m, |m| m.status() == status::TOKEN_FAILED).await;
		assert_eq!(m.phase(), Phase::Disconnected);
		assert!(m.retry().is_watch_armed());
		assert!(!m.retry().is_slow_armed());
		assert!(!m.retry().is_fast_armed());
		assert_eq!(m.retry().baseline(), Some(&chat("N1")));
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn stale_signals_are_ignored() {
		let mut m = manager(Arc::new(ScriptedResolver::default()));
		m.set_source_url("chan");
		m.user_connect();
		let first = m.state().generation;
		m.user_disconnect();

		m.apply_signal(SessionSignal::ChannelResolved {
			generation: first,
			result: Ok(ChannelId::new("chan").expect("id")),
		});
		m.apply_signal(SessionSignal::SocketClosed {
			generation: first,
			reason: "late".into(),
		});
		assert_eq!(m.phase(), Phase::Disconnected);
		assert_eq!(m.status(), status::DISCONNECTED);
		assert!(!m.retry().is_fast_armed());
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn ladder_moves_to_slow_after_three_losses() {
		let mut m = manager(Arc::new(ScriptedResolver::default()));
		m.user_disconnected = false;
		m.sync_disabled_flag();
		m.state.generation = 1;

		m.on_disconnected("boom");
		assert_eq!(m.status(), "Reconnecting in 5s (attempt 1/3)");
		m.on_disconnected("boom");
		m.on_disconnected("boom");
		assert_eq!(m.status(), "Reconnecting in 5s (attempt 3/3)");
		m.on_disconnected("boom");
		assert_eq!(m.status(), "Reconnecting every 30s");
		assert!(m.retry().is_slow_armed());
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn user_disconnect_disables_ladder() {
		let mut m = manager(Arc::new(ScriptedResolver::default()));
		m.user_disconnect();
		m.state.generation = 1;
		m.on_disconnected("boom");
		assert_eq!(m.status(), status::DISCONNECTED);
		assert!(!m.retry().is_fast_armed());
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn watch_requests_once_per_rotation() {
		let mut m = manager(Arc::new(ScriptedResolver::default()));
		m.user_disconnected = false;
		m.sync_disabled_flag();
		m.state.generation = 1;
		m.set_phase(Phase::Connected);
		m.retry.set_baseline(chat("N1"));

		assert_eq!(m.apply_watch_result(Ok(chat("N1"))), None);
		assert_eq!(m.apply_watch_result(Ok(chat("N2"))), Some(ReconnectReason::ChannelChanged));
		assert_eq!(m.retry().baseline(), Some(&chat("N2")));
		assert_eq!(m.apply_watch_result(Ok(chat("N2"))), None);
		assert_eq!(m.retry().flags().take_reconnect(), Some(ReconnectReason::ChannelChanged));
		assert_eq!(m.retry().flags().take_reconnect(), None);

		assert_eq!(m.apply_watch_result(Err(ResolveError::Http("503".into()))), None);
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn watch_detects_dead_session() {
		let mut m = manager(Arc::new(ScriptedResolver::default()));
		m.user_disconnected = false;
		m.sync_disabled_flag();
		m.state.generation = 1;
		m.retry.set_baseline(chat("N1"));

		assert_eq!(m.apply_watch_result(Ok(chat("N1"))), Some(ReconnectReason::NotConnected));
		assert_eq!(m.handle_reconnect_request(), Some(ReconnectReason::NotConnected));
		assert_eq!(m.phase(), Phase::ResolvingChannel);
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn stale_retry_is_ignored_when_connected() {
		let mut m = manager(Arc::new(ScriptedResolver::default()));
		m.user_disconnected = false;
		m.sync_disabled_flag();
		m.state.generation = 1;
		m.set_phase(Phase::Connected);

		m.retry().flags().request_reconnect(ReconnectReason::SlowRetry);
		assert_eq!(m.handle_reconnect_request(), None);
		assert_eq!(m.phase(), Phase::Connected);
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn reenabling_after_not_live_rearms_slow_loop() {
		let resolver = Arc::new(ScriptedResolver::default());
		resolver.live.lock().push(Err(ResolveError::NotLive("offline".into())));
		let mut m = manager(resolver);
		m.set_source_url("chan");
		m.user_connect();
		pump_until(&mut m, |m| m.retry().is_slow_armed()).await;

		m.set_reconnect_enabled(false);
		assert!(!m.retry().is_slow_armed());
		assert_eq!(m.status(), status::RECONNECT_DISABLED);

		m.set_reconnect_enabled(true);
		assert!(m.retry().is_slow_armed());
		assert_eq!(m.status(), "Reconnecting every 30s");
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn reenabling_while_idle_arms_nothing() {
		let mut m = manager(Arc::new(ScriptedResolver::default()));
		m.user_disconnected = false;
		m.sync_disabled_flag();

		m.set_reconnect_enabled(false);
		assert_eq!(m.status(), status::IDLE);
		m.set_reconnect_enabled(true);
		assert!(!m.retry().is_slow_armed());
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn reenabling_after_disabled_loss_rearms_slow_loop() {
		let mut m = manager(Arc::new(ScriptedResolver::default()));
		m.user_disconnected = false;
		m.set_reconnect_enabled(false);
		m.state.generation = 1;

		m.on_disconnected("boom");
		assert_eq!(m.status(), status::DISCONNECTED);
		assert!(!m.retry().is_fast_armed());

		m.set_reconnect_enabled(true);
		assert!(m.retry().is_slow_armed());
	}

	#[test]
	fn delays_render_below_one_second() {
		assert_eq!(fmt_delay(Duration::from_secs(5)), "5s");
		assert_eq!(fmt_delay(Duration::from_millis(50)), "50ms");
		assert_eq!(fmt_delay(Duration::from_millis(1500)), "1.5s");
	}

	#[test]
	fn phase_cell_mirrors_phase() {
		let cell = PhaseCell::new(Phase::Disconnected);
		cell.store(Phase::HandshakeSent);
		assert_eq!(cell.load(), Phase::HandshakeSent);
		assert_eq!(Phase::Connected.to_string(), "connected");
	}
}

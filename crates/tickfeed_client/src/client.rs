#![forbid(unsafe_code)]

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use anyhow::Context;
use tickfeed_util::time::unix_ms_now;
use tokio::runtime::{Handle, Runtime};
use tracing::warn;

use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, Phase};
use crate::dedup::DedupFilter;
use crate::pump::{DrainReport, TickPump};
use crate::queue::ingress_queue;
use crate::relay::LogRelay;
use crate::resolver::ChannelResolver;
use crate::{ClientStats, DownstreamSink};

/// Tick-driven ingestion client.
///
/// Network I/O and timers run on a tokio runtime; all state changes and every sink
/// callback happen inside [`IngestClient::tick`], on the caller's thread.
pub struct IngestClient {
	manager: ConnectionManager,
	pump: TickPump,
	relay: Arc<LogRelay>,
	sink: Box<dyn DownstreamSink>,
	notified_status: Option<String>,
	// Dropped last so the fields above can still abort their tasks.
	runtime: Option<Runtime>,
}

impl IngestClient {
	/// Build with a dedicated background runtime.
	///
	/// Must not be dropped from inside an async context.
	pub fn new(
		cfg: ClientConfig,
		resolver: Arc<dyn ChannelResolver>,
		sink: Box<dyn DownstreamSink>,
	) -> anyhow::Result<Self> {
		let runtime = tokio::runtime::Builder::new_multi_thread()
			.worker_threads(2)
			.thread_name("tickfeed-net")
			.enable_all()
			.build()
			.context("build tickfeed runtime")?;
		let mut client = Self::with_handle(runtime.handle().clone(), cfg, resolver, sink);
		client.runtime = Some(runtime);
		Ok(client)
	}

	/// Build on an existing runtime.
	pub fn with_handle(
		handle: Handle,
		cfg: ClientConfig,
		resolver: Arc<dyn ChannelResolver>,
		sink: Box<dyn DownstreamSink>,
	) -> Self {
		let relay = Arc::new(LogRelay::new(cfg.log_relay_capacity));
		let (chat_tx, chat_rx) = ingress_queue("chat", cfg.queue_capacity, cfg.drop_log_every, relay.clone());
		let (donation_tx, donation_rx) =
			ingress_queue("donation", cfg.queue_capacity, cfg.drop_log_every, relay.clone());

		let dedup = DedupFilter::new(cfg.dedup_ttl.as_millis() as i64, cfg.dedup_cleanup_threshold);
		let pump = TickPump::new(chat_rx, donation_rx, dedup, cfg.tick_budget);
		let manager = ConnectionManager::new(handle, cfg, resolver, relay.clone(), chat_tx, donation_tx);

		Self {
			manager,
			pump,
			relay,
			sink,
			notified_status: None,
			runtime: None,
		}
	}

	pub fn set_source_url(&mut self, source_url: impl Into<String>) {
		self.manager.set_source_url(source_url);
	}

	/// User-initiated connect. Returns immediately.
	pub fn connect(&mut self) {
		self.manager.user_connect();
	}

	/// User-initiated disconnect. Suppresses every retry until the next `connect`.
	pub fn disconnect(&mut self) {
		self.manager.user_disconnect();
	}

	pub fn set_reconnect_enabled(&mut self, enabled: bool) {
		self.manager.set_reconnect_enabled(enabled);
	}

	pub fn tick(&mut self) -> DrainReport {
		self.tick_at(unix_ms_now())
	}

	/// One host tick at `now_ms`.
	pub fn tick_at(&mut self, now_ms: i64) -> DrainReport {
		self.flush_logs();

		self.manager.apply_signals();
		self.manager.handle_reconnect_request();
		self.manager.handle_watch_request();

		let report = self.pump.drain(now_ms, self.sink.as_mut());
		self.pump.cleanup(now_ms);

		self.notify_status();
		report
	}

	fn flush_logs(&mut self) {
		for line in self.relay.drain() {
			if catch_unwind(AssertUnwindSafe(|| self.sink.on_log(&line))).is_err() {
				line.emit();
			}
		}
	}

	fn notify_status(&mut self) {
		if self.notified_status.as_deref() == Some(self.manager.status()) {
			return;
		}
		let status = self.manager.status().to_string();
		if catch_unwind(AssertUnwindSafe(|| self.sink.on_status(&status))).is_err() {
			warn!(%status, "downstream sink panicked in on_status");
		}
		self.notified_status = Some(status);
	}

	pub fn status(&self) -> &str {
		self.manager.status()
	}

	pub fn phase(&self) -> Phase {
		self.manager.phase()
	}

	pub fn session_id(&self) -> Option<&str> {
		self.manager.session_id()
	}

	pub fn stats(&self) -> ClientStats {
		ClientStats {
			phase: self.manager.phase(),
			chat_dropped: self.pump.chat_dropped(),
			donation_dropped: self.pump.donation_dropped(),
			decode_errors: self.manager.counters().parse_errors(),
			nested_decode_errors: self.manager.counters().nested_errors(),
			dedup_suppressed: self.pump.suppressed_total(),
			forwarded: self.pump.forwarded_total(),
			sink_panics: self.pump.sink_panics_total(),
			fast_retry_attempts: self.manager.retry().state().fast_attempts,
			log_lines_dropped: self.relay.dropped(),
		}
	}
}

impl Drop for IngestClient {
	fn drop(&mut self) {
		self.manager.shutdown();
	}
}

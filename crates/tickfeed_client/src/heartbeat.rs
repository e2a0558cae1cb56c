#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tickfeed_protocol::WireProfile;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use crate::connection::{Phase, PhaseCell};
use crate::relay::LogRelay;
use crate::socket::SessionShared;

/// Proactive heartbeats go out only on a fully established, open session.
pub fn should_send(phase: Phase, has_session: bool, socket_open: bool) -> bool {
	phase == Phase::Connected && has_session && socket_open
}

/// Lifecycle of the local heartbeat timer.
#[derive(Default)]
pub struct HeartbeatSender {
	task: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatSender {
	pub fn new() -> Self {
		Self::default()
	}

	/// (Re)start the timer for `session`. The first beat fires one `every` from now.
	pub fn start(
		&self,
		handle: &Handle,
		every: Duration,
		phase: Arc<PhaseCell>,
		session: Arc<SessionShared>,
		wire: WireProfile,
		relay: Arc<LogRelay>,
	) {
		let task = handle.spawn(async move {
			let mut ticker = interval_at(Instant::now() + every, every);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
			loop {
				ticker.tick().await;
				if !should_send(phase.load(), session.has_session(), session.is_open()) {
					relay.debug(format!(
						"heartbeat skipped (generation={}, phase={})",
						session.generation(),
						phase.load()
					));
					continue;
				}
				if !session.queue_heartbeat(&wire) {
					relay.debug("heartbeat not queued; socket closing");
				}
			}
		});

		if let Some(old) = self.task.lock().replace(task) {
			old.abort();
		}
	}

	pub fn stop(&self) {
		if let Some(task) = self.task.lock().take() {
			task.abort();
		}
	}

	pub fn is_running(&self) -> bool {
		self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
	}
}

impl Drop for HeartbeatSender {
	fn drop(&mut self) {
		self.stop();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn gate_requires_connected_session_and_open_socket() {
		assert!(should_send(Phase::Connected, true, true));
		assert!(!should_send(Phase::Connected, false, true));
		assert!(!should_send(Phase::Connected, true, false));
		assert!(!should_send(Phase::HandshakeSent, true, true));
		assert!(!should_send(Phase::Disconnected, true, true));
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn start_replaces_and_stop_aborts() {
		let sender = HeartbeatSender::new();
		let handle = Handle::current();
		let (session, _rx) = crate::socket::tests_support::shared_for_test(1, "N1abc");
		let phase = Arc::new(PhaseCell::new(Phase::Connected));
		let relay = Arc::new(LogRelay::new(16));

		sender.start(
			&handle,
			Duration::from_secs(60),
			phase.clone(),
			session.clone(),
			WireProfile::default(),
			relay.clone(),
		);
		assert!(sender.is_running());
		sender.start(&handle, Duration::from_secs(60), phase, session, WireProfile::default(), relay);
		assert!(sender.is_running());

		sender.stop();
		assert!(!sender.is_running());
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn beats_only_while_connected() {
		let sender = HeartbeatSender::new();
		let (session, mut rx) = crate::socket::tests_support::shared_for_test(1, "N1abc");
		let phase = Arc::new(PhaseCell::new(Phase::HandshakeSent));
		let relay = Arc::new(LogRelay::new(64));

		sender.start(
			&Handle::current(),
			Duration::from_millis(20),
			phase.clone(),
			session,
			WireProfile::default(),
			relay,
		);

		let early = tokio::time::timeout(Duration::from_millis(80), rx.recv()).await;
		assert!(early.is_err(), "no heartbeat before Connected");

		phase.store(Phase::Connected);
		let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
			.await
			.expect("heartbeat within timeout")
			.expect("frame");
		assert!(frame.contains("\"cmd\":10000"));
		sender.stop();
	}
}

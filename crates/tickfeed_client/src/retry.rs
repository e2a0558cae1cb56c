#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tickfeed_domain::ChatChannelId;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};

/// Why a reconnect was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectReason {
	FastRetry { attempt: u32 },
	SlowRetry,
	/// The live chat channel rotated under the current session.
	ChannelChanged,
	/// Watch found the channel unchanged but the session not connected.
	NotConnected,
}

impl ReconnectReason {
	pub fn label(self) -> &'static str {
		match self {
			ReconnectReason::FastRetry { .. } => "fast_retry",
			ReconnectReason::SlowRetry => "slow_retry",
			ReconnectReason::ChannelChanged => "channel_changed",
			ReconnectReason::NotConnected => "not_connected",
		}
	}

	/// Timer-driven retries go stale once the session is back up.
	pub fn is_retry(self) -> bool {
		matches!(self, ReconnectReason::FastRetry { .. } | ReconnectReason::SlowRetry)
	}
}

impl fmt::Display for ReconnectReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ReconnectReason::FastRetry { attempt } => write!(f, "fast retry (attempt {attempt})"),
			ReconnectReason::SlowRetry => f.write_str("slow retry"),
			ReconnectReason::ChannelChanged => f.write_str("chat channel changed"),
			ReconnectReason::NotConnected => f.write_str("watch found session not connected"),
		}
	}
}

/// Flags raised by timer tasks and consumed on the tick.
#[derive(Debug, Default)]
pub struct RetryFlags {
	reconnect_requested: AtomicBool,
	watch_requested: AtomicBool,
	reconnect_disabled: AtomicBool,
	reason: Mutex<Option<ReconnectReason>>,
}

impl RetryFlags {
	pub fn request_reconnect(&self, reason: ReconnectReason) {
		if self.is_disabled() {
			return;
		}
		*self.reason.lock() = Some(reason);
		self.reconnect_requested.store(true, Ordering::Release);
	}

	pub fn take_reconnect(&self) -> Option<ReconnectReason> {
		if !self.reconnect_requested.swap(false, Ordering::AcqRel) {
			return None;
		}
		self.reason.lock().take()
	}

	pub fn request_watch(&self) {
		if self.is_disabled() {
			return;
		}
		self.watch_requested.store(true, Ordering::Release);
	}

	pub fn take_watch(&self) -> bool {
		self.watch_requested.swap(false, Ordering::AcqRel)
	}

	pub fn set_disabled(&self, disabled: bool) {
		self.reconnect_disabled.store(disabled, Ordering::Release);
	}

	pub fn is_disabled(&self) -> bool {
		self.reconnect_disabled.load(Ordering::Acquire)
	}

	pub fn clear_requests(&self) {
		self.reconnect_requested.store(false, Ordering::Release);
		self.watch_requested.store(false, Ordering::Release);
		self.reason.lock().take();
	}
}

/// Next retry after an unexpected disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPlan {
	Fast { attempt: u32, max: u32, delay: Duration },
	Slow { interval: Duration },
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
	pub fast_max_attempts: u32,
	pub fast_delay: Duration,
	pub slow_interval: Duration,
	pub watch_interval: Duration,
}

/// Counters and watch baseline. Consumer-owned.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetryState {
	pub fast_attempts: u32,
	pub baseline: Option<ChatChannelId>,
}

/// Fast ladder, slow loop and channel watch.
///
/// Timer tasks only raise flags in [`RetryFlags`]; the consumer decides what to do
/// with them on its next tick.
pub struct RetryScheduler {
	handle: Handle,
	policy: RetryPolicy,
	flags: Arc<RetryFlags>,
	state: RetryState,
	fast_timer: Option<JoinHandle<()>>,
	slow_timer: Option<JoinHandle<()>>,
	watch_timer: Option<JoinHandle<()>>,
}

fn abort(timer: &mut Option<JoinHandle<()>>) {
	if let Some(t) = timer.take() {
		t.abort();
	}
}

fn is_armed(timer: &Option<JoinHandle<()>>) -> bool {
	timer.as_ref().is_some_and(|t| !t.is_finished())
}

impl RetryScheduler {
	pub fn new(handle: Handle, policy: RetryPolicy) -> Self {
		Self {
			handle,
			policy,
			flags: Arc::new(RetryFlags::default()),
			state: RetryState::default(),
			fast_timer: None,
			slow_timer: None,
			watch_timer: None,
		}
	}

	pub fn flags(&self) -> &Arc<RetryFlags> {
		&self.flags
	}

	pub fn state(&self) -> &RetryState {
		&self.state
	}

	pub fn baseline(&self) -> Option<&ChatChannelId> {
		self.state.baseline.as_ref()
	}

	pub fn set_baseline(&mut self, id: ChatChannelId) {
		self.state.baseline = Some(id);
	}

	/// Decide the next tier and advance the fast counter.
	pub fn plan_after_disconnect(&mut self) -> RetryPlan {
		if self.state.fast_attempts < self.policy.fast_max_attempts {
			self.state.fast_attempts += 1;
			RetryPlan::Fast {
				attempt: self.state.fast_attempts,
				max: self.policy.fast_max_attempts,
				delay: self.policy.fast_delay,
			}
		} else {
			RetryPlan::Slow {
				interval: self.policy.slow_interval,
			}
		}
	}

	/// Plan and arm the matching timer. `None` when reconnection is disabled.
	pub fn schedule_after_disconnect(&mut self) -> Option<RetryPlan> {
		if self.flags.is_disabled() {
			return None;
		}
		let plan = self.plan_after_disconnect();
		match plan {
			RetryPlan::Fast { attempt, delay, .. } => self.arm_fast(attempt, delay),
			RetryPlan::Slow { .. } => self.arm_slow(),
		}
		Some(plan)
	}

	fn arm_fast(&mut self, attempt: u32, delay: Duration) {
		abort(&mut self.fast_timer);
		let flags = self.flags.clone();
		self.fast_timer = Some(self.handle.spawn(async move {
			sleep(delay).await;
			flags.request_reconnect(ReconnectReason::FastRetry { attempt });
		}));
	}

	/// Start the slow loop. No-op while it is already running.
	pub fn arm_slow(&mut self) {
		if self.flags.is_disabled() || is_armed(&self.slow_timer) {
			return;
		}
		let flags = self.flags.clone();
		let every = self.policy.slow_interval;
		self.slow_timer = Some(self.handle.spawn(async move {
			let mut ticker = interval_at(Instant::now() + every, every);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
			loop {
				ticker.tick().await;
				flags.request_reconnect(ReconnectReason::SlowRetry);
			}
		}));
	}

	pub fn start_watch(&mut self) {
		abort(&mut self.watch_timer);
		let flags = self.flags.clone();
		let every = self.policy.watch_interval;
		self.watch_timer = Some(self.handle.spawn(async move {
			let mut ticker = interval_at(Instant::now() + every, every);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
			loop {
				ticker.tick().await;
				flags.request_watch();
			}
		}));
	}

	pub fn stop_watch(&mut self) {
		abort(&mut self.watch_timer);
	}

	pub fn is_slow_armed(&self) -> bool {
		is_armed(&self.slow_timer)
	}

	pub fn is_fast_armed(&self) -> bool {
		is_armed(&self.fast_timer)
	}

	pub fn is_watch_armed(&self) -> bool {
		is_armed(&self.watch_timer)
	}

	/// Session reached `Connected`: the ladder starts over.
	pub fn on_connected(&mut self) {
		self.state.fast_attempts = 0;
		abort(&mut self.fast_timer);
		abort(&mut self.slow_timer);
	}

	/// Back to a known-good state: no timers, no pending requests, counters at zero.
	pub fn reset(&mut self) {
		abort(&mut self.fast_timer);
		abort(&mut self.slow_timer);
		abort(&mut self.watch_timer);
		self.flags.clear_requests();
		self.state = RetryState::default();
	}

	/// Stop the fast and slow tiers, leaving the watch alone.
	pub fn stop_retries(&mut self) {
		abort(&mut self.fast_timer);
		abort(&mut self.slow_timer);
	}
}

impl Drop for RetryScheduler {
	fn drop(&mut self) {
		abort(&mut self.fast_timer);
		abort(&mut self.slow_timer);
		abort(&mut self.watch_timer);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn policy(fast: Duration, slow: Duration, watch: Duration) -> RetryPolicy {
		RetryPolicy {
			fast_max_attempts: 3,
			fast_delay: fast,
			slow_interval: slow,
			watch_interval: watch,
		}
	}

	fn default_policy() -> RetryPolicy {
		policy(Duration::from_secs(5), Duration::from_secs(30), Duration::from_secs(30))
	}

	async fn wait_for_reconnect(flags: &RetryFlags) -> ReconnectReason {
		tokio::time::timeout(Duration::from_secs(2), async {
			loop {
				if let Some(r) = flags.take_reconnect() {
					return r;
				}
				tokio::time::sleep(Duration::from_millis(5)).await;
			}
		})
		.await
		.expect("reconnect requested within timeout")
	}

	#[tokio::test]
	async fn three_fast_attempts_then_slow() {
		let mut s = RetryScheduler::new(Handle::current(), default_policy());

		for attempt in 1..=3 {
			assert_eq!(
				s.plan_after_disconnect(),
				RetryPlan::Fast {
					attempt,
					max: 3,
					delay: Duration::from_secs(5)
				}
			);
		}
		for _ in 0..2 {
			assert_eq!(
				s.plan_after_disconnect(),
				RetryPlan::Slow {
					interval: Duration::from_secs(30)
				}
			);
		}

		s.on_connected();
		assert!(matches!(s.plan_after_disconnect(), RetryPlan::Fast { attempt: 1, .. }));
	}

	#[tokio::test]
	async fn reset_clears_counters_and_requests() {
		let mut s = RetryScheduler::new(Handle::current(), default_policy());
		s.plan_after_disconnect();
		s.set_baseline(ChatChannelId::new("N1").expect("id"));
		s.flags().request_reconnect(ReconnectReason::SlowRetry);
		s.flags().request_watch();

		s.reset();
		assert_eq!(s.state(), &RetryState::default());
		assert_eq!(s.flags().take_reconnect(), None);
		assert!(!s.flags().take_watch());
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn fast_timer_raises_flag() {
		let mut s = RetryScheduler::new(
			Handle::current(),
			policy(Duration::from_millis(20), Duration::from_secs(30), Duration::from_secs(30)),
		);
		let plan = s.schedule_after_disconnect();
		assert!(matches!(plan, Some(RetryPlan::Fast { attempt: 1, .. })));
		assert_eq!(
			wait_for_reconnect(s.flags()).await,
			ReconnectReason::FastRetry { attempt: 1 }
		);
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn slow_loop_repeats_and_is_idempotent() {
		let mut s = RetryScheduler::new(
			Handle::current(),
			policy(Duration::from_secs(5), Duration::from_millis(20), Duration::from_secs(30)),
		);
		s.arm_slow();
		s.arm_slow();
		assert!(s.is_slow_armed());

		assert_eq!(wait_for_reconnect(s.flags()).await, ReconnectReason::SlowRetry);
		assert_eq!(wait_for_reconnect(s.flags()).await, ReconnectReason::SlowRetry);

		s.on_connected();
		assert!(!s.is_slow_armed());
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn disabled_flag_suppresses_requests() {
		let mut s = RetryScheduler::new(
			Handle::current(),
			policy(Duration::from_millis(10), Duration::from_millis(10), Duration::from_millis(10)),
		);
		s.flags().set_disabled(true);
		assert_eq!(s.schedule_after_disconnect(), None);
		s.start_watch();

		tokio::time::sleep(Duration::from_millis(60)).await;
		assert_eq!(s.flags().take_reconnect(), None);
		assert!(!s.flags().take_watch());
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn watch_timer_raises_watch_flag() {
		let mut s = RetryScheduler::new(
			Handle::current(),
			policy(Duration::from_secs(5), Duration::from_secs(30), Duration::from_millis(20)),
		);
		s.start_watch();
		let raised = tokio::time::timeout(Duration::from_secs(2), async {
			while !s.flags().take_watch() {
				tokio::time::sleep(Duration::from_millis(5)).await;
			}
		})
		.await;
		assert!(raised.is_ok());
		s.stop_watch();
		assert!(!s.is_watch_armed());
	}
}

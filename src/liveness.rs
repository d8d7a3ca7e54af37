use crate::connection::Channel;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded restart policy with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    /// Number of restarts attempted without reaching a connected state, before giving up.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RestartPolicy {
    /// Delay before the given restart attempt (counted from 1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Alive,
    /// Channel is not open yet, so there's nothing to probe.
    Skipped,
    /// Channel has been closed: the remote peer went away cleanly, e.g. on a page reload.
    Closed,
    /// Sending over an open channel failed: the remote peer is gone.
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Restart should proceed after the given delay.
    Proceed(Duration),
    AlreadyPending,
    Exhausted,
}

#[derive(Debug, Default)]
struct MonitorState {
    restart_pending: bool,
    attempts: u32,
    restarts: u64,
}

/// Detects connections which died silently.
///
/// A peer which reloads without closing can leave the local data channel reporting "open"
/// forever. The only reliable signal is a failing send, so the monitor periodically sends an
/// empty payload over the active channel.
#[derive(Debug)]
pub struct LivenessMonitor {
    interval: Duration,
    policy: RestartPolicy,
    state: parking_lot::Mutex<MonitorState>,
}

impl LivenessMonitor {
    pub fn new(interval: Duration, policy: RestartPolicy) -> Self {
        LivenessMonitor {
            interval,
            policy,
            state: parking_lot::Mutex::new(MonitorState::default()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    pub async fn probe(&self, channel: &dyn Channel) -> Probe {
        if channel.is_closed() {
            log::warn!("data channel '{}' has been closed", channel.label());
            return Probe::Closed;
        }
        if !channel.is_open() {
            return Probe::Skipped;
        }
        match channel.send(Bytes::new()).await {
            Ok(()) => Probe::Alive,
            Err(e) => {
                log::warn!("liveness probe on '{}' failed: {}", channel.label(), e);
                Probe::Dead
            }
        }
    }

    /// Registers a detected death. At most one restart is pending at a time, and no more than
    /// [RestartPolicy::max_attempts] restarts happen until the connection is established again.
    pub fn begin_restart(&self) -> RestartDecision {
        let mut state = self.state.lock();
        if state.restart_pending {
            return RestartDecision::AlreadyPending;
        }
        if state.attempts >= self.policy.max_attempts {
            log::error!(
                "giving up on restarting the connection after {} attempts",
                state.attempts
            );
            return RestartDecision::Exhausted;
        }
        state.attempts += 1;
        state.restart_pending = true;
        RestartDecision::Proceed(self.policy.backoff(state.attempts))
    }

    pub fn restart_finished(&self) {
        let mut state = self.state.lock();
        if state.restart_pending {
            state.restart_pending = false;
            state.restarts += 1;
        }
    }

    /// Resets restart bookkeeping once the connection is established. Idempotent.
    pub fn on_connected(&self) {
        let mut state = self.state.lock();
        state.restart_pending = false;
        state.attempts = 0;
    }

    pub fn is_restart_pending(&self) -> bool {
        self.state.lock().restart_pending
    }

    /// Restart attempts since the connection was last established.
    pub fn attempts(&self) -> u32 {
        self.state.lock().attempts
    }

    /// Total number of completed restarts.
    pub fn restarts(&self) -> u64 {
        self.state.lock().restarts
    }
}

impl Default for LivenessMonitor {
    fn default() -> Self {
        LivenessMonitor::new(Duration::from_secs(2), RestartPolicy::default())
    }
}

#[cfg(test)]
mod test {
    use crate::liveness::{LivenessMonitor, Probe, RestartDecision, RestartPolicy};
    use crate::testing::ScriptedChannel;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[tokio::test]
    async fn probes_only_open_channels() {
        let monitor = LivenessMonitor::default();
        let channel = ScriptedChannel::new("chat");
        assert_eq!(monitor.probe(&channel).await, Probe::Alive);
        assert_eq!(channel.sent.load(Ordering::SeqCst), 1);

        channel.set_open(false);
        assert_eq!(monitor.probe(&channel).await, Probe::Skipped);
        assert_eq!(channel.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_channel_is_reported() {
        let monitor = LivenessMonitor::default();
        let channel = ScriptedChannel::new("chat");
        channel.close_remotely();
        assert_eq!(monitor.probe(&channel).await, Probe::Closed);
        assert_eq!(channel.sent.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_send_on_open_channel_means_dead() {
        let monitor = LivenessMonitor::default();
        let channel = ScriptedChannel::new("chat");
        channel.break_silently();
        assert_eq!(monitor.probe(&channel).await, Probe::Dead);
    }

    #[test]
    fn one_restart_at_a_time() {
        let monitor = LivenessMonitor::default();
        assert!(matches!(monitor.begin_restart(), RestartDecision::Proceed(_)));
        assert_eq!(monitor.begin_restart(), RestartDecision::AlreadyPending);
        monitor.restart_finished();
        assert_eq!(monitor.restarts(), 1);
        assert_eq!(monitor.attempts(), 1);

        monitor.on_connected();
        monitor.on_connected();
        assert!(!monitor.is_restart_pending());
        assert_eq!(monitor.attempts(), 0);
        assert_eq!(monitor.restarts(), 1);
    }

    #[test]
    fn restarts_are_bounded() {
        let policy = RestartPolicy {
            max_attempts: 2,
            ..RestartPolicy::default()
        };
        let monitor = LivenessMonitor::new(Duration::from_secs(1), policy);
        for _ in 0..2 {
            assert!(matches!(monitor.begin_restart(), RestartDecision::Proceed(_)));
            monitor.restart_finished();
        }
        assert_eq!(monitor.begin_restart(), RestartDecision::Exhausted);
        monitor.on_connected();
        assert!(matches!(monitor.begin_restart(), RestartDecision::Proceed(_)));
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = RestartPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }
}

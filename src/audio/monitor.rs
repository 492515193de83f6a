//! Periodic idle/disconnect sweep over every live session.
//!
//! The monitor itself owns no session state. Each tick it asks every session
//! actor to evaluate itself at the tick's timestamp; decisions and any
//! resulting disconnect happen inside the actor.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::{sync::Arc, time::Duration};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{notice::DisconnectReason, registry::SessionRegistry};

/// Seconds before an inactivity disconnect during which countdowns are sent.
const COUNTDOWN_WINDOW: i64 = 60;
/// Countdowns are announced on these boundaries (60, 45, 30, 15).
const COUNTDOWN_STEP: i64 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorPolicy {
    pub idle_timeout: Duration,
    pub interval: Duration,
}

impl Default for MonitorPolicy {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            interval: Duration::from_secs(15),
        }
    }
}

/// What a tick decided for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorAction {
    Nothing,
    Disconnect(DisconnectReason),
    /// Announce that `seconds` remain before an inactivity disconnect.
    Countdown(u64),
}

/// Inputs of an idle evaluation, read by the actor from its own state.
#[derive(Debug, Clone, Copy)]
pub struct IdleView {
    pub stay_always: bool,
    pub auto_disconnect: bool,
    pub last_activity: DateTime<Utc>,
    pub empty_since: Option<DateTime<Utc>>,
    /// Humans in the bot's voice channel.
    pub occupancy: usize,
}

/// Checks run in order; the first that fires wins.
pub fn evaluate(view: &IdleView, now: DateTime<Utc>, policy: &MonitorPolicy) -> MonitorAction {
    if view.stay_always || !view.auto_disconnect {
        return MonitorAction::Nothing;
    }

    let timeout = policy.idle_timeout.as_secs() as i64;

    if (now - view.last_activity).num_seconds() > timeout {
        return MonitorAction::Disconnect(DisconnectReason::TakingABreak);
    }

    if view.occupancy == 0 {
        return MonitorAction::Disconnect(DisconnectReason::EmptyChannel);
    }

    if let Some(since) = view.empty_since {
        let remaining = timeout - (now - since).num_seconds();
        if remaining <= 0 {
            return MonitorAction::Disconnect(DisconnectReason::Inactivity);
        }
        if remaining <= COUNTDOWN_WINDOW {
            let bucket = (remaining + COUNTDOWN_STEP - 1) / COUNTDOWN_STEP * COUNTDOWN_STEP;
            return MonitorAction::Countdown(bucket as u64);
        }
    }

    MonitorAction::Nothing
}

/// Background task ticking over the registry until cancelled.
pub struct IdleMonitor {
    registry: Arc<SessionRegistry>,
    policy: MonitorPolicy,
}

impl IdleMonitor {
    pub fn new(registry: Arc<SessionRegistry>, policy: MonitorPolicy) -> Self {
        Self { registry, policy }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval(self.policy.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("⏱️ Idle monitor started (every {:?})", self.policy.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.sweep(Utc::now()).await,
            }
        }

        info!("⏱️ Idle monitor stopped");
    }

    /// Evaluates every live session at `now`. Sessions are independent, so
    /// they are evaluated concurrently.
    pub async fn sweep(&self, now: DateTime<Utc>) {
        if self.registry.is_empty() {
            return;
        }
        trace!("⏱️ Checking {} sessions", self.registry.len());
        let handles = self.registry.handles();
        let results = join_all(handles.iter().map(|handle| handle.idle_tick(now))).await;

        for (handle, result) in handles.iter().zip(results) {
            match result {
                Ok(MonitorAction::Nothing) => {}
                Ok(action) => debug!(session = %handle.key(), "⏱️ Idle check: {:?}", action),
                Err(e) => warn!(session = %handle.key(), "⚠️ Idle check failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use pretty_assertions::assert_eq;

    fn view(now: DateTime<Utc>) -> IdleView {
        IdleView {
            stay_always: false,
            auto_disconnect: true,
            last_activity: now,
            empty_since: None,
            occupancy: 2,
        }
    }

    #[test]
    fn test_exemptions_win() {
        let t0 = Utc::now();
        let mut v = view(t0);
        v.occupancy = 0;
        v.stay_always = true;
        assert_eq!(evaluate(&v, t0, &MonitorPolicy::default()), MonitorAction::Nothing);
        v.stay_always = false;
        v.auto_disconnect = false;
        assert_eq!(evaluate(&v, t0, &MonitorPolicy::default()), MonitorAction::Nothing);
    }

    #[test]
    fn test_stale_activity_beats_occupancy() {
        let t0 = Utc::now();
        let v = view(t0);
        let later = t0 + ChronoDuration::seconds(301);
        assert_eq!(
            evaluate(&v, later, &MonitorPolicy::default()),
            MonitorAction::Disconnect(DisconnectReason::TakingABreak)
        );
    }

    #[test]
    fn test_empty_channel_disconnects_immediately() {
        let t0 = Utc::now();
        let mut v = view(t0);
        v.occupancy = 0;
        assert_eq!(
            evaluate(&v, t0, &MonitorPolicy::default()),
            MonitorAction::Disconnect(DisconnectReason::EmptyChannel)
        );
    }

    #[test]
    fn test_empty_queue_counts_down_then_disconnects() {
        let t0 = Utc::now();
        let policy = MonitorPolicy::default();
        let mut v = view(t0);
        v.empty_since = Some(t0);

        let at = |secs: i64| {
            let now = t0 + ChronoDuration::seconds(secs);
            let mut v = v;
            v.last_activity = now;
            evaluate(&v, now, &policy)
        };

        assert_eq!(at(100), MonitorAction::Nothing);
        assert_eq!(at(240), MonitorAction::Countdown(60));
        assert_eq!(at(250), MonitorAction::Countdown(60));
        assert_eq!(at(256), MonitorAction::Countdown(45));
        assert_eq!(at(285), MonitorAction::Countdown(15));
        assert_eq!(at(301), MonitorAction::Disconnect(DisconnectReason::Inactivity));
    }
}

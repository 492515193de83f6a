//! Bounded skip-forward around "begin streaming a track".
//!
//! A chain starts whenever the scheduler is asked for a new track and ends
//! when something streams or the session goes idle. Each failed candidate is
//! discarded and the scheduler is asked again through the actor mailbox, so
//! the number of attempts is bounded and the stack never grows.

use tracing::{debug, warn};

use super::track::{SessionKey, Track};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryVerdict {
    /// Ask the scheduler for the next candidate.
    TryNext,
    /// Every candidate we were willing to try failed.
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryBudget {
    limit: usize,
    failures: usize,
}

impl RetryBudget {
    /// `candidates` is the number of tracks the chain could reach without
    /// repeating itself: the larger of the queue and the loop backup.
    pub fn for_chain(candidates: usize) -> Self {
        Self {
            limit: candidates.max(1),
            failures: 0,
        }
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn record_failure(&mut self, key: SessionKey, track: &Track, reason: &str) -> RetryVerdict {
        self.failures += 1;
        warn!(
            session = %key,
            attempt = self.failures,
            limit = self.limit,
            "⚠️ Could not start '{}': {}",
            track.title,
            reason
        );

        if self.failures >= self.limit {
            RetryVerdict::GiveUp
        } else {
            debug!(session = %key, "⏭️ Skipping to the next candidate");
            RetryVerdict::TryNext
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::track::{SourceRef, UserRef};

    #[test]
    fn test_budget_gives_up_after_limit() {
        let track = Track::new("a", "A", SourceRef::Url("https://x/a".into()), UserRef(1));
        let mut budget = RetryBudget::for_chain(3);
        assert_eq!(budget.record_failure(SessionKey(1), &track, "boom"), RetryVerdict::TryNext);
        assert_eq!(budget.record_failure(SessionKey(1), &track, "boom"), RetryVerdict::TryNext);
        assert_eq!(budget.record_failure(SessionKey(1), &track, "boom"), RetryVerdict::GiveUp);
        assert_eq!(budget.failures(), 3);
    }

    #[test]
    fn test_empty_chain_still_allows_one_attempt() {
        let budget = RetryBudget::for_chain(0);
        assert_eq!(budget.limit(), 1);
    }
}

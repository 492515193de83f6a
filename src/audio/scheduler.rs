//! "What plays next" as a pure decision over a read-only view of a session.
//!
//! The scheduler never touches the queue or the transport; the session actor
//! applies whatever it decides.

use super::{
    queue::{LoopMode, SessionState},
    track::Track,
};

/// Why the scheduler is being asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleReason {
    /// Playback is being started on an idle session.
    Start,
    /// The transport reported the current track finished.
    Finished,
    /// The user skipped the current track.
    Skipped,
    /// The previous candidate could not be started.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Pop the queue head.
    Advance,
    /// Play the current track again.
    RepeatTrack,
    /// Restore the loop backup as the queue, then advance.
    RefillFromBackup,
    /// Ask the resolver for something related to `seed_title`.
    AutoplayFetch { seed_title: String, exclude_id: String },
    /// Nothing to play.
    GoIdle,
}

/// The inputs a decision depends on.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerView<'a> {
    pub queue_len: usize,
    pub loop_mode: LoopMode,
    pub backup_len: usize,
    pub autoplay: bool,
    /// The track that just finished, or the last one that streamed in this chain.
    pub current: Option<&'a Track>,
    pub reason: ScheduleReason,
}

impl<'a> SchedulerView<'a> {
    pub fn of(state: &SessionState, current: Option<&'a Track>, reason: ScheduleReason) -> Self {
        Self {
            queue_len: state.len(),
            loop_mode: state.loop_mode(),
            backup_len: state.backup_len(),
            autoplay: state.settings.autoplay,
            current,
            reason,
        }
    }
}

pub fn decide(view: &SchedulerView<'_>) -> Decision {
    let repeat_allowed = matches!(view.reason, ScheduleReason::Finished | ScheduleReason::Start);

    if view.loop_mode == LoopMode::Track && repeat_allowed && view.current.is_some() {
        return Decision::RepeatTrack;
    }

    if view.queue_len > 0 {
        return Decision::Advance;
    }

    if view.loop_mode == LoopMode::Queue && view.backup_len > 0 {
        return Decision::RefillFromBackup;
    }

    if view.autoplay {
        if let Some(current) = view.current {
            return Decision::AutoplayFetch {
                seed_title: current.title.clone(),
                exclude_id: current.id.clone(),
            };
        }
    }

    Decision::GoIdle
}

/// Picks the autoplay result: the first candidate that is not the seed.
pub fn pick_autoplay(candidates: Vec<Track>, exclude_id: &str) -> Option<Track> {
    candidates.into_iter().find(|t| t.id != exclude_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::track::{SourceRef, UserRef};
    use pretty_assertions::assert_eq;

    fn track(id: &str) -> Track {
        Track::new(id, format!("Song {}", id), SourceRef::Url(format!("https://youtu.be/{}", id)), UserRef(1))
    }

    fn view(current: Option<&Track>) -> SchedulerView<'_> {
        SchedulerView {
            queue_len: 0,
            loop_mode: LoopMode::Off,
            backup_len: 0,
            autoplay: false,
            current,
            reason: ScheduleReason::Finished,
        }
    }

    #[test]
    fn test_empty_session_goes_idle() {
        assert_eq!(decide(&view(None)), Decision::GoIdle);
        let mut v = view(None);
        v.autoplay = true;
        assert_eq!(decide(&v), Decision::GoIdle);
    }

    #[test]
    fn test_advance_when_queue_has_items() {
        let mut v = view(None);
        v.queue_len = 2;
        v.autoplay = true;
        assert_eq!(decide(&v), Decision::Advance);
    }

    #[test]
    fn test_loop_track_beats_everything() {
        let a = track("a");
        let mut v = view(Some(&a));
        v.loop_mode = LoopMode::Track;
        v.queue_len = 3;
        v.autoplay = true;
        assert_eq!(decide(&v), Decision::RepeatTrack);
    }

    #[test]
    fn test_skip_and_failure_do_not_repeat() {
        let a = track("a");
        let mut v = view(Some(&a));
        v.loop_mode = LoopMode::Track;
        v.reason = ScheduleReason::Skipped;
        assert_eq!(decide(&v), Decision::GoIdle);
        v.reason = ScheduleReason::Failed;
        v.queue_len = 1;
        assert_eq!(decide(&v), Decision::Advance);
    }

    #[test]
    fn test_queue_loop_refills_before_autoplay() {
        let a = track("a");
        let mut v = view(Some(&a));
        v.loop_mode = LoopMode::Queue;
        v.backup_len = 3;
        v.autoplay = true;
        assert_eq!(decide(&v), Decision::RefillFromBackup);
    }

    #[test]
    fn test_autoplay_needs_a_seed() {
        let a = track("a");
        let mut v = view(Some(&a));
        v.autoplay = true;
        assert_eq!(
            decide(&v),
            Decision::AutoplayFetch {
                seed_title: "Song a".into(),
                exclude_id: "a".into()
            }
        );
    }

    #[test]
    fn test_pick_autoplay_skips_seed() {
        let picked = pick_autoplay(vec![track("a"), track("b"), track("c")], "a");
        assert_eq!(picked.unwrap().id, "b");
        assert!(pick_autoplay(vec![track("a")], "a").is_none());
        assert!(pick_autoplay(Vec::new(), "a").is_none());
    }
}

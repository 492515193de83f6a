//! Notification intents emitted by sessions and the idle monitor.

use async_trait::async_trait;

use super::track::{ChannelRef, SessionKey, Track};

/// Why a session left its voice channel on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// No activity for the idle timeout.
    TakingABreak,
    /// Nobody but the bot is in the channel.
    EmptyChannel,
    /// The queue stayed empty for the idle timeout.
    Inactivity,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    NowPlaying { track: Track, next: Option<Track> },
    QueueLooped,
    AutoQueued { track: Track },
    NoRelatedTracks,
    AutoplayFailed { reason: String },
    QueueEmpty,
    TrackFailed { track: Track, reason: String },
    PlaybackGaveUp { failures: usize },
    Disconnected { reason: DisconnectReason },
    Countdown { seconds: u64 },
    Kicked,
    SessionReset { diagnostic: String },
}

/// Delivers notices to the channel a session last heard from.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, session: SessionKey, target: ChannelRef, notice: Notice);
}

//! Contract of the voice transport the sessions drive.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use super::{
    effects::AudioFilter,
    session::FinishedSignal,
    track::{ChannelRef, SessionKey},
};
use crate::sources::PlayableSource;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("not connected to a voice channel")]
    NotConnected,
    #[error("could not join voice channel: {0}")]
    Join(String),
    #[error("playback failed: {0}")]
    Playback(String),
}

/// How a `play` call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed,
    Errored(String),
}

/// One session's binding to a voice connection.
///
/// `play` must not deliver the finished signal synchronously; implementations
/// hand it to whatever event machinery reports the end of the stream.
/// Stopping a playing track delivers the signal like a natural end.
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    async fn connect(&self, channel: ChannelRef) -> Result<(), TransportError>;

    async fn move_to(&self, channel: ChannelRef) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn play(
        &self,
        source: PlayableSource,
        volume: f32,
        filter: Option<AudioFilter>,
        on_finished: FinishedSignal,
    ) -> Result<(), TransportError>;

    async fn pause(&self) -> Result<(), TransportError>;

    async fn resume(&self) -> Result<(), TransportError>;

    async fn stop(&self) -> Result<(), TransportError>;

    async fn is_playing(&self) -> bool;

    async fn is_paused(&self) -> bool;

    async fn set_volume(&self, volume: f32) -> Result<(), TransportError>;

    /// Humans (bots excluded) currently in `channel`.
    async fn occupancy(&self, channel: ChannelRef) -> usize;
}

/// Hands out the transport binding of each session.
pub trait TransportFactory: Send + Sync {
    fn bind(&self, key: SessionKey) -> Arc<dyn VoiceTransport>;
}

impl<F> TransportFactory for F
where
    F: Fn(SessionKey) -> Arc<dyn VoiceTransport> + Send + Sync,
{
    fn bind(&self, key: SessionKey) -> Arc<dyn VoiceTransport> {
        self(key)
    }
}

//! Error taxonomy for playback sessions.
//!
//! Domain errors use `thiserror`; the binary and the Discord front end wrap
//! them in `anyhow` at the edges.

use thiserror::Error;

use crate::{audio::transport::TransportError, sources::ResolveError, storage::StoreError};

/// Errors surfaced by session operations to the invoking context.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Bad input from the user. Nothing was mutated.
    #[error("{0}")]
    UserInput(#[from] UserInputError),

    /// The media resolver could not find or stream the item.
    #[error("Could not resolve track: {0}")]
    Resolution(#[from] ResolveError),

    /// The voice transport failed.
    #[error("Voice transport error: {0}")]
    Transport(#[from] TransportError),

    /// Durable store failure. Only surfaced by operations whose whole purpose
    /// is persistence (export/playlists); playback paths log and continue.
    #[error("Storage error: {0}")]
    Persistence(#[from] StoreError),

    /// Internal state was found inconsistent and the session was reset.
    #[error("Session state was inconsistent and has been reset: {0}")]
    InvariantViolation(String),

    /// The session actor is gone (process shutting down).
    #[error("Session is no longer running")]
    SessionClosed,
}

/// Input validation failures, reported without any state change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UserInputError {
    #[error("Invalid position {position}! Queue has {len} items.")]
    PositionOutOfRange { position: usize, len: usize },

    #[error("Volume must be between 0 and 100, got {0}")]
    VolumeOutOfRange(i64),

    #[error("Unsupported link: {0}")]
    UnsupportedLink(String),

    #[error("Nothing is playing right now!")]
    NothingPlaying,

    #[error("Playback is not paused")]
    NotPaused,

    #[error("Not enough songs in queue to shuffle!")]
    NotEnoughTracks,

    #[error("The queue is full (maximum {0} songs)")]
    QueueFull(usize),

    #[error("The queue is empty!")]
    EmptyQueue,

    #[error("Unknown filter '{0}'. Available: bassboost, nightcore, vaporwave, 8d, clear")]
    UnknownFilter(String),

    #[error("No track found at position {0} in history!")]
    NoHistoryEntry(usize),

    #[error("I'm not in a voice channel!")]
    NotConnected,
}

pub type SessionResult<T> = Result<T, SessionError>;

//! # Audio Module
//!
//! Per-guild playback sessions and everything they drive.
//!
//! ## Architecture
//!
//! ### [`session`] - Session Actor
//! - One tokio task per guild owns that guild's [`queue::SessionState`]
//! - Commands arrive through a bounded mailbox and are applied one at a time
//! - Transport and resolver completions come back as internal events, tagged
//!   with a playback epoch so stale completions are dropped
//!
//! ### [`scheduler`] / [`retry`] - Track Selection
//! - Picks the next candidate according to the loop mode
//! - Bounds how many consecutive start failures are tolerated
//!
//! ### [`monitor`] - Idle Monitor
//! - Periodic sweep deciding countdowns and automatic disconnects
//!
//! ### [`registry`] - Session Registry
//! - Lazily spawns one actor per guild and hands out cloneable handles
//!
//! The actor never talks to Discord directly: voice goes through
//! [`transport::VoiceTransport`] and messages through [`notice::Notifier`].
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! let session = registry.get_or_create(SessionKey(guild_id));
//! session.join(ChannelRef(voice_channel)).await?;
//! let position = session.enqueue(track).await?;
//! session.start_if_idle().await?;
//! ```

pub mod effects;
pub mod monitor;
pub mod notice;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod snapshot;
pub mod track;
pub mod transport;

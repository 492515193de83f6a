use parking_lot::Mutex;
use serenity::async_trait;
use songbird::{
    tracks::PlayMode, Event as VoiceEvent, EventContext, EventHandler as VoiceEventHandler, TrackEvent,
};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::audio::{session::FinishedSignal, transport::PlaybackOutcome, track::SessionKey};

/// The finished signal of one playback, shared by its End and Error
/// handlers. Whichever fires first takes it.
pub type SharedSignal = Arc<Mutex<Option<FinishedSignal>>>;

/// Reports the end of a track (natural end, stop, or error) to its session.
pub struct TrackFinishedHandler {
    pub session: SessionKey,
    pub signal: SharedSignal,
}

#[async_trait]
impl VoiceEventHandler for TrackFinishedHandler {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<VoiceEvent> {
        let outcome = match ctx {
            EventContext::Track(tracks) => tracks
                .iter()
                .find_map(|(state, _)| match &state.playing {
                    PlayMode::Errored(e) => Some(PlaybackOutcome::Errored(format!("{:?}", e))),
                    _ => None,
                })
                .unwrap_or(PlaybackOutcome::Completed),
            _ => PlaybackOutcome::Completed,
        };

        let Some(signal) = self.signal.lock().take() else {
            return Some(VoiceEvent::Cancel);
        };

        match &outcome {
            PlaybackOutcome::Completed => debug!(session = %self.session, "🎵 Track ended"),
            PlaybackOutcome::Errored(reason) => {
                warn!(session = %self.session, "❌ Track errored: {}", reason)
            }
        }
        signal.finished(outcome);

        Some(VoiceEvent::Cancel)
    }
}

/// Hooks both handlers onto a freshly started track.
pub fn register_track_events(
    handle: &songbird::tracks::TrackHandle,
    session: SessionKey,
    signal: FinishedSignal,
) -> Result<(), songbird::error::ControlError> {
    let shared: SharedSignal = Arc::new(Mutex::new(Some(signal)));

    handle.add_event(
        VoiceEvent::Track(TrackEvent::End),
        TrackFinishedHandler {
            session,
            signal: shared.clone(),
        },
    )?;
    handle.add_event(
        VoiceEvent::Track(TrackEvent::Error),
        TrackFinishedHandler { session, signal: shared },
    )?;

    Ok(())
}

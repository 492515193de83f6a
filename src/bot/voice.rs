//! songbird-backed voice transport.

use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::all::{ChannelId, GuildId};
use songbird::{
    input::{ChildContainer, File, Input, YoutubeDl},
    tracks::{PlayMode, TrackHandle},
    Songbird,
};
use std::{
    process::{Command, Stdio},
    sync::Arc,
};
use tracing::{debug, info, warn};

use super::{events::register_track_events, presence::VoicePresence};
use crate::{
    audio::{
        effects::AudioFilter,
        session::FinishedSignal,
        track::{ChannelRef, SessionKey},
        transport::{TransportError, TransportFactory, VoiceTransport},
    },
    sources::PlayableSource,
};

/// Builds one [`SongbirdTransport`] per session over a shared manager.
pub struct SongbirdTransports {
    manager: Arc<Songbird>,
    presence: Arc<VoicePresence>,
    http: reqwest::Client,
}

impl SongbirdTransports {
    pub fn new(manager: Arc<Songbird>, presence: Arc<VoicePresence>) -> Self {
        Self {
            manager,
            presence,
            http: reqwest::Client::new(),
        }
    }
}

impl TransportFactory for SongbirdTransports {
    fn bind(&self, key: SessionKey) -> Arc<dyn VoiceTransport> {
        Arc::new(SongbirdTransport {
            guild_id: GuildId::new(key.0),
            session: key,
            manager: self.manager.clone(),
            presence: self.presence.clone(),
            http: self.http.clone(),
            current: Mutex::new(None),
        })
    }
}

pub struct SongbirdTransport {
    guild_id: GuildId,
    session: SessionKey,
    manager: Arc<Songbird>,
    presence: Arc<VoicePresence>,
    http: reqwest::Client,
    current: Mutex<Option<TrackHandle>>,
}

impl SongbirdTransport {
    fn current(&self) -> Option<TrackHandle> {
        self.current.lock().clone()
    }

    async fn play_mode(&self) -> Option<PlayMode> {
        let handle = self.current()?;
        handle.get_info().await.ok().map(|state| state.playing)
    }

    fn input_for(&self, source: PlayableSource, filter: Option<AudioFilter>) -> Result<Input, TransportError> {
        match (source, filter) {
            (PlayableSource::Remote(url), None) => Ok(YoutubeDl::new(self.http.clone(), url).into()),
            (PlayableSource::Local(path), None) => Ok(File::new(path).into()),
            (source, Some(filter)) => filtered_input(source, filter),
        }
    }
}

/// Pipes the source through ffmpeg with the filter's `-af` expression.
fn filtered_input(source: PlayableSource, filter: AudioFilter) -> Result<Input, TransportError> {
    let spawn_err = |what: &str, e: std::io::Error| TransportError::Playback(format!("{} failed to start: {}", what, e));

    let mut children = Vec::new();
    let (stdin, input_arg) = match source {
        PlayableSource::Local(path) => (Stdio::null(), path.to_string_lossy().into_owned()),
        PlayableSource::Remote(url) => {
            let mut ytdlp = Command::new("yt-dlp")
                .args(["-f", "bestaudio/best", "--no-warnings", "-q", "-o", "-"])
                .arg(&url)
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|e| spawn_err("yt-dlp", e))?;
            let stdout = ytdlp
                .stdout
                .take()
                .ok_or_else(|| TransportError::Playback("yt-dlp produced no stdout".into()))?;
            children.push(ytdlp);
            (Stdio::from(stdout), "pipe:0".to_string())
        }
    };

    let ffmpeg = Command::new("ffmpeg")
        .args(["-hide_banner", "-loglevel", "error", "-i"])
        .arg(input_arg)
        .args(["-af", filter.ffmpeg_expr(), "-ac", "2", "-ar", "48000", "-f", "wav", "pipe:1"])
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn();
    match ffmpeg {
        Ok(child) => children.push(child),
        Err(e) => {
            for mut child in children {
                let _ = child.kill();
            }
            return Err(spawn_err("ffmpeg", e));
        }
    }

    Ok(ChildContainer::from(children).into())
}

#[async_trait]
impl VoiceTransport for SongbirdTransport {
    async fn connect(&self, channel: ChannelRef) -> Result<(), TransportError> {
        self.manager
            .join(self.guild_id, ChannelId::new(channel.0))
            .await
            .map_err(|e| TransportError::Join(e.to_string()))?;
        info!(session = %self.session, "🔊 Joined voice channel {}", channel);
        Ok(())
    }

    async fn move_to(&self, channel: ChannelRef) -> Result<(), TransportError> {
        // Joining while connected moves the call.
        self.connect(channel).await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.current.lock().take();
        if self.manager.get(self.guild_id).is_none() {
            return Ok(());
        }
        self.manager
            .remove(self.guild_id)
            .await
            .map_err(|e| TransportError::Join(e.to_string()))?;
        info!(session = %self.session, "👋 Left voice channel");
        Ok(())
    }

    async fn play(
        &self,
        source: PlayableSource,
        volume: f32,
        filter: Option<AudioFilter>,
        on_finished: FinishedSignal,
    ) -> Result<(), TransportError> {
        let call = self.manager.get(self.guild_id).ok_or(TransportError::NotConnected)?;
        let input = self.input_for(source, filter)?;

        let handle = {
            let mut call = call.lock().await;
            call.play_input(input)
        };
        if let Err(e) = register_track_events(&handle, self.session, on_finished) {
            let _ = handle.stop();
            return Err(TransportError::Playback(e.to_string()));
        }
        if let Err(e) = handle.set_volume(volume) {
            warn!(session = %self.session, "⚠️ Could not set volume: {}", e);
        }
        if let Some(filter) = filter {
            debug!(session = %self.session, "🎛️ Playing through the {} filter", filter);
        }

        if let Some(previous) = self.current.lock().replace(handle) {
            let _ = previous.stop();
        }
        Ok(())
    }

    async fn pause(&self) -> Result<(), TransportError> {
        let handle = self.current().ok_or(TransportError::NotConnected)?;
        handle.pause().map_err(|e| TransportError::Playback(e.to_string()))
    }

    async fn resume(&self) -> Result<(), TransportError> {
        let handle = self.current().ok_or(TransportError::NotConnected)?;
        handle.play().map_err(|e| TransportError::Playback(e.to_string()))
    }

    async fn stop(&self) -> Result<(), TransportError> {
        // The End event of the stopped track reports back to the session.
        if let Some(handle) = self.current() {
            let _ = handle.stop();
        }
        Ok(())
    }

    async fn is_playing(&self) -> bool {
        matches!(self.play_mode().await, Some(PlayMode::Play))
    }

    async fn is_paused(&self) -> bool {
        matches!(self.play_mode().await, Some(PlayMode::Pause))
    }

    async fn set_volume(&self, volume: f32) -> Result<(), TransportError> {
        match self.current() {
            Some(handle) => handle
                .set_volume(volume)
                .map_err(|e| TransportError::Playback(e.to_string())),
            None => Ok(()),
        }
    }

    async fn occupancy(&self, channel: ChannelRef) -> usize {
        self.presence.occupancy(self.guild_id.get(), channel.0)
    }
}

//! Per-session actor.
//!
//! Every session is owned by one task. Commands from the front end and the
//! idle monitor arrive on a bounded mailbox and are applied strictly in
//! arrival order. Work that has to wait on the outside world (resolving a
//! stream, fetching autoplay candidates, the transport reporting the end of
//! a track) runs elsewhere and comes back as an internal event tagged with
//! the playback epoch. `stop`, `leave` and any disconnect bump the epoch, so
//! results that arrive after them are dropped.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::{
    effects::AudioFilter,
    monitor::{evaluate, IdleView, MonitorAction, MonitorPolicy},
    notice::{DisconnectReason, Notice, Notifier},
    queue::{LoopMode, PlaybackPhase, QueueInfo, SessionSettings, SessionState, DEFAULT_MAX_HISTORY},
    retry::{RetryBudget, RetryVerdict},
    scheduler::{decide, pick_autoplay, Decision, ScheduleReason, SchedulerView},
    snapshot::{HistoryEntry, QueueExport, QueueSnapshot},
    track::{ChannelRef, SessionKey, Track, UserRef},
    transport::{PlaybackOutcome, TransportFactory, VoiceTransport},
};
use crate::{
    error::{SessionError, SessionResult, UserInputError},
    sources::{MediaResolver, PlayableSource, ResolveError},
    storage::{PlaylistSummary, SessionStore},
};

const MAILBOX_CAPACITY: usize = 64;
const SEARCH_RESULTS: usize = 5;

type Reply<T> = oneshot::Sender<SessionResult<T>>;

/// Tunables shared by every session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub max_queue_size: usize,
    pub history_limit: usize,
    pub autoplay_candidates: usize,
    /// Percent, 0–100.
    pub default_volume: u8,
    pub monitor: MonitorPolicy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            history_limit: DEFAULT_MAX_HISTORY,
            autoplay_candidates: 5,
            default_volume: 50,
            monitor: MonitorPolicy::default(),
        }
    }
}

/// Collaborators handed to every session actor.
#[derive(Clone)]
pub struct SessionServices {
    pub transports: Arc<dyn TransportFactory>,
    pub resolver: Arc<dyn MediaResolver>,
    pub store: Arc<dyn SessionStore>,
    pub notifier: Arc<dyn Notifier>,
    pub options: SessionOptions,
}

/// One page of play history. Index 1 is the most recent entry.
#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub entries: Vec<(usize, HistoryEntry)>,
    pub current_page: usize,
    pub total_pages: usize,
    pub total: usize,
}

/// One-shot completion hook handed to the transport with every `play`.
///
/// Consuming it is the only way to report the end of that playback, so the
/// report happens at most once.
#[derive(Debug)]
pub struct FinishedSignal {
    events: mpsc::UnboundedSender<SessionEvent>,
    epoch: u64,
}

impl FinishedSignal {
    pub fn finished(self, outcome: PlaybackOutcome) {
        if self
            .events
            .send(SessionEvent::PlaybackFinished {
                epoch: self.epoch,
                outcome,
            })
            .is_err()
        {
            debug!("Session gone before playback finished");
        }
    }
}

#[derive(Debug)]
enum SessionEvent {
    PlaybackFinished {
        epoch: u64,
        outcome: PlaybackOutcome,
    },
    SourceResolved {
        epoch: u64,
        track: Track,
        result: Result<PlayableSource, ResolveError>,
    },
    AutoplayFetched {
        epoch: u64,
        exclude_id: String,
        result: Result<Vec<Track>, ResolveError>,
    },
    /// Next step of a failing start chain.
    Retry { epoch: u64 },
}

enum SessionCommand {
    Enqueue { track: Track, reply: Reply<usize> },
    RemoveAt { position: usize, reply: Reply<Track> },
    MoveTrack { from: usize, to: usize, reply: Reply<()> },
    Shuffle { reply: Reply<()> },
    SetLoopMode { mode: LoopMode, reply: Reply<()> },
    SetAutoplay { enabled: bool, reply: Reply<()> },
    SetVolume { percent: i64, reply: Reply<()> },
    Skip { reply: Reply<Track> },
    Pause { reply: Reply<()> },
    Resume { reply: Reply<()> },
    Stop { reply: Reply<()> },
    StartIfIdle { reply: Reply<bool> },
    Join { channel: ChannelRef, reply: Reply<()> },
    Leave { reply: Reply<()> },
    Disconnect { reason: DisconnectReason, reply: Reply<()> },
    TransportDisconnected { reply: Reply<()> },
    ChannelMoved { channel: ChannelRef, reply: Reply<()> },
    SetFilter { filter: Option<AudioFilter>, reply: Reply<bool> },
    SetStayAlways { enabled: bool, reply: Reply<()> },
    SetAutoDisconnect { enabled: bool, reply: Reply<()> },
    SetNotifyTarget { target: ChannelRef, reply: Reply<()> },
    Info { reply: Reply<QueueInfo> },
    History { page: usize, per_page: usize, reply: Reply<HistoryPage> },
    Replay { index: usize, requester: UserRef, reply: Reply<(Track, usize)> },
    SearchQueue { query: String, reply: Reply<Vec<(usize, Track)>> },
    ExportQueue { exported_by: String, reply: Reply<QueueExport> },
    ImportQueue { export: QueueExport, requester: UserRef, reply: Reply<usize> },
    SavePlaylist { name: String, reply: Reply<usize> },
    LoadPlaylist { name: String, requester: UserRef, reply: Reply<usize> },
    ListPlaylists { reply: Reply<Vec<PlaylistSummary>> },
    DeletePlaylist { name: String, reply: Reply<()> },
    Persist { reply: Reply<()> },
    IdleTick { now: DateTime<Utc>, reply: Reply<MonitorAction> },
}

/// Cloneable front door of a session actor.
#[derive(Clone)]
pub struct SessionHandle {
    key: SessionKey,
    commands: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub fn key(&self) -> SessionKey {
        self.key
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> SessionCommand) -> SessionResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| SessionError::SessionClosed)?;
        response.await.map_err(|_| SessionError::SessionClosed)?
    }

    /// Appends a track; returns its 1-indexed position.
    pub async fn enqueue(&self, track: Track) -> SessionResult<usize> {
        self.request(|reply| SessionCommand::Enqueue { track, reply }).await
    }

    pub async fn remove_at(&self, position: usize) -> SessionResult<Track> {
        self.request(|reply| SessionCommand::RemoveAt { position, reply }).await
    }

    pub async fn move_track(&self, from: usize, to: usize) -> SessionResult<()> {
        self.request(|reply| SessionCommand::MoveTrack { from, to, reply }).await
    }

    pub async fn shuffle(&self) -> SessionResult<()> {
        self.request(|reply| SessionCommand::Shuffle { reply }).await
    }

    pub async fn set_loop_mode(&self, mode: LoopMode) -> SessionResult<()> {
        self.request(|reply| SessionCommand::SetLoopMode { mode, reply }).await
    }

    pub async fn set_autoplay(&self, enabled: bool) -> SessionResult<()> {
        self.request(|reply| SessionCommand::SetAutoplay { enabled, reply }).await
    }

    /// `percent` must be within 0–100.
    pub async fn set_volume(&self, percent: i64) -> SessionResult<()> {
        self.request(|reply| SessionCommand::SetVolume { percent, reply }).await
    }

    /// Returns the skipped track.
    pub async fn skip(&self) -> SessionResult<Track> {
        self.request(|reply| SessionCommand::Skip { reply }).await
    }

    pub async fn pause(&self) -> SessionResult<()> {
        self.request(|reply| SessionCommand::Pause { reply }).await
    }

    pub async fn resume(&self) -> SessionResult<()> {
        self.request(|reply| SessionCommand::Resume { reply }).await
    }

    pub async fn stop(&self) -> SessionResult<()> {
        self.request(|reply| SessionCommand::Stop { reply }).await
    }

    /// Starts playback if the session is idle and has something to play.
    pub async fn start_if_idle(&self) -> SessionResult<bool> {
        self.request(|reply| SessionCommand::StartIfIdle { reply }).await
    }

    pub async fn join(&self, channel: ChannelRef) -> SessionResult<()> {
        self.request(|reply| SessionCommand::Join { channel, reply }).await
    }

    pub async fn leave(&self) -> SessionResult<()> {
        self.request(|reply| SessionCommand::Leave { reply }).await
    }

    pub async fn disconnect(&self, reason: DisconnectReason) -> SessionResult<()> {
        self.request(|reply| SessionCommand::Disconnect { reason, reply }).await
    }

    /// The voice connection went away without us asking.
    pub async fn transport_disconnected(&self) -> SessionResult<()> {
        self.request(|reply| SessionCommand::TransportDisconnected { reply }).await
    }

    /// The bot was moved to `channel` from outside; the voice connection
    /// already follows it.
    pub async fn channel_moved(&self, channel: ChannelRef) -> SessionResult<()> {
        self.request(|reply| SessionCommand::ChannelMoved { channel, reply }).await
    }

    /// Returns whether the current track was restarted to apply the filter.
    pub async fn set_filter(&self, filter: Option<AudioFilter>) -> SessionResult<bool> {
        self.request(|reply| SessionCommand::SetFilter { filter, reply }).await
    }

    pub async fn set_stay_always(&self, enabled: bool) -> SessionResult<()> {
        self.request(|reply| SessionCommand::SetStayAlways { enabled, reply }).await
    }

    pub async fn set_auto_disconnect(&self, enabled: bool) -> SessionResult<()> {
        self.request(|reply| SessionCommand::SetAutoDisconnect { enabled, reply }).await
    }

    pub async fn set_notify_target(&self, target: ChannelRef) -> SessionResult<()> {
        self.request(|reply| SessionCommand::SetNotifyTarget { target, reply }).await
    }

    pub async fn info(&self) -> SessionResult<QueueInfo> {
        self.request(|reply| SessionCommand::Info { reply }).await
    }

    pub async fn history(&self, page: usize, per_page: usize) -> SessionResult<HistoryPage> {
        self.request(|reply| SessionCommand::History { page, per_page, reply }).await
    }

    /// Re-queues history entry `index` (1 = most recent) for `requester`.
    pub async fn replay(&self, index: usize, requester: UserRef) -> SessionResult<(Track, usize)> {
        self.request(|reply| SessionCommand::Replay { index, requester, reply }).await
    }

    pub async fn search_queue(&self, query: impl Into<String>) -> SessionResult<Vec<(usize, Track)>> {
        let query = query.into();
        self.request(|reply| SessionCommand::SearchQueue { query, reply }).await
    }

    pub async fn export_queue(&self, exported_by: impl Into<String>) -> SessionResult<QueueExport> {
        let exported_by = exported_by.into();
        self.request(|reply| SessionCommand::ExportQueue { exported_by, reply }).await
    }

    /// Replaces the queue with an exported one; returns how many tracks were kept.
    pub async fn import_queue(&self, export: QueueExport, requester: UserRef) -> SessionResult<usize> {
        self.request(|reply| SessionCommand::ImportQueue {
            export,
            requester,
            reply,
        })
        .await
    }

    pub async fn save_playlist(&self, name: impl Into<String>) -> SessionResult<usize> {
        let name = name.into();
        self.request(|reply| SessionCommand::SavePlaylist { name, reply }).await
    }

    /// Appends a saved playlist to the queue.
    pub async fn load_playlist(&self, name: impl Into<String>, requester: UserRef) -> SessionResult<usize> {
        let name = name.into();
        self.request(|reply| SessionCommand::LoadPlaylist { name, requester, reply })
            .await
    }

    pub async fn list_playlists(&self) -> SessionResult<Vec<PlaylistSummary>> {
        self.request(|reply| SessionCommand::ListPlaylists { reply }).await
    }

    pub async fn delete_playlist(&self, name: impl Into<String>) -> SessionResult<()> {
        let name = name.into();
        self.request(|reply| SessionCommand::DeletePlaylist { name, reply }).await
    }

    /// Writes the queue (now-playing first) to the store.
    pub async fn persist(&self) -> SessionResult<()> {
        self.request(|reply| SessionCommand::Persist { reply }).await
    }

    pub async fn idle_tick(&self, now: DateTime<Utc>) -> SessionResult<MonitorAction> {
        self.request(|reply| SessionCommand::IdleTick { now, reply }).await
    }
}

/// A run of start attempts begun by one scheduling request.
struct StartChain {
    budget: RetryBudget,
    /// Seed for repeat and autoplay decisions.
    last: Option<Track>,
}

pub struct SessionActor {
    state: SessionState,
    transport: Arc<dyn VoiceTransport>,
    resolver: Arc<dyn MediaResolver>,
    store: Arc<dyn SessionStore>,
    notifier: Arc<dyn Notifier>,
    options: SessionOptions,
    epoch: u64,
    skip_pending: bool,
    chain: Option<StartChain>,
    commands: mpsc::Receiver<SessionCommand>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionActor {
    /// Spawns the actor for `key`. Persisted settings, history and queue are
    /// loaded before the first command is handled.
    pub fn spawn(key: SessionKey, services: &SessionServices) -> SessionHandle {
        let (actor, handle) = Self::new(key, services);
        tokio::spawn(actor.run());
        handle
    }

    fn new(key: SessionKey, services: &SessionServices) -> (Self, SessionHandle) {
        let (commands_tx, commands) = mpsc::channel(MAILBOX_CAPACITY);
        let (events_tx, events) = mpsc::unbounded_channel();
        let options = services.options.clone();

        let mut state = SessionState::new(key, options.max_queue_size, Utc::now())
            .with_max_history(options.history_limit);
        state.settings.volume = f32::from(options.default_volume.min(100)) / 100.0;

        let actor = Self {
            state,
            transport: services.transports.bind(key),
            resolver: services.resolver.clone(),
            store: services.store.clone(),
            notifier: services.notifier.clone(),
            options,
            epoch: 0,
            skip_pending: false,
            chain: None,
            commands,
            events,
            events_tx,
        };
        let handle = SessionHandle {
            key,
            commands: commands_tx,
        };
        (actor, handle)
    }

    fn key(&self) -> SessionKey {
        self.state.key()
    }

    async fn run(mut self) {
        self.restore().await;
        debug!(session = %self.key(), "🎛️ Session actor started");

        loop {
            tokio::select! {
                biased;
                Some(event) = self.events.recv() => {
                    self.handle_event(event).await;
                    let _ = self.verify().await;
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
            }
        }

        if let Err(e) = self.save_queue().await {
            warn!(session = %self.key(), "⚠️ Could not save queue on shutdown: {}", e);
        }
        debug!(session = %self.key(), "🎛️ Session actor stopped");
    }

    async fn restore(&mut self) {
        let key = self.key();
        match self.store.load_settings(key).await {
            Ok(Some(settings)) => self.state.settings = settings,
            Ok(None) => {}
            Err(e) => warn!(session = %key, "⚠️ Could not load settings: {}", e),
        }
        match self.store.load_history(key).await {
            Ok(history) => self.state.load_history(history),
            Err(e) => warn!(session = %key, "⚠️ Could not load history: {}", e),
        }
        match self.store.load_queue(key).await {
            Ok(Some(snapshot)) if !snapshot.is_empty() => {
                let restored = self.state.restore(snapshot, Utc::now());
                info!(session = %key, "♻️ Restored {} queued tracks", restored);
            }
            Ok(_) => {}
            Err(e) => warn!(session = %key, "⚠️ Could not load queue: {}", e),
        }
    }

    // Plumbing

    /// Replies after checking the session is still consistent.
    async fn settle<T>(&mut self, reply: Reply<T>, result: SessionResult<T>) {
        let result = match self.verify().await {
            Ok(()) => result,
            Err(e) => Err(e),
        };
        let _ = reply.send(result);
    }

    async fn verify(&mut self) -> SessionResult<()> {
        let Err(diagnostic) = self.state.check_invariants() else {
            return Ok(());
        };

        error!(session = %self.key(), "💥 Session state inconsistent, resetting: {}", diagnostic);
        self.invalidate();
        self.state.reset_to_idle(Utc::now());
        if let Err(e) = self.transport.stop().await {
            debug!(session = %self.key(), "Transport stop during reset: {}", e);
        }
        self.notify(Notice::SessionReset {
            diagnostic: diagnostic.clone(),
        })
        .await;
        Err(SessionError::InvariantViolation(diagnostic))
    }

    async fn notify(&self, notice: Notice) {
        match self.state.notify_target() {
            Some(target) => self.notifier.notify(self.key(), target, notice).await,
            None => debug!(session = %self.key(), "🔕 No channel to notify: {:?}", notice),
        }
    }

    /// Drops everything in flight for the current playback.
    fn invalidate(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        self.chain = None;
        self.skip_pending = false;
    }

    fn is_streaming(&self) -> bool {
        matches!(self.state.phase(), PlaybackPhase::Playing | PlaybackPhase::Paused)
    }

    fn recovery_snapshot(&self) -> QueueSnapshot {
        QueueSnapshot::from_tracks(self.state.now_playing().into_iter().chain(self.state.tracks()))
    }

    async fn save_queue(&self) -> SessionResult<()> {
        self.store.save_queue(self.key(), &self.recovery_snapshot()).await?;
        Ok(())
    }

    async fn save_settings(&self) {
        if let Err(e) = self.store.save_settings(self.key(), &self.state.settings).await {
            warn!(session = %self.key(), "⚠️ Could not save settings: {}", e);
        }
    }

    async fn update_settings(&mut self, apply: impl FnOnce(&mut SessionSettings)) {
        apply(&mut self.state.settings);
        self.state.touch(Utc::now());
        self.save_settings().await;
    }

    // Commands

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Enqueue { track, reply } => {
                let now = Utc::now();
                self.state.touch(now);
                let result = self.state.add_track(track, now).map_err(Into::into);
                self.settle(reply, result).await
            }
            SessionCommand::RemoveAt { position, reply } => {
                let now = Utc::now();
                self.state.touch(now);
                let result = self.state.remove_at(position, now).map_err(Into::into);
                self.settle(reply, result).await
            }
            SessionCommand::MoveTrack { from, to, reply } => {
                self.state.touch(Utc::now());
                let result = self.state.move_track(from, to).map_err(Into::into);
                self.settle(reply, result).await
            }
            SessionCommand::Shuffle { reply } => {
                self.state.touch(Utc::now());
                let result = self.state.shuffle().map_err(Into::into);
                self.settle(reply, result).await
            }
            SessionCommand::SetLoopMode { mode, reply } => {
                self.state.touch(Utc::now());
                self.state.set_loop_mode(mode);
                self.settle(reply, Ok(())).await
            }
            SessionCommand::SetAutoplay { enabled, reply } => {
                self.update_settings(|s| s.autoplay = enabled).await;
                info!(session = %self.key(), "🎲 Autoplay {}", if enabled { "enabled" } else { "disabled" });
                self.settle(reply, Ok(())).await
            }
            SessionCommand::SetVolume { percent, reply } => {
                let result = self.set_volume(percent).await;
                self.settle(reply, result).await
            }
            SessionCommand::Skip { reply } => {
                let result = self.skip().await;
                self.settle(reply, result).await
            }
            SessionCommand::Pause { reply } => {
                let result = self.pause().await;
                self.settle(reply, result).await
            }
            SessionCommand::Resume { reply } => {
                let result = self.resume().await;
                self.settle(reply, result).await
            }
            SessionCommand::Stop { reply } => {
                self.stop().await;
                self.settle(reply, Ok(())).await
            }
            SessionCommand::StartIfIdle { reply } => {
                let result = self.start_if_idle().await;
                self.settle(reply, Ok(result)).await
            }
            SessionCommand::Join { channel, reply } => {
                let result = self.join(channel).await;
                self.settle(reply, result).await
            }
            SessionCommand::Leave { reply } => {
                let result = self.leave().await;
                self.settle(reply, result).await
            }
            SessionCommand::Disconnect { reason, reply } => {
                self.disconnect(reason).await;
                self.settle(reply, Ok(())).await
            }
            SessionCommand::TransportDisconnected { reply } => {
                self.transport_disconnected().await;
                self.settle(reply, Ok(())).await
            }
            SessionCommand::ChannelMoved { channel, reply } => {
                self.channel_moved(channel);
                self.settle(reply, Ok(())).await
            }
            SessionCommand::SetFilter { filter, reply } => {
                let result = self.set_filter(filter).await;
                self.settle(reply, result).await
            }
            SessionCommand::SetStayAlways { enabled, reply } => {
                self.update_settings(|s| s.stay_always = enabled).await;
                info!(session = %self.key(), "🌙 Stay-always {}", if enabled { "enabled" } else { "disabled" });
                self.settle(reply, Ok(())).await
            }
            SessionCommand::SetAutoDisconnect { enabled, reply } => {
                self.update_settings(|s| s.auto_disconnect = enabled).await;
                info!(session = %self.key(), "🔌 Auto-disconnect {}", if enabled { "enabled" } else { "disabled" });
                self.settle(reply, Ok(())).await
            }
            SessionCommand::SetNotifyTarget { target, reply } => {
                self.state.set_notify_target(target);
                self.settle(reply, Ok(())).await
            }
            SessionCommand::Info { reply } => {
                let info = self.state.get_info();
                self.settle(reply, Ok(info)).await
            }
            SessionCommand::History { page, per_page, reply } => {
                let result = Ok(self.history_page(page, per_page));
                self.settle(reply, result).await
            }
            SessionCommand::Replay { index, requester, reply } => {
                let result = self.replay(index, requester);
                self.settle(reply, result).await
            }
            SessionCommand::SearchQueue { query, reply } => {
                let hits = self.state.search(&query, SEARCH_RESULTS);
                self.settle(reply, Ok(hits)).await
            }
            SessionCommand::ExportQueue { exported_by, reply } => {
                let export = QueueExport {
                    session_id: self.key(),
                    exported_by,
                    exported_at: Utc::now(),
                    tracks: self.state.snapshot().tracks,
                };
                self.settle(reply, Ok(export)).await
            }
            SessionCommand::ImportQueue {
                export,
                requester,
                reply,
            } => {
                let result = self.import_queue(export, requester);
                self.settle(reply, result).await
            }
            SessionCommand::SavePlaylist { name, reply } => {
                let result = self.save_playlist(&name).await;
                self.settle(reply, result).await
            }
            SessionCommand::LoadPlaylist { name, requester, reply } => {
                let result = self.load_playlist(&name, requester).await;
                self.settle(reply, result).await
            }
            SessionCommand::ListPlaylists { reply } => {
                let result = self.store.list_playlists(self.key()).await.map_err(Into::into);
                self.settle(reply, result).await
            }
            SessionCommand::DeletePlaylist { name, reply } => {
                let result = self.store.delete_playlist(self.key(), &name).await.map_err(Into::into);
                self.settle(reply, result).await
            }
            SessionCommand::Persist { reply } => {
                let result = self.save_queue().await;
                self.settle(reply, result).await
            }
            SessionCommand::IdleTick { now, reply } => {
                let action = self.idle_tick(now).await;
                self.settle(reply, Ok(action)).await
            }
        }
    }

    async fn set_volume(&mut self, percent: i64) -> SessionResult<()> {
        if !(0..=100).contains(&percent) {
            return Err(UserInputError::VolumeOutOfRange(percent).into());
        }

        let volume = percent as f32 / 100.0;
        self.update_settings(|s| s.volume = volume).await;
        if self.is_streaming() {
            if let Err(e) = self.transport.set_volume(volume).await {
                warn!(session = %self.key(), "⚠️ Could not apply volume: {}", e);
            }
        }
        info!(session = %self.key(), "🔊 Volume set to {}%", percent);
        Ok(())
    }

    async fn skip(&mut self) -> SessionResult<Track> {
        let current = match (self.is_streaming(), self.state.now_playing()) {
            (true, Some(track)) => track.clone(),
            _ => return Err(UserInputError::NothingPlaying.into()),
        };

        self.state.touch(Utc::now());
        self.skip_pending = true;
        if let Err(e) = self.transport.stop().await {
            self.skip_pending = false;
            return Err(e.into());
        }
        info!(session = %self.key(), "⏭️ Skipped: {}", current.title);
        Ok(current)
    }

    async fn pause(&mut self) -> SessionResult<()> {
        if self.state.phase() != PlaybackPhase::Playing {
            return Err(UserInputError::NothingPlaying.into());
        }
        self.transport.pause().await?;
        self.state.set_phase(PlaybackPhase::Paused);
        self.state.touch(Utc::now());
        info!(session = %self.key(), "⏸️ Playback paused");
        Ok(())
    }

    async fn resume(&mut self) -> SessionResult<()> {
        if self.state.phase() != PlaybackPhase::Paused {
            return Err(UserInputError::NotPaused.into());
        }
        self.transport.resume().await?;
        self.state.set_phase(PlaybackPhase::Playing);
        self.state.touch(Utc::now());
        info!(session = %self.key(), "▶️ Playback resumed");
        Ok(())
    }

    /// Clears the queue and loop, stops the transport, lands in Idle.
    async fn stop(&mut self) {
        let now = Utc::now();
        self.invalidate();
        self.state.clear(now);
        self.state.touch(now);
        if let Err(e) = self.transport.stop().await {
            debug!(session = %self.key(), "Transport stop: {}", e);
        }
        info!(session = %self.key(), "⏹️ Playback stopped");
    }

    async fn start_if_idle(&mut self) -> bool {
        if self.state.phase() != PlaybackPhase::Idle {
            return false;
        }
        if self.state.is_empty() && self.state.backup_len() == 0 {
            return false;
        }
        self.begin_chain(ScheduleReason::Start, None).await;
        true
    }

    async fn join(&mut self, channel: ChannelRef) -> SessionResult<()> {
        match self.state.channel() {
            Some(current) if current == channel => {}
            Some(_) => self.transport.move_to(channel).await?,
            None => self.transport.connect(channel).await?,
        }
        self.state.set_channel(Some(channel));
        self.state.set_leave_requested(false);
        self.state.touch(Utc::now());
        info!(session = %self.key(), "🔊 Joined voice channel {}", channel);
        Ok(())
    }

    /// Leaves on request. The queue is kept.
    async fn leave(&mut self) -> SessionResult<()> {
        if self.state.channel().is_none() {
            return Err(UserInputError::NotConnected.into());
        }
        self.state.set_leave_requested(true);
        self.invalidate();
        self.state.mark_idle(Utc::now());
        if let Err(e) = self.transport.stop().await {
            debug!(session = %self.key(), "Transport stop: {}", e);
        }
        self.transport.disconnect().await?;
        self.state.set_channel(None);
        info!(session = %self.key(), "👋 Left voice channel");
        Ok(())
    }

    async fn disconnect(&mut self, reason: DisconnectReason) {
        self.state.set_leave_requested(true);
        self.stop().await;
        if let Err(e) = self.transport.disconnect().await {
            warn!(session = %self.key(), "⚠️ Disconnect failed: {}", e);
        }
        self.state.set_channel(None);
        info!(session = %self.key(), "👋 Disconnected: {:?}", reason);
        self.notify(Notice::Disconnected { reason }).await;
    }

    async fn transport_disconnected(&mut self) {
        if self.state.take_leave_requested() {
            debug!(session = %self.key(), "Voice connection closed as requested");
            self.state.set_channel(None);
            return;
        }

        warn!(session = %self.key(), "🚪 Removed from voice channel, clearing queue");
        self.stop().await;
        self.state.set_channel(None);
        self.notify(Notice::Kicked).await;
    }

    fn channel_moved(&mut self, channel: ChannelRef) {
        match self.state.channel() {
            Some(current) if current != channel => {
                info!(session = %self.key(), "🔀 Moved from voice channel {} to {}", current, channel);
                self.state.set_channel(Some(channel));
            }
            _ => {}
        }
    }

    async fn set_filter(&mut self, filter: Option<AudioFilter>) -> SessionResult<bool> {
        self.update_settings(|s| s.filter = filter).await;
        match filter {
            Some(f) => info!(session = %self.key(), "🎚️ Filter set to {}", f),
            None => info!(session = %self.key(), "🎚️ Filters cleared"),
        }

        let current = match (self.is_streaming(), self.state.now_playing()) {
            (true, Some(track)) => track.clone(),
            _ => return Ok(false),
        };

        // Restarting goes through the normal finish path; with loop=track the
        // scheduler repeats the current track on its own.
        if self.state.loop_mode() != LoopMode::Track {
            self.state.push_front(current);
        }
        self.transport.stop().await?;
        Ok(true)
    }

    fn history_page(&self, page: usize, per_page: usize) -> HistoryPage {
        let per_page = per_page.max(1);
        let total = self.state.history_len();
        let total_pages = total.div_ceil(per_page).max(1);
        let current_page = page.clamp(1, total_pages);
        let first = (current_page - 1) * per_page + 1;
        let entries = self
            .state
            .history_page(current_page, per_page)
            .into_iter()
            .enumerate()
            .map(|(i, entry)| (first + i, entry))
            .collect();

        HistoryPage {
            entries,
            current_page,
            total_pages,
            total,
        }
    }

    fn replay(&mut self, index: usize, requester: UserRef) -> SessionResult<(Track, usize)> {
        let track = self
            .state
            .history_entry(index)
            .and_then(|entry| entry.track.clone().into_track(requester))
            .ok_or(UserInputError::NoHistoryEntry(index))?
            .requested_by(requester);

        let now = Utc::now();
        let position = self.state.add_track(track.clone(), now)?;
        self.state.touch(now);
        Ok((track, position))
    }

    fn import_queue(&mut self, export: QueueExport, requester: UserRef) -> SessionResult<usize> {
        let tracks = QueueSnapshot { tracks: export.tracks }.into_remote_tracks(requester);
        if tracks.is_empty() {
            return Err(UserInputError::EmptyQueue.into());
        }

        let now = Utc::now();
        let imported = self.state.replace_queue(tracks, now);
        self.state.touch(now);
        info!(
            session = %self.key(),
            "📥 Imported {} tracks exported by {} from {}",
            imported,
            export.exported_by,
            export.session_id
        );
        Ok(imported)
    }

    async fn save_playlist(&mut self, name: &str) -> SessionResult<usize> {
        let snapshot = self.recovery_snapshot();
        if snapshot.is_empty() {
            return Err(UserInputError::EmptyQueue.into());
        }
        self.store.save_playlist(self.key(), name, &snapshot).await?;
        Ok(snapshot.len())
    }

    async fn load_playlist(&mut self, name: &str, requester: UserRef) -> SessionResult<usize> {
        let snapshot = self.store.load_playlist(self.key(), name).await?;
        let now = Utc::now();
        let added = self.state.add_tracks(snapshot.into_tracks(requester), now);
        self.state.touch(now);
        Ok(added)
    }

    async fn idle_tick(&mut self, now: DateTime<Utc>) -> MonitorAction {
        let Some(channel) = self.state.channel() else {
            return MonitorAction::Nothing;
        };
        let settings = &self.state.settings;
        if settings.stay_always || !settings.auto_disconnect {
            return MonitorAction::Nothing;
        }

        let view = IdleView {
            stay_always: settings.stay_always,
            auto_disconnect: settings.auto_disconnect,
            last_activity: self.state.last_activity(),
            empty_since: self.state.empty_since(),
            occupancy: self.transport.occupancy(channel).await,
        };

        match evaluate(&view, now, &self.options.monitor) {
            MonitorAction::Nothing => MonitorAction::Nothing,
            MonitorAction::Disconnect(reason) => {
                self.disconnect(reason).await;
                MonitorAction::Disconnect(reason)
            }
            MonitorAction::Countdown(seconds) => {
                if !self.state.mark_countdown(seconds) {
                    return MonitorAction::Nothing;
                }
                info!(session = %self.key(), "⏳ Disconnecting in {}s unless something is queued", seconds);
                self.notify(Notice::Countdown { seconds }).await;
                MonitorAction::Countdown(seconds)
            }
        }
    }

    // Playback

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::PlaybackFinished { epoch, outcome } => self.on_playback_finished(epoch, outcome).await,
            SessionEvent::SourceResolved { epoch, track, result } => {
                self.on_source_resolved(epoch, track, result).await
            }
            SessionEvent::AutoplayFetched {
                epoch,
                exclude_id,
                result,
            } => self.on_autoplay_fetched(epoch, exclude_id, result).await,
            SessionEvent::Retry { epoch } => {
                if epoch == self.epoch && self.chain.is_some() {
                    self.schedule(ScheduleReason::Failed).await;
                }
            }
        }
    }

    /// `spent` counts attempts already used up before the chain opened.
    fn open_chain(&mut self, last: Option<Track>, spent: usize) {
        let candidates = self.state.len().max(self.state.backup_len()) + spent;
        self.chain = Some(StartChain {
            budget: RetryBudget::for_chain(candidates),
            last,
        });
        self.state.mark_starting();
    }

    async fn begin_chain(&mut self, reason: ScheduleReason, last: Option<Track>) {
        self.open_chain(last, 0);
        self.schedule(reason).await;
    }

    /// Asks the scheduler what to do next and starts doing it.
    async fn schedule(&mut self, reason: ScheduleReason) {
        let last = self.chain.as_ref().and_then(|chain| chain.last.clone());
        let decision = decide(&SchedulerView::of(&self.state, last.as_ref(), reason));
        debug!(session = %self.key(), ?reason, ?decision, "🧭 Scheduling");

        match decision {
            Decision::RepeatTrack => match last {
                Some(track) => {
                    debug!(session = %self.key(), "🔂 Repeating: {}", track.title);
                    self.start_candidate(track);
                }
                None => self.go_idle(Notice::QueueEmpty).await,
            },
            Decision::Advance => self.advance().await,
            Decision::RefillFromBackup => {
                self.state.refill_from_backup();
                self.notify(Notice::QueueLooped).await;
                self.advance().await;
            }
            Decision::AutoplayFetch { seed_title, exclude_id } => self.fetch_autoplay(seed_title, exclude_id),
            Decision::GoIdle => self.go_idle(Notice::QueueEmpty).await,
        }
    }

    async fn advance(&mut self) {
        match self.state.pop_next() {
            Some(track) => self.start_candidate(track),
            None => self.go_idle(Notice::QueueEmpty).await,
        }
    }

    /// Resolves `track` off the actor; the result comes back as an event.
    fn start_candidate(&mut self, track: Track) {
        self.state.mark_starting();
        let epoch = self.epoch;
        let resolver = self.resolver.clone();
        let events = self.events_tx.clone();
        debug!(session = %self.key(), "🔍 Preparing: {}", track.title);

        tokio::spawn(async move {
            let result = resolver.stream(&track).await;
            let _ = events.send(SessionEvent::SourceResolved { epoch, track, result });
        });
    }

    fn fetch_autoplay(&mut self, seed_title: String, exclude_id: String) {
        let epoch = self.epoch;
        let resolver = self.resolver.clone();
        let events = self.events_tx.clone();
        let limit = self.options.autoplay_candidates;
        info!(session = %self.key(), "🎲 Looking for something like '{}'", seed_title);

        tokio::spawn(async move {
            let result = resolver.search_related(&seed_title, &exclude_id, limit).await;
            let _ = events.send(SessionEvent::AutoplayFetched {
                epoch,
                exclude_id,
                result,
            });
        });
    }

    async fn on_source_resolved(&mut self, epoch: u64, track: Track, result: Result<PlayableSource, ResolveError>) {
        if epoch != self.epoch || self.state.phase() != PlaybackPhase::Starting {
            debug!(session = %self.key(), "🗑️ Dropping stale start of {}", track.title);
            return;
        }

        let source = match result {
            Ok(source) => source,
            Err(e) => {
                debug!(session = %self.key(), retryable = e.is_retryable(), "Could not prepare {}: {}", track.title, e);
                return self.on_start_failed(track, e.to_string()).await;
            }
        };

        let signal = FinishedSignal {
            events: self.events_tx.clone(),
            epoch,
        };
        let (volume, filter) = (self.state.settings.volume, self.state.settings.filter);
        let started = self.transport.play(source, volume, filter, signal).await;
        match started {
            Ok(()) => self.on_started(track).await,
            Err(e) => self.on_start_failed(track, e.to_string()).await,
        }
    }

    async fn on_started(&mut self, track: Track) {
        let now = Utc::now();
        self.chain = None;
        self.state.mark_started(track.clone(), false, now);

        let entry = self.state.add_to_history(&track, now);
        if let Err(e) = self
            .store
            .append_history(self.key(), &entry, self.options.history_limit)
            .await
        {
            warn!(session = %self.key(), "⚠️ Could not record history: {}", e);
        }

        info!(session = %self.key(), "🎵 Now playing: {}", track.title);
        let next = self.state.tracks().next().cloned();
        self.notify(Notice::NowPlaying { track, next }).await;
    }

    async fn on_start_failed(&mut self, track: Track, reason: String) {
        let key = self.key();
        let (verdict, failures) = match self.chain.as_mut() {
            Some(chain) => (chain.budget.record_failure(key, &track, &reason), chain.budget.failures()),
            None => (RetryVerdict::GiveUp, 1),
        };
        self.notify(Notice::TrackFailed { track, reason }).await;

        match verdict {
            RetryVerdict::TryNext => {
                let _ = self.events_tx.send(SessionEvent::Retry { epoch: self.epoch });
            }
            RetryVerdict::GiveUp => {
                error!(session = %key, "❌ Giving up after {} failed tracks", failures);
                self.go_idle(Notice::PlaybackGaveUp { failures }).await;
            }
        }
    }

    async fn on_playback_finished(&mut self, epoch: u64, outcome: PlaybackOutcome) {
        if epoch != self.epoch || !self.is_streaming() {
            debug!(session = %self.key(), "🗑️ Dropping stale finish: {:?}", outcome);
            return;
        }

        let finished = self.state.take_now_playing();
        let skipped = std::mem::take(&mut self.skip_pending);

        match outcome {
            PlaybackOutcome::Errored(reason) if !skipped => {
                self.open_chain(finished.clone(), 1);
                match finished {
                    Some(track) => self.on_start_failed(track, reason).await,
                    None => self.schedule(ScheduleReason::Failed).await,
                }
            }
            _ => {
                if let Some(track) = &finished {
                    debug!(session = %self.key(), "🏁 Finished: {}", track.title);
                }
                let reason = if skipped {
                    ScheduleReason::Skipped
                } else {
                    ScheduleReason::Finished
                };
                self.begin_chain(reason, finished).await;
            }
        }
    }

    async fn on_autoplay_fetched(
        &mut self,
        epoch: u64,
        exclude_id: String,
        result: Result<Vec<Track>, ResolveError>,
    ) {
        if epoch != self.epoch || self.chain.is_none() {
            debug!(session = %self.key(), "🗑️ Dropping stale autoplay result");
            return;
        }

        let candidates = match result {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(session = %self.key(), "⚠️ Autoplay lookup failed: {}", e);
                return self
                    .go_idle(Notice::AutoplayFailed {
                        reason: e.to_string(),
                    })
                    .await;
            }
        };

        let Some(track) = pick_autoplay(candidates, &exclude_id) else {
            info!(session = %self.key(), "🎲 No related tracks found");
            return self.go_idle(Notice::NoRelatedTracks).await;
        };
        // Autoplay picks are credited to whoever asked for the seed.
        let track = match self.chain.as_ref().and_then(|chain| chain.last.as_ref()) {
            Some(seed) => track.requested_by(seed.requester),
            None => track,
        };

        if let Err(e) = self.state.add_track(track.clone(), Utc::now()) {
            return self
                .go_idle(Notice::AutoplayFailed {
                    reason: e.to_string(),
                })
                .await;
        }
        info!(session = %self.key(), "🎲 Autoplay queued: {}", track.title);
        self.notify(Notice::AutoQueued { track }).await;
        self.advance().await;
    }

    async fn go_idle(&mut self, notice: Notice) {
        self.chain = None;
        self.state.mark_idle(Utc::now());
        debug!(session = %self.key(), "💤 Session idle");
        self.notify(notice).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::{notice::MockNotifier, track::SourceRef, transport::TransportError},
        sources::MockMediaResolver,
        storage::{JsonStorage, MockSessionStore, StoreError},
    };
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    /// Records plays and lets tests end them.
    #[derive(Default)]
    struct FakeTransport {
        signal: Mutex<Option<FinishedSignal>>,
        plays: Mutex<Vec<PlayableSource>>,
        filters: Mutex<Vec<Option<AudioFilter>>>,
        connected: Mutex<Option<ChannelRef>>,
        /// When set, only this channel has listeners.
        occupied: Mutex<Option<ChannelRef>>,
    }

    impl FakeTransport {
        fn finish(&self, outcome: PlaybackOutcome) {
            if let Some(signal) = self.signal.lock().take() {
                signal.finished(outcome);
            }
        }

        fn play_count(&self) -> usize {
            self.plays.lock().len()
        }
    }

    #[async_trait]
    impl VoiceTransport for FakeTransport {
        async fn connect(&self, channel: ChannelRef) -> Result<(), TransportError> {
            *self.connected.lock() = Some(channel);
            Ok(())
        }

        async fn move_to(&self, channel: ChannelRef) -> Result<(), TransportError> {
            *self.connected.lock() = Some(channel);
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), TransportError> {
            *self.connected.lock() = None;
            Ok(())
        }

        async fn play(
            &self,
            source: PlayableSource,
            _volume: f32,
            filter: Option<AudioFilter>,
            on_finished: FinishedSignal,
        ) -> Result<(), TransportError> {
            self.plays.lock().push(source);
            self.filters.lock().push(filter);
            *self.signal.lock() = Some(on_finished);
            Ok(())
        }

        async fn pause(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn resume(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn stop(&self) -> Result<(), TransportError> {
            self.finish(PlaybackOutcome::Completed);
            Ok(())
        }

        async fn is_playing(&self) -> bool {
            self.signal.lock().is_some()
        }

        async fn is_paused(&self) -> bool {
            false
        }

        async fn set_volume(&self, _volume: f32) -> Result<(), TransportError> {
            Ok(())
        }

        async fn occupancy(&self, channel: ChannelRef) -> usize {
            match *self.occupied.lock() {
                Some(occupied) if occupied != channel => 0,
                _ => 1,
            }
        }
    }

    /// Holds every stream lookup until released.
    struct GatedResolver {
        gate: Notify,
    }

    #[async_trait]
    impl MediaResolver for GatedResolver {
        async fn resolve(&self, _query: &str, _requester: UserRef) -> Result<crate::sources::ResolvedTrack, ResolveError> {
            Err(ResolveError::NotFound(String::new()))
        }

        async fn search_related(&self, _seed: &str, _exclude: &str, _limit: usize) -> Result<Vec<Track>, ResolveError> {
            Ok(Vec::new())
        }

        async fn stream(&self, track: &Track) -> Result<PlayableSource, ResolveError> {
            self.gate.notified().await;
            Ok(PlayableSource::Remote(track.id.clone()))
        }
    }

    struct Harness {
        handle: SessionHandle,
        transport: Arc<FakeTransport>,
        notices: Arc<Mutex<Vec<Notice>>>,
        store: Arc<dyn SessionStore>,
        _dir: TempDir,
    }

    fn track(id: &str, secs: u64) -> Track {
        Track::new(id, format!("Song {}", id), SourceRef::Url(format!("https://youtu.be/{}", id)), UserRef(7))
            .with_duration(Duration::from_secs(secs))
    }

    fn streaming_resolver() -> MockMediaResolver {
        let mut resolver = MockMediaResolver::new();
        resolver
            .expect_stream()
            .returning(|t: &Track| Ok(PlayableSource::Remote(t.id.clone())));
        resolver
    }

    async fn harness(resolver: Arc<dyn MediaResolver>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn SessionStore> = Arc::new(JsonStorage::new(dir.path().to_path_buf()).await.unwrap());
        spawn_with(resolver, store, dir).await
    }

    fn services(
        resolver: Arc<dyn MediaResolver>,
        store: Arc<dyn SessionStore>,
        transport: Arc<FakeTransport>,
        notices: Arc<Mutex<Vec<Notice>>>,
    ) -> SessionServices {
        let sink = notices;
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .returning(move |_, _, notice| sink.lock().push(notice));

        let bound = transport;
        let transports: Arc<dyn TransportFactory> =
            Arc::new(move |_key: SessionKey| -> Arc<dyn VoiceTransport> { bound.clone() });

        SessionServices {
            transports,
            resolver,
            store,
            notifier: Arc::new(notifier),
            options: SessionOptions::default(),
        }
    }

    async fn spawn_with(resolver: Arc<dyn MediaResolver>, store: Arc<dyn SessionStore>, dir: TempDir) -> Harness {
        let transport = Arc::new(FakeTransport::default());
        let notices = Arc::new(Mutex::new(Vec::new()));
        let services = services(resolver, store.clone(), transport.clone(), notices.clone());
        let handle = SessionActor::spawn(SessionKey(42), &services);
        handle.set_notify_target(ChannelRef(99)).await.unwrap();
        handle.join(ChannelRef(5)).await.unwrap();

        Harness {
            handle,
            transport,
            notices,
            store,
            _dir: dir,
        }
    }

    async fn wait_for(handle: &SessionHandle, what: &str, pred: impl Fn(&QueueInfo) -> bool) -> QueueInfo {
        for _ in 0..400 {
            let info = handle.info().await.unwrap();
            if pred(&info) {
                return info;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    fn playing(id: &'static str) -> impl Fn(&QueueInfo) -> bool {
        move |info: &QueueInfo| info.phase == PlaybackPhase::Playing && info.current.as_ref().map(|t| t.id.as_str()) == Some(id)
    }

    fn idle(info: &QueueInfo) -> bool {
        info.phase == PlaybackPhase::Idle
    }

    fn queued_ids(info: &QueueInfo) -> Vec<String> {
        info.items.iter().map(|t| t.id.clone()).collect()
    }

    #[tokio::test]
    async fn test_finishing_a_then_b_leaves_session_idle() {
        let h = harness(Arc::new(streaming_resolver())).await;
        h.handle.enqueue(track("A", 180)).await.unwrap();
        h.handle.enqueue(track("B", 200)).await.unwrap();
        assert!(h.handle.start_if_idle().await.unwrap());

        wait_for(&h.handle, "A playing", playing("A")).await;
        h.transport.finish(PlaybackOutcome::Completed);

        let info = wait_for(&h.handle, "B playing", playing("B")).await;
        assert!(info.items.is_empty());

        h.transport.finish(PlaybackOutcome::Completed);
        let info = wait_for(&h.handle, "idle", idle).await;
        assert!(info.current.is_none());
        assert!(info.items.is_empty());
        assert!(info.empty_since.is_some());
        assert!(h.notices.lock().contains(&Notice::QueueEmpty));
    }

    #[tokio::test]
    async fn test_stop_twice_stays_idle() {
        let h = harness(Arc::new(streaming_resolver())).await;
        h.handle.enqueue(track("A", 60)).await.unwrap();
        h.handle.enqueue(track("B", 60)).await.unwrap();
        h.handle.set_loop_mode(LoopMode::Queue).await.unwrap();
        h.handle.start_if_idle().await.unwrap();
        wait_for(&h.handle, "A playing", playing("A")).await;

        h.handle.stop().await.unwrap();
        let first = h.handle.info().await.unwrap();
        h.handle.stop().await.unwrap();
        let second = h.handle.info().await.unwrap();

        for info in [&first, &second] {
            assert_eq!(info.phase, PlaybackPhase::Idle);
            assert!(info.current.is_none());
            assert!(info.items.is_empty());
            assert_eq!(info.loop_mode, LoopMode::Off);
            assert!(info.empty_since.is_some());
        }
        assert_eq!(first.empty_since, second.empty_since);

        // The finish caused by stopping the transport belongs to a dead epoch.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.transport.play_count(), 1);
    }

    #[tokio::test]
    async fn test_track_loop_repeats_same_track() {
        let h = harness(Arc::new(streaming_resolver())).await;
        h.handle.enqueue(track("A", 60)).await.unwrap();
        h.handle.enqueue(track("B", 60)).await.unwrap();
        h.handle.set_loop_mode(LoopMode::Track).await.unwrap();
        h.handle.start_if_idle().await.unwrap();

        for round in 1..=3 {
            wait_for(&h.handle, "A playing", playing("A")).await;
            assert_eq!(h.transport.play_count(), round);
            h.transport.finish(PlaybackOutcome::Completed);
            wait_for(&h.handle, "next play", |_| h.transport.play_count() > round).await;
        }

        let info = wait_for(&h.handle, "A playing", playing("A")).await;
        assert_eq!(queued_ids(&info), vec!["B"]);
    }

    #[tokio::test]
    async fn test_skip_ignores_track_loop() {
        let h = harness(Arc::new(streaming_resolver())).await;
        h.handle.enqueue(track("A", 60)).await.unwrap();
        h.handle.enqueue(track("B", 60)).await.unwrap();
        h.handle.set_loop_mode(LoopMode::Track).await.unwrap();
        h.handle.start_if_idle().await.unwrap();
        wait_for(&h.handle, "A playing", playing("A")).await;

        assert_eq!(h.handle.skip().await.unwrap().id, "A");
        wait_for(&h.handle, "B playing", playing("B")).await;
    }

    #[tokio::test]
    async fn test_queue_loop_refills_in_original_order() {
        let h = harness(Arc::new(streaming_resolver())).await;
        for id in ["A", "B", "C"] {
            h.handle.enqueue(track(id, 60)).await.unwrap();
        }
        h.handle.set_loop_mode(LoopMode::Queue).await.unwrap();
        h.handle.start_if_idle().await.unwrap();

        for id in ["A", "B", "C", "A", "B", "C", "A"] {
            wait_for(&h.handle, id, playing(id)).await;
            h.transport.finish(PlaybackOutcome::Completed);
        }
        assert!(h.notices.lock().iter().filter(|n| **n == Notice::QueueLooped).count() >= 2);
    }

    #[tokio::test]
    async fn test_autoplay_without_candidates_goes_idle() {
        let mut resolver = streaming_resolver();
        resolver
            .expect_search_related()
            .times(1)
            .returning(|_, _, _| Ok(Vec::new()));
        let h = harness(Arc::new(resolver)).await;

        h.handle.set_autoplay(true).await.unwrap();
        h.handle.enqueue(track("A", 60)).await.unwrap();
        h.handle.start_if_idle().await.unwrap();
        wait_for(&h.handle, "A playing", playing("A")).await;

        h.transport.finish(PlaybackOutcome::Completed);
        let info = wait_for(&h.handle, "idle", idle).await;
        assert!(info.current.is_none());
        assert!(h.notices.lock().contains(&Notice::NoRelatedTracks));
    }

    #[tokio::test]
    async fn test_autoplay_queues_one_related_track() {
        let mut resolver = streaming_resolver();
        resolver
            .expect_search_related()
            .withf(|seed, exclude, limit| seed.to_string() == "Song A" && exclude.to_string() == "A" && *limit == 5)
            .times(1)
            .returning(|_, _, _| {
                let nobody = UserRef(0);
                Ok(vec![
                    track("A", 60),
                    track("R1", 90).requested_by(nobody),
                    track("R2", 90).requested_by(nobody),
                ])
            });
        let h = harness(Arc::new(resolver)).await;

        h.handle.set_autoplay(true).await.unwrap();
        h.handle.enqueue(track("A", 60)).await.unwrap();
        h.handle.start_if_idle().await.unwrap();
        wait_for(&h.handle, "A playing", playing("A")).await;

        h.transport.finish(PlaybackOutcome::Completed);
        let info = wait_for(&h.handle, "R1 playing", playing("R1")).await;
        assert!(info.items.is_empty());
        assert_eq!(info.current.map(|t| t.requester), Some(UserRef(7)));
    }

    #[tokio::test]
    async fn test_all_failing_queue_gives_up_after_five() {
        let mut resolver = MockMediaResolver::new();
        resolver
            .expect_stream()
            .times(5)
            .returning(|_| Err(ResolveError::Unavailable("boom".into())));
        let h = harness(Arc::new(resolver)).await;

        for id in ["1", "2", "3", "4", "5"] {
            h.handle.enqueue(track(id, 60)).await.unwrap();
        }
        h.handle.start_if_idle().await.unwrap();

        wait_for(&h.handle, "gave up", |_| {
            h.notices
                .lock()
                .iter()
                .any(|n| matches!(n, Notice::PlaybackGaveUp { .. }))
        })
        .await;
        let info = wait_for(&h.handle, "idle", idle).await;
        assert!(info.items.is_empty());
        assert_eq!(h.transport.play_count(), 0);

        let notices = h.notices.lock();
        let failed = notices
            .iter()
            .filter(|n| matches!(n, Notice::TrackFailed { .. }))
            .count();
        assert_eq!(failed, 5);
        assert!(notices.contains(&Notice::PlaybackGaveUp { failures: 5 }));
    }

    #[tokio::test]
    async fn test_errored_playback_moves_to_next_track() {
        let h = harness(Arc::new(streaming_resolver())).await;
        h.handle.enqueue(track("A", 60)).await.unwrap();
        h.handle.enqueue(track("B", 60)).await.unwrap();
        h.handle.start_if_idle().await.unwrap();
        wait_for(&h.handle, "A playing", playing("A")).await;

        h.transport.finish(PlaybackOutcome::Errored("decoder died".into()));
        wait_for(&h.handle, "B playing", playing("B")).await;
        assert!(h
            .notices
            .lock()
            .iter()
            .any(|n| matches!(n, Notice::TrackFailed { track, .. } if track.id == "A")));
    }

    #[tokio::test]
    async fn test_volume_out_of_range_keeps_default() {
        let h = harness(Arc::new(streaming_resolver())).await;
        let err = h.handle.set_volume(150).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::UserInput(UserInputError::VolumeOutOfRange(150))
        ));
        assert_eq!(h.handle.info().await.unwrap().settings.volume, 0.5);

        h.handle.set_volume(80).await.unwrap();
        assert_eq!(h.handle.info().await.unwrap().settings.volume, 0.8);
    }

    #[tokio::test]
    async fn test_positions_are_reported_without_mutation() {
        let h = harness(Arc::new(streaming_resolver())).await;
        h.handle.enqueue(track("A", 60)).await.unwrap();
        let err = h.handle.remove_at(3).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::UserInput(UserInputError::PositionOutOfRange { position: 3, len: 1 })
        ));
        assert_eq!(h.handle.info().await.unwrap().total_items, 1);
    }

    #[tokio::test]
    async fn test_idle_session_disconnects_once_after_timeout() {
        let h = harness(Arc::new(streaming_resolver())).await;
        let t0 = h.handle.info().await.unwrap().empty_since.unwrap();

        let action = h.handle.idle_tick(t0 + ChronoDuration::seconds(301)).await.unwrap();
        assert!(matches!(action, MonitorAction::Disconnect(_)));
        let again = h.handle.idle_tick(t0 + ChronoDuration::seconds(316)).await.unwrap();
        assert_eq!(again, MonitorAction::Nothing);

        let info = h.handle.info().await.unwrap();
        assert_eq!(info.channel, None);
        assert_eq!(info.phase, PlaybackPhase::Idle);
        assert!(h.transport.connected.lock().is_none());
        let disconnects = h
            .notices
            .lock()
            .iter()
            .filter(|n| matches!(n, Notice::Disconnected { .. }))
            .count();
        assert_eq!(disconnects, 1);
    }

    #[tokio::test]
    async fn test_countdown_is_announced_once_per_threshold() {
        let h = harness(Arc::new(streaming_resolver())).await;
        let t0 = h.handle.info().await.unwrap().empty_since.unwrap();
        // Keep activity fresh so only the empty-queue rule applies.
        h.handle.set_stay_always(false).await.unwrap();

        let at = |secs| t0 + ChronoDuration::seconds(secs);
        assert_eq!(h.handle.idle_tick(at(245)).await.unwrap(), MonitorAction::Countdown(60));
        assert_eq!(h.handle.idle_tick(at(250)).await.unwrap(), MonitorAction::Nothing);
        assert_eq!(h.handle.idle_tick(at(260)).await.unwrap(), MonitorAction::Countdown(45));
        assert_eq!(
            h.notices
                .lock()
                .iter()
                .filter(|n| matches!(n, Notice::Countdown { .. }))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_stay_always_is_never_disconnected() {
        let h = harness(Arc::new(streaming_resolver())).await;
        h.handle.set_stay_always(true).await.unwrap();
        let later = Utc::now() + ChronoDuration::hours(3);
        assert_eq!(h.handle.idle_tick(later).await.unwrap(), MonitorAction::Nothing);
        assert_eq!(h.handle.info().await.unwrap().channel, Some(ChannelRef(5)));
    }

    #[tokio::test]
    async fn test_stale_start_after_stop_is_discarded() {
        let resolver = Arc::new(GatedResolver { gate: Notify::new() });
        let h = harness(resolver.clone()).await;
        h.handle.enqueue(track("A", 60)).await.unwrap();
        h.handle.start_if_idle().await.unwrap();
        assert_eq!(h.handle.info().await.unwrap().phase, PlaybackPhase::Starting);

        h.handle.stop().await.unwrap();
        resolver.gate.notify_one();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let info = h.handle.info().await.unwrap();
        assert_eq!(info.phase, PlaybackPhase::Idle);
        assert!(info.current.is_none());
        assert_eq!(h.transport.play_count(), 0);
    }

    #[tokio::test]
    async fn test_leave_keeps_queue_but_kick_clears_it() {
        let h = harness(Arc::new(streaming_resolver())).await;
        h.handle.enqueue(track("A", 60)).await.unwrap();
        h.handle.enqueue(track("B", 60)).await.unwrap();

        h.handle.leave().await.unwrap();
        h.handle.transport_disconnected().await.unwrap();
        assert_eq!(h.handle.info().await.unwrap().total_items, 2);
        assert!(!h.notices.lock().contains(&Notice::Kicked));

        h.handle.join(ChannelRef(5)).await.unwrap();
        h.handle.transport_disconnected().await.unwrap();
        let info = h.handle.info().await.unwrap();
        assert_eq!(info.total_items, 0);
        assert!(info.empty_since.is_some());
        assert!(h.notices.lock().contains(&Notice::Kicked));
    }

    #[tokio::test]
    async fn test_filter_change_restarts_current_track() {
        let h = harness(Arc::new(streaming_resolver())).await;
        h.handle.enqueue(track("A", 60)).await.unwrap();
        h.handle.enqueue(track("B", 60)).await.unwrap();
        h.handle.start_if_idle().await.unwrap();
        wait_for(&h.handle, "A playing", playing("A")).await;

        assert!(h.handle.set_filter(Some(AudioFilter::Nightcore)).await.unwrap());
        let info = wait_for(&h.handle, "A restarted", |_| h.transport.play_count() == 2).await;
        let info = if info.phase == PlaybackPhase::Playing {
            info
        } else {
            wait_for(&h.handle, "A playing", playing("A")).await
        };
        assert_eq!(info.current.as_ref().unwrap().id, "A");
        assert_eq!(queued_ids(&info), vec!["B"]);
        assert_eq!(h.transport.filters.lock().last().copied().flatten(), Some(AudioFilter::Nightcore));
    }

    #[tokio::test]
    async fn test_pause_and_resume_require_matching_phase() {
        let h = harness(Arc::new(streaming_resolver())).await;
        assert!(matches!(
            h.handle.pause().await,
            Err(SessionError::UserInput(UserInputError::NothingPlaying))
        ));

        h.handle.enqueue(track("A", 60)).await.unwrap();
        h.handle.start_if_idle().await.unwrap();
        wait_for(&h.handle, "A playing", playing("A")).await;

        assert!(matches!(
            h.handle.resume().await,
            Err(SessionError::UserInput(UserInputError::NotPaused))
        ));
        h.handle.pause().await.unwrap();
        assert_eq!(h.handle.info().await.unwrap().phase, PlaybackPhase::Paused);
        h.handle.resume().await.unwrap();
        assert_eq!(h.handle.info().await.unwrap().phase, PlaybackPhase::Playing);
    }

    #[tokio::test]
    async fn test_history_and_replay() {
        let h = harness(Arc::new(streaming_resolver())).await;
        h.handle.enqueue(track("A", 60)).await.unwrap();
        h.handle.enqueue(track("B", 60)).await.unwrap();
        h.handle.start_if_idle().await.unwrap();
        wait_for(&h.handle, "A playing", playing("A")).await;
        h.transport.finish(PlaybackOutcome::Completed);
        wait_for(&h.handle, "B playing", playing("B")).await;

        let page = h.handle.history(1, 10).await.unwrap();
        assert_eq!(page.total, 2);
        let ids: Vec<_> = page.entries.iter().map(|(i, e)| (*i, e.track.id.clone())).collect();
        assert_eq!(ids, vec![(1, "B".to_string()), (2, "A".to_string())]);

        let (replayed, position) = h.handle.replay(2, UserRef(9)).await.unwrap();
        assert_eq!(replayed.id, "A");
        assert_eq!(replayed.requester, UserRef(9));
        assert_eq!(position, 1);
        assert!(matches!(
            h.handle.replay(7, UserRef(9)).await,
            Err(SessionError::UserInput(UserInputError::NoHistoryEntry(7)))
        ));
    }

    #[tokio::test]
    async fn test_export_import_and_playlists() {
        let h = harness(Arc::new(streaming_resolver())).await;
        for id in ["A", "B", "C"] {
            h.handle.enqueue(track(id, 60)).await.unwrap();
        }

        let export = h.handle.export_queue("7").await.unwrap();
        assert_eq!(export.session_id, SessionKey(42));
        assert_eq!(export.tracks.len(), 3);

        assert_eq!(h.handle.save_playlist("mix").await.unwrap(), 3);
        h.handle.stop().await.unwrap();
        assert_eq!(h.handle.load_playlist("mix", UserRef(8)).await.unwrap(), 3);
        assert_eq!(h.handle.list_playlists().await.unwrap().len(), 1);

        let raw = export.to_json().unwrap();
        let parsed = QueueExport::from_json(raw.as_bytes()).unwrap();
        assert_eq!(h.handle.import_queue(parsed, UserRef(8)).await.unwrap(), 3);
        let info = h.handle.info().await.unwrap();
        assert_eq!(queued_ids(&info), vec!["A", "B", "C"]);

        let hits = h.handle.search_queue("song b").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 2);

        h.handle.delete_playlist("mix").await.unwrap();
        assert!(matches!(
            h.handle.delete_playlist("mix").await,
            Err(SessionError::Persistence(_))
        ));
    }

    #[tokio::test]
    async fn test_queue_and_settings_are_restored_on_restart() {
        let h = harness(Arc::new(streaming_resolver())).await;
        h.handle.enqueue(track("A", 60)).await.unwrap();
        h.handle.enqueue(track("B", 60)).await.unwrap();
        h.handle.set_volume(30).await.unwrap();
        h.handle.persist().await.unwrap();

        let Harness { store, _dir, .. } = h;
        let restarted = spawn_with(Arc::new(streaming_resolver()), store, _dir).await;
        let info = restarted.handle.info().await.unwrap();
        assert_eq!(queued_ids(&info), vec!["A", "B"]);
        assert_eq!(info.settings.volume, 0.3);
    }

    fn offline() -> StoreError {
        StoreError::NotFound("store offline".into())
    }

    fn failing_store() -> MockSessionStore {
        let mut store = MockSessionStore::new();
        store.expect_load_queue().returning(|_| Err(offline()));
        store.expect_save_queue().returning(|_, _| Err(offline()));
        store.expect_append_history().returning(|_, _, _| Err(offline()));
        store.expect_load_history().returning(|_| Err(offline()));
        store.expect_load_settings().returning(|_| Err(offline()));
        store.expect_save_settings().returning(|_, _| Err(offline()));
        store.expect_save_playlist().returning(|_, _, _| Err(offline()));
        store.expect_load_playlist().returning(|_, _| Err(offline()));
        store.expect_list_playlists().returning(|_| Err(offline()));
        store.expect_delete_playlist().returning(|_, _| Err(offline()));
        store
    }

    #[tokio::test]
    async fn test_store_failures_leave_session_running() {
        let dir = tempfile::tempdir().unwrap();
        let h = spawn_with(Arc::new(streaming_resolver()), Arc::new(failing_store()), dir).await;

        h.handle.enqueue(track("A", 60)).await.unwrap();
        h.handle.enqueue(track("B", 60)).await.unwrap();
        h.handle.set_volume(20).await.unwrap();
        h.handle.set_stay_always(true).await.unwrap();
        h.handle.start_if_idle().await.unwrap();
        wait_for(&h.handle, "A playing", playing("A")).await;
        h.transport.finish(PlaybackOutcome::Completed);
        let info = wait_for(&h.handle, "B playing", playing("B")).await;

        assert_eq!(info.settings.volume, 0.2);
        assert!(info.settings.stay_always);
        assert_eq!(h.handle.history(1, 10).await.unwrap().total, 2);

        assert!(matches!(h.handle.persist().await, Err(SessionError::Persistence(_))));
        assert!(matches!(
            h.handle.save_playlist("mix").await,
            Err(SessionError::Persistence(_))
        ));
        let info = h.handle.info().await.unwrap();
        assert_eq!(info.phase, PlaybackPhase::Playing);
        assert_eq!(info.current.map(|t| t.id), Some("B".to_string()));
    }

    #[tokio::test]
    async fn test_inconsistent_state_is_reset_to_idle() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn SessionStore> = Arc::new(JsonStorage::new(dir.path().to_path_buf()).await.unwrap());
        let transport = Arc::new(FakeTransport::default());
        let notices = Arc::new(Mutex::new(Vec::new()));
        let services = services(Arc::new(streaming_resolver()), store, transport, notices.clone());
        let (mut actor, _handle) = SessionActor::new(SessionKey(42), &services);

        let now = Utc::now();
        actor.state.set_notify_target(ChannelRef(99));
        actor.state.add_track(track("A", 60), now).unwrap();
        actor.state.set_phase(PlaybackPhase::Playing);
        let epoch = actor.epoch;

        assert!(matches!(actor.verify().await, Err(SessionError::InvariantViolation(_))));
        assert_eq!(actor.state.phase(), PlaybackPhase::Idle);
        assert!(actor.state.check_invariants().is_ok());
        assert_ne!(actor.epoch, epoch);
        assert!(matches!(notices.lock().as_slice(), [Notice::SessionReset { .. }]));

        assert!(actor.verify().await.is_ok());
    }

    #[tokio::test]
    async fn test_moved_channel_is_used_for_idle_checks() {
        let h = harness(Arc::new(streaming_resolver())).await;
        *h.transport.occupied.lock() = Some(ChannelRef(6));

        h.handle.channel_moved(ChannelRef(6)).await.unwrap();

        assert_eq!(h.handle.info().await.unwrap().channel, Some(ChannelRef(6)));
        assert_eq!(*h.transport.connected.lock(), Some(ChannelRef(5)));
        assert_eq!(h.handle.idle_tick(Utc::now()).await.unwrap(), MonitorAction::Nothing);
        assert!(h.notices.lock().is_empty());
    }

    #[tokio::test]
    async fn test_import_rejects_local_files() {
        let h = harness(Arc::new(streaming_resolver())).await;
        let raw = br#"{
            "session_id": 1,
            "exported_by": "someone",
            "exported_at": "2026-01-01T00:00:00Z",
            "tracks": [{"id": "p", "title": "x", "local_path": "/etc/passwd", "requester": "1"}]
        }"#;
        let export = QueueExport::from_json(raw).unwrap();

        assert!(matches!(
            h.handle.import_queue(export, UserRef(8)).await,
            Err(SessionError::UserInput(UserInputError::EmptyQueue))
        ));
        assert!(h.handle.info().await.unwrap().items.is_empty());
        assert_eq!(h.transport.play_count(), 0);
    }
}

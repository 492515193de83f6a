use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::{collections::VecDeque, str::FromStr, time::Duration};
use tracing::{debug, info};

use super::{
    effects::AudioFilter,
    snapshot::{HistoryEntry, QueueSnapshot, TrackRecord},
    track::{ChannelRef, SessionKey, Track, UserRef},
};
use crate::error::UserInputError;

pub const DEFAULT_MAX_HISTORY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    #[default]
    Off,
    Track,
    Queue,
}

impl FromStr for LoopMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" | "none" => Ok(LoopMode::Off),
            "track" | "song" | "current" => Ok(LoopMode::Track),
            "queue" | "all" => Ok(LoopMode::Queue),
            other => Err(format!("unknown loop mode '{}'", other)),
        }
    }
}

/// Where a session is in its playback lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPhase {
    Idle,
    /// A candidate is being resolved or handed to the transport.
    Starting,
    Playing,
    Paused,
}

/// Knobs that survive restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// 0.0 – 1.0
    pub volume: f32,
    pub autoplay: bool,
    pub filter: Option<AudioFilter>,
    pub stay_always: bool,
    pub auto_disconnect: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            volume: 0.5,
            autoplay: false,
            filter: None,
            stay_always: false,
            auto_disconnect: true,
        }
    }
}

/// Mutable state of one session. Owned exclusively by its actor.
#[derive(Debug)]
pub struct SessionState {
    key: SessionKey,
    items: VecDeque<Track>,
    now_playing: Option<Track>,
    backup: Vec<Track>,
    history: VecDeque<HistoryEntry>,
    loop_mode: LoopMode,
    phase: PlaybackPhase,
    pub settings: SessionSettings,
    last_activity: DateTime<Utc>,
    empty_since: Option<DateTime<Utc>>,
    notify_target: Option<ChannelRef>,
    channel: Option<ChannelRef>,
    leave_requested: bool,
    countdowns_sent: Vec<u64>,
    max_size: usize,
    max_history: usize,
}

impl SessionState {
    pub fn new(key: SessionKey, max_size: usize, now: DateTime<Utc>) -> Self {
        Self {
            key,
            items: VecDeque::new(),
            now_playing: None,
            backup: Vec::new(),
            history: VecDeque::new(),
            loop_mode: LoopMode::Off,
            phase: PlaybackPhase::Idle,
            settings: SessionSettings::default(),
            last_activity: now,
            empty_since: Some(now),
            notify_target: None,
            channel: None,
            leave_requested: false,
            countdowns_sent: Vec::new(),
            max_size,
            max_history: DEFAULT_MAX_HISTORY,
        }
    }

    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history.max(1);
        self
    }

    // Accessors

    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.items.iter()
    }

    pub fn now_playing(&self) -> Option<&Track> {
        self.now_playing.as_ref()
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn backup_len(&self) -> usize {
        self.backup.len()
    }

    pub fn phase(&self) -> PlaybackPhase {
        self.phase
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    pub fn empty_since(&self) -> Option<DateTime<Utc>> {
        self.empty_since
    }

    pub fn notify_target(&self) -> Option<ChannelRef> {
        self.notify_target
    }

    pub fn channel(&self) -> Option<ChannelRef> {
        self.channel
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    // Bookkeeping

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity = now;
    }

    pub fn set_notify_target(&mut self, target: ChannelRef) {
        self.notify_target = Some(target);
    }

    pub fn set_channel(&mut self, channel: Option<ChannelRef>) {
        self.channel = channel;
    }

    pub fn set_leave_requested(&mut self, requested: bool) {
        self.leave_requested = requested;
    }

    /// Returns the "user asked us to leave" flag and clears it.
    pub fn take_leave_requested(&mut self) -> bool {
        std::mem::take(&mut self.leave_requested)
    }

    pub fn set_phase(&mut self, phase: PlaybackPhase) {
        self.phase = phase;
    }

    /// Records that a countdown threshold was announced. Returns `false` if
    /// it already was during the current empty period.
    pub fn mark_countdown(&mut self, threshold: u64) -> bool {
        if self.countdowns_sent.contains(&threshold) {
            return false;
        }
        self.countdowns_sent.push(threshold);
        true
    }

    // Queue editing

    /// Appends a track; returns its 1-indexed position.
    pub fn add_track(&mut self, track: Track, now: DateTime<Utc>) -> Result<usize, UserInputError> {
        if self.items.len() >= self.max_size {
            return Err(UserInputError::QueueFull(self.max_size));
        }

        info!("➕ Added to queue of {}: {}", self.key, track.title);
        if self.loop_mode == LoopMode::Queue {
            self.backup.push(track.clone());
        }
        self.items.push_back(track);
        self.refresh_empty_since(now);
        Ok(self.items.len())
    }

    /// Appends as many tracks as fit; returns how many were added.
    pub fn add_tracks(&mut self, tracks: Vec<Track>, now: DateTime<Utc>) -> usize {
        let available = self.max_size.saturating_sub(self.items.len());
        let to_add = tracks.len().min(available);
        for track in tracks.into_iter().take(to_add) {
            if self.loop_mode == LoopMode::Queue {
                self.backup.push(track.clone());
            }
            self.items.push_back(track);
        }
        self.refresh_empty_since(now);
        info!("➕ Added {} tracks to queue of {}", to_add, self.key);
        to_add
    }

    /// Replaces the whole queue (import).
    pub fn replace_queue(&mut self, tracks: Vec<Track>, now: DateTime<Utc>) -> usize {
        self.items.clear();
        if self.loop_mode == LoopMode::Queue {
            self.backup.clear();
        }
        self.add_tracks(tracks, now)
    }

    /// Removes the track at 1-indexed `position`.
    pub fn remove_at(&mut self, position: usize, now: DateTime<Utc>) -> Result<Track, UserInputError> {
        self.check_position(position)?;
        let removed = self
            .items
            .remove(position - 1)
            .ok_or(UserInputError::PositionOutOfRange { position, len: self.items.len() })?;
        debug!("❌ Removed track at position {} from {}", position, self.key);
        self.refresh_empty_since(now);
        Ok(removed)
    }

    /// Moves a track between 1-indexed positions.
    pub fn move_track(&mut self, from: usize, to: usize) -> Result<(), UserInputError> {
        self.check_position(from)?;
        self.check_position(to)?;

        if from != to {
            if let Some(track) = self.items.remove(from - 1) {
                self.items.insert(to - 1, track);
            }
            debug!("📍 Moved track {} -> {} in {}", from, to, self.key);
        }
        Ok(())
    }

    pub fn shuffle(&mut self) -> Result<(), UserInputError> {
        if self.items.len() < 2 {
            return Err(UserInputError::NotEnoughTracks);
        }
        let mut items: Vec<_> = self.items.drain(..).collect();
        items.shuffle(&mut rand::thread_rng());
        self.items.extend(items);
        info!("🔀 Queue of {} shuffled", self.key);
        Ok(())
    }

    /// Switching to whole-queue loop snapshots the now-playing track followed
    /// by the queue; any other mode drops the backup.
    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        self.loop_mode = mode;
        self.backup.clear();
        match mode {
            LoopMode::Off => info!("➡️ Loop disabled for {}", self.key),
            LoopMode::Track => info!("🔂 Looping current track in {}", self.key),
            LoopMode::Queue => {
                self.backup.extend(self.now_playing.iter().cloned());
                self.backup.extend(self.items.iter().cloned());
                info!("🔁 Looping queue of {} ({} tracks)", self.key, self.backup.len());
            }
        }
    }

    /// Restores the backup as the queue.
    pub fn refill_from_backup(&mut self) -> usize {
        self.items = self.backup.iter().cloned().collect();
        info!("🔁 Queue of {} refilled from loop backup", self.key);
        self.items.len()
    }

    pub fn pop_next(&mut self) -> Option<Track> {
        self.items.pop_front()
    }

    /// Puts a track back at the head of the queue.
    pub fn push_front(&mut self, track: Track) {
        self.items.push_front(track);
        self.empty_since = None;
    }

    pub fn search(&self, query: &str, limit: usize) -> Vec<(usize, Track)> {
        let needle = query.to_lowercase();
        self.items
            .iter()
            .enumerate()
            .filter(|(_, t)| t.title.to_lowercase().contains(&needle))
            .take(limit)
            .map(|(i, t)| (i + 1, t.clone()))
            .collect()
    }

    // Playback transitions

    /// A candidate is being resolved; the session is no longer empty.
    pub fn mark_starting(&mut self) {
        self.phase = PlaybackPhase::Starting;
        self.empty_since = None;
    }

    /// A track is now streaming.
    pub fn mark_started(&mut self, track: Track, paused: bool, now: DateTime<Utc>) {
        self.now_playing = Some(track);
        self.phase = if paused { PlaybackPhase::Paused } else { PlaybackPhase::Playing };
        self.empty_since = None;
        self.countdowns_sent.clear();
        self.last_activity = now;
    }

    /// The transport stopped streaming; returns the track that was playing.
    pub fn take_now_playing(&mut self) -> Option<Track> {
        self.now_playing.take()
    }

    /// Nothing streams any more. Stamps empty-since when the queue is empty.
    pub fn mark_idle(&mut self, now: DateTime<Utc>) {
        self.now_playing = None;
        self.phase = PlaybackPhase::Idle;
        self.refresh_empty_since(now);
    }

    /// Clears the queue, the loop mode and its backup.
    pub fn clear(&mut self, now: DateTime<Utc>) {
        self.items.clear();
        self.backup.clear();
        self.loop_mode = LoopMode::Off;
        self.mark_idle(now);
        info!("🗑️ Queue of {} cleared", self.key);
    }

    fn refresh_empty_since(&mut self, now: DateTime<Utc>) {
        let idle = self.items.is_empty() && self.now_playing.is_none() && self.phase == PlaybackPhase::Idle;
        match (idle, self.empty_since) {
            (true, None) => {
                self.empty_since = Some(now);
                self.countdowns_sent.clear();
            }
            (false, Some(_)) => self.empty_since = None,
            _ => {}
        }
    }

    fn check_position(&self, position: usize) -> Result<(), UserInputError> {
        if position < 1 || position > self.items.len() {
            return Err(UserInputError::PositionOutOfRange {
                position,
                len: self.items.len(),
            });
        }
        Ok(())
    }

    /// Reports the first broken invariant, if any. A candidate that is being
    /// started occupies the now-playing slot for the empty-since rule.
    pub fn check_invariants(&self) -> Result<(), String> {
        let streaming = matches!(self.phase, PlaybackPhase::Playing | PlaybackPhase::Paused);
        if self.now_playing.is_some() != streaming {
            return Err(format!(
                "now-playing is {} while phase is {:?}",
                if self.now_playing.is_some() { "set" } else { "unset" },
                self.phase
            ));
        }
        let idle_and_empty = self.items.is_empty() && self.phase == PlaybackPhase::Idle;
        if self.empty_since.is_some() != idle_and_empty {
            return Err(format!(
                "empty-since is {} with {} queued tracks in phase {:?}",
                if self.empty_since.is_some() { "set" } else { "unset" },
                self.items.len(),
                self.phase
            ));
        }
        if !self.backup.is_empty() && self.loop_mode == LoopMode::Off {
            return Err("loop backup present while loop is off".to_string());
        }
        Ok(())
    }

    /// Drops every playback artefact after an invariant violation.
    pub fn reset_to_idle(&mut self, now: DateTime<Utc>) {
        self.backup.clear();
        self.loop_mode = LoopMode::Off;
        self.now_playing = None;
        self.phase = PlaybackPhase::Idle;
        self.empty_since = None;
        self.refresh_empty_since(now);
    }

    // History

    pub fn add_to_history(&mut self, track: &Track, now: DateTime<Utc>) -> HistoryEntry {
        let entry = HistoryEntry {
            played_at: now,
            track: TrackRecord::from(track),
        };
        self.history.push_back(entry.clone());
        while self.history.len() > self.max_history {
            self.history.pop_front();
        }
        entry
    }

    pub fn load_history(&mut self, entries: Vec<HistoryEntry>) {
        self.history = entries.into_iter().collect();
        while self.history.len() > self.max_history {
            self.history.pop_front();
        }
    }

    /// 1 is the most recently played track.
    pub fn history_entry(&self, index: usize) -> Option<&HistoryEntry> {
        if index == 0 {
            return None;
        }
        self.history.iter().rev().nth(index - 1)
    }

    /// Most recent first.
    pub fn history_page(&self, page: usize, per_page: usize) -> Vec<HistoryEntry> {
        let start = (page.max(1) - 1) * per_page;
        self.history.iter().rev().skip(start).take(per_page).cloned().collect()
    }

    // Views

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot::from_tracks(self.items.iter())
    }

    pub fn restore(&mut self, snapshot: QueueSnapshot, now: DateTime<Utc>) -> usize {
        let tracks = snapshot.into_tracks(UserRef(0));
        self.add_tracks(tracks, now)
    }

    pub fn get_info(&self) -> QueueInfo {
        QueueInfo {
            current: self.now_playing.clone(),
            items: self.items.iter().cloned().collect(),
            total_items: self.items.len(),
            loop_mode: self.loop_mode,
            phase: self.phase,
            settings: self.settings.clone(),
            total_duration: self.calculate_total_duration(),
            empty_since: self.empty_since,
            channel: self.channel,
        }
    }

    fn calculate_total_duration(&self) -> Duration {
        let queue_duration: Duration = self.items.iter().filter_map(|item| item.duration).sum();
        let current_duration = self
            .now_playing
            .as_ref()
            .and_then(|c| c.duration)
            .unwrap_or_default();
        queue_duration + current_duration
    }
}

/// Read-only projection of a session for rendering.
#[derive(Debug, Clone)]
pub struct QueueInfo {
    pub current: Option<Track>,
    pub items: Vec<Track>,
    pub total_items: usize,
    pub loop_mode: LoopMode,
    pub phase: PlaybackPhase,
    pub settings: SessionSettings,
    pub total_duration: Duration,
    pub empty_since: Option<DateTime<Utc>>,
    pub channel: Option<ChannelRef>,
}

impl QueueInfo {
    pub fn get_page(&self, page: usize, items_per_page: usize) -> QueuePage {
        let safe_page = page.max(1);
        let start = (safe_page - 1) * items_per_page;
        let end = (start + items_per_page).min(self.items.len());
        let total_pages = if self.total_items == 0 {
            1
        } else {
            self.total_items.div_ceil(items_per_page)
        };

        QueuePage {
            items: if start < self.items.len() {
                self.items[start..end].to_vec()
            } else {
                Vec::new()
            },
            first_position: start + 1,
            current_page: safe_page,
            total_pages,
            total_items: self.total_items,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuePage {
    pub items: Vec<Track>,
    pub first_position: usize,
    pub current_page: usize,
    pub total_pages: usize,
    pub total_items: usize,
}

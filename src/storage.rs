use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::audio::{
    queue::SessionSettings,
    snapshot::{HistoryEntry, QueueSnapshot},
    track::SessionKey,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Corrupt data: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Summary of a saved playlist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistSummary {
    pub name: String,
    pub tracks: usize,
}

/// Durable storage for sessions. Every call may fail; callers on the playback
/// path log failures and keep going with their in-memory state.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_queue(&self, key: SessionKey) -> Result<Option<QueueSnapshot>, StoreError>;

    async fn save_queue(&self, key: SessionKey, snapshot: &QueueSnapshot) -> Result<(), StoreError>;

    /// Appends one entry, keeping at most `limit` (oldest evicted).
    async fn append_history(&self, key: SessionKey, entry: &HistoryEntry, limit: usize) -> Result<(), StoreError>;

    async fn load_history(&self, key: SessionKey) -> Result<Vec<HistoryEntry>, StoreError>;

    async fn load_settings(&self, key: SessionKey) -> Result<Option<SessionSettings>, StoreError>;

    async fn save_settings(&self, key: SessionKey, settings: &SessionSettings) -> Result<(), StoreError>;

    async fn save_playlist(&self, key: SessionKey, name: &str, snapshot: &QueueSnapshot) -> Result<(), StoreError>;

    async fn load_playlist(&self, key: SessionKey, name: &str) -> Result<QueueSnapshot, StoreError>;

    async fn list_playlists(&self, key: SessionKey) -> Result<Vec<PlaylistSummary>, StoreError>;

    async fn delete_playlist(&self, key: SessionKey, name: &str) -> Result<(), StoreError>;
}

/// File-per-concern JSON storage:
///
/// ```text
/// data_dir/sessions/session_<key>/queue.json
///                                 settings.json
///                                 history.json
///                                 playlists/<name>.json
/// ```
pub struct JsonStorage {
    data_dir: PathBuf,
}

impl JsonStorage {
    pub async fn new(data_dir: PathBuf) -> Result<Self, StoreError> {
        fs::create_dir_all(data_dir.join("sessions")).await?;
        info!("📁 Storage initialized at: {}", data_dir.display());
        Ok(Self { data_dir })
    }

    /// Sessions with anything on disk.
    pub async fn list_sessions(&self) -> Result<Vec<SessionKey>, StoreError> {
        let mut keys = Vec::new();
        let mut dirs = fs::read_dir(self.data_dir.join("sessions")).await?;
        while let Some(entry) = dirs.next_entry().await? {
            let name = entry.file_name();
            if let Some(key) = name
                .to_str()
                .and_then(|n| n.strip_prefix("session_"))
                .and_then(|id| id.parse::<u64>().ok())
            {
                keys.push(SessionKey(key));
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn session_dir(&self, key: SessionKey) -> PathBuf {
        self.data_dir.join("sessions").join(format!("session_{}", key))
    }

    fn playlist_path(&self, key: SessionKey, name: &str) -> PathBuf {
        self.session_dir(key)
            .join("playlists")
            .join(format!("{}.json", sanitize_name(name)))
    }

    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
        match fs::read(path).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes through a temp file so a crash never leaves half a document.
    async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, path).await?;
        debug!("💾 Wrote {}", path.display());
        Ok(())
    }
}

/// Keeps playlist names usable as file names.
fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "playlist".to_string()
    } else {
        cleaned
    }
}

#[async_trait]
impl SessionStore for JsonStorage {
    async fn load_queue(&self, key: SessionKey) -> Result<Option<QueueSnapshot>, StoreError> {
        Self::read_json(&self.session_dir(key).join("queue.json")).await
    }

    async fn save_queue(&self, key: SessionKey, snapshot: &QueueSnapshot) -> Result<(), StoreError> {
        Self::write_json(&self.session_dir(key).join("queue.json"), snapshot).await
    }

    async fn append_history(&self, key: SessionKey, entry: &HistoryEntry, limit: usize) -> Result<(), StoreError> {
        let path = self.session_dir(key).join("history.json");
        let mut history: Vec<HistoryEntry> = match Self::read_json(&path).await {
            Ok(existing) => existing.unwrap_or_default(),
            Err(StoreError::Corrupt(e)) => {
                warn!("⚠️ History of {} was unreadable, starting over: {}", key, e);
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        history.push(entry.clone());
        if history.len() > limit {
            let excess = history.len() - limit;
            history.drain(..excess);
        }
        Self::write_json(&path, &history).await
    }

    async fn load_history(&self, key: SessionKey) -> Result<Vec<HistoryEntry>, StoreError> {
        Ok(Self::read_json(&self.session_dir(key).join("history.json"))
            .await?
            .unwrap_or_default())
    }

    async fn load_settings(&self, key: SessionKey) -> Result<Option<SessionSettings>, StoreError> {
        Self::read_json(&self.session_dir(key).join("settings.json")).await
    }

    async fn save_settings(&self, key: SessionKey, settings: &SessionSettings) -> Result<(), StoreError> {
        Self::write_json(&self.session_dir(key).join("settings.json"), settings).await
    }

    async fn save_playlist(&self, key: SessionKey, name: &str, snapshot: &QueueSnapshot) -> Result<(), StoreError> {
        Self::write_json(&self.playlist_path(key, name), snapshot).await?;
        info!("📝 Playlist '{}' saved for {} ({} tracks)", name, key, snapshot.len());
        Ok(())
    }

    async fn load_playlist(&self, key: SessionKey, name: &str) -> Result<QueueSnapshot, StoreError> {
        Self::read_json(&self.playlist_path(key, name))
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("playlist '{}'", name)))
    }

    async fn list_playlists(&self, key: SessionKey) -> Result<Vec<PlaylistSummary>, StoreError> {
        let dir = self.session_dir(key).join("playlists");
        let mut files = match fs::read_dir(&dir).await {
            Ok(files) => files,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut playlists = Vec::new();
        while let Some(entry) = files.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == "json") {
                if let Some(name) = path.file_stem().and_then(|n| n.to_str()) {
                    match Self::read_json::<QueueSnapshot>(&path).await {
                        Ok(Some(snapshot)) => playlists.push(PlaylistSummary {
                            name: name.to_string(),
                            tracks: snapshot.len(),
                        }),
                        Ok(None) => {}
                        Err(e) => warn!("⚠️ Skipping unreadable playlist {}: {}", path.display(), e),
                    }
                }
            }
        }
        playlists.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(playlists)
    }

    async fn delete_playlist(&self, key: SessionKey, name: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.playlist_path(key, name)).await {
            Ok(()) => {
                info!("🗑️ Playlist '{}' deleted for {}", name, key);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(format!("playlist '{}'", name)))
            }
            Err(e) => Err(e.into()),
        }
    }
}

//! Portable projections of a queue: restart recovery, saved playlists and
//! the export/import JSON document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use super::track::{SessionKey, SourceRef, Track, UserRef};

/// A track as it is written to disk. The requester is degraded to a string
/// id so documents survive moving between servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackRecord {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub uploader: String,
    pub requester: String,
}

impl From<&Track> for TrackRecord {
    fn from(track: &Track) -> Self {
        let (url, local_path) = match &track.source {
            SourceRef::Url(url) => (Some(url.clone()), None),
            SourceRef::LocalFile(path) => (None, Some(path.to_string_lossy().into_owned())),
        };
        Self {
            id: track.id.clone(),
            title: track.title.clone(),
            duration: track.duration.map(|d| d.as_secs()),
            url,
            local_path,
            thumbnail: track.thumbnail.clone(),
            uploader: track.uploader.clone(),
            requester: track.requester.to_string(),
        }
    }
}

impl TrackRecord {
    fn is_remote(&self) -> bool {
        self.url
            .as_deref()
            .and_then(|url| Url::parse(url).ok())
            .is_some_and(|url| matches!(url.scheme(), "http" | "https") && url.host_str().is_some())
    }

    /// Rebuilds a track. Records with neither a URL nor a file are dropped;
    /// a URL wins when both are present. Requesters that are not numeric ids
    /// fall back to `fallback`.
    pub fn into_track(self, fallback: UserRef) -> Option<Track> {
        let source = match (self.url, self.local_path) {
            (Some(url), _) => SourceRef::Url(url),
            (None, Some(path)) => SourceRef::LocalFile(path.into()),
            (None, None) => return None,
        };
        let requester = self.requester.parse().map(UserRef).unwrap_or(fallback);

        Some(Track {
            id: self.id,
            title: self.title,
            duration: self.duration.map(Duration::from_secs),
            source,
            thumbnail: self.thumbnail,
            uploader: self.uploader,
            requester,
        })
    }
}

/// Ordered snapshot of a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueSnapshot {
    pub tracks: Vec<TrackRecord>,
}

impl QueueSnapshot {
    pub fn from_tracks<'a>(tracks: impl IntoIterator<Item = &'a Track>) -> Self {
        Self {
            tracks: tracks.into_iter().map(TrackRecord::from).collect(),
        }
    }

    pub fn into_tracks(self, fallback: UserRef) -> Vec<Track> {
        self.tracks
            .into_iter()
            .filter_map(|record| record.into_track(fallback))
            .collect()
    }

    /// Like [`into_tracks`](Self::into_tracks) for documents from outside
    /// the bot: only records with an http(s) URL are kept. Local files and
    /// any other scheme are dropped.
    pub fn into_remote_tracks(self, fallback: UserRef) -> Vec<Track> {
        self.tracks
            .into_iter()
            .filter(TrackRecord::is_remote)
            .filter_map(|record| record.into_track(fallback))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// The queue export document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueExport {
    pub session_id: SessionKey,
    pub exported_by: String,
    pub exported_at: DateTime<Utc>,
    pub tracks: Vec<TrackRecord>,
}

impl QueueExport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(raw: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(raw)
    }
}

/// A played track with the time it started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub played_at: DateTime<Utc>,
    pub track: TrackRecord,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_export_document_shape() {
        let track = Track::new("abc", "Song A", SourceRef::Url("https://youtu.be/abc".into()), UserRef(42))
            .with_duration(Duration::from_secs(180))
            .with_uploader("Uploader");
        let export = QueueExport {
            session_id: SessionKey(1),
            exported_by: "dj#0001".into(),
            exported_at: Utc::now(),
            tracks: vec![TrackRecord::from(&track)],
        };

        let value: serde_json::Value = serde_json::from_str(&export.to_json().unwrap()).unwrap();
        assert_eq!(value["session_id"], 1);
        assert_eq!(value["tracks"][0]["requester"], "42");
        assert_eq!(value["tracks"][0]["duration"], 180);
        assert!(value["tracks"][0].get("local_path").is_none());

        let parsed = QueueExport::from_json(export.to_json().unwrap().as_bytes()).unwrap();
        let restored = QueueSnapshot { tracks: parsed.tracks }.into_tracks(UserRef(0));
        assert_eq!(restored, vec![track]);
    }

    #[test]
    fn test_records_without_source_are_dropped() {
        let record = TrackRecord {
            id: "x".into(),
            title: "Broken".into(),
            duration: None,
            url: None,
            local_path: None,
            thumbnail: None,
            uploader: String::new(),
            requester: "someone".into(),
        };
        assert!(record.into_track(UserRef(1)).is_none());
    }

    #[test]
    fn test_imported_documents_keep_only_web_links() {
        let raw = br#"{
            "session_id": 7,
            "exported_by": "someone",
            "exported_at": "2026-01-01T00:00:00Z",
            "tracks": [
                {"id": "p", "title": "x", "local_path": "/etc/passwd", "requester": "1"},
                {"id": "f", "title": "y", "url": "file:///etc/passwd", "requester": "1"},
                {"id": "h", "title": "z", "url": "http://example.com/a.mp3", "local_path": "/etc/shadow", "requester": "1"},
                {"id": "ok", "title": "Song", "url": "https://youtu.be/abc", "requester": "1"}
            ]
        }"#;
        let export = QueueExport::from_json(raw).unwrap();
        let tracks = QueueSnapshot { tracks: export.tracks }.into_remote_tracks(UserRef(2));

        let ids: Vec<_> = tracks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["h", "ok"]);
        assert!(tracks.iter().all(|t| matches!(t.source, SourceRef::Url(_))));
    }

    #[test]
    fn test_restored_snapshots_keep_uploads() {
        let upload = Track::new("u", "upload.mp3", SourceRef::LocalFile("/data/uploads/1/u.mp3".into()), UserRef(3));
        let snapshot = QueueSnapshot::from_tracks([&upload]);
        assert_eq!(snapshot.into_tracks(UserRef(0)), vec![upload]);
    }

    #[test]
    fn test_non_numeric_requester_uses_fallback() {
        let record = TrackRecord {
            id: "x".into(),
            title: "Song".into(),
            duration: None,
            url: Some("https://example.com/a.mp3".into()),
            local_path: None,
            thumbnail: None,
            uploader: String::new(),
            requester: "Someone#1234".into(),
        };
        assert_eq!(record.into_track(UserRef(9)).unwrap().requester, UserRef(9));
    }
}

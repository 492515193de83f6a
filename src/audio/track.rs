use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, time::Duration};

/// Key of a playback session (one per guild).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(pub u64);

/// Reference to a voice or text channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelRef(pub u64);

/// Reference to the user who asked for something.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserRef(pub u64);

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UserRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where the audio of a track comes from. A track has either a URL or a
/// local file, never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceRef {
    Url(String),
    LocalFile(PathBuf),
}

impl SourceRef {
    pub fn as_url(&self) -> Option<&str> {
        match self {
            SourceRef::Url(url) => Some(url),
            SourceRef::LocalFile(_) => None,
        }
    }
}

/// A queued item. Immutable once queued; clones are taken whenever the same
/// track has to live in two places (loop backup, history, repeat).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    pub id: String,
    pub title: String,
    pub duration: Option<Duration>,
    pub source: SourceRef,
    pub thumbnail: Option<String>,
    pub uploader: String,
    pub requester: UserRef,
}

impl Track {
    pub fn new(id: impl Into<String>, title: impl Into<String>, source: SourceRef, requester: UserRef) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            duration: None,
            source,
            thumbnail: None,
            uploader: String::new(),
            requester,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_thumbnail(mut self, thumbnail: impl Into<String>) -> Self {
        self.thumbnail = Some(thumbnail.into());
        self
    }

    pub fn with_uploader(mut self, uploader: impl Into<String>) -> Self {
        self.uploader = uploader.into();
        self
    }

    /// Same track, requested by someone else (replay, import).
    pub fn requested_by(mut self, requester: UserRef) -> Self {
        self.requester = requester;
        self
    }

    /// `true` for live streams or sources without a known length.
    pub fn is_live(&self) -> bool {
        self.duration.is_none()
    }

    pub fn url(&self) -> Option<&str> {
        self.source.as_url()
    }
}

/// Formats a duration as `m:ss` or `h:mm:ss`; unknown lengths render as "Live".
pub fn format_duration(duration: Option<Duration>) -> String {
    let Some(duration) = duration else {
        return "Live".to_string();
    };
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(None), "Live");
        assert_eq!(format_duration(Some(Duration::from_secs(65))), "1:05");
        assert_eq!(format_duration(Some(Duration::from_secs(3723))), "1:02:03");
    }

    #[test]
    fn test_local_file_has_no_url() {
        let track = Track::new("f1", "upload.mp3", SourceRef::LocalFile("/tmp/upload.mp3".into()), UserRef(7));
        assert!(track.url().is_none());
        assert!(track.is_live());
    }
}

pub mod ytdlp;

use async_trait::async_trait;
use regex::Regex;
use std::{path::PathBuf, sync::OnceLock};
use thiserror::Error;
use url::Url;

use crate::audio::track::{SourceRef, Track, UserRef};

pub use ytdlp::YtDlpResolver;

/// Something a transport can actually stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayableSource {
    /// A page or stream URL the transport extracts audio from.
    Remote(String),
    /// A file on local disk.
    Local(PathBuf),
}

#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    #[error("no results for '{0}'")]
    NotFound(String),
    /// Temporary failure; the same request may work later.
    #[error("resolver unavailable: {0}")]
    Unavailable(String),
    #[error("unsupported link: {0}")]
    Unsupported(String),
}

impl ResolveError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ResolveError::Unavailable(_))
    }
}

/// Resolver output: the metadata to queue and a source to stream now.
#[derive(Debug, Clone)]
pub struct ResolvedTrack {
    pub track: Track,
    pub source: PlayableSource,
}

/// Turns user queries into playable tracks.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaResolver: Send + Sync {
    /// Resolves a search query or a URL.
    async fn resolve(&self, query: &str, requester: UserRef) -> Result<ResolvedTrack, ResolveError>;

    /// Tracks related to `seed_title`, best first, never containing `exclude_id`.
    async fn search_related(
        &self,
        seed_title: &str,
        exclude_id: &str,
        limit: usize,
    ) -> Result<Vec<Track>, ResolveError>;

    /// Streamable source for a queued track. Local files need no lookup.
    async fn stream(&self, track: &Track) -> Result<PlayableSource, ResolveError> {
        match &track.source {
            SourceRef::LocalFile(path) => Ok(PlayableSource::Local(path.clone())),
            SourceRef::Url(url) => Ok(self.resolve(url, track.requester).await?.source),
        }
    }
}

/// What a play query looks like before anything is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryKind {
    Search(String),
    Link(Url),
}

/// Classifies a query. Only http(s) links are accepted.
pub fn classify_query(query: &str) -> Result<QueryKind, ResolveError> {
    let query = query.trim();
    if query.is_empty() {
        return Err(ResolveError::NotFound(String::new()));
    }

    if !query.contains("://") {
        return Ok(QueryKind::Search(query.to_string()));
    }

    let url = Url::parse(query).map_err(|_| ResolveError::Unsupported(query.to_string()))?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(QueryKind::Link(url)),
        _ => Err(ResolveError::Unsupported(query.to_string())),
    }
}

/// Extracts the YouTube video id from a link, if it is one.
pub fn youtube_video_id(url: &str) -> Option<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"(?:youtube\.com/(?:watch\?(?:.*&)?v=|shorts/|embed/)|youtu\.be/)([A-Za-z0-9_-]{11})")
            .expect("static regex")
    });
    pattern
        .captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Common audio file extensions accepted as attachments.
pub fn is_audio_file(name: &str) -> bool {
    let lower = name.to_lowercase();
    [".mp3", ".wav", ".ogg", ".flac", ".m4a", ".opus", ".webm"]
        .iter()
        .any(|ext| lower.ends_with(ext))
}

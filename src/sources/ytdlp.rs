use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio::{process::Command, time::timeout};
use tracing::{debug, info, warn};

use super::{classify_query, youtube_video_id, MediaResolver, PlayableSource, QueryKind, ResolveError, ResolvedTrack};
use crate::audio::track::{SourceRef, Track, UserRef};

const YTDLP_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolver backed by the `yt-dlp` executable.
pub struct YtDlpResolver {
    binary: String,
}

/// The subset of `yt-dlp --dump-json` we read.
#[derive(Debug, Deserialize)]
struct VideoInfo {
    id: String,
    title: String,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    thumbnail: Option<String>,
    #[serde(default)]
    uploader: Option<String>,
    #[serde(default)]
    webpage_url: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    is_live: Option<bool>,
}

impl VideoInfo {
    fn into_track(self, requester: UserRef) -> Option<Track> {
        let page = self.webpage_url.or(self.url)?;
        let mut track = Track::new(self.id, self.title, SourceRef::Url(page), requester)
            .with_uploader(self.uploader.unwrap_or_default());
        if let Some(thumbnail) = self.thumbnail {
            track = track.with_thumbnail(thumbnail);
        }
        if let Some(secs) = self.duration.filter(|d| *d > 0.0 && self.is_live != Some(true)) {
            track = track.with_duration(Duration::from_secs_f64(secs));
        }
        Some(track)
    }
}

impl YtDlpResolver {
    pub fn new() -> Self {
        Self {
            binary: "yt-dlp".to_string(),
        }
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    /// Checks that yt-dlp can be executed.
    pub async fn verify(&self) -> Result<String, ResolveError> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .output()
            .await
            .map_err(|e| ResolveError::Unavailable(format!("{} not found: {}", self.binary, e)))?;
        if !output.status.success() {
            return Err(ResolveError::Unavailable(format!("{} --version failed", self.binary)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn dump_json(&self, target: &str, extra: &[&str]) -> Result<Vec<VideoInfo>, ResolveError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["--dump-json", "--no-warnings", "--socket-timeout", "15"])
            .args(extra)
            .arg(target)
            .kill_on_drop(true);

        debug!("🔍 yt-dlp {}", target);
        let output = timeout(YTDLP_TIMEOUT, cmd.output())
            .await
            .map_err(|_| ResolveError::Unavailable("yt-dlp timed out".to_string()))?
            .map_err(|e| ResolveError::Unavailable(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("Unsupported URL") {
                return Err(ResolveError::Unsupported(target.to_string()));
            }
            if stderr.contains("Video unavailable") || stderr.contains("not available") {
                return Err(ResolveError::NotFound(target.to_string()));
            }
            return Err(ResolveError::Unavailable(stderr.trim().to_string()));
        }

        let infos = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<VideoInfo>(line) {
                Ok(info) => Some(info),
                Err(e) => {
                    warn!("⚠️ Unreadable yt-dlp entry: {}", e);
                    None
                }
            })
            .collect();
        Ok(infos)
    }
}

impl Default for YtDlpResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaResolver for YtDlpResolver {
    async fn resolve(&self, query: &str, requester: UserRef) -> Result<ResolvedTrack, ResolveError> {
        let target = match classify_query(query)? {
            QueryKind::Search(terms) => format!("ytsearch1:{}", terms),
            QueryKind::Link(url) => url.to_string(),
        };

        let info = self
            .dump_json(&target, &["--no-playlist", "--format", "bestaudio/best"])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ResolveError::NotFound(query.to_string()))?;

        let stream_url = info.url.clone();
        let mut track = info
            .into_track(requester)
            .ok_or_else(|| ResolveError::NotFound(query.to_string()))?;
        if let Some(id) = track.url().and_then(youtube_video_id) {
            track.id = id;
        }

        let source = match &track.source {
            SourceRef::Url(page) => PlayableSource::Remote(page.clone()),
            SourceRef::LocalFile(path) => PlayableSource::Local(path.clone()),
        };
        info!(
            "🎵 Resolved '{}' -> {} ({})",
            query,
            track.title,
            if stream_url.is_some() { "direct stream" } else { "page" }
        );
        Ok(ResolvedTrack { track, source })
    }

    async fn search_related(
        &self,
        seed_title: &str,
        exclude_id: &str,
        limit: usize,
    ) -> Result<Vec<Track>, ResolveError> {
        let target = format!("ytsearch{}:{} related", limit.max(1), seed_title);
        let tracks: Vec<Track> = self
            .dump_json(&target, &["--flat-playlist"])
            .await?
            .into_iter()
            .filter(|info| info.id != exclude_id)
            .filter_map(|info| info.into_track(UserRef(0)))
            .take(limit)
            .collect();

        debug!("🔎 {} related tracks for '{}'", tracks.len(), seed_title);
        Ok(tracks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_info_into_track() {
        let raw = r#"{"id":"dQw4w9WgXcQ","title":"Never Gonna Give You Up","duration":212.0,
            "thumbnail":"https://i.ytimg.com/vi/dQw4w9WgXcQ/hq.jpg","uploader":"Rick Astley",
            "webpage_url":"https://www.youtube.com/watch?v=dQw4w9WgXcQ"}"#;
        let info: VideoInfo = serde_json::from_str(raw).unwrap();
        let track = info.into_track(UserRef(5)).unwrap();
        assert_eq!(track.id, "dQw4w9WgXcQ");
        assert_eq!(track.duration, Some(Duration::from_secs(212)));
        assert_eq!(track.uploader, "Rick Astley");
        assert_eq!(track.requester, UserRef(5));
    }

    #[test]
    fn test_live_streams_have_no_duration() {
        let raw = r#"{"id":"live1","title":"Radio","duration":0,"is_live":true,"url":"https://x/live"}"#;
        let info: VideoInfo = serde_json::from_str(raw).unwrap();
        assert!(info.into_track(UserRef(1)).unwrap().is_live());
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let resolver = YtDlpResolver::with_binary("definitely-not-yt-dlp-binary");
        assert!(matches!(resolver.verify().await, Err(ResolveError::Unavailable(_))));
    }
}

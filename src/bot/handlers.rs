use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};

use super::{
    context::{Invocation, InvocationContext, Response, Upload},
    BotState,
};
use crate::{
    audio::{
        effects::AudioFilter,
        queue::LoopMode,
        session::SessionHandle,
        snapshot::QueueExport,
        track::{ChannelRef, SessionKey, SourceRef, Track},
    },
    error::{SessionError, UserInputError},
    sources::{classify_query, is_audio_file, ResolveError},
    ui::embeds,
};

/// Largest attachment accepted for playback or import.
const MAX_UPLOAD_BYTES: u32 = 25 * 1024 * 1024;

const COMMANDS: &[&str] = &[
    "play", "pause", "resume", "skip", "stop", "queue", "nowplaying", "np", "shuffle", "loop", "remove",
    "move", "volume", "filter", "autoplay", "join", "leave", "247", "autodisconnect", "history", "replay",
    "search", "export", "import", "playlist", "help",
];

/// Failures a command reports back to its invoker.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Commands only work inside a server")]
    NoGuild,

    #[error("You need to be in a voice channel first!")]
    NotInVoice,

    #[error("Missing `{0}`. Try `/help`.")]
    MissingArgument(&'static str),

    #[error("`{0}` is not a valid number")]
    NotANumber(String),

    #[error("`{0}` is not a valid choice")]
    InvalidChoice(String),

    #[error("Attach a file to use this command")]
    MissingAttachment,

    #[error("Attachment is larger than {} MB", MAX_UPLOAD_BYTES / 1024 / 1024)]
    AttachmentTooLarge,

    #[error("That file is not a queue export: {0}")]
    BadExport(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CommandError {
    /// Problems with what the user typed, as opposed to things breaking.
    fn is_user_error(&self) -> bool {
        !matches!(
            self,
            CommandError::Other(_)
                | CommandError::Session(
                    SessionError::Transport(_)
                        | SessionError::Persistence(_)
                        | SessionError::InvariantViolation(_)
                        | SessionError::SessionClosed
                )
        )
    }
}

impl From<UserInputError> for CommandError {
    fn from(e: UserInputError) -> Self {
        CommandError::Session(e.into())
    }
}

impl From<ResolveError> for CommandError {
    fn from(e: ResolveError) -> Self {
        CommandError::Session(e.into())
    }
}

type CommandResult = Result<Response, CommandError>;

/// Runs one command, whichever front end it came from, and answers it.
pub async fn dispatch(
    state: &BotState,
    ctx: &dyn InvocationContext,
    invocation: &Invocation,
) -> anyhow::Result<()> {
    if !COMMANDS.contains(&invocation.name.as_str()) {
        return Ok(());
    }

    let response = match run(state, ctx, invocation).await {
        Ok(response) => response,
        Err(e) => {
            if e.is_user_error() {
                info!("🙅 /{} rejected for {}: {}", invocation.name, ctx.author_name(), e);
            } else {
                warn!("❌ /{} failed for {}: {:?}", invocation.name, ctx.author_name(), e);
            }
            Response::error(e)
        }
    };

    ctx.respond(response).await
}

async fn run(state: &BotState, ctx: &dyn InvocationContext, invocation: &Invocation) -> CommandResult {
    let guild = ctx.guild().ok_or(CommandError::NoGuild)?;
    info!(session = %guild, "📝 Command {} used by {}", invocation.name, ctx.author_name());

    if invocation.name == "help" {
        return Ok(Response::embed(embeds::help_embed(&state.config.command_prefix)));
    }

    let session = state.registry.get_or_create(guild);
    session.set_notify_target(ctx.channel()).await?;

    match invocation.name.as_str() {
        "play" => play(state, ctx, &session, invocation).await,
        "pause" => {
            session.pause().await?;
            Ok(Response::text("⏸️ Paused"))
        }
        "resume" => {
            session.resume().await?;
            Ok(Response::text("▶️ Resumed"))
        }
        "skip" => {
            let skipped = session.skip().await?;
            Ok(Response::text(format!("⏭️ Skipped **{}**", skipped.title)))
        }
        "stop" => {
            session.stop().await?;
            Ok(Response::text("⏹️ Stopped and cleared the queue"))
        }
        "queue" => {
            let page = optional_number(invocation, "page", 0)?.unwrap_or(1);
            let info = session.info().await?;
            Ok(Response::embed(embeds::queue_embed(&info, page)))
        }
        "nowplaying" | "np" => {
            let info = session.info().await?;
            Ok(Response::embed(embeds::current_status_embed(&info)))
        }
        "shuffle" => {
            session.shuffle().await?;
            Ok(Response::text("🔀 Queue shuffled"))
        }
        "loop" => {
            let raw = required(invocation, "mode", 0)?;
            let mode: LoopMode = raw.parse().map_err(|_| CommandError::InvalidChoice(raw.to_string()))?;
            session.set_loop_mode(mode).await?;
            let text = match mode {
                LoopMode::Off => "▶️ Loop disabled",
                LoopMode::Track => "🔂 Looping the current song",
                LoopMode::Queue => "🔁 Looping the whole queue",
            };
            Ok(Response::text(text))
        }
        "remove" => {
            let position = number(invocation, "position", 0)?;
            let removed = session.remove_at(position).await?;
            Ok(Response::text(format!("🗑️ Removed **{}**", removed.title)))
        }
        "move" => {
            let from = number(invocation, "from", 0)?;
            let to = number(invocation, "to", 1)?;
            session.move_track(from, to).await?;
            Ok(Response::text(format!("📍 Moved song {} to position {}", from, to)))
        }
        "volume" => match invocation.arg("level", 0) {
            None => {
                let info = session.info().await?;
                let percent = (info.settings.volume * 100.0).round() as i64;
                Ok(Response::text(format!("🔊 Volume is {}%", percent)))
            }
            Some(raw) => {
                let percent: i64 = raw.parse().map_err(|_| CommandError::NotANumber(raw.to_string()))?;
                session.set_volume(percent).await?;
                Ok(Response::text(format!("🔊 Volume set to {}%", percent)))
            }
        },
        "filter" => {
            let filter = AudioFilter::parse_selection(invocation.arg("preset", 0))?;
            let restarted = session.set_filter(filter).await?;
            let mut text = match filter {
                Some(f) => format!("🎚️ Filter set to **{}**", f),
                None => "🎚️ Filters cleared".to_string(),
            };
            if restarted {
                text.push_str(", restarting the current song");
            }
            Ok(Response::text(text))
        }
        "autoplay" => {
            let enabled = toggle(invocation, "enabled", session.info().await?.settings.autoplay)?;
            session.set_autoplay(enabled).await?;
            Ok(Response::text(if enabled {
                "🎲 Autoplay enabled"
            } else {
                "🎲 Autoplay disabled"
            }))
        }
        "join" => {
            let channel = voice_channel(state, ctx, guild)?;
            session.join(channel).await?;
            Ok(Response::text(format!("🔊 Joined <#{}>", channel)))
        }
        "leave" => {
            session.leave().await?;
            Ok(Response::text("👋 Left the voice channel. The queue is kept."))
        }
        "247" => {
            let enabled = toggle(invocation, "enabled", session.info().await?.settings.stay_always)?;
            session.set_stay_always(enabled).await?;
            Ok(Response::text(if enabled {
                "🌙 24/7 mode enabled, I'll stay in the channel"
            } else {
                "🌙 24/7 mode disabled"
            }))
        }
        "autodisconnect" => {
            let enabled = toggle(invocation, "enabled", session.info().await?.settings.auto_disconnect)?;
            session.set_auto_disconnect(enabled).await?;
            Ok(Response::text(if enabled {
                "🔌 Auto-disconnect enabled"
            } else {
                "🔌 Auto-disconnect disabled"
            }))
        }
        "history" => {
            let page = optional_number(invocation, "page", 0)?.unwrap_or(1);
            let history = session.history(page, embeds::HISTORY_PAGE_SIZE).await?;
            Ok(Response::embed(embeds::history_embed(&history)))
        }
        "replay" => {
            let index = number(invocation, "index", 0)?;
            let (track, position) = session.replay(index, ctx.author()).await?;
            let starting = start_if_connected(state, ctx, &session, guild).await?;
            Ok(Response::embed(embeds::track_added_embed(&track, position, starting)))
        }
        "search" => {
            let query = invocation.text("query", 0).ok_or(CommandError::MissingArgument("query"))?;
            let hits = session.search_queue(query.clone()).await?;
            Ok(Response::embed(embeds::search_results_embed(&query, &hits)))
        }
        "export" => {
            let export = session.export_queue(ctx.author_name()).await?;
            let count = export.tracks.len();
            let json = export.to_json().map_err(anyhow::Error::from)?;
            Ok(Response::text(format!("📤 Exported {} songs", count))
                .with_file(format!("queue-{}.json", guild), json.into_bytes()))
        }
        "import" => {
            let upload = ctx
                .attachments()
                .into_iter()
                .find(|a| a.filename.to_lowercase().ends_with(".json"))
                .ok_or(CommandError::MissingAttachment)?;
            ctx.defer().await?;
            let raw = download(state, &upload).await?;
            let export = QueueExport::from_json(&raw).map_err(|e| CommandError::BadExport(e.to_string()))?;
            let imported = session.import_queue(export, ctx.author()).await?;
            start_if_connected(state, ctx, &session, guild).await?;
            Ok(Response::embed(embeds::success_embed(
                "📥 Queue imported",
                &format!("Replaced the queue with {} songs.", imported),
            )))
        }
        "playlist" => playlist(state, ctx, &session, invocation, guild).await,
        other => Err(CommandError::InvalidChoice(other.to_string())),
    }
}

async fn play(
    state: &BotState,
    ctx: &dyn InvocationContext,
    session: &SessionHandle,
    invocation: &Invocation,
) -> CommandResult {
    let guild = session.key();
    let channel = voice_channel(state, ctx, guild)?;
    ctx.defer().await?;

    let upload = ctx.attachments().into_iter().find(|a| is_audio_file(&a.filename));
    let track = match upload {
        Some(upload) => save_upload(state, guild, ctx, &upload).await?,
        None => {
            let query = invocation.text("query", 0).ok_or(CommandError::MissingArgument("query"))?;
            if let Err(ResolveError::Unsupported(link)) = classify_query(&query) {
                return Err(UserInputError::UnsupportedLink(link).into());
            }
            state.resolver.resolve(&query, ctx.author()).await?.track
        }
    };

    session.join(channel).await?;
    let position = session.enqueue(track.clone()).await?;
    let starting = session.start_if_idle().await?;
    Ok(Response::embed(embeds::track_added_embed(&track, position, starting)))
}

async fn playlist(
    state: &BotState,
    ctx: &dyn InvocationContext,
    session: &SessionHandle,
    invocation: &Invocation,
    guild: SessionKey,
) -> CommandResult {
    let action = required(invocation, "action", 0)?.to_lowercase();
    let name = || invocation.text("name", 1).ok_or(CommandError::MissingArgument("name"));

    match action.as_str() {
        "save" => {
            let name = name()?;
            let saved = session.save_playlist(name.clone()).await?;
            Ok(Response::text(format!("💾 Saved **{}** with {} songs", name, saved)))
        }
        "load" => {
            let name = name()?;
            let added = session.load_playlist(name.clone(), ctx.author()).await?;
            start_if_connected(state, ctx, session, guild).await?;
            Ok(Response::text(format!("📂 Loaded {} songs from **{}**", added, name)))
        }
        "list" => {
            let playlists = session.list_playlists().await?;
            Ok(Response::embed(embeds::playlists_embed(&playlists)))
        }
        "delete" => {
            let name = name()?;
            session.delete_playlist(name.clone()).await?;
            Ok(Response::text(format!("🗑️ Deleted **{}**", name)))
        }
        other => Err(CommandError::InvalidChoice(other.to_string())),
    }
}

/// Joins the invoker's channel when they are in one, then starts playback
/// if the session is connected and idle.
async fn start_if_connected(
    state: &BotState,
    ctx: &dyn InvocationContext,
    session: &SessionHandle,
    guild: SessionKey,
) -> Result<bool, CommandError> {
    if let Ok(channel) = voice_channel(state, ctx, guild) {
        session.join(channel).await?;
    }
    if session.info().await?.channel.is_none() {
        return Ok(false);
    }
    Ok(session.start_if_idle().await?)
}

fn voice_channel(state: &BotState, ctx: &dyn InvocationContext, guild: SessionKey) -> Result<ChannelRef, CommandError> {
    state
        .presence
        .channel_of(guild.0, ctx.author().0)
        .map(ChannelRef)
        .ok_or(CommandError::NotInVoice)
}

async fn download(state: &BotState, upload: &Upload) -> Result<Vec<u8>, CommandError> {
    if upload.size > MAX_UPLOAD_BYTES {
        return Err(CommandError::AttachmentTooLarge);
    }
    let response = state
        .http
        .get(&upload.url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(anyhow::Error::from)?;
    let bytes = response.bytes().await.map_err(anyhow::Error::from)?;
    Ok(bytes.to_vec())
}

/// Stores an uploaded audio file under the data dir and wraps it as a track.
async fn save_upload(
    state: &BotState,
    guild: SessionKey,
    ctx: &dyn InvocationContext,
    upload: &Upload,
) -> Result<Track, CommandError> {
    let data = download(state, upload).await?;
    let dir: PathBuf = state.config.data_dir.join("uploads").join(guild.to_string());
    tokio::fs::create_dir_all(&dir).await.map_err(anyhow::Error::from)?;

    let path = dir.join(format!("{}_{}", upload.id, safe_file_name(&upload.filename)));
    tokio::fs::write(&path, data).await.map_err(anyhow::Error::from)?;
    info!(session = %guild, "📎 Saved upload {}", path.display());

    Ok(Track::new(
        format!("upload-{}", upload.id),
        upload.filename.clone(),
        SourceRef::LocalFile(path),
        ctx.author(),
    ))
}

fn safe_file_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

fn required<'a>(invocation: &'a Invocation, key: &'static str, position: usize) -> Result<&'a str, CommandError> {
    invocation.arg(key, position).ok_or(CommandError::MissingArgument(key))
}

fn number(invocation: &Invocation, key: &'static str, position: usize) -> Result<usize, CommandError> {
    optional_number(invocation, key, position)?.ok_or(CommandError::MissingArgument(key))
}

fn optional_number(invocation: &Invocation, key: &'static str, position: usize) -> Result<Option<usize>, CommandError> {
    invocation
        .arg(key, position)
        .map(|raw| raw.parse().map_err(|_| CommandError::NotANumber(raw.to_string())))
        .transpose()
}

/// The requested on/off value; without an argument the setting flips.
fn toggle(invocation: &Invocation, key: &str, current: bool) -> Result<bool, CommandError> {
    match invocation.arg(key, 0) {
        Some(raw) => parse_toggle(raw).ok_or_else(|| CommandError::InvalidChoice(raw.to_string())),
        None => Ok(!current),
    }
}

fn parse_toggle(raw: &str) -> Option<bool> {
    match raw.to_lowercase().as_str() {
        "on" | "true" | "yes" | "enable" | "enabled" | "1" => Some(true),
        "off" | "false" | "no" | "disable" | "disabled" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::transport::TransportError;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_toggle() {
        assert_eq!(parse_toggle("ON"), Some(true));
        assert_eq!(parse_toggle("disabled"), Some(false));
        assert_eq!(parse_toggle("maybe"), None);
    }

    #[test]
    fn test_toggle_flips_without_argument() {
        let inv = Invocation::parse_prefixed("!247", "!").unwrap();
        assert!(toggle(&inv, "enabled", false).unwrap());
        assert!(!toggle(&inv, "enabled", true).unwrap());

        let inv = Invocation::parse_prefixed("!autoplay off", "!").unwrap();
        assert!(!toggle(&inv, "enabled", false).unwrap());

        let inv = Invocation::parse_prefixed("!autodisconnect sometimes", "!").unwrap();
        assert!(matches!(toggle(&inv, "enabled", true), Err(CommandError::InvalidChoice(_))));
    }

    #[test]
    fn test_numbers_from_prefix_arguments() {
        let inv = Invocation::parse_prefixed("!move 4 1", "!").unwrap();
        assert_eq!(number(&inv, "from", 0).unwrap(), 4);
        assert_eq!(number(&inv, "to", 1).unwrap(), 1);

        let inv = Invocation::parse_prefixed("!remove first", "!").unwrap();
        assert!(matches!(number(&inv, "position", 0), Err(CommandError::NotANumber(_))));

        let inv = Invocation::parse_prefixed("!queue", "!").unwrap();
        assert_eq!(optional_number(&inv, "page", 0).unwrap(), None);
    }

    #[test]
    fn test_user_errors_are_told_apart() {
        assert!(CommandError::NotInVoice.is_user_error());
        assert!(CommandError::from(UserInputError::NothingPlaying).is_user_error());
        assert!(!CommandError::Session(SessionError::Transport(TransportError::NotConnected)).is_user_error());
    }

    #[test]
    fn test_safe_file_name() {
        assert_eq!(safe_file_name("my song (live).mp3"), "my_song__live_.mp3");
        assert_eq!(safe_file_name("../../etc/passwd"), ".._.._etc_passwd");
    }
}

use serenity::{
    all::Timestamp,
    builder::{CreateEmbed, CreateEmbedFooter},
};
use std::time::Duration;

use crate::{
    audio::{
        notice::{DisconnectReason, Notice},
        queue::{LoopMode, QueueInfo},
        session::HistoryPage,
        track::{format_duration, Track},
    },
    storage::PlaylistSummary,
};

/// Standard palette.
pub mod colors {
    use serenity::all::Colour;

    pub const SUCCESS_GREEN: Colour = Colour::from_rgb(67, 181, 129);
    pub const ERROR_RED: Colour = Colour::from_rgb(220, 53, 69);
    pub const WARNING_ORANGE: Colour = Colour::from_rgb(255, 193, 7);
    pub const INFO_BLUE: Colour = Colour::from_rgb(52, 144, 220);
    pub const MUSIC_PURPLE: Colour = Colour::from_rgb(138, 43, 226);
    pub const NEUTRAL_GRAY: Colour = Colour::from_rgb(108, 117, 125);
}

const STANDARD_FOOTER: &str = "🎵 Playback Sessions";
pub const QUEUE_PAGE_SIZE: usize = 10;
pub const HISTORY_PAGE_SIZE: usize = 10;

fn loop_icon(mode: LoopMode) -> &'static str {
    match mode {
        LoopMode::Track => "🔂",
        LoopMode::Queue => "🔁",
        LoopMode::Off => "▶️",
    }
}

fn track_line(track: &Track) -> String {
    match track.url() {
        Some(url) => format!("[{}]({}) `[{}]`", track.title, url, format_duration(track.duration)),
        None => format!("**{}** `[{}]`", track.title, format_duration(track.duration)),
    }
}

/// "Now playing" card, with what comes next.
pub fn now_playing_embed(track: &Track, next: Option<&Track>) -> CreateEmbed {
    let mut embed = CreateEmbed::default()
        .title("🎵 Now Playing")
        .description(format!("**{}**", track.title))
        .color(colors::SUCCESS_GREEN)
        .field("⏱️ Duration", format_duration(track.duration), true)
        .field("👤 Requested by", format!("<@{}>", track.requester), true);

    if !track.uploader.is_empty() {
        embed = embed.field("🎤 Uploader", &track.uploader, true);
    }
    if let Some(url) = track.url() {
        embed = embed.url(url);
    }
    if let Some(thumbnail) = &track.thumbnail {
        embed = embed.thumbnail(thumbnail);
    }
    embed = embed.field(
        "⏭️ Up next",
        next.map_or("Nothing queued".to_string(), |t| t.title.clone()),
        false,
    );

    embed
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Current track plus the session's knobs.
pub fn current_status_embed(info: &QueueInfo) -> CreateEmbed {
    let Some(current) = &info.current else {
        return info_embed("🔇 Nothing playing", "Use `/play <song>` to start.");
    };

    let settings = &info.settings;
    now_playing_embed(current, info.items.first()).field(
        "🎛️ Session",
        format!(
            "{} Loop: **{:?}** • 🔊 **{}%** • Filter: **{}** • Autoplay: **{}**",
            loop_icon(info.loop_mode),
            info.loop_mode,
            (settings.volume * 100.0).round() as u32,
            settings.filter.map_or("none".to_string(), |f| f.to_string()),
            if settings.autoplay { "on" } else { "off" }
        ),
        false,
    )
}

pub fn track_added_embed(track: &Track, position: usize, starting: bool) -> CreateEmbed {
    let footer = if starting {
        "▶️ Starting playback"
    } else {
        "🎵 Plays automatically when its turn comes"
    };

    let mut embed = CreateEmbed::default()
        .title("✅ Added to queue")
        .description(track_line(track))
        .color(colors::SUCCESS_GREEN)
        .field("📍 Position", position.to_string(), true)
        .field("👤 Requested by", format!("<@{}>", track.requester), true);
    if let Some(thumbnail) = &track.thumbnail {
        embed = embed.thumbnail(thumbnail);
    }

    embed.footer(CreateEmbedFooter::new(footer))
}

pub fn queue_embed(info: &QueueInfo, page: usize) -> CreateEmbed {
    let queue_page = info.get_page(page, QUEUE_PAGE_SIZE);

    let mut embed = CreateEmbed::default()
        .title("📋 Queue")
        .color(colors::INFO_BLUE);

    if info.total_items == 0 && info.current.is_none() {
        return embed
            .description("😴 **The queue is empty**\n\n💡 Use `/play <song>` to add music")
            .color(colors::NEUTRAL_GRAY)
            .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
            .timestamp(Timestamp::now());
    }

    if let Some(current) = &info.current {
        embed = embed.field(
            format!("{} Playing", loop_icon(info.loop_mode)),
            track_line(current),
            false,
        );
    }

    if !queue_page.items.is_empty() {
        let lines: Vec<String> = queue_page
            .items
            .iter()
            .enumerate()
            .map(|(i, item)| format!("**{}**. {}", queue_page.first_position + i, track_line(item)))
            .collect();
        embed = embed.field("Up next", lines.join("\n"), false);
    }

    let mut summary = format!("**Total:** {} songs", info.total_items);
    if info.total_duration > Duration::ZERO {
        summary.push_str(&format!(" • **Duration:** {}", format_duration(Some(info.total_duration))));
    }
    embed = embed.field("Info", summary, false);

    let footer = if queue_page.total_pages > 1 {
        format!("Page {} of {} • {}", queue_page.current_page, queue_page.total_pages, STANDARD_FOOTER)
    } else {
        STANDARD_FOOTER.to_string()
    };

    embed
        .footer(CreateEmbedFooter::new(footer))
        .timestamp(Timestamp::now())
}

pub fn history_embed(page: &HistoryPage) -> CreateEmbed {
    let embed = CreateEmbed::default()
        .title("🕘 Recently played")
        .color(colors::MUSIC_PURPLE);

    if page.entries.is_empty() {
        return embed
            .description("Nothing has been played yet.")
            .color(colors::NEUTRAL_GRAY);
    }

    let lines: Vec<String> = page
        .entries
        .iter()
        .map(|(index, entry)| {
            format!(
                "**{}**. {} • <t:{}:R>",
                index,
                entry.track.title,
                entry.played_at.timestamp()
            )
        })
        .collect();

    embed
        .description(lines.join("\n"))
        .footer(CreateEmbedFooter::new(format!(
            "Page {} of {} • {} songs • /replay <number>",
            page.current_page, page.total_pages, page.total
        )))
}

pub fn search_results_embed(query: &str, hits: &[(usize, Track)]) -> CreateEmbed {
    let embed = CreateEmbed::default()
        .title(format!("🔍 Queue matches for \"{}\"", query))
        .color(colors::INFO_BLUE);

    if hits.is_empty() {
        return embed.description("No songs in the queue match.").color(colors::NEUTRAL_GRAY);
    }

    let lines: Vec<String> = hits
        .iter()
        .map(|(position, track)| format!("**{}**. {}", position, track_line(track)))
        .collect();
    embed.description(lines.join("\n"))
}

pub fn playlists_embed(playlists: &[PlaylistSummary]) -> CreateEmbed {
    let embed = CreateEmbed::default()
        .title("💾 Saved playlists")
        .color(colors::MUSIC_PURPLE);

    if playlists.is_empty() {
        return embed
            .description("No playlists yet. Use `/playlist save <name>`.")
            .color(colors::NEUTRAL_GRAY);
    }

    let lines: Vec<String> = playlists
        .iter()
        .map(|p| format!("• **{}** ({} songs)", p.name, p.tracks))
        .collect();
    embed.description(lines.join("\n"))
}

/// Renders a session notice for its notification channel.
pub fn notice_embed(notice: &Notice) -> CreateEmbed {
    match notice {
        Notice::NowPlaying { track, next } => now_playing_embed(track, next.as_ref()),
        Notice::QueueLooped => info_embed("🔁 Queue looped", "Starting the queue again from the top."),
        Notice::AutoQueued { track } => CreateEmbed::default()
            .title("🎲 Autoplay")
            .description(format!("Queued a related song: {}", track_line(track)))
            .color(colors::MUSIC_PURPLE),
        Notice::NoRelatedTracks => warning_embed("🎲 Autoplay", "No related songs found. Playback finished."),
        Notice::AutoplayFailed { reason } => {
            warning_embed("🎲 Autoplay", &format!("Could not find related songs: {}", reason))
        }
        Notice::QueueEmpty => info_embed("📭 Queue finished", "Add more songs with `/play`."),
        Notice::TrackFailed { track, reason } => error_embed(
            "⚠️ Could not play song",
            &format!("**{}** was skipped: {}", track.title, reason),
        ),
        Notice::PlaybackGaveUp { failures } => error_embed(
            "❌ Playback stopped",
            &format!("{} songs in a row failed to play. The queue has been stopped.", failures),
        ),
        Notice::Disconnected { reason } => {
            let description = match reason {
                DisconnectReason::TakingABreak => "Taking a break, nobody has used me in a while. 👋",
                DisconnectReason::EmptyChannel => "Everyone left the voice channel, so did I. 👋",
                DisconnectReason::Inactivity => "The queue stayed empty, leaving the voice channel. 👋",
            };
            info_embed("🔌 Disconnected", description)
        }
        Notice::Countdown { seconds } => warning_embed(
            "⏳ Leaving soon",
            &format!("Nothing is queued. Leaving in **{} seconds** unless something is played.", seconds),
        ),
        Notice::Kicked => warning_embed(
            "🚪 Removed from voice",
            "I was disconnected from the voice channel. The queue has been cleared.",
        ),
        Notice::SessionReset { diagnostic } => error_embed(
            "♻️ Player reset",
            &format!("Something went wrong and the player was reset. ({})", diagnostic),
        ),
    }
}

pub fn help_embed(prefix: &str) -> CreateEmbed {
    let section = |commands: &[&str]| {
        commands
            .iter()
            .map(|c| format!("`/{}`", c))
            .collect::<Vec<_>>()
            .join(" ")
    };

    CreateEmbed::default()
        .title("🎵 Help")
        .description(format!(
            "Every command works as a slash command or with the `{}` prefix.",
            prefix
        ))
        .color(colors::INFO_BLUE)
        .field("▶️ Playback", section(&["play", "pause", "resume", "skip", "stop", "nowplaying"]), false)
        .field("📋 Queue", section(&["queue", "shuffle", "loop", "remove", "move", "search"]), false)
        .field("🎛️ Audio", section(&["volume", "filter", "autoplay"]), false)
        .field("🔊 Voice", section(&["join", "leave", "247", "autodisconnect"]), false)
        .field("🕘 History", section(&["history", "replay"]), false)
        .field("💾 Saving", section(&["export", "import", "playlist"]), false)
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

pub fn error_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(title)
        .description(description)
        .color(colors::ERROR_RED)
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

pub fn success_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(title)
        .description(description)
        .color(colors::SUCCESS_GREEN)
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

pub fn info_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(title)
        .description(description)
        .color(colors::INFO_BLUE)
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

fn warning_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(title)
        .description(description)
        .color(colors::WARNING_ORANGE)
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{
        queue::SessionState,
        track::{SessionKey, SourceRef, UserRef},
    };
    use chrono::Utc;
    use serde_json::Value;

    fn json(embed: &CreateEmbed) -> Value {
        serde_json::to_value(embed).unwrap()
    }

    fn song(id: &str) -> Track {
        Track::new(id, format!("Song {}", id), SourceRef::Url(format!("https://youtu.be/{}", id)), UserRef(9))
            .with_duration(Duration::from_secs(125))
    }

    #[test]
    fn test_countdown_notice_mentions_seconds() {
        let value = json(&notice_embed(&Notice::Countdown { seconds: 45 }));
        assert!(value["description"].as_str().unwrap().contains("45 seconds"));
    }

    #[test]
    fn test_queue_embed_numbers_from_page_start() {
        let now = Utc::now();
        let mut state = SessionState::new(SessionKey(1), 100, now);
        for i in 0..12 {
            state.add_track(song(&format!("t{:02}", i)), now).unwrap();
        }

        let value = json(&queue_embed(&state.get_info(), 2));
        let fields = value["fields"].as_array().unwrap();
        let upcoming = fields.iter().find(|f| f["name"] == "Up next").unwrap();
        let text = upcoming["value"].as_str().unwrap();
        assert!(text.starts_with("**11**. [Song t10]"));
        assert!(value["footer"]["text"].as_str().unwrap().starts_with("Page 2 of 2"));
    }

    #[test]
    fn test_empty_queue_embed() {
        let state = SessionState::new(SessionKey(1), 100, Utc::now());
        let value = json(&queue_embed(&state.get_info(), 1));
        assert!(value["description"].as_str().unwrap().contains("empty"));
    }
}

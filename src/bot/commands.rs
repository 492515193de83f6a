use anyhow::Result;
use serenity::{
    builder::{CreateCommand, CreateCommandOption},
    model::{application::CommandOptionType, id::GuildId},
    prelude::Context,
};

use crate::audio::effects::AudioFilter;

/// Registers every command globally.
pub async fn register_global_commands(ctx: &Context) -> Result<()> {
    for command in all_commands() {
        ctx.http.create_global_command(&command).await?;
    }

    Ok(())
}

/// Registers every command on one guild (development).
pub async fn register_guild_commands(ctx: &Context, guild_id: GuildId) -> Result<()> {
    guild_id.set_commands(&ctx.http, all_commands()).await?;

    Ok(())
}

fn all_commands() -> Vec<CreateCommand> {
    vec![
        play_command(),
        pause_command(),
        resume_command(),
        skip_command(),
        stop_command(),
        queue_command(),
        nowplaying_command(),
        shuffle_command(),
        loop_command(),
        remove_command(),
        move_command(),
        volume_command(),
        filter_command(),
        autoplay_command(),
        join_command(),
        leave_command(),
        stay_command(),
        autodisconnect_command(),
        history_command(),
        replay_command(),
        search_command(),
        export_command(),
        import_command(),
        playlist_command(),
        help_command(),
    ]
}

fn toggle(name: &str, description: &str) -> CreateCommandOption {
    // Left out, the setting flips.
    CreateCommandOption::new(CommandOptionType::Boolean, name, description).required(false)
}

fn position(name: &str, description: &str) -> CreateCommandOption {
    CreateCommandOption::new(CommandOptionType::Integer, name, description)
        .min_int_value(1)
        .required(true)
}

// Playback

fn play_command() -> CreateCommand {
    CreateCommand::new("play")
        .description("Play a song or add it to the queue")
        .add_option(CreateCommandOption::new(
            CommandOptionType::String,
            "query",
            "URL or search terms",
        ))
        .add_option(CreateCommandOption::new(
            CommandOptionType::Attachment,
            "file",
            "Audio file to play",
        ))
}

fn pause_command() -> CreateCommand {
    CreateCommand::new("pause").description("Pause the current song")
}

fn resume_command() -> CreateCommand {
    CreateCommand::new("resume").description("Resume playback")
}

fn skip_command() -> CreateCommand {
    CreateCommand::new("skip").description("Skip to the next song")
}

fn stop_command() -> CreateCommand {
    CreateCommand::new("stop").description("Stop playback and clear the queue")
}

// Queue

fn queue_command() -> CreateCommand {
    CreateCommand::new("queue")
        .description("Show the queue")
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "page", "Page number").min_int_value(1),
        )
}

fn nowplaying_command() -> CreateCommand {
    CreateCommand::new("nowplaying").description("Show the current song")
}

fn shuffle_command() -> CreateCommand {
    CreateCommand::new("shuffle").description("Shuffle the queue")
}

fn loop_command() -> CreateCommand {
    CreateCommand::new("loop")
        .description("Set the loop mode")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "mode", "Loop mode")
                .add_string_choice("Off", "off")
                .add_string_choice("Current song", "track")
                .add_string_choice("Whole queue", "queue")
                .required(true),
        )
}

fn remove_command() -> CreateCommand {
    CreateCommand::new("remove")
        .description("Remove a song from the queue")
        .add_option(position("position", "Position in the queue"))
}

fn move_command() -> CreateCommand {
    CreateCommand::new("move")
        .description("Move a song within the queue")
        .add_option(position("from", "Current position"))
        .add_option(position("to", "New position"))
}

fn search_command() -> CreateCommand {
    CreateCommand::new("search")
        .description("Find songs in the queue")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "query", "Title to look for").required(true),
        )
}

// Audio

fn volume_command() -> CreateCommand {
    CreateCommand::new("volume")
        .description("Set the volume")
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "level", "Volume (0-100)")
                .min_int_value(0)
                .max_int_value(100)
                .required(true),
        )
}

fn filter_command() -> CreateCommand {
    let mut preset = CreateCommandOption::new(CommandOptionType::String, "preset", "Filter preset");
    for filter in AudioFilter::ALL {
        preset = preset.add_string_choice(filter.name(), filter.name());
    }
    preset = preset.add_string_choice("clear", "clear");

    CreateCommand::new("filter")
        .description("Apply an audio filter")
        .add_option(preset)
}

fn autoplay_command() -> CreateCommand {
    CreateCommand::new("autoplay")
        .description("Queue related songs when the queue runs out")
        .add_option(toggle("enabled", "Turn autoplay on or off"))
}

// Connection

fn join_command() -> CreateCommand {
    CreateCommand::new("join").description("Join your voice channel")
}

fn leave_command() -> CreateCommand {
    CreateCommand::new("leave").description("Leave the voice channel")
}

fn stay_command() -> CreateCommand {
    CreateCommand::new("247")
        .description("Stay in the voice channel around the clock")
        .add_option(toggle("enabled", "Turn 24/7 mode on or off"))
}

fn autodisconnect_command() -> CreateCommand {
    CreateCommand::new("autodisconnect")
        .description("Leave automatically when idle or alone")
        .add_option(toggle("enabled", "Turn auto-disconnect on or off"))
}

// History

fn history_command() -> CreateCommand {
    CreateCommand::new("history")
        .description("Show recently played songs")
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "page", "Page number").min_int_value(1),
        )
}

fn replay_command() -> CreateCommand {
    CreateCommand::new("replay")
        .description("Queue a song from the history again")
        .add_option(position("index", "Number shown in /history"))
}

// Queue documents

fn export_command() -> CreateCommand {
    CreateCommand::new("export").description("Export the queue as a JSON file")
}

fn import_command() -> CreateCommand {
    CreateCommand::new("import")
        .description("Replace the queue with an exported JSON file")
        .add_option(
            CreateCommandOption::new(CommandOptionType::Attachment, "file", "Exported queue").required(true),
        )
}

fn playlist_command() -> CreateCommand {
    CreateCommand::new("playlist")
        .description("Manage saved playlists")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "action", "What to do")
                .add_string_choice("Save the queue", "save")
                .add_string_choice("Load into the queue", "load")
                .add_string_choice("List", "list")
                .add_string_choice("Delete", "delete")
                .required(true),
        )
        .add_option(CreateCommandOption::new(
            CommandOptionType::String,
            "name",
            "Playlist name",
        ))
}

fn help_command() -> CreateCommand {
    CreateCommand::new("help").description("Show help")
}

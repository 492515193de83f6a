use anyhow::{Context as _, Result};
use serenity::{all::Http, model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod audio;
mod bot;
mod config;
mod error;
mod sources;
mod storage;
mod ui;

use crate::{
    audio::{registry::SessionRegistry, session::SessionServices},
    bot::{presence::VoicePresence, voice::SongbirdTransports, BotState, MusicBot},
    config::Config,
    sources::YtDlpResolver,
    storage::JsonStorage,
    ui::DiscordNotifier,
};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("playback_sessions=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Starting Playback Sessions v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    info!("{}", config.summary());

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .enable_all()
        .build()
        .context("cannot build the tokio runtime")?
        .block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check().await;
    }

    let config = Arc::new(config);
    let shutdown = CancellationToken::new();

    let storage = Arc::new(JsonStorage::new(config.data_dir.clone()).await?);
    match storage.list_sessions().await {
        Ok(sessions) => info!("💾 {} sessions have saved state", sessions.len()),
        Err(e) => warn!("⚠️ Could not list saved sessions: {}", e),
    }

    let resolver = Arc::new(YtDlpResolver::new());
    match resolver.verify().await {
        Ok(version) => info!("✅ yt-dlp {}", version),
        Err(e) => warn!("⚠️ {}", e),
    }

    let songbird = Songbird::serenity();
    let presence = Arc::new(VoicePresence::new());
    let http = Arc::new(Http::new(&config.discord_token));

    let services = SessionServices {
        transports: Arc::new(SongbirdTransports::new(songbird.clone(), presence.clone())),
        resolver: resolver.clone(),
        store: storage,
        notifier: Arc::new(DiscordNotifier::new(http)),
        options: config.session_options(),
    };
    let registry = Arc::new(SessionRegistry::new(services));

    let state = Arc::new(BotState {
        config: config.clone(),
        registry: registry.clone(),
        resolver,
        presence,
        http: reqwest::Client::new(),
    });

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_VOICE_STATES
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT;

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(MusicBot::new(state, shutdown.clone()))
        .register_songbird_with(songbird)
        .await?;

    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for Ctrl+C: {}", e);
            return;
        }
        info!("⚠️ Shutdown signal received, saving queues...");
        shutdown.cancel();
        registry.persist_all().await;
        shard_manager.shutdown_all().await;
    });

    info!("🚀 Bot started");
    if let Err(why) = client.start().await {
        error!("Client error: {:?}", why);
    }

    Ok(())
}

async fn health_check() -> Result<()> {
    let yt_dlp = async_process::Command::new("yt-dlp")
        .arg("--version")
        .output()
        .await?;

    let ffmpeg = async_process::Command::new("ffmpeg")
        .arg("-version")
        .output()
        .await?;

    if yt_dlp.status.success() && ffmpeg.status.success() {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("Missing dependencies: yt-dlp and ffmpeg are required");
    }
}

//! # Bot Module
//!
//! Discord front end: gateway events in, session operations out.
//!
//! - [`commands`]: slash command definitions and registration
//! - [`context`]: one [`context::InvocationContext`] per front end (slash, prefix)
//! - [`handlers`]: the single command dispatcher
//! - [`voice`] / [`events`]: the songbird-backed voice transport
//! - [`presence`]: who is in which voice channel

use anyhow::Result;
use serenity::{
    all::{Context, EventHandler, Guild, GuildId, Interaction, Message, Ready, VoiceState},
    async_trait,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod commands;
pub mod context;
pub mod events;
pub mod handlers;
pub mod presence;
pub mod voice;

use self::{
    context::{Invocation, PrefixContext, SlashContext},
    presence::VoicePresence,
};
use crate::{
    audio::{
        monitor::IdleMonitor,
        registry::SessionRegistry,
        track::{ChannelRef, SessionKey},
    },
    config::Config,
    sources::MediaResolver,
};

/// Everything a command needs.
pub struct BotState {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub resolver: Arc<dyn MediaResolver>,
    pub presence: Arc<VoicePresence>,
    /// For downloading attachments.
    pub http: reqwest::Client,
}

/// Serenity event handler.
pub struct MusicBot {
    state: Arc<BotState>,
    shutdown: CancellationToken,
    monitor_started: AtomicBool,
}

impl MusicBot {
    pub fn new(state: Arc<BotState>, shutdown: CancellationToken) -> Self {
        Self {
            state,
            shutdown,
            monitor_started: AtomicBool::new(false),
        }
    }

    /// Registers slash commands globally, or on `GUILD_ID` when set.
    ///
    /// Guild commands show up within seconds; global ones can take up to an
    /// hour to propagate.
    async fn register_commands(&self, ctx: &Context) -> Result<()> {
        info!("📝 Registering slash commands...");

        match self.state.config.guild_id {
            Some(guild_id) => {
                let guild_id = GuildId::new(guild_id);

                if !ctx.cache.guilds().contains(&guild_id) {
                    warn!("⚠️ Bot is not in the configured guild: {}", guild_id);
                    return Ok(());
                }

                commands::register_guild_commands(ctx, guild_id).await.map_err(|e| {
                    error!("❌ Error registering guild commands: {:?}", e);
                    anyhow::anyhow!(
                        "Could not register guild commands. Check the bot has 'applications.commands' in the guild."
                    )
                })?;
                info!("✅ Guild commands registered for {}", guild_id);
            }
            None => {
                commands::register_global_commands(ctx).await.map_err(|e| {
                    error!("❌ Error registering global commands: {:?}", e);
                    anyhow::anyhow!("Could not register global commands. Check the 'applications.commands' scope.")
                })?;
                info!("✅ Global commands registered");
            }
        }

        Ok(())
    }

    /// The monitor is started on the first `ready` only; reconnects fire it again.
    fn start_monitor(&self) {
        if self.monitor_started.swap(true, Ordering::SeqCst) {
            return;
        }
        IdleMonitor::new(self.state.registry.clone(), self.state.config.monitor_policy())
            .spawn(self.shutdown.clone());
    }
}

#[async_trait]
impl EventHandler for MusicBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} is online!", ready.user.name);
        info!("📊 Connected to {} servers", ready.guilds.len());

        if let Err(e) = self.register_commands(&ctx).await {
            error!("Error registering commands: {:?}", e);
        }

        self.start_monitor();
    }

    async fn guild_create(&self, ctx: Context, guild: Guild, _is_new: Option<bool>) {
        let me = ctx.cache.current_user().id;
        self.state.presence.seed(&guild, me);
        debug!("🏠 Tracking voice presence in {}", guild.name);
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(command) = interaction {
            let slash = SlashContext::new(&ctx, &command);
            let invocation = slash.invocation();
            if let Err(e) = handlers::dispatch(&self.state, &slash, &invocation).await {
                error!("Error answering /{}: {:?}", invocation.name, e);
            }
        }
    }

    async fn message(&self, ctx: Context, message: Message) {
        if message.author.bot {
            return;
        }
        let Some(invocation) = Invocation::parse_prefixed(&message.content, &self.state.config.command_prefix)
        else {
            return;
        };

        let prefix = PrefixContext::new(&ctx, &message);
        if let Err(e) = handlers::dispatch(&self.state, &prefix, &invocation).await {
            error!("Error answering {}{}: {:?}", self.state.config.command_prefix, invocation.name, e);
        }
    }

    async fn voice_state_update(&self, ctx: Context, _old: Option<VoiceState>, new: VoiceState) {
        let me = ctx.cache.current_user().id;
        self.state.presence.apply(&new, me);

        if new.user_id != me {
            return;
        }
        let Some(session) = new
            .guild_id
            .and_then(|guild_id| self.state.registry.get(SessionKey(guild_id.get())))
        else {
            return;
        };

        let reported = match new.channel_id {
            // Dragged to another channel; songbird follows on its own.
            Some(channel_id) => session.channel_moved(ChannelRef(channel_id.get())).await,
            None => {
                info!(session = %session.key(), "🔌 Voice connection closed");
                session.transport_disconnected().await
            }
        };
        if let Err(e) = reported {
            warn!(session = %session.key(), "⚠️ Could not report voice state: {}", e);
        }
    }
}

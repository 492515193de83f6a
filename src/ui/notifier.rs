use async_trait::async_trait;
use serenity::{
    all::{ChannelId, Http},
    builder::CreateMessage,
};
use std::sync::Arc;
use tracing::warn;

use super::embeds::notice_embed;
use crate::audio::{
    notice::{Notice, Notifier},
    track::{ChannelRef, SessionKey},
};

/// Posts session notices as embeds in the session's text channel.
///
/// Sends are spawned; `notify` returns before Discord answers.
pub struct DiscordNotifier {
    http: Arc<Http>,
}

impl DiscordNotifier {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    async fn notify(&self, session: SessionKey, target: ChannelRef, notice: Notice) {
        let http = self.http.clone();
        let message = CreateMessage::new().embed(notice_embed(&notice));

        tokio::spawn(async move {
            if let Err(e) = ChannelId::new(target.0).send_message(&http, message).await {
                warn!(session = %session, "⚠️ Could not send notice to {}: {}", target, e);
            }
        });
    }
}

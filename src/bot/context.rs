//! Where a command came from and how to answer it.
//!
//! Slash commands and `!`-prefixed messages are both reduced to an
//! [`Invocation`] plus an [`InvocationContext`], so the dispatcher in
//! [`super::handlers`] never knows which front end it is serving.

use anyhow::Result;
use serenity::{
    all::{
        CommandDataOptionValue, CommandInteraction, Context, CreateAttachment, CreateEmbed,
        CreateInteractionResponse, CreateInteractionResponseFollowup, CreateInteractionResponseMessage,
        CreateMessage, Message,
    },
    async_trait,
};
use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::audio::track::{ChannelRef, SessionKey, UserRef};

/// A command name with its arguments, named (slash) or positional (prefix).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub name: String,
    named: HashMap<String, String>,
    positional: Vec<String>,
}

impl Invocation {
    pub fn named(name: impl Into<String>, options: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            name: name.into().to_lowercase(),
            named: options.into_iter().collect(),
            positional: Vec::new(),
        }
    }

    /// Parses `!name arg1 arg2 ...`. Returns `None` for anything else.
    pub fn parse_prefixed(content: &str, prefix: &str) -> Option<Self> {
        let rest = content.trim().strip_prefix(prefix)?;
        let mut words = rest.split_whitespace();
        let name = words.next()?.to_lowercase();
        Some(Self {
            name,
            named: HashMap::new(),
            positional: words.map(str::to_string).collect(),
        })
    }

    /// Argument `key` of a slash command, or the word at `position` of a
    /// prefix command.
    pub fn arg(&self, key: &str, position: usize) -> Option<&str> {
        self.named
            .get(key)
            .map(String::as_str)
            .or_else(|| self.positional.get(position).map(String::as_str))
    }

    /// Everything from `position` on, for free-text arguments.
    pub fn text(&self, key: &str, position: usize) -> Option<String> {
        if let Some(value) = self.named.get(key) {
            return Some(value.clone());
        }
        let words = self.positional.get(position..)?;
        (!words.is_empty()).then(|| words.join(" "))
    }
}

/// A file the user attached to the invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub id: u64,
    pub filename: String,
    pub url: String,
    pub size: u32,
}

/// What to send back.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub content: Option<String>,
    pub embed: Option<CreateEmbed>,
    pub file: Option<(String, Vec<u8>)>,
    pub ephemeral: bool,
}

impl Response {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn embed(embed: CreateEmbed) -> Self {
        Self {
            embed: Some(embed),
            ..Default::default()
        }
    }

    pub fn error(message: impl std::fmt::Display) -> Self {
        Self {
            content: Some(format!("❌ {}", message)),
            ephemeral: true,
            ..Default::default()
        }
    }

    pub fn with_file(mut self, name: impl Into<String>, data: Vec<u8>) -> Self {
        self.file = Some((name.into(), data));
        self
    }
}

#[async_trait]
pub trait InvocationContext: Send + Sync {
    fn author(&self) -> UserRef;

    fn author_name(&self) -> String;

    fn guild(&self) -> Option<SessionKey>;

    /// Text channel the command was used in.
    fn channel(&self) -> ChannelRef;

    fn attachments(&self) -> Vec<Upload>;

    /// Signals that the answer will take a while.
    async fn defer(&self) -> Result<()>;

    async fn respond(&self, response: Response) -> Result<()>;
}

/// A slash command interaction.
pub struct SlashContext<'a> {
    ctx: &'a Context,
    command: &'a CommandInteraction,
    deferred: AtomicBool,
}

impl<'a> SlashContext<'a> {
    pub fn new(ctx: &'a Context, command: &'a CommandInteraction) -> Self {
        Self {
            ctx,
            command,
            deferred: AtomicBool::new(false),
        }
    }

    /// Flattens the interaction's options into an [`Invocation`].
    pub fn invocation(&self) -> Invocation {
        let options = self.command.data.options.iter().filter_map(|option| {
            let value = match &option.value {
                CommandDataOptionValue::String(s) => s.clone(),
                CommandDataOptionValue::Integer(i) => i.to_string(),
                CommandDataOptionValue::Boolean(b) => (if *b { "on" } else { "off" }).to_string(),
                CommandDataOptionValue::Attachment(id) => id.to_string(),
                _ => return None,
            };
            Some((option.name.clone(), value))
        });
        Invocation::named(self.command.data.name.clone(), options)
    }
}

#[async_trait]
impl InvocationContext for SlashContext<'_> {
    fn author(&self) -> UserRef {
        UserRef(self.command.user.id.get())
    }

    fn author_name(&self) -> String {
        self.command.user.name.clone()
    }

    fn guild(&self) -> Option<SessionKey> {
        self.command.guild_id.map(|g| SessionKey(g.get()))
    }

    fn channel(&self) -> ChannelRef {
        ChannelRef(self.command.channel_id.get())
    }

    fn attachments(&self) -> Vec<Upload> {
        self.command
            .data
            .resolved
            .attachments
            .values()
            .map(|a| Upload {
                id: a.id.get(),
                filename: a.filename.clone(),
                url: a.url.clone(),
                size: a.size,
            })
            .collect()
    }

    async fn defer(&self) -> Result<()> {
        if self.deferred.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.command
            .create_response(
                &self.ctx.http,
                CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
            )
            .await?;
        Ok(())
    }

    async fn respond(&self, response: Response) -> Result<()> {
        if self.deferred.load(Ordering::SeqCst) {
            let mut followup = CreateInteractionResponseFollowup::new().ephemeral(response.ephemeral);
            if let Some(content) = response.content {
                followup = followup.content(content);
            }
            if let Some(embed) = response.embed {
                followup = followup.embed(embed);
            }
            if let Some((name, data)) = response.file {
                followup = followup.add_file(CreateAttachment::bytes(data, name));
            }
            self.command.create_followup(&self.ctx.http, followup).await?;
            return Ok(());
        }

        let mut message = CreateInteractionResponseMessage::new().ephemeral(response.ephemeral);
        if let Some(content) = response.content {
            message = message.content(content);
        }
        if let Some(embed) = response.embed {
            message = message.embed(embed);
        }
        if let Some((name, data)) = response.file {
            message = message.add_file(CreateAttachment::bytes(data, name));
        }
        self.command
            .create_response(&self.ctx.http, CreateInteractionResponse::Message(message))
            .await?;
        Ok(())
    }
}

/// A `!`-prefixed text message.
pub struct PrefixContext<'a> {
    ctx: &'a Context,
    message: &'a Message,
}

impl<'a> PrefixContext<'a> {
    pub fn new(ctx: &'a Context, message: &'a Message) -> Self {
        Self { ctx, message }
    }
}

#[async_trait]
impl InvocationContext for PrefixContext<'_> {
    fn author(&self) -> UserRef {
        UserRef(self.message.author.id.get())
    }

    fn author_name(&self) -> String {
        self.message.author.name.clone()
    }

    fn guild(&self) -> Option<SessionKey> {
        self.message.guild_id.map(|g| SessionKey(g.get()))
    }

    fn channel(&self) -> ChannelRef {
        ChannelRef(self.message.channel_id.get())
    }

    fn attachments(&self) -> Vec<Upload> {
        self.message
            .attachments
            .iter()
            .map(|a| Upload {
                id: a.id.get(),
                filename: a.filename.clone(),
                url: a.url.clone(),
                size: a.size,
            })
            .collect()
    }

    async fn defer(&self) -> Result<()> {
        self.message.channel_id.broadcast_typing(&self.ctx.http).await?;
        Ok(())
    }

    async fn respond(&self, response: Response) -> Result<()> {
        let mut message = CreateMessage::new().reference_message(self.message);
        if let Some(content) = response.content {
            message = message.content(content);
        }
        if let Some(embed) = response.embed {
            message = message.embed(embed);
        }
        if let Some((name, data)) = response.file {
            message = message.add_file(CreateAttachment::bytes(data, name));
        }
        self.message.channel_id.send_message(&self.ctx.http, message).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_prefix_parsing() {
        let inv = Invocation::parse_prefixed("!Play never gonna give you up", "!").unwrap();
        assert_eq!(inv.name, "play");
        assert_eq!(inv.text("query", 0).as_deref(), Some("never gonna give you up"));
        assert_eq!(inv.arg("query", 0), Some("never"));

        assert!(Invocation::parse_prefixed("hello there", "!").is_none());
        assert!(Invocation::parse_prefixed("!", "!").is_none());
    }

    #[test]
    fn test_named_arguments_win() {
        let inv = Invocation::named(
            "move",
            [("from".to_string(), "3".to_string()), ("to".to_string(), "1".to_string())],
        );
        assert_eq!(inv.arg("from", 0), Some("3"));
        assert_eq!(inv.arg("to", 1), Some("1"));
        assert_eq!(inv.text("missing", 0), None);
    }
}

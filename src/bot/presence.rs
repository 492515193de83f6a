use dashmap::DashMap;
use serenity::all::{Guild, UserId, VoiceState};

/// Who is sitting in which voice channel, fed from gateway voice states.
///
/// Kept separately from the serenity cache so transports can be built before
/// the client exists.
#[derive(Debug, Default)]
pub struct VoicePresence {
    /// (guild, user) -> where that user is.
    states: DashMap<(u64, u64), Seat>,
}

#[derive(Debug, Clone, Copy)]
struct Seat {
    channel: u64,
    bot: bool,
}

impl VoicePresence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, guild: u64, user: u64, channel: Option<u64>, bot: bool) {
        match channel {
            Some(channel) => {
                self.states.insert((guild, user), Seat { channel, bot });
            }
            None => {
                self.states.remove(&(guild, user));
            }
        }
    }

    /// Applies a gateway voice state. `me` is always treated as a bot.
    pub fn apply(&self, state: &VoiceState, me: UserId) {
        let Some(guild) = state.guild_id else {
            return;
        };
        let bot = state.user_id == me || state.member.as_ref().is_some_and(|m| m.user.bot);
        self.update(
            guild.get(),
            state.user_id.get(),
            state.channel_id.map(|c| c.get()),
            bot,
        );
    }

    /// Seeds a guild from its `GUILD_CREATE` payload.
    pub fn seed(&self, guild: &Guild, me: UserId) {
        self.states.retain(|(g, _), _| *g != guild.id.get());
        for (user, state) in &guild.voice_states {
            let Some(channel) = state.channel_id else {
                continue;
            };
            let bot = *user == me || guild.members.get(user).is_some_and(|m| m.user.bot);
            self.update(guild.id.get(), user.get(), Some(channel.get()), bot);
        }
    }

    /// Humans in `channel`.
    pub fn occupancy(&self, guild: u64, channel: u64) -> usize {
        self.states
            .iter()
            .filter(|entry| {
                let (g, _) = *entry.key();
                g == guild && entry.channel == channel && !entry.bot
            })
            .count()
    }

    pub fn channel_of(&self, guild: u64, user: u64) -> Option<u64> {
        self.states.get(&(guild, user)).map(|seat| seat.channel)
    }
}

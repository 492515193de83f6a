use anyhow::{Context, Result};
use std::{path::PathBuf, time::Duration};

use crate::audio::{monitor::MonitorPolicy, session::SessionOptions};

#[derive(Debug, Clone)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub application_id: u64,
    pub guild_id: Option<u64>, // Slash commands are registered here only when set
    pub command_prefix: String,

    // Sessions
    pub default_volume: u8, // Percent
    pub max_queue_size: usize,
    pub autoplay_candidates: usize,
    pub history_limit: usize,

    // Idle monitor
    pub idle_timeout: Duration,
    pub monitor_interval: Duration,

    // Runtime
    pub worker_threads: usize,

    // Paths
    pub data_dir: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("cannot create data dir {}", config.data_dir.display()))?;

        Ok(config)
    }

    /// Builds the configuration from any key/value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let config = Self {
            discord_token: var("DISCORD_TOKEN").context("DISCORD_TOKEN is required")?,
            application_id: var("APPLICATION_ID")
                .context("APPLICATION_ID is required")?
                .parse()
                .context("APPLICATION_ID must be a number")?,
            guild_id: var("GUILD_ID").and_then(|s| s.parse().ok()),
            command_prefix: var("COMMAND_PREFIX").unwrap_or(defaults.command_prefix),

            default_volume: match var("DEFAULT_VOLUME") {
                Some(v) => v.parse().context("DEFAULT_VOLUME must be 0-100")?,
                None => defaults.default_volume,
            },
            max_queue_size: match var("MAX_QUEUE_SIZE") {
                Some(v) => v.parse().context("MAX_QUEUE_SIZE must be a number")?,
                None => defaults.max_queue_size,
            },
            autoplay_candidates: match var("AUTOPLAY_CANDIDATES") {
                Some(v) => v.parse().context("AUTOPLAY_CANDIDATES must be a number")?,
                None => defaults.autoplay_candidates,
            },
            history_limit: match var("HISTORY_LIMIT") {
                Some(v) => v.parse().context("HISTORY_LIMIT must be a number")?,
                None => defaults.history_limit,
            },

            idle_timeout: match var("IDLE_TIMEOUT") {
                Some(v) => humantime::parse_duration(&v).context("IDLE_TIMEOUT must look like '5m'")?,
                None => defaults.idle_timeout,
            },
            monitor_interval: match var("MONITOR_INTERVAL") {
                Some(v) => humantime::parse_duration(&v).context("MONITOR_INTERVAL must look like '15s'")?,
                None => defaults.monitor_interval,
            },

            worker_threads: match var("WORKER_THREADS") {
                Some(v) => v.parse()?,
                None => num_cpus::get(),
            },

            data_dir: var("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates configuration values for correctness.
    pub fn validate(&self) -> Result<()> {
        if self.default_volume > 100 {
            anyhow::bail!("Default volume must be between 0 and 100, got: {}", self.default_volume);
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.history_limit == 0 {
            anyhow::bail!("History limit must be greater than 0");
        }

        if self.worker_threads == 0 {
            anyhow::bail!("Worker threads must be greater than 0");
        }

        if self.monitor_interval.is_zero() {
            anyhow::bail!("Monitor interval must be greater than 0");
        }

        if self.idle_timeout < self.monitor_interval {
            anyhow::bail!(
                "Idle timeout ({}) is shorter than the monitor interval ({})",
                humantime::format_duration(self.idle_timeout),
                humantime::format_duration(self.monitor_interval)
            );
        }

        if self.command_prefix.is_empty() {
            anyhow::bail!("Command prefix cannot be empty");
        }

        Ok(())
    }

    /// Settings shared by every playback session.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            max_queue_size: self.max_queue_size,
            history_limit: self.history_limit,
            autoplay_candidates: self.autoplay_candidates,
            default_volume: self.default_volume,
            monitor: self.monitor_policy(),
        }
    }

    pub fn monitor_policy(&self) -> MonitorPolicy {
        MonitorPolicy {
            idle_timeout: self.idle_timeout,
            interval: self.monitor_interval,
        }
    }

    /// Returns a summary of the current configuration for logging, without
    /// the token.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Discord: App ID {} (Guild: {}), prefix '{}'\n  \
            Sessions: {}% vol, {} queue, {} history, {} autoplay candidates\n  \
            Idle: disconnect after {}, checked every {}\n  \
            Runtime: {} workers, data in {}",
            self.application_id,
            self.guild_id.map_or("global".to_string(), |id| id.to_string()),
            self.command_prefix,
            self.default_volume,
            self.max_queue_size,
            self.history_limit,
            self.autoplay_candidates,
            humantime::format_duration(self.idle_timeout),
            humantime::format_duration(self.monitor_interval),
            self.worker_threads,
            self.data_dir.display()
        )
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Discord (no defaults - must be provided)
            discord_token: String::new(),
            application_id: 0,
            guild_id: None,
            command_prefix: "!".to_string(),

            default_volume: 50,
            max_queue_size: 1000,
            autoplay_candidates: 5,
            history_limit: 100,

            idle_timeout: Duration::from_secs(300),
            monitor_interval: Duration::from_secs(15),

            worker_threads: num_cpus::get(),

            data_dir: "/app/data".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_apply() {
        let config = Config::from_lookup(lookup(&[("DISCORD_TOKEN", "t"), ("APPLICATION_ID", "42")])).unwrap();
        assert_eq!(config.application_id, 42);
        assert_eq!(config.default_volume, 50);
        assert_eq!(config.command_prefix, "!");
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.monitor_interval, Duration::from_secs(15));
        assert_eq!(config.session_options().autoplay_candidates, 5);
    }

    #[test]
    fn test_durations_are_humantime() {
        let config = Config::from_lookup(lookup(&[
            ("DISCORD_TOKEN", "t"),
            ("APPLICATION_ID", "42"),
            ("IDLE_TIMEOUT", "10m"),
            ("MONITOR_INTERVAL", "30s"),
        ]))
        .unwrap();
        assert_eq!(config.monitor_policy().idle_timeout, Duration::from_secs(600));
        assert_eq!(config.monitor_policy().interval, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(Config::from_lookup(lookup(&[("APPLICATION_ID", "42")])).is_err());
        assert!(Config::from_lookup(lookup(&[
            ("DISCORD_TOKEN", "t"),
            ("APPLICATION_ID", "42"),
            ("DEFAULT_VOLUME", "150"),
        ]))
        .is_err());
        assert!(Config::from_lookup(lookup(&[
            ("DISCORD_TOKEN", "t"),
            ("APPLICATION_ID", "42"),
            ("IDLE_TIMEOUT", "5s"),
        ]))
        .is_err());
    }
}

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::error::UserInputError;

/// Audio filter presets a session can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFilter {
    BassBoost,
    Nightcore,
    Vaporwave,
    #[serde(rename = "8d")]
    EightD,
}

impl AudioFilter {
    pub const ALL: [AudioFilter; 4] = [
        AudioFilter::BassBoost,
        AudioFilter::Nightcore,
        AudioFilter::Vaporwave,
        AudioFilter::EightD,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AudioFilter::BassBoost => "bassboost",
            AudioFilter::Nightcore => "nightcore",
            AudioFilter::Vaporwave => "vaporwave",
            AudioFilter::EightD => "8d",
        }
    }

    /// ffmpeg `-af` expression for transports that post-process audio.
    pub fn ffmpeg_expr(&self) -> &'static str {
        match self {
            AudioFilter::BassBoost => "bass=g=5",
            AudioFilter::Nightcore => "aresample=48000,asetrate=48000*1.25",
            AudioFilter::Vaporwave => "aresample=48000,asetrate=48000*0.8",
            AudioFilter::EightD => "apulsator=hz=0.08",
        }
    }

    /// Parses a user-supplied preset name. `clear` (or nothing) means no filter.
    pub fn parse_selection(raw: Option<&str>) -> Result<Option<AudioFilter>, UserInputError> {
        match raw.map(|s| s.trim().to_lowercase()) {
            None => Ok(None),
            Some(name) if name.is_empty() || name == "clear" => Ok(None),
            Some(name) => name.parse().map(Some),
        }
    }
}

impl FromStr for AudioFilter {
    type Err = UserInputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AudioFilter::ALL
            .into_iter()
            .find(|f| f.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UserInputError::UnknownFilter(s.to_string()))
    }
}

impl fmt::Display for AudioFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

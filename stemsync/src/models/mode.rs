//! Separation modes and their model profiles

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Sample rate every profile runs at
pub const PROFILE_SAMPLE_RATE: u32 = 44_100;

/// Separation quality mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Four-stem model
    Fast,
    /// Six-stem model
    Detailed,
}

/// Static description of the model behind a mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeProfile {
    pub model_id: &'static str,
    /// Stem names in output order
    pub stems: &'static [&'static str],
    pub description: &'static str,
    pub sample_rate: u32,
}

const FAST_PROFILE: ModeProfile = ModeProfile {
    model_id: "htdemucs",
    stems: &["drums", "bass", "other", "vocals"],
    description: "Fast 4-stem separation (drums, bass, other, vocals)",
    sample_rate: PROFILE_SAMPLE_RATE,
};

const DETAILED_PROFILE: ModeProfile = ModeProfile {
    model_id: "htdemucs_6s",
    stems: &["drums", "bass", "vocals", "guitar", "piano", "other"],
    description: "Detailed 6-stem separation (adds guitar and piano)",
    sample_rate: PROFILE_SAMPLE_RATE,
};

impl Mode {
    pub fn all() -> [Mode; 2] {
        [Mode::Fast, Mode::Detailed]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Fast => "fast",
            Mode::Detailed => "detailed",
        }
    }

    pub fn profile(&self) -> &'static ModeProfile {
        match self {
            Mode::Fast => &FAST_PROFILE,
            Mode::Detailed => &DETAILED_PROFILE,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned for anything other than `fast` / `detailed`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid mode '{0}' (expected 'fast' or 'detailed')")]
pub struct InvalidMode(pub String);

impl FromStr for Mode {
    type Err = InvalidMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" => Ok(Mode::Fast),
            "detailed" => Ok(Mode::Detailed),
            _ => Err(InvalidMode(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!("fast".parse::<Mode>().unwrap(), Mode::Fast);
        assert_eq!("FAST".parse::<Mode>().unwrap(), Mode::Fast);
        assert_eq!("Detailed".parse::<Mode>().unwrap(), Mode::Detailed);
    }

    #[test]
    fn test_parse_rejects_unknown() {
        let err = "ultra".parse::<Mode>().unwrap_err();
        assert_eq!(err, InvalidMode("ultra".to_string()));
        assert!("".parse::<Mode>().is_err());
    }

    #[test]
    fn test_profiles() {
        let fast = Mode::Fast.profile();
        assert_eq!(fast.model_id, "htdemucs");
        assert_eq!(fast.stems, &["drums", "bass", "other", "vocals"]);

        let detailed = Mode::Detailed.profile();
        assert_eq!(detailed.model_id, "htdemucs_6s");
        assert_eq!(detailed.stems.len(), 6);
        assert_eq!(detailed.stems[3], "guitar");

        for mode in Mode::all() {
            assert_eq!(mode.profile().sample_rate, 44_100);
        }
    }

    #[test]
    fn test_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Mode::Detailed).unwrap(), "\"detailed\"");
    }
}

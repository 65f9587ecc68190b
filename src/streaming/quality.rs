use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Encoder tier for a broadcast. Changing it reconfigures the encoder
/// without leaving the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityPreset {
    LowLatency,
    #[default]
    Balanced,
    HighQuality,
}

impl QualityPreset {
    pub const ALL: [QualityPreset; 3] = [
        QualityPreset::LowLatency,
        QualityPreset::Balanced,
        QualityPreset::HighQuality,
    ];

    pub fn width(self) -> u32 {
        match self {
            QualityPreset::LowLatency => 640,
            QualityPreset::Balanced => 960,
            QualityPreset::HighQuality => 1280,
        }
    }

    pub fn height(self) -> u32 {
        match self {
            QualityPreset::LowLatency => 360,
            QualityPreset::Balanced => 540,
            QualityPreset::HighQuality => 720,
        }
    }

    pub fn fps(self) -> u32 {
        match self {
            QualityPreset::LowLatency => 24,
            QualityPreset::Balanced => 15,
            QualityPreset::HighQuality => 30,
        }
    }

    pub fn bitrate_kbps(self) -> u32 {
        match self {
            QualityPreset::LowLatency => 500,
            QualityPreset::Balanced => 1200,
            QualityPreset::HighQuality => 2500,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            QualityPreset::LowLatency => "Low latency",
            QualityPreset::Balanced => "Balanced",
            QualityPreset::HighQuality => "High quality",
        }
    }
}

impl fmt::Display for QualityPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}x{}@{} {}kbps)",
            self.display_name(),
            self.width(),
            self.height(),
            self.fps(),
            self.bitrate_kbps()
        )
    }
}

impl FromStr for QualityPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "low_latency" | "low" => Ok(QualityPreset::LowLatency),
            "balanced" | "medium" => Ok(QualityPreset::Balanced),
            "high_quality" | "high" => Ok(QualityPreset::HighQuality),
            other => Err(format!("unknown quality preset: {other}")),
        }
    }
}

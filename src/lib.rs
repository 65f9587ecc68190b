pub mod actor;
pub mod camera;
pub mod capture;
pub mod events;
pub mod pipeline;
pub mod streaming;

use std::path::Path;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::streaming::QualityPreset;

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Environment variable naming the TOML file to load
pub const CONFIG_PATH_ENV: &str = "RELAYCAM_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "relaycam.toml";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub camera: CameraConfig,
    pub streaming: StreamingConfig,
    pub token: TokenConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Bind the wearable camera when it is present
    pub prefer_peripheral: bool,
    pub analysis_width: u32,
    pub analysis_height: u32,
    pub low_power_width: u32,
    pub low_power_height: u32,
    pub fps: u32,
    /// Highest `/dev/videoN` index probed
    pub device_scan_limit: u32,
    /// Force the in-process camera even when hardware is present
    pub simulate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub app_id: String,
    /// Channel id is appended to form the viewer link
    pub viewer_url_base: String,
    pub channel_prefix: String,
    pub default_quality: QualityPreset,
    pub enable_audio: bool,
    pub playout_delay_ms: u32,
    pub prefer_hardware_encoder: bool,
    /// WHIP-style ingest endpoint; empty keeps the in-process transport
    pub whip_endpoint: String,
    pub whip_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Upper bound on a whole fetch, including the spawn
    pub total_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub event_channel_capacity: usize,
    pub command_channel_capacity: usize,
    /// Log every n-th dropped frame after the first
    pub drop_log_interval: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            prefer_peripheral: true,
            analysis_width: 640,
            analysis_height: 480,
            low_power_width: 320,
            low_power_height: 240,
            fps: 30,
            device_scan_limit: 8,
            simulate: false,
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            app_id: "relaycam-dev".into(),
            viewer_url_base: "https://watch.relaycam.dev/live/".into(),
            channel_prefix: "rc-".into(),
            default_quality: QualityPreset::Balanced,
            enable_audio: true,
            playout_delay_ms: 0,
            prefer_hardware_encoder: true,
            whip_endpoint: String::new(),
            whip_timeout_ms: 10_000,
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080/token".into(),
            api_key: None,
            connect_timeout_ms: 10_000,
            read_timeout_ms: 10_000,
            total_timeout_ms: 15_000,
        }
    }
}

impl TokenConfig {
    pub fn total_timeout(&self) -> Duration {
        Duration::from_millis(self.total_timeout_ms)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: 64,
            command_channel_capacity: 16,
            drop_log_interval: 100,
        }
    }
}

impl Config {
    /// Load from `RELAYCAM_CONFIG` (or `relaycam.toml`) overlaid with
    /// `RELAYCAM__<SECTION>__<KEY>` environment variables. A missing file is
    /// not an error.
    pub fn load() -> Result<Self, config::ConfigError> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("RELAYCAM")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.token.total_timeout(), Duration::from_secs(15));
        assert_eq!(config.streaming.default_quality, QualityPreset::Balanced);
    }

    #[test]
    fn file_overrides_selected_keys() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[camera]\nsimulate = true\nfps = 15\n\n[streaming]\ndefault_quality = \"high_quality\"\nwhip_endpoint = \"https://ingest.example/whip\"\n\n[token]\napi_key = \"k\""
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert!(config.camera.simulate);
        assert_eq!(config.camera.fps, 15);
        assert_eq!(config.camera.analysis_width, 640);
        assert_eq!(config.streaming.default_quality, QualityPreset::HighQuality);
        assert_eq!(config.streaming.whip_endpoint, "https://ingest.example/whip");
        assert_eq!(config.streaming.whip_timeout_ms, 10_000);
        assert_eq!(config.token.api_key.as_deref(), Some("k"));
    }
}

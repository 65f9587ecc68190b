//! Message schema between the host actor (camera + streaming) and the
//! display actor (UI). Both directions are plain serde enums so the two
//! actors can sit in different processes.

use serde::{Deserialize, Serialize};

use crate::camera::{DeviceSelectionContext, SurfaceId};
use crate::capture::StillImage;
use crate::streaming::{QualityPreset, Viewer};

/// Upstream command surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    InitializeCamera { low_power: bool },
    CaptureStillImage,
    StartPreview { surface: SurfaceId },
    StopPreview,
    /// Without a quality the configured default preset is used
    StartStream {
        #[serde(default)]
        quality: Option<QualityPreset>,
    },
    StopStream,
    SetQuality { quality: QualityPreset },
    /// Explicitly move every consumer to another camera
    SwitchCamera { context: DeviceSelectionContext },
    Shutdown,
}

/// Downstream event surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    CameraReady {
        devices: Vec<String>,
        context: DeviceSelectionContext,
    },
    CameraError {
        message: String,
        retryable: bool,
    },
    StillCaptured {
        image: StillImage,
    },
    StreamStarted {
        channel_id: String,
        viewer_url: String,
        quality: QualityPreset,
    },
    StreamStopped {
        channel_id: String,
    },
    StreamError {
        message: String,
    },
    ViewerUpdate {
        count: usize,
        viewer: Option<Viewer>,
    },
    QualityChanged {
        quality: QualityPreset,
    },
}

impl Command {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

impl Event {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

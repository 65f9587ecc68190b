//! Camera backends and the broker that shares one binding among consumers
//!
//! ```text
//!  Preview   StillCapture   MotionAnalysis      (consumers, refcounted)
//!      \          |             /
//!       +---- CameraBroker ----+                (one binding, one context)
//!                 |
//!          dyn CameraBackend                    (V4L2 or simulator)
//! ```

pub mod broker;
pub mod simulated;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use broker::{AcquireParams, BindingToken, BrokerError, CameraBroker, FrameSink, SwitchGrant};
pub use simulated::SimulatedCamera;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::capture::CapturedFrame;
use crate::CameraConfig;

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("camera backend not available: {0}")]
    NotAvailable(String),

    #[error("camera device not found: {0}")]
    DeviceNotFound(String),

    #[error("failed to bind {device}: {reason}")]
    BindFailed { device: String, reason: String },

    #[error("no camera is bound")]
    NotBound,

    #[error("capture failed: {0}")]
    Capture(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// The wearable / external camera the product is built around
    Peripheral,
    /// The host's own camera
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Facing {
    Front,
    Back,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureMode {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// A selectable physical camera. Immutable once enumerated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraDevice {
    pub id: String,
    pub name: String,
    pub kind: DeviceKind,
    pub facing: Facing,
    pub modes: Vec<CaptureMode>,
}

impl CameraDevice {
    /// Supported mode closest in pixel count to the request
    pub fn best_mode(&self, width: u32, height: u32) -> Option<CaptureMode> {
        let wanted = width as i64 * height as i64;
        self.modes
            .iter()
            .min_by_key(|m| (m.width as i64 * m.height as i64 - wanted).abs())
            .copied()
    }
}

impl fmt::Display for CameraDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Which camera is authoritative for the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeviceSelectionContext {
    #[default]
    UsePeripheral,
    UseFallback,
}

/// A logical use of the camera with its own lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsumerKind {
    Preview,
    StillCapture,
    MotionAnalysis,
}

impl ConsumerKind {
    pub const ALL: [ConsumerKind; 3] = [
        ConsumerKind::Preview,
        ConsumerKind::StillCapture,
        ConsumerKind::MotionAnalysis,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            ConsumerKind::Preview => 0,
            ConsumerKind::StillCapture => 1,
            ConsumerKind::MotionAnalysis => 2,
        }
    }
}

impl fmt::Display for ConsumerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsumerKind::Preview => "preview",
            ConsumerKind::StillCapture => "still-capture",
            ConsumerKind::MotionAnalysis => "motion-analysis",
        };
        f.write_str(name)
    }
}

/// Opaque handle of the UI surface a preview renders into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SurfaceId(pub u64);

/// Resolution and rate requested for the physical binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// Callback a backend invokes on its own delivery thread for every
/// analysis frame
pub type FrameDelivery = Arc<dyn Fn(CapturedFrame) + Send + Sync>;

/// Per-consumer pipeline stage configuration
#[derive(Clone, Default)]
pub struct StageConfig {
    pub surface: Option<SurfaceId>,
    pub delivery: Option<FrameDelivery>,
}

/// Capability interface over a camera stack.
///
/// All methods take `&self`; implementations synchronize internally because
/// frames are produced on backend-owned threads while the broker issues
/// commands.
pub trait CameraBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// List the cameras currently present
    fn enumerate(&self) -> BackendResult<Vec<CameraDevice>>;

    /// Open `device` and start the physical capture session
    fn bind(&self, device: &CameraDevice, config: &BindConfig) -> BackendResult<()>;

    /// Stop the capture session and close the device
    fn unbind(&self);

    /// Add a consumer's pipeline stage to the bound session
    fn attach(&self, consumer: ConsumerKind, stage: StageConfig) -> BackendResult<()>;

    /// Remove a consumer's pipeline stage; the binding stays up
    fn detach(&self, consumer: ConsumerKind);

    /// Grab one full-resolution frame from the bound session
    fn capture_still(&self) -> BackendResult<CapturedFrame>;
}

/// Resolve the camera backend once at startup.
///
/// Real hardware wins when it is compiled in, not disabled by config, and
/// at least one capture device answers; the simulator covers everything else.
pub fn probe_backend(config: &CameraConfig) -> Arc<dyn CameraBackend> {
    #[cfg(feature = "v4l2")]
    if !config.simulate {
        let camera = v4l2::V4l2Camera::new(config.device_scan_limit);
        match camera.enumerate() {
            Ok(devices) if !devices.is_empty() => {
                info!(count = devices.len(), "Using V4L2 camera backend");
                return Arc::new(camera);
            }
            Ok(_) => info!("No V4L2 capture devices found"),
            Err(e) => info!(error = %e, "V4L2 probe failed"),
        }
    }

    info!(fps = config.fps, "Using simulated camera backend");
    Arc::new(SimulatedCamera::new().with_frame_rate(config.fps))
}

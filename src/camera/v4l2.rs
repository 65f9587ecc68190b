//! V4L2 camera backend
//!
//! Captures NV12 through memory-mapped buffers on a dedicated thread. Each
//! buffer is copied once into a `Bytes` and exposed as three plane views
//! over that single allocation.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::framesize::FrameSizeEnum;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::{
    BackendError, BackendResult, BindConfig, CameraBackend, CameraDevice, CaptureMode,
    ConsumerKind, DeviceKind, Facing, FrameDelivery, StageConfig,
};
use crate::capture::{CapturedFrame, Plane, Rotation};
use crate::pipeline::{FailureStreak, StreakAction};

const NV12: &[u8; 4] = b"NV12";
const BUFFER_COUNT: u32 = 4;
const STILL_TIMEOUT: Duration = Duration::from_secs(2);
const DEQUEUE_RETRY: Duration = Duration::from_millis(10);
/// Roughly five seconds of consecutive dequeue errors
const DEQUEUE_FAILURE_LIMIT: u64 = 500;
const DEQUEUE_LOG_INTERVAL: u64 = 100;

/// Last frame seen by the capture thread, kept for still capture
struct RawCapture {
    data: Bytes,
    width: u32,
    height: u32,
    stride: usize,
    timestamp: Duration,
}

impl RawCapture {
    fn to_frame(&self) -> CapturedFrame {
        let luma_len = self.stride * self.height as usize;
        let end = self.data.len();
        CapturedFrame::new(
            Plane::new(self.data.slice(..luma_len), self.stride, 1),
            Plane::new(self.data.slice(luma_len..end - 1), self.stride, 2),
            Plane::new(self.data.slice(luma_len + 1..end), self.stride, 2),
            self.width,
            self.height,
            Rotation::Deg0,
            self.timestamp,
        )
    }
}

struct DeliverySlot(FrameDelivery);

struct Shared {
    running: AtomicBool,
    latest: ArcSwapOption<RawCapture>,
    delivery: ArcSwapOption<DeliverySlot>,
}

struct Session {
    device: CameraDevice,
    shared: Arc<Shared>,
    thread: JoinHandle<()>,
}

/// High-performance V4L2 capture
pub struct V4l2Camera {
    scan_limit: u32,
    session: Mutex<Option<Session>>,
}

impl V4l2Camera {
    pub fn new(scan_limit: u32) -> Self {
        Self {
            scan_limit,
            session: Mutex::new(None),
        }
    }

    fn describe(path: &str) -> Option<CameraDevice> {
        let dev = Device::with_path(path).ok()?;
        let caps = dev.query_caps().ok()?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return None;
        }

        let fourcc = FourCC::new(NV12);
        let formats = dev.enum_formats().ok()?;
        if !formats.iter().any(|f| f.fourcc == fourcc) {
            debug!(path, card = %caps.card, "Skipping device without NV12");
            return None;
        }

        let modes = dev
            .enum_framesizes(fourcc)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|size| match size.size {
                FrameSizeEnum::Discrete(d) => Some(CaptureMode {
                    width: d.width,
                    height: d.height,
                    fps: 30,
                }),
                _ => None,
            })
            .collect();

        // USB cameras are the external peripheral; on-board sensors are local
        let peripheral = caps.bus.starts_with("usb");
        Some(CameraDevice {
            id: path.to_string(),
            name: caps.card,
            kind: if peripheral {
                DeviceKind::Peripheral
            } else {
                DeviceKind::Local
            },
            facing: if peripheral {
                Facing::External
            } else {
                Facing::Back
            },
            modes,
        })
    }
}

fn capture_loop(device: Device, width: u32, height: u32, stride: usize, shared: Arc<Shared>) {
    let mut stream = match MmapStream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT) {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "Failed to start V4L2 stream");
            return;
        }
    };
    info!(buffers = BUFFER_COUNT, "Capture stream started");

    let mut failures = FailureStreak::new(DEQUEUE_FAILURE_LIMIT, DEQUEUE_LOG_INTERVAL);
    while shared.running.load(Ordering::Relaxed) {
        let (buf, meta) = match stream.next() {
            Ok(next) => next,
            Err(e) => {
                match failures.record_failure() {
                    StreakAction::Log => {
                        warn!(error = %e, failures = failures.count(), "V4L2 dequeue failed")
                    }
                    StreakAction::Quiet => {}
                    StreakAction::GiveUp => {
                        error!(error = %e, failures = failures.count(), "Device stopped delivering, ending capture");
                        shared.running.store(false, Ordering::Relaxed);
                        break;
                    }
                }
                std::thread::sleep(DEQUEUE_RETRY);
                continue;
            }
        };
        failures.reset();

        let raw = Arc::new(RawCapture {
            data: Bytes::copy_from_slice(buf),
            width,
            height,
            stride,
            timestamp: Duration::from_secs(meta.timestamp.sec as u64)
                + Duration::from_micros(meta.timestamp.usec as u64),
        });

        if let Some(slot) = shared.delivery.load_full() {
            (slot.0)(raw.to_frame());
        }
        shared.latest.store(Some(raw));
    }
    debug!("Capture loop exited");
}

impl CameraBackend for V4l2Camera {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    fn enumerate(&self) -> BackendResult<Vec<CameraDevice>> {
        let devices: Vec<CameraDevice> = (0..self.scan_limit)
            .map(|i| format!("/dev/video{}", i))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| Self::describe(&path))
            .collect();

        for device in &devices {
            info!(device = %device, kind = ?device.kind, "Found capture device");
        }
        Ok(devices)
    }

    fn bind(&self, device: &CameraDevice, config: &BindConfig) -> BackendResult<()> {
        let mut session = self.session.lock();
        if let Some(current) = session.as_ref() {
            return Err(BackendError::BindFailed {
                device: device.id.clone(),
                reason: format!("{} is still bound", current.device.id),
            });
        }

        let dev = Device::with_path(&device.id).map_err(|e| BackendError::BindFailed {
            device: device.id.clone(),
            reason: e.to_string(),
        })?;

        let mut fmt = dev.format()?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = FourCC::new(NV12);
        let fmt = dev.set_format(&fmt)?;
        if fmt.fourcc != FourCC::new(NV12) {
            return Err(BackendError::BindFailed {
                device: device.id.clone(),
                reason: format!("driver refused NV12, offered {}", fmt.fourcc),
            });
        }

        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            latest: ArcSwapOption::empty(),
            delivery: ArcSwapOption::empty(),
        });
        let (width, height, stride) = (fmt.width, fmt.height, fmt.stride as usize);
        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("v4l2-capture".into())
            .spawn(move || capture_loop(dev, width, height, stride, thread_shared))?;

        info!(device = %device, width, height, "V4L2 camera bound");
        *session = Some(Session {
            device: device.clone(),
            shared,
            thread,
        });
        Ok(())
    }

    fn unbind(&self) {
        if let Some(session) = self.session.lock().take() {
            session.shared.running.store(false, Ordering::Relaxed);
            session.shared.delivery.store(None);
            if session.thread.join().is_err() {
                error!("V4L2 capture thread panicked");
            }
            info!(device = %session.device, "V4L2 camera unbound");
        }
    }

    fn attach(&self, consumer: ConsumerKind, stage: StageConfig) -> BackendResult<()> {
        let session = self.session.lock();
        let session = session.as_ref().ok_or(BackendError::NotBound)?;

        match consumer {
            ConsumerKind::MotionAnalysis => {
                let slot = stage.delivery.map(|d| Arc::new(DeliverySlot(d)));
                session.shared.delivery.store(slot);
            }
            ConsumerKind::Preview => {
                // Rendering into the surface belongs to the platform layer
                debug!(surface = ?stage.surface, "Preview stage attached");
            }
            ConsumerKind::StillCapture => {}
        }
        Ok(())
    }

    fn detach(&self, consumer: ConsumerKind) {
        if consumer == ConsumerKind::MotionAnalysis {
            if let Some(session) = self.session.lock().as_ref() {
                session.shared.delivery.store(None);
            }
        }
    }

    fn capture_still(&self) -> BackendResult<CapturedFrame> {
        let shared = match self.session.lock().as_ref() {
            Some(session) => Arc::clone(&session.shared),
            None => return Err(BackendError::NotBound),
        };

        let deadline = Instant::now() + STILL_TIMEOUT;
        loop {
            if let Some(raw) = shared.latest.load_full() {
                return Ok(raw.to_frame());
            }
            if Instant::now() >= deadline {
                return Err(BackendError::Capture("no frame within timeout".into()));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

//! In-process camera that synthesizes frames
//!
//! Hands out NV21 semi-planar memory viewed as three planes, the same shape
//! phone camera stacks deliver. Every frame borrows a slot from a counted
//! pool so callers can check that nothing leaks.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{
    BackendError, BackendResult, BindConfig, CameraBackend, CameraDevice, CaptureMode,
    ConsumerKind, DeviceKind, Facing, FrameDelivery, StageConfig,
};
use crate::capture::{CapturedFrame, Plane, Rotation};

struct Generator {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct SimState {
    bound: Option<(CameraDevice, BindConfig)>,
    attached: [bool; 3],
    delivery: Option<FrameDelivery>,
    generator: Option<Generator>,
}

pub struct SimulatedCamera {
    devices: Vec<CameraDevice>,
    frame_rate: Option<u32>,
    state: Mutex<SimState>,
    failing: Mutex<HashSet<String>>,
    outstanding: Arc<AtomicUsize>,
    sequence: Arc<AtomicU64>,
    binds: AtomicU64,
    epoch: Instant,
}

impl SimulatedCamera {
    pub const PERIPHERAL_ID: &'static str = "sim-peripheral";
    pub const LOCAL_ID: &'static str = "sim-local";

    /// A peripheral camera plus a local fallback
    pub fn new() -> Self {
        Self::with_devices(vec![
            CameraDevice {
                id: Self::PERIPHERAL_ID.into(),
                name: "Simulated peripheral".into(),
                kind: DeviceKind::Peripheral,
                facing: Facing::External,
                modes: vec![
                    CaptureMode { width: 640, height: 480, fps: 30 },
                    CaptureMode { width: 1280, height: 720, fps: 30 },
                ],
            },
            CameraDevice {
                id: Self::LOCAL_ID.into(),
                name: "Simulated local camera".into(),
                kind: DeviceKind::Local,
                facing: Facing::Back,
                modes: vec![
                    CaptureMode { width: 640, height: 480, fps: 30 },
                    CaptureMode { width: 1920, height: 1080, fps: 30 },
                ],
            },
        ])
    }

    pub fn with_devices(devices: Vec<CameraDevice>) -> Self {
        Self {
            devices,
            frame_rate: None,
            state: Mutex::new(SimState::default()),
            failing: Mutex::new(HashSet::new()),
            outstanding: Arc::new(AtomicUsize::new(0)),
            sequence: Arc::new(AtomicU64::new(0)),
            binds: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    /// Generate analysis frames on a background thread at `fps`.
    /// Zero leaves frame delivery to [`SimulatedCamera::emit_frame`].
    pub fn with_frame_rate(mut self, fps: u32) -> Self {
        self.frame_rate = (fps > 0).then_some(fps);
        self
    }

    /// Make every bind of `device_id` fail until cleared
    pub fn fail_bind(&self, device_id: &str) {
        self.failing.lock().insert(device_id.to_string());
    }

    pub fn clear_bind_failure(&self, device_id: &str) {
        self.failing.lock().remove(device_id);
    }

    /// Deliver one analysis frame on the calling thread.
    /// Returns false when no analysis stage is attached.
    pub fn emit_frame(&self) -> bool {
        let (delivery, config) = {
            let state = self.state.lock();
            match (&state.delivery, &state.bound) {
                (Some(delivery), Some((_, config))) => (Arc::clone(delivery), *config),
                _ => return false,
            }
        };
        let frame = self.synthesize(config.width, config.height);
        delivery(frame);
        true
    }

    pub fn bind_count(&self) -> u64 {
        self.binds.load(Ordering::Relaxed)
    }

    pub fn bound_device(&self) -> Option<CameraDevice> {
        self.state.lock().bound.as_ref().map(|(d, _)| d.clone())
    }

    pub fn is_attached(&self, consumer: ConsumerKind) -> bool {
        self.state.lock().attached[consumer.index()]
    }

    /// Frames handed out and not yet released
    pub fn outstanding_buffers(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    fn synthesize(&self, width: u32, height: u32) -> CapturedFrame {
        synthesize(
            width,
            height,
            self.epoch.elapsed(),
            &self.sequence,
            &self.outstanding,
        )
    }

    fn stop_generator(state: &mut SimState) {
        if let Some(generator) = state.generator.take() {
            generator.stop.store(true, Ordering::Relaxed);
            let _ = generator.handle.join();
        }
    }
}

impl Default for SimulatedCamera {
    fn default() -> Self {
        Self::new()
    }
}

fn synthesize(
    width: u32,
    height: u32,
    timestamp: Duration,
    sequence: &AtomicU64,
    outstanding: &Arc<AtomicUsize>,
) -> CapturedFrame {
    let seq = sequence.fetch_add(1, Ordering::Relaxed);
    let (w, h) = (width as usize, height as usize);
    let cw = w.div_ceil(2);
    let ch = h.div_ceil(2);

    // Moving diagonal gradient so consecutive frames differ
    let mut buf = Vec::with_capacity(w * h + cw * ch * 2);
    for row in 0..h {
        for col in 0..w {
            buf.push((row + col + seq as usize) as u8);
        }
    }
    for i in 0..cw * ch {
        buf.push((128 + (i + seq as usize) % 16) as u8); // V
        buf.push((128 - (i % 16)) as u8); // U
    }

    let buf = Bytes::from(buf);
    let luma = buf.slice(..w * h);
    let chroma_end = buf.len();
    let v = buf.slice(w * h..chroma_end - 1);
    let u = buf.slice(w * h + 1..chroma_end);

    outstanding.fetch_add(1, Ordering::SeqCst);
    let pool = Arc::clone(outstanding);
    CapturedFrame::new(
        Plane::new(luma, w, 1),
        Plane::new(u, cw * 2, 2),
        Plane::new(v, cw * 2, 2),
        width,
        height,
        Rotation::Deg0,
        timestamp,
    )
    .with_release(move || {
        pool.fetch_sub(1, Ordering::SeqCst);
    })
}

impl CameraBackend for SimulatedCamera {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn enumerate(&self) -> BackendResult<Vec<CameraDevice>> {
        Ok(self.devices.clone())
    }

    fn bind(&self, device: &CameraDevice, config: &BindConfig) -> BackendResult<()> {
        if !self.devices.iter().any(|d| d.id == device.id) {
            return Err(BackendError::DeviceNotFound(device.id.clone()));
        }
        if self.failing.lock().contains(&device.id) {
            return Err(BackendError::BindFailed {
                device: device.id.clone(),
                reason: "simulated bind failure".into(),
            });
        }

        let mut state = self.state.lock();
        if let Some((current, _)) = &state.bound {
            return Err(BackendError::BindFailed {
                device: device.id.clone(),
                reason: format!("{} is still bound", current.id),
            });
        }
        state.bound = Some((device.clone(), *config));
        self.binds.fetch_add(1, Ordering::Relaxed);
        info!(device = %device, width = config.width, height = config.height, "Simulated camera bound");
        Ok(())
    }

    fn unbind(&self) {
        let mut state = self.state.lock();
        Self::stop_generator(&mut state);
        state.delivery = None;
        state.attached = [false; 3];
        state.bound = None;
        debug!("Simulated camera unbound");
    }

    fn attach(&self, consumer: ConsumerKind, stage: StageConfig) -> BackendResult<()> {
        let mut state = self.state.lock();
        let Some((_, config)) = state.bound.clone() else {
            return Err(BackendError::NotBound);
        };
        state.attached[consumer.index()] = true;

        if consumer != ConsumerKind::MotionAnalysis {
            return Ok(());
        }
        let Some(delivery) = stage.delivery else {
            return Ok(());
        };
        state.delivery = Some(Arc::clone(&delivery));

        if let Some(fps) = self.frame_rate {
            let stop = Arc::new(AtomicBool::new(false));
            let thread_stop = Arc::clone(&stop);
            let sequence = Arc::clone(&self.sequence);
            let outstanding = Arc::clone(&self.outstanding);
            let epoch = self.epoch;
            let period = Duration::from_secs(1) / fps;

            let handle = std::thread::Builder::new()
                .name("sim-camera".into())
                .spawn(move || {
                    while !thread_stop.load(Ordering::Relaxed) {
                        let frame = synthesize(
                            config.width,
                            config.height,
                            epoch.elapsed(),
                            &sequence,
                            &outstanding,
                        );
                        delivery(frame);
                        std::thread::sleep(period);
                    }
                })?;
            state.generator = Some(Generator { stop, handle });
        }
        Ok(())
    }

    fn detach(&self, consumer: ConsumerKind) {
        let mut state = self.state.lock();
        state.attached[consumer.index()] = false;
        if consumer == ConsumerKind::MotionAnalysis {
            Self::stop_generator(&mut state);
            state.delivery = None;
        }
    }

    fn capture_still(&self) -> BackendResult<CapturedFrame> {
        let config = match &self.state.lock().bound {
            Some((_, config)) => *config,
            None => return Err(BackendError::NotBound),
        };
        Ok(self.synthesize(config.width, config.height))
    }
}

//! Camera resource broker
//!
//! Owns the single physical binding and hands it out to refcounted
//! consumers. A binding is made under one [`DeviceSelectionContext`] and
//! stays under it until every consumer has released; a request under a
//! different context is rejected rather than silently rebinding the camera
//! out from under the other consumers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::{
    BackendError, BindConfig, CameraBackend, CameraDevice, ConsumerKind, DeviceKind,
    DeviceSelectionContext, FrameDelivery, StageConfig, SurfaceId,
};
use crate::capture::{convert, CapturedFrame, StillImage, WireFrame};
use crate::pipeline::counters::{log_drop, CaptureCounters, CaptureStats};

static NEXT_BROKER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("no camera available: {0}")]
    NoCameraAvailable(String),

    #[error("failed to bind {device}: {reason}")]
    BindFailed { device: String, reason: String },

    #[error("camera is bound under {bound:?}, {requested:?} was requested")]
    ContextConflict {
        bound: DeviceSelectionContext,
        requested: DeviceSelectionContext,
    },

    #[error("camera is busy with {active:?}")]
    Busy { active: Vec<ConsumerKind> },

    #[error("{0} has not been acquired")]
    NotAcquired(ConsumerKind),

    #[error("switch grant belongs to another broker")]
    ForeignGrant,

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl BrokerError {
    /// Whether the same call may succeed if simply retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::BindFailed { .. } | BrokerError::Backend(_))
    }
}

/// Receives converted analysis frames on the hardware delivery thread
pub type FrameSink = Arc<dyn Fn(&WireFrame) + Send + Sync>;

#[derive(Clone)]
pub struct AcquireParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Preview only
    pub surface: Option<SurfaceId>,
    /// Motion analysis only; replaces any sink already installed
    pub sink: Option<FrameSink>,
}

impl AcquireParams {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            fps,
            surface: None,
            sink: None,
        }
    }

    pub fn with_surface(mut self, surface: SurfaceId) -> Self {
        self.surface = Some(surface);
        self
    }

    pub fn with_sink(mut self, sink: FrameSink) -> Self {
        self.sink = Some(sink);
        self
    }
}

/// Proof of a successful acquire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingToken {
    pub consumer: ConsumerKind,
    pub device: CameraDevice,
    pub context: DeviceSelectionContext,
    /// Increments on every physical bind
    pub generation: u64,
}

/// Capability to rebind the camera while consumers are active.
///
/// Exactly one exists per broker and it cannot be cloned, so whoever holds it
/// is the only party able to force a context switch.
#[derive(Debug)]
pub struct SwitchGrant {
    broker_id: u64,
}

#[derive(Debug, Clone)]
struct Binding {
    device: CameraDevice,
    context: DeviceSelectionContext,
    config: BindConfig,
    generation: u64,
}

struct BrokerState {
    context: DeviceSelectionContext,
    bound: Option<Binding>,
    refcounts: [u32; 3],
    surfaces: [Option<SurfaceId>; 3],
    peripheral_failed: bool,
    generation: u64,
}

impl BrokerState {
    fn total(&self) -> u32 {
        self.refcounts.iter().sum()
    }

    fn active(&self) -> Vec<ConsumerKind> {
        ConsumerKind::ALL
            .into_iter()
            .filter(|c| self.refcounts[c.index()] > 0)
            .collect()
    }
}

struct SinkSlot(FrameSink);

/// Hardware-thread side of motion analysis: convert, hand off, release
struct AnalysisPath {
    sink: ArcSwapOption<SinkSlot>,
    buffer: Mutex<WireFrame>,
    counters: CaptureCounters,
    drop_log_interval: u64,
}

impl AnalysisPath {
    fn on_frame(&self, frame: CapturedFrame) {
        let Some(slot) = self.sink.load_full() else {
            let total = self.counters.record_dropped_after_release();
            log_drop("Released-consumer", total, self.drop_log_interval);
            frame.release();
            return;
        };

        let mut buffer = self.buffer.lock();
        match convert(&frame, &mut buffer) {
            Ok(()) => {
                self.counters.record_converted();
                (slot.0)(&buffer);
                self.counters.record_delivered();
            }
            Err(e) => {
                let total = self.counters.record_convert_failed();
                if total == 1 || total % self.drop_log_interval.max(1) == 0 {
                    warn!(error = %e, total, "Dropping unconvertible frame");
                }
            }
        }
        drop(buffer);
        frame.release();
    }
}

/// Single owner of the physical camera binding
pub struct CameraBroker {
    id: u64,
    backend: Arc<dyn CameraBackend>,
    state: Mutex<BrokerState>,
    analysis: Arc<AnalysisPath>,
}

impl CameraBroker {
    pub fn new(backend: Arc<dyn CameraBackend>, drop_log_interval: u64) -> (Self, SwitchGrant) {
        let id = NEXT_BROKER_ID.fetch_add(1, Ordering::Relaxed);
        info!(backend = backend.name(), "Creating camera broker");

        let broker = Self {
            id,
            backend,
            state: Mutex::new(BrokerState {
                context: DeviceSelectionContext::default(),
                bound: None,
                refcounts: [0; 3],
                surfaces: [None; 3],
                peripheral_failed: false,
                generation: 0,
            }),
            analysis: Arc::new(AnalysisPath {
                sink: ArcSwapOption::empty(),
                buffer: Mutex::new(WireFrame::new()),
                counters: CaptureCounters::default(),
                drop_log_interval,
            }),
        };
        (broker, SwitchGrant { broker_id: id })
    }

    /// Take a reference for `consumer`, binding the camera under `context`
    /// if nothing is bound yet.
    #[instrument(skip(self, params), fields(consumer = %consumer))]
    pub fn acquire(
        &self,
        consumer: ConsumerKind,
        context: DeviceSelectionContext,
        params: AcquireParams,
    ) -> Result<BindingToken, BrokerError> {
        let mut state = self.state.lock();

        match state.bound.as_ref().map(|b| b.context) {
            Some(bound) if bound != context => {
                warn!(?bound, requested = ?context, "Context conflict");
                return Err(BrokerError::ContextConflict {
                    bound,
                    requested: context,
                });
            }
            Some(_) => {}
            None => {
                let config = BindConfig {
                    width: params.width,
                    height: params.height,
                    fps: params.fps,
                };
                self.bind_locked(&mut state, context, config)?;
            }
        }

        let idx = consumer.index();
        if consumer == ConsumerKind::MotionAnalysis {
            if let Some(sink) = &params.sink {
                self.analysis.sink.store(Some(Arc::new(SinkSlot(Arc::clone(sink)))));
            }
        }

        if state.refcounts[idx] == 0 {
            state.surfaces[idx] = params.surface;
            if let Err(e) = self.attach_stage(consumer, params.surface) {
                if consumer == ConsumerKind::MotionAnalysis {
                    self.analysis.sink.store(None);
                }
                if state.total() == 0 {
                    self.unbind_locked(&mut state);
                }
                return Err(BrokerError::Backend(e));
            }
        }
        state.refcounts[idx] += 1;

        let bound = state
            .bound
            .as_ref()
            .ok_or_else(|| BrokerError::NoCameraAvailable("binding vanished".into()))?;
        debug!(refcount = state.refcounts[idx], device = %bound.device, "Consumer acquired");

        Ok(BindingToken {
            consumer,
            device: bound.device.clone(),
            context: bound.context,
            generation: bound.generation,
        })
    }

    /// Drop one reference for `consumer`. The last reference detaches that
    /// consumer's stage; the last reference overall unbinds the camera.
    #[instrument(skip(self), fields(consumer = %consumer))]
    pub fn release(&self, consumer: ConsumerKind) {
        let mut state = self.state.lock();
        let idx = consumer.index();

        if state.refcounts[idx] == 0 {
            warn!("Release without matching acquire");
            return;
        }

        state.refcounts[idx] -= 1;
        if state.refcounts[idx] == 0 {
            if consumer == ConsumerKind::MotionAnalysis {
                self.analysis.sink.store(None);
            }
            self.backend.detach(consumer);
            state.surfaces[idx] = None;
            debug!("Consumer stage detached");
        }

        if state.total() == 0 {
            self.unbind_locked(&mut state);
        }
    }

    /// Change the authoritative context. Only legal while nothing is active.
    pub fn set_device_selection_context(
        &self,
        context: DeviceSelectionContext,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        if state.total() > 0 {
            return Err(BrokerError::Busy {
                active: state.active(),
            });
        }
        state.context = context;
        state.peripheral_failed = false;
        info!(?context, "Device selection context set");
        Ok(())
    }

    /// Rebind under `context` while consumers are active.
    ///
    /// Stages are detached, the camera rebinds, and every active stage is
    /// re-attached. If the new binding cannot be made the previous device is
    /// restored; if that fails too every consumer is dropped.
    #[instrument(skip(self, grant))]
    pub fn switch_context(
        &self,
        context: DeviceSelectionContext,
        grant: &SwitchGrant,
    ) -> Result<(), BrokerError> {
        if grant.broker_id != self.id {
            return Err(BrokerError::ForeignGrant);
        }

        let mut state = self.state.lock();
        state.peripheral_failed = false;

        let Some(previous) = state.bound.clone() else {
            state.context = context;
            return Ok(());
        };
        if previous.context == context {
            return Ok(());
        }

        let active = state.active();
        info!(from = ?previous.context, to = ?context, ?active, "Switching camera context");
        for consumer in &active {
            self.backend.detach(*consumer);
        }
        self.backend.unbind();
        state.bound = None;

        let outcome = self.bind_locked(&mut state, context, previous.config);
        if outcome.is_err() {
            warn!("Context switch failed, restoring previous binding");
            let restored = self.bind_locked(&mut state, previous.context, previous.config);
            if restored.is_err() {
                warn!("Restore failed, dropping all consumers");
                self.analysis.sink.store(None);
                state.refcounts = [0; 3];
                state.surfaces = [None; 3];
                return outcome;
            }
        }

        for consumer in active {
            let surface = state.surfaces[consumer.index()];
            if let Err(e) = self.attach_stage(consumer, surface) {
                warn!(%consumer, error = %e, "Stage lost during context switch");
                if consumer == ConsumerKind::MotionAnalysis {
                    self.analysis.sink.store(None);
                }
                state.refcounts[consumer.index()] = 0;
                state.surfaces[consumer.index()] = None;
            }
        }
        if state.total() == 0 {
            self.unbind_locked(&mut state);
        }

        outcome
    }

    /// Take one still image. `StillCapture` must be acquired.
    pub fn capture_still(&self) -> Result<StillImage, BrokerError> {
        if self.refcount(ConsumerKind::StillCapture) == 0 {
            return Err(BrokerError::NotAcquired(ConsumerKind::StillCapture));
        }

        let frame = self.backend.capture_still()?;
        let mut wire = WireFrame::new();
        let converted = convert(&frame, &mut wire);
        frame.release();
        converted.map_err(|e| BrokerError::Backend(BackendError::Capture(e.to_string())))?;

        info!(width = wire.width, height = wire.height, "Still image captured");
        Ok(StillImage::from_wire(&wire))
    }

    pub fn refcount(&self, consumer: ConsumerKind) -> u32 {
        self.state.lock().refcounts[consumer.index()]
    }

    pub fn is_bound(&self) -> bool {
        self.state.lock().bound.is_some()
    }

    pub fn bound_device(&self) -> Option<CameraDevice> {
        self.state.lock().bound.as_ref().map(|b| b.device.clone())
    }

    /// Context of the live binding, or the one the next bind defaults to
    pub fn current_context(&self) -> DeviceSelectionContext {
        let state = self.state.lock();
        state.bound.as_ref().map_or(state.context, |b| b.context)
    }

    pub fn active_consumers(&self) -> Vec<ConsumerKind> {
        self.state.lock().active()
    }

    pub fn frame_stats(&self) -> CaptureStats {
        self.analysis.counters.snapshot()
    }

    pub fn available_devices(&self) -> Result<Vec<CameraDevice>, BrokerError> {
        Ok(self.backend.enumerate()?)
    }

    fn attach_stage(
        &self,
        consumer: ConsumerKind,
        surface: Option<SurfaceId>,
    ) -> Result<(), BackendError> {
        let delivery = (consumer == ConsumerKind::MotionAnalysis).then(|| {
            let path = Arc::clone(&self.analysis);
            Arc::new(move |frame: CapturedFrame| path.on_frame(frame)) as FrameDelivery
        });
        self.backend.attach(consumer, StageConfig { surface, delivery })
    }

    fn bind_locked(
        &self,
        state: &mut BrokerState,
        context: DeviceSelectionContext,
        config: BindConfig,
    ) -> Result<(), BrokerError> {
        let devices = self
            .backend
            .enumerate()
            .map_err(|e| BrokerError::NoCameraAvailable(e.to_string()))?;

        let device = select_device(&devices, context, state.peripheral_failed)
            .ok_or_else(|| {
                BrokerError::NoCameraAvailable(format!("no camera matches {context:?}"))
            })?
            .clone();

        let config = device
            .best_mode(config.width, config.height)
            .map_or(config, |mode| BindConfig {
                width: mode.width,
                height: mode.height,
                fps: config.fps.min(mode.fps),
            });

        if let Err(e) = self.backend.bind(&device, &config) {
            if device.kind == DeviceKind::Peripheral {
                state.peripheral_failed = true;
            }
            warn!(device = %device, error = %e, "Camera bind failed");
            return Err(BrokerError::BindFailed {
                device: device.id,
                reason: e.to_string(),
            });
        }

        state.generation += 1;
        info!(
            device = %device,
            ?context,
            width = config.width,
            height = config.height,
            generation = state.generation,
            "Camera bound"
        );
        state.context = context;
        state.bound = Some(Binding {
            device,
            context,
            config,
            generation: state.generation,
        });
        Ok(())
    }

    fn unbind_locked(&self, state: &mut BrokerState) {
        if let Some(bound) = state.bound.take() {
            self.backend.unbind();
            info!(device = %bound.device, "Camera unbound");
        }
    }
}

/// Pick the camera for `context`: the peripheral when asked for and healthy,
/// otherwise the local camera.
pub fn select_device(
    devices: &[CameraDevice],
    context: DeviceSelectionContext,
    peripheral_failed: bool,
) -> Option<&CameraDevice> {
    let by_kind = |kind| devices.iter().find(|d| d.kind == kind);
    match context {
        DeviceSelectionContext::UsePeripheral if !peripheral_failed => {
            by_kind(DeviceKind::Peripheral).or_else(|| by_kind(DeviceKind::Local))
        }
        _ => by_kind(DeviceKind::Local),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CaptureMode, Facing, SimulatedCamera};

    fn device(id: &str, kind: DeviceKind) -> CameraDevice {
        CameraDevice {
            id: id.into(),
            name: id.into(),
            kind,
            facing: Facing::Back,
            modes: vec![CaptureMode {
                width: 640,
                height: 480,
                fps: 30,
            }],
        }
    }

    fn params() -> AcquireParams {
        AcquireParams::new(640, 480, 30)
    }

    #[test]
    fn selection_prefers_peripheral() {
        let devices = vec![
            device("local", DeviceKind::Local),
            device("glasses", DeviceKind::Peripheral),
        ];
        let pick = |ctx, failed| select_device(&devices, ctx, failed).map(|d| d.id.as_str());

        assert_eq!(pick(DeviceSelectionContext::UsePeripheral, false), Some("glasses"));
        assert_eq!(pick(DeviceSelectionContext::UsePeripheral, true), Some("local"));
        assert_eq!(pick(DeviceSelectionContext::UseFallback, false), Some("local"));
    }

    #[test]
    fn missing_peripheral_falls_back_to_local() {
        let devices = vec![device("local", DeviceKind::Local)];
        let picked = select_device(&devices, DeviceSelectionContext::UsePeripheral, false);
        assert_eq!(picked.map(|d| d.kind), Some(DeviceKind::Local));
    }

    #[test]
    fn refcounts_drive_the_binding() {
        let camera = Arc::new(SimulatedCamera::new());
        let (broker, _grant) = CameraBroker::new(camera.clone(), 100);
        let ctx = DeviceSelectionContext::UsePeripheral;

        broker.acquire(ConsumerKind::Preview, ctx, params()).unwrap();
        broker.acquire(ConsumerKind::Preview, ctx, params()).unwrap();
        broker.acquire(ConsumerKind::StillCapture, ctx, params()).unwrap();
        assert_eq!(camera.bind_count(), 1);

        broker.release(ConsumerKind::Preview);
        assert!(camera.is_attached(ConsumerKind::Preview));

        broker.release(ConsumerKind::Preview);
        assert!(!camera.is_attached(ConsumerKind::Preview));
        assert!(broker.is_bound());

        broker.release(ConsumerKind::StillCapture);
        assert!(!broker.is_bound());
        assert!(camera.bound_device().is_none());
    }

    #[test]
    fn conflicting_context_is_rejected() {
        let camera = Arc::new(SimulatedCamera::new());
        let (broker, _grant) = CameraBroker::new(camera.clone(), 100);

        let token = broker
            .acquire(ConsumerKind::Preview, DeviceSelectionContext::UseFallback, params())
            .unwrap();
        let err = broker
            .acquire(
                ConsumerKind::StillCapture,
                DeviceSelectionContext::UsePeripheral,
                params(),
            )
            .unwrap_err();

        assert!(matches!(err, BrokerError::ContextConflict { .. }));
        assert_eq!(broker.refcount(ConsumerKind::StillCapture), 0);
        assert_eq!(broker.bound_device(), Some(token.device));
        assert_eq!(camera.bind_count(), 1);
    }

    #[test]
    fn failed_peripheral_bind_falls_back_next_time() {
        let camera = Arc::new(SimulatedCamera::new());
        camera.fail_bind(SimulatedCamera::PERIPHERAL_ID);
        let (broker, _grant) = CameraBroker::new(camera.clone(), 100);
        let ctx = DeviceSelectionContext::UsePeripheral;

        let err = broker.acquire(ConsumerKind::Preview, ctx, params()).unwrap_err();
        assert!(err.is_retryable());
        assert!(!broker.is_bound());

        let token = broker.acquire(ConsumerKind::Preview, ctx, params()).unwrap();
        assert_eq!(token.device.kind, DeviceKind::Local);
    }

    #[test]
    fn no_devices_is_fatal() {
        let camera = Arc::new(SimulatedCamera::with_devices(Vec::new()));
        let (broker, _grant) = CameraBroker::new(camera, 100);
        let err = broker
            .acquire(ConsumerKind::Preview, DeviceSelectionContext::UsePeripheral, params())
            .unwrap_err();
        assert!(matches!(err, BrokerError::NoCameraAvailable(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn context_change_requires_idle_or_grant() {
        let camera = Arc::new(SimulatedCamera::new());
        let (broker, grant) = CameraBroker::new(camera.clone(), 100);

        broker
            .acquire(ConsumerKind::Preview, DeviceSelectionContext::UsePeripheral, params())
            .unwrap();
        let err = broker
            .set_device_selection_context(DeviceSelectionContext::UseFallback)
            .unwrap_err();
        assert!(matches!(err, BrokerError::Busy { .. }));

        broker
            .switch_context(DeviceSelectionContext::UseFallback, &grant)
            .unwrap();
        assert_eq!(broker.current_context(), DeviceSelectionContext::UseFallback);
        assert_eq!(
            broker.bound_device().map(|d| d.kind),
            Some(DeviceKind::Local)
        );
        assert!(camera.is_attached(ConsumerKind::Preview));
        assert_eq!(broker.refcount(ConsumerKind::Preview), 1);
    }

    #[test]
    fn grant_from_another_broker_is_refused() {
        let (a, _grant_a) = CameraBroker::new(Arc::new(SimulatedCamera::new()), 100);
        let (_b, grant_b) = CameraBroker::new(Arc::new(SimulatedCamera::new()), 100);
        assert!(matches!(
            a.switch_context(DeviceSelectionContext::UseFallback, &grant_b),
            Err(BrokerError::ForeignGrant)
        ));
    }

    #[test]
    fn analysis_frames_reach_the_sink_and_are_released() {
        let camera = Arc::new(SimulatedCamera::new());
        let (broker, _grant) = CameraBroker::new(camera.clone(), 100);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink: FrameSink = Arc::new(move |frame: &WireFrame| {
            sink_seen.lock().push((frame.width, frame.height, frame.data.len()));
        });

        broker
            .acquire(
                ConsumerKind::MotionAnalysis,
                DeviceSelectionContext::UsePeripheral,
                AcquireParams::new(64, 48, 30).with_sink(sink),
            )
            .unwrap();
        assert!(camera.emit_frame());
        assert!(camera.emit_frame());

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].2, WireFrame::required_len(seen[0].0, seen[0].1));
        assert_eq!(camera.outstanding_buffers(), 0);
        assert_eq!(broker.frame_stats().delivered, 2);
    }

    #[test]
    fn still_capture_needs_the_consumer() {
        let camera = Arc::new(SimulatedCamera::new());
        let (broker, _grant) = CameraBroker::new(camera, 100);
        assert!(matches!(
            broker.capture_still(),
            Err(BrokerError::NotAcquired(ConsumerKind::StillCapture))
        ));

        broker
            .acquire(
                ConsumerKind::StillCapture,
                DeviceSelectionContext::UsePeripheral,
                params(),
            )
            .unwrap();
        let still = broker.capture_still().unwrap();
        assert_eq!(still.nv21.len(), WireFrame::required_len(still.width, still.height));
    }
}

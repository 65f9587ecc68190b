use std::sync::Arc;

use flume::{Receiver, Sender};
use tracing::{debug, info, instrument, warn};

use crate::camera::{
    AcquireParams, BrokerError, CameraBroker, ConsumerKind, DeviceSelectionContext, SurfaceId,
    SwitchGrant,
};
use crate::capture::WireFrame;
use crate::events::{Command, Event};
use crate::streaming::{QualityPreset, SessionError, SessionManager, SessionState};
use crate::CameraConfig;

/// Owns the camera and the broadcast session, driven by [`Command`]s
pub struct HostActor {
    broker: Arc<CameraBroker>,
    grant: SwitchGrant,
    session: SessionManager,
    camera: CameraConfig,
    events: Sender<Event>,
    context: DeviceSelectionContext,
    low_power: bool,
    /// References this actor holds, one per consumer at most
    held: [bool; 3],
}

impl HostActor {
    pub fn new(
        broker: Arc<CameraBroker>,
        grant: SwitchGrant,
        session: SessionManager,
        camera: CameraConfig,
        events: Sender<Event>,
    ) -> Self {
        let context = if camera.prefer_peripheral {
            DeviceSelectionContext::UsePeripheral
        } else {
            DeviceSelectionContext::UseFallback
        };
        Self {
            broker,
            grant,
            session,
            camera,
            events,
            context,
            low_power: false,
            held: [false; 3],
        }
    }

    /// Process commands until `Shutdown` or until every sender is gone.
    /// Sessions that end on their own give back the analysis stream.
    pub async fn run(mut self, commands: Receiver<Command>) {
        info!("Host actor running");
        let mut ended = self.session.ended();
        loop {
            tokio::select! {
                command = commands.recv_async() => {
                    let Ok(command) = command else { break };
                    if !self.handle(command).await {
                        return;
                    }
                }
                Ok(()) = ended.changed() => self.on_session_ended(),
            }
        }
        self.teardown();
    }

    /// Apply one command. Returns `false` once the actor has shut down.
    #[instrument(skip(self))]
    pub async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::InitializeCamera { low_power } => self.initialize(low_power),
            Command::CaptureStillImage => self.capture_still(),
            Command::StartPreview { surface } => self.start_preview(surface),
            Command::StopPreview => self.release(ConsumerKind::Preview),
            Command::StartStream { quality } => {
                let quality = quality.unwrap_or_else(|| self.session.default_quality());
                self.start_stream(quality).await
            }
            Command::StopStream => {
                self.session.stop_stream();
                self.release(ConsumerKind::MotionAnalysis);
            }
            Command::SetQuality { quality } => {
                if let Err(e) = self.session.set_quality(quality).await {
                    self.stream_error(&e);
                }
            }
            Command::SwitchCamera { context } => self.switch_camera(context),
            Command::Shutdown => {
                self.teardown();
                return false;
            }
        }
        true
    }

    pub fn holds(&self, consumer: ConsumerKind) -> bool {
        self.held[consumer.index()]
    }

    /// Drop the analysis reference once no session is left to feed
    pub fn on_session_ended(&mut self) {
        if self.session.state() == SessionState::Idle && self.holds(ConsumerKind::MotionAnalysis) {
            info!("Stream ended, releasing motion analysis");
            self.release(ConsumerKind::MotionAnalysis);
        }
    }

    fn initialize(&mut self, low_power: bool) {
        self.low_power = low_power;
        if !self.held.iter().any(|h| *h) {
            if let Err(e) = self.broker.set_device_selection_context(self.context) {
                warn!(error = %e, "Keeping current device selection context");
            }
        }
        if let Err(e) = self.session.initialize() {
            self.stream_error(&e);
        }
        self.announce_devices();
    }

    fn announce_devices(&self) {
        match self.broker.available_devices() {
            Ok(devices) => self.emit(Event::CameraReady {
                devices: devices.into_iter().map(|d| d.name).collect(),
                context: self.context,
            }),
            Err(e) => self.camera_error(&e),
        }
    }

    fn params(&self) -> AcquireParams {
        if self.low_power {
            AcquireParams::new(
                self.camera.low_power_width,
                self.camera.low_power_height,
                self.camera.fps,
            )
        } else {
            AcquireParams::new(
                self.camera.analysis_width,
                self.camera.analysis_height,
                self.camera.fps,
            )
        }
    }

    fn acquire(&mut self, consumer: ConsumerKind, params: AcquireParams) -> bool {
        match self.broker.acquire(consumer, self.context, params) {
            Ok(token) => {
                debug!(%consumer, device = %token.device, "Acquired");
                self.held[consumer.index()] = true;
                true
            }
            Err(e) => {
                self.camera_error(&e);
                false
            }
        }
    }

    fn release(&mut self, consumer: ConsumerKind) {
        if std::mem::take(&mut self.held[consumer.index()]) {
            self.broker.release(consumer);
        }
    }

    fn start_preview(&mut self, surface: SurfaceId) {
        // A new surface replaces the old one
        self.release(ConsumerKind::Preview);
        let params = self.params().with_surface(surface);
        self.acquire(ConsumerKind::Preview, params);
    }

    fn capture_still(&mut self) {
        let held = self.holds(ConsumerKind::StillCapture);
        if !held && !self.acquire(ConsumerKind::StillCapture, self.params()) {
            return;
        }

        match self.broker.capture_still() {
            Ok(image) => self.emit(Event::StillCaptured { image }),
            Err(e) => self.camera_error(&e),
        }

        if !held {
            self.release(ConsumerKind::StillCapture);
        }
    }

    async fn start_stream(&mut self, quality: QualityPreset) {
        if let Err(e) = self.session.initialize() {
            self.stream_error(&e);
            return;
        }

        if !self.holds(ConsumerKind::MotionAnalysis) {
            let session = self.session.clone();
            let params = self.params().with_sink(Arc::new(move |frame: &WireFrame| {
                session.push_frame(frame);
            }));
            if !self.acquire(ConsumerKind::MotionAnalysis, params) {
                return;
            }
        }

        if let Err(e) = self.session.start_stream(quality).await {
            self.release(ConsumerKind::MotionAnalysis);
            self.stream_error(&e);
        }
    }

    fn switch_camera(&mut self, context: DeviceSelectionContext) {
        match self.broker.switch_context(context, &self.grant) {
            Ok(()) => {
                self.context = context;
                self.announce_devices();
            }
            Err(e) => {
                // Consumers the broker had to drop are no longer ours
                for consumer in ConsumerKind::ALL {
                    if self.broker.refcount(consumer) == 0 {
                        self.held[consumer.index()] = false;
                    }
                }
                self.camera_error(&e);
            }
        }
    }

    fn teardown(&mut self) {
        info!("Host actor shutting down");
        self.session.stop_stream();
        for consumer in ConsumerKind::ALL {
            self.release(consumer);
        }
    }

    fn camera_error(&self, error: &BrokerError) {
        warn!(%error, "Camera error");
        self.emit(Event::CameraError {
            message: error.to_string(),
            retryable: error.is_retryable(),
        });
    }

    fn stream_error(&self, error: &SessionError) {
        warn!(%error, "Stream error");
        self.emit(Event::StreamError {
            message: error.to_string(),
        });
    }

    fn emit(&self, event: Event) {
        if self.events.send(event).is_err() {
            debug!("Display actor gone");
        }
    }
}

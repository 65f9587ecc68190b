use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flume::Receiver;
use relaycam::actor::{DisplayActor, HostActor};
use relaycam::camera::{CameraBroker, ConsumerKind, DeviceSelectionContext, SimulatedCamera, SurfaceId};
use relaycam::events::{Command, Event};
use relaycam::streaming::{
    ConnectionState, QualityPreset, Role, SessionManager, SessionState, SimulatedTransport,
    Token, TokenError, TokenProvider, TransportEvent,
};
use relaycam::{CameraConfig, StreamingConfig};

struct StaticTokens;

#[async_trait]
impl TokenProvider for StaticTokens {
    async fn fetch_token(&self, _channel: &str, _role: Role) -> Result<Token, TokenError> {
        Ok(Token::new("t"))
    }
}

struct Rig {
    host: HostActor,
    camera: Arc<SimulatedCamera>,
    broker: Arc<CameraBroker>,
    session: SessionManager,
    transport: Arc<SimulatedTransport>,
    events: Receiver<Event>,
}

fn rig() -> Rig {
    let camera = Arc::new(SimulatedCamera::new());
    let transport = Arc::new(SimulatedTransport::new());
    let (tx, events) = flume::unbounded();

    let (broker, grant) = CameraBroker::new(camera.clone(), 100);
    let broker = Arc::new(broker);
    let session = SessionManager::new(
        StreamingConfig::default(),
        transport.clone(),
        Arc::new(StaticTokens),
        Duration::from_secs(1),
        100,
        tx.clone(),
    );
    let host = HostActor::new(
        Arc::clone(&broker),
        grant,
        session.clone(),
        CameraConfig::default(),
        tx,
    );
    Rig {
        host,
        camera,
        broker,
        session,
        transport,
        events,
    }
}

#[tokio::test]
async fn preview_still_and_stream_share_one_binding() {
    let mut rig = rig();

    assert!(rig.host.handle(Command::InitializeCamera { low_power: false }).await);
    assert!(rig.host.handle(Command::StartPreview { surface: SurfaceId(7) }).await);
    assert!(rig.host.handle(Command::CaptureStillImage).await);
    assert!(rig
        .host
        .handle(Command::StartStream {
            quality: Some(QualityPreset::Balanced)
        })
        .await);

    assert_eq!(rig.camera.bind_count(), 1);
    assert_eq!(rig.broker.refcount(ConsumerKind::StillCapture), 0);
    assert_eq!(rig.session.state(), SessionState::Active);

    // Converted frames flow through the broker into the transport
    assert!(rig.camera.emit_frame());
    assert!(rig.camera.emit_frame());
    assert_eq!(rig.transport.frames_received(), 2);

    assert!(!rig.host.handle(Command::Shutdown).await);
    assert!(!rig.broker.is_bound());
    assert_eq!(rig.session.state(), SessionState::Idle);

    let events: Vec<Event> = rig.events.drain().collect();
    assert!(matches!(
        events[0],
        Event::CameraReady {
            context: DeviceSelectionContext::UsePeripheral,
            ..
        }
    ));
    assert!(events.iter().any(|e| matches!(e, Event::StillCaptured { image } if image.width == 640)));
    assert!(events.iter().any(|e| matches!(e, Event::StreamStarted { .. })));
    assert!(matches!(events.last(), Some(Event::StreamStopped { .. })));
}

#[tokio::test]
async fn failed_join_releases_motion_analysis() {
    let mut rig = rig();
    rig.transport.set_join_result(-110);

    rig.host
        .handle(Command::StartStream {
            quality: Some(QualityPreset::HighQuality),
        })
        .await;

    assert!(!rig.host.holds(ConsumerKind::MotionAnalysis));
    assert!(!rig.broker.is_bound());
    assert!(rig
        .events
        .drain()
        .any(|e| matches!(e, Event::StreamError { .. })));
}

#[tokio::test]
async fn set_quality_without_stream_reports_an_error() {
    let mut rig = rig();
    rig.host
        .handle(Command::SetQuality {
            quality: QualityPreset::LowLatency,
        })
        .await;
    assert!(matches!(rig.events.try_recv(), Ok(Event::StreamError { .. })));
}

#[tokio::test]
async fn display_folds_what_the_host_emits() {
    let rig = rig();
    let Rig {
        host,
        events,
        session,
        ..
    } = rig;
    // Only the host and the session keep event senders alive
    drop(session);

    let (commands_tx, commands_rx) = flume::unbounded();
    let host_task = tokio::spawn(host.run(commands_rx));
    let display_task = tokio::spawn(DisplayActor::new().run(events));

    for command in [
        Command::InitializeCamera { low_power: true },
        Command::CaptureStillImage,
        Command::StartStream { quality: None },
        Command::SetQuality {
            quality: QualityPreset::HighQuality,
        },
        Command::Shutdown,
    ] {
        commands_tx.send_async(command).await.unwrap();
    }

    host_task.await.unwrap();
    let state = display_task.await.unwrap();

    assert!(state.camera_ready);
    assert_eq!(state.devices.len(), 2);
    // 320x240 is served by the nearest supported mode
    assert_eq!(state.last_still, Some((640, 480)));
    assert!(state.stream.is_none());
    assert_eq!(state.last_error, None);
}

#[tokio::test]
async fn start_without_quality_uses_the_configured_default() {
    let mut rig = rig();
    rig.host.handle(Command::StartStream { quality: None }).await;

    let expected = StreamingConfig::default().default_quality;
    assert_eq!(rig.session.session().map(|s| s.quality), Some(expected));
    assert_eq!(rig.transport.encoder(), Some(expected));
}

#[tokio::test]
async fn connection_loss_gives_back_the_analysis_stream() {
    let Rig {
        host,
        broker,
        session,
        transport,
        events,
        ..
    } = rig();
    let (commands_tx, commands_rx) = flume::unbounded();
    let host_task = tokio::spawn(host.run(commands_rx));

    commands_tx
        .send_async(Command::StartStream {
            quality: Some(QualityPreset::Balanced),
        })
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while session.state() != SessionState::Active {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(broker.is_bound());

    transport.emit(TransportEvent::ConnectionStateChanged {
        state: ConnectionState::Failed,
        reason: "uplink gone".into(),
    });

    tokio::time::timeout(Duration::from_secs(5), async {
        while broker.is_bound() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(broker.refcount(ConsumerKind::MotionAnalysis), 0);

    commands_tx.send_async(Command::Shutdown).await.unwrap();
    host_task.await.unwrap();
    assert!(events
        .drain()
        .any(|e| matches!(e, Event::StreamStopped { .. })));
}

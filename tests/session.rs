use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flume::Receiver;
use relaycam::capture::WireFrame;
use relaycam::events::Event;
use relaycam::streaming::{
    QualityPreset, Role, SessionManager, SessionState, SimulatedTransport, Token, TokenError,
    TokenProvider, TransportEvent,
};
use relaycam::StreamingConfig;
use tokio::sync::Notify;

struct StaticTokens;

#[async_trait]
impl TokenProvider for StaticTokens {
    async fn fetch_token(&self, channel: &str, role: Role) -> Result<Token, TokenError> {
        Ok(Token::new(format!("{channel}:{}", role.as_str())))
    }
}

/// Holds every fetch until the test lets it through
struct GatedTokens(Arc<Notify>);

#[async_trait]
impl TokenProvider for GatedTokens {
    async fn fetch_token(&self, _channel: &str, _role: Role) -> Result<Token, TokenError> {
        self.0.notified().await;
        Ok(Token::new("late"))
    }
}

fn setup() -> (SessionManager, Arc<SimulatedTransport>, Receiver<Event>) {
    setup_with(Arc::new(StaticTokens))
}

fn setup_with(
    tokens: Arc<dyn TokenProvider>,
) -> (SessionManager, Arc<SimulatedTransport>, Receiver<Event>) {
    let transport = Arc::new(SimulatedTransport::new());
    let (tx, rx) = flume::unbounded();
    let manager = SessionManager::new(
        StreamingConfig::default(),
        transport.clone(),
        tokens,
        Duration::from_secs(15),
        100,
        tx,
    );
    manager.initialize().unwrap();
    (manager, transport, rx)
}

fn frame() -> WireFrame {
    WireFrame {
        data: vec![16; WireFrame::required_len(64, 36)],
        width: 64,
        height: 36,
        ..WireFrame::default()
    }
}

#[tokio::test]
async fn balanced_then_high_quality_then_stop() {
    let (manager, transport, events) = setup();

    let session = manager.start_stream(QualityPreset::Balanced).await.unwrap();
    assert_eq!(transport.encoder().map(|q| q.fps()), Some(15));
    assert!(session.channel_id.starts_with(&StreamingConfig::default().channel_prefix));

    transport.emit(TransportEvent::UserJoined { uid: 11 });
    transport.emit(TransportEvent::UserJoined { uid: 12 });
    transport.emit(TransportEvent::RemoteAudio {
        uid: 12,
        speaking: true,
    });
    assert_eq!(manager.viewer_count(), 2);
    assert!(manager.viewers().iter().any(|v| v.id == 12 && v.is_speaking));

    let changed = manager.set_quality(QualityPreset::HighQuality).await.unwrap();
    assert_eq!(changed.channel_id, session.channel_id);
    assert_eq!(transport.encoder().map(|q| q.fps()), Some(30));
    assert_eq!(transport.channel(), Some(session.channel_id.clone()));

    assert!(manager.push_frame(&frame()));
    assert_eq!(transport.last_frame(), Some((64, 36, frame().data.len())));

    manager.stop_stream();
    assert_eq!(manager.state(), SessionState::Idle);
    assert_eq!(manager.viewer_count(), 0);
    assert!(manager.session().is_none());
    assert!(transport.channel().is_none());

    let kinds: Vec<&'static str> = events
        .drain()
        .map(|e| match e {
            Event::StreamStarted { .. } => "started",
            Event::ViewerUpdate { .. } => "viewer",
            Event::QualityChanged { .. } => "quality",
            Event::StreamStopped { .. } => "stopped",
            _ => "other",
        })
        .collect();
    assert_eq!(
        kinds,
        ["started", "viewer", "viewer", "viewer", "quality", "stopped"]
    );
}

#[tokio::test]
async fn restart_stops_the_previous_session_first() {
    let (manager, transport, events) = setup();

    let first = manager.start_stream(QualityPreset::LowLatency).await.unwrap();
    transport.emit(TransportEvent::UserJoined { uid: 3 });
    let second = manager.start_stream(QualityPreset::Balanced).await.unwrap();

    assert_ne!(first.channel_id, second.channel_id);
    assert_eq!(transport.channel(), Some(second.channel_id.clone()));
    assert_eq!(manager.viewer_count(), 0);

    let stopped: Vec<String> = events
        .drain()
        .filter_map(|e| match e {
            Event::StreamStopped { channel_id } => Some(channel_id),
            _ => None,
        })
        .collect();
    assert_eq!(stopped, vec![first.channel_id]);
}

#[tokio::test]
async fn frames_are_refused_outside_an_active_session() {
    let (manager, transport, _events) = setup();
    assert!(!manager.push_frame(&frame()));

    manager.start_stream(QualityPreset::Balanced).await.unwrap();
    manager.stop_stream();
    manager.stop_stream();

    assert!(!manager.push_frame(&frame()));
    assert_eq!(transport.frames_received(), 0);
    assert_eq!(manager.frame_stats().dropped_inactive, 2);
}

#[tokio::test]
async fn unknown_viewer_leaving_changes_nothing() {
    let (manager, transport, events) = setup();
    manager.start_stream(QualityPreset::Balanced).await.unwrap();
    transport.emit(TransportEvent::UserJoined { uid: 1 });
    let _ = events.drain().count();

    transport.emit(TransportEvent::UserOffline { uid: 99 });

    assert_eq!(manager.viewer_count(), 1);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn concurrent_frames_during_stop_never_panic() {
    let (manager, _transport, _events) = setup();
    manager.start_stream(QualityPreset::Balanced).await.unwrap();

    let pusher = {
        let manager = manager.clone();
        std::thread::spawn(move || {
            let frame = frame();
            (0..2_000).filter(|_| manager.push_frame(&frame)).count()
        })
    };
    manager.stop_stream();
    let accepted = pusher.join().unwrap();

    let stats = manager.frame_stats();
    assert_eq!(stats.accepted as usize, accepted);
    assert_eq!(stats.accepted + stats.dropped_inactive, 2_000);
}

#[tokio::test]
async fn frames_during_start_are_dropped_until_active() {
    let gate = Arc::new(Notify::new());
    let (manager, transport, _events) = setup_with(Arc::new(GatedTokens(Arc::clone(&gate))));

    let starting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.start_stream(QualityPreset::Balanced).await })
    };
    tokio::time::timeout(Duration::from_secs(5), async {
        while manager.state() != SessionState::Initializing {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    assert!(!manager.push_frame(&frame()));
    assert!(!manager.push_frame(&frame()));
    assert_eq!(manager.frame_stats().accepted, 0);
    assert_eq!(manager.frame_stats().dropped_inactive, 2);
    assert_eq!(transport.frames_received(), 0);

    gate.notify_one();
    starting.await.unwrap().unwrap();

    assert_eq!(manager.state(), SessionState::Active);
    assert!(manager.push_frame(&frame()));
    assert_eq!(transport.frames_received(), 1);
    assert_eq!(transport.current_token(), Some(Token::new("late")));
}

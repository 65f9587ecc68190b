//! WHIP-style HTTP ingest publisher
//!
//! `POST <endpoint>` with a JSON offer and `Authorization: Bearer <token>`
//! creates a session; the `201 Created` `Location` header names it.
//! Frames go to `POST <session>/frames` as raw NV21, encoder and token
//! changes to `PATCH <session>`, and `DELETE <session>` ends it.
//!
//! Every HTTP call runs on a dedicated worker thread with its own runtime,
//! so the session manager sees the same callback-driven contract as a
//! vendor SDK: `join_channel` returns at once and the outcome arrives as
//! [`TransportEvent`]s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use flume::{Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use reqwest::header::{CONTENT_TYPE, LOCATION, RETRY_AFTER};
use reqwest::{StatusCode, Url};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::quality::QualityPreset;
use super::token::Token;
use super::transport::{
    ConnectionState, TransportBackend, TransportConfig, TransportError, TransportEvent,
    TransportEventHandler,
};
use crate::capture::WireFrame;
use crate::pipeline::{FailureStreak, StreakAction};
use crate::StreamingConfig;

const NOT_INITIALIZED: i32 = -7;
const WORKER_GONE: i32 = -1;
/// Frames waiting for upload; newer frames are refused while it is full
const FRAME_QUEUE: usize = 4;
const FRAME_FAILURE_LIMIT: u64 = 30;
const FRAME_FAILURE_LOG_INTERVAL: u64 = 10;

#[derive(Debug, Clone, Serialize)]
struct VideoParams {
    width: u32,
    height: u32,
    fps: u32,
    bitrate_kbps: u32,
    hardware_encoder: bool,
}

impl VideoParams {
    fn new(quality: QualityPreset, hardware_encoder: bool) -> Self {
        Self {
            width: quality.width(),
            height: quality.height(),
            fps: quality.fps(),
            bitrate_kbps: quality.bitrate_kbps(),
            hardware_encoder,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct Offer {
    app_id: String,
    channel: String,
    uid: u32,
    audio: bool,
    playout_delay_ms: u32,
    video: VideoParams,
}

#[derive(Serialize)]
struct SessionPatch<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    video: Option<VideoParams>,
}

enum Op {
    Join { token: Token, offer: Offer },
    Encoder(VideoParams),
    Renew(Token),
    Leave,
}

struct OutFrame {
    data: Bytes,
    width: u32,
    height: u32,
    rotation: u32,
    timestamp_us: u64,
}

/// State the worker shares with the caller side
#[derive(Default)]
struct Shared {
    handler: RwLock<Option<Arc<dyn TransportEventHandler>>>,
    /// A session exists and frames are worth queueing
    live: AtomicBool,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler.on_event(event);
        }
    }

    fn emit_state(&self, state: ConnectionState, reason: impl Into<String>) {
        self.emit(TransportEvent::ConnectionStateChanged {
            state,
            reason: reason.into(),
        });
    }
}

#[derive(Default)]
struct Local {
    config: Option<TransportConfig>,
    encoder: Option<QualityPreset>,
}

pub struct WhipTransport {
    local: Mutex<Local>,
    shared: Arc<Shared>,
    ops: Sender<Op>,
    frames: Sender<OutFrame>,
}

impl WhipTransport {
    /// Start the upload worker for `config.whip_endpoint`
    pub fn new(config: &StreamingConfig) -> Result<Self, TransportError> {
        let endpoint = Url::parse(&config.whip_endpoint)
            .map_err(|e| TransportError::Setup(format!("bad WHIP endpoint: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.whip_timeout_ms))
            .build()
            .map_err(|e| TransportError::Setup(e.to_string()))?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| TransportError::Setup(e.to_string()))?;

        let shared = Arc::new(Shared::default());
        let (ops_tx, ops_rx) = flume::unbounded();
        let (frames_tx, frames_rx) = flume::bounded(FRAME_QUEUE);

        let worker = Worker {
            client,
            endpoint,
            shared: Arc::clone(&shared),
            session: None,
            failures: FailureStreak::new(FRAME_FAILURE_LIMIT, FRAME_FAILURE_LOG_INTERVAL),
        };
        std::thread::Builder::new()
            .name("whip-upload".into())
            .spawn(move || runtime.block_on(worker.run(ops_rx, frames_rx)))
            .map_err(|e| TransportError::Setup(e.to_string()))?;

        Ok(Self {
            local: Mutex::new(Local::default()),
            shared,
            ops: ops_tx,
            frames: frames_tx,
        })
    }

    fn send(&self, op: Op) -> bool {
        if self.ops.send(op).is_err() {
            error!("WHIP worker is gone");
            return false;
        }
        true
    }
}

impl TransportBackend for WhipTransport {
    fn name(&self) -> &'static str {
        "whip"
    }

    fn initialize(&self, config: &TransportConfig) -> Result<(), TransportError> {
        if config.app_id.is_empty() {
            return Err(TransportError::MissingCredentials);
        }
        self.local.lock().config = Some(config.clone());
        Ok(())
    }

    fn set_event_handler(&self, handler: Arc<dyn TransportEventHandler>) {
        *self.shared.handler.write() = Some(handler);
    }

    fn set_video_encoder(&self, quality: QualityPreset) -> Result<(), TransportError> {
        let hardware = {
            let mut local = self.local.lock();
            let config = local.config.as_ref().ok_or(TransportError::NotInitialized)?;
            let hardware = config.prefer_hardware_encoder;
            local.encoder = Some(quality);
            hardware
        };
        if !self.send(Op::Encoder(VideoParams::new(quality, hardware))) {
            return Err(TransportError::Encoder("upload worker stopped".into()));
        }
        Ok(())
    }

    fn join_channel(&self, token: &Token, channel: &str, uid: u32) -> i32 {
        let offer = {
            let local = self.local.lock();
            let Some(config) = &local.config else {
                return NOT_INITIALIZED;
            };
            let quality = local.encoder.unwrap_or_default();
            Offer {
                app_id: config.app_id.clone(),
                channel: channel.to_string(),
                uid,
                audio: config.enable_audio,
                playout_delay_ms: config.playout_delay_ms,
                video: VideoParams::new(quality, config.prefer_hardware_encoder),
            }
        };

        let op = Op::Join {
            token: token.clone(),
            offer,
        };
        if self.send(op) {
            0
        } else {
            WORKER_GONE
        }
    }

    fn leave_channel(&self) {
        self.shared.live.store(false, Ordering::Release);
        self.send(Op::Leave);
    }

    fn push_video_frame(&self, frame: &WireFrame) -> bool {
        if !self.shared.live.load(Ordering::Acquire) {
            return false;
        }
        let out = OutFrame {
            data: Bytes::copy_from_slice(&frame.data),
            width: frame.width,
            height: frame.height,
            rotation: frame.rotation.degrees(),
            timestamp_us: frame.timestamp.as_micros() as u64,
        };
        match self.frames.try_send(out) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Disconnected(_)) => {
                self.shared.live.store(false, Ordering::Release);
                false
            }
        }
    }

    fn renew_token(&self, token: &Token) -> Result<(), TransportError> {
        if self.send(Op::Renew(token.clone())) {
            Ok(())
        } else {
            Err(TransportError::Code(WORKER_GONE))
        }
    }
}

struct IngestSession {
    url: Url,
    frames_url: Url,
    token: Token,
}

struct Worker {
    client: reqwest::Client,
    endpoint: Url,
    shared: Arc<Shared>,
    session: Option<IngestSession>,
    failures: FailureStreak,
}

impl Worker {
    async fn run(mut self, ops: Receiver<Op>, frames: Receiver<OutFrame>) {
        debug!(endpoint = %self.endpoint, "WHIP worker started");
        loop {
            tokio::select! {
                biased;
                op = ops.recv_async() => match op {
                    Ok(op) => self.apply(op, &frames).await,
                    Err(_) => break,
                },
                Ok(frame) = frames.recv_async() => self.upload(frame).await,
            }
        }
        self.leave(&frames).await;
        debug!("WHIP worker stopped");
    }

    async fn apply(&mut self, op: Op, frames: &Receiver<OutFrame>) {
        match op {
            Op::Join { token, offer } => {
                self.leave(frames).await;
                self.join(token, offer).await;
            }
            Op::Encoder(video) => {
                self.patch(SessionPatch {
                    token: None,
                    video: Some(video),
                })
                .await;
            }
            Op::Renew(token) => {
                if let Some(session) = &mut self.session {
                    session.token = token.clone();
                }
                self.patch(SessionPatch {
                    token: Some(token.as_str()),
                    video: None,
                })
                .await;
            }
            Op::Leave => self.leave(frames).await,
        }
    }

    async fn join(&mut self, token: Token, offer: Offer) {
        self.shared.emit_state(ConnectionState::Connecting, "creating session");
        match self.create_session(&token, &offer).await {
            Ok(url) => {
                let frames_url = frames_url(&url);
                info!(session = %url, channel = %offer.channel, "WHIP session created");
                self.session = Some(IngestSession {
                    url,
                    frames_url,
                    token,
                });
                self.failures.reset();
                self.shared.live.store(true, Ordering::Release);
                self.shared.emit(TransportEvent::JoinedChannel {
                    channel: offer.channel,
                    uid: offer.uid,
                });
                self.shared.emit_state(ConnectionState::Connected, "session created");
            }
            Err(reason) => {
                warn!(%reason, "WHIP session not created");
                self.shared.emit_state(ConnectionState::Failed, reason);
            }
        }
    }

    async fn create_session(&self, token: &Token, offer: &Offer) -> Result<Url, String> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(token.as_str())
            .json(offer)
            .send()
            .await
            .map_err(|e| format!("WHIP POST failed: {e}"))?;

        match response.status() {
            StatusCode::CREATED => {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| "201 Created without Location header".to_string())?;
                resolve_location(&self.endpoint, location)
            }
            StatusCode::SERVICE_UNAVAILABLE => {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("unknown")
                    .to_string();
                Err(format!("ingest overloaded (503), retry after {retry_after}"))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(format!("WHIP POST answered {status}: {body}"))
            }
        }
    }

    async fn upload(&mut self, frame: OutFrame) {
        let Some(session) = &self.session else {
            return;
        };
        let result = self
            .client
            .post(session.frames_url.clone())
            .bearer_auth(session.token.as_str())
            .header(CONTENT_TYPE, "application/octet-stream")
            .header("X-Frame-Width", frame.width)
            .header("X-Frame-Height", frame.height)
            .header("X-Frame-Rotation", frame.rotation)
            .header("X-Frame-Timestamp-Us", frame.timestamp_us)
            .body(frame.data)
            .send()
            .await;

        let reason = match result {
            Ok(response) if response.status().is_success() => {
                self.failures.reset();
                return;
            }
            Ok(response) => format!("ingest answered {}", response.status()),
            Err(e) => e.to_string(),
        };

        match self.failures.record_failure() {
            StreakAction::Log => {
                warn!(failures = self.failures.count(), %reason, "Frame upload failed")
            }
            StreakAction::Quiet => {}
            StreakAction::GiveUp => {
                error!(failures = self.failures.count(), %reason, "Ingest unreachable");
                self.shared.live.store(false, Ordering::Release);
                self.shared
                    .emit_state(ConnectionState::Failed, format!("frame upload failing: {reason}"));
            }
        }
    }

    async fn patch(&self, patch: SessionPatch<'_>) {
        let Some(session) = &self.session else {
            return;
        };
        let result = self
            .client
            .patch(session.url.clone())
            .bearer_auth(session.token.as_str())
            .json(&patch)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => debug!("WHIP session updated"),
            Ok(response) => {
                let status = response.status();
                warn!(%status, "WHIP PATCH refused");
                self.shared.emit(TransportEvent::Error {
                    code: i32::from(status.as_u16()),
                    message: "session update refused".into(),
                });
            }
            Err(e) => {
                warn!(error = %e, "WHIP PATCH failed");
                self.shared.emit(TransportEvent::Error {
                    code: WORKER_GONE,
                    message: e.to_string(),
                });
            }
        }
    }

    /// End the current session. Queued frames belong to it and are dropped.
    async fn leave(&mut self, frames: &Receiver<OutFrame>) {
        self.shared.live.store(false, Ordering::Release);
        let dropped = frames.drain().count();
        let Some(session) = self.session.take() else {
            return;
        };

        let result = self
            .client
            .delete(session.url.clone())
            .bearer_auth(session.token.as_str())
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                info!(session = %session.url, dropped, "WHIP session terminated")
            }
            // The server expires it on its own
            Ok(response) => {
                warn!(status = %response.status(), "WHIP DELETE refused, session may linger")
            }
            Err(e) => warn!(error = %e, "WHIP DELETE failed, session may linger"),
        }
        self.shared.emit_state(ConnectionState::Disconnected, "session terminated");
    }
}

/// Absolute session URL from a `Location` header, which may be relative to
/// the endpoint
fn resolve_location(endpoint: &Url, location: &str) -> Result<Url, String> {
    endpoint
        .join(location)
        .map_err(|e| format!("bad Location header {location:?}: {e}"))
}

fn frames_url(session: &Url) -> Url {
    let mut url = session.clone();
    let path = format!("{}/frames", session.path().trim_end_matches('/'));
    url.set_path(&path);
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;

    #[derive(Debug)]
    struct Seen {
        method: String,
        path: String,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    }

    /// Minimal ingest server: one request per connection, answers chosen
    /// by `answer(method, path)`
    fn ingest(
        answer: fn(&str, &str) -> (&'static str, Vec<(&'static str, &'static str)>),
    ) -> (String, mpsc::Receiver<Seen>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel();

        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { return };
                let mut reader = BufReader::new(stream.try_clone().unwrap());

                let mut request_line = String::new();
                if reader.read_line(&mut request_line).unwrap_or(0) == 0 {
                    continue;
                }
                let mut parts = request_line.split_whitespace();
                let method = parts.next().unwrap_or_default().to_string();
                let path = parts.next().unwrap_or_default().to_string();

                let mut headers = HashMap::new();
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).unwrap_or(0) == 0 || line == "\r\n" {
                        break;
                    }
                    if let Some((name, value)) = line.split_once(':') {
                        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
                    }
                }
                let length = headers
                    .get("content-length")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                let mut body = vec![0; length];
                reader.read_exact(&mut body).unwrap();

                let (status, extra) = answer(&method, &path);
                let mut response = format!("HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n");
                for (name, value) in extra {
                    response.push_str(&format!("{name}: {value}\r\n"));
                }
                response.push_str("\r\n");
                let _ = stream.write_all(response.as_bytes());

                if tx
                    .send(Seen {
                        method,
                        path,
                        headers,
                        body,
                    })
                    .is_err()
                {
                    return;
                }
            }
        });

        (format!("http://{addr}/ingest/whip"), rx)
    }

    struct Events(flume::Sender<TransportEvent>);

    impl TransportEventHandler for Events {
        fn on_event(&self, event: TransportEvent) {
            let _ = self.0.send(event);
        }
    }

    fn transport(endpoint: String) -> (WhipTransport, flume::Receiver<TransportEvent>) {
        let config = StreamingConfig {
            whip_endpoint: endpoint,
            whip_timeout_ms: 2_000,
            ..StreamingConfig::default()
        };
        let transport = WhipTransport::new(&config).unwrap();
        let (tx, rx) = flume::unbounded();
        transport.set_event_handler(Arc::new(Events(tx)));
        transport.initialize(&TransportConfig::from(&config)).unwrap();
        (transport, rx)
    }

    fn next_state(events: &flume::Receiver<TransportEvent>) -> (ConnectionState, String) {
        loop {
            match events.recv_timeout(Duration::from_secs(5)).unwrap() {
                TransportEvent::ConnectionStateChanged { state, reason }
                    if state != ConnectionState::Connecting =>
                {
                    return (state, reason)
                }
                _ => {}
            }
        }
    }

    fn accepting(method: &str, path: &str) -> (&'static str, Vec<(&'static str, &'static str)>) {
        match method {
            "POST" if path == "/ingest/whip" => {
                ("201 Created", vec![("Location", "/ingest/sessions/s1")])
            }
            "DELETE" => ("200 OK", vec![]),
            _ => ("204 No Content", vec![]),
        }
    }

    #[test]
    fn relative_location_resolves_against_the_endpoint() {
        let endpoint = Url::parse("https://ingest.example/live/whip").unwrap();
        assert_eq!(
            resolve_location(&endpoint, "/live/sessions/42").unwrap().as_str(),
            "https://ingest.example/live/sessions/42"
        );
        assert_eq!(
            resolve_location(&endpoint, "https://edge.example/s/1").unwrap().as_str(),
            "https://edge.example/s/1"
        );
        assert_eq!(
            frames_url(&Url::parse("https://edge.example/s/1/").unwrap()).as_str(),
            "https://edge.example/s/1/frames"
        );
    }

    #[test]
    fn frames_are_refused_before_a_session_exists() {
        let (transport, _events) = transport("http://127.0.0.1:9/whip".into());
        let frame = WireFrame {
            data: vec![0; WireFrame::required_len(2, 2)],
            width: 2,
            height: 2,
            ..WireFrame::default()
        };
        assert!(!transport.push_video_frame(&frame));
    }

    #[test]
    fn join_upload_and_leave_follow_the_session_url() {
        let (endpoint, seen) = ingest(accepting);
        let (transport, events) = transport(endpoint);

        transport.set_video_encoder(QualityPreset::LowLatency).unwrap();
        assert_eq!(transport.join_channel(&Token::new("tok"), "rc-1", 0), 0);

        let joined = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(
            joined,
            TransportEvent::ConnectionStateChanged {
                state: ConnectionState::Connecting,
                ..
            }
        ));
        assert_eq!(
            events.recv_timeout(Duration::from_secs(5)).unwrap(),
            TransportEvent::JoinedChannel {
                channel: "rc-1".into(),
                uid: 0
            }
        );
        assert_eq!(next_state(&events).0, ConnectionState::Connected);

        let offer = seen.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(offer.method, "POST");
        assert_eq!(offer.headers.get("authorization").map(String::as_str), Some("Bearer tok"));
        let body: serde_json::Value = serde_json::from_slice(&offer.body).unwrap();
        assert_eq!(body["channel"], "rc-1");
        assert_eq!(body["video"]["fps"], QualityPreset::LowLatency.fps());

        let frame = WireFrame {
            data: vec![7; WireFrame::required_len(4, 2)],
            width: 4,
            height: 2,
            ..WireFrame::default()
        };
        assert!(transport.push_video_frame(&frame));
        let upload = seen.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!((upload.method.as_str(), upload.path.as_str()), ("POST", "/ingest/sessions/s1/frames"));
        assert_eq!(upload.headers.get("x-frame-width").map(String::as_str), Some("4"));
        assert_eq!(upload.body, frame.data);

        transport.leave_channel();
        let delete = seen.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!((delete.method.as_str(), delete.path.as_str()), ("DELETE", "/ingest/sessions/s1"));
        assert_eq!(next_state(&events).0, ConnectionState::Disconnected);
        assert!(!transport.push_video_frame(&frame));
    }

    #[test]
    fn overloaded_ingest_reports_a_failed_connection() {
        fn overloaded(_: &str, _: &str) -> (&'static str, Vec<(&'static str, &'static str)>) {
            ("503 Service Unavailable", vec![("Retry-After", "30")])
        }
        let (endpoint, _seen) = ingest(overloaded);
        let (transport, events) = transport(endpoint);

        assert_eq!(transport.join_channel(&Token::new("tok"), "rc-2", 0), 0);
        let (state, reason) = next_state(&events);

        assert_eq!(state, ConnectionState::Failed);
        assert!(reason.contains("retry after 30"), "{reason}");
    }

    #[test]
    fn join_needs_initialize() {
        let config = StreamingConfig {
            whip_endpoint: "http://127.0.0.1:9/whip".into(),
            ..StreamingConfig::default()
        };
        let transport = WhipTransport::new(&config).unwrap();
        assert_eq!(transport.join_channel(&Token::new("t"), "c", 0), NOT_INITIALIZED);
    }
}

//! Broadcast session lifecycle
//!
//! `Idle -> Initializing -> Starting -> Active -> Stopping -> Idle`, with
//! `Active -> Active` on a quality change. Starts and restarts are
//! serialized; `stop_stream`, `push_frame` and transport callbacks may come
//! from any thread.

use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flume::Sender;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::quality::QualityPreset;
use super::roster::{Viewer, ViewerRoster, ViewerUpdate};
use super::token::{Role, Token, TokenError, TokenProvider};
use super::transport::{
    ConnectionState, TransportBackend, TransportConfig, TransportError, TransportEvent,
    TransportEventHandler,
};
use crate::capture::WireFrame;
use crate::events::Event;
use crate::pipeline::counters::{log_drop, PublishCounters, PublishStats};
use crate::StreamingConfig;

const PUBLISHER_UID: u32 = 0;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session manager is not initialized")]
    NotInitialized,

    #[error("transport setup failed: {0}")]
    TransportInit(#[source] TransportError),

    #[error("token fetch failed: {0}")]
    TokenFetchFailed(#[from] TokenError),

    #[error("joining channel {channel} failed with code {code}")]
    JoinFailed { channel: String, code: i32 },

    #[error("connection failed while starting: {0}")]
    ConnectionFailed(String),

    #[error("operation needs an {expected:?} session, it is {actual:?}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl SessionError {
    /// Whether retrying the whole operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::TokenFetchFailed(_)
                | SessionError::JoinFailed { .. }
                | SessionError::ConnectionFailed(_)
                | SessionError::Transport(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Initializing,
    Starting,
    Active,
    Stopping,
}

/// One publish lifecycle: token, join, active, leave
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastSession {
    pub channel_id: String,
    pub viewer_url: String,
    pub quality: QualityPreset,
    pub started_at: DateTime<Utc>,
}

struct Slot {
    state: SessionState,
    session: Option<BroadcastSession>,
    /// Connection failure reported before the start finished
    start_failure: Option<String>,
}

struct Inner {
    config: StreamingConfig,
    transport: Arc<dyn TransportBackend>,
    tokens: Arc<dyn TokenProvider>,
    token_timeout: Duration,
    initialized: Mutex<bool>,
    runtime: Mutex<Option<tokio::runtime::Handle>>,
    /// Serializes start, restart and token renewal
    ops: tokio::sync::Mutex<()>,
    slot: RwLock<Slot>,
    roster: Mutex<ViewerRoster>,
    counters: PublishCounters,
    drop_log_interval: u64,
    events: Sender<Event>,
    /// Bumped every time an active session ends, for whatever reason
    ended: watch::Sender<u64>,
}

/// Cheap to clone; all clones drive the same session
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        config: StreamingConfig,
        transport: Arc<dyn TransportBackend>,
        tokens: Arc<dyn TokenProvider>,
        token_timeout: Duration,
        drop_log_interval: u64,
        events: Sender<Event>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                tokens,
                token_timeout,
                initialized: Mutex::new(false),
                runtime: Mutex::new(None),
                ops: tokio::sync::Mutex::new(()),
                slot: RwLock::new(Slot {
                    state: SessionState::Idle,
                    session: None,
                    start_failure: None,
                }),
                roster: Mutex::new(ViewerRoster::default()),
                counters: PublishCounters::default(),
                drop_log_interval,
                events,
                ended: watch::channel(0).0,
            }),
        }
    }

    /// Set up the transport for low-latency external-frame publishing.
    /// Safe to call repeatedly.
    pub fn initialize(&self) -> Result<(), SessionError> {
        let mut initialized = self.inner.initialized.lock();
        if *initialized {
            return Ok(());
        }

        let config = TransportConfig::from(&self.inner.config);
        if config.app_id.is_empty() {
            return Err(SessionError::TransportInit(TransportError::MissingCredentials));
        }
        self.inner
            .transport
            .initialize(&config)
            .map_err(SessionError::TransportInit)?;
        self.inner.transport.set_event_handler(Arc::new(CallbackBridge {
            inner: Arc::downgrade(&self.inner),
        }));
        *self.inner.runtime.lock() = tokio::runtime::Handle::try_current().ok();

        *initialized = true;
        info!(transport = self.inner.transport.name(), "Session manager initialized");
        Ok(())
    }

    /// Start a broadcast, stopping any running one first.
    ///
    /// On failure nothing is published and the manager is back to `Idle`.
    #[instrument(skip(self))]
    pub async fn start_stream(
        &self,
        quality: QualityPreset,
    ) -> Result<BroadcastSession, SessionError> {
        let _op = self.inner.ops.lock().await;
        if !*self.inner.initialized.lock() {
            return Err(SessionError::NotInitialized);
        }

        if self.state() == SessionState::Active {
            info!("Restarting stream");
            self.inner.stop("restart");
        }

        {
            let mut slot = self.inner.slot.write();
            slot.state = SessionState::Initializing;
            slot.start_failure = None;
            self.inner.roster.lock().clear();
        }
        let channel = self.inner.new_channel_id();
        info!(%channel, "Starting stream");

        let token = match self.inner.fetch_token(&channel).await {
            Ok(token) => token,
            Err(e) => {
                warn!(%channel, error = %e, "Token fetch failed");
                self.inner.abort_start();
                return Err(SessionError::TokenFetchFailed(e));
            }
        };

        self.inner.set_state(SessionState::Starting);
        if let Err(e) = self.inner.transport.set_video_encoder(quality) {
            self.inner.abort_start();
            return Err(SessionError::Transport(e));
        }

        let code = self
            .inner
            .transport
            .join_channel(&token, &channel, PUBLISHER_UID);
        if code != 0 {
            warn!(%channel, code, "Join failed");
            self.inner.abort_start();
            return Err(SessionError::JoinFailed { channel, code });
        }

        let session = BroadcastSession {
            viewer_url: format!("{}{}", self.inner.config.viewer_url_base, channel),
            channel_id: channel,
            quality,
            started_at: Utc::now(),
        };
        let failure = {
            let mut slot = self.inner.slot.write();
            let failure = slot.start_failure.take();
            if failure.is_none() {
                slot.state = SessionState::Active;
                slot.session = Some(session.clone());
            }
            failure
        };
        if let Some(reason) = failure {
            warn!(channel = %session.channel_id, %reason, "Connection failed during join");
            self.inner.transport.leave_channel();
            self.inner.abort_start();
            return Err(SessionError::ConnectionFailed(reason));
        }

        info!(channel = %session.channel_id, url = %session.viewer_url, "Stream active");
        self.inner.emit(Event::StreamStarted {
            channel_id: session.channel_id.clone(),
            viewer_url: session.viewer_url.clone(),
            quality,
        });

        // Viewers that arrived while joining
        let count = self.inner.roster.lock().count();
        if count > 0 {
            self.inner.emit(Event::ViewerUpdate {
                count,
                viewer: None,
            });
        }
        Ok(session)
    }

    /// Leave the channel and clear the roster. Does nothing unless a session
    /// is active; an in-flight start is not cancelled.
    pub fn stop_stream(&self) {
        if !self.inner.stop("requested") {
            debug!(state = ?self.state(), "Stop ignored, no active session");
        }
    }

    /// Reconfigure the encoder of the active session. Re-applies even when
    /// `quality` is already the current preset.
    ///
    /// The encoder call runs outside the state lock; transports may call
    /// back synchronously from inside it.
    #[instrument(skip(self))]
    pub async fn set_quality(
        &self,
        quality: QualityPreset,
    ) -> Result<BroadcastSession, SessionError> {
        let _op = self.inner.ops.lock().await;
        self.inner.require_active()?;

        self.inner.transport.set_video_encoder(quality)?;

        let session = {
            let mut slot = self.inner.slot.write();
            let actual = slot.state;
            let Some(session) = slot.session.as_mut().filter(|_| actual == SessionState::Active)
            else {
                // Stopped while the encoder was being reconfigured
                return Err(SessionError::InvalidState {
                    expected: SessionState::Active,
                    actual,
                });
            };
            session.quality = quality;
            session.clone()
        };

        info!("Quality changed");
        self.inner.emit(Event::QualityChanged { quality });
        Ok(session)
    }

    /// Hand a converted frame to the transport. Only accepted while active;
    /// anything else is counted and dropped.
    pub fn push_frame(&self, frame: &WireFrame) -> bool {
        let slot = self.inner.slot.read();
        if slot.state != SessionState::Active {
            drop(slot);
            let total = self.inner.counters.record_dropped_inactive();
            log_drop("Pre-join", total, self.inner.drop_log_interval);
            return false;
        }

        let accepted = self.inner.transport.push_video_frame(frame);
        drop(slot);

        if accepted {
            self.inner.counters.record_accepted();
        } else {
            let total = self.inner.counters.record_rejected();
            log_drop("Transport-rejected", total, self.inner.drop_log_interval);
        }
        accepted
    }

    /// Fetch a fresh publisher token for the active channel and hand it to
    /// the transport
    pub async fn renew_token(&self) -> Result<(), SessionError> {
        Inner::renew_token(Arc::clone(&self.inner)).await
    }

    pub fn state(&self) -> SessionState {
        self.inner.slot.read().state
    }

    /// Preset used when a start request does not name one
    pub fn default_quality(&self) -> QualityPreset {
        self.inner.config.default_quality
    }

    /// Changes every time an active session ends, including automatic stops
    /// after a connection failure
    pub fn ended(&self) -> watch::Receiver<u64> {
        self.inner.ended.subscribe()
    }

    pub fn session(&self) -> Option<BroadcastSession> {
        self.inner.slot.read().session.clone()
    }

    pub fn viewers(&self) -> Vec<Viewer> {
        self.inner.roster.lock().viewers()
    }

    pub fn viewer_count(&self) -> usize {
        self.inner.roster.lock().count()
    }

    pub fn frame_stats(&self) -> PublishStats {
        self.inner.counters.snapshot()
    }
}

impl Inner {
    fn set_state(&self, state: SessionState) {
        self.slot.write().state = state;
    }

    fn require_active(&self) -> Result<(), SessionError> {
        match self.slot.read().state {
            SessionState::Active => Ok(()),
            actual => Err(SessionError::InvalidState {
                expected: SessionState::Active,
                actual,
            }),
        }
    }

    /// Back to `Idle` after a failed start, dropping anything gathered
    /// while joining
    fn abort_start(&self) {
        let mut slot = self.slot.write();
        slot.state = SessionState::Idle;
        slot.session = None;
        slot.start_failure = None;
        self.roster.lock().clear();
    }

    fn emit(&self, event: Event) {
        if self.events.send(event).is_err() {
            debug!("Event receiver gone");
        }
    }

    fn new_channel_id(&self) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("{}{}", self.config.channel_prefix, &id[..12])
    }

    /// Runs on a runtime worker so the caller's task only waits on the
    /// result, bounded by the total token budget.
    async fn fetch_token(&self, channel: &str) -> Result<Token, TokenError> {
        let tokens = Arc::clone(&self.tokens);
        let channel = channel.to_string();
        let task = tokio::spawn(async move { tokens.fetch_token(&channel, Role::Publisher).await });

        match tokio::time::timeout(self.token_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(TokenError::Aborted(join.to_string())),
            Err(_) => Err(TokenError::Timeout(self.token_timeout)),
        }
    }

    /// Tear down the active session. Returns whether there was one.
    fn stop(&self, reason: &str) -> bool {
        let session = {
            let mut slot = self.slot.write();
            if slot.state != SessionState::Active {
                return false;
            }
            slot.state = SessionState::Stopping;
            slot.session.take()
        };

        self.transport.leave_channel();
        self.roster.lock().clear();
        self.set_state(SessionState::Idle);

        let channel_id = session.map(|s| s.channel_id).unwrap_or_default();
        info!(%channel_id, reason, "Stream stopped");
        self.emit(Event::StreamStopped { channel_id });
        self.ended.send_modify(|n| *n += 1);
        true
    }

    async fn renew_token(inner: Arc<Inner>) -> Result<(), SessionError> {
        let _op = inner.ops.lock().await;
        let channel = {
            let slot = inner.slot.read();
            match (&slot.session, slot.state) {
                (Some(session), SessionState::Active) => session.channel_id.clone(),
                (_, actual) => {
                    return Err(SessionError::InvalidState {
                        expected: SessionState::Active,
                        actual,
                    })
                }
            }
        };

        let token = inner.fetch_token(&channel).await?;
        inner.transport.renew_token(&token)?;
        info!(%channel, "Token renewed");
        Ok(())
    }

    /// Apply a roster change under the session read lock so a concurrent
    /// stop cannot interleave between the state check and the mutation.
    ///
    /// Changes during `Starting` are kept but not announced; the start
    /// reports the count once the stream is live.
    fn with_roster(
        &self,
        change: impl FnOnce(&mut ViewerRoster) -> Option<ViewerUpdate>,
    ) -> Option<ViewerUpdate> {
        let slot = self.slot.read();
        let update = match slot.state {
            SessionState::Active => change(&mut self.roster.lock()),
            SessionState::Starting => {
                change(&mut self.roster.lock());
                None
            }
            _ => None,
        };
        drop(slot);
        update
    }

    /// Remember a failure reported mid-start. Returns `false` when no start
    /// is in flight.
    fn fail_start(&self, reason: &str) -> bool {
        let mut slot = self.slot.write();
        match slot.state {
            SessionState::Initializing | SessionState::Starting => {
                slot.start_failure = Some(reason.to_string());
                true
            }
            _ => false,
        }
    }

    fn on_transport_event(self: Arc<Self>, event: TransportEvent) {
        let update = match event {
            TransportEvent::JoinedChannel { channel, uid } => {
                debug!(%channel, uid, "Joined channel");
                None
            }
            TransportEvent::UserJoined { uid } => self.with_roster(|r| Some(r.join(uid))),
            TransportEvent::UserOffline { uid } => self.with_roster(|r| r.leave(uid)),
            TransportEvent::RemoteAudio { uid, speaking } => {
                self.with_roster(|r| r.set_speaking(uid, speaking))
            }
            TransportEvent::RemoteVideo { uid, streaming } => {
                self.with_roster(|r| r.set_streaming_video(uid, streaming))
            }
            TransportEvent::ConnectionStateChanged { state, reason } => {
                if state == ConnectionState::Failed {
                    error!(%reason, "Connection failed");
                    if !self.fail_start(&reason) {
                        self.emit(Event::StreamError {
                            message: format!("connection failed: {reason}"),
                        });
                        self.stop("connection failed");
                    }
                } else {
                    debug!(?state, %reason, "Connection state changed");
                }
                None
            }
            TransportEvent::TokenWillExpire => {
                Arc::clone(&self).spawn_renewal();
                None
            }
            TransportEvent::Error { code, message } => {
                warn!(code, %message, "Transport error");
                self.emit(Event::StreamError {
                    message: format!("transport error {code}: {message}"),
                });
                None
            }
        };

        if let Some(ViewerUpdate { count, viewer }) = update {
            debug!(count, "Viewer roster changed");
            self.emit(Event::ViewerUpdate { count, viewer });
        }
    }

    fn spawn_renewal(self: Arc<Self>) {
        let Some(runtime) = self.runtime.lock().clone() else {
            warn!("Token expiring but no runtime to renew it on");
            return;
        };
        runtime.spawn(async move {
            if let Err(e) = Inner::renew_token(Arc::clone(&self)).await {
                warn!(error = %e, "Token renewal failed");
                self.emit(Event::StreamError {
                    message: format!("token renewal failed: {e}"),
                });
            }
        });
    }
}

/// Transport callbacks hold only a weak reference so the transport never
/// keeps the manager alive
struct CallbackBridge {
    inner: Weak<Inner>,
}

impl TransportEventHandler for CallbackBridge {
    fn on_event(&self, event: TransportEvent) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_transport_event(event);
        }
    }
}

//! Real-time transport seam
//!
//! The vendor SDK is reached only through [`TransportBackend`]; its
//! asynchronous callbacks come back as [`TransportEvent`]s on whatever thread
//! the SDK uses.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use super::quality::QualityPreset;
use super::token::Token;
use crate::capture::WireFrame;
use crate::StreamingConfig;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("missing app credentials")]
    MissingCredentials,

    #[error("transport is not initialized")]
    NotInitialized,

    #[error("encoder configuration rejected: {0}")]
    Encoder(String),

    #[error("transport call failed with code {0}")]
    Code(i32),

    #[error("transport setup failed: {0}")]
    Setup(String),
}

/// Engine tuning applied once at initialization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub app_id: String,
    /// Frames are pushed by us rather than captured by the SDK
    pub external_video_source: bool,
    pub playout_delay_ms: u32,
    pub prefer_hardware_encoder: bool,
    /// Route audio to a paired headset instead of the loudspeaker
    pub speakerphone: bool,
    pub enable_audio: bool,
}

impl From<&StreamingConfig> for TransportConfig {
    fn from(config: &StreamingConfig) -> Self {
        Self {
            app_id: config.app_id.clone(),
            external_video_source: true,
            playout_delay_ms: config.playout_delay_ms,
            prefer_hardware_encoder: config.prefer_hardware_encoder,
            speakerphone: false,
            enable_audio: config.enable_audio,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    JoinedChannel { channel: String, uid: u32 },
    UserJoined { uid: u32 },
    UserOffline { uid: u32 },
    RemoteAudio { uid: u32, speaking: bool },
    RemoteVideo { uid: u32, streaming: bool },
    ConnectionStateChanged { state: ConnectionState, reason: String },
    TokenWillExpire,
    Error { code: i32, message: String },
}

pub trait TransportEventHandler: Send + Sync {
    fn on_event(&self, event: TransportEvent);
}

pub trait TransportBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn initialize(&self, config: &TransportConfig) -> Result<(), TransportError>;

    fn set_event_handler(&self, handler: Arc<dyn TransportEventHandler>);

    fn set_video_encoder(&self, quality: QualityPreset) -> Result<(), TransportError>;

    /// Vendor-style status code: zero on success
    fn join_channel(&self, token: &Token, channel: &str, uid: u32) -> i32;

    /// Fire-and-forget
    fn leave_channel(&self);

    /// Whether the transport took the frame
    fn push_video_frame(&self, frame: &WireFrame) -> bool;

    fn renew_token(&self, token: &Token) -> Result<(), TransportError>;
}

#[derive(Debug, Default)]
struct SimState {
    config: Option<TransportConfig>,
    encoder: Option<QualityPreset>,
    encoder_applies: u32,
    channel: Option<String>,
    token: Option<Token>,
    join_code: i32,
    rejecting: bool,
    frames: u64,
    last_frame: Option<(u32, u32, usize)>,
    after_join: Vec<TransportEvent>,
    after_encoder: Vec<TransportEvent>,
}

/// In-process relay standing in for the vendor SDK
#[derive(Default)]
pub struct SimulatedTransport {
    state: Mutex<SimState>,
    handler: RwLock<Option<Arc<dyn TransportEventHandler>>>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Code the next joins return
    pub fn set_join_result(&self, code: i32) {
        self.state.lock().join_code = code;
    }

    pub fn set_rejecting(&self, rejecting: bool) {
        self.state.lock().rejecting = rejecting;
    }

    /// Deliver `event` synchronously from inside the next successful join,
    /// the way SDKs that call back on the caller's thread do
    pub fn emit_after_join(&self, event: TransportEvent) {
        self.state.lock().after_join.push(event);
    }

    /// Deliver `event` synchronously from inside the next encoder change
    pub fn emit_after_encoder(&self, event: TransportEvent) {
        self.state.lock().after_encoder.push(event);
    }

    /// Deliver `event` to the registered handler on the calling thread
    pub fn emit(&self, event: TransportEvent) {
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler.on_event(event);
        }
    }

    pub fn channel(&self) -> Option<String> {
        self.state.lock().channel.clone()
    }

    pub fn encoder(&self) -> Option<QualityPreset> {
        self.state.lock().encoder
    }

    pub fn encoder_applies(&self) -> u32 {
        self.state.lock().encoder_applies
    }

    pub fn frames_received(&self) -> u64 {
        self.state.lock().frames
    }

    pub fn current_token(&self) -> Option<Token> {
        self.state.lock().token.clone()
    }

    /// `(width, height, bytes)` of the last accepted frame
    pub fn last_frame(&self) -> Option<(u32, u32, usize)> {
        self.state.lock().last_frame
    }

    pub fn config(&self) -> Option<TransportConfig> {
        self.state.lock().config.clone()
    }
}

impl TransportBackend for SimulatedTransport {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn initialize(&self, config: &TransportConfig) -> Result<(), TransportError> {
        if config.app_id.is_empty() {
            return Err(TransportError::MissingCredentials);
        }
        info!(
            external_source = config.external_video_source,
            playout_delay_ms = config.playout_delay_ms,
            hw_encoder = config.prefer_hardware_encoder,
            "Simulated transport initialized"
        );
        self.state.lock().config = Some(config.clone());
        Ok(())
    }

    fn set_event_handler(&self, handler: Arc<dyn TransportEventHandler>) {
        *self.handler.write() = Some(handler);
    }

    fn set_video_encoder(&self, quality: QualityPreset) -> Result<(), TransportError> {
        let queued = {
            let mut state = self.state.lock();
            if state.config.is_none() {
                return Err(TransportError::NotInitialized);
            }
            state.encoder = Some(quality);
            state.encoder_applies += 1;
            std::mem::take(&mut state.after_encoder)
        };
        debug!(%quality, "Encoder configured");
        for event in queued {
            self.emit(event);
        }
        Ok(())
    }

    fn join_channel(&self, token: &Token, channel: &str, uid: u32) -> i32 {
        let queued = {
            let mut state = self.state.lock();
            if state.config.is_none() {
                return -7;
            }
            if state.join_code != 0 {
                return state.join_code;
            }
            state.channel = Some(channel.to_string());
            state.token = Some(token.clone());
            std::mem::take(&mut state.after_join)
        };
        self.emit(TransportEvent::JoinedChannel {
            channel: channel.to_string(),
            uid,
        });
        for event in queued {
            self.emit(event);
        }
        0
    }

    fn leave_channel(&self) {
        let mut state = self.state.lock();
        if let Some(channel) = state.channel.take() {
            debug!(%channel, "Left channel");
        }
        state.token = None;
    }

    fn push_video_frame(&self, frame: &WireFrame) -> bool {
        let mut state = self.state.lock();
        if state.channel.is_none() || state.encoder.is_none() || state.rejecting {
            return false;
        }
        state.frames += 1;
        state.last_frame = Some((frame.width, frame.height, frame.data.len()));
        true
    }

    fn renew_token(&self, token: &Token) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.channel.is_none() {
            return Err(TransportError::Code(-2));
        }
        state.token = Some(token.clone());
        Ok(())
    }
}

/// Resolve the transport once at startup.
///
/// The WHIP publisher wins when it is compiled in and an ingest endpoint is
/// configured; the in-process relay covers everything else.
pub fn probe_transport(config: &StreamingConfig) -> Arc<dyn TransportBackend> {
    #[cfg(feature = "whip")]
    if !config.whip_endpoint.is_empty() {
        match super::whip::WhipTransport::new(config) {
            Ok(transport) => {
                info!(endpoint = %config.whip_endpoint, "Using WHIP transport");
                return Arc::new(transport);
            }
            Err(e) => tracing::warn!(error = %e, "WHIP transport unavailable"),
        }
    }

    info!(whip_endpoint = !config.whip_endpoint.is_empty(), "Using simulated transport");
    Arc::new(SimulatedTransport::new())
}

//! Live broadcast of analysis frames to remote viewers
//!
//! ```text
//!  broker sink ──► SessionManager::push_frame ──► TransportBackend
//!                        ▲                              │
//!       TokenProvider ───┘            TransportEvent ◄──┘ (SDK thread)
//!                                          │
//!                                 ViewerRoster ──► Event::ViewerUpdate
//! ```

pub mod quality;
pub mod roster;
pub mod session;
pub mod token;
pub mod transport;
#[cfg(feature = "whip")]
pub mod whip;

pub use quality::QualityPreset;
pub use roster::{Viewer, ViewerRoster, ViewerUpdate};
pub use session::{BroadcastSession, SessionError, SessionManager, SessionState};
pub use token::{HttpTokenClient, Role, Token, TokenError, TokenProvider};
pub use transport::{
    probe_transport, ConnectionState, SimulatedTransport, TransportBackend, TransportConfig,
    TransportError, TransportEvent, TransportEventHandler,
};
#[cfg(feature = "whip")]
pub use whip::WhipTransport;

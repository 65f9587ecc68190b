//! The two halves of the application: the host owns hardware and network,
//! the display only renders. They talk exclusively through
//! [`Command`](crate::events::Command) and [`Event`](crate::events::Event)
//! channels.

pub mod display;
pub mod host;

pub use display::{DisplayActor, DisplayState, StreamStatus};
pub use host::HostActor;

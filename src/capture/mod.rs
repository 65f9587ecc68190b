pub mod convert;
pub mod frame;
pub mod still;

pub use convert::{convert, FrameError};
pub use frame::{CapturedFrame, Plane, Rotation, WireFrame};
pub use still::{StillError, StillImage};

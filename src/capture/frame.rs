use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Clockwise rotation the consumer must apply to display a frame upright
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn from_degrees(degrees: u32) -> Self {
        match degrees % 360 {
            90 => Rotation::Deg90,
            180 => Rotation::Deg180,
            270 => Rotation::Deg270,
            _ => Rotation::Deg0,
        }
    }

    pub fn degrees(self) -> u32 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }
}

/// One plane of a multi-plane YUV 4:2:0 image.
///
/// `data` may be a window into a larger hardware buffer; two chroma planes can
/// share the same allocation when the hardware hands out semi-planar memory.
#[derive(Clone)]
pub struct Plane {
    pub data: Bytes,
    pub row_stride: usize,
    pub pixel_stride: usize,
}

impl Plane {
    pub fn new(data: Bytes, row_stride: usize, pixel_stride: usize) -> Self {
        Self {
            data,
            row_stride,
            pixel_stride,
        }
    }
}

impl fmt::Debug for Plane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plane")
            .field("len", &self.data.len())
            .field("row_stride", &self.row_stride)
            .field("pixel_stride", &self.pixel_stride)
            .finish()
    }
}

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// Raw frame handed out by a camera backend.
///
/// Consumed exactly once by the converter. The backend's buffer goes back to
/// its pool on [`CapturedFrame::release`]; dropping the frame releases it too
/// so a forgotten frame can never starve the pool.
pub struct CapturedFrame {
    /// Luma, then the two chroma planes in U, V order
    pub planes: [Plane; 3],
    pub width: u32,
    pub height: u32,
    pub rotation: Rotation,
    /// Monotonic capture time
    pub timestamp: Duration,
    release: Option<ReleaseHook>,
}

impl CapturedFrame {
    pub fn new(
        y: Plane,
        u: Plane,
        v: Plane,
        width: u32,
        height: u32,
        rotation: Rotation,
        timestamp: Duration,
    ) -> Self {
        Self {
            planes: [y, u, v],
            width,
            height,
            rotation,
            timestamp,
            release: None,
        }
    }

    /// Attach the callback that returns the underlying buffer to its pool
    pub fn with_release(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.release = Some(Box::new(hook));
        self
    }

    pub fn y(&self) -> &Plane {
        &self.planes[0]
    }

    pub fn u(&self) -> &Plane {
        &self.planes[1]
    }

    pub fn v(&self) -> &Plane {
        &self.planes[2]
    }

    /// Return the buffer to the hardware pool
    pub fn release(mut self) {
        if let Some(hook) = self.release.take() {
            hook();
        }
    }
}

impl Drop for CapturedFrame {
    fn drop(&mut self) {
        if let Some(hook) = self.release.take() {
            hook();
        }
    }
}

impl fmt::Debug for CapturedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("rotation", &self.rotation)
            .field("timestamp", &self.timestamp)
            .field("planes", &self.planes)
            .finish()
    }
}

/// Frame in the layout the streaming transport expects: the full luma plane
/// followed by interleaved chroma in V, U order (NV21).
///
/// The buffer is reused across frames. It only reallocates when the
/// resolution changes.
#[derive(Debug, Clone, Default)]
pub struct WireFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub rotation: Rotation,
    pub timestamp: Duration,
}

impl WireFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of luma for the given resolution
    pub fn luma_len(width: u32, height: u32) -> usize {
        width as usize * height as usize
    }

    /// Bytes of interleaved chroma for the given resolution
    pub fn chroma_len(width: u32, height: u32) -> usize {
        let cw = (width as usize).div_ceil(2);
        let ch = (height as usize).div_ceil(2);
        cw * ch * 2
    }

    pub fn required_len(width: u32, height: u32) -> usize {
        Self::luma_len(width, height) + Self::chroma_len(width, height)
    }

    pub fn luma(&self) -> &[u8] {
        let len = Self::luma_len(self.width, self.height).min(self.data.len());
        &self.data[..len]
    }

    pub fn chroma(&self) -> &[u8] {
        let start = Self::luma_len(self.width, self.height).min(self.data.len());
        &self.data[start..]
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

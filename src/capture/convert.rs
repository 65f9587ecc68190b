//! Multi-plane YUV 4:2:0 to NV21 conversion
//!
//! The transport wants one contiguous buffer: the luma plane, then chroma
//! interleaved as V, U. Cameras hand out three planes with arbitrary row and
//! pixel strides, sometimes backed by one semi-planar allocation.

use thiserror::Error;

use super::frame::{CapturedFrame, Plane, WireFrame};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid frame dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("{plane} plane has a zero pixel stride")]
    ZeroPixelStride { plane: &'static str },

    #[error("{plane} plane too short: need {needed} bytes, have {actual}")]
    PlaneTooShort {
        plane: &'static str,
        needed: usize,
        actual: usize,
    },
}

/// Convert `frame` into `out`, reusing `out`'s buffer.
///
/// Never allocates while the resolution stays the same; a resolution change
/// reallocates exactly once.
pub fn convert(frame: &CapturedFrame, out: &mut WireFrame) -> Result<(), FrameError> {
    let (width, height) = (frame.width, frame.height);
    if width == 0 || height == 0 {
        return Err(FrameError::InvalidDimensions { width, height });
    }

    let w = width as usize;
    let h = height as usize;
    let cw = w.div_ceil(2);
    let ch = h.div_ceil(2);

    check_plane("luma", frame.y(), w, h)?;
    check_plane("u", frame.u(), cw, ch)?;
    check_plane("v", frame.v(), cw, ch)?;

    let required = WireFrame::required_len(width, height);
    if out.data.len() != required {
        out.data = vec![0; required];
    }

    let (luma, chroma) = out.data.split_at_mut(w * h);
    copy_luma(frame.y(), w, h, luma);
    copy_chroma(frame.u(), frame.v(), cw, ch, chroma);

    out.width = width;
    out.height = height;
    out.rotation = frame.rotation;
    out.timestamp = frame.timestamp;
    Ok(())
}

fn check_plane(
    name: &'static str,
    plane: &Plane,
    cols: usize,
    rows: usize,
) -> Result<(), FrameError> {
    if plane.pixel_stride == 0 {
        return Err(FrameError::ZeroPixelStride { plane: name });
    }
    let needed = (rows - 1) * plane.row_stride + (cols - 1) * plane.pixel_stride + 1;
    if plane.data.len() < needed {
        return Err(FrameError::PlaneTooShort {
            plane: name,
            needed,
            actual: plane.data.len(),
        });
    }
    Ok(())
}

fn copy_luma(y: &Plane, w: usize, h: usize, dst: &mut [u8]) {
    let src = &y.data[..];

    if y.pixel_stride == 1 && y.row_stride == w {
        dst.copy_from_slice(&src[..w * h]);
        return;
    }

    if y.pixel_stride == 1 {
        for (row, out) in dst.chunks_exact_mut(w).enumerate() {
            let start = row * y.row_stride;
            out.copy_from_slice(&src[start..start + w]);
        }
        return;
    }

    for (row, out) in dst.chunks_exact_mut(w).enumerate() {
        let base = row * y.row_stride;
        for (col, px) in out.iter_mut().enumerate() {
            *px = src[base + col * y.pixel_stride];
        }
    }
}

/// True when the V plane's backing memory is already V, U interleaved with no
/// row padding, i.e. the hardware produced NV21 and only the plane views
/// differ.
fn is_packed_nv21(u: &Plane, v: &Plane, cw: usize) -> bool {
    u.pixel_stride == 2
        && v.pixel_stride == 2
        && u.row_stride == cw * 2
        && v.row_stride == cw * 2
        && u.data.as_ptr() == v.data.as_ptr().wrapping_add(1)
}

fn copy_chroma(u: &Plane, v: &Plane, cw: usize, ch: usize, dst: &mut [u8]) {
    let len = cw * ch * 2;

    if is_packed_nv21(u, v, cw) {
        // The V view usually stops one byte short of the last U sample.
        let bulk = len.min(v.data.len());
        dst[..bulk].copy_from_slice(&v.data[..bulk]);
        if bulk < len {
            dst[len - 1] = u.data[(cw * ch - 1) * 2];
        }
        return;
    }

    let (us, vs) = (&u.data[..], &v.data[..]);
    for row in 0..ch {
        let u_row = row * u.row_stride;
        let v_row = row * v.row_stride;
        let out = &mut dst[row * cw * 2..(row + 1) * cw * 2];
        for col in 0..cw {
            out[col * 2] = vs[v_row + col * v.pixel_stride];
            out[col * 2 + 1] = us[u_row + col * u.pixel_stride];
        }
    }
}

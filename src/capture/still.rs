//! Still image produced by the capture consumer

use std::io::Cursor;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::frame::{Rotation, WireFrame};

#[derive(Debug, Error)]
pub enum StillError {
    #[error("still image buffer does not match {width}x{height}")]
    BadBuffer { width: u32, height: u32 },

    #[error("JPEG encode failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// One captured still in NV21 layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StillImage {
    pub width: u32,
    pub height: u32,
    pub rotation: Rotation,
    pub nv21: Bytes,
    pub captured_at: DateTime<Utc>,
}

impl StillImage {
    pub fn from_wire(frame: &WireFrame) -> Self {
        Self {
            width: frame.width,
            height: frame.height,
            rotation: frame.rotation,
            nv21: Bytes::copy_from_slice(&frame.data),
            captured_at: Utc::now(),
        }
    }

    /// Decode to packed RGB using BT.601 coefficients
    pub fn to_rgb8(&self) -> Result<Vec<u8>, StillError> {
        let (w, h) = (self.width as usize, self.height as usize);
        if self.nv21.len() != WireFrame::required_len(self.width, self.height) {
            return Err(StillError::BadBuffer {
                width: self.width,
                height: self.height,
            });
        }

        let (luma, chroma) = self.nv21.split_at(w * h);
        let cw = w.div_ceil(2);
        let mut rgb = Vec::with_capacity(w * h * 3);

        for row in 0..h {
            for col in 0..w {
                let y = luma[row * w + col] as f32;
                let c = ((row / 2) * cw + col / 2) * 2;
                let v = chroma[c] as f32 - 128.0;
                let u = chroma[c + 1] as f32 - 128.0;

                rgb.push((y + 1.402 * v).clamp(0.0, 255.0) as u8);
                rgb.push((y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8);
                rgb.push((y + 1.772 * u).clamp(0.0, 255.0) as u8);
            }
        }

        Ok(rgb)
    }

    pub fn encode_jpeg(&self) -> Result<Vec<u8>, StillError> {
        let rgb = self.to_rgb8()?;
        let image = RgbImage::from_raw(self.width, self.height, rgb).ok_or(
            StillError::BadBuffer {
                width: self.width,
                height: self.height,
            },
        )?;

        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, ImageFormat::Jpeg)?;
        Ok(out.into_inner())
    }
}

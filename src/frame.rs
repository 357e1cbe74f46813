// Decoded frame conversion

use gstreamer as gst;
use image::{GrayImage, RgbImage};

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Sample has no {0}")]
    Missing(&'static str),

    #[error("Unsupported caps: {0}")]
    Caps(String),

    #[error("Buffer map failed: {0}")]
    Map(String),

    #[error("Buffer too short: row {row} ends at {end}, buffer is {len} bytes")]
    Truncated { row: usize, end: usize, len: usize },
}

/// One decoded RGB frame with its luma plane.
#[derive(Debug, Clone)]
pub struct Frame {
    pub rgb: RgbImage,
    pub gray: GrayImage,
}

impl Frame {
    pub fn from_rgb(rgb: RgbImage) -> Self {
        let gray = image::imageops::grayscale(&rgb);
        Self { rgb, gray }
    }

    pub fn width(&self) -> u32 {
        self.rgb.width()
    }

    pub fn height(&self) -> u32 {
        self.rgb.height()
    }
}

/// Copy a packed RGB sample into an owned frame, honouring row stride.
pub fn frame_from_sample(sample: &gst::Sample) -> Result<Frame, FrameError> {
    let buffer = sample.buffer().ok_or(FrameError::Missing("buffer"))?;
    let caps = sample.caps().ok_or(FrameError::Missing("caps"))?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).map_err(|e| FrameError::Caps(e.to_string()))?;
    if info.format() != gstreamer_video::VideoFormat::Rgb {
        return Err(FrameError::Caps(format!("expected RGB, got {:?}", info.format())));
    }

    let stride = info.stride().first().copied().unwrap_or(0).max(0) as usize;
    let map = buffer.map_readable().map_err(|e| FrameError::Map(e.to_string()))?;
    let rgb = packed_rgb(map.as_slice(), info.width(), info.height(), stride)?;
    Ok(Frame::from_rgb(rgb))
}

/// Strip row padding from a packed RGB buffer.
pub fn packed_rgb(data: &[u8], width: u32, height: u32, stride: usize) -> Result<RgbImage, FrameError> {
    let row_bytes = width as usize * 3;
    let stride = stride.max(row_bytes);

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        let line = data.get(start..end).ok_or(FrameError::Truncated {
            row,
            end,
            len: data.len(),
        })?;
        pixels.extend_from_slice(line);
    }

    RgbImage::from_raw(width, height, pixels).ok_or(FrameError::Truncated {
        row: height as usize,
        end: row_bytes * height as usize,
        len: data.len(),
    })
}

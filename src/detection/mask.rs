// Binary motion mask from two grayscale frames

use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::filter::{gaussian_blur_f32, median_filter};
use imageproc::morphology::close;

use super::{DetectError, Result};

/// Median blur radius (3x3 aperture)
const MEDIAN_RADIUS: u32 = 1;

/// Gaussian weighting for the local threshold; matches an 11x11 block
const ADAPTIVE_SIGMA: f32 = 2.0;

/// A pixel is foreground when it sits this far below its local mean
const ADAPTIVE_OFFSET: i16 = 3;

pub const FOREGROUND: u8 = 255;

/// Absolute per-pixel difference of two equally sized frames.
pub fn absolute_difference(prev: &GrayImage, curr: &GrayImage) -> Result<GrayImage> {
    check_geometry(prev, curr)?;
    Ok(GrayImage::from_fn(curr.width(), curr.height(), |x, y| {
        Luma([prev.get_pixel(x, y)[0].abs_diff(curr.get_pixel(x, y)[0])])
    }))
}

/// Inverted adaptive threshold against a Gaussian-weighted local mean.
///
/// Foreground where `value + C <= local_mean`, so flat regions (including an
/// all-zero difference) come out empty.
pub fn adaptive_threshold_inv(src: &GrayImage) -> GrayImage {
    let mean = gaussian_blur_f32(src, ADAPTIVE_SIGMA);
    GrayImage::from_fn(src.width(), src.height(), |x, y| {
        let value = src.get_pixel(x, y)[0] as i16;
        let local = mean.get_pixel(x, y)[0] as i16;
        if value + ADAPTIVE_OFFSET <= local {
            Luma([FOREGROUND])
        } else {
            Luma([0])
        }
    })
}

/// Motion mask: diff, median, adaptive threshold, median, closing.
pub fn motion_mask(prev: &GrayImage, curr: &GrayImage, kernel_radius: u8) -> Result<GrayImage> {
    let diff = absolute_difference(prev, curr)?;
    let diff = median_filter(&diff, MEDIAN_RADIUS, MEDIAN_RADIUS);
    let mask = adaptive_threshold_inv(&diff);
    let mask = median_filter(&mask, MEDIAN_RADIUS, MEDIAN_RADIUS);
    Ok(close(&mask, Norm::LInf, kernel_radius))
}

fn check_geometry(prev: &GrayImage, curr: &GrayImage) -> Result<()> {
    if curr.width() == 0 || curr.height() == 0 {
        return Err(DetectError::InvalidInput("empty frame".to_string()));
    }
    if prev.dimensions() != curr.dimensions() {
        return Err(DetectError::InvalidInput(format!(
            "frame size changed from {}x{} to {}x{}",
            prev.width(),
            prev.height(),
            curr.width(),
            curr.height()
        )));
    }
    Ok(())
}

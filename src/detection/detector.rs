// Frame-difference motion detector

use image::GrayImage;

use super::candidates::extract_candidates;
use super::mask::motion_mask;
use super::suppression::non_max_suppression;
use super::{DetectError, DetectionParams, Detection, Result};

/// Moving regions between two consecutive frames.
pub fn detect(prev: &GrayImage, curr: &GrayImage, params: &DetectionParams) -> Result<Vec<Detection>> {
    let mask = motion_mask(prev, curr, params.kernel_radius)?;
    let candidates = extract_candidates(&mask, params.area_threshold);
    Ok(non_max_suppression(&candidates, params.iou_threshold))
}

/// Stateful detector fed one frame at a time.
pub struct MotionDetector {
    params: DetectionParams,
    previous: Option<GrayImage>,
}

impl MotionDetector {
    pub fn new(params: DetectionParams) -> Self {
        Self { params, previous: None }
    }

    pub fn params(&self) -> &DetectionParams {
        &self.params
    }

    /// Detections between the stored frame and `frame`, then `frame` becomes
    /// the stored frame.
    ///
    /// The first frame after construction or [`reset`](Self::reset) returns
    /// nothing. A frame whose size differs from the stored one is rejected
    /// and replaces it, so detection resumes on the next call.
    pub fn update(&mut self, frame: &GrayImage) -> Result<Vec<Detection>> {
        let Some(prev) = self.previous.replace(frame.clone()) else {
            return Ok(Vec::new());
        };
        if prev.dimensions() != frame.dimensions() {
            log::warn!(
                "Frame size changed {:?} -> {:?}, restarting detection",
                prev.dimensions(),
                frame.dimensions()
            );
            return Err(DetectError::InvalidInput(format!(
                "expected {}x{} frame, got {}x{}",
                prev.width(),
                prev.height(),
                frame.width(),
                frame.height()
            )));
        }
        detect(&prev, frame, &self.params)
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }
}

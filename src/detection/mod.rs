//! Motion detection by frame differencing
//!
//! Two consecutive grayscale frames go through:
//! - absolute difference and mask cleanup ([`mask`])
//! - outer contour extraction and area filtering ([`candidates`])
//! - greedy non-maximum suppression ([`suppression`])
//!
//! [`detector::MotionDetector`] wraps the stateless [`detect`] and remembers
//! the previous frame.

pub mod candidates;
pub mod detector;
pub mod mask;
pub mod suppression;

pub use detector::{detect, MotionDetector};

/// Error type for motion detection
#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, DetectError>;

/// Axis-aligned box in pixel coordinates with `x1 < x2` and `y1 < y2`.
///
/// `score` is the bounding-rectangle area for motion candidates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub score: f32,
}

impl Detection {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> Self {
        Self { x1, y1, x2, y2, score }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// Intersection over union; zero when either box is degenerate.
    pub fn iou(&self, other: &Detection) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);

        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// Tunables for a single detection pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParams {
    /// Minimum bounding-rectangle area (px²); candidates must be strictly larger
    pub area_threshold: f32,
    /// Boxes overlapping a kept box by more than this are suppressed
    pub iou_threshold: f32,
    /// Radius of the square closing kernel (side = 2r + 1)
    pub kernel_radius: u8,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            area_threshold: 400.0,
            iou_threshold: 1e-3,
            kernel_radius: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = Detection::new(0.0, 0.0, 10.0, 10.0, 100.0);
        let b = Detection::new(20.0, 20.0, 30.0, 30.0, 100.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let a = Detection::new(5.0, 5.0, 15.0, 25.0, 200.0);
        assert!((a.iou(&a) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn iou_of_half_overlap() {
        let a = Detection::new(0.0, 0.0, 10.0, 10.0, 100.0);
        let b = Detection::new(5.0, 0.0, 15.0, 10.0, 100.0);
        // 50 / 150
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
    }
}

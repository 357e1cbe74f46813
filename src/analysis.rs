// Per-frame analysis: detection, tracking, and the recording decision

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::detection::{DetectError, Detection, DetectionParams, MotionDetector};
use crate::frame::Frame;
use crate::recording::{Decision, RecordingController};
use crate::tracking::{Track, Tracker};

/// Detector followed by a tracker, silent until the tracker has seen
/// `min_hits` frames.
pub struct MotionInference {
    detector: MotionDetector,
    tracker: Box<dyn Tracker>,
    min_hits: u32,
    max_age: u32,
    frames_passed: u64,
}

impl MotionInference {
    pub fn new(params: DetectionParams, tracker: Box<dyn Tracker>, min_hits: u32, max_age: u32) -> Self {
        Self {
            detector: MotionDetector::new(params),
            tracker,
            min_hits,
            max_age,
            frames_passed: 0,
        }
    }

    /// Confirmed tracks on this frame.
    pub fn update(&mut self, gray: &image::GrayImage) -> Result<Vec<Track>, DetectError> {
        let detections = self.detector.update(gray)?;
        let tracks = self.tracker.update(&detections, self.min_hits, self.max_age);

        self.frames_passed += 1;
        if self.frames_passed < u64::from(self.min_hits) {
            return Ok(Vec::new());
        }
        Ok(tracks)
    }

    pub fn frames_passed(&self) -> u64 {
        self.frames_passed
    }

    pub fn reset(&mut self) {
        self.detector.reset();
        self.tracker.reset();
        self.frames_passed = 0;
    }
}

/// What one analyzed frame produced
#[derive(Debug, Clone, PartialEq)]
pub struct FrameOutcome {
    pub tracks: Vec<Track>,
    pub decision: Option<Decision>,
}

/// Feeds decoded frames through inference into the recording controller.
pub struct FrameAnalyzer {
    inference: MotionInference,
    controller: RecordingController,
    analyzed: Arc<AtomicU64>,
}

impl FrameAnalyzer {
    pub fn new(inference: MotionInference, controller: RecordingController) -> Self {
        Self {
            inference,
            controller,
            analyzed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Counter of analyzed frames, readable from other threads.
    pub fn analyzed_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.analyzed)
    }

    pub fn controller(&self) -> &RecordingController {
        &self.controller
    }

    /// A frame rejected by the detector is logged and skipped; it does not
    /// reach the controller.
    pub fn on_frame(&mut self, frame: &Frame) -> FrameOutcome {
        self.analyzed.fetch_add(1, Ordering::Relaxed);

        let tracks = match self.inference.update(&frame.gray) {
            Ok(tracks) => tracks,
            Err(e) => {
                log::warn!("Skipping frame: {}", e);
                return FrameOutcome {
                    tracks: Vec::new(),
                    decision: None,
                };
            }
        };
        let boxes: Vec<Detection> = tracks.iter().map(|t| t.bbox).collect();
        let decision = self.controller.update_frame(&frame.rgb, &boxes);
        FrameOutcome { tracks, decision }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::IouTracker;
    use image::{GrayImage, Luma};

    fn frame_with_box(x0: u32) -> GrayImage {
        let mut frame = GrayImage::from_pixel(120, 90, Luma([30]));
        for y in 20..60 {
            for x in x0..x0 + 30 {
                frame.put_pixel(x, y, Luma([220]));
            }
        }
        frame
    }

    #[test]
    fn output_is_suppressed_during_warm_up() {
        let mut inference = MotionInference::new(DetectionParams::default(), Box::new(IouTracker::default()), 3, 5);
        let background = GrayImage::from_pixel(120, 90, Luma([30]));

        inference.update(&background).unwrap();
        // motion on the second frame, but only two frames have passed
        assert!(inference.update(&frame_with_box(40)).unwrap().is_empty());
        assert_eq!(inference.frames_passed(), 2);
    }

    #[test]
    fn reset_restarts_warm_up() {
        let mut inference = MotionInference::new(DetectionParams::default(), Box::new(IouTracker::default()), 1, 5);
        inference.update(&frame_with_box(10)).unwrap();
        assert!(!inference.update(&frame_with_box(40)).unwrap().is_empty());

        inference.reset();
        assert_eq!(inference.frames_passed(), 0);
        assert!(inference.update(&frame_with_box(70)).unwrap().is_empty());
    }
}

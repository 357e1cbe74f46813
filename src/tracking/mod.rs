//! Multi-object tracking over per-frame detections
//!
//! The recorder only needs "is anything being tracked right now", but the
//! tracker is pluggable behind [`Tracker`] so a smoother association
//! strategy can replace the default [`IouTracker`].

mod iou;

pub use iou::IouTracker;

use crate::detection::Detection;

/// A tracked object as reported for one frame
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub id: u64,
    pub bbox: Detection,
    /// Total frames this track was matched on
    pub hits: u32,
    /// Consecutive matched frames up to now
    pub hit_streak: u32,
    /// Frames since the track was created
    pub age: u32,
    /// Frames since the last match
    pub time_since_update: u32,
}

/// Associates detections across frames.
///
/// Implementations return only tracks confirmed on the current frame: at
/// least `min_hits` consecutive matches (or still within the first
/// `min_hits` frames overall). Tracks unmatched for more than `max_age`
/// frames are forgotten.
pub trait Tracker: Send {
    fn update(&mut self, detections: &[Detection], min_hits: u32, max_age: u32) -> Vec<Track>;

    /// Forget all tracks.
    fn reset(&mut self);
}

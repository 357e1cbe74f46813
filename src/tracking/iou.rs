// Greedy IoU association tracker

use std::cmp::Ordering;

use super::{Track, Tracker};
use crate::detection::Detection;

/// Matches each frame's detections to existing tracks by descending IoU.
pub struct IouTracker {
    tracks: Vec<Track>,
    next_id: u64,
    frame_count: u64,
    match_iou: f32,
}

impl IouTracker {
    /// `match_iou` is the minimum overlap for a detection to continue a track.
    pub fn new(match_iou: f32) -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 1,
            frame_count: 0,
            match_iou,
        }
    }

    /// All live tracks, confirmed or not.
    pub fn live_tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Greedy assignment: best overlapping pairs first, each side used once.
    fn associate(&self, detections: &[Detection]) -> Vec<(usize, usize)> {
        let mut pairs: Vec<(f32, usize, usize)> = Vec::new();
        for (t, track) in self.tracks.iter().enumerate() {
            for (d, det) in detections.iter().enumerate() {
                let iou = track.bbox.iou(det);
                if iou >= self.match_iou {
                    pairs.push((iou, t, d));
                }
            }
        }
        pairs.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

        let mut track_used = vec![false; self.tracks.len()];
        let mut det_used = vec![false; detections.len()];
        let mut matches = Vec::new();
        for (_, t, d) in pairs {
            if !track_used[t] && !det_used[d] {
                track_used[t] = true;
                det_used[d] = true;
                matches.push((t, d));
            }
        }
        matches
    }
}

impl Default for IouTracker {
    fn default() -> Self {
        Self::new(0.3)
    }
}

impl Tracker for IouTracker {
    fn update(&mut self, detections: &[Detection], min_hits: u32, max_age: u32) -> Vec<Track> {
        self.frame_count += 1;
        for track in &mut self.tracks {
            track.age += 1;
            track.time_since_update += 1;
        }

        let matches = self.associate(detections);
        let mut det_matched = vec![false; detections.len()];
        for &(t, d) in &matches {
            let track = &mut self.tracks[t];
            track.bbox = detections[d];
            track.hits += 1;
            track.hit_streak += 1;
            track.time_since_update = 0;
            det_matched[d] = true;
        }

        for track in &mut self.tracks {
            if track.time_since_update > 0 {
                track.hit_streak = 0;
            }
        }

        for (d, det) in detections.iter().enumerate() {
            if !det_matched[d] {
                self.tracks.push(Track {
                    id: self.next_id,
                    bbox: *det,
                    hits: 1,
                    hit_streak: 1,
                    age: 0,
                    time_since_update: 0,
                });
                self.next_id += 1;
            }
        }

        self.tracks.retain(|t| t.time_since_update <= max_age);

        let warming_up = self.frame_count <= u64::from(min_hits);
        self.tracks
            .iter()
            .filter(|t| t.time_since_update == 0 && (t.hit_streak >= min_hits || warming_up))
            .cloned()
            .collect()
    }

    fn reset(&mut self) {
        self.tracks.clear();
        self.frame_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(x: f32) -> Detection {
        Detection::new(x, 10.0, x + 20.0, 30.0, 400.0)
    }

    #[test]
    fn empty_input_yields_no_tracks() {
        let mut tracker = IouTracker::default();
        assert!(tracker.update(&[], 3, 5).is_empty());
    }

    #[test]
    fn ids_are_stable_across_small_moves() {
        let mut tracker = IouTracker::default();
        let first = tracker.update(&[boxed(0.0)], 1, 5);
        let second = tracker.update(&[boxed(2.0)], 1, 5);
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(second[0].hits, 2);
    }

    #[test]
    fn tracks_need_min_hits_after_warm_up() {
        let mut tracker = IouTracker::default();
        // frames 1..=3 are within the warm-up window for min_hits = 3
        for _ in 0..3 {
            tracker.update(&[], 3, 5);
        }
        assert!(tracker.update(&[boxed(0.0)], 3, 5).is_empty());
        assert!(tracker.update(&[boxed(1.0)], 3, 5).is_empty());
        let confirmed = tracker.update(&[boxed(2.0)], 3, 5);
        assert_eq!(confirmed.len(), 1);
        assert_eq!(confirmed[0].hit_streak, 3);
    }

    #[test]
    fn unmatched_tracks_expire_after_max_age() {
        let mut tracker = IouTracker::default();
        tracker.update(&[boxed(0.0)], 1, 2);
        for _ in 0..2 {
            assert!(tracker.update(&[], 1, 2).is_empty());
            assert_eq!(tracker.live_tracks().len(), 1);
        }
        tracker.update(&[], 1, 2);
        assert!(tracker.live_tracks().is_empty());
    }

    #[test]
    fn distant_detection_starts_new_track() {
        let mut tracker = IouTracker::default();
        let a = tracker.update(&[boxed(0.0)], 1, 5);
        let b = tracker.update(&[boxed(200.0)], 1, 5);
        assert_ne!(a[0].id, b[0].id);
        assert_eq!(tracker.live_tracks().len(), 2);
    }
}

// Greedy non-maximum suppression

use std::cmp::Ordering;

use super::Detection;

/// Keep the highest-scoring boxes, dropping any box whose IoU with an
/// already kept box exceeds `iou_threshold`.
///
/// Output is ordered by descending score.
pub fn non_max_suppression(detections: &[Detection], iou_threshold: f32) -> Vec<Detection> {
    let mut ordered = detections.to_vec();
    ordered.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

    let mut kept: Vec<Detection> = Vec::with_capacity(ordered.len());
    for candidate in ordered {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input() {
        assert!(non_max_suppression(&[], 0.5).is_empty());
    }

    #[test]
    fn overlapping_box_with_lower_score_is_dropped() {
        let big = Detection::new(0.0, 0.0, 20.0, 20.0, 400.0);
        let small = Detection::new(5.0, 5.0, 15.0, 15.0, 100.0);
        let far = Detection::new(50.0, 50.0, 60.0, 60.0, 100.0);

        let kept = non_max_suppression(&[small, far, big], 1e-3);
        assert_eq!(kept, vec![big, far]);
    }

    #[test]
    fn kept_boxes_never_overlap_beyond_threshold() {
        let boxes: Vec<Detection> = (0..12)
            .map(|i| {
                let o = i as f32 * 4.0;
                Detection::new(o, o, o + 20.0, o + 20.0, 400.0 - i as f32)
            })
            .collect();
        let threshold = 0.2;
        let kept = non_max_suppression(&boxes, threshold);

        assert!(kept.len() <= boxes.len());
        for (i, a) in kept.iter().enumerate() {
            for b in &kept[i + 1..] {
                assert!(a.iou(b) <= threshold);
            }
        }
    }
}

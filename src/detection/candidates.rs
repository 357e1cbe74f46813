// Bounding boxes of outer contours in a binary mask

use image::GrayImage;
use imageproc::contours::{find_contours, BorderType, Contour};

use super::Detection;

/// Outermost contours of `mask`, as boxes whose area is strictly above
/// `area_threshold`. The box score is its area.
pub fn extract_candidates(mask: &GrayImage, area_threshold: f32) -> Vec<Detection> {
    find_contours::<i32>(mask)
        .iter()
        .filter(|c| c.parent.is_none() && c.border_type == BorderType::Outer)
        .filter_map(bounding_box)
        .filter(|d| d.score > area_threshold)
        .collect()
}

fn bounding_box(contour: &Contour<i32>) -> Option<Detection> {
    let first = contour.points.first()?;
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
    for p in &contour.points[1..] {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }

    // pixel extents are inclusive
    let w = (max_x - min_x + 1) as f32;
    let h = (max_y - min_y + 1) as f32;
    let (x, y) = (min_x as f32, min_y as f32);
    Some(Detection::new(x, y, x + w, y + h, w * h))
}

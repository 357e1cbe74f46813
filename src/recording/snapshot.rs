// Annotated preview images

use chrono::Local;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::path::{Path, PathBuf};

use crate::detection::Detection;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

/// Draw each box as a green outline, clipped to the image.
pub fn annotate(frame: &mut RgbImage, boxes: &[Detection]) {
    let (width, height) = frame.dimensions();
    for b in boxes {
        let x1 = b.x1.max(0.0) as i32;
        let y1 = b.y1.max(0.0) as i32;
        let x2 = (b.x2.min(width as f32) as i32).max(x1 + 1);
        let y2 = (b.y2.min(height as f32) as i32).max(y1 + 1);
        let rect = Rect::at(x1, y1).of_size((x2 - x1) as u32, (y2 - y1) as u32);
        draw_hollow_rect_mut(frame, rect, BOX_COLOR);
    }
}

/// Writes numbered, annotated PNGs into one directory.
pub struct SnapshotWriter {
    dir: PathBuf,
    prefix: String,
    counter: u64,
}

impl SnapshotWriter {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            counter: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Save `frame` with `boxes` drawn on a copy as
    /// `{prefix}-{n}-{timestamp}.png`.
    pub fn save(&mut self, frame: &RgbImage, boxes: &[Detection]) -> Result<PathBuf, SnapshotError> {
        std::fs::create_dir_all(&self.dir)?;
        let name = format!(
            "{}-{}-{}.png",
            self.prefix,
            self.counter,
            Local::now().format("%Y%m%dT%H%M%S")
        );
        let path = self.dir.join(name);
        self.counter += 1;

        self.write(&path, frame, boxes)?;
        Ok(path)
    }

    /// Save to an exact path.
    pub fn write(&self, path: &Path, frame: &RgbImage, boxes: &[Detection]) -> Result<(), SnapshotError> {
        let mut annotated = frame.clone();
        annotate(&mut annotated, boxes);
        annotated.save(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotate_draws_outline_only() {
        let mut frame = RgbImage::new(50, 50);
        annotate(&mut frame, &[Detection::new(10.0, 10.0, 30.0, 30.0, 400.0)]);
        assert_eq!(*frame.get_pixel(10, 10), BOX_COLOR);
        assert_eq!(*frame.get_pixel(29, 20), BOX_COLOR);
        assert_eq!(*frame.get_pixel(20, 20), Rgb([0, 0, 0]));
    }

    #[test]
    fn annotate_clips_out_of_bounds_boxes() {
        let mut frame = RgbImage::new(20, 20);
        annotate(&mut frame, &[Detection::new(-5.0, -5.0, 100.0, 100.0, 1.0)]);
        assert_eq!(*frame.get_pixel(0, 0), BOX_COLOR);
    }

    #[test]
    fn save_writes_numbered_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SnapshotWriter::new(dir.path().join("previews"), "preview");
        let frame = RgbImage::new(16, 16);

        let first = writer.save(&frame, &[]).unwrap();
        let second = writer.save(&frame, &[]).unwrap();
        assert!(first.exists() && second.exists());
        assert!(first.file_name().unwrap().to_string_lossy().starts_with("preview-0-"));
        assert!(second.file_name().unwrap().to_string_lossy().starts_with("preview-1-"));
    }

    #[test]
    fn save_into_unwritable_location_fails() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let mut writer = SnapshotWriter::new(blocker.join("sub"), "preview");
        assert!(writer.save(&RgbImage::new(4, 4), &[]).is_err());
    }
}

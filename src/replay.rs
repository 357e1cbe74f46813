// Offline replay over a directory of numbered still frames

use anyhow::Context;
use std::path::{Path, PathBuf};

use crate::analysis::MotionInference;
use crate::config::Config;
use crate::frame::Frame;
use crate::recording::SnapshotWriter;
use crate::tracking::IouTracker;

const FRAME_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub frames: usize,
    /// Frames with at least one confirmed track
    pub frames_with_motion: usize,
    pub skipped: usize,
}

/// Image files in `dir`, ordered by the first number in their file name.
///
/// Files without a number sort last, by name.
pub fn ordered_frames(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut frames: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .map(|e| FRAME_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();

    frames.sort_by_cached_key(|path| {
        let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        (frame_number(&name).unwrap_or(u64::MAX), name)
    });
    Ok(frames)
}

fn frame_number(name: &str) -> Option<u64> {
    let digits: String = name
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Run detection and tracking over every frame in `frames_dir` and write
/// annotated copies to `out_dir` as `frame_{index}.png`.
pub fn replay_directory(config: &Config, frames_dir: &Path, out_dir: &Path) -> anyhow::Result<ReplaySummary> {
    let frames = ordered_frames(frames_dir)?;
    anyhow::ensure!(!frames.is_empty(), "no frames found in {}", frames_dir.display());
    std::fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;

    let mut inference = MotionInference::new(
        config.detection_params(),
        Box::new(IouTracker::new(config.tracker_match_iou)),
        config.tracker_min_hits,
        config.tracker_max_age,
    );
    let writer = SnapshotWriter::new(out_dir, "frame");
    let mut summary = ReplaySummary::default();

    for (index, path) in frames.iter().enumerate() {
        let rgb = match image::open(path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                log::warn!("Skipping {}: {}", path.display(), e);
                summary.skipped += 1;
                continue;
            }
        };
        let frame = Frame::from_rgb(rgb);

        let tracks = match inference.update(&frame.gray) {
            Ok(tracks) => tracks,
            Err(e) => {
                log::warn!("Skipping {}: {}", path.display(), e);
                summary.skipped += 1;
                continue;
            }
        };

        let boxes: Vec<_> = tracks.iter().map(|t| t.bbox).collect();
        let target = out_dir.join(format!("frame_{}.png", index));
        writer
            .write(&target, &frame.rgb, &boxes)
            .with_context(|| format!("writing {}", target.display()))?;

        summary.frames += 1;
        if !tracks.is_empty() {
            summary.frames_with_motion += 1;
        }
        log::debug!("{}: {} track(s)", path.display(), tracks.len());
    }

    log::info!(
        "Replayed {} frame(s), motion in {}, skipped {}",
        summary.frames,
        summary.frames_with_motion,
        summary.skipped
    );
    Ok(summary)
}

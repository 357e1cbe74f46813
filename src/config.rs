// Configuration management for Skywatch

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detection::DetectionParams;
use crate::recording::{BranchSettings, HysteresisConfig, HISTORY_LEN};

/// Longest accepted start/stop cooldown (one day)
const MAX_COOLDOWN_SECS: f64 = 86_400.0;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Name used in logs and error reports
    pub camera_id: String,

    /// RTSP url of the camera (H.264 video)
    pub source_url: String,

    /// Directory recordings and previews are written to
    pub output_dir: PathBuf,

    /// Minimum bounding-box area (px²) of a motion candidate
    pub area_threshold: f32,

    /// Overlap above which the smaller of two candidates is suppressed
    pub iou_threshold: f32,

    /// Radius of the square closing kernel; 4 gives 9x9
    pub morph_kernel_radius: u8,

    /// Consecutive matches before a track counts
    pub tracker_min_hits: u32,

    /// Missed frames before a track is dropped
    pub tracker_max_age: u32,

    /// Minimum IoU for a detection to continue a track
    pub tracker_match_iou: f32,

    /// Pre-roll length in nanoseconds; the post-roll matches it
    pub recording_buffer_ns: u64,

    /// Trailing positive frames needed to start recording
    pub start_recording_threshold: usize,

    /// Trailing negative frames needed to stop recording
    pub stop_recording_threshold: usize,

    /// Minimum seconds between a start and the next stop, and vice versa
    pub min_cooldown_secs: f64,

    /// Write an annotated preview image when a recording starts
    pub save_previews: bool,

    /// Interval of the status log line
    pub status_interval_secs: u64,

    /// Jitter buffer of the RTSP source
    pub rtsp_latency_ms: u32,

    /// How long a stopping recording may wait for its file to close
    pub finalize_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_id: "camera-0".to_string(),
            source_url: "rtsp://127.0.0.1:8554/stream".to_string(),
            output_dir: get_default_output_dir(),
            area_threshold: 400.0,
            iou_threshold: 1e-3,
            morph_kernel_radius: 4,
            tracker_min_hits: 3,
            tracker_max_age: 5,
            tracker_match_iou: 0.3,
            recording_buffer_ns: 3_000_000_000,
            start_recording_threshold: 5,
            stop_recording_threshold: 10,
            min_cooldown_secs: 5.0,
            save_previews: true,
            status_interval_secs: 3,
            rtsp_latency_ms: 200,
            finalize_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Read and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from disk or return default
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match Self::load(path) {
                Ok(config) => return config,
                Err(e) => log::warn!("Ignoring {}: {}", path.display(), e),
            }
        }
        Self::default()
    }

    /// Save config to disk
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source_url.trim().is_empty() {
            return Err(ConfigError::Invalid("source_url is empty".to_string()));
        }
        for (name, value) in [
            ("start_recording_threshold", self.start_recording_threshold),
            ("stop_recording_threshold", self.stop_recording_threshold),
        ] {
            if value == 0 || value > HISTORY_LEN {
                return Err(ConfigError::Invalid(format!(
                    "{} must be between 1 and {}, got {}",
                    name, HISTORY_LEN, value
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(ConfigError::Invalid(format!(
                "iou_threshold must be within [0, 1], got {}",
                self.iou_threshold
            )));
        }
        if self.recording_buffer_ns == 0 {
            return Err(ConfigError::Invalid("recording_buffer_ns must be non-zero".to_string()));
        }
        if !(0.0..=MAX_COOLDOWN_SECS).contains(&self.min_cooldown_secs) {
            return Err(ConfigError::Invalid(format!(
                "min_cooldown_secs must be between 0 and {}, got {}",
                MAX_COOLDOWN_SECS, self.min_cooldown_secs
            )));
        }
        Ok(())
    }

    pub fn recording_buffer(&self) -> Duration {
        Duration::from_nanos(self.recording_buffer_ns)
    }

    pub fn cooldown(&self) -> Duration {
        // NaN fails the conversion and falls back to no cooldown
        Duration::try_from_secs_f64(self.min_cooldown_secs.clamp(0.0, MAX_COOLDOWN_SECS)).unwrap_or_default()
    }

    pub fn detection_params(&self) -> DetectionParams {
        DetectionParams {
            area_threshold: self.area_threshold,
            iou_threshold: self.iou_threshold,
            kernel_radius: self.morph_kernel_radius,
        }
    }

    pub fn hysteresis(&self) -> HysteresisConfig {
        HysteresisConfig {
            start_threshold: self.start_recording_threshold,
            stop_threshold: self.stop_recording_threshold,
            cooldown: self.cooldown(),
        }
    }

    pub fn branch_settings(&self) -> BranchSettings {
        BranchSettings {
            camera_id: self.camera_id.clone(),
            source_url: self.source_url.clone(),
            rtsp_latency_ms: self.rtsp_latency_ms,
            output_dir: self.output_dir.clone(),
            buffer: self.recording_buffer(),
            cooldown: self.cooldown(),
            finalize_timeout: Duration::from_secs(self.finalize_timeout_secs),
        }
    }

    pub fn previews_dir(&self) -> PathBuf {
        self.output_dir.join("previews")
    }
}

/// Get the default directory for recordings
fn get_default_output_dir() -> PathBuf {
    dirs::video_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Videos")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("skywatch")
}

/// Get the default config file path
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("skywatch")
        .join("config.toml")
}

// Skywatch - motion-triggered RTSP recorder
// Main library entry point

pub mod analysis;
pub mod clock;
pub mod config;
pub mod detection;
pub mod frame;
pub mod graph;
pub mod gstreamer_init;
pub mod recording;
pub mod replay;
pub mod session;
pub mod tracking;

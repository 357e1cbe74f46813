//! GStreamer initialization
//!
//! The framework is initialised once per process; the outcome is cached so
//! every caller sees the same result.

use std::sync::OnceLock;

static GSTREAMER_INIT: OnceLock<Result<(), String>> = OnceLock::new();

/// Initialize GStreamer, logging the runtime version on success.
///
/// Must be called before any graph is built.
pub fn init_gstreamer() -> anyhow::Result<()> {
    GSTREAMER_INIT
        .get_or_init(|| match gstreamer::init() {
            Ok(()) => {
                log::info!("GStreamer initialized successfully");
                log_gstreamer_version();
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to initialize GStreamer: {}", e);
                Err(e.to_string())
            }
        })
        .clone()
        .map_err(|e| anyhow::anyhow!("GStreamer unavailable: {}", e))
}

fn log_gstreamer_version() {
    let (major, minor, micro, nano) = gstreamer::version();
    let nano_str = match nano {
        0 => String::new(),
        1 => " (git)".to_string(),
        2 => " (prerelease)".to_string(),
        _ => format!(" (nano: {})", nano),
    };
    log::info!("GStreamer version: {}.{}.{}{}", major, minor, micro, nano_str);
    if let Ok(path) = std::env::var("GST_PLUGIN_PATH") {
        log::debug!("GST_PLUGIN_PATH: {}", path);
    }
}

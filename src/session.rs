// Capture session: wires analysis to the recording branch and runs the
// control loop until the stream ends, fails, or the process is interrupted.

use chrono::Local;
use crossbeam_channel::Receiver;
use gstreamer as gst;
use gstreamer::prelude::*;
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::analysis::{FrameAnalyzer, MotionInference};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::recording::{
    BranchError, RecordingController, RecordingState, SnapshotWriter, StateCell, StreamBranchController,
};
use crate::tracking::IouTracker;

const BUS_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("{camera_id}: source failed while {state} at {at}: {message}")]
    SourceFatal {
        camera_id: String,
        state: RecordingState,
        at: String,
        message: String,
    },

    #[error(transparent)]
    Branch(#[from] BranchError),

    #[error("Pipeline has no bus")]
    NoBus,

    #[error("Failed to install interrupt handler: {0}")]
    Signal(#[from] ctrlc::Error),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Toggle recording on every line read from stdin
    pub manual_trigger: bool,
}

/// Run one camera until end-of-stream, a fatal error, or Ctrl-C.
///
/// Any active recording is finished before returning.
pub fn run(config: &Config, options: RunOptions) -> Result<(), SessionError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let state = Arc::new(StateCell::new(config.camera_id.clone()));
    let branch = Arc::new(StreamBranchController::new(
        config.branch_settings(),
        Arc::clone(&state),
        Arc::clone(&clock),
    )?);

    let inference = MotionInference::new(
        config.detection_params(),
        Box::new(IouTracker::new(config.tracker_match_iou)),
        config.tracker_min_hits,
        config.tracker_max_age,
    );
    let mut controller = RecordingController::new(
        config.hysteresis(),
        Arc::clone(&state),
        branch.clone(),
        Arc::clone(&clock),
    );
    if config.save_previews {
        controller = controller.with_snapshots(SnapshotWriter::new(config.previews_dir(), "preview"));
    }
    let mut analyzer = FrameAnalyzer::new(inference, controller);
    let analyzed = analyzer.analyzed_counter();
    branch.connect_frame_handler(move |frame| {
        analyzer.on_frame(&frame);
    });

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst))?;
    }
    let triggers = options.manual_trigger.then(spawn_stdin_trigger);

    let bus = branch.bus().ok_or(SessionError::NoBus)?;
    branch.play()?;
    log::info!("{}: streaming from {}", config.camera_id, config.source_url);

    let mut status = StatusLog::new(Duration::from_secs(config.status_interval_secs.max(1)), analyzed);
    let result = loop {
        if shutdown.load(Ordering::SeqCst) {
            log::info!("{}: interrupted", config.camera_id);
            break Ok(());
        }

        if let Some(msg) = bus.timed_pop(gst::ClockTime::from_mseconds(BUS_POLL.as_millis() as u64)) {
            match msg.view() {
                gst::MessageView::Eos(..) => {
                    log::info!("{}: end of stream", config.camera_id);
                    break Ok(());
                }
                gst::MessageView::Error(err) => {
                    let source = err
                        .src()
                        .map(|s| s.path_string().to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    break Err(SessionError::SourceFatal {
                        camera_id: config.camera_id.clone(),
                        state: branch.state(),
                        at: Local::now().to_rfc3339(),
                        message: format!("{} ({}; {:?})", err.error(), source, err.debug()),
                    });
                }
                gst::MessageView::Warning(w) => {
                    log::warn!("{}: {} ({:?})", config.camera_id, w.error(), w.debug());
                }
                _ => {}
            }
        }

        branch.poll_events();

        if let Some(rx) = &triggers {
            while rx.try_recv().is_ok() {
                match branch.switch_state() {
                    Ok(state) => log::info!("{}: manual switch, now {}", config.camera_id, state),
                    Err(e) => log::warn!("{}: manual switch refused: {}", config.camera_id, e),
                }
            }
        }

        status.maybe_log(&branch);
    };

    if let Err(ref e) = result {
        log::error!("{}", e);
    }
    branch.drain(Duration::from_secs(config.finalize_timeout_secs));
    result
}

/// Every line on stdin becomes one toggle request.
fn spawn_stdin_trigger() -> Receiver<()> {
    let (tx, rx) = crossbeam_channel::unbounded();
    let spawned = std::thread::Builder::new()
        .name("stdin-trigger".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                if line.is_err() || tx.send(()).is_err() {
                    break;
                }
            }
        });
    match spawned {
        Ok(_) => log::info!("Manual trigger enabled: press Enter to start or stop recording"),
        Err(e) => log::warn!("Manual trigger unavailable: {}", e),
    }
    rx
}

/// Periodic liveness line
struct StatusLog {
    interval: Duration,
    last: Instant,
    analyzed: Arc<AtomicU64>,
}

impl StatusLog {
    fn new(interval: Duration, analyzed: Arc<AtomicU64>) -> Self {
        Self {
            interval,
            last: Instant::now(),
            analyzed,
        }
    }

    fn maybe_log(&mut self, branch: &StreamBranchController) {
        if self.last.elapsed() < self.interval {
            return;
        }
        self.last = Instant::now();

        let m = branch.metrics();
        log::info!(
            "{}: state={} depayed={} buffered={} behind={} analyzed={} recorded={}",
            branch.camera_id(),
            branch.state(),
            m.depayed,
            m.buffered,
            m.depayed.saturating_sub(m.buffered),
            self.analyzed.load(Ordering::Relaxed),
            m.recorded
        );
    }
}

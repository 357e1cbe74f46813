// Stream branch controller
//
// Owns the capture graph:
//
//   rtspsrc → queue → rtph264depay → h264parse → tee(app)
//   tee(app) → queue → avdec_h264 → videoconvert → queue(leaky) → appsink      analysis
//   tee(app) → queue(min-threshold = buffer) → tee(sink)                        delay line
//   tee(sink) → queue → fakesink                                               keeps the delay line draining
//   tee(sink) ⇢ [queue → mp4mux → filesink]                                    switchable, locked in NULL when idle
//
// Because the file branch hangs off the delay line, whatever it receives is
// already `buffer` old, which is where the pre-roll comes from. Stopping waits
// another `2 × buffer` before detaching, so the post-roll is symmetric.

use crossbeam_channel::{Receiver, Sender};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::controller::{Decision, RecordingSink};
use super::lifecycle::BranchLifecycle;
use super::relink::{self, RelinkOp};
use super::state::{RecordingState, StateCell, TransitionError};
use crate::clock::Clock;
use crate::frame::{frame_from_sample, Frame};
use crate::graph::{self, Graph, GraphError, Node, NodeKind, QueueMode};

/// Error type for recording branch operations
#[derive(Debug, thiserror::Error)]
pub enum BranchError {
    #[error("Graph link error: {0}")]
    Link(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Another relink is still pending")]
    RelinkPending,

    #[error("Cannot switch while {0}")]
    Busy(RecordingState),

    #[error("Cooldown active for another {0:?}")]
    CoolingDown(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BranchError {
    /// Refused before anything was changed; there is nothing to undo.
    pub fn is_refusal(&self) -> bool {
        matches!(
            self,
            BranchError::RelinkPending
                | BranchError::Busy(_)
                | BranchError::CoolingDown(_)
                | BranchError::Transition(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BranchError>;

/// Raised on streaming threads, consumed by the control loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchEvent {
    /// End-of-stream reached the file sink
    FileFinalized,
    /// The stop relink could not detach the file branch
    DetachFailed,
}

#[derive(Debug, Clone)]
pub struct BranchSettings {
    pub camera_id: String,
    pub source_url: String,
    pub rtsp_latency_ms: u32,
    pub output_dir: PathBuf,
    /// Pre-roll length; also the delay line length
    pub buffer: Duration,
    pub cooldown: Duration,
    /// How long a stopping recording may wait for end-of-stream
    pub finalize_timeout: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Buffers that reached the app tee
    pub depayed: u64,
    /// Buffers released by the delay line
    pub buffered: u64,
    /// Buffers that entered the file branch
    pub recorded: u64,
}

#[derive(Debug, Default)]
struct BranchMetrics {
    depayed: AtomicU64,
    buffered: AtomicU64,
    recorded: AtomicU64,
}

// ============================================================================
// File branch
// ============================================================================

struct FileBranch {
    queue: Node,
    mux: Node,
    sink: Node,
    /// Request pad on the sink tee feeding this branch
    tee_pad: gst::Pad,
}

impl FileBranch {
    /// Downstream first, so state changes never push into a stopped element.
    fn elements(&self) -> [&gst::Element; 3] {
        [self.sink.element(), self.mux.element(), self.queue.element()]
    }

    fn set_location(&self, path: &Path) {
        self.sink
            .element()
            .set_property("location", path.to_string_lossy().to_string());
    }

    /// Start the elements, then link them behind the tee.
    fn attach(&self) -> Result<()> {
        for element in self.elements() {
            element.set_locked_state(false);
        }
        for element in self.elements() {
            element.sync_state_with_parent().map_err(|e| {
                BranchError::Link(format!("{} did not follow the pipeline state: {}", element.name(), e))
            })?;
        }

        let queue_sink = self.queue.sink_pad()?;
        drop_until_keyframe(&queue_sink);
        graph::link_pads(&self.tee_pad, &queue_sink)?;
        Ok(())
    }

    /// Unlink from the tee and let end-of-stream flush the muxer.
    fn detach(&self) -> Result<()> {
        let queue_sink = self.queue.sink_pad()?;
        graph::unlink_pads(&self.tee_pad, &queue_sink)?;
        if !queue_sink.send_event(gst::event::Eos::new()) {
            return Err(BranchError::Link("file branch refused end-of-stream".to_string()));
        }
        Ok(())
    }

    /// Unlink if needed, stop every element and keep it out of pipeline
    /// state changes.
    fn park(&self) -> Result<()> {
        if let Some(peer) = self.tee_pad.peer() {
            graph::unlink_pads(&self.tee_pad, &peer)?;
        }
        for element in self.elements() {
            element.set_locked_state(true);
            element.set_state(gst::State::Null).map_err(GraphError::from)?;
        }
        Ok(())
    }
}

/// The muxer needs to start on a keyframe.
fn drop_until_keyframe(pad: &gst::Pad) {
    pad.add_probe(gst::PadProbeType::BUFFER, |_pad, info| {
        if let Some(gst::PadProbeData::Buffer(ref buffer)) = info.data {
            if buffer.flags().contains(gst::BufferFlags::DELTA_UNIT) {
                return gst::PadProbeReturn::Drop;
            }
        }
        gst::PadProbeReturn::Remove
    });
}

// ============================================================================
// Shared between the controller and streaming-thread callbacks
// ============================================================================

struct Shared {
    lifecycle: BranchLifecycle,
    file: FileBranch,
    events: Sender<BranchEvent>,
    metrics: BranchMetrics,
}

// ============================================================================
// Controller
// ============================================================================

/// Builds the capture graph and switches the file branch in and out.
pub struct StreamBranchController {
    shared: Arc<Shared>,
    graph: Graph,
    appsink: gst_app::AppSink,
    events: Receiver<BranchEvent>,
    output_dir: PathBuf,
}

impl StreamBranchController {
    pub fn new(settings: BranchSettings, state: Arc<StateCell>, clock: Arc<dyn Clock>) -> Result<Self> {
        std::fs::create_dir_all(&settings.output_dir)?;

        let source_kind = NodeKind::RtspSource {
            location: settings.source_url.clone(),
            latency_ms: settings.rtsp_latency_ms,
        };
        graph::check_plugins(&[
            source_kind.clone(),
            NodeKind::H264Depay,
            NodeKind::H264Parse,
            NodeKind::H264Decode,
            NodeKind::Mp4Mux,
        ])?;

        let graph = Graph::new(&format!("{}-pipeline", settings.camera_id));

        // ingest
        let source = graph.add("source", source_kind)?;
        let rtp_queue = graph.add("rtp-queue", NodeKind::Queue(QueueMode::Plain))?;
        let depay = graph.add("depay", NodeKind::H264Depay)?;
        let parse = graph.add("parse", NodeKind::H264Parse)?;
        let app_tee = graph.add("app-tee", NodeKind::Tee { allow_not_linked: false })?;
        graph.chain(&[&rtp_queue, &depay, &parse, &app_tee])?;
        link_source_pads(&source, &rtp_queue, &settings.camera_id)?;

        // analysis
        let analysis_queue = graph.add("analysis-queue", NodeKind::Queue(QueueMode::Plain))?;
        let decode = graph.add("decode", NodeKind::H264Decode)?;
        let convert = graph.add("convert", NodeKind::VideoConvert)?;
        let frame_queue = graph.add("frame-queue", NodeKind::Queue(QueueMode::Leaky { max_buffers: 1 }))?;
        let frames = graph.add("frames", NodeKind::RgbAppSink)?;
        graph.fan_out(&app_tee, &analysis_queue)?;
        graph.chain(&[&analysis_queue, &decode, &convert, &frame_queue, &frames])?;
        let appsink = frames
            .element()
            .clone()
            .downcast::<gst_app::AppSink>()
            .map_err(|_| BranchError::Link("frames node is not an appsink".to_string()))?;

        // delay line
        let sink_queue = graph.add("sink-queue", NodeKind::Queue(QueueMode::Delay(settings.buffer)))?;
        let sink_tee = graph.add("sink-tee", NodeKind::Tee { allow_not_linked: true })?;
        graph.fan_out(&app_tee, &sink_queue)?;
        graph.connect(&sink_queue, &sink_tee)?;

        let fake_queue = graph.add("fake-queue", NodeKind::Queue(QueueMode::Plain))?;
        let fake_sink = graph.add("fake-sink", NodeKind::FakeSink)?;
        graph.fan_out(&sink_tee, &fake_queue)?;
        graph.connect(&fake_queue, &fake_sink)?;

        // switchable file branch, left unlinked from the tee
        let file_queue = graph.add("file-queue", NodeKind::Queue(QueueMode::Plain))?;
        let mux = graph.add("mux", NodeKind::Mp4Mux)?;
        let file_sink = graph.add("file-sink", NodeKind::FileSink)?;
        graph.chain(&[&file_queue, &mux, &file_sink])?;
        let tee_branch = graph.branch(&sink_tee)?;

        let (tx, rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            lifecycle: BranchLifecycle::new(
                state,
                clock,
                settings.buffer,
                settings.cooldown,
                settings.finalize_timeout,
            ),
            file: FileBranch {
                queue: file_queue,
                mux,
                sink: file_sink,
                tee_pad: tee_branch.pad().clone(),
            },
            events: tx,
            metrics: BranchMetrics::default(),
        });
        shared.file.park()?;

        install_probes(&shared, &app_tee, &sink_queue)?;

        log::info!(
            "{}: capture graph ready ({} pre-roll, output {})",
            settings.camera_id,
            humanize(settings.buffer),
            settings.output_dir.display()
        );

        Ok(Self {
            shared,
            graph,
            appsink,
            events: rx,
            output_dir: settings.output_dir,
        })
    }

    pub fn camera_id(&self) -> &str {
        self.shared.lifecycle.camera_id()
    }

    pub fn state(&self) -> RecordingState {
        self.shared.lifecycle.state()
    }

    pub fn state_cell(&self) -> Arc<StateCell> {
        self.shared.lifecycle.state_cell()
    }

    pub fn current_file(&self) -> Option<PathBuf> {
        self.shared.lifecycle.current_file()
    }

    pub fn bus(&self) -> Option<gst::Bus> {
        self.graph.bus()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let m = &self.shared.metrics;
        MetricsSnapshot {
            depayed: m.depayed.load(Ordering::Relaxed),
            buffered: m.buffered.load(Ordering::Relaxed),
            recorded: m.recorded.load(Ordering::Relaxed),
        }
    }

    /// Deliver every decoded frame to `handler` on the analysis thread.
    pub fn connect_frame_handler<F>(&self, mut handler: F)
    where
        F: FnMut(Frame) + Send + 'static,
    {
        let camera_id = self.camera_id().to_string();
        self.appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    match frame_from_sample(&sample) {
                        Ok(frame) => handler(frame),
                        Err(e) => log::warn!("{}: dropping undecodable frame: {}", camera_id, e),
                    }
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );
    }

    pub fn play(&self) -> Result<()> {
        self.graph.set_state(gst::State::Playing)?;
        Ok(())
    }

    /// Attach the file branch at the next idle point.
    ///
    /// Returns the file the recording will be written to. The state is
    /// `Starting` on return and becomes `Recording` once the branch is linked.
    pub fn start_recording(&self) -> Result<PathBuf> {
        let shared = &self.shared;
        let (claim, path) = shared.lifecycle.begin_start(&self.output_dir)?;
        shared.file.set_location(&path);

        let attach = Arc::clone(shared);
        let done = Arc::clone(shared);
        let op = RelinkOp::immediate("start", Box::new(move || attach.file.attach()));
        relink::schedule(&shared.file.tee_pad, op, move |result| {
            if result.is_err() {
                if let Err(e) = done.file.park() {
                    log::error!("{}: could not park recording branch: {}", done.lifecycle.camera_id(), e);
                }
            }
            done.lifecycle.finish_start(claim, result);
        });

        log::info!("{}: recording to {}", self.camera_id(), path.display());
        Ok(path)
    }

    /// Detach the file branch once the post-roll has elapsed.
    ///
    /// Returns the detach deadline. The state is `Stopping` until the file
    /// is finalized by [`poll_events`](Self::poll_events).
    pub fn stop_recording(&self) -> Result<Instant> {
        let shared = &self.shared;
        let now = shared.lifecycle.clock().now();
        let (claim, deadline) = shared.lifecycle.begin_stop()?;

        let generation = claim.generation();
        let detach = Arc::clone(shared);
        let done = Arc::clone(shared);
        let op = RelinkOp::at_or_after(
            "stop",
            shared.lifecycle.clock(),
            deadline,
            Box::new(move || {
                if detach.lifecycle.is_current(generation) {
                    detach.file.detach()
                } else {
                    Ok(())
                }
            }),
        );
        relink::schedule(&shared.file.tee_pad, op, move |result| {
            if done.lifecycle.finish_detach(claim, result) {
                let _ = done.events.send(BranchEvent::DetachFailed);
            }
        });

        log::info!(
            "{}: stopping, post-roll ends in {}",
            self.camera_id(),
            humanize(deadline.saturating_duration_since(now))
        );
        Ok(deadline)
    }

    /// Manual toggle: start when idle, stop when recording, honouring the
    /// same cooldown as automatic decisions.
    pub fn switch_state(&self) -> Result<RecordingState> {
        match self.shared.lifecycle.switch_decision()? {
            Decision::Start => {
                self.start_recording()?;
            }
            Decision::Stop => {
                self.stop_recording()?;
            }
        }
        Ok(self.state())
    }

    /// Handle events from streaming threads and run the finalize watchdog.
    ///
    /// Returns the number of recordings finalized.
    pub fn poll_events(&self) -> usize {
        let mut finalized = 0;
        while let Ok(event) = self.events.try_recv() {
            match event {
                BranchEvent::FileFinalized => self.finalize(false),
                BranchEvent::DetachFailed => self.finalize(true),
            }
            finalized += 1;
        }

        if self.shared.lifecycle.watchdog_expired() {
            log::warn!(
                "{}: no end-of-stream after {}, forcing the file closed",
                self.camera_id(),
                humanize(self.shared.lifecycle.finalize_timeout())
            );
            self.finalize(true);
            finalized += 1;
        }
        finalized
    }

    /// Release the file branch and finish the state walk to `Stopped`.
    fn finalize(&self, forced: bool) {
        let file = &self.shared.file;
        self.shared.lifecycle.retire(forced, || file.park());
    }

    /// Finish any active recording, then stop the graph.
    ///
    /// End-of-stream is sent through the whole graph so the delay line
    /// flushes into the file before it is closed.
    pub fn drain(&self, timeout: Duration) {
        let state = self.state();
        if !state.is_idle() {
            log::info!("{}: finishing {} recording before shutdown", self.camera_id(), state);
            if !self.graph.pipeline().send_event(gst::event::Eos::new()) {
                log::warn!("{}: pipeline refused end-of-stream", self.camera_id());
            }
            match self.events.recv_deadline(Instant::now() + timeout) {
                Ok(BranchEvent::FileFinalized) => self.finalize(false),
                Ok(BranchEvent::DetachFailed) => self.finalize(true),
                Err(_) => {
                    log::warn!(
                        "{}: recording not finalized within {}",
                        self.camera_id(),
                        humanize(timeout)
                    );
                    self.finalize(true);
                }
            }
        }

        if let Err(e) = self.graph.set_state(gst::State::Null) {
            log::error!("{}: failed to stop pipeline: {}", self.camera_id(), e);
        }
        // drops the frame handler and whatever it captured
        self.appsink
            .set_callbacks(gst_app::AppSinkCallbacks::builder().build());
    }
}

impl RecordingSink for StreamBranchController {
    fn begin_start(&self) -> Result<()> {
        self.start_recording().map(|_| ())
    }

    fn begin_stop(&self) -> Result<()> {
        self.stop_recording().map(|_| ())
    }
}

/// rtspsrc exposes one pad per RTP stream once the session is set up;
/// only the video stream is wanted.
fn link_source_pads(source: &Node, downstream: &Node, camera_id: &str) -> Result<()> {
    debug_assert!(source.kind().has_dynamic_pads());
    let sink_pad = downstream.sink_pad()?;
    let camera_id = camera_id.to_string();

    source.element().connect_pad_added(move |_src, pad| {
        if sink_pad.is_linked() {
            return;
        }
        let caps = pad.current_caps().unwrap_or_else(|| pad.query_caps(None));
        let is_video = caps
            .structure(0)
            .and_then(|s| s.get::<&str>("media").ok())
            .map(|media| media == "video")
            .unwrap_or(false);
        if !is_video {
            log::debug!("{}: ignoring source pad {} ({})", camera_id, pad.name(), caps);
            return;
        }
        match graph::link_pads(pad, &sink_pad) {
            Ok(()) => log::info!("{}: linked source pad {}", camera_id, pad.name()),
            Err(e) => log::error!("{}: {}", camera_id, e),
        }
    });
    Ok(())
}

fn install_probes(shared: &Arc<Shared>, app_tee: &Node, sink_queue: &Node) -> Result<()> {
    let counter = Arc::clone(shared);
    app_tee.sink_pad()?.add_probe(gst::PadProbeType::BUFFER, move |_pad, _info| {
        counter.metrics.depayed.fetch_add(1, Ordering::Relaxed);
        gst::PadProbeReturn::Ok
    });

    let counter = Arc::clone(shared);
    sink_queue.src_pad()?.add_probe(gst::PadProbeType::BUFFER, move |_pad, _info| {
        counter.metrics.buffered.fetch_add(1, Ordering::Relaxed);
        gst::PadProbeReturn::Ok
    });

    let counter = Arc::clone(shared);
    shared.file.queue.sink_pad()?.add_probe(gst::PadProbeType::BUFFER, move |_pad, _info| {
        counter.metrics.recorded.fetch_add(1, Ordering::Relaxed);
        gst::PadProbeReturn::Ok
    });

    let events = shared.events.clone();
    shared.file.sink.sink_pad()?.add_probe(gst::PadProbeType::EVENT_DOWNSTREAM, move |_pad, info| {
        if let Some(gst::PadProbeData::Event(ref event)) = info.data {
            if event.type_() == gst::EventType::Eos {
                let _ = events.send(BranchEvent::FileFinalized);
            }
        }
        gst::PadProbeReturn::Ok
    });
    Ok(())
}

fn humanize(d: Duration) -> String {
    format!("{:.1}s", d.as_secs_f64())
}

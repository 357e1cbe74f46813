// Typed graph nodes

use gstreamer as gst;
use gstreamer::prelude::*;
use std::time::Duration;

use super::GraphError;

/// Queue behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Default element limits
    Plain,
    /// Drop the oldest buffers beyond `max_buffers`
    Leaky { max_buffers: u32 },
    /// Hold data back until at least this much is queued, never drop
    Delay(Duration),
}

/// Every element kind the recorder graph is made of.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    RtspSource { location: String, latency_ms: u32 },
    Queue(QueueMode),
    H264Depay,
    H264Parse,
    Tee { allow_not_linked: bool },
    H264Decode,
    VideoConvert,
    /// Raw RGB frames handed to the application
    RgbAppSink,
    Mp4Mux,
    FileSink,
    FakeSink,
}

impl NodeKind {
    pub fn factory(&self) -> &'static str {
        match self {
            NodeKind::RtspSource { .. } => "rtspsrc",
            NodeKind::Queue(_) => "queue",
            NodeKind::H264Depay => "rtph264depay",
            NodeKind::H264Parse => "h264parse",
            NodeKind::Tee { .. } => "tee",
            NodeKind::H264Decode => "avdec_h264",
            NodeKind::VideoConvert => "videoconvert",
            NodeKind::RgbAppSink => "appsink",
            NodeKind::Mp4Mux => "mp4mux",
            NodeKind::FileSink => "filesink",
            NodeKind::FakeSink => "fakesink",
        }
    }

    /// Elements with "sometimes" source pads, linked when the pad appears.
    pub fn has_dynamic_pads(&self) -> bool {
        matches!(self, NodeKind::RtspSource { .. })
    }

    pub fn is_tee(&self) -> bool {
        matches!(self, NodeKind::Tee { .. })
    }

    pub(super) fn build(&self, name: &str) -> Result<gst::Element, GraphError> {
        let builder = gst::ElementFactory::make(self.factory()).name(name);
        let builder = match self {
            NodeKind::RtspSource { location, latency_ms } => builder
                .property("location", location.as_str())
                .property("latency", *latency_ms),
            NodeKind::Queue(QueueMode::Plain) => builder,
            NodeKind::Queue(QueueMode::Leaky { max_buffers }) => builder
                .property_from_str("leaky", "downstream")
                .property("max-size-buffers", *max_buffers)
                .property("max-size-bytes", 0u32)
                .property("max-size-time", 0u64),
            NodeKind::Queue(QueueMode::Delay(hold)) => builder
                .property("min-threshold-time", hold.as_nanos() as u64)
                .property("max-size-buffers", 0u32)
                .property("max-size-bytes", 0u32)
                .property("max-size-time", 0u64),
            // parameter sets with every keyframe, so a branch linked mid-stream can decode
            NodeKind::H264Parse => builder.property("config-interval", -1i32),
            NodeKind::Tee { allow_not_linked } => builder.property("allow-not-linked", *allow_not_linked),
            NodeKind::RgbAppSink => builder
                .property("caps", gst::Caps::builder("video/x-raw").field("format", "RGB").build())
                .property("sync", false)
                .property("max-buffers", 1u32)
                .property("drop", true),
            NodeKind::FileSink => builder.property("async", false),
            NodeKind::FakeSink => builder.property("sync", false),
            NodeKind::H264Depay
            | NodeKind::H264Decode
            | NodeKind::VideoConvert
            | NodeKind::Mp4Mux => builder,
        };

        builder.build().map_err(|e| GraphError::Create {
            factory: self.factory(),
            name: name.to_string(),
            reason: e.to_string(),
        })
    }
}

/// An element in the graph together with its kind.
#[derive(Debug, Clone)]
pub struct Node {
    kind: NodeKind,
    element: gst::Element,
}

impl Node {
    pub(super) fn new(kind: NodeKind, element: gst::Element) -> Self {
        Self { kind, element }
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn element(&self) -> &gst::Element {
        &self.element
    }

    pub fn name(&self) -> String {
        self.element.name().to_string()
    }

    pub fn pad(&self, name: &str) -> Result<gst::Pad, GraphError> {
        self.element.static_pad(name).ok_or_else(|| GraphError::MissingPad {
            node: self.name(),
            pad: name.to_string(),
        })
    }

    pub fn sink_pad(&self) -> Result<gst::Pad, GraphError> {
        self.pad("sink")
    }

    pub fn src_pad(&self) -> Result<gst::Pad, GraphError> {
        self.pad("src")
    }
}

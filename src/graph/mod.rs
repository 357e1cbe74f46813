//! Statically-typed media graph construction
//!
//! Nodes are created from a closed [`NodeKind`] set, and every connection
//! returns a `Result` so a failed link aborts the build instead of leaving
//! a half-wired pipeline.

mod node;

pub use node::{Node, NodeKind, QueueMode};

use gstreamer as gst;
use gstreamer::prelude::*;

/// Error type for graph construction and rewiring
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Failed to create {factory} '{name}': {reason}")]
    Create {
        factory: &'static str,
        name: String,
        reason: String,
    },

    #[error("Failed to add '{0}' to the pipeline")]
    Add(String),

    #[error("Failed to link '{up}' -> '{down}'")]
    Link { up: String, down: String },

    #[error("Failed to link pad {up} -> {down}: {reason}")]
    PadLink {
        up: String,
        down: String,
        reason: String,
    },

    #[error("'{node}' has no pad '{pad}'")]
    MissingPad { node: String, pad: String },

    #[error("'{0}' is not a tee")]
    NotATee(String),

    #[error("GStreamer state error: {0}")]
    StateChange(#[from] gst::StateChangeError),

    #[error("Missing GStreamer element: {0}")]
    MissingPlugin(&'static str),
}

pub type Result<T> = std::result::Result<T, GraphError>;

/// A request pad on a tee, i.e. one fan-out branch
#[derive(Debug, Clone)]
pub struct TeeBranch {
    tee: String,
    pad: gst::Pad,
}

impl TeeBranch {
    pub fn pad(&self) -> &gst::Pad {
        &self.pad
    }

    pub fn tee_name(&self) -> &str {
        &self.tee
    }
}

/// Owns the pipeline the nodes live in.
pub struct Graph {
    pipeline: gst::Pipeline,
}

impl Graph {
    pub fn new(name: &str) -> Self {
        Self {
            pipeline: gst::Pipeline::with_name(name),
        }
    }

    pub fn pipeline(&self) -> &gst::Pipeline {
        &self.pipeline
    }

    pub fn add(&self, name: &str, kind: NodeKind) -> Result<Node> {
        let element = kind.build(name)?;
        self.pipeline
            .add(&element)
            .map_err(|_| GraphError::Add(name.to_string()))?;
        Ok(Node::new(kind, element))
    }

    /// Link `up` to `down` using their always pads.
    pub fn connect(&self, up: &Node, down: &Node) -> Result<()> {
        up.element().link(down.element()).map_err(|_| GraphError::Link {
            up: up.name(),
            down: down.name(),
        })
    }

    /// Link consecutive nodes.
    pub fn chain(&self, nodes: &[&Node]) -> Result<()> {
        for pair in nodes.windows(2) {
            self.connect(pair[0], pair[1])?;
        }
        Ok(())
    }

    /// Request a new source pad from a tee.
    pub fn branch(&self, tee: &Node) -> Result<TeeBranch> {
        if !tee.kind().is_tee() {
            return Err(GraphError::NotATee(tee.name()));
        }
        let pad = tee
            .element()
            .request_pad_simple("src_%u")
            .ok_or_else(|| GraphError::MissingPad {
                node: tee.name(),
                pad: "src_%u".to_string(),
            })?;
        Ok(TeeBranch { tee: tee.name(), pad })
    }

    /// Request a tee branch and link it to `down`.
    pub fn fan_out(&self, tee: &Node, down: &Node) -> Result<TeeBranch> {
        let branch = self.branch(tee)?;
        link_pads(branch.pad(), &down.sink_pad()?)?;
        Ok(branch)
    }

    pub fn set_state(&self, state: gst::State) -> Result<gst::StateChangeSuccess> {
        Ok(self.pipeline.set_state(state)?)
    }

    pub fn bus(&self) -> Option<gst::Bus> {
        self.pipeline.bus()
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

pub fn link_pads(up: &gst::Pad, down: &gst::Pad) -> Result<()> {
    up.link(down).map(|_| ()).map_err(|e| GraphError::PadLink {
        up: pad_path(up),
        down: pad_path(down),
        reason: format!("{:?}", e),
    })
}

pub fn unlink_pads(up: &gst::Pad, down: &gst::Pad) -> Result<()> {
    up.unlink(down).map_err(|e| GraphError::PadLink {
        up: pad_path(up),
        down: pad_path(down),
        reason: e.to_string(),
    })
}

/// Fail early with the name of the first missing element factory.
pub fn check_plugins(kinds: &[NodeKind]) -> Result<()> {
    for kind in kinds {
        if gst::ElementFactory::find(kind.factory()).is_none() {
            return Err(GraphError::MissingPlugin(kind.factory()));
        }
    }
    Ok(())
}

fn pad_path(pad: &gst::Pad) -> String {
    match pad.parent_element() {
        Some(parent) => format!("{}:{}", parent.name(), pad.name()),
        None => pad.name().to_string(),
    }
}

// Deferred graph surgery
//
// A relink is a condition that is polled on every buffer crossing a pad and
// an action that runs once, at the next moment the pad is idle, after the
// condition first holds.

use gstreamer as gst;
use gstreamer::prelude::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

use super::branch::BranchError;
use crate::clock::Clock;

pub type Condition = Box<dyn FnMut() -> bool + Send>;
pub type Action = Box<dyn FnOnce() -> Result<(), BranchError> + Send>;

/// A pending relink: `cond` may be evaluated many times, `action` runs once.
pub struct RelinkOp {
    label: &'static str,
    cond: Condition,
    action: Action,
}

impl RelinkOp {
    pub fn new(label: &'static str, cond: Condition, action: Action) -> Self {
        Self { label, cond, action }
    }

    /// Runs at the first idle point.
    pub fn immediate(label: &'static str, action: Action) -> Self {
        Self::new(label, Box::new(|| true), action)
    }

    /// Runs at the first idle point once `clock` reaches `deadline`.
    pub fn at_or_after(label: &'static str, clock: Arc<dyn Clock>, deadline: Instant, action: Action) -> Self {
        Self::new(label, Box::new(move || clock.now() >= deadline), action)
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn is_ready(&mut self) -> bool {
        (self.cond)()
    }

    /// Run the action. Consumes the operation.
    pub fn fire(self) -> Result<(), BranchError> {
        (self.action)()
    }
}

type Completion = Box<dyn FnOnce(Result<(), BranchError>) + Send>;

/// An armed [`RelinkOp`] together with whoever waits for its result.
///
/// Shared between the probes of one pad; the action and the completion run
/// at most once no matter how many probes race for it.
pub struct PendingRelink {
    slot: Mutex<Option<(RelinkOp, Completion)>>,
}

impl PendingRelink {
    pub fn new<F>(op: RelinkOp, done: F) -> Self
    where
        F: FnOnce(Result<(), BranchError>) + Send + 'static,
    {
        Self {
            slot: Mutex::new(Some((op, Box::new(done)))),
        }
    }

    /// Evaluate the condition. Always false once the action has run.
    pub fn is_ready(&self) -> bool {
        self.slot.lock().as_mut().map(|(op, _)| op.is_ready()).unwrap_or(false)
    }

    pub fn has_run(&self) -> bool {
        self.slot.lock().is_none()
    }

    /// Run the action and hand its result to the completion. Returns false
    /// if an earlier call already did.
    pub fn run(&self) -> bool {
        let Some((op, done)) = self.slot.lock().take() else {
            return false;
        };
        let label = op.label();
        let result = op.fire();
        if let Err(ref e) = result {
            log::error!("Relink '{}' failed: {}", label, e);
        }
        done(result);
        true
    }
}

/// Arm `op` on `pad`: its condition is checked on every buffer, and once
/// it holds the action runs from an idle probe. `done` receives the
/// action's result on the streaming thread that ran it.
pub fn schedule<F>(pad: &gst::Pad, op: RelinkOp, done: F)
where
    F: FnOnce(Result<(), BranchError>) + Send + 'static,
{
    let label = op.label();
    let pending = Arc::new(PendingRelink::new(op, done));

    if pending.is_ready() {
        log::debug!("Relink '{}' ready, waiting for idle pad {}", label, pad.name());
        arm_idle(pad, pending);
        return;
    }

    log::debug!("Relink '{}' deferred on pad {}", label, pad.name());
    pad.add_probe(gst::PadProbeType::BUFFER, move |pad, _info| {
        if pending.has_run() {
            return gst::PadProbeReturn::Remove;
        }
        if pending.is_ready() {
            arm_idle(pad, Arc::clone(&pending));
            gst::PadProbeReturn::Remove
        } else {
            gst::PadProbeReturn::Ok
        }
    });
}

fn arm_idle(pad: &gst::Pad, pending: Arc<PendingRelink>) {
    pad.add_probe(gst::PadProbeType::IDLE, move |_pad, _info| {
        pending.run();
        gst::PadProbeReturn::Remove
    });
}

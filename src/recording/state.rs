// Shared recording state and its transition rules

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// Lifecycle of the switchable recording branch.
///
/// The only legal walk is
/// `NotStarted -> Starting -> Recording -> Stopping -> Stopped -> NotStarted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordingState {
    NotStarted,
    Starting,
    Recording,
    Stopping,
    Stopped,
}

impl RecordingState {
    pub fn next(self) -> Self {
        match self {
            Self::NotStarted => Self::Starting,
            Self::Starting => Self::Recording,
            Self::Recording => Self::Stopping,
            Self::Stopping => Self::Stopped,
            Self::Stopped => Self::NotStarted,
        }
    }

    /// Nothing is written and a new recording may begin.
    pub fn is_idle(self) -> bool {
        matches!(self, Self::NotStarted | Self::Stopped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Starting => "starting",
            Self::Recording => "recording",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for RecordingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Illegal recording transition from {actual} (expected {expected})")]
    Unexpected {
        expected: RecordingState,
        actual: RecordingState,
    },
}

/// Point-in-time copy of the cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSnapshot {
    pub state: RecordingState,
    /// When the current or last recording was decided
    pub recording_since: Option<Instant>,
    /// When the last stop was decided
    pub last_stop_at: Option<Instant>,
}

const HISTORY_LIMIT: usize = 64;

struct Inner {
    state: RecordingState,
    recording_since: Option<Instant>,
    last_stop_at: Option<Instant>,
    history: VecDeque<(RecordingState, RecordingState)>,
}

/// The single source of truth for [`RecordingState`] and the decision
/// timestamps the cooldown is measured from.
///
/// Shared between the detection thread, graph streaming threads and the
/// control loop; every mutation is a compare-and-advance under one lock.
pub struct StateCell {
    camera_id: String,
    inner: Mutex<Inner>,
}

impl StateCell {
    pub fn new(camera_id: impl Into<String>) -> Self {
        Self {
            camera_id: camera_id.into(),
            inner: Mutex::new(Inner {
                state: RecordingState::NotStarted,
                recording_since: None,
                last_stop_at: None,
                history: VecDeque::with_capacity(HISTORY_LIMIT),
            }),
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn get(&self) -> RecordingState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.inner.lock();
        StateSnapshot {
            state: inner.state,
            recording_since: inner.recording_since,
            last_stop_at: inner.last_stop_at,
        }
    }

    /// Move from `expected` to `expected.next()`.
    ///
    /// Entering `Starting` stamps the recording start, entering `Stopping`
    /// stamps the stop decision.
    pub fn advance(&self, expected: RecordingState, now: Instant) -> Result<RecordingState, TransitionError> {
        let mut inner = self.inner.lock();
        if inner.state != expected {
            return Err(TransitionError::Unexpected {
                expected,
                actual: inner.state,
            });
        }
        let to = expected.next();
        match to {
            RecordingState::Starting => inner.recording_since = Some(now),
            RecordingState::Stopping => inner.last_stop_at = Some(now),
            _ => {}
        }
        Self::record(&mut inner, expected, to);
        drop(inner);

        log::info!("{}: {} -> {}", self.camera_id, expected, to);
        Ok(to)
    }

    /// Undo a transition: move from `current` back to `to`, bypassing the
    /// table. Does nothing unless the cell still holds `current`.
    ///
    /// Returns whether the state changed.
    pub fn rollback_from(&self, current: RecordingState, to: RecordingState) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != current || current == to {
            return false;
        }
        Self::record(&mut inner, current, to);
        drop(inner);

        log::warn!("{}: rolled back {} -> {}", self.camera_id, current, to);
        true
    }

    /// Transitions taken so far, oldest first (bounded).
    pub fn history(&self) -> Vec<(RecordingState, RecordingState)> {
        self.inner.lock().history.iter().copied().collect()
    }

    fn record(inner: &mut Inner, from: RecordingState, to: RecordingState) {
        inner.state = to;
        if inner.history.len() == HISTORY_LIMIT {
            inner.history.pop_front();
        }
        inner.history.push_back((from, to));
    }
}

/// Minimum spacing between opposite decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cooldown {
    min: Duration,
}

impl Cooldown {
    pub fn new(min: Duration) -> Self {
        Self { min }
    }

    pub fn duration(&self) -> Duration {
        self.min
    }

    /// Time left before a start is allowed; zero when allowed now.
    pub fn start_wait(&self, snapshot: &StateSnapshot, now: Instant) -> Duration {
        Self::remaining(self.min, snapshot.last_stop_at, now)
    }

    /// Time left before a stop is allowed; zero when allowed now.
    pub fn stop_wait(&self, snapshot: &StateSnapshot, now: Instant) -> Duration {
        Self::remaining(self.min, snapshot.recording_since, now)
    }

    pub fn allows_start(&self, snapshot: &StateSnapshot, now: Instant) -> bool {
        self.start_wait(snapshot, now).is_zero()
    }

    pub fn allows_stop(&self, snapshot: &StateSnapshot, now: Instant) -> bool {
        self.stop_wait(snapshot, now).is_zero()
    }

    fn remaining(min: Duration, since: Option<Instant>, now: Instant) -> Duration {
        since
            .map(|t| min.saturating_sub(now.saturating_duration_since(t)))
            .unwrap_or(Duration::ZERO)
    }
}

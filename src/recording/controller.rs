// Hysteresis recording controller
//
// Turns a noisy per-frame "objects present" signal into debounced start and
// stop requests for the recording branch.

use image::RgbImage;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use super::branch::BranchError;
use super::snapshot::SnapshotWriter;
use super::state::{Cooldown, RecordingState, StateCell};
use crate::clock::Clock;
use crate::detection::Detection;

/// Length of the presence history
pub const HISTORY_LEN: usize = 30;

/// Whatever performs the recording once a decision is made.
///
/// Implementations advance the shared [`StateCell`] themselves. On `Err`
/// the controller undoes the transition the call made; refusals
/// ([`BranchError::is_refusal`]) made none and are left alone.
pub trait RecordingSink: Send + Sync {
    fn begin_start(&self) -> Result<(), BranchError>;
    fn begin_stop(&self) -> Result<(), BranchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HysteresisConfig {
    /// Trailing positive frames needed to start
    pub start_threshold: usize,
    /// Trailing negative frames needed to stop
    pub stop_threshold: usize,
    pub cooldown: Duration,
}

impl Default for HysteresisConfig {
    fn default() -> Self {
        Self {
            start_threshold: 5,
            stop_threshold: 10,
            cooldown: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Start,
    Stop,
}

pub struct RecordingController {
    history: VecDeque<bool>,
    config: HysteresisConfig,
    cooldown: Cooldown,
    state: Arc<StateCell>,
    sink: Arc<dyn RecordingSink>,
    clock: Arc<dyn Clock>,
    snapshots: Option<SnapshotWriter>,
}

impl RecordingController {
    pub fn new(
        config: HysteresisConfig,
        state: Arc<StateCell>,
        sink: Arc<dyn RecordingSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            history: VecDeque::from(vec![false; HISTORY_LEN]),
            cooldown: Cooldown::new(config.cooldown),
            config,
            state,
            sink,
            clock,
            snapshots: None,
        }
    }

    /// Save an annotated preview whenever a start is issued.
    pub fn with_snapshots(mut self, writer: SnapshotWriter) -> Self {
        self.snapshots = Some(writer);
        self
    }

    pub fn state(&self) -> RecordingState {
        self.state.get()
    }

    /// Feed one frame's presence flag.
    ///
    /// Returns the decision handed to the sink, if any and if the sink
    /// accepted it.
    pub fn update(&mut self, objects_detected: bool) -> Option<Decision> {
        self.step(objects_detected, None)
    }

    /// Like [`update`](Self::update); the frame and boxes are used for the
    /// preview snapshot if a start is issued.
    pub fn update_frame(&mut self, frame: &RgbImage, boxes: &[Detection]) -> Option<Decision> {
        self.step(!boxes.is_empty(), Some((frame, boxes)))
    }

    fn step(&mut self, objects_detected: bool, preview: Option<(&RgbImage, &[Detection])>) -> Option<Decision> {
        self.history.pop_front();
        self.history.push_back(objects_detected);

        let now = self.clock.now();
        let snap = self.state.snapshot();

        if snap.state.is_idle() && self.trailing(self.config.start_threshold, true) {
            if !self.cooldown.allows_start(&snap, now) {
                log::debug!(
                    "{}: start suppressed, cooldown {:?} left",
                    self.state.camera_id(),
                    self.cooldown.start_wait(&snap, now)
                );
                return None;
            }
            if let Some((frame, boxes)) = preview {
                self.save_preview(frame, boxes);
            }
            return match self.sink.begin_start() {
                Ok(()) => Some(Decision::Start),
                Err(e) if e.is_refusal() => {
                    log::warn!("{}: start refused: {}", self.state.camera_id(), e);
                    None
                }
                Err(e) => {
                    log::error!("{}: failed to start recording: {}", self.state.camera_id(), e);
                    self.state
                        .rollback_from(RecordingState::Starting, RecordingState::NotStarted);
                    None
                }
            };
        }

        if snap.state == RecordingState::Recording && self.trailing(self.config.stop_threshold, false) {
            if !self.cooldown.allows_stop(&snap, now) {
                log::debug!(
                    "{}: stop suppressed, cooldown {:?} left",
                    self.state.camera_id(),
                    self.cooldown.stop_wait(&snap, now)
                );
                return None;
            }
            return match self.sink.begin_stop() {
                Ok(()) => Some(Decision::Stop),
                Err(e) if e.is_refusal() => {
                    log::warn!("{}: stop refused: {}", self.state.camera_id(), e);
                    None
                }
                Err(e) => {
                    log::error!("{}: failed to stop recording: {}", self.state.camera_id(), e);
                    self.state
                        .rollback_from(RecordingState::Stopping, RecordingState::Recording);
                    None
                }
            };
        }

        None
    }

    fn trailing(&self, n: usize, value: bool) -> bool {
        n > 0 && n <= self.history.len() && self.history.iter().rev().take(n).all(|&v| v == value)
    }

    fn save_preview(&mut self, frame: &RgbImage, boxes: &[Detection]) {
        if let Some(writer) = self.snapshots.as_mut() {
            match writer.save(frame, boxes) {
                Ok(path) => log::info!("Saved preview {}", path.display()),
                Err(e) => log::warn!("Failed to save preview: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use parking_lot::Mutex;

    /// Completes every request synchronously unless told to fail.
    struct FakeSink {
        state: Arc<StateCell>,
        clock: Arc<ManualClock>,
        calls: Mutex<Vec<Decision>>,
        fail_next: Mutex<bool>,
    }

    impl FakeSink {
        fn new(state: Arc<StateCell>, clock: Arc<ManualClock>) -> Arc<Self> {
            Arc::new(Self {
                state,
                clock,
                calls: Mutex::new(Vec::new()),
                fail_next: Mutex::new(false),
            })
        }

        fn calls(&self) -> Vec<Decision> {
            self.calls.lock().clone()
        }

        fn fail(&self) -> Result<(), BranchError> {
            if std::mem::take(&mut *self.fail_next.lock()) {
                Err(BranchError::Link("link refused".into()))
            } else {
                Ok(())
            }
        }
    }

    impl RecordingSink for FakeSink {
        fn begin_start(&self) -> Result<(), BranchError> {
            self.calls.lock().push(Decision::Start);
            let now = self.clock.now();
            if self.state.get() == RecordingState::Stopped {
                self.state.advance(RecordingState::Stopped, now)?;
            }
            self.state.advance(RecordingState::NotStarted, now)?;
            self.fail()?;
            self.state.advance(RecordingState::Starting, now)?;
            Ok(())
        }

        fn begin_stop(&self) -> Result<(), BranchError> {
            self.calls.lock().push(Decision::Stop);
            let now = self.clock.now();
            self.state.advance(RecordingState::Recording, now)?;
            self.fail()?;
            self.state.advance(RecordingState::Stopping, now)?;
            Ok(())
        }
    }

    struct Harness {
        clock: Arc<ManualClock>,
        state: Arc<StateCell>,
        sink: Arc<FakeSink>,
        controller: RecordingController,
    }

    fn harness(config: HysteresisConfig) -> Harness {
        let clock = Arc::new(ManualClock::new());
        let state = Arc::new(StateCell::new("test-cam"));
        let sink = FakeSink::new(state.clone(), clock.clone());
        let controller = RecordingController::new(config, state.clone(), sink.clone(), clock.clone());
        Harness {
            clock,
            state,
            sink,
            controller,
        }
    }

    impl Harness {
        /// Feed flags, advancing the clock 1s before each.
        fn feed(&mut self, flags: &[bool]) -> Vec<Option<Decision>> {
            flags
                .iter()
                .map(|&f| {
                    self.clock.advance(Duration::from_secs(1));
                    self.controller.update(f)
                })
                .collect()
        }
    }

    #[test]
    fn history_starts_full_of_negatives() {
        let h = harness(HysteresisConfig::default());
        assert_eq!(h.controller.history.len(), HISTORY_LEN);
        assert!(h.controller.history.iter().all(|&v| !v));
    }

    #[test]
    fn five_positives_start_exactly_once() {
        let mut h = harness(HysteresisConfig::default());
        let out = h.feed(&[true; 4]);
        assert!(out.iter().all(Option::is_none));

        assert_eq!(h.feed(&[true]), vec![Some(Decision::Start)]);
        assert_eq!(h.state.get(), RecordingState::Recording);

        // further positives while recording issue nothing
        assert!(h.feed(&[true; 10]).iter().all(Option::is_none));
        assert_eq!(h.sink.calls(), vec![Decision::Start]);
    }

    #[test]
    fn interrupted_streak_does_not_start() {
        let mut h = harness(HysteresisConfig::default());
        let out = h.feed(&[true, true, true, true, false, true, true, true, true]);
        assert!(out.iter().all(Option::is_none));
        assert!(h.sink.calls().is_empty());
    }

    #[test]
    fn stop_needs_ten_negatives() {
        let mut h = harness(HysteresisConfig::default());
        h.feed(&[true; 5]);
        h.clock.advance(Duration::from_secs(10));

        assert!(h.feed(&[false; 9]).iter().all(Option::is_none));
        assert_eq!(h.feed(&[false]), vec![Some(Decision::Stop)]);
        assert_eq!(h.state.get(), RecordingState::Stopped);
        assert_eq!(h.sink.calls(), vec![Decision::Start, Decision::Stop]);
    }

    #[test]
    fn stop_waits_for_cooldown() {
        let mut h = harness(HysteresisConfig {
            stop_threshold: 2,
            ..HysteresisConfig::default()
        });
        h.feed(&[true; 5]);

        // 1s and 2s after the start decision
        assert_eq!(h.feed(&[false, false]), vec![None, None]);
        // 3s, 4s
        assert_eq!(h.feed(&[false, false]), vec![None, None]);
        // 5s after start
        assert_eq!(h.feed(&[false]), vec![Some(Decision::Stop)]);
    }

    #[test]
    fn restart_waits_for_cooldown_after_stop() {
        let mut h = harness(HysteresisConfig {
            stop_threshold: 1,
            cooldown: Duration::from_secs(5),
            ..HysteresisConfig::default()
        });
        h.feed(&[true; 5]);
        h.clock.advance(Duration::from_secs(5));
        assert_eq!(h.feed(&[false]), vec![Some(Decision::Stop)]);

        // positives resume immediately; the first four cannot qualify anyway
        let out = h.feed(&[true; 4]);
        assert!(out.iter().all(Option::is_none));
        // 5th positive is exactly 5s after the stop decision
        assert_eq!(h.feed(&[true]), vec![Some(Decision::Start)]);

        let history = h.state.history();
        assert_eq!(history.first(), Some(&(RecordingState::NotStarted, RecordingState::Starting)));
        assert!(history.contains(&(RecordingState::Stopped, RecordingState::NotStarted)));
    }

    #[test]
    fn restart_inside_cooldown_is_suppressed() {
        let mut h = harness(HysteresisConfig {
            start_threshold: 1,
            stop_threshold: 1,
            cooldown: Duration::from_secs(5),
        });
        h.feed(&[true]);
        h.clock.advance(Duration::from_secs(5));
        assert_eq!(h.feed(&[false]), vec![Some(Decision::Stop)]);

        assert_eq!(h.feed(&[true, true, true, true]), vec![None; 4]);
        assert_eq!(h.feed(&[true]), vec![Some(Decision::Start)]);
    }

    #[test]
    fn failed_start_rolls_back_and_retries() {
        let mut h = harness(HysteresisConfig::default());
        *h.sink.fail_next.lock() = true;

        h.feed(&[true; 4]);
        assert_eq!(h.feed(&[true]), vec![None]);
        assert_eq!(h.state.get(), RecordingState::NotStarted);

        assert_eq!(h.feed(&[true]), vec![Some(Decision::Start)]);
        assert_eq!(h.state.get(), RecordingState::Recording);
    }

    #[test]
    fn failed_stop_rolls_back_to_recording() {
        let mut h = harness(HysteresisConfig::default());
        h.feed(&[true; 5]);
        h.clock.advance(Duration::from_secs(10));

        *h.sink.fail_next.lock() = true;
        h.feed(&[false; 9]);
        assert_eq!(h.feed(&[false]), vec![None]);
        assert_eq!(h.state.get(), RecordingState::Recording);

        assert_eq!(h.feed(&[false]), vec![Some(Decision::Stop)]);
    }

    #[test]
    fn snapshot_failure_does_not_block_start() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let mut h = harness(HysteresisConfig::default());
        h.controller = RecordingController::new(
            HysteresisConfig::default(),
            h.state.clone(),
            h.sink.clone(),
            h.clock.clone(),
        )
        .with_snapshots(SnapshotWriter::new(blocker.join("previews"), "preview"));

        let frame = RgbImage::new(8, 8);
        let boxes = [Detection::new(1.0, 1.0, 5.0, 5.0, 16.0)];
        let mut decisions = Vec::new();
        for _ in 0..5 {
            h.clock.advance(Duration::from_secs(1));
            decisions.push(h.controller.update_frame(&frame, &boxes));
        }
        assert_eq!(decisions.last(), Some(&Some(Decision::Start)));
    }

    #[test]
    fn snapshot_is_written_on_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(HysteresisConfig::default());
        h.controller = RecordingController::new(
            HysteresisConfig::default(),
            h.state.clone(),
            h.sink.clone(),
            h.clock.clone(),
        )
        .with_snapshots(SnapshotWriter::new(dir.path(), "preview"));

        let frame = RgbImage::new(8, 8);
        let boxes = [Detection::new(1.0, 1.0, 5.0, 5.0, 16.0)];
        for _ in 0..5 {
            h.controller.update_frame(&frame, &boxes);
        }
        let written = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(written, 1);
    }

    /// Another thread wins the relink slot just before this controller asks.
    struct LostRaceSink {
        state: Arc<StateCell>,
        clock: Arc<ManualClock>,
    }

    impl RecordingSink for LostRaceSink {
        fn begin_start(&self) -> Result<(), BranchError> {
            self.state.advance(RecordingState::NotStarted, self.clock.now())?;
            Err(BranchError::RelinkPending)
        }

        fn begin_stop(&self) -> Result<(), BranchError> {
            self.state.advance(RecordingState::Recording, self.clock.now())?;
            Err(BranchError::Busy(RecordingState::Stopping))
        }
    }

    #[test]
    fn refused_start_keeps_the_winners_state() {
        let clock = Arc::new(ManualClock::new());
        let state = Arc::new(StateCell::new("test-cam"));
        let sink = Arc::new(LostRaceSink {
            state: state.clone(),
            clock: clock.clone(),
        });
        let mut controller =
            RecordingController::new(HysteresisConfig::default(), state.clone(), sink, clock.clone());

        let decisions: Vec<_> = (0..5).map(|_| controller.update(true)).collect();
        assert_eq!(decisions.last(), Some(&None));
        assert_eq!(state.get(), RecordingState::Starting);
        assert_eq!(state.history(), vec![(RecordingState::NotStarted, RecordingState::Starting)]);
    }

    #[test]
    fn refused_stop_keeps_the_winners_state() {
        let clock = Arc::new(ManualClock::new());
        let state = Arc::new(StateCell::new("test-cam"));
        let now = clock.now();
        state.advance(RecordingState::NotStarted, now).unwrap();
        state.advance(RecordingState::Starting, now).unwrap();
        let sink = Arc::new(LostRaceSink {
            state: state.clone(),
            clock: clock.clone(),
        });
        let mut controller =
            RecordingController::new(HysteresisConfig::default(), state.clone(), sink, clock.clone());

        clock.advance(Duration::from_secs(10));
        let decisions: Vec<_> = (0..10).map(|_| controller.update(false)).collect();
        assert_eq!(decisions.last(), Some(&None));
        assert_eq!(state.get(), RecordingState::Stopping);
    }
}

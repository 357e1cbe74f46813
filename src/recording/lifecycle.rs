// Recording branch bookkeeping
//
// Everything the stream branch controller decides without touching the
// graph: the single relink claim, finalize generations, stop deadlines, the
// finalize watchdog and the state walk around one recording.

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::branch::{BranchError, Result};
use super::controller::Decision;
use super::state::{Cooldown, RecordingState, StateCell};
use crate::clock::Clock;

/// `recording-{counter}-date-{YYYYMMDDTHHMMSS}.mp4`
pub fn recording_file_name(counter: u64, at: DateTime<Local>) -> String {
    format!("recording-{}-date-{}.mp4", counter, at.format("%Y%m%dT%H%M%S"))
}

/// Point in time at which a stop decided at `now` detaches the file branch.
pub fn stop_deadline(now: Instant, buffer: Duration) -> Instant {
    now + buffer * 2
}

/// Proof of holding the one pending-relink slot.
///
/// Released with [`BranchLifecycle::release`]; a claim retired by a
/// finalize releases nothing.
#[derive(Debug, PartialEq, Eq)]
pub struct RelinkClaim {
    id: u64,
    generation: u64,
}

impl RelinkClaim {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug, Clone, Copy)]
struct Held {
    id: u64,
    generation: u64,
}

pub struct BranchLifecycle {
    state: Arc<StateCell>,
    clock: Arc<dyn Clock>,
    buffer: Duration,
    cooldown: Cooldown,
    finalize_timeout: Duration,
    claim: Mutex<Option<Held>>,
    next_claim: AtomicU64,
    /// Bumped on every finalize so stale stop relinks become no-ops
    generation: AtomicU64,
    recordings: AtomicU64,
    current_file: Mutex<Option<PathBuf>>,
    /// Reference point for the finalize watchdog
    awaiting_since: Mutex<Option<Instant>>,
}

impl BranchLifecycle {
    pub fn new(
        state: Arc<StateCell>,
        clock: Arc<dyn Clock>,
        buffer: Duration,
        cooldown: Duration,
        finalize_timeout: Duration,
    ) -> Self {
        Self {
            state,
            clock,
            buffer,
            cooldown: Cooldown::new(cooldown),
            finalize_timeout,
            claim: Mutex::new(None),
            next_claim: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            recordings: AtomicU64::new(0),
            current_file: Mutex::new(None),
            awaiting_since: Mutex::new(None),
        }
    }

    pub fn camera_id(&self) -> &str {
        self.state.camera_id()
    }

    pub fn state(&self) -> RecordingState {
        self.state.get()
    }

    pub fn state_cell(&self) -> Arc<StateCell> {
        Arc::clone(&self.state)
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn buffer(&self) -> Duration {
        self.buffer
    }

    pub fn current_file(&self) -> Option<PathBuf> {
        self.current_file.lock().clone()
    }

    pub fn is_pending(&self) -> bool {
        self.claim.lock().is_some()
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    /// Take the pending-relink slot, refusing while another relink holds it.
    pub fn claim(&self) -> Result<RelinkClaim> {
        let mut held = self.claim.lock();
        if held.is_some() {
            return Err(BranchError::RelinkPending);
        }
        let claim = RelinkClaim {
            id: self.next_claim.fetch_add(1, Ordering::Relaxed),
            generation: self.generation.load(Ordering::Acquire),
        };
        *held = Some(Held {
            id: claim.id,
            generation: claim.generation,
        });
        Ok(claim)
    }

    /// Give the slot back if `claim` still holds it.
    pub fn release(&self, claim: &RelinkClaim) -> bool {
        let mut held = self.claim.lock();
        match *held {
            Some(h) if h.id == claim.id => {
                *held = None;
                true
            }
            _ => false,
        }
    }

    /// Claim the slot, name the next file and walk the state to `Starting`.
    pub fn begin_start(&self, output_dir: &Path) -> Result<(RelinkClaim, PathBuf)> {
        let claim = self.claim()?;
        match self.enter_starting(output_dir) {
            Ok(path) => {
                *self.current_file.lock() = Some(path.clone());
                Ok((claim, path))
            }
            Err(e) => {
                self.release(&claim);
                Err(e)
            }
        }
    }

    fn enter_starting(&self, output_dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(output_dir)?;
        let now = self.clock.now();
        if self.state.get() == RecordingState::Stopped {
            self.state.advance(RecordingState::Stopped, now)?;
        }
        self.state.advance(RecordingState::NotStarted, now)?;
        let n = self.recordings.fetch_add(1, Ordering::Relaxed);
        Ok(output_dir.join(recording_file_name(n, Local::now())))
    }

    /// Outcome of the start relink. On failure the caller has already
    /// parked the branch.
    pub fn finish_start(&self, claim: RelinkClaim, result: Result<()>) {
        match result {
            Ok(()) => {
                if let Err(e) = self.state.advance(RecordingState::Starting, self.clock.now()) {
                    log::warn!("{}: branch attached but {}", self.camera_id(), e);
                }
            }
            Err(e) => {
                log::error!("{}: could not attach recording branch: {}", self.camera_id(), e);
                self.current_file.lock().take();
                self.state
                    .rollback_from(RecordingState::Starting, RecordingState::NotStarted);
            }
        }
        self.release(&claim);
    }

    /// Claim the slot and move to `Stopping`. Returns the detach deadline.
    pub fn begin_stop(&self) -> Result<(RelinkClaim, Instant)> {
        let claim = self.claim()?;
        let now = self.clock.now();
        if let Err(e) = self.state.advance(RecordingState::Recording, now) {
            self.release(&claim);
            return Err(e.into());
        }
        let deadline = stop_deadline(now, self.buffer);
        *self.awaiting_since.lock() = Some(deadline);
        Ok((claim, deadline))
    }

    /// Outcome of the stop relink. Returns true when the control loop has to
    /// be told the detach failed.
    pub fn finish_detach(&self, claim: RelinkClaim, result: Result<()>) -> bool {
        let current = self.is_current(claim.generation);
        self.release(&claim);
        if !current {
            log::debug!("{}: ignoring stale stop relink", self.camera_id());
            return false;
        }
        match result {
            Ok(()) => {
                *self.awaiting_since.lock() = Some(self.clock.now());
                log::info!("{}: recording branch detached, waiting for end-of-stream", self.camera_id());
                false
            }
            Err(e) => {
                log::error!("{}: could not detach recording branch: {}", self.camera_id(), e);
                true
            }
        }
    }

    /// What a manual toggle would do now, after the cooldown.
    pub fn switch_decision(&self) -> Result<Decision> {
        let now = self.clock.now();
        let snap = self.state.snapshot();
        let (decision, wait) = match snap.state {
            s if s.is_idle() => (Decision::Start, self.cooldown.start_wait(&snap, now)),
            RecordingState::Recording => (Decision::Stop, self.cooldown.stop_wait(&snap, now)),
            other => return Err(BranchError::Busy(other)),
        };
        if !wait.is_zero() {
            return Err(BranchError::CoolingDown(wait));
        }
        Ok(decision)
    }

    /// A stopping recording has waited too long for end-of-stream.
    pub fn watchdog_expired(&self) -> bool {
        if self.state.get() != RecordingState::Stopping {
            return false;
        }
        match *self.awaiting_since.lock() {
            Some(since) => self.clock.now().saturating_duration_since(since) > self.finalize_timeout,
            None => false,
        }
    }

    pub fn finalize_timeout(&self) -> Duration {
        self.finalize_timeout
    }

    /// Close out the current recording: retire the generation, `park` the
    /// branch, drop any claim and finish the state walk.
    ///
    /// Returns the file that was being written, if any.
    pub fn retire<F>(&self, forced: bool, park: F) -> Option<PathBuf>
    where
        F: FnOnce() -> Result<()>,
    {
        self.generation.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = park() {
            log::error!("{}: could not release recording branch: {}", self.camera_id(), e);
        }
        self.claim.lock().take();
        self.awaiting_since.lock().take();

        let now = self.clock.now();
        let walk = match self.state.get() {
            RecordingState::Recording => self
                .state
                .advance(RecordingState::Recording, now)
                .and_then(|_| self.state.advance(RecordingState::Stopping, now)),
            RecordingState::Stopping => self.state.advance(RecordingState::Stopping, now),
            RecordingState::Starting => {
                self.state
                    .rollback_from(RecordingState::Starting, RecordingState::NotStarted);
                Ok(RecordingState::NotStarted)
            }
            other => Ok(other),
        };
        if let Err(e) = walk {
            log::warn!("{}: {}", self.camera_id(), e);
        }

        let file = self.current_file.lock().take();
        match &file {
            Some(path) if forced => {
                log::warn!("{}: recording {} may be truncated", self.camera_id(), path.display())
            }
            Some(path) => log::info!("{}: finalized {}", self.camera_id(), path.display()),
            None => {}
        }
        file
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use RecordingState::*;

    const BUFFER: Duration = Duration::from_secs(3);
    const COOLDOWN: Duration = Duration::from_secs(5);
    const TIMEOUT: Duration = Duration::from_secs(10);

    struct Fixture {
        dir: tempfile::TempDir,
        clock: Arc<ManualClock>,
        lifecycle: BranchLifecycle,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new());
        let lifecycle = BranchLifecycle::new(
            Arc::new(StateCell::new("cam")),
            clock.clone(),
            BUFFER,
            COOLDOWN,
            TIMEOUT,
        );
        Fixture {
            dir: tempfile::tempdir().unwrap(),
            clock,
            lifecycle,
        }
    }

    impl Fixture {
        fn start(&self) -> PathBuf {
            let (claim, path) = self.lifecycle.begin_start(self.dir.path()).unwrap();
            self.lifecycle.finish_start(claim, Ok(()));
            path
        }
    }

    #[test]
    fn file_names_carry_counter_and_basic_iso_time() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 17, 5, 42).unwrap();
        assert_eq!(recording_file_name(0, at), "recording-0-date-20240309T170542.mp4");
        assert_eq!(recording_file_name(12, at), "recording-12-date-20240309T170542.mp4");
    }

    #[test]
    fn stop_deadline_is_twice_the_buffer() {
        let now = Instant::now();
        assert_eq!(stop_deadline(now, BUFFER) - now, Duration::from_secs(6));
    }

    #[test]
    fn second_relink_is_refused_while_one_is_pending() {
        let f = fixture();
        let (claim, _) = f.lifecycle.begin_start(f.dir.path()).unwrap();
        assert_eq!(f.lifecycle.state(), Starting);

        assert!(matches!(f.lifecycle.claim(), Err(BranchError::RelinkPending)));
        assert!(matches!(
            f.lifecycle.begin_start(f.dir.path()),
            Err(BranchError::RelinkPending)
        ));
        assert_eq!(f.lifecycle.state(), Starting);

        f.lifecycle.finish_start(claim, Ok(()));
        assert_eq!(f.lifecycle.state(), Recording);
        assert!(!f.lifecycle.is_pending());
    }

    #[test]
    fn failed_attach_rolls_back_and_frees_the_slot() {
        let f = fixture();
        let (claim, _) = f.lifecycle.begin_start(f.dir.path()).unwrap();
        f.lifecycle
            .finish_start(claim, Err(BranchError::Link("tee pad busy".into())));

        assert_eq!(f.lifecycle.state(), NotStarted);
        assert_eq!(f.lifecycle.current_file(), None);
        assert!(!f.lifecycle.is_pending());
    }

    #[test]
    fn consecutive_recordings_get_new_file_names() {
        let f = fixture();
        let first = f.start();
        f.clock.advance(COOLDOWN);
        let (claim, _) = f.lifecycle.begin_stop().unwrap();
        f.lifecycle.finish_detach(claim, Ok(()));
        assert_eq!(f.lifecycle.retire(false, || Ok(())), Some(first.clone()));

        f.clock.advance(COOLDOWN);
        let second = f.start();
        let name = |p: &PathBuf| p.file_name().unwrap().to_string_lossy().to_string();
        assert!(name(&first).starts_with("recording-0-date-"));
        assert!(name(&second).starts_with("recording-1-date-"));
        assert!(f.dir.path().is_dir());
    }

    #[test]
    fn stop_waits_twice_the_buffer() {
        let f = fixture();
        f.start();
        let t0 = f.clock.now();
        let (claim, deadline) = f.lifecycle.begin_stop().unwrap();

        assert_eq!(deadline - t0, BUFFER * 2);
        assert_eq!(f.lifecycle.state(), Stopping);
        assert!(f.lifecycle.is_pending());
        assert!(!f.lifecycle.finish_detach(claim, Ok(())));
        assert!(!f.lifecycle.is_pending());
    }

    #[test]
    fn end_of_stream_before_detach_callback_keeps_recording_possible() {
        let f = fixture();
        f.start();
        let (claim, _) = f.lifecycle.begin_stop().unwrap();

        // the file sink sees end-of-stream before the relink callback returns
        f.lifecycle.retire(false, || Ok(()));
        assert_eq!(f.lifecycle.state(), Stopped);
        assert!(!f.lifecycle.finish_detach(claim, Ok(())));

        assert!(!f.lifecycle.is_pending());
        f.clock.advance(COOLDOWN);
        assert!(f.lifecycle.begin_start(f.dir.path()).is_ok());
    }

    #[test]
    fn stale_detach_does_not_free_a_newer_claim() {
        let f = fixture();
        f.start();
        let (stale, _) = f.lifecycle.begin_stop().unwrap();
        f.lifecycle.retire(true, || Ok(()));

        f.clock.advance(COOLDOWN);
        let (fresh, _) = f.lifecycle.begin_start(f.dir.path()).unwrap();
        assert!(!f.lifecycle.finish_detach(stale, Err(BranchError::Link("gone".into()))));
        assert!(f.lifecycle.is_pending());

        f.lifecycle.finish_start(fresh, Ok(()));
        assert_eq!(f.lifecycle.state(), Recording);
    }

    #[test]
    fn failed_detach_is_reported() {
        let f = fixture();
        f.start();
        let (claim, _) = f.lifecycle.begin_stop().unwrap();
        assert!(f.lifecycle.finish_detach(claim, Err(BranchError::Link("no peer".into()))));
    }

    #[test]
    fn watchdog_fires_after_the_finalize_timeout() {
        let f = fixture();
        f.start();
        let (_claim, _) = f.lifecycle.begin_stop().unwrap();

        // measured from the detach deadline while the relink is outstanding
        f.clock.advance(BUFFER * 2 + TIMEOUT);
        assert!(!f.lifecycle.watchdog_expired());
        f.clock.advance(Duration::from_millis(1));
        assert!(f.lifecycle.watchdog_expired());

        let file = f.lifecycle.retire(true, || Ok(()));
        assert!(file.is_some());
        assert_eq!(f.lifecycle.state(), Stopped);
        assert!(!f.lifecycle.is_pending());
        assert!(!f.lifecycle.watchdog_expired());
    }

    #[test]
    fn retire_walks_an_active_recording_to_stopped() {
        let f = fixture();
        f.start();
        f.lifecycle.retire(false, || Ok(()));

        assert_eq!(
            f.lifecycle.state_cell().history(),
            vec![
                (NotStarted, Starting),
                (Starting, Recording),
                (Recording, Stopping),
                (Stopping, Stopped),
            ]
        );
    }

    #[test]
    fn retire_while_starting_returns_to_not_started() {
        let f = fixture();
        let (_claim, _) = f.lifecycle.begin_start(f.dir.path()).unwrap();
        let mut parked = false;
        f.lifecycle.retire(true, || {
            parked = true;
            Ok(())
        });
        assert!(parked);
        assert_eq!(f.lifecycle.state(), NotStarted);
    }

    #[test]
    fn switch_follows_state_and_cooldown() {
        let f = fixture();
        assert_eq!(f.lifecycle.switch_decision().unwrap(), Decision::Start);

        let (claim, _) = f.lifecycle.begin_start(f.dir.path()).unwrap();
        assert!(matches!(
            f.lifecycle.switch_decision(),
            Err(BranchError::Busy(Starting))
        ));
        f.lifecycle.finish_start(claim, Ok(()));

        f.clock.advance(Duration::from_secs(2));
        match f.lifecycle.switch_decision() {
            Err(BranchError::CoolingDown(left)) => assert_eq!(left, Duration::from_secs(3)),
            other => panic!("expected cooldown, got {:?}", other),
        }
        f.clock.advance(Duration::from_secs(3));
        assert_eq!(f.lifecycle.switch_decision().unwrap(), Decision::Stop);

        let (claim, _) = f.lifecycle.begin_stop().unwrap();
        assert!(matches!(
            f.lifecycle.switch_decision(),
            Err(BranchError::Busy(Stopping))
        ));
        f.lifecycle.finish_detach(claim, Ok(()));
        f.lifecycle.retire(false, || Ok(()));

        assert!(matches!(
            f.lifecycle.switch_decision(),
            Err(BranchError::CoolingDown(_))
        ));
        f.clock.advance(COOLDOWN);
        assert_eq!(f.lifecycle.switch_decision().unwrap(), Decision::Start);
    }
}

// Recording modules

pub mod branch;
pub mod controller;
pub mod lifecycle;
pub mod relink;
pub mod snapshot;
pub mod state;

pub use branch::{BranchError, BranchEvent, BranchSettings, MetricsSnapshot, StreamBranchController};
pub use controller::{Decision, HysteresisConfig, RecordingController, RecordingSink, HISTORY_LEN};
pub use lifecycle::{recording_file_name, stop_deadline, BranchLifecycle, RelinkClaim};
pub use relink::{PendingRelink, RelinkOp};
pub use snapshot::{SnapshotError, SnapshotWriter};
pub use state::{Cooldown, RecordingState, StateCell, StateSnapshot, TransitionError};

//! Update scheduling: policies, persisted state, recovery and the tracker
//! gating concurrent runs.

pub mod clock;
pub mod policy;
pub mod recovery;
pub mod state;
pub mod store;
pub mod tracker;

pub use clock::{Clock, SystemClock};
pub use policy::{PolicyError, UpdatePolicy};
pub use state::{ScheduleState, UpdateOutcome, UpdateStatus};
pub use store::{FileScheduleStore, ScheduleStore};
pub use tracker::{SchedulerStatus, TrackerError, UpdateRunner, UpdateTracker};

//! Session-scoped state for uploads and runs.
//!
//! - [`models`]: the `Upload` and `Run` records and the run state machine
//! - [`state`]: [`StateStore`], the single source of persisted run state
//!
//! Only the queue processor moves a run out of `queued` or touches its
//! container fields; the service layer creates rows and requests
//! cancellation.

pub mod models;
pub mod state;

pub use models::{NewRun, Run, RunStatus, RunUpdate, Upload, DEFAULT_DIE_ID};
pub use state::{SharedStore, StateStore};

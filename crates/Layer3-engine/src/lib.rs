//! Task graph scheduling
//!
//! Turns a validated set of task specs into a run: one async unit per task,
//! dependency ordering via status watches, semaphore-gated admission, durable
//! `taskstate.json` snapshots, and a final [`RunReport`].

pub mod context;
pub mod scheduler;
pub mod state;
pub mod status;
pub mod task;

pub use context::TaskContext;
pub use scheduler::{RunReport, Scheduler};
pub use state::{RunState, StateSnapshot, TaskRecord, TaskSnapshot, STATE_FILE};
pub use status::TaskStatus;
pub use task::{TaskBody, TaskSet, TaskSpec};

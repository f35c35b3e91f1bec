//! Command execution, log streaming, and stash transfer
//!
//! This crate runs shell commands in local, container, and remote
//! environments behind one [`Executor`] contract, streams their output line
//! by line into a shared [`RunLog`], supports cooperative cancellation via
//! [`KillSignal`], and moves file bundles between environments as
//! reference-counted [`Stash`] archives.

pub mod executor;
pub mod kill;
pub mod log;
pub mod process;
pub mod stash;
pub mod tmp;

pub use executor::{Container, ExecOptions, Executor, Local, Ssh};
pub use kill::KillSignal;
pub use log::{LogLine, RunLog, TaskLogger};
pub use process::{run_command, run_quiet};
pub use stash::Stash;

//! # conveyor-foundation
//!
//! Foundation layer for Conveyor: the shared error taxonomy and the
//! run/pipeline configuration types consumed by every other crate.

pub mod config;
pub mod error;

pub use config::{
    ExecutorBackend, PipelineConfig, RunConfig, SemaphoreRequirement, TaskConfig, PIPELINE_FILE,
};
pub use error::{Error, Result};

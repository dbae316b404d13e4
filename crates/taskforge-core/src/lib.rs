//! Core types and error definitions for the taskforge engine.
//!
//! This crate provides the foundational types shared across all taskforge crates:
//! the error taxonomy used by the scheduler, distributor and swarm engine, and the
//! priority scales used to order tasks and reported failures.
//!
//! # Main types
//!
//! - [`TaskforgeError`] — Unified error enum, one variant per error class.
//! - [`TaskforgeResult`] — Convenience alias for `Result<T, TaskforgeError>`.
//! - [`ErrorKind`] — Serializable classification of a [`TaskforgeError`].
//! - [`Priority`] — Task priority (`Critical > High > Medium > Low > Deferred`).
//! - [`FailurePriority`] — Declared priority of a reported failure.

/// Error taxonomy.
pub mod error;
/// Task and failure priority scales.
pub mod priority;

pub use error::{ErrorKind, TaskforgeError, TaskforgeResult};
pub use priority::{FailurePriority, Priority};

/// Identifier of a task, workspace task or workflow run.
pub type TaskId = uuid::Uuid;


//! Bounded-concurrency task execution engine.
//!
//! A [`group::TaskGroup`] schedules cancellable, progress-reporting tasks
//! from an observable [`collection::TaskCollection`] under a configurable
//! concurrency cap, aggregating per-task progress and completion status into
//! group-level events delivered on one serialized channel per group.

pub mod config;
pub mod logging;

// Core modules
pub mod collection;
pub mod error;
pub mod group;
pub mod task;

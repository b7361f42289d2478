// src/model/mod.rs

//! Core data model: recurring [`Job`] definitions and the concrete [`Task`]
//! instances derived from them.

pub mod job;
pub mod task;

pub use job::Job;
pub use task::{Task, TaskOutcome};

/// Canonical identifier type for jobs and tasks.
pub type Id = uuid::Uuid;

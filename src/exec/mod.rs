// src/exec/mod.rs

//! Task execution layer.
//!
//! This module is responsible for actually running a task's plugin pipeline
//! and reporting back to the supervisor via [`crate::engine::Update`]s.
//!
//! - [`pipeline`] builds the `<a> backup | <b> store` shell pipeline and runs
//!   it as one process group, streaming stdout/stderr lines as they appear.
//! - [`backend`] provides the [`TaskExecutor`] trait and the production
//!   [`Runner`], which runs locally or forwards to a remote agent.
//! - [`task_runner`] executes one assignment on a worker and publishes its
//!   updates.
//! - [`worker_pool`] spawns the fixed-size pool of workers the supervisor
//!   hands tasks to.

pub mod backend;
pub mod pipeline;
pub mod task_runner;
pub mod worker_pool;

pub use backend::{ExecFuture, Runner, TaskExecutor};
pub use pipeline::{run_pipeline, OutputLine, OutputStream, Pipeline};
pub use worker_pool::{spawn_workers, Assignment, WorkerId};

//! Core domain models for the orchestration engine.
//!
//! This module contains the task data model, its lifecycle, the task
//! dependency graph, worker declarations and completion evidence.

pub mod dag;
pub mod evidence;
pub mod lifecycle;
pub mod task;
pub mod worker;

pub use dag::{StatusCounts, TaskGraph};
pub use evidence::{Evidence, Fraction, GateCheck, ScanReport, TestSummary};
pub use lifecycle::TaskEvent;
pub use task::{Complexity, Domain, PhaseStamp, Task, TaskId, TaskSpec, TaskStatus, TddPhase};
pub use worker::{CircuitState, Worker, WorkerSnapshot};

//! Integration test suite for conductor.
//!
//! These tests drive the orchestration loop through its public handle,
//! playing the worker side by hand or with scripted workers. They verify
//! that routing, gates, retries and the audit ledger work together.
//!
//! # Test Categories
//!
//! - `routing`: Tier selection, circuit fallback, config changes
//! - `quality_gates`: Gate profiles and TDD ordering
//! - `recovery`: Retries, escalation and operator commands
//! - `replay`: Ledger ordering, journals and state reconstruction
//!
//! # CI Compatibility
//!
//! Backoff waits run on a paused tokio clock, so no test sleeps for real.

mod fixtures;

mod routing;
mod quality_gates;
mod recovery;
mod replay;

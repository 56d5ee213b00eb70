//! Integration tests for weft
//!
//! These tests drive whole builds and build trees through scheduling,
//! finalization and execution, observing execution order, failure
//! collection and lock discipline.

pub mod composite_builds;
pub mod config;
pub mod cycles;
pub mod failures;
pub mod helpers;
pub mod locking;

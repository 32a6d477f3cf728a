//! Shared test utilities for genogate integration tests.
//!
//! This module provides:
//! - `TestHarness`, a gateway over a temporary store with a scripted scheduler
//! - `ConfigBuilder` for creating test configurations programmatically

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::{ScriptedScheduler, TestHarness};

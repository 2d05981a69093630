//! Contains the building blocks the bus dispatches through.
//!
//! This module provides the listener registration types (what to match, when
//! to run, and what to call) and the worker pool that executes ASYNC
//! listeners. The `EventBus` and `PhaseScheduler` drive these components.

pub mod listener;
pub(crate) mod worker;

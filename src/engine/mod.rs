// src/engine/mod.rs

//! Marathon execution engine.
//!
//! The pure decision and transition functions live in [`core`]; the async
//! shell that performs agent calls, checks and persistence is
//! [`executor`]. [`context`] bundles the collaborators shared by every
//! executor and creates new marathons.

pub mod context;
pub mod core;
pub mod executor;

pub use context::{EngineContext, start_marathon};
pub use core::{CoreStep, FailureStep, StopReason, decide};
pub use executor::{Executor, ExecutorHandle};

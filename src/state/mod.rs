// src/state/mod.rs

//! Durable marathon state.
//!
//! - [`model`] is the persisted aggregate and its parts.
//! - [`store`] saves and loads it atomically.
//! - [`shared`] owns a live marathon's state and serializes writers.

pub mod model;
pub mod shared;
pub mod store;

pub use model::{
    ActionCheckpoint, ActionKind, CheckpointPayload, ControlAction, ControlRequest,
    DurableMarathonState, HeartbeatState, LogEntry, LogLevel, truncate_text,
};
pub use shared::{SharedState, absorb_external};
pub use store::{FileStateStore, StateStore};

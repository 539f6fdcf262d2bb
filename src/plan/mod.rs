// src/plan/mod.rs

//! Milestone plans.
//!
//! - [`model`] holds `Milestone` and `MarathonPlan`.
//! - [`graph`] indexes dependency edges in both directions.
//! - [`validate`] checks ids, dependencies, and acyclicity.
//! - [`select`] decides which milestone is eligible next.
//! - [`loader`] reads plan files and defines the `Planner` boundary.

pub mod graph;
pub mod loader;
pub mod model;
pub mod select;
pub mod validate;

pub use graph::DagGraph;
pub use loader::{load_plan, parse_plan, PlanFilePlanner, Planner};
pub use model::{MarathonPlan, Milestone, MilestoneId, DEFAULT_MAX_RETRIES};
pub use select::{deps_satisfied, select_next, skip_dependents_of_failed, Selection};
pub use validate::validate_plan;

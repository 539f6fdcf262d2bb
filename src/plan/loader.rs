// src/plan/loader.rs

//! Plan files and the planner boundary.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::info;

use crate::errors::Result;
use crate::plan::model::{MarathonPlan, Milestone, DEFAULT_MAX_RETRIES};
use crate::plan::validate::validate_plan;

/// Turns a goal into a milestone plan. Invoked once, before execution.
pub trait Planner: Send + Sync {
    fn create_plan(&self, goal: &str, context: &str) -> Result<MarathonPlan>;
}

/// Plan file as written by hand or by an external planner:
///
/// ```toml
/// goal = "Ship the release"
///
/// [thinking]
/// build = "favour small commits"
///
/// [[milestone]]
/// id = "build"
/// title = "Build artifacts"
/// artifacts = ["dist/app.tar.gz"]
///
/// [[milestone]]
/// id = "announce"
/// title = "Announce release"
/// after = ["build"]
/// verify = ["release notes mention the version"]
/// max_retries = 1
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawPlanFile {
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub thinking: BTreeMap<String, String>,
    #[serde(default)]
    pub milestone: Vec<RawMilestone>,
}

/// One `[[milestone]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawMilestone {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub after: Vec<String>,
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
    #[serde(default)]
    pub verify: Vec<String>,
    pub max_retries: Option<u32>,
}

impl From<RawMilestone> for Milestone {
    fn from(raw: RawMilestone) -> Self {
        let mut m = Milestone::new(raw.id, raw.title);
        m.description = raw.description;
        m.dependencies = raw.after;
        m.artifacts = raw.artifacts;
        m.verification_steps = raw.verify;
        m.max_retries = raw.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
        m
    }
}

impl From<RawPlanFile> for MarathonPlan {
    fn from(raw: RawPlanFile) -> Self {
        let mut plan = MarathonPlan::new(
            raw.goal,
            raw.milestone.into_iter().map(Milestone::from).collect(),
        );
        plan.thinking = raw.thinking;
        plan
    }
}

/// Parse and validate plan TOML.
pub fn parse_plan(contents: &str) -> Result<MarathonPlan> {
    let raw: RawPlanFile = toml::from_str(contents)?;
    let plan = MarathonPlan::from(raw);
    validate_plan(&plan)?;
    Ok(plan)
}

/// Load and validate a plan file.
pub fn load_plan(path: impl AsRef<Path>) -> Result<MarathonPlan> {
    let contents = fs::read_to_string(path.as_ref())?;
    parse_plan(&contents)
}

/// [`Planner`] backed by a pre-written plan file.
///
/// A non-empty `goal` argument overrides the file's goal; a non-empty
/// `context` is kept as the `context` thinking hint.
#[derive(Debug, Clone)]
pub struct PlanFilePlanner {
    path: PathBuf,
}

impl PlanFilePlanner {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Planner for PlanFilePlanner {
    fn create_plan(&self, goal: &str, context: &str) -> Result<MarathonPlan> {
        let mut plan = load_plan(&self.path)?;
        if !goal.trim().is_empty() {
            plan.goal = goal.to_string();
        }
        if !context.trim().is_empty() {
            plan.thinking
                .insert("context".to_string(), context.to_string());
        }
        info!(
            path = %self.path.display(),
            milestones = plan.milestones.len(),
            "loaded marathon plan"
        );
        Ok(plan)
    }
}

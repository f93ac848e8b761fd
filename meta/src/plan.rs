//! Task text to an ordered list of steps.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

const BACKEND_TOKENS: &[&str] = &[
    "api", "backend", "controller", "database", "db", "endpoint", "endpoints", "handler",
    "migration", "model", "route", "routes", "schema", "server", "service",
];

const FRONTEND_TOKENS: &[&str] = &[
    "button", "component", "components", "css", "form", "frontend", "layout", "page", "pages",
    "react", "screen", "style", "ui", "view", "views",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Backend,
    Frontend,
    Validation,
    Finalize,
}

impl StepType {
    pub fn as_str(self) -> &'static str {
        match self {
            StepType::Backend => "backend",
            StepType::Frontend => "frontend",
            StepType::Validation => "validation",
            StepType::Finalize => "finalize",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub description: String,
}

/// Lowercased alphanumeric words of `text`.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_ascii_lowercase)
        .collect()
}

/// Derive the steps for `task`.
///
/// Backend and frontend steps are chosen from the task's words; a task that
/// names neither gets a backend step. Validation and finalize always close
/// the plan. The result is deduplicated by id and sorted, so the same task
/// text always yields the same plan.
pub fn build_steps(task: &str) -> Vec<Step> {
    let task = task.trim();
    let tokens = tokenize(task);
    let mentions = |vocab: &[&str]| vocab.iter().any(|word| tokens.contains(*word));
    let backend = mentions(BACKEND_TOKENS);
    let frontend = mentions(FRONTEND_TOKENS);

    let mut steps = Vec::new();
    if backend || !frontend {
        steps.push(step(
            "01-backend",
            StepType::Backend,
            format!("Backend changes for: {task}"),
        ));
    }
    if frontend {
        steps.push(step(
            "02-frontend",
            StepType::Frontend,
            format!("Frontend changes for: {task}"),
        ));
    }
    steps.push(step(
        "03-validation",
        StepType::Validation,
        format!("Add or update tests covering: {task}"),
    ));
    steps.push(step(
        "04-finalize",
        StepType::Finalize,
        format!("Finalize and verify contract integrity for: {task}"),
    ));
    normalize_steps(steps)
}

/// Deduplicate by id (first wins) and sort by id, then type, then description.
pub fn normalize_steps(steps: Vec<Step>) -> Vec<Step> {
    let mut seen = BTreeSet::new();
    let mut unique: Vec<Step> = steps
        .into_iter()
        .filter(|step| seen.insert(step.id.clone()))
        .collect();
    unique.sort();
    unique
}

fn step(id: &str, step_type: StepType, description: String) -> Step {
    Step {
        id: id.to_string(),
        step_type,
        description,
    }
}

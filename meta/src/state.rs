//! Persisted meta-run state under `.pipeline/meta/<metaRunId>/`.
//!
//! The plan is written once. Step results, the manifest, and context health
//! are rewritten atomically after every step transition, which is what makes a
//! killed meta run resumable. Loading validates the two core files against
//! their JSON Schemas and then cross-checks every file against the others; any
//! disagreement is a `ResumeInconsistency`, never a best-effort repair.

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use jsonschema::Draft;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use pipeline::bail_kind;
use pipeline::error::{ErrorKind, PipelineError};
use pipeline::io::atomic::{write_atomic, write_json_atomic};

use crate::config::MetaConfig;
use crate::context_health::{ContextHealth, ContinuationBundle};
use crate::plan::{Step, StepType};

pub const META_PLAN: &str = "meta_plan.json";
pub const META_STEP_RESULTS: &str = "meta_step_results.json";
pub const META_RUN_MANIFEST: &str = "meta_run_manifest.json";
pub const CONTEXT_HEALTH: &str = "context_health.json";
pub const CONTINUATION_BUNDLE: &str = "continuation_bundle.json";
pub const CONTINUATION_SUMMARY: &str = "CONTINUATION.md";

const META_RUN_ID_PREFIX: &str = "meta-";
const PLAN_SCHEMA: &str = include_str!("../schemas/meta_plan.schema.json");
const STEP_RESULTS_SCHEMA: &str = include_str!("../schemas/meta_step_results.schema.json");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaPlan {
    pub meta_run_id: String,
    pub task: String,
    pub created_at: String,
    pub steps: Vec<Step>,
}

impl MetaPlan {
    pub fn step_ids(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|step| step.id.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pass,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaStepResult {
    pub step_id: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub description: String,
    pub run_id: Option<String>,
    pub lifecycle_state: String,
    pub contract_integrity_status: String,
    pub validate_exit_code: Option<i32>,
    pub status: StepStatus,
}

impl MetaStepResult {
    pub fn passed(&self) -> bool {
        self.status == StepStatus::Pass && self.lifecycle_state == "PASS"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemediationStatus {
    Pass,
    Failed,
    Stalled,
    MaxAttemptsReached,
}

/// One self-heal cycle. Appended, never rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemediationAttempt {
    pub id: String,
    pub attempt: u32,
    pub source_step_id: String,
    pub source_run_id: Option<String>,
    pub fix_run_id: Option<String>,
    pub status: RemediationStatus,
    pub failure_signature: String,
    pub failing_tests: Vec<String>,
    pub first_failure: String,
    pub timestamp: String,
    pub fix_task: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelfHealSettings {
    pub enabled: bool,
    pub max_attempts: u32,
    pub stall_threshold: u32,
}

impl From<&MetaConfig> for SelfHealSettings {
    fn from(cfg: &MetaConfig) -> Self {
        Self {
            enabled: cfg.self_heal,
            max_attempts: cfg.max_self_heal_attempts,
            stall_threshold: cfg.stall_threshold,
        }
    }
}

/// `meta_step_results.json`: the durable resumability record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResults {
    pub meta_run_id: String,
    pub steps: Vec<MetaStepResult>,
    pub remediation_history: Vec<RemediationAttempt>,
    pub self_heal: SelfHealSettings,
}

impl StepResults {
    pub fn new(meta_run_id: &str, self_heal: SelfHealSettings) -> Self {
        Self {
            meta_run_id: meta_run_id.to_string(),
            steps: Vec::new(),
            remediation_history: Vec::new(),
            self_heal,
        }
    }

    /// Insert or replace the result for `result.step_id`.
    pub fn upsert(&mut self, result: MetaStepResult) {
        match self.steps.iter_mut().find(|r| r.step_id == result.step_id) {
            Some(existing) => *existing = result,
            None => self.steps.push(result),
        }
    }

    pub fn get(&self, step_id: &str) -> Option<&MetaStepResult> {
        self.steps.iter().find(|r| r.step_id == step_id)
    }

    pub fn is_passed(&self, step_id: &str) -> bool {
        self.get(step_id).is_some_and(MetaStepResult::passed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetaRunStatus {
    Running,
    Pass,
    Failed,
    Stalled,
    MaxSelfHealAttemptsReached,
}

impl MetaRunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MetaRunStatus::Running => "RUNNING",
            MetaRunStatus::Pass => "PASS",
            MetaRunStatus::Failed => "FAILED",
            MetaRunStatus::Stalled => "STALLED",
            MetaRunStatus::MaxSelfHealAttemptsReached => "MAX_SELF_HEAL_ATTEMPTS_REACHED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaRunManifest {
    pub meta_run_id: String,
    pub task: String,
    pub status: MetaRunStatus,
    pub step_count: usize,
    pub current_step_index: usize,
    pub completed_steps: usize,
    pub last_run_id: Option<String>,
    /// `pipeline run` invocations so far, across resumes.
    pub invocations: u32,
    pub self_heal_attempts: u32,
    pub self_heal_successes: u32,
    pub reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl MetaRunManifest {
    pub fn new(plan: &MetaPlan) -> Self {
        Self {
            meta_run_id: plan.meta_run_id.clone(),
            task: plan.task.clone(),
            status: MetaRunStatus::Running,
            step_count: plan.steps.len(),
            current_step_index: 0,
            completed_steps: 0,
            last_run_id: None,
            invocations: 0,
            self_heal_attempts: 0,
            self_heal_successes: 0,
            reason: None,
            created_at: plan.created_at.clone(),
            updated_at: plan.created_at.clone(),
        }
    }
}

/// Step counts derived from the plan and the step results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepProgress {
    pub completed: usize,
    pub remaining: usize,
    /// First plan index without a PASS result; equals the step count when
    /// every step passed.
    pub next_index: usize,
}

/// Everything `resume` needs, already cross-checked.
#[derive(Debug, Clone)]
pub struct PersistedState {
    pub plan: MetaPlan,
    pub results: StepResults,
    pub manifest: MetaRunManifest,
    pub bundle: Option<ContinuationBundle>,
    pub progress: StepProgress,
}

/// Handle to one meta run's state directory.
#[derive(Debug, Clone)]
pub struct MetaRunStore {
    meta_run_id: String,
    dir: PathBuf,
}

impl MetaRunStore {
    pub fn create(meta_dir: &Path) -> Result<Self> {
        Self::create_at(meta_dir, Utc::now())
    }

    /// Allocate `meta-<stamp>`, suffixing `-2`, `-3`, ... on collision.
    pub fn create_at(meta_dir: &Path, now: DateTime<Utc>) -> Result<Self> {
        fs::create_dir_all(meta_dir)
            .with_context(|| format!("create directory {}", meta_dir.display()))?;
        let stamp = format!("{META_RUN_ID_PREFIX}{}", now.format("%Y%m%dT%H%M%S%3f"));
        for n in 1u32.. {
            let meta_run_id = if n == 1 {
                stamp.clone()
            } else {
                format!("{stamp}-{n}")
            };
            let dir = meta_dir.join(&meta_run_id);
            match fs::create_dir(&dir) {
                Ok(()) => {
                    debug!(meta_run_id = %meta_run_id, "meta run directory created");
                    return Ok(Self { meta_run_id, dir });
                }
                Err(err) if err.kind() == IoErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("create {}", dir.display()));
                }
            }
        }
        Err(anyhow!("no free meta run id for stamp {stamp}"))
    }

    /// Open the state of an earlier meta run.
    pub fn open(meta_dir: &Path, meta_run_id: &str) -> Result<Self> {
        if meta_run_id.is_empty()
            || meta_run_id.contains(['/', '\\'])
            || meta_run_id.starts_with('.')
        {
            bail_kind!(ResumeInconsistency, "invalid meta run id '{meta_run_id}'");
        }
        let dir = meta_dir.join(meta_run_id);
        if !dir.is_dir() {
            bail_kind!(
                ResumeInconsistency,
                "no persisted state for meta run {meta_run_id} at {}",
                dir.display()
            );
        }
        Ok(Self {
            meta_run_id: meta_run_id.to_string(),
            dir,
        })
    }

    pub fn meta_run_id(&self) -> &str {
        &self.meta_run_id
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// The plan is immutable once persisted.
    pub fn write_plan(&self, plan: &MetaPlan) -> Result<()> {
        let path = self.path(META_PLAN);
        let mut buf = serde_json::to_string_pretty(plan).context("serialize meta plan")?;
        buf.push('\n');
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == IoErrorKind::AlreadyExists => {
                return Err(anyhow!(
                    "plan already written for meta run {}",
                    self.meta_run_id
                ));
            }
            Err(err) => return Err(err).with_context(|| format!("create {}", path.display())),
        };
        file.write_all(buf.as_bytes())
            .with_context(|| format!("write {}", path.display()))
    }

    pub fn write_step_results(&self, results: &StepResults) -> Result<()> {
        write_json_atomic(&self.path(META_STEP_RESULTS), results)
    }

    pub fn write_manifest(&self, manifest: &MetaRunManifest) -> Result<()> {
        write_json_atomic(&self.path(META_RUN_MANIFEST), manifest)
    }

    pub fn write_context_health(&self, health: &ContextHealth) -> Result<()> {
        write_json_atomic(&self.path(CONTEXT_HEALTH), health)
    }

    pub fn write_continuation(&self, bundle: &ContinuationBundle, summary: &str) -> Result<()> {
        write_json_atomic(&self.path(CONTINUATION_BUNDLE), bundle)?;
        write_atomic(&self.path(CONTINUATION_SUMMARY), summary.as_bytes())
    }

    /// Remove both continuation files. Returns whether anything was removed.
    pub fn remove_continuation(&self) -> Result<bool> {
        let mut removed = false;
        for name in [CONTINUATION_BUNDLE, CONTINUATION_SUMMARY] {
            let path = self.path(name);
            match fs::remove_file(&path) {
                Ok(()) => removed = true,
                Err(err) if err.kind() == IoErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("remove {}", path.display()));
                }
            }
        }
        Ok(removed)
    }

    /// Load and cross-check everything a resume depends on.
    pub fn load(&self) -> Result<PersistedState> {
        let plan: MetaPlan = self.read_validated(META_PLAN, PLAN_SCHEMA)?;
        let results: StepResults = self.read_validated(META_STEP_RESULTS, STEP_RESULTS_SCHEMA)?;
        let manifest: MetaRunManifest = self.read_required(META_RUN_MANIFEST)?;
        let bundle: Option<ContinuationBundle> = self.read_optional(CONTINUATION_BUNDLE)?;
        let progress = check_consistency(
            &self.meta_run_id,
            &plan,
            &results,
            &manifest,
            bundle.as_ref(),
        )?;
        Ok(PersistedState {
            plan,
            results,
            manifest,
            bundle,
            progress,
        })
    }

    fn read_value(&self, name: &str) -> Result<Option<Value>> {
        let path = self.path(name);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };
        match serde_json::from_str(&text) {
            Ok(value) => Ok(Some(value)),
            Err(err) => bail_kind!(ResumeInconsistency, "{name} is not valid JSON: {err}"),
        }
    }

    fn read_required<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let Some(value) = self.read_value(name)? else {
            bail_kind!(
                ResumeInconsistency,
                "{name} missing for meta run {}",
                self.meta_run_id
            );
        };
        decode(name, value)
    }

    fn read_optional<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        match self.read_value(name)? {
            Some(value) => decode(name, value).map(Some),
            None => Ok(None),
        }
    }

    fn read_validated<T: DeserializeOwned>(&self, name: &str, schema: &str) -> Result<T> {
        let Some(value) = self.read_value(name)? else {
            bail_kind!(
                ResumeInconsistency,
                "{name} missing for meta run {}",
                self.meta_run_id
            );
        };
        validate_against_schema(name, schema, &value)?;
        decode(name, value)
    }
}

fn decode<T: DeserializeOwned>(name: &str, value: Value) -> Result<T> {
    match serde_json::from_value(value) {
        Ok(decoded) => Ok(decoded),
        Err(err) => bail_kind!(ResumeInconsistency, "{name} has an unexpected shape: {err}"),
    }
}

/// Draft 2020-12 validation of persisted state.
fn validate_against_schema(name: &str, schema: &str, instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(schema).context("parse embedded schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile json schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        warn!(file = name, errors = messages.len(), "persisted state failed schema validation");
        bail_kind!(
            ResumeInconsistency,
            "{name} failed schema validation:\n- {}",
            messages.join("\n- ")
        );
    }
    Ok(())
}

/// Cross-file agreement required before a resume may execute anything.
pub fn check_consistency(
    meta_run_id: &str,
    plan: &MetaPlan,
    results: &StepResults,
    manifest: &MetaRunManifest,
    bundle: Option<&ContinuationBundle>,
) -> Result<StepProgress, PipelineError> {
    let inconsistent = |message: String| PipelineError::new(ErrorKind::ResumeInconsistency, message);

    for (file, id) in [
        (META_PLAN, plan.meta_run_id.as_str()),
        (META_STEP_RESULTS, results.meta_run_id.as_str()),
        (META_RUN_MANIFEST, manifest.meta_run_id.as_str()),
    ] {
        if id != meta_run_id {
            return Err(inconsistent(format!(
                "{file} belongs to meta run {id}, expected {meta_run_id}"
            )));
        }
    }

    let step_count = plan.steps.len();
    if manifest.step_count != step_count {
        return Err(inconsistent(format!(
            "manifest declares {} steps, plan has {step_count}",
            manifest.step_count
        )));
    }

    let plan_ids: BTreeSet<&str> = plan.step_ids().collect();
    let mut seen = BTreeSet::new();
    for result in &results.steps {
        if !plan_ids.contains(result.step_id.as_str()) {
            return Err(inconsistent(format!(
                "step result for {} which is not in the plan",
                result.step_id
            )));
        }
        if !seen.insert(result.step_id.as_str()) {
            return Err(inconsistent(format!(
                "more than one step result for {}",
                result.step_id
            )));
        }
    }

    let completed = results.steps.iter().filter(|r| r.passed()).count();
    let failed = results.steps.len() - completed;
    let never_run = plan_ids.len() - seen.len();
    let remaining = failed + never_run;
    if completed + remaining != step_count {
        return Err(inconsistent(format!(
            "{completed} completed + {remaining} remaining steps != {step_count} planned"
        )));
    }

    let next_index = plan
        .steps
        .iter()
        .position(|step| !results.is_passed(&step.id))
        .unwrap_or(step_count);

    if let Some(bundle) = bundle {
        if bundle.meta_run_id != meta_run_id {
            return Err(inconsistent(format!(
                "{CONTINUATION_BUNDLE} belongs to meta run {}, expected {meta_run_id}",
                bundle.meta_run_id
            )));
        }
        if bundle.completed_steps.len() != completed
            || bundle.remaining_steps.len() != remaining
            || bundle.current_step_index != next_index
        {
            return Err(inconsistent(format!(
                "{CONTINUATION_BUNDLE} records {} completed, {} remaining, index {}; \
                 step results give {completed}, {remaining}, index {next_index}",
                bundle.completed_steps.len(),
                bundle.remaining_steps.len(),
                bundle.current_step_index
            )));
        }
    }

    Ok(StepProgress {
        completed,
        remaining,
        next_index,
    })
}

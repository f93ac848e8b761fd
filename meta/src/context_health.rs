//! Context-size estimate and continuation bundles.
//!
//! After every persistence the controller estimates how much state a fresh
//! execution context would have to read to pick the run back up. Above the
//! threshold it writes a continuation bundle plus a short summary; below it,
//! both are removed.

use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::state::{META_PLAN, META_STEP_RESULTS, MetaPlan, MetaRunStore, StepResults};

/// Largest files of the latest run that count toward the estimate.
const HEAVIEST_ARTIFACTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextHealth {
    pub meta_run_id: String,
    pub plan_bytes: u64,
    pub step_results_bytes: u64,
    pub artifact_bytes: u64,
    pub estimated_bytes: u64,
    pub threshold_bytes: u64,
    pub over_threshold: bool,
    pub last_run_id: Option<String>,
    pub measured_at: String,
}

/// Enough to resume a meta run without replaying completed steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuationBundle {
    pub meta_run_id: String,
    pub completed_steps: Vec<String>,
    pub remaining_steps: Vec<String>,
    pub current_step_index: usize,
    pub last_run_id: Option<String>,
    pub resume_instruction: String,
    pub created_at: String,
}

impl ContinuationBundle {
    pub fn new(
        plan: &MetaPlan,
        results: &StepResults,
        last_run_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        let (completed, remaining): (Vec<_>, Vec<_>) = plan
            .steps
            .iter()
            .partition(|step| results.is_passed(&step.id));
        let current_step_index = plan
            .steps
            .iter()
            .position(|step| !results.is_passed(&step.id))
            .unwrap_or(plan.steps.len());
        Self {
            meta_run_id: plan.meta_run_id.clone(),
            completed_steps: completed.iter().map(|s| s.id.clone()).collect(),
            remaining_steps: remaining.iter().map(|s| s.id.clone()).collect(),
            current_step_index,
            last_run_id: last_run_id.map(str::to_string),
            resume_instruction: format!("meta run --resume {}", plan.meta_run_id),
            created_at: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// Human-readable companion to the bundle.
pub fn render_summary(plan: &MetaPlan, bundle: &ContinuationBundle) -> String {
    let list = |ids: &[String]| {
        if ids.is_empty() {
            "none".to_string()
        } else {
            ids.join(", ")
        }
    };
    let mut out = format!("# Continuation: {}\n\n", bundle.meta_run_id);
    out.push_str(&format!("Task: {}\n\n", plan.task));
    out.push_str(&format!(
        "Completed steps ({}/{}): {}\n",
        bundle.completed_steps.len(),
        plan.steps.len(),
        list(&bundle.completed_steps)
    ));
    out.push_str(&format!(
        "Remaining steps: {}\n",
        list(&bundle.remaining_steps)
    ));
    out.push_str(&format!(
        "Next step index: {}\n",
        bundle.current_step_index
    ));
    if let Some(run_id) = &bundle.last_run_id {
        out.push_str(&format!("Last run: {run_id}\n"));
    }
    out.push_str(&format!(
        "\nResume with:\n\n    {}\n",
        bundle.resume_instruction
    ));
    out
}

/// Sum of the `HEAVIEST_ARTIFACTS` largest files directly under `run_dir`.
pub fn heaviest_artifact_bytes(run_dir: &Path) -> Result<u64> {
    let entries = match fs::read_dir(run_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == IoErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err).with_context(|| format!("read {}", run_dir.display())),
    };
    let mut sizes = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read {}", run_dir.display()))?;
        let meta = entry
            .metadata()
            .with_context(|| format!("stat {}", entry.path().display()))?;
        if meta.is_file() {
            sizes.push(meta.len());
        }
    }
    sizes.sort_unstable_by(|a, b| b.cmp(a));
    Ok(sizes.iter().take(HEAVIEST_ARTIFACTS).sum())
}

fn file_len(path: &Path) -> Result<u64> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(err) if err.kind() == IoErrorKind::NotFound => Ok(0),
        Err(err) => Err(err).with_context(|| format!("stat {}", path.display())),
    }
}

/// Re-measure, persist `context_health.json`, and write or remove the
/// continuation files to match.
#[instrument(skip_all, fields(meta_run_id = %plan.meta_run_id))]
pub fn refresh(
    store: &MetaRunStore,
    runs_dir: &Path,
    plan: &MetaPlan,
    results: &StepResults,
    last_run_id: Option<&str>,
    threshold_bytes: u64,
    now: DateTime<Utc>,
) -> Result<ContextHealth> {
    let plan_bytes = file_len(&store.path(META_PLAN))?;
    let step_results_bytes = file_len(&store.path(META_STEP_RESULTS))?;
    let artifact_bytes = match last_run_id {
        Some(run_id) => heaviest_artifact_bytes(&runs_dir.join(run_id))?,
        None => 0,
    };
    let estimated_bytes = plan_bytes + step_results_bytes + artifact_bytes;
    let health = ContextHealth {
        meta_run_id: plan.meta_run_id.clone(),
        plan_bytes,
        step_results_bytes,
        artifact_bytes,
        estimated_bytes,
        threshold_bytes,
        over_threshold: estimated_bytes > threshold_bytes,
        last_run_id: last_run_id.map(str::to_string),
        measured_at: now.to_rfc3339_opts(SecondsFormat::Secs, true),
    };
    store.write_context_health(&health)?;

    if health.over_threshold {
        let bundle = ContinuationBundle::new(plan, results, last_run_id, now);
        store.write_continuation(&bundle, &render_summary(plan, &bundle))?;
        info!(estimated_bytes, threshold_bytes, "continuation bundle written");
    } else if store.remove_continuation()? {
        info!(estimated_bytes, threshold_bytes, "continuation bundle removed");
    }
    Ok(health)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetaConfig;
    use crate::plan::build_steps;
    use crate::state::{
        CONTINUATION_BUNDLE, CONTINUATION_SUMMARY, MetaStepResult, SelfHealSettings, StepStatus,
    };

    fn fixture(store: &MetaRunStore) -> (MetaPlan, StepResults) {
        let plan = MetaPlan {
            meta_run_id: store.meta_run_id().to_string(),
            task: "add logging to backend".to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            steps: build_steps("add logging to backend"),
        };
        let mut results = StepResults::new(
            store.meta_run_id(),
            SelfHealSettings::from(&MetaConfig::default()),
        );
        let first = &plan.steps[0];
        results.upsert(MetaStepResult {
            step_id: first.id.clone(),
            step_type: first.step_type,
            description: first.description.clone(),
            run_id: Some("run-a".to_string()),
            lifecycle_state: "PASS".to_string(),
            contract_integrity_status: "PASS".to_string(),
            validate_exit_code: Some(0),
            status: StepStatus::Pass,
        });
        store.write_plan(&plan).expect("plan");
        store.write_step_results(&results).expect("results");
        (plan, results)
    }

    #[test]
    fn bundle_splits_completed_and_remaining() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = MetaRunStore::create(temp.path()).expect("store");
        let (plan, results) = fixture(&store);
        let bundle = ContinuationBundle::new(&plan, &results, Some("run-a"), Utc::now());
        assert_eq!(bundle.completed_steps, vec!["01-backend"]);
        assert_eq!(bundle.remaining_steps, vec!["03-validation", "04-finalize"]);
        assert_eq!(bundle.current_step_index, 1);
        assert_eq!(
            bundle.resume_instruction,
            format!("meta run --resume {}", store.meta_run_id())
        );

        let summary = render_summary(&plan, &bundle);
        assert!(summary.contains("Completed steps (1/3): 01-backend"));
        assert!(summary.contains("Last run: run-a"));
    }

    #[test]
    fn bundle_follows_threshold_both_ways() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = MetaRunStore::create(&temp.path().join("meta")).expect("store");
        let runs_dir = temp.path().join("runs");
        fs::create_dir_all(runs_dir.join("run-a")).expect("mkdir");
        fs::write(runs_dir.join("run-a").join("attempt-1.diff"), vec![b'x'; 4096]).expect("write");
        let (plan, results) = fixture(&store);

        let health =
            refresh(&store, &runs_dir, &plan, &results, Some("run-a"), 1024, Utc::now()).expect("refresh");
        assert!(health.over_threshold);
        assert!(health.artifact_bytes >= 4096);
        assert!(store.path(CONTINUATION_BUNDLE).exists());
        assert!(store.path(CONTINUATION_SUMMARY).exists());

        let health = refresh(&store, &runs_dir, &plan, &results, Some("run-a"), 1_000_000, Utc::now())
            .expect("refresh");
        assert!(!health.over_threshold);
        assert!(!store.path(CONTINUATION_BUNDLE).exists());
        assert!(!store.path(CONTINUATION_SUMMARY).exists());
    }

    #[test]
    fn only_the_heaviest_artifacts_count() {
        let temp = tempfile::tempdir().expect("tempdir");
        for (name, len) in [("a", 10usize), ("b", 20), ("c", 30), ("d", 40)] {
            fs::write(temp.path().join(name), vec![b'x'; len]).expect("write");
        }
        assert_eq!(heaviest_artifact_bytes(temp.path()).expect("bytes"), 90);
        assert_eq!(
            heaviest_artifact_bytes(&temp.path().join("missing")).expect("bytes"),
            0
        );
    }
}

//! Multi-step meta runs: plan, execute each step as an isolated run, heal
//! failed steps, and finish with an independent re-check of the last run.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use chrono::{SecondsFormat, Utc};
use tracing::{error, info, instrument, warn};

use pipeline::error::{ErrorKind, PipelineError};
use pipeline::io::init::ensure_layout;
use pipeline::io::validation::ValidationRunner;

use crate::adapter::read_run_report;
use crate::config::MetaConfig;
use crate::context_health;
use crate::harness::{StepInvoker, StepRequest, StepRun, execute_step};
use crate::heal::{StallTracker, capture_diagnostics, failed_attempt_status, fix_task};
use crate::plan::{Step, build_steps};
use crate::state::{
    MetaPlan, MetaRunManifest, MetaRunStatus, MetaRunStore, MetaStepResult, RemediationAttempt,
    RemediationStatus, SelfHealSettings, StepResults, StepStatus,
};

pub struct MetaCollaborators<'a, I, V> {
    pub invoker: &'a I,
    /// Runs the project's tests directly to capture self-heal diagnostics.
    pub validation: &'a V,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaOutcome {
    pub meta_run_id: String,
    pub status: MetaRunStatus,
    pub reason: Option<String>,
}

impl MetaOutcome {
    pub fn passed(&self) -> bool {
        self.status == MetaRunStatus::Pass
    }
}

/// Plan `task` and execute every step.
#[instrument(skip_all)]
pub fn run_task<I: StepInvoker, V: ValidationRunner>(
    root: &Path,
    cfg: &MetaConfig,
    task: &str,
    collab: MetaCollaborators<'_, I, V>,
) -> Result<MetaOutcome> {
    let task = task.trim();
    if task.is_empty() {
        bail!("task must not be empty");
    }
    cfg.validate()?;
    let paths = ensure_layout(root)?;
    let store = MetaRunStore::create(&paths.meta_dir)?;
    let plan = MetaPlan {
        meta_run_id: store.meta_run_id().to_string(),
        task: task.to_string(),
        created_at: now_rfc3339(),
        steps: build_steps(task),
    };
    store.write_plan(&plan)?;
    info!(
        meta_run_id = %plan.meta_run_id,
        steps = plan.steps.len(),
        "meta run planned"
    );

    let mut session = Session {
        root,
        runs_dir: paths.runs_dir,
        cfg,
        collab,
        results: StepResults::new(&plan.meta_run_id, SelfHealSettings::from(cfg)),
        manifest: MetaRunManifest::new(&plan),
        store,
        plan,
    };
    session.persist()?;
    session.run_from(0)
}

/// Continue a persisted meta run from its first step without a PASS result.
#[instrument(skip_all, fields(meta_run_id = %meta_run_id))]
pub fn resume_task<I: StepInvoker, V: ValidationRunner>(
    root: &Path,
    cfg: &MetaConfig,
    meta_run_id: &str,
    collab: MetaCollaborators<'_, I, V>,
) -> Result<MetaOutcome> {
    cfg.validate()?;
    let paths = ensure_layout(root)?;
    let store = MetaRunStore::open(&paths.meta_dir, meta_run_id)?;
    let state = store.load()?;
    let progress = state.progress;

    if state.manifest.status == MetaRunStatus::Pass && progress.next_index == state.plan.steps.len()
    {
        info!("meta run already passed, nothing to resume");
        return Ok(MetaOutcome {
            meta_run_id: meta_run_id.to_string(),
            status: MetaRunStatus::Pass,
            reason: None,
        });
    }

    info!(
        completed = progress.completed,
        remaining = progress.remaining,
        next_index = progress.next_index,
        continuation_bundle = state.bundle.is_some(),
        "resuming meta run"
    );
    let mut results = state.results;
    results.self_heal = SelfHealSettings::from(cfg);
    let mut manifest = state.manifest;
    manifest.status = MetaRunStatus::Running;
    manifest.reason = None;

    let mut session = Session {
        root,
        runs_dir: paths.runs_dir,
        cfg,
        collab,
        store,
        plan: state.plan,
        results,
        manifest,
    };
    session.persist()?;
    session.run_from(progress.next_index)
}

enum HealOutcome {
    Healed,
    Stalled(String),
    Exhausted(String),
}

struct Session<'a, I, V> {
    root: &'a Path,
    runs_dir: PathBuf,
    cfg: &'a MetaConfig,
    collab: MetaCollaborators<'a, I, V>,
    store: MetaRunStore,
    plan: MetaPlan,
    results: StepResults,
    manifest: MetaRunManifest,
}

impl<I: StepInvoker, V: ValidationRunner> Session<'_, I, V> {
    fn run_from(mut self, start: usize) -> Result<MetaOutcome> {
        if let Err(err) = self.drive(start) {
            error!(err = %format!("{err:#}"), "meta run aborted");
            self.manifest.status = MetaRunStatus::Failed;
            self.manifest.reason = Some(format!("{err:#}"));
            if let Err(persist_err) = self.persist() {
                warn!(err = %format!("{persist_err:#}"), "failed to persist aborted meta run");
            }
            return Err(err);
        }
        Ok(MetaOutcome {
            meta_run_id: self.plan.meta_run_id.clone(),
            status: self.manifest.status,
            reason: self.manifest.reason.clone(),
        })
    }

    fn drive(&mut self, start: usize) -> Result<()> {
        for index in start..self.plan.steps.len() {
            let step = self.plan.steps[index].clone();
            if self.results.is_passed(&step.id) {
                continue;
            }
            self.manifest.current_step_index = index;
            info!(step = %step.id, index, "step started");

            let run = self.invoke(&step.description, &format!("step-{}", step.id))?;
            self.results.upsert(step_result(&step, &run));
            self.persist()?;
            if run.passed() {
                info!(step = %step.id, run_id = ?run.run_id, "step passed");
                continue;
            }

            warn!(step = %step.id, exit_code = ?run.exit_code, "step failed");
            if !self.cfg.self_heal {
                let reason = classified(
                    ErrorKind::Validation,
                    format!("step {} failed: {}", step.id, describe_run(&run)),
                );
                return self.finish(MetaRunStatus::Failed, Some(reason));
            }
            match self.self_heal(&step, &run)? {
                HealOutcome::Healed => {}
                HealOutcome::Stalled(reason) => {
                    return self.finish(MetaRunStatus::Stalled, Some(reason));
                }
                HealOutcome::Exhausted(reason) => {
                    return self.finish(MetaRunStatus::MaxSelfHealAttemptsReached, Some(reason));
                }
            }
        }
        self.finalize()
    }

    /// Repeat regression-fix runs until one passes, the signature stalls, or
    /// attempts run out. Every attempt is appended to the history.
    #[instrument(skip_all, fields(step = %step.id))]
    fn self_heal(&mut self, step: &Step, failed: &StepRun) -> Result<HealOutcome> {
        let max_attempts = self.cfg.max_self_heal_attempts;
        let mut diagnostics = capture_diagnostics(
            self.collab.validation,
            self.root,
            &self.diagnostics_log(step),
            failed.report.as_ref(),
        )?;
        let mut tracker = StallTracker::new(self.cfg.stall_threshold);

        for attempt in 1..=max_attempts {
            let task = fix_task(step, &diagnostics);
            let run = self.invoke(&task, &format!("heal-{}-{attempt}", step.id))?;
            self.manifest.self_heal_attempts += 1;

            let passed = run.passed();
            let (status, observed) = if passed {
                self.manifest.self_heal_successes += 1;
                (RemediationStatus::Pass, diagnostics.clone())
            } else {
                let next = capture_diagnostics(
                    self.collab.validation,
                    self.root,
                    &self.diagnostics_log(step),
                    run.report.as_ref(),
                )?;
                let stalled = tracker.observe(&next.signature());
                (failed_attempt_status(stalled, attempt, max_attempts), next)
            };
            info!(attempt, status = ?status, fix_run_id = ?run.run_id, "self-heal attempt finished");

            let id = format!("heal-{:03}", self.results.remediation_history.len() + 1);
            self.results.remediation_history.push(RemediationAttempt {
                id,
                attempt,
                source_step_id: step.id.clone(),
                source_run_id: failed.run_id.clone(),
                fix_run_id: run.run_id.clone(),
                status,
                failure_signature: observed.signature(),
                failing_tests: observed.failing_tests.clone(),
                first_failure: observed.first_failure.clone(),
                timestamp: now_rfc3339(),
                fix_task: task,
            });
            if passed {
                self.results.upsert(step_result(step, &run));
            }
            self.persist()?;

            match status {
                RemediationStatus::Pass => return Ok(HealOutcome::Healed),
                RemediationStatus::Stalled => {
                    return Ok(HealOutcome::Stalled(classified(
                        ErrorKind::SelfHealStalled,
                        format!(
                            "step {}: {} consecutive fix attempts failed with signature {}",
                            step.id,
                            tracker.streak(),
                            observed.signature()
                        ),
                    )));
                }
                RemediationStatus::MaxAttemptsReached => break,
                RemediationStatus::Failed => diagnostics = observed,
            }
        }
        Ok(HealOutcome::Exhausted(classified(
            ErrorKind::SelfHealExhausted,
            format!(
                "step {}: {max_attempts} fix attempt(s) did not pass",
                step.id
            ),
        )))
    }

    /// PASS only if every step passed and the last step's run still reads
    /// as a clean pass from its own manifest.
    fn finalize(&mut self) -> Result<()> {
        let pending: Vec<&str> = self
            .plan
            .steps
            .iter()
            .filter(|step| !self.results.is_passed(&step.id))
            .map(|step| step.id.as_str())
            .collect();
        if !pending.is_empty() {
            let reason = classified(
                ErrorKind::Validation,
                format!("steps without a PASS result: {}", pending.join(", ")),
            );
            return self.finish(MetaRunStatus::Failed, Some(reason));
        }

        let last_run_id = self
            .plan
            .steps
            .last()
            .and_then(|step| self.results.get(&step.id))
            .and_then(|result| result.run_id.clone());
        let report = match &last_run_id {
            Some(run_id) => read_run_report(&self.runs_dir, run_id)?,
            None => None,
        };
        let verified = report.as_ref().is_some_and(|r| {
            r.lifecycle_passed() && r.integrity_passed() && r.validate_exit_code == Some(0)
        });
        if !verified {
            let detail = match &report {
                Some(r) => format!(
                    "lifecycle {}, integrity {}, validate exit {:?}",
                    r.lifecycle_or_unknown(),
                    r.integrity_or_unknown(),
                    r.validate_exit_code
                ),
                None => "run manifest missing".to_string(),
            };
            let reason = classified(
                ErrorKind::Validation,
                format!(
                    "final re-check of run {} failed: {detail}",
                    last_run_id.as_deref().unwrap_or("<none>")
                ),
            );
            return self.finish(MetaRunStatus::Failed, Some(reason));
        }
        self.finish(MetaRunStatus::Pass, None)
    }

    fn finish(&mut self, status: MetaRunStatus, reason: Option<String>) -> Result<()> {
        self.manifest.status = status;
        self.manifest.reason = reason;
        self.manifest.current_step_index = self
            .plan
            .steps
            .iter()
            .position(|step| !self.results.is_passed(&step.id))
            .unwrap_or(self.plan.steps.len());
        self.persist()?;
        info!(status = status.as_str(), "meta run finished");
        Ok(())
    }

    fn invoke(&mut self, task: &str, label: &str) -> Result<StepRun> {
        self.manifest.invocations += 1;
        let request = StepRequest {
            task: task.to_string(),
            max_retries: self.cfg.max_retries,
            log_path: self
                .store
                .path(&format!("{:03}-{label}.log", self.manifest.invocations)),
        };
        let run = execute_step(self.collab.invoker, &self.runs_dir, &request)?;
        if let Some(run_id) = &run.run_id {
            self.manifest.last_run_id = Some(run_id.clone());
        }
        Ok(run)
    }

    /// Named after the invocation whose failure it diagnoses.
    fn diagnostics_log(&self, step: &Step) -> PathBuf {
        self.store.path(&format!(
            "{:03}-diagnostics-{}.log",
            self.manifest.invocations, step.id
        ))
    }

    /// Step results, manifest, then context health (which may write or remove
    /// the continuation bundle).
    fn persist(&mut self) -> Result<()> {
        self.manifest.completed_steps = self
            .plan
            .steps
            .iter()
            .filter(|step| self.results.is_passed(&step.id))
            .count();
        self.manifest.updated_at = now_rfc3339();
        self.store.write_step_results(&self.results)?;
        self.store.write_manifest(&self.manifest)?;
        context_health::refresh(
            &self.store,
            &self.runs_dir,
            &self.plan,
            &self.results,
            self.manifest.last_run_id.as_deref(),
            self.cfg.context_threshold_bytes,
            Utc::now(),
        )?;
        Ok(())
    }
}

fn step_result(step: &Step, run: &StepRun) -> MetaStepResult {
    let report = run.report.as_ref();
    MetaStepResult {
        step_id: step.id.clone(),
        step_type: step.step_type,
        description: step.description.clone(),
        run_id: run.run_id.clone(),
        lifecycle_state: report
            .map_or("UNKNOWN", |r| r.lifecycle_or_unknown())
            .to_string(),
        contract_integrity_status: report
            .map_or("UNKNOWN", |r| r.integrity_or_unknown())
            .to_string(),
        validate_exit_code: report.and_then(|r| r.validate_exit_code),
        status: if run.passed() {
            StepStatus::Pass
        } else {
            StepStatus::Failed
        },
    }
}

fn describe_run(run: &StepRun) -> String {
    let mut out = format!(
        "run {} exited {:?}",
        run.run_id.as_deref().unwrap_or("<none>"),
        run.exit_code
    );
    if let Some(report) = &run.report {
        out.push_str(&format!(
            ", lifecycle {}, integrity {}",
            report.lifecycle_or_unknown(),
            report.integrity_or_unknown()
        ));
        if let Some(reason) = &report.reason {
            out.push_str(&format!(" ({reason})"));
        }
    }
    out
}

fn classified(kind: ErrorKind, message: String) -> String {
    PipelineError::new(kind, message).to_string()
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{CONTINUATION_BUNDLE, META_STEP_RESULTS};
    use crate::test_support::{ScriptedInvoker, ScriptedRun};
    use pipeline::error::kind_of;
    use pipeline::test_support::{ScriptedValidationRunner, validation_fail};
    use serde_json::json;
    use std::fs;

    const REFUND_FAILURE: &str = "FAIL src/orders.test.js\n  \
        ✕ refunds keep net total (12 ms)\n\n  ● refunds keep net total\n\n    \
        expected 90, received 100\n      at Object.<anonymous> (src/orders.test.js:14:22)\n";

    struct Workspace {
        _temp: tempfile::TempDir,
        root: PathBuf,
    }

    impl Workspace {
        fn new() -> Self {
            let temp = tempfile::tempdir().expect("tempdir");
            let root = temp.path().to_path_buf();
            Self { _temp: temp, root }
        }

        fn runs_dir(&self) -> PathBuf {
            self.root.join(".pipeline").join("runs")
        }

        fn meta_dir(&self) -> PathBuf {
            self.root.join(".pipeline").join("meta")
        }
    }

    fn run(
        ws: &Workspace,
        cfg: &MetaConfig,
        task: &str,
        invoker: &ScriptedInvoker,
        validation: &ScriptedValidationRunner,
    ) -> Result<MetaOutcome> {
        run_task(
            &ws.root,
            cfg,
            task,
            MetaCollaborators {
                invoker,
                validation,
            },
        )
    }

    fn load(ws: &Workspace, outcome: &MetaOutcome) -> crate::state::PersistedState {
        MetaRunStore::open(&ws.meta_dir(), &outcome.meta_run_id)
            .expect("open")
            .load()
            .expect("load")
    }

    #[test]
    fn clean_pass_runs_every_step_once() {
        let ws = Workspace::new();
        let invoker = ScriptedInvoker::new(
            &ws.runs_dir(),
            [ScriptedRun::pass(), ScriptedRun::pass(), ScriptedRun::pass()],
        );
        let validation = ScriptedValidationRunner::new(Vec::new());

        let outcome = run(
            &ws,
            &MetaConfig::default(),
            "add logging to backend",
            &invoker,
            &validation,
        )
        .expect("run");

        assert!(outcome.passed());
        assert_eq!(crate::exit_codes::for_status(outcome.status), 0);
        let state = load(&ws, &outcome);
        assert_eq!(state.manifest.status, MetaRunStatus::Pass);
        assert_eq!(state.manifest.completed_steps, 3);
        assert_eq!(state.manifest.invocations, 3);
        assert!(state.results.remediation_history.is_empty());
        let tasks = invoker.tasks();
        assert!(tasks[0].starts_with("Backend changes for: add logging to backend"));
        assert!(tasks[2].starts_with("Finalize"));
        invoker.assert_drained().expect("drained");
        assert_eq!(validation.calls(), 0);
    }

    #[test]
    fn single_self_heal_attempt_recovers_and_the_run_continues() {
        let ws = Workspace::new();
        let invoker = ScriptedInvoker::new(
            &ws.runs_dir(),
            [
                ScriptedRun::fail(),
                ScriptedRun::pass(),
                ScriptedRun::pass(),
                ScriptedRun::pass(),
            ],
        );
        let validation = ScriptedValidationRunner::new(vec![validation_fail(REFUND_FAILURE)]);

        let outcome = run(
            &ws,
            &MetaConfig::default(),
            "add logging to backend",
            &invoker,
            &validation,
        )
        .expect("run");

        assert!(outcome.passed());
        let state = load(&ws, &outcome);
        let history = &state.results.remediation_history;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, RemediationStatus::Pass);
        assert_eq!(history[0].source_step_id, "01-backend");
        assert_eq!(history[0].source_run_id.as_deref(), Some("run-test-0001"));
        assert_eq!(history[0].fix_run_id.as_deref(), Some("run-test-0002"));
        assert!(history[0].failing_tests.contains(&"refunds keep net total".to_string()));

        let backend = state.results.get("01-backend").expect("backend result");
        assert_eq!(backend.status, StepStatus::Pass);
        assert_eq!(backend.run_id.as_deref(), Some("run-test-0002"));
        assert_eq!(state.manifest.self_heal_attempts, 1);
        assert_eq!(state.manifest.self_heal_successes, 1);

        let tasks = invoker.tasks();
        assert!(tasks[1].starts_with("Regression fix for step 01-backend"));
        assert!(tasks[1].contains("- refunds keep net total"));
        assert!(tasks[2].starts_with("Add or update tests"));
        invoker.assert_drained().expect("drained");
        validation.assert_drained().expect("drained");
    }

    #[test]
    fn repeated_signature_stalls_before_attempts_run_out() {
        let ws = Workspace::new();
        let cfg = MetaConfig {
            max_self_heal_attempts: 5,
            ..MetaConfig::default()
        };
        let invoker = ScriptedInvoker::new(
            &ws.runs_dir(),
            [
                ScriptedRun::fail(),
                ScriptedRun::fail(),
                ScriptedRun::fail(),
                ScriptedRun::fail(),
            ],
        );
        // Same failure each time, with cosmetic noise that must not matter.
        let validation = ScriptedValidationRunner::new(vec![
            validation_fail(REFUND_FAILURE),
            validation_fail(&REFUND_FAILURE.replace("12 ms", "15 ms")),
            validation_fail(&REFUND_FAILURE.replace("14:22", "15:3")),
            validation_fail(REFUND_FAILURE),
        ]);

        let outcome = run(&ws, &cfg, "add logging to backend", &invoker, &validation).expect("run");

        assert_eq!(outcome.status, MetaRunStatus::Stalled);
        assert_eq!(crate::exit_codes::for_status(outcome.status), 3);
        assert!(outcome.reason.as_deref().is_some_and(|r| r.starts_with("STALLED")));
        let state = load(&ws, &outcome);
        let statuses: Vec<RemediationStatus> = state
            .results
            .remediation_history
            .iter()
            .map(|a| a.status)
            .collect();
        assert_eq!(
            statuses,
            vec![
                RemediationStatus::Failed,
                RemediationStatus::Failed,
                RemediationStatus::Stalled
            ]
        );
        let signatures: Vec<&str> = state
            .results
            .remediation_history
            .iter()
            .map(|a| a.failure_signature.as_str())
            .collect();
        assert!(signatures.windows(2).all(|w| w[0] == w[1]));
        // One step run plus three fix runs; the fourth fix never starts.
        invoker.assert_drained().expect("drained");
        validation.assert_drained().expect("drained");
        assert_eq!(state.manifest.current_step_index, 0);
    }

    #[test]
    fn changing_failures_exhaust_attempts() {
        let ws = Workspace::new();
        let cfg = MetaConfig {
            max_self_heal_attempts: 2,
            ..MetaConfig::default()
        };
        let invoker = ScriptedInvoker::new(
            &ws.runs_dir(),
            [ScriptedRun::fail(), ScriptedRun::fail(), ScriptedRun::fail()],
        );
        let validation = ScriptedValidationRunner::new(vec![
            validation_fail("FAIL a.test.js\n"),
            validation_fail("FAIL b.test.js\n"),
            validation_fail("FAIL c.test.js\n"),
        ]);

        let outcome = run(&ws, &cfg, "add logging to backend", &invoker, &validation).expect("run");

        assert_eq!(outcome.status, MetaRunStatus::MaxSelfHealAttemptsReached);
        assert_eq!(crate::exit_codes::for_status(outcome.status), 4);
        let state = load(&ws, &outcome);
        let last = state.results.remediation_history.last().expect("attempt");
        assert_eq!(last.status, RemediationStatus::MaxAttemptsReached);
        assert_eq!(last.failing_tests, vec!["c.test.js"]);
        invoker.assert_drained().expect("drained");
    }

    #[test]
    fn failure_without_self_heal_stops_the_run() {
        let ws = Workspace::new();
        let cfg = MetaConfig {
            self_heal: false,
            ..MetaConfig::default()
        };
        let invoker = ScriptedInvoker::new(&ws.runs_dir(), [ScriptedRun::fail()]);
        let validation = ScriptedValidationRunner::new(Vec::new());

        let outcome = run(&ws, &cfg, "add logging to backend", &invoker, &validation).expect("run");

        assert_eq!(outcome.status, MetaRunStatus::Failed);
        assert!(outcome.reason.as_deref().is_some_and(|r| r.contains("step 01-backend failed")));
        let state = load(&ws, &outcome);
        assert_eq!(state.results.steps.len(), 1);
        assert_eq!(state.results.steps[0].status, StepStatus::Failed);
        assert!(!state.results.self_heal.enabled);
    }

    #[test]
    fn resume_starts_at_first_unpassed_step() {
        let ws = Workspace::new();
        // Interrupted after two passing steps: the third invocation errors out.
        let first = ScriptedInvoker::new(
            &ws.runs_dir(),
            [ScriptedRun::pass(), ScriptedRun::pass()],
        );
        let validation = ScriptedValidationRunner::new(Vec::new());
        let task = "add a refund API route and a refund button on the orders page";
        let err = run(&ws, &MetaConfig::default(), task, &first, &validation).unwrap_err();
        assert!(err.to_string().contains("exhausted"));

        let meta_run_id = fs::read_dir(ws.meta_dir())
            .expect("meta dir")
            .next()
            .expect("one meta run")
            .expect("entry")
            .file_name()
            .to_string_lossy()
            .to_string();
        let store = MetaRunStore::open(&ws.meta_dir(), &meta_run_id).expect("open");
        let state = store.load().expect("load");
        assert_eq!(state.plan.steps.len(), 4);
        assert_eq!(state.progress.next_index, 2);
        assert_eq!(state.manifest.status, MetaRunStatus::Failed);

        let second = ScriptedInvoker::new(
            &ws.runs_dir(),
            [ScriptedRun::pass(), ScriptedRun::pass()],
        );
        let outcome = resume_task(
            &ws.root,
            &MetaConfig::default(),
            &meta_run_id,
            MetaCollaborators {
                invoker: &second,
                validation: &validation,
            },
        )
        .expect("resume");

        assert!(outcome.passed());
        let tasks = second.tasks();
        assert_eq!(tasks.len(), 2);
        assert!(tasks[0].starts_with("Add or update tests"));
        assert!(tasks[1].starts_with("Finalize"));
        second.assert_drained().expect("drained");
    }

    #[test]
    fn resume_refuses_inconsistent_state() {
        let ws = Workspace::new();
        let invoker = ScriptedInvoker::new(&ws.runs_dir(), [ScriptedRun::pass()]);
        let validation = ScriptedValidationRunner::new(Vec::new());
        let err = run(
            &ws,
            &MetaConfig::default(),
            "add logging to backend",
            &invoker,
            &validation,
        )
        .unwrap_err();
        assert_eq!(kind_of(&err), None);

        let meta_run_id = fs::read_dir(ws.meta_dir())
            .expect("meta dir")
            .next()
            .expect("one meta run")
            .expect("entry")
            .file_name()
            .to_string_lossy()
            .to_string();
        let path = ws.meta_dir().join(&meta_run_id).join(META_STEP_RESULTS);
        let mut value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        value["metaRunId"] = json!("meta-someone-else");
        fs::write(&path, serde_json::to_vec_pretty(&value).expect("encode")).expect("write");

        let untouched = ScriptedInvoker::new(&ws.runs_dir(), Vec::new());
        let err = resume_task(
            &ws.root,
            &MetaConfig::default(),
            &meta_run_id,
            MetaCollaborators {
                invoker: &untouched,
                validation: &validation,
            },
        )
        .unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::ResumeInconsistency));
        assert_eq!(crate::exit_codes::for_error(&err), 5);
        assert!(untouched.tasks().is_empty());
    }

    #[test]
    fn resume_of_a_passed_run_invokes_nothing() {
        let ws = Workspace::new();
        let invoker = ScriptedInvoker::new(
            &ws.runs_dir(),
            [ScriptedRun::pass(), ScriptedRun::pass(), ScriptedRun::pass()],
        );
        let validation = ScriptedValidationRunner::new(Vec::new());
        let outcome = run(
            &ws,
            &MetaConfig::default(),
            "add logging to backend",
            &invoker,
            &validation,
        )
        .expect("run");

        let untouched = ScriptedInvoker::new(&ws.runs_dir(), Vec::new());
        let resumed = resume_task(
            &ws.root,
            &MetaConfig::default(),
            &outcome.meta_run_id,
            MetaCollaborators {
                invoker: &untouched,
                validation: &validation,
            },
        )
        .expect("resume");
        assert!(resumed.passed());
        assert!(untouched.tasks().is_empty());
    }

    #[test]
    fn final_recheck_catches_a_stale_pass() {
        let ws = Workspace::new();
        let stale = ScriptedRun::with_manifest(
            Some(0),
            json!({
                "lifecycleState": "PASS",
                "contractIntegrityStatus": "PASS",
                "validateExitCode": null
            }),
        );
        let invoker = ScriptedInvoker::new(
            &ws.runs_dir(),
            [ScriptedRun::pass(), ScriptedRun::pass(), stale],
        );
        let validation = ScriptedValidationRunner::new(Vec::new());

        let outcome = run(
            &ws,
            &MetaConfig::default(),
            "add logging to backend",
            &invoker,
            &validation,
        )
        .expect("run");

        assert_eq!(outcome.status, MetaRunStatus::Failed);
        assert!(outcome.reason.as_deref().is_some_and(|r| r.contains("final re-check")));
    }

    #[test]
    fn large_state_writes_a_continuation_bundle() {
        let ws = Workspace::new();
        let cfg = MetaConfig {
            context_threshold_bytes: 1,
            ..MetaConfig::default()
        };
        let invoker = ScriptedInvoker::new(
            &ws.runs_dir(),
            [ScriptedRun::pass(), ScriptedRun::pass(), ScriptedRun::pass()],
        );
        let validation = ScriptedValidationRunner::new(Vec::new());
        let outcome = run(&ws, &cfg, "add logging to backend", &invoker, &validation).expect("run");

        let state = load(&ws, &outcome);
        let bundle = state.bundle.expect("bundle");
        assert_eq!(bundle.completed_steps.len(), 3);
        assert!(bundle.remaining_steps.is_empty());
        assert!(
            ws.meta_dir()
                .join(&outcome.meta_run_id)
                .join(CONTINUATION_BUNDLE)
                .exists()
        );
    }
}

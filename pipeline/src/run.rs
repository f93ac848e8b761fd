//! Orchestration for a single `pipeline run`.
//!
//! One task moves through research, design and plan reports, then through
//! implement/validate attempts until a validation round passes or the retry
//! budget runs out. Every attempt is bracketed by a workspace snapshot; a run
//! that ends `FAILED` is rolled back to its base branch and commit.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::bail_kind;
use crate::core::apply::{
    ApplyScope, ChangedPaths, FileStore, apply_patch, check_patch, validate_relative_path,
};
use crate::core::contract::{ContractDiff, IntegrityStatus, placeholder_tests};
use crate::core::diff::{Patch, parse_patch};
use crate::core::lifecycle::{Lifecycle, LifecycleState};
use crate::core::policy::{ForbiddenRules, extract_diff, impacted_files_from_plan, task_branch_name};
use crate::error::{ErrorKind, kind_of};
use crate::gate::{GateContext, run_validation_round};
use crate::io::artifacts::{
    AttemptFile, BRANCHES, BranchRecord, CONTRACT_BASELINE, CONTRACT_PLACEHOLDER_TESTS, DESIGN,
    IMPACTED_FILES, PLAN, RESEARCH, RunArtifactStore, RunManifest, TASK,
};
use crate::io::config::PipelineConfig;
use crate::io::contract_scan::ContractScanner;
use crate::io::disk_store::DiskStore;
use crate::io::generator::{ChangeGenerator, GenerateRequest, Stage};
use crate::io::git::Git;
use crate::io::init::{PipelinePaths, ensure_layout};
use crate::io::prompt::{PromptInputs, render_prompt};
use crate::io::snapshot::{SnapshotManager, attempt_label};
use crate::io::validation::ValidationRunner;
use crate::rollback::{restore_bookkeeping, rollback};

/// Per-invocation options layered over the config file.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub task: String,
    pub max_retries: Option<u32>,
    /// Extra impacted files beyond those named in the plan.
    pub impacted: Vec<String>,
}

/// The external collaborators a run talks to.
pub struct Collaborators<'a, G, V, C> {
    pub generator: &'a G,
    pub validation: &'a V,
    pub scanner: &'a C,
}

/// All mutable state of one run. One instance per run, passed explicitly
/// through every stage.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub task: String,
    pub base_branch: String,
    pub base_commit: String,
    pub task_branch: String,
    pub lifecycle: Lifecycle,
    /// 1-based; never reused within a run.
    pub attempt: u32,
    pub max_retries: u32,
    pub rollback_completed: bool,
    /// Snapshot label of the attempt in flight, if any.
    pub active_snapshot: Option<String>,
    pub contract_hash_before: Option<String>,
    pub contract_hash_after: Option<String>,
    pub integrity_status: IntegrityStatus,
    pub validate_exit_code: Option<i32>,
    pub changed_files: BTreeSet<String>,
    /// Pre-apply contents of files the active attempt wrote under
    /// always-allowed directories (`None` for files it created). Those
    /// directories are git-ignored, so snapshot restore does not cover them.
    pub bookkeeping_originals: BTreeMap<String, Option<String>>,
    pub reason: Option<String>,
    pub finished_at: Option<String>,
}

impl RunContext {
    pub fn new(
        run_id: &str,
        task: &str,
        base_branch: &str,
        base_commit: &str,
        task_branch: &str,
        max_retries: u32,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            task: task.to_string(),
            base_branch: base_branch.to_string(),
            base_commit: base_commit.to_string(),
            task_branch: task_branch.to_string(),
            lifecycle: Lifecycle::default(),
            attempt: 1,
            max_retries,
            rollback_completed: false,
            active_snapshot: None,
            contract_hash_before: None,
            contract_hash_after: None,
            integrity_status: IntegrityStatus::Unknown,
            validate_exit_code: None,
            changed_files: BTreeSet::new(),
            bookkeeping_originals: BTreeMap::new(),
            reason: None,
            finished_at: None,
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.attempt.saturating_sub(1)
    }

    pub fn manifest(&self) -> RunManifest {
        RunManifest {
            run_id: self.run_id.clone(),
            task: self.task.clone(),
            base_branch: self.base_branch.clone(),
            base_commit: self.base_commit.clone(),
            task_branch: self.task_branch.clone(),
            lifecycle_state: self.lifecycle.current(),
            attempts: self.attempt,
            max_retries: self.max_retries,
            retry_count: self.retry_count(),
            contract_hash_before: self.contract_hash_before.clone(),
            contract_hash_after: self.contract_hash_after.clone(),
            contract_integrity_status: self.integrity_status,
            validate_exit_code: self.validate_exit_code,
            changed_files: self.changed_files.iter().cloned().collect(),
            reason: self.reason.clone(),
            rollback_completed: self.rollback_completed,
            finished_at: self.finished_at.clone(),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub state: LifecycleState,
    /// Class of the error that failed the run.
    pub error_kind: Option<ErrorKind>,
    pub manifest: RunManifest,
}

impl RunOutcome {
    pub fn passed(&self) -> bool {
        self.state == LifecycleState::Pass
    }
}

struct Env<'a, G, V, C> {
    root: &'a Path,
    paths: PipelinePaths,
    cfg: &'a PipelineConfig,
    git: Git,
    snapshots: SnapshotManager,
    store: RunArtifactStore,
    collab: Collaborators<'a, G, V, C>,
}

/// A diff that passed every pre-apply check.
struct Proposal {
    diff: String,
    patch: Patch,
    changed: ChangedPaths,
}

/// Why an implement attempt produced nothing to apply.
struct Rejection {
    raw: Option<String>,
    error: anyhow::Error,
}

fn is_retryable(err: &anyhow::Error) -> bool {
    kind_of(err).is_some_and(|kind| !kind.is_fatal())
}

/// Drive one task from a clean workspace to `PASS` or a rolled-back `FAILED`.
///
/// Errors returned here mean the run never started (dirty workspace, bad
/// arguments) or that rollback itself failed. Every other failure is
/// reported through [`RunOutcome`].
#[instrument(skip_all, fields(root = %root.display()))]
pub fn run_task<G: ChangeGenerator, V: ValidationRunner, C: ContractScanner>(
    root: &Path,
    cfg: &PipelineConfig,
    options: &RunOptions,
    collab: Collaborators<'_, G, V, C>,
) -> Result<RunOutcome> {
    let task = options.task.trim();
    if task.is_empty() {
        bail_kind!(Workspace, "task text is empty");
    }
    let max_retries = options.max_retries.unwrap_or(cfg.max_retries);
    if max_retries == 0 {
        bail_kind!(Workspace, "max retries must be >= 1");
    }
    let mut extra_impacted = BTreeSet::new();
    for raw in &options.impacted {
        extra_impacted.insert(validate_relative_path(raw)?);
    }

    let paths = ensure_layout(root)?;
    let git = Git::new(root);
    if let Err(err) = git.ensure_clean() {
        bail_kind!(Workspace, "refusing to start: {err:#}");
    }
    let base_branch = git.current_branch()?;
    let base_commit = git.head_sha()?;

    let snapshots = SnapshotManager::new(git.clone());
    for stale in snapshots.labels()? {
        warn!(label = %stale, "dropping snapshot left by an earlier run");
        snapshots.drop(&stale)?;
    }

    let store = RunArtifactStore::create(&paths.runs_dir)?;
    let stamp = store
        .run_id()
        .strip_prefix("run-")
        .unwrap_or(store.run_id())
        .to_string();
    let task_branch = task_branch_name(task, &stamp);
    store.write_text(TASK, &format!("{task}\n"))?;
    git.checkout_new_branch(&task_branch)
        .with_context(|| format!("create task branch {task_branch}"))?;
    store.write_json(
        BRANCHES,
        &BranchRecord {
            base_branch: base_branch.clone(),
            base_commit: base_commit.clone(),
            task_branch: task_branch.clone(),
        },
    )?;

    let mut ctx = RunContext::new(
        store.run_id(),
        task,
        &base_branch,
        &base_commit,
        &task_branch,
        max_retries,
    );
    info!(run_id = %ctx.run_id, branch = %task_branch, max_retries, "run started");

    let env = Env {
        root,
        paths,
        cfg,
        git,
        snapshots,
        store,
        collab,
    };
    persist(&ctx, &env.store)?;

    let result = drive(&mut ctx, &env, &extra_impacted);
    let error_kind = match result {
        Ok(()) => None,
        Err(err) => {
            let kind = kind_of(&err);
            warn!(err = %format!("{err:#}"), kind = ?kind, "run failed");
            ctx.reason = Some(format!("{err:#}"));
            fail_and_rollback(&mut ctx, &env)?;
            kind
        }
    };

    info!(run_id = %ctx.run_id, state = %ctx.lifecycle.current(), "run finished");
    Ok(RunOutcome {
        run_id: ctx.run_id.clone(),
        state: ctx.lifecycle.current(),
        error_kind,
        manifest: ctx.manifest(),
    })
}

/// Guard-and-advance, then persist the new state.
fn transition(ctx: &mut RunContext, store: &RunArtifactStore, next: LifecycleState) -> Result<()> {
    ctx.lifecycle.advance(next)?;
    if next.is_terminal() {
        ctx.finished_at = Some(Utc::now().to_rfc3339());
    }
    persist(ctx, store)
}

fn persist(ctx: &RunContext, store: &RunArtifactStore) -> Result<()> {
    store.write_lifecycle_state(ctx.lifecycle.current())?;
    store.write_manifest(&ctx.manifest())
}

fn fail_and_rollback<G, V, C>(ctx: &mut RunContext, env: &Env<'_, G, V, C>) -> Result<()> {
    if !ctx.lifecycle.current().is_terminal() {
        ctx.lifecycle.abort()?;
        ctx.finished_at = Some(Utc::now().to_rfc3339());
    }
    persist(ctx, &env.store)?;
    let rolled_back = rollback(ctx, &env.git, &env.snapshots, env.cfg.keep_failed_branch);
    if let Err(err) = &rolled_back {
        let reason = ctx.reason.take().unwrap_or_default();
        ctx.reason = Some(format!("{reason}; rollback failed: {err:#}"));
    }
    persist(ctx, &env.store)?;
    rolled_back.map(|_| ())
}

fn generate<G: ChangeGenerator, V, C>(
    env: &Env<'_, G, V, C>,
    stage: Stage,
    prompt: String,
) -> Result<String> {
    let response = env.collab.generator.generate(&GenerateRequest {
        stage,
        model_id: env.cfg.model_id.clone(),
        prompt,
        workdir: env.root.to_path_buf(),
    })?;
    Ok(response.text)
}

fn drive<G: ChangeGenerator, V: ValidationRunner, C: ContractScanner>(
    ctx: &mut RunContext,
    env: &Env<'_, G, V, C>,
    extra_impacted: &BTreeSet<String>,
) -> Result<()> {
    let store = &env.store;
    let task = ctx.task.clone();

    let mut reports: Vec<String> = Vec::new();
    for (stage, artifact, next) in [
        (Stage::Research, RESEARCH, LifecycleState::ResearchDone),
        (Stage::Design, DESIGN, LifecycleState::DesignDone),
        (Stage::Plan, PLAN, LifecycleState::PlanDone),
    ] {
        let prompt = render_prompt(
            stage,
            &PromptInputs {
                task: &task,
                research: reports.first().map(String::as_str),
                design: reports.get(1).map(String::as_str),
                ..PromptInputs::default()
            },
        )?;
        let text = generate(env, stage, prompt)
            .with_context(|| format!("{stage} stage"))?;
        store.write_text(artifact, &text)?;
        reports.push(text);
        transition(ctx, store, next)?;
    }
    let [research, design, plan] = [&reports[0], &reports[1], &reports[2]];

    let mut impacted = impacted_files_from_plan(plan);
    impacted.extend(extra_impacted.iter().cloned());
    store.write_json(IMPACTED_FILES, &impacted)?;
    debug!(impacted = ?impacted, "impacted files");

    let baseline = env.collab.scanner.snapshot(env.root)?;
    store.write_json(CONTRACT_BASELINE, &baseline)?;
    ctx.contract_hash_before = Some(baseline.hash());
    persist(ctx, store)?;

    let scope = ApplyScope::new(env.cfg.scope.always_allowed_dirs.clone(), impacted.clone());
    let forbidden = env.cfg.scope.forbidden_rules();
    let gate = GateContext {
        root: env.root,
        store,
        validation: env.collab.validation,
        scanner: env.collab.scanner,
        pattern_memory_path: &env.paths.pattern_memory_path,
        require_contract_change: env.cfg.contract.require_change,
    };
    let mut feedback: Vec<String> = Vec::new();

    loop {
        let attempt = ctx.attempt;
        let label = attempt_label(attempt);
        if ctx.active_snapshot.as_deref() != Some(label.as_str()) {
            env.snapshots.create(&label)?;
            ctx.active_snapshot = Some(label.clone());
        }

        let joined = feedback.join("\n");
        let prompt = render_prompt(
            Stage::Implement,
            &PromptInputs {
                task: &task,
                research: Some(research),
                design: Some(design),
                plan: Some(plan),
                impacted_files: Some(&impacted),
                feedback: Some(&joined),
                attempt,
                max_retries: ctx.max_retries,
            },
        )?;
        store.write_text(&AttemptFile::Prompt.name(attempt), &prompt)?;

        let proposal = match propose(env, prompt, &scope, &forbidden) {
            Ok(proposal) => proposal,
            Err(rejection) => {
                record_rejection(store, attempt, &rejection)?;
                env.snapshots.restore(&label)?;
                let error = rejection.error;
                if is_retryable(&error) && attempt < ctx.max_retries {
                    info!(attempt, err = %format!("{error:#}"), "implement attempt rejected, retrying");
                    feedback.push(format!("Attempt {attempt} was rejected: {error:#}\n"));
                    ctx.active_snapshot = None;
                    ctx.attempt += 1;
                    persist(ctx, store)?;
                    continue;
                }
                return Err(error.context(format!("implement attempt {attempt}")));
            }
        };

        store.write_text(&AttemptFile::Diff.name(attempt), &proposal.diff)?;
        let mut disk = DiskStore::new(env.root);
        ctx.bookkeeping_originals.clear();
        for path in proposal.changed.iter().filter(|p| scope.in_always_allowed_dir(p)) {
            ctx.bookkeeping_originals.insert(path.clone(), disk.read(path)?);
        }
        let changed = apply_patch(&proposal.patch, &mut disk, &scope)
            .with_context(|| format!("apply attempt {attempt}"))?;
        debug_assert_eq!(changed, proposal.changed);
        ctx.changed_files = changed.clone();

        ctx.lifecycle
            .expect_one_of(&[LifecycleState::PlanDone, LifecycleState::Retrying])?;
        transition(ctx, store, LifecycleState::Implemented)?;
        transition(ctx, store, LifecycleState::Validating)?;

        let outcome = run_validation_round(&gate, attempt, &changed, &baseline)?;
        ctx.contract_hash_after = Some(outcome.contract.hash());
        ctx.integrity_status = outcome.integrity.status;
        ctx.validate_exit_code = outcome.validate_exit_code();
        persist(ctx, store)?;

        if outcome.integrity_failed() {
            bail_kind!(ContractIntegrity, "{}", outcome.reasons.join("; "));
        }
        if outcome.passed() {
            return finish_pass(ctx, env, &outcome.contract_diff);
        }
        if attempt >= ctx.max_retries {
            bail_kind!(
                Validation,
                "validation failed after {attempt} attempt(s): {}",
                outcome.reasons.join("; ")
            );
        }

        info!(attempt, reasons = ?outcome.reasons, "validation failed, retrying");
        transition(ctx, store, LifecycleState::Retrying)?;
        env.snapshots.restore(&label)?;
        restore_bookkeeping(ctx, env.root)?;
        feedback.push(outcome.feedback());
        ctx.active_snapshot = None;
        ctx.attempt += 1;
        persist(ctx, store)?;
    }
}

/// Generate and pre-check one diff. Nothing on disk changes here.
fn propose<G: ChangeGenerator, V, C>(
    env: &Env<'_, G, V, C>,
    prompt: String,
    scope: &ApplyScope,
    forbidden: &ForbiddenRules,
) -> Result<Proposal, Rejection> {
    let raw = generate(env, Stage::Implement, prompt)
        .map_err(|error| Rejection { raw: None, error })?;
    let reject = |error: anyhow::Error| Rejection {
        raw: Some(raw.clone()),
        error,
    };
    let diff = extract_diff(&raw).map_err(|e| reject(e.into()))?;
    let patch = parse_patch(&diff).map_err(|e| reject(e.into()))?;
    forbidden
        .check(patch.target_paths())
        .map_err(|e| reject(e.into()))?;
    let changed = check_patch(&patch, &DiskStore::new(env.root), scope).map_err(reject)?;
    Ok(Proposal {
        diff,
        patch,
        changed,
    })
}

fn record_rejection(store: &RunArtifactStore, attempt: u32, rejection: &Rejection) -> Result<()> {
    if let Some(raw) = &rejection.raw {
        store.write_text(&AttemptFile::RejectedDiff.name(attempt), raw)?;
    }
    store.write_text(
        &AttemptFile::RejectedReason.name(attempt),
        &format!("{:#}\n", rejection.error),
    )?;
    Ok(())
}

fn finish_pass<G, V, C>(
    ctx: &mut RunContext,
    env: &Env<'_, G, V, C>,
    contract_diff: &ContractDiff,
) -> Result<()> {
    env.store
        .write_text(CONTRACT_PLACEHOLDER_TESTS, &placeholder_tests(contract_diff))?;
    let message = format!("pipeline: {}", first_line(&ctx.task));
    let committed = env.git.commit_all(&message).context("commit passing attempt")?;
    debug!(committed, "task branch updated");
    for attempt in 1..=ctx.attempt {
        env.snapshots.drop(&attempt_label(attempt))?;
    }
    ctx.active_snapshot = None;
    ctx.bookkeeping_originals.clear();
    transition(ctx, &env.store, LifecycleState::Pass)
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default().trim()
}


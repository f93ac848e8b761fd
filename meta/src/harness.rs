//! Isolated `pipeline run` invocations.
//!
//! Each step runs in its own child process so a crash inside a run cannot
//! touch the meta controller's state. The run a step produced is found by
//! diffing the run directories before and after the invocation.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use pipeline::error::{ErrorKind, PipelineError};
use pipeline::io::artifacts::list_run_ids;
use pipeline::io::process::run_command;

use crate::adapter::{RunReport, read_run_report};

/// Overrides where the `pipeline` binary is found.
pub const PIPELINE_BIN_ENV: &str = "PIPELINE_BIN";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRequest {
    pub task: String,
    pub max_retries: u32,
    /// Where the child's combined output is logged.
    pub log_path: PathBuf,
}

pub trait StepInvoker {
    /// Run one task to completion; returns the child's exit code, `None` when
    /// it was killed.
    fn invoke(&self, request: &StepRequest) -> Result<Option<i32>>;
}

/// `pipeline --root <root> run --task <task> --max-retries <n>`.
#[derive(Debug, Clone)]
pub struct ProcessStepInvoker {
    pub binary: PathBuf,
    pub root: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl StepInvoker for ProcessStepInvoker {
    #[instrument(skip_all, fields(log = %request.log_path.display()))]
    fn invoke(&self, request: &StepRequest) -> Result<Option<i32>> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--root")
            .arg(&self.root)
            .arg("run")
            .arg("--task")
            .arg(&request.task)
            .arg("--max-retries")
            .arg(request.max_retries.to_string())
            .current_dir(&self.root);
        let output = run_command(
            cmd,
            None,
            self.timeout,
            self.output_limit_bytes,
            Some(&request.log_path),
        )
        .map_err(|err| {
            PipelineError::new(
                ErrorKind::Collaborator,
                format!("run {}: {err:#}", self.binary.display()),
            )
        })?;
        let exit_code = if output.timed_out {
            None
        } else {
            output.exit_code()
        };
        info!(exit_code = ?exit_code, timed_out = output.timed_out, "pipeline run finished");
        Ok(exit_code)
    }
}

/// Locate the `pipeline` binary: `$PIPELINE_BIN`, else next to this
/// executable.
pub fn pipeline_binary_path() -> Result<PathBuf> {
    if let Some(path) = env::var_os(PIPELINE_BIN_ENV) {
        return Ok(PathBuf::from(path));
    }
    let current = env::current_exe().context("locate current executable")?;
    let dir = current
        .parent()
        .ok_or_else(|| anyhow!("executable {} has no parent", current.display()))?;
    Ok(sibling_binary(dir, "pipeline"))
}

fn sibling_binary(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}{}", env::consts::EXE_SUFFIX))
}

/// What one invocation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRun {
    pub exit_code: Option<i32>,
    pub run_id: Option<String>,
    pub report: Option<RunReport>,
}

impl StepRun {
    /// Exit code 0, lifecycle PASS, and contract integrity PASS.
    pub fn passed(&self) -> bool {
        self.exit_code == Some(0)
            && self
                .report
                .as_ref()
                .is_some_and(|r| r.lifecycle_passed() && r.integrity_passed())
    }
}

/// Invoke one run and identify the run directory it created.
#[instrument(skip_all)]
pub fn execute_step<I: StepInvoker>(
    invoker: &I,
    runs_dir: &Path,
    request: &StepRequest,
) -> Result<StepRun> {
    let before = list_run_ids(runs_dir)?;
    let exit_code = invoker.invoke(request)?;
    let after = list_run_ids(runs_dir)?;

    let created: Vec<&String> = after.difference(&before).collect();
    if created.len() > 1 {
        warn!(created = created.len(), "invocation created more than one run, using the newest");
    }
    let run_id = created.last().map(|id| (*id).clone());
    let report = match &run_id {
        Some(id) => {
            let report = read_run_report(runs_dir, id)?;
            if let Some(declared) = report.as_ref().and_then(|r| r.run_id.as_deref())
                && declared != id
            {
                warn!(dir = %id, declared, "run manifest names a different run id");
            }
            report
        }
        None => {
            warn!("invocation created no run directory");
            None
        }
    };
    debug!(run_id = ?run_id, exit_code = ?exit_code, "step run identified");
    Ok(StepRun {
        exit_code,
        run_id,
        report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedInvoker, ScriptedRun};

    fn request() -> StepRequest {
        StepRequest {
            task: "Backend changes for: add logging".to_string(),
            max_retries: 3,
            log_path: PathBuf::from("/tmp/step-01-backend.log"),
        }
    }

    #[test]
    fn sibling_binary_carries_platform_suffix() {
        let path = sibling_binary(Path::new("/opt/bin"), "pipeline");
        assert_eq!(
            path,
            PathBuf::from(format!("/opt/bin/pipeline{}", env::consts::EXE_SUFFIX))
        );
    }

    #[test]
    fn identifies_the_new_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runs_dir = temp.path().join("runs");
        std::fs::create_dir_all(runs_dir.join("run-00-old")).expect("old run");
        let invoker = ScriptedInvoker::new(&runs_dir, [ScriptedRun::pass()]);

        let run = execute_step(&invoker, &runs_dir, &request()).expect("execute");
        assert_eq!(run.exit_code, Some(0));
        assert_eq!(run.run_id.as_deref(), Some("run-test-0001"));
        assert!(run.passed());
        assert_eq!(invoker.tasks(), vec![request().task]);
    }

    #[test]
    fn missing_run_directory_is_not_a_pass() {
        let temp = tempfile::tempdir().expect("tempdir");
        let invoker = ScriptedInvoker::new(temp.path(), [ScriptedRun::crashed(2)]);
        let run = execute_step(&invoker, temp.path(), &request()).expect("execute");
        assert_eq!(run.run_id, None);
        assert_eq!(run.report, None);
        assert!(!run.passed());
    }

    #[test]
    fn exit_zero_with_failed_integrity_is_not_a_pass() {
        let temp = tempfile::tempdir().expect("tempdir");
        let invoker = ScriptedInvoker::new(
            temp.path(),
            [ScriptedRun::with_manifest(
                Some(0),
                serde_json::json!({
                    "lifecycleState": "PASS",
                    "contractIntegrityStatus": "FAILED",
                    "validateExitCode": 0
                }),
            )],
        );
        let run = execute_step(&invoker, temp.path(), &request()).expect("execute");
        assert!(!run.passed());
    }
}

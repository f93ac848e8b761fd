//! Validation command adapter (the project's test suite).

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::bail_kind;
use crate::io::process::run_command;

#[derive(Debug, Clone)]
pub struct ValidationRequest {
    pub workdir: PathBuf,
    /// Live log of the command's output.
    pub log_path: Option<PathBuf>,
}

/// Outcome of one validation command run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOutput {
    pub exit_code: Option<i32>,
    pub output: String,
    pub timed_out: bool,
}

impl ValidationOutput {
    pub fn passed(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }
}

pub trait ValidationRunner {
    fn run(&self, request: &ValidationRequest) -> Result<ValidationOutput>;
}

/// Runs the configured argv in the workspace.
#[derive(Debug, Clone)]
pub struct CommandValidationRunner {
    pub argv: Vec<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl ValidationRunner for CommandValidationRunner {
    #[instrument(skip_all, fields(command = %self.argv.join(" ")))]
    fn run(&self, request: &ValidationRequest) -> Result<ValidationOutput> {
        let Some((program, args)) = self.argv.split_first() else {
            bail_kind!(Collaborator, "validation command is empty");
        };
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir);
        let output = run_command(
            cmd,
            None,
            self.timeout,
            self.output_limit_bytes,
            request.log_path.as_deref(),
        )
        .context("run validation command")?;
        let result = ValidationOutput {
            exit_code: if output.timed_out {
                None
            } else {
                output.exit_code()
            },
            output: output.combined("validation"),
            timed_out: output.timed_out,
        };
        info!(exit_code = ?result.exit_code, timed_out = result.timed_out, "validation finished");
        Ok(result)
    }
}

//! Change-generation collaborator.
//!
//! The generator is opaque: it receives a rendered prompt and returns text.
//! For the report stages that text is prose; for `implement` it must be a
//! diff, which the diff engine validates.

use std::fmt;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::bail_kind;
use crate::io::process::run_command;

/// Pipeline stage a prompt belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Research,
    Design,
    Plan,
    Implement,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Research => "research",
            Stage::Design => "design",
            Stage::Plan => "plan",
            Stage::Implement => "implement",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub stage: Stage,
    pub model_id: String,
    pub prompt: String,
    pub workdir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedText {
    pub text: String,
}

pub trait ChangeGenerator {
    fn generate(&self, request: &GenerateRequest) -> Result<GeneratedText>;
}

/// Runs a configured command with the prompt on stdin and takes stdout as
/// the response.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    pub argv: Vec<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl ChangeGenerator for CommandGenerator {
    #[instrument(skip_all, fields(stage = %request.stage, model = %request.model_id))]
    fn generate(&self, request: &GenerateRequest) -> Result<GeneratedText> {
        let Some((program, args)) = self.argv.split_first() else {
            bail_kind!(Collaborator, "generator command is empty");
        };
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&request.workdir)
            .env("PIPELINE_STAGE", request.stage.as_str())
            .env("PIPELINE_MODEL", &request.model_id);

        debug!(prompt_bytes = request.prompt.len(), "invoking generator");
        let output = run_command(
            cmd,
            Some(request.prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
            None,
        )
        .with_context(|| format!("run generator for {} stage", request.stage))?;

        if output.timed_out {
            warn!("generator timed out");
            bail_kind!(
                Collaborator,
                "generator timed out after {}s during {}",
                self.timeout.as_secs(),
                request.stage
            );
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail_kind!(
                Collaborator,
                "generator exited with {:?} during {}: {}",
                output.exit_code(),
                request.stage,
                stderr.trim()
            );
        }
        if output.stdout_truncated > 0 {
            bail_kind!(
                Collaborator,
                "generator output exceeded {} bytes during {}",
                self.output_limit_bytes,
                request.stage
            );
        }
        Ok(GeneratedText {
            text: output.stdout_lossy(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, kind_of};

    fn request(stage: Stage) -> GenerateRequest {
        GenerateRequest {
            stage,
            model_id: "m1".to_string(),
            prompt: "hello".to_string(),
            workdir: std::env::temp_dir(),
        }
    }

    fn generator(script: &str) -> CommandGenerator {
        CommandGenerator {
            argv: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            timeout: Duration::from_secs(10),
            output_limit_bytes: 4096,
        }
    }

    #[test]
    fn returns_stdout_and_sees_stage() {
        let out = generator("printf '%s:' \"$PIPELINE_STAGE\"; cat")
            .generate(&request(Stage::Plan))
            .expect("generate");
        assert_eq!(out.text, "plan:hello");
    }

    #[test]
    fn nonzero_exit_is_collaborator_error() {
        let err = generator("echo nope >&2; exit 4")
            .generate(&request(Stage::Implement))
            .unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::Collaborator));
        assert!(err.to_string().contains("nope"));
    }
}

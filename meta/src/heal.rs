//! Self-heal building blocks: diagnostics capture, fix-task synthesis, and
//! stall detection over failure signatures.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use pipeline::core::diagnostics::FailureDiagnostics;
use pipeline::io::validation::{ValidationRequest, ValidationRunner};

use crate::adapter::RunReport;
use crate::plan::Step;
use crate::state::RemediationStatus;

/// Failing tests named in a fix task.
pub const FIX_TASK_TEST_LIMIT: usize = 8;
const FIX_TASK_EXCERPT_CHARS: usize = 1_200;

/// Run the validation command directly and fingerprint what failed.
pub fn capture_diagnostics<V: ValidationRunner>(
    validation: &V,
    root: &Path,
    log_path: &Path,
    report: Option<&RunReport>,
) -> Result<FailureDiagnostics> {
    let output = validation
        .run(&ValidationRequest {
            workdir: root.to_path_buf(),
            log_path: Some(log_path.to_path_buf()),
        })
        .context("capture self-heal diagnostics")?;
    let (lifecycle, integrity) = match report {
        Some(report) => (report.lifecycle_or_unknown(), report.integrity_or_unknown()),
        None => ("UNKNOWN", "UNKNOWN"),
    };
    let diagnostics =
        FailureDiagnostics::capture(&output.output, output.exit_code, lifecycle, integrity);
    debug!(
        exit_code = ?diagnostics.exit_code,
        failing_tests = diagnostics.failing_tests.len(),
        signature = %diagnostics.signature(),
        "diagnostics captured"
    );
    Ok(diagnostics)
}

/// Task text for one regression-fix run.
pub fn fix_task(step: &Step, diagnostics: &FailureDiagnostics) -> String {
    let mut out = format!(
        "Regression fix for step {} ({}): {}\n",
        step.id, step.step_type, step.description
    );
    let tests = diagnostics.tests_excerpt(FIX_TASK_TEST_LIMIT);
    if tests.is_empty() {
        out.push_str("\nNo failing test names were reported");
        match diagnostics.exit_code {
            Some(code) => out.push_str(&format!(" (validation exit code {code}).\n")),
            None => out.push_str(" (validation did not exit cleanly).\n"),
        }
    } else {
        out.push_str("\nFailing tests:\n");
        for test in tests {
            out.push_str(&format!("- {test}\n"));
        }
        let hidden = diagnostics.failing_tests.len() - tests.len();
        if hidden > 0 {
            out.push_str(&format!("- ... and {hidden} more\n"));
        }
    }
    if !diagnostics.first_failure.is_empty() {
        out.push_str("\nFirst failure:\n");
        out.push_str(&truncate_chars(
            &diagnostics.first_failure,
            FIX_TASK_EXCERPT_CHARS,
        ));
        out.push('\n');
    }
    out.push_str("\nMake the failing tests pass without weakening them.\n");
    out
}

fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}\n[truncated]", &text[..cut]),
        None => text.to_string(),
    }
}

/// Counts consecutive self-heal attempts that failed with the same signature.
#[derive(Debug, Clone)]
pub struct StallTracker {
    threshold: u32,
    previous: Option<String>,
    streak: u32,
}

impl StallTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            previous: None,
            streak: 0,
        }
    }

    /// Record a failed attempt's signature; true once the streak reaches the
    /// threshold.
    pub fn observe(&mut self, signature: &str) -> bool {
        if self.previous.as_deref() == Some(signature) {
            self.streak += 1;
        } else {
            self.streak = 1;
            self.previous = Some(signature.to_string());
        }
        self.streak >= self.threshold
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }
}

/// Status recorded for a failed attempt. A stall wins over exhaustion.
pub fn failed_attempt_status(stalled: bool, attempt: u32, max_attempts: u32) -> RemediationStatus {
    if stalled {
        RemediationStatus::Stalled
    } else if attempt >= max_attempts {
        RemediationStatus::MaxAttemptsReached
    } else {
        RemediationStatus::Failed
    }
}

//! One validation round for an implemented attempt.
//!
//! Order: the security, financial and concurrency scans run concurrently and
//! are joined; the regression check compares their high-severity findings
//! with the run's pattern memory; the contract is re-derived, diffed against
//! the baseline and checked for integrity; finally the test command runs.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::thread;

use anyhow::{Result, anyhow};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::contract::{
    ContractDiff, ContractSnapshot, IntegrityReport, IntegrityStatus, diff as contract_diff,
    integrity,
};
use crate::core::diagnostics::FailureDiagnostics;
use crate::core::lifecycle::LifecycleState;
use crate::core::scan::{
    ScanReport, Severity, SourceFile, concurrency_scan, financial_scan, regression_check,
    security_scan,
};
use crate::io::artifacts::{AttemptFile, CONTRACT_INTEGRITY, RunArtifactStore};
use crate::io::contract_scan::ContractScanner;
use crate::io::pattern_memory::{load_pattern_memory, save_pattern_memory};
use crate::io::validation::{ValidationOutput, ValidationRequest, ValidationRunner};

/// Failing tests listed in retry feedback.
const FEEDBACK_TEST_LIMIT: usize = 8;

/// Everything a validation round needs from the run.
pub struct GateContext<'a, V, C> {
    pub root: &'a Path,
    pub store: &'a RunArtifactStore,
    pub validation: &'a V,
    pub scanner: &'a C,
    pub pattern_memory_path: &'a Path,
    pub require_contract_change: bool,
}

#[derive(Debug, Clone)]
pub struct GateOutcome {
    pub attempt: u32,
    /// Why the round failed; empty on pass.
    pub reasons: Vec<String>,
    pub scans: Vec<ScanReport>,
    pub regression: ScanReport,
    pub contract: ContractSnapshot,
    pub contract_diff: ContractDiff,
    pub integrity: IntegrityReport,
    /// `None` when the test command was skipped.
    pub validation: Option<ValidationOutput>,
    pub diagnostics: Option<FailureDiagnostics>,
}

impl GateOutcome {
    pub fn passed(&self) -> bool {
        self.reasons.is_empty() && self.integrity.status == IntegrityStatus::Pass
    }

    pub fn integrity_failed(&self) -> bool {
        self.integrity.status == IntegrityStatus::Failed
    }

    pub fn validate_exit_code(&self) -> Option<i32> {
        self.validation.as_ref().and_then(|v| v.exit_code)
    }

    /// Feedback for the next implement prompt.
    pub fn feedback(&self) -> String {
        let mut out = format!("Attempt {} failed validation:\n", self.attempt);
        for reason in &self.reasons {
            out.push_str(&format!("- {reason}\n"));
        }
        for finding in self
            .scans
            .iter()
            .chain(std::iter::once(&self.regression))
            .flat_map(|r| r.findings.iter())
            .filter(|f| f.severity >= Severity::Medium)
        {
            out.push_str(&format!(
                "- [{}/{}] {}:{} {}\n",
                finding.stage, finding.kind, finding.file, finding.line, finding.message
            ));
        }
        if let Some(diagnostics) = &self.diagnostics {
            let tests = diagnostics.tests_excerpt(FEEDBACK_TEST_LIMIT);
            if !tests.is_empty() {
                out.push_str(&format!("Failing tests: {}\n", tests.join(", ")));
            }
            if !diagnostics.first_failure.is_empty() {
                out.push_str("First failure:\n```\n");
                out.push_str(&diagnostics.first_failure);
                out.push_str("\n```\n");
            }
        }
        out
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ContractRecord<'a> {
    hash: String,
    snapshot: &'a ContractSnapshot,
    diff: &'a ContractDiff,
}

/// Read the changed files that still exist and are text.
fn read_changed(root: &Path, changed: &BTreeSet<String>) -> Vec<(String, String)> {
    changed
        .iter()
        .filter_map(|rel| match fs::read_to_string(root.join(rel)) {
            Ok(content) => Some((rel.clone(), content)),
            Err(err) => {
                debug!(path = %rel, err = %err, "not scanning file");
                None
            }
        })
        .collect()
}

/// Run the three independent scans concurrently; a panicked scan fails the
/// round with the first error observed.
fn run_scans(files: &[SourceFile<'_>]) -> Result<Vec<ScanReport>> {
    thread::scope(|scope| {
        let handles = [
            ("security", scope.spawn(|| security_scan(files))),
            ("financial", scope.spawn(|| financial_scan(files))),
            ("concurrency", scope.spawn(|| concurrency_scan(files))),
        ];
        let mut reports = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            let report = handle
                .join()
                .map_err(|_| anyhow!("{name} scan panicked"))?;
            reports.push(report);
        }
        Ok(reports)
    })
}

#[instrument(skip_all, fields(attempt = attempt, changed = changed.len()))]
pub fn run_validation_round<V: ValidationRunner, C: ContractScanner>(
    ctx: &GateContext<'_, V, C>,
    attempt: u32,
    changed: &BTreeSet<String>,
    baseline: &ContractSnapshot,
) -> Result<GateOutcome> {
    let store = ctx.store;
    let mut reasons = Vec::new();

    let contents = read_changed(ctx.root, changed);
    let files: Vec<SourceFile<'_>> = contents
        .iter()
        .map(|(path, content)| SourceFile { path, content })
        .collect();
    let scans = run_scans(&files)?;
    for report in &scans {
        if report.has_high() {
            reasons.push(format!(
                "{} scan reported {} high-severity finding(s)",
                report.stage,
                report.high_count()
            ));
        }
    }
    store.write_json(&AttemptFile::Scan.name(attempt), &scans)?;

    let mut memory = load_pattern_memory(ctx.pattern_memory_path, store.run_id())?;
    let regression = regression_check(&mut memory, attempt, &scans);
    save_pattern_memory(ctx.pattern_memory_path, store.run_id(), &memory)?;
    if regression.has_high() {
        reasons.push(format!(
            "regression check found {} repeated high-severity finding(s)",
            regression.high_count()
        ));
    }
    store.write_json(&AttemptFile::Regression.name(attempt), &regression)?;

    let contract = ctx.scanner.snapshot(ctx.root)?;
    let diff = contract_diff(baseline, &contract);
    let report = integrity(&contract);
    store.write_json(
        &AttemptFile::Contract.name(attempt),
        &ContractRecord {
            hash: contract.hash(),
            snapshot: &contract,
            diff: &diff,
        },
    )?;
    store.write_json(CONTRACT_INTEGRITY, &report)?;

    if report.status == IntegrityStatus::Failed {
        let missing: Vec<String> = report.missing.iter().map(ToString::to_string).collect();
        warn!(missing = ?missing, "contract integrity failed");
        reasons.push(format!("views call undeclared endpoints: {}", missing.join("; ")));
        return Ok(GateOutcome {
            attempt,
            reasons,
            scans,
            regression,
            contract,
            contract_diff: diff,
            integrity: report,
            validation: None,
            diagnostics: None,
        });
    }

    let validation = ctx.validation.run(&ValidationRequest {
        workdir: ctx.root.to_path_buf(),
        log_path: Some(store.path(&AttemptFile::ValidateLog.name(attempt))),
    })?;
    store.write_json(&AttemptFile::Validation.name(attempt), &validation)?;
    let mut diagnostics = None;
    if !validation.passed() {
        let captured = FailureDiagnostics::capture(
            &validation.output,
            validation.exit_code,
            LifecycleState::Validating.as_str(),
            report.status.as_str(),
        );
        reasons.push(if validation.timed_out {
            "test command timed out".to_string()
        } else {
            format!("test command exited with {:?}", validation.exit_code)
        });
        diagnostics = Some(captured);
    }

    if reasons.is_empty() && ctx.require_contract_change && contract.hash() == baseline.hash() {
        reasons.push("contract map is unchanged from the pre-implementation baseline".to_string());
    }

    info!(attempt, passed = reasons.is_empty(), "validation round finished");
    Ok(GateOutcome {
        attempt,
        reasons,
        scans,
        regression,
        contract,
        contract_diff: diff,
        integrity: report,
        validation: Some(validation),
        diagnostics,
    })
}

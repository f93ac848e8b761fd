//! Canonical view of a run manifest.
//!
//! Run manifests have been written under several field spellings over time.
//! This is the only place that knows them; everything past [`RunReport`] sees
//! canonical names.

use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;

use pipeline::io::artifacts::RUN_MANIFEST;

const RUN_ID_KEYS: &[&str] = &["runId", "run_id", "id"];
const LIFECYCLE_STATE_KEYS: &[&str] = &["lifecycleState", "lifecycle_state", "finalState", "state"];
const INTEGRITY_KEYS: &[&str] = &[
    "contractIntegrityStatus",
    "contract_integrity_status",
    "integrityStatus",
    "contractIntegrity",
];
const VALIDATE_EXIT_KEYS: &[&str] = &[
    "validateExitCode",
    "validate_exit_code",
    "validationExitCode",
    "testExitCode",
];
const REASON_KEYS: &[&str] = &["reason", "failureReason", "error"];

/// What the meta controller needs to know about one finished run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunReport {
    pub run_id: Option<String>,
    pub lifecycle_state: Option<String>,
    pub contract_integrity_status: Option<String>,
    pub validate_exit_code: Option<i32>,
    pub reason: Option<String>,
}

impl RunReport {
    pub fn from_manifest(manifest: &Value) -> Self {
        Self {
            run_id: first_string(manifest, RUN_ID_KEYS),
            lifecycle_state: first_string(manifest, LIFECYCLE_STATE_KEYS)
                .map(|s| s.to_ascii_uppercase()),
            contract_integrity_status: first_integrity(manifest),
            validate_exit_code: first_i32(manifest, VALIDATE_EXIT_KEYS),
            reason: first_string(manifest, REASON_KEYS),
        }
    }

    pub fn lifecycle_passed(&self) -> bool {
        self.lifecycle_state.as_deref() == Some("PASS")
    }

    pub fn integrity_passed(&self) -> bool {
        self.contract_integrity_status.as_deref() == Some("PASS")
    }

    /// Lifecycle state for diagnostics and step results; `UNKNOWN` when absent.
    pub fn lifecycle_or_unknown(&self) -> &str {
        self.lifecycle_state.as_deref().unwrap_or("UNKNOWN")
    }

    pub fn integrity_or_unknown(&self) -> &str {
        self.contract_integrity_status
            .as_deref()
            .unwrap_or("UNKNOWN")
    }
}

/// Read and adapt `<runs_dir>/<run_id>/run_manifest.json`, if present.
pub fn read_run_report(runs_dir: &Path, run_id: &str) -> Result<Option<RunReport>> {
    let path = runs_dir.join(run_id).join(RUN_MANIFEST);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) if err.kind() == IoErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let value: Value =
        serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))?;
    let mut report = RunReport::from_manifest(&value);
    if report.run_id.is_none() {
        report.run_id = Some(run_id.to_string());
    }
    Ok(Some(report))
}

fn first_value<'a>(manifest: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| manifest.get(*key))
        .find(|value| !value.is_null())
}

fn first_string(manifest: &Value, keys: &[&str]) -> Option<String> {
    first_value(manifest, keys)
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn first_i32(manifest: &Value, keys: &[&str]) -> Option<i32> {
    first_value(manifest, keys)
        .and_then(Value::as_i64)
        .and_then(|n| i32::try_from(n).ok())
}

/// Integrity has also been written as a bare boolean or as an object with a
/// `status` field.
fn first_integrity(manifest: &Value) -> Option<String> {
    match first_value(manifest, INTEGRITY_KEYS)? {
        Value::String(status) => Some(status.to_ascii_uppercase()),
        Value::Bool(true) => Some("PASS".to_string()),
        Value::Bool(false) => Some("FAILED".to_string()),
        Value::Object(map) => map
            .get("status")
            .and_then(Value::as_str)
            .map(str::to_ascii_uppercase),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_canonical_manifest() {
        let report = RunReport::from_manifest(&json!({
            "runId": "run-1",
            "lifecycleState": "PASS",
            "contractIntegrityStatus": "PASS",
            "validateExitCode": 0,
            "reason": null
        }));
        assert_eq!(report.run_id.as_deref(), Some("run-1"));
        assert!(report.lifecycle_passed());
        assert!(report.integrity_passed());
        assert_eq!(report.validate_exit_code, Some(0));
        assert_eq!(report.reason, None);
    }

    #[test]
    fn falls_back_through_historical_spellings() {
        let report = RunReport::from_manifest(&json!({
            "run_id": "run-2",
            "finalState": "failed",
            "contractIntegrity": { "status": "failed" },
            "testExitCode": 1,
            "failureReason": "tests failed"
        }));
        assert_eq!(report.run_id.as_deref(), Some("run-2"));
        assert_eq!(report.lifecycle_state.as_deref(), Some("FAILED"));
        assert_eq!(report.contract_integrity_status.as_deref(), Some("FAILED"));
        assert_eq!(report.validate_exit_code, Some(1));
        assert_eq!(report.reason.as_deref(), Some("tests failed"));
    }

    #[test]
    fn earlier_keys_win_and_nulls_are_skipped() {
        let report = RunReport::from_manifest(&json!({
            "lifecycleState": null,
            "lifecycle_state": "PASS",
            "state": "FAILED",
            "integrityStatus": true
        }));
        assert_eq!(report.lifecycle_state.as_deref(), Some("PASS"));
        assert_eq!(report.contract_integrity_status.as_deref(), Some("PASS"));
    }

    #[test]
    fn missing_fields_read_as_unknown() {
        let report = RunReport::from_manifest(&json!({}));
        assert_eq!(report.lifecycle_or_unknown(), "UNKNOWN");
        assert_eq!(report.integrity_or_unknown(), "UNKNOWN");
        assert!(!report.lifecycle_passed());
    }

    #[test]
    fn read_run_report_handles_missing_manifest() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("run-a")).expect("mkdir");
        assert_eq!(read_run_report(temp.path(), "run-a").expect("read"), None);

        fs::write(
            temp.path().join("run-a").join(RUN_MANIFEST),
            r#"{"state":"PASS"}"#,
        )
        .expect("write");
        let report = read_run_report(temp.path(), "run-a")
            .expect("read")
            .expect("report");
        assert_eq!(report.run_id.as_deref(), Some("run-a"));
        assert!(report.lifecycle_passed());
    }
}

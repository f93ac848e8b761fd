//! Normalized failure diagnostics and failure signatures.
//!
//! Test output is noisy: colors, timestamps, durations and source positions
//! change between runs that fail for the same reason. Everything here strips
//! that noise so two captures of the same failure hash identically.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Maximum lines kept from the first failure block.
pub const FIRST_FAILURE_MAX_LINES: usize = 20;

static ANSI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("ansi regex"));
static ISO_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?")
        .expect("timestamp regex")
});
static CLOCK_TIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{1,2}:\d{2}:\d{2}(?:\.\d+)?\b").expect("clock regex"));
static LINE_COL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":\d+:\d+\b").expect("line:col regex"));
static DURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d+(?:\.\d+)?\s?(?:ms|s|sec|secs|seconds)\b").expect("duration regex")
});
static HEX_ADDR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b0x[0-9a-fA-F]+\b").expect("hex regex"));

static CARGO_FAILED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^test (\S+) \.\.\. FAILED$").expect("cargo regex"));
static JEST_CROSS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[✕×]\s+(.+)$").expect("jest cross regex"));
static JEST_BULLET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*●\s+(.+)$").expect("jest bullet regex"));
static PYTEST_FAILED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^FAILED\s+(\S+)").expect("pytest regex"));
static GENERIC_FAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*FAIL\s+(\S.*)$").expect("generic fail regex"));
static TRAILING_DURATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\(\d+(?:\.\d+)?\s?m?s\)$").expect("trailing duration regex"));

static FAILURE_START: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^\s*[●✕×]\s|^FAIL\b|^FAILED\b|\.\.\. FAILED$|panicked at|^\s*(?:Assertion)?Error\b|^---- .* stdout ----$)")
        .expect("failure start regex")
});

pub fn strip_ansi(text: &str) -> String {
    ANSI.replace_all(text, "").into_owned()
}

/// Mask values that differ between otherwise identical failures.
pub fn mask_volatile(text: &str) -> String {
    let text = ISO_TIMESTAMP.replace_all(text, "<ts>");
    let text = CLOCK_TIME.replace_all(&text, "<time>");
    let text = LINE_COL.replace_all(&text, ":<n>:<n>");
    let text = DURATION.replace_all(&text, "<dur>");
    HEX_ADDR.replace_all(&text, "<addr>").into_owned()
}

/// Failing test identifiers, sorted and deduplicated.
pub fn extract_failing_tests(output: &str) -> Vec<String> {
    let clean = strip_ansi(output);
    let mut found = BTreeSet::new();
    for raw in clean.lines() {
        let line = raw.trim_end();
        let name = if let Some(caps) = CARGO_FAILED.captures(line) {
            caps.get(1)
        } else if let Some(caps) = JEST_CROSS.captures(line) {
            caps.get(1)
        } else if let Some(caps) = JEST_BULLET.captures(line) {
            caps.get(1).filter(|m| !m.as_str().starts_with("Console"))
        } else if let Some(caps) = PYTEST_FAILED.captures(line) {
            caps.get(1)
        } else if let Some(caps) = GENERIC_FAIL.captures(line) {
            caps.get(1)
        } else {
            None
        };
        if let Some(name) = name {
            let name = TRAILING_DURATION.replace(name.as_str().trim(), "");
            if !name.is_empty() {
                found.insert(name.into_owned());
            }
        }
    }
    found.into_iter().collect()
}

/// First failure block of the output, masked, at most
/// [`FIRST_FAILURE_MAX_LINES`] lines. Falls back to the output tail when no
/// failure marker is recognized.
pub fn first_failure(output: &str) -> String {
    let clean = strip_ansi(output);
    let lines: Vec<&str> = clean.lines().collect();
    let block: Vec<&str> = match lines.iter().position(|l| FAILURE_START.is_match(l)) {
        Some(start) => lines[start..]
            .iter()
            .take(FIRST_FAILURE_MAX_LINES)
            .copied()
            .collect(),
        None => {
            let non_empty: Vec<&str> = lines.iter().copied().filter(|l| !l.trim().is_empty()).collect();
            let skip = non_empty.len().saturating_sub(FIRST_FAILURE_MAX_LINES);
            non_empty[skip..].to_vec()
        }
    };
    let joined = block
        .iter()
        .map(|l| l.trim_end())
        .collect::<Vec<_>>()
        .join("\n");
    mask_volatile(joined.trim())
}

/// Everything that identifies one failure. Field order is the canonical
/// serialization order used for hashing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureDiagnostics {
    pub failing_tests: Vec<String>,
    pub first_failure: String,
    pub exit_code: Option<i32>,
    pub lifecycle_state: String,
    pub contract_integrity_status: String,
}

impl FailureDiagnostics {
    pub fn capture(
        output: &str,
        exit_code: Option<i32>,
        lifecycle_state: impl Into<String>,
        contract_integrity_status: impl Into<String>,
    ) -> Self {
        Self {
            failing_tests: extract_failing_tests(output),
            first_failure: first_failure(output),
            exit_code,
            lifecycle_state: lifecycle_state.into(),
            contract_integrity_status: contract_integrity_status.into(),
        }
    }

    /// Hex SHA-256 of the canonical JSON form.
    pub fn signature(&self) -> String {
        // Struct fields serialize in declaration order regardless of
        // serde_json map features.
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        hex::encode(hasher.finalize())
    }

    /// First `limit` failing tests, for prompt and task text.
    pub fn tests_excerpt(&self, limit: usize) -> &[String] {
        let end = self.failing_tests.len().min(limit);
        &self.failing_tests[..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JEST_RUN_A: &str = "\u{1b}[31mFAIL\u{1b}[39m src/orders.test.js\n  \
        ✕ refunds keep net total (12 ms)\n  ✓ lists orders (3 ms)\n\n  \
        ● refunds keep net total\n\n    expect(received).toBe(expected)\n    \
        at Object.<anonymous> (src/orders.test.js:41:17)\n    \
        logged 2026-03-01T10:22:33.123Z\n";

    const JEST_RUN_B: &str = "FAIL src/orders.test.js\n  \
        ✕ refunds keep net total (48 ms)\n  ✓ lists orders (1 ms)\n\n  \
        ● refunds keep net total\n\n    expect(received).toBe(expected)\n    \
        at Object.<anonymous> (src/orders.test.js:44:9)\n    \
        logged 2026-03-02T08:01:59.999Z\n";

    #[test]
    fn strips_color_codes() {
        assert_eq!(strip_ansi("\u{1b}[1;31merror\u{1b}[0m: boom"), "error: boom");
    }

    #[test]
    fn masks_volatile_values() {
        let masked = mask_volatile("at 12:04:55 file.js:10:3 took 1.5s ptr 0xdeadBEEF 2026-01-02T03:04:05Z");
        assert_eq!(masked, "at <time> file.js:<n>:<n> took <dur> ptr <addr> <ts>");
    }

    #[test]
    fn extracts_tests_from_common_runners() {
        let output = "test core::a::works ... ok\ntest core::b::breaks ... FAILED\n\
            FAILED tests/test_pay.py::test_fee - AssertionError\n\
            × adds items (4 ms)\n● Console\n";
        assert_eq!(
            extract_failing_tests(output),
            vec![
                "adds items".to_string(),
                "core::b::breaks".to_string(),
                "tests/test_pay.py::test_fee".to_string(),
            ]
        );
    }

    #[test]
    fn failing_tests_are_order_independent() {
        let a = extract_failing_tests("FAIL b.test.js\nFAIL a.test.js\n");
        let b = extract_failing_tests("FAIL a.test.js\nFAIL b.test.js\nFAIL a.test.js\n");
        assert_eq!(a, b);
    }

    #[test]
    fn first_failure_is_bounded() {
        let mut output = String::from("running\n");
        output.push_str("thread 'x' panicked at src/lib.rs:3:5\n");
        for i in 0..40 {
            output.push_str(&format!("frame {i}\n"));
        }
        let block = first_failure(&output);
        assert_eq!(block.lines().count(), FIRST_FAILURE_MAX_LINES);
        assert!(block.starts_with("thread 'x' panicked at src/lib.rs:<n>:<n>"));
    }

    #[test]
    fn signature_ignores_cosmetic_noise() {
        let a = FailureDiagnostics::capture(JEST_RUN_A, Some(1), "FAILED", "PASS");
        let b = FailureDiagnostics::capture(JEST_RUN_B, Some(1), "FAILED", "PASS");
        assert_eq!(a.failing_tests, vec!["refunds keep net total".to_string(), "src/orders.test.js".to_string()]);
        assert_eq!(a.signature(), b.signature());
    }

    #[test]
    fn signature_tracks_real_differences() {
        let a = FailureDiagnostics::capture(JEST_RUN_A, Some(1), "FAILED", "PASS");
        let other_exit = FailureDiagnostics::capture(JEST_RUN_A, Some(2), "FAILED", "PASS");
        let other_tests = FailureDiagnostics::capture(
            &JEST_RUN_A.replace("net total", "gross total"),
            Some(1),
            "FAILED",
            "PASS",
        );
        assert_ne!(a.signature(), other_exit.signature());
        assert_ne!(a.signature(), other_tests.signature());
        assert_eq!(a.signature().len(), 64);
    }
}

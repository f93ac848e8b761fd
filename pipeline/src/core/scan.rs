//! Heuristic line scans run during a validation round.
//!
//! These are text-pattern lints over the files an attempt changed. They flag
//! suspicious shapes; they do not prove anything about program behavior.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Lines around a refund adjustment searched for a `collected` reference.
const NET_INVARIANT_WINDOW: usize = 5;
/// Lines after an `await` in which a shared read-modify-write is suspicious.
const AWAIT_WINDOW: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStage {
    Security,
    Financial,
    Concurrency,
    Regression,
}

impl ScanStage {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanStage::Security => "security",
            ScanStage::Financial => "financial",
            ScanStage::Concurrency => "concurrency",
            ScanStage::Regression => "regression",
        }
    }
}

impl fmt::Display for ScanStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub stage: ScanStage,
    pub kind: String,
    pub file: String,
    /// 1-based.
    pub line: usize,
    pub severity: Severity,
    pub message: String,
}

impl Finding {
    /// Identity used by the regression pattern memory.
    pub fn pattern_key(&self) -> String {
        format!("{}|{}|{}|{}", self.stage, self.kind, self.file, self.line)
    }
}

/// One file's contents handed to a scan.
#[derive(Debug, Clone, Copy)]
pub struct SourceFile<'a> {
    pub path: &'a str,
    pub content: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub stage: ScanStage,
    pub findings: Vec<Finding>,
}

impl ScanReport {
    pub fn high_count(&self) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::High)
            .count()
    }

    pub fn has_high(&self) -> bool {
        self.high_count() > 0
    }
}

struct LinePattern {
    kind: &'static str,
    severity: Severity,
    message: &'static str,
    regex: &'static LazyLock<Regex>,
}

static EVAL_CALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^\w.])eval\s*\(").expect("eval regex"));
static FUNCTION_CTOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bnew\s+Function\s*\(").expect("function regex"));
static HARDCODED_SECRET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:password|passwd|secret|api_?key|access_?token)\b\s*[:=]\s*["'][^"']{4,}["']"#)
        .expect("secret regex")
});
static INNER_HTML: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.innerHTML\s*=[^=]").expect("innerHTML regex"));
static SHELL_CONCAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:exec|execSync|spawnSync|system)\s*\([^)]*(?:\+\s*\w|\$\{)")
        .expect("shell regex")
});

static MONEY_TO_FIXED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b\w*(?:amount|price|total|balance|fee)\w*\s*\)?\s*\.\s*toFixed\s*\(")
        .expect("toFixed regex")
});
static MONEY_ROUND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:Math\.round|parseFloat)\s*\([^)]*(?:amount|price|total|balance|fee)")
        .expect("round regex")
});
static REFUND_ADJUST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\brefund\w*\s*(?:[-+*/]?=[^=]|\+\+|--)").expect("refund regex"));
static COLLECTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)collected").expect("collected regex"));

static STATIC_MUT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bstatic\s+mut\b").expect("static mut regex"));
static UNSAFE_IMPL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bunsafe\s+impl\b[^{]*\b(?:Sync|Send)\b").expect("unsafe impl regex"));
static FOR_EACH_ASYNC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.forEach\s*\(\s*async\b").expect("forEach regex"));
static AWAIT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bawait\b").expect("await regex"));
static SHARED_RMW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\bthis\.|\bstate\.|\bshared\.|\b)\w*(?i:count|counter|total|balance|stock|inventory)\w*\s*(?:\+\+|--|\+=|-=)")
        .expect("rmw regex")
});
static LOCAL_DECL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:let|const|var)\s").expect("decl regex"));

static SECURITY_PATTERNS: [LinePattern; 5] = [
    LinePattern {
        kind: "dynamic-eval",
        severity: Severity::High,
        message: "dynamic code evaluation with eval()",
        regex: &EVAL_CALL,
    },
    LinePattern {
        kind: "function-constructor",
        severity: Severity::High,
        message: "dynamic code evaluation with new Function()",
        regex: &FUNCTION_CTOR,
    },
    LinePattern {
        kind: "hardcoded-credential",
        severity: Severity::High,
        message: "credential literal committed to source",
        regex: &HARDCODED_SECRET,
    },
    LinePattern {
        kind: "inner-html",
        severity: Severity::Medium,
        message: "assignment to innerHTML",
        regex: &INNER_HTML,
    },
    LinePattern {
        kind: "shell-concat",
        severity: Severity::High,
        message: "shell command built by string concatenation",
        regex: &SHELL_CONCAT,
    },
];

static FINANCIAL_PATTERNS: [LinePattern; 2] = [
    LinePattern {
        kind: "float-rounding",
        severity: Severity::Medium,
        message: "money value rounded with floating-point toFixed()",
        regex: &MONEY_TO_FIXED,
    },
    LinePattern {
        kind: "float-rounding",
        severity: Severity::Medium,
        message: "money value rounded with Math.round/parseFloat",
        regex: &MONEY_ROUND,
    },
];

static CONCURRENCY_PATTERNS: [LinePattern; 3] = [
    LinePattern {
        kind: "static-mut",
        severity: Severity::High,
        message: "mutable static shared across threads",
        regex: &STATIC_MUT,
    },
    LinePattern {
        kind: "unsafe-sync",
        severity: Severity::High,
        message: "manual unsafe Send/Sync implementation",
        regex: &UNSAFE_IMPL,
    },
    LinePattern {
        kind: "async-foreach",
        severity: Severity::Medium,
        message: "forEach(async ...) does not await its callbacks",
        regex: &FOR_EACH_ASYNC,
    },
];

fn is_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("//") || trimmed.starts_with('#') || trimmed.starts_with('*')
}

fn match_lines(stage: ScanStage, patterns: &[LinePattern], file: SourceFile<'_>) -> Vec<Finding> {
    let mut findings = Vec::new();
    for (idx, line) in file.content.lines().enumerate() {
        if is_comment(line) {
            continue;
        }
        for pattern in patterns {
            if pattern.regex.is_match(line) {
                findings.push(Finding {
                    stage,
                    kind: pattern.kind.to_string(),
                    file: file.path.to_string(),
                    line: idx + 1,
                    severity: pattern.severity,
                    message: pattern.message.to_string(),
                });
            }
        }
    }
    findings
}

pub fn security_scan(files: &[SourceFile<'_>]) -> ScanReport {
    let findings = files
        .iter()
        .flat_map(|file| match_lines(ScanStage::Security, &SECURITY_PATTERNS, *file))
        .collect();
    ScanReport {
        stage: ScanStage::Security,
        findings,
    }
}

pub fn financial_scan(files: &[SourceFile<'_>]) -> ScanReport {
    let mut findings = Vec::new();
    for file in files {
        findings.extend(match_lines(ScanStage::Financial, &FINANCIAL_PATTERNS, *file));
        findings.extend(net_invariant(*file));
    }
    ScanReport {
        stage: ScanStage::Financial,
        findings,
    }
}

/// Refund adjustments must sit near a reference to the collected amount.
fn net_invariant(file: SourceFile<'_>) -> Vec<Finding> {
    let lines: Vec<&str> = file.content.lines().collect();
    let mut findings = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        if is_comment(line) || !REFUND_ADJUST.is_match(line) {
            continue;
        }
        let lo = idx.saturating_sub(NET_INVARIANT_WINDOW);
        let hi = (idx + NET_INVARIANT_WINDOW + 1).min(lines.len());
        if lines[lo..hi].iter().any(|l| COLLECTED.is_match(l)) {
            continue;
        }
        findings.push(Finding {
            stage: ScanStage::Financial,
            kind: "net-invariant".to_string(),
            file: file.path.to_string(),
            line: idx + 1,
            severity: Severity::High,
            message: "refund adjusted without reference to the collected amount".to_string(),
        });
    }
    findings
}

pub fn concurrency_scan(files: &[SourceFile<'_>]) -> ScanReport {
    let mut findings = Vec::new();
    for file in files {
        findings.extend(match_lines(ScanStage::Concurrency, &CONCURRENCY_PATTERNS, *file));
        findings.extend(rmw_after_await(*file));
    }
    ScanReport {
        stage: ScanStage::Concurrency,
        findings,
    }
}

fn rmw_after_await(file: SourceFile<'_>) -> Vec<Finding> {
    let lines: Vec<&str> = file.content.lines().collect();
    let mut findings = Vec::new();
    let mut last_await: Option<usize> = None;
    for (idx, line) in lines.iter().enumerate() {
        if is_comment(line) {
            continue;
        }
        let recent_await = last_await.is_some_and(|at| idx - at <= AWAIT_WINDOW);
        if recent_await && SHARED_RMW.is_match(line) && !LOCAL_DECL.is_match(line) {
            findings.push(Finding {
                stage: ScanStage::Concurrency,
                kind: "rmw-after-await".to_string(),
                file: file.path.to_string(),
                line: idx + 1,
                severity: Severity::High,
                message: "shared counter modified after await without a guard".to_string(),
            });
        }
        if AWAIT.is_match(line) {
            last_await = Some(idx);
        }
    }
    findings
}

/// Persisted record of high-severity findings seen across attempts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternMemory {
    #[serde(default)]
    pub patterns: BTreeMap<String, PatternEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternEntry {
    pub occurrences: u32,
    pub first_attempt: u32,
    pub last_attempt: u32,
    pub message: String,
}

/// Flag high-severity findings already present in `memory`, then record this
/// round's high-severity findings. Returns the regression report.
pub fn regression_check(memory: &mut PatternMemory, attempt: u32, reports: &[ScanReport]) -> ScanReport {
    let mut findings = Vec::new();
    for finding in reports
        .iter()
        .flat_map(|r| r.findings.iter())
        .filter(|f| f.severity == Severity::High)
    {
        let key = finding.pattern_key();
        match memory.patterns.get_mut(&key) {
            Some(entry) => {
                if entry.last_attempt != attempt {
                    findings.push(Finding {
                        stage: ScanStage::Regression,
                        kind: format!("repeated-{}", finding.kind),
                        file: finding.file.clone(),
                        line: finding.line,
                        severity: Severity::High,
                        message: format!(
                            "{} (seen {} time(s) since attempt {})",
                            finding.message, entry.occurrences, entry.first_attempt
                        ),
                    });
                }
                entry.occurrences += 1;
                entry.last_attempt = attempt;
            }
            None => {
                memory.patterns.insert(
                    key,
                    PatternEntry {
                        occurrences: 1,
                        first_attempt: attempt,
                        last_attempt: attempt,
                        message: finding.message.clone(),
                    },
                );
            }
        }
    }
    ScanReport {
        stage: ScanStage::Regression,
        findings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file<'a>(path: &'a str, content: &'a str) -> SourceFile<'a> {
        SourceFile { path, content }
    }

    #[test]
    fn security_flags_eval_and_secrets() {
        let src = "const x = eval(input);\nconst apiKey = \"sk-live-1234\";\n// eval(commented)\nobj.evaluate(1);\n";
        let report = security_scan(&[file("src/a.js", src)]);
        let kinds: Vec<_> = report.findings.iter().map(|f| (f.kind.as_str(), f.line)).collect();
        assert_eq!(kinds, vec![("dynamic-eval", 1), ("hardcoded-credential", 2)]);
        assert!(report.has_high());
    }

    #[test]
    fn clean_file_has_no_findings() {
        let src = "router.get('/api/health', (req, res) => res.json({ ok: true }));\n";
        for report in [
            security_scan(&[file("server.js", src)]),
            financial_scan(&[file("server.js", src)]),
            concurrency_scan(&[file("server.js", src)]),
        ] {
            assert!(report.findings.is_empty(), "{report:?}");
        }
    }

    #[test]
    fn refund_needs_collected_nearby() {
        let bad = "function refundOrder(o) {\n  o.refunded += o.amount;\n}\n";
        let good = "function refundOrder(o) {\n  const collected = o.collected;\n  o.refunded += Math.min(o.amount, collected);\n}\n";
        let report = financial_scan(&[file("bad.js", bad), file("good.js", good)]);
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].file, "bad.js");
        assert_eq!(report.findings[0].line, 2);
        assert_eq!(report.findings[0].severity, Severity::High);
    }

    #[test]
    fn money_rounding_is_medium() {
        let report = financial_scan(&[file("cart.js", "const shown = total.toFixed(2);\n")]);
        assert_eq!(report.findings.len(), 1);
        assert!(!report.has_high());
    }

    #[test]
    fn counter_after_await_is_flagged() {
        let src = "async function hit() {\n  const row = await db.get();\n  this.count += 1;\n}\n";
        let report = concurrency_scan(&[file("svc.js", src)]);
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].kind, "rmw-after-await");
        assert_eq!(report.findings[0].line, 3);
    }

    #[test]
    fn regression_flags_only_repeats_from_earlier_attempts() {
        let mut memory = PatternMemory::default();
        let round = vec![security_scan(&[file("a.js", "eval(x);\n")])];

        let first = regression_check(&mut memory, 1, &round);
        assert!(first.findings.is_empty());
        assert!(memory.patterns.contains_key("security|dynamic-eval|a.js|1"));

        let second = regression_check(&mut memory, 2, &round);
        assert_eq!(second.findings.len(), 1);
        assert_eq!(second.findings[0].kind, "repeated-dynamic-eval");
        assert_eq!(memory.patterns["security|dynamic-eval|a.js|1"].occurrences, 2);
    }
}

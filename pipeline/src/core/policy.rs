//! Run policies that sit in front of the diff engine: what a generated diff
//! must look like, which paths it may never touch, and which files a plan
//! declares as impacted.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::apply::validate_relative_path;
use crate::error::{ErrorKind, PipelineError};

/// Every generated diff must start with this marker.
pub const DIFF_MARKER: &str = "diff --git ";

const SLUG_MAX_LEN: usize = 40;

/// Package manifests and lockfiles.
pub const DEFAULT_FORBIDDEN_FILES: &[&str] = &[
    "package.json",
    "package-lock.json",
    "npm-shrinkwrap.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "Cargo.toml",
    "Cargo.lock",
    "go.mod",
    "go.sum",
    "requirements.txt",
    "poetry.lock",
    "Pipfile.lock",
    "Gemfile.lock",
    "composer.lock",
];

/// The pipeline's own state under `.pipeline/`. Other runs and the meta
/// controller read these back, so a generated diff may never write them.
pub const PIPELINE_STATE_PATHS: &[&str] = &[
    ".pipeline/runs",
    ".pipeline/meta",
    ".pipeline/config.toml",
    ".pipeline/meta.toml",
    ".pipeline/pattern_memory.json",
    ".pipeline/.gitignore",
];

/// Secret material.
pub const DEFAULT_FORBIDDEN_EXTENSIONS: &[&str] = &["pem", "key", "p12", "pfx"];

const IMPACTED_EXTENSIONS: &[&str] = &[
    "js", "jsx", "ts", "tsx", "mjs", "cjs", "json", "py", "rs", "go", "java", "kt", "rb", "php",
    "vue", "svelte", "html", "css", "scss", "md", "yml", "yaml", "toml", "sql", "sh",
];

static PATH_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\w.-]+(?:/[\w.-]+)*\.[A-Za-z][A-Za-z0-9]{0,7}$").expect("path token regex")
});

/// Targets a diff may never touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForbiddenRules {
    pub files: Vec<String>,
    pub extensions: Vec<String>,
}

impl Default for ForbiddenRules {
    fn default() -> Self {
        Self {
            files: DEFAULT_FORBIDDEN_FILES.iter().map(|s| s.to_string()).collect(),
            extensions: DEFAULT_FORBIDDEN_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl ForbiddenRules {
    /// Why `path` is forbidden, if it is.
    pub fn violation(&self, path: &str) -> Option<&'static str> {
        let path = path.strip_prefix("./").unwrap_or(path);
        if PIPELINE_STATE_PATHS.iter().any(|state| {
            path == *state || path.strip_prefix(state).is_some_and(|rest| rest.starts_with('/'))
        }) {
            return Some("pipeline state");
        }
        if path.split('/').any(|segment| segment == ".git") {
            return Some("version-control internals");
        }
        let name = path.rsplit('/').next().unwrap_or(path);
        if name == ".env" || name.starts_with(".env.") || name == "id_rsa" || name == "id_ed25519" {
            return Some("secret file");
        }
        if self.files.iter().any(|f| f == name) {
            return Some("package manifest or lockfile");
        }
        if let Some((_, ext)) = name.rsplit_once('.')
            && self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext))
        {
            return Some("secret material");
        }
        None
    }

    /// Reject `paths` when any of them is forbidden.
    pub fn check<'a>(&self, paths: impl IntoIterator<Item = &'a str>) -> Result<(), PipelineError> {
        let hits: Vec<String> = paths
            .into_iter()
            .filter_map(|p| self.violation(p).map(|why| format!("{p} ({why})")))
            .collect();
        if hits.is_empty() {
            return Ok(());
        }
        Err(PipelineError::new(
            ErrorKind::ForbiddenTarget,
            format!("diff touches forbidden targets: {}", hits.join(", ")),
        ))
    }
}

/// Pull the diff out of generator text. A single surrounding code fence is
/// tolerated; anything else before the marker is rejected.
pub fn extract_diff(text: &str) -> Result<String, PipelineError> {
    let mut body = text.trim();
    if body.is_empty() {
        return Err(PipelineError::new(ErrorKind::Parse, "generator returned no diff"));
    }
    if body.starts_with("```") {
        body = body.split_once('\n').map(|(_, rest)| rest).unwrap_or_default();
        body = body.trim_end().strip_suffix("```").unwrap_or(body).trim();
    }
    if !body.starts_with(DIFF_MARKER) {
        let head: String = body.chars().take(60).collect();
        return Err(PipelineError::new(
            ErrorKind::Parse,
            format!("diff must start with '{}', got '{head}'", DIFF_MARKER.trim_end()),
        ));
    }
    let mut out = body.to_string();
    out.push('\n');
    Ok(out)
}

/// Repo-relative file paths mentioned in plan text, sorted.
pub fn impacted_files_from_plan(plan: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for raw in plan.split(|c: char| c.is_whitespace() || "`'\"(),;[]<>*|".contains(c)) {
        let token = raw.trim_end_matches(['.', ':']);
        if token.is_empty() || token.contains("://") || !PATH_TOKEN.is_match(token) {
            continue;
        }
        let Some((_, ext)) = token.rsplit_once('.') else {
            continue;
        };
        if !IMPACTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
            continue;
        }
        if let Ok(path) = validate_relative_path(token) {
            out.insert(path);
        }
    }
    out
}

/// Lowercase, dash-separated, bounded slug of free text.
pub fn task_slug(task: &str) -> String {
    let mut slug = String::new();
    for c in task.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
        if slug.len() >= SLUG_MAX_LEN {
            break;
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "task".to_string()
    } else {
        slug.to_string()
    }
}

/// Task branch name for a run started at `stamp`.
pub fn task_branch_name(task: &str, stamp: &str) -> String {
    format!("pipeline/{}-{stamp}", task_slug(task))
}

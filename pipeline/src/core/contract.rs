//! Backend/frontend contract snapshots.
//!
//! A snapshot pairs the routes the backend declares with the endpoints views
//! call. It is hashed to detect "nothing observable changed", diffed against
//! the pre-implementation baseline, and checked for integrity: every call a
//! view makes must resolve to a declared route.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Placeholder every route parameter normalizes to.
pub const PARAM: &str = ":param";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub method: String,
    pub path: String,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ViewCall {
    pub view: String,
    /// `None` when the call site does not name a method; matches any route
    /// with the same path.
    pub method: Option<String>,
    pub path: String,
}

impl fmt::Display for ViewCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let method = self.method.as_deref().unwrap_or("ANY");
        write!(f, "{} {} (from {})", method, self.path, self.view)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractSnapshot {
    pub endpoints: Vec<Endpoint>,
    pub views_calling: Vec<ViewCall>,
}

impl ContractSnapshot {
    /// Sorted, deduplicated snapshot.
    pub fn new(endpoints: impl IntoIterator<Item = Endpoint>, calls: impl IntoIterator<Item = ViewCall>) -> Self {
        let endpoints: BTreeSet<Endpoint> = endpoints.into_iter().collect();
        let calls: BTreeSet<ViewCall> = calls.into_iter().collect();
        Self {
            endpoints: endpoints.into_iter().collect(),
            views_calling: calls.into_iter().collect(),
        }
    }

    pub fn hash(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractDiff {
    pub added: Vec<Endpoint>,
    pub removed: Vec<Endpoint>,
    /// Same method and path, declared somewhere else.
    pub modified: Vec<Endpoint>,
}

impl ContractDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

pub fn diff(old: &ContractSnapshot, new: &ContractSnapshot) -> ContractDiff {
    let index = |snap: &ContractSnapshot| -> BTreeMap<(String, String), Endpoint> {
        snap.endpoints
            .iter()
            .map(|e| ((e.method.clone(), e.path.clone()), e.clone()))
            .collect()
    };
    let before = index(old);
    let after = index(new);

    let mut out = ContractDiff::default();
    for (key, endpoint) in &after {
        match before.get(key) {
            None => out.added.push(endpoint.clone()),
            Some(prev) if prev.source != endpoint.source => out.modified.push(endpoint.clone()),
            Some(_) => {}
        }
    }
    for (key, endpoint) in &before {
        if !after.contains_key(key) {
            out.removed.push(endpoint.clone());
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntegrityStatus {
    Pass,
    Failed,
    #[default]
    Unknown,
}

impl IntegrityStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IntegrityStatus::Pass => "PASS",
            IntegrityStatus::Failed => "FAILED",
            IntegrityStatus::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for IntegrityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub status: IntegrityStatus,
    pub missing: Vec<ViewCall>,
}

pub fn integrity(snapshot: &ContractSnapshot) -> IntegrityReport {
    let missing: Vec<ViewCall> = snapshot
        .views_calling
        .iter()
        .filter(|call| {
            !snapshot.endpoints.iter().any(|e| {
                e.path == call.path && call.method.as_ref().is_none_or(|m| *m == e.method)
            })
        })
        .cloned()
        .collect();
    let status = if missing.is_empty() {
        IntegrityStatus::Pass
    } else {
        IntegrityStatus::Failed
    };
    IntegrityReport { status, missing }
}

static ROUTE_EXPRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\b(?:app|router|server|routes)\s*\.\s*(get|post|put|patch|delete)\s*\(\s*['"`]([^'"`]+)['"`]"#)
        .expect("express route regex")
});
static ROUTE_ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:#\[|@(?:app\.|router\.)?)(?i:(get|post|put|patch|delete))(?:Mapping)?\s*\(\s*['"]([^'"]+)['"]"#)
        .expect("attribute route regex")
});
static CALL_FETCH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\bfetch\s*\(\s*['"`]([^'"`]+)['"`]"#).expect("fetch regex"));
static CALL_METHOD_OPTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"method\s*:\s*['"](\w+)['"]"#).expect("method option regex"));
static CALL_CLIENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\b(?:axios|api|client|http)\s*\.\s*(get|post|put|patch|delete)\s*(?:<[^>]*>)?\s*\(\s*['"`]([^'"`]+)['"`]"#)
        .expect("client call regex")
});

static ORIGIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https?://[^/]+").expect("origin regex"));
static TEMPLATE_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{[^}]*\}").expect("template param regex"));
static BRACE_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{[^}/]+\}|<[^>/]+>").expect("brace param regex"));
static COLON_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":[A-Za-z_]\w*").expect("colon param regex"));

/// Normalize a route or call path: drop origin and query, collapse every
/// parameter form to [`PARAM`], drop a trailing slash.
pub fn normalize_path(raw: &str) -> String {
    let without_origin = ORIGIN.replace(raw.trim(), "");
    let without_query = without_origin
        .split(['?', '#'])
        .next()
        .unwrap_or_default();
    let templated = TEMPLATE_PARAM.replace_all(without_query, PARAM);
    let braced = BRACE_PARAM.replace_all(&templated, PARAM);
    let mut path = COLON_PARAM.replace_all(&braced, PARAM).into_owned();
    while path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    path
}

const VIEW_EXTENSIONS: &[&str] = &["jsx", "tsx", "vue", "svelte", "html"];
const VIEW_SEGMENTS: &[&str] = &[
    "frontend",
    "client",
    "web",
    "ui",
    "views",
    "pages",
    "components",
    "public",
];

/// Views are UI files: calls are read from views, routes from everything
/// else.
pub fn is_view_file(path: &str) -> bool {
    let extension = path.rsplit_once('.').map(|(_, ext)| ext).unwrap_or_default();
    if VIEW_EXTENSIONS.contains(&extension) {
        return true;
    }
    path.split('/')
        .rev()
        .skip(1)
        .any(|segment| VIEW_SEGMENTS.contains(&segment))
}

/// Routes declared in one backend source file.
pub fn extract_endpoints(path: &str, content: &str) -> Vec<Endpoint> {
    let mut out = Vec::new();
    for line in content.lines() {
        for regex in [&*ROUTE_EXPRESS, &*ROUTE_ATTRIBUTE] {
            for caps in regex.captures_iter(line) {
                let (Some(method), Some(route)) = (caps.get(1), caps.get(2)) else {
                    continue;
                };
                if !route.as_str().starts_with('/') {
                    continue;
                }
                out.push(Endpoint {
                    method: method.as_str().to_ascii_uppercase(),
                    path: normalize_path(route.as_str()),
                    source: path.to_string(),
                });
            }
        }
    }
    out
}

/// Endpoint calls made by one view file.
pub fn extract_calls(path: &str, content: &str) -> Vec<ViewCall> {
    let mut out = Vec::new();
    for line in content.lines() {
        for caps in CALL_FETCH.captures_iter(line) {
            let Some(target) = caps.get(1) else { continue };
            let method = CALL_METHOD_OPTION
                .captures(&line[target.end()..])
                .and_then(|m| m.get(1))
                .map(|m| m.as_str().to_ascii_uppercase());
            push_call(&mut out, path, method, target.as_str());
        }
        for caps in CALL_CLIENT.captures_iter(line) {
            let (Some(method), Some(target)) = (caps.get(1), caps.get(2)) else {
                continue;
            };
            push_call(
                &mut out,
                path,
                Some(method.as_str().to_ascii_uppercase()),
                target.as_str(),
            );
        }
    }
    out
}

fn push_call(out: &mut Vec<ViewCall>, view: &str, method: Option<String>, target: &str) {
    let normalized = normalize_path(target);
    if !normalized.starts_with('/') {
        return;
    }
    out.push(ViewCall {
        view: view.to_string(),
        method,
        path: normalized,
    });
}

/// Markdown with one pending test per added or modified endpoint.
pub fn placeholder_tests(diff: &ContractDiff) -> String {
    let mut out = String::from("# Contract placeholder tests\n\n");
    let surface: Vec<&Endpoint> = diff.added.iter().chain(diff.modified.iter()).collect();
    if surface.is_empty() {
        out.push_str("No new or changed endpoints.\n");
        return out;
    }
    out.push_str("```js\n");
    for endpoint in surface {
        out.push_str(&format!(
            "test.todo('{} {} responds as declared in {}');\n",
            endpoint.method, endpoint.path, endpoint.source
        ));
    }
    out.push_str("```\n");
    out
}

//! Contract snapshot collaborator: walks the workspace and extracts routes and
//! view call sites.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, instrument};
use walkdir::{DirEntry, WalkDir};

use crate::core::contract::{ContractSnapshot, extract_calls, extract_endpoints, is_view_file};

const SKIP_DIRS: &[&str] = &[".git", ".pipeline", "node_modules", "target", "dist", "build"];
const SOURCE_EXTENSIONS: &[&str] = &[
    "js", "jsx", "ts", "tsx", "mjs", "cjs", "vue", "svelte", "html", "py", "rs", "java", "kt", "go",
];
/// Larger files are generated or vendored; skip them.
const MAX_SOURCE_BYTES: u64 = 1_000_000;

pub trait ContractScanner {
    fn snapshot(&self, root: &Path) -> Result<ContractSnapshot>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RegexContractScanner;

fn is_skipped_dir(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| SKIP_DIRS.contains(&name))
}

impl ContractScanner for RegexContractScanner {
    #[instrument(skip_all, fields(root = %root.display()))]
    fn snapshot(&self, root: &Path) -> Result<ContractSnapshot> {
        let mut endpoints = Vec::new();
        let mut calls = Vec::new();
        let mut scanned = 0usize;

        for entry in WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_skipped_dir(e))
        {
            let entry = entry.with_context(|| format!("walk {}", root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(root) else {
                continue;
            };
            let rel = rel.to_string_lossy().replace('\\', "/");
            let extension = rel.rsplit_once('.').map(|(_, ext)| ext).unwrap_or_default();
            if !SOURCE_EXTENSIONS.contains(&extension) {
                continue;
            }
            let size = entry
                .metadata()
                .with_context(|| format!("stat {}", entry.path().display()))?
                .len();
            if size > MAX_SOURCE_BYTES {
                continue;
            }
            let Ok(content) = fs::read_to_string(entry.path()) else {
                debug!(path = %rel, "skipping non-utf8 file");
                continue;
            };
            scanned += 1;
            if is_view_file(&rel) {
                calls.extend(extract_calls(&rel, &content));
            } else {
                endpoints.extend(extract_endpoints(&rel, &content));
            }
        }

        let snapshot = ContractSnapshot::new(endpoints, calls);
        debug!(
            scanned,
            endpoints = snapshot.endpoints.len(),
            calls = snapshot.views_calling.len(),
            "contract snapshot computed"
        );
        Ok(snapshot)
    }
}

//! `.pipeline/` layout and scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use super::config::{PipelineConfig, write_config};

/// Everything under `.pipeline/` is bookkeeping; ignoring it keeps the
/// workspace clean and survives `git clean -fd`.
const PIPELINE_GITIGNORE: &str = "*\n";

/// Canonical paths within `.pipeline/` for a workspace root.
#[derive(Debug, Clone)]
pub struct PipelinePaths {
    pub root: PathBuf,
    pub pipeline_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub meta_config_path: PathBuf,
    pub runs_dir: PathBuf,
    pub meta_dir: PathBuf,
    pub pattern_memory_path: PathBuf,
}

impl PipelinePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let pipeline_dir = root.join(".pipeline");
        Self {
            root: root.clone(),
            gitignore_path: pipeline_dir.join(".gitignore"),
            config_path: pipeline_dir.join("config.toml"),
            meta_config_path: pipeline_dir.join("meta.toml"),
            runs_dir: pipeline_dir.join("runs"),
            meta_dir: pipeline_dir.join("meta"),
            pattern_memory_path: pipeline_dir.join("pattern_memory.json"),
            pipeline_dir,
        }
    }
}

/// Make sure `.pipeline/` exists and is ignored. Safe to call on every run.
pub fn ensure_layout(root: &Path) -> Result<PipelinePaths> {
    let paths = PipelinePaths::new(root);
    if paths.pipeline_dir.exists() && !paths.pipeline_dir.is_dir() {
        return Err(anyhow!(".pipeline exists but is not a directory"));
    }
    fs::create_dir_all(&paths.runs_dir)
        .with_context(|| format!("create directory {}", paths.runs_dir.display()))?;
    if !paths.gitignore_path.exists() {
        fs::write(&paths.gitignore_path, PIPELINE_GITIGNORE)
            .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
        debug!(path = %paths.gitignore_path.display(), "wrote bookkeeping gitignore");
    }
    Ok(paths)
}

#[derive(Debug, Clone, Copy)]
pub struct InitOptions {
    /// Overwrite an existing `config.toml`.
    pub force: bool,
}

/// Scaffold `.pipeline/` with a default `config.toml`.
///
/// Fails if the config already exists unless `options.force` is set.
pub fn init_pipeline(root: &Path, options: InitOptions) -> Result<PipelinePaths> {
    let paths = ensure_layout(root)?;
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "pipeline init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }
    write_config(&paths.config_path, &PipelineConfig::default())?;
    Ok(paths)
}

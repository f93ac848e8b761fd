//! Pipeline configuration stored under `.pipeline/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::policy::{DEFAULT_FORBIDDEN_EXTENSIONS, DEFAULT_FORBIDDEN_FILES, ForbiddenRules};
use crate::io::atomic::write_atomic;

/// Placeholder in `generator.command` replaced with `model_id`.
pub const MODEL_PLACEHOLDER: &str = "{model}";

/// Pipeline configuration (TOML).
///
/// Edited by humans; every field has a default so a missing file or a partial
/// file both load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Implement attempts per run before the run fails.
    pub max_retries: u32,

    /// Model identifier handed to the change generator.
    pub model_id: String,

    /// Truncate captured child process output beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Keep the task branch of a failed run instead of deleting it.
    pub keep_failed_branch: bool,

    pub generator: GeneratorConfig,
    pub validation: ValidationConfig,
    pub scope: ScopeConfig,
    pub contract: ContractConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Command that reads a prompt on stdin and prints the response on stdout.
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "llm".to_string(),
                "--model".to_string(),
                MODEL_PLACEHOLDER.to_string(),
            ],
            timeout_secs: 10 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValidationConfig {
    /// Test command (e.g. `["sh","-c","npm test"]`).
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            command: vec!["sh".to_string(), "-c".to_string(), "npm test".to_string()],
            timeout_secs: 15 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScopeConfig {
    /// Directories a patch may always write to.
    pub always_allowed_dirs: Vec<String>,
    /// File names a patch may never touch.
    pub forbidden_files: Vec<String>,
    /// Extensions a patch may never touch.
    pub forbidden_extensions: Vec<String>,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            always_allowed_dirs: vec![".pipeline".to_string()],
            forbidden_files: DEFAULT_FORBIDDEN_FILES.iter().map(|s| s.to_string()).collect(),
            forbidden_extensions: DEFAULT_FORBIDDEN_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl ScopeConfig {
    pub fn forbidden_rules(&self) -> ForbiddenRules {
        ForbiddenRules {
            files: self.forbidden_files.clone(),
            extensions: self.forbidden_extensions.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContractConfig {
    /// A passing attempt must change the contract snapshot.
    pub require_change: bool,
}

impl Default for ContractConfig {
    fn default() -> Self {
        Self {
            require_change: true,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            model_id: "default".to_string(),
            output_limit_bytes: 200_000,
            keep_failed_branch: false,
            generator: GeneratorConfig::default(),
            validation: ValidationConfig::default(),
            scope: ScopeConfig::default(),
            contract: ContractConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(anyhow!("max_retries must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.generator.timeout_secs == 0 {
            return Err(anyhow!("generator.timeout_secs must be > 0"));
        }
        if self.validation.timeout_secs == 0 {
            return Err(anyhow!("validation.timeout_secs must be > 0"));
        }
        if self.generator.command.is_empty() || self.generator.command[0].trim().is_empty() {
            return Err(anyhow!("generator.command must be a non-empty array"));
        }
        if self.validation.command.is_empty() || self.validation.command[0].trim().is_empty() {
            return Err(anyhow!("validation.command must be a non-empty array"));
        }
        for dir in &self.scope.always_allowed_dirs {
            let trimmed = dir.trim_matches('/');
            if trimmed.is_empty() || trimmed.split('/').any(|s| s == "..") {
                return Err(anyhow!(
                    "scope.always_allowed_dirs entries must be relative directories, got '{dir}'"
                ));
            }
        }
        Ok(())
    }

    /// Generator argv with the model placeholder filled in.
    pub fn generator_argv(&self) -> Vec<String> {
        self.generator
            .command
            .iter()
            .map(|arg| arg.replace(MODEL_PLACEHOLDER, &self.model_id))
            .collect()
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PipelineConfig::default()`.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    if !path.exists() {
        let cfg = PipelineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PipelineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &PipelineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, PipelineConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = PipelineConfig::default();
        cfg.max_retries = 5;
        cfg.scope.always_allowed_dirs.push("docs/generated".to_string());
        write_config(&path, &cfg).expect("write");
        assert_eq!(load_config(&path).expect("load"), cfg);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "model_id = \"gpt-x\"\n[validation]\ncommand = [\"cargo\", \"test\"]\n")
            .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.validation.command, vec!["cargo", "test"]);
        assert_eq!(cfg.validation.timeout_secs, ValidationConfig::default().timeout_secs);
        assert_eq!(cfg.generator_argv(), vec!["llm", "--model", "gpt-x"]);
    }

    #[test]
    fn rejects_invalid_values() {
        let mut cfg = PipelineConfig::default();
        cfg.max_retries = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::default();
        cfg.scope.always_allowed_dirs = vec!["../escape".to_string()];
        assert!(cfg.validate().is_err());
    }
}

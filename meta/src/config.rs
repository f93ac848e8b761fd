//! Meta controller configuration.
//!
//! Defaults come from `.pipeline/meta.toml`; command-line flags are applied on
//! top and the merged result is validated once.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MetaConfig {
    /// Enter the self-heal loop when a step fails.
    pub self_heal: bool,
    pub max_self_heal_attempts: u32,
    /// Consecutive identical failure signatures that end the loop as STALLED.
    pub stall_threshold: u32,
    /// Estimated state size above which a continuation bundle is written.
    pub context_threshold_bytes: u64,
    /// Passed to every `pipeline run` as `--max-retries`.
    pub max_retries: u32,
    /// Wall-clock bound for one `pipeline run` child process.
    pub step_timeout_secs: u64,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            self_heal: true,
            max_self_heal_attempts: 3,
            stall_threshold: 3,
            context_threshold_bytes: 120_000,
            max_retries: 3,
            step_timeout_secs: 60 * 60,
        }
    }
}

impl MetaConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_self_heal_attempts == 0 {
            return Err(anyhow!("max_self_heal_attempts must be > 0"));
        }
        if self.stall_threshold < 2 {
            return Err(anyhow!("stall_threshold must be >= 2"));
        }
        if self.context_threshold_bytes == 0 {
            return Err(anyhow!("context_threshold_bytes must be > 0"));
        }
        if self.max_retries == 0 {
            return Err(anyhow!("max_retries must be > 0"));
        }
        if self.step_timeout_secs == 0 {
            return Err(anyhow!("step_timeout_secs must be > 0"));
        }
        Ok(())
    }
}

/// Values given on the command line. `None` keeps the file value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaOverrides {
    pub self_heal: Option<bool>,
    pub max_self_heal_attempts: Option<u32>,
    pub stall_threshold: Option<u32>,
    pub max_retries: Option<u32>,
}

/// Apply command-line overrides to the file config.
pub fn apply_overrides(mut base: MetaConfig, overrides: &MetaOverrides) -> Result<MetaConfig> {
    if let Some(self_heal) = overrides.self_heal {
        base.self_heal = self_heal;
    }
    if let Some(attempts) = overrides.max_self_heal_attempts {
        base.max_self_heal_attempts = attempts;
    }
    if let Some(threshold) = overrides.stall_threshold {
        base.stall_threshold = threshold;
    }
    if let Some(max_retries) = overrides.max_retries {
        base.max_retries = max_retries;
    }
    base.validate()?;
    Ok(base)
}

/// Load `.pipeline/meta.toml`, or defaults when it does not exist.
///
/// Validation is deferred to [`apply_overrides`] so a flag can repair a bad
/// file value.
pub fn load_meta_config(path: &Path) -> Result<MetaConfig> {
    if !path.exists() {
        return Ok(MetaConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_meta_config(&temp.path().join("meta.toml")).expect("load");
        assert_eq!(cfg, MetaConfig::default());
        assert!(cfg.self_heal);
        assert_eq!(cfg.stall_threshold, 3);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("meta.toml");
        fs::write(&path, "self_heal = false\nmax_self_heal_attempts = 5\n").expect("write");
        let cfg = load_meta_config(&path).expect("load");
        assert!(!cfg.self_heal);
        assert_eq!(cfg.max_self_heal_attempts, 5);
        assert_eq!(cfg.context_threshold_bytes, 120_000);
    }

    #[test]
    fn flags_override_file_values() {
        let base = MetaConfig {
            self_heal: false,
            ..MetaConfig::default()
        };
        let merged = apply_overrides(
            base,
            &MetaOverrides {
                self_heal: Some(true),
                stall_threshold: Some(4),
                ..MetaOverrides::default()
            },
        )
        .expect("merge");
        assert!(merged.self_heal);
        assert_eq!(merged.stall_threshold, 4);
        assert_eq!(merged.max_self_heal_attempts, 3);
    }

    #[test]
    fn merged_config_is_validated() {
        let err = apply_overrides(
            MetaConfig::default(),
            &MetaOverrides {
                max_self_heal_attempts: Some(0),
                ..MetaOverrides::default()
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_self_heal_attempts"));
    }
}

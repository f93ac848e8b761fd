//! Persisted regression pattern memory (`.pipeline/pattern_memory.json`).
//!
//! The file is read and rewritten wholesale once per validation round. It is
//! scoped to one run: a memory left behind by another run id is discarded,
//! since attempt numbers restart with every run.

use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::scan::PatternMemory;
use crate::io::atomic::write_json_atomic;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredMemory {
    run_id: String,
    #[serde(flatten)]
    memory: PatternMemory,
}

pub fn load_pattern_memory(path: &Path, run_id: &str) -> Result<PatternMemory> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == IoErrorKind::NotFound => return Ok(PatternMemory::default()),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let stored: StoredMemory =
        serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))?;
    if stored.run_id != run_id {
        debug!(stale = %stored.run_id, "discarding pattern memory from another run");
        return Ok(PatternMemory::default());
    }
    Ok(stored.memory)
}

pub fn save_pattern_memory(path: &Path, run_id: &str, memory: &PatternMemory) -> Result<()> {
    write_json_atomic(
        path,
        &StoredMemory {
            run_id: run_id.to_string(),
            memory: memory.clone(),
        },
    )
}

//! Test-only helpers: scratch git repositories and scripted collaborators.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::io::generator::{ChangeGenerator, GenerateRequest, GeneratedText, Stage};
use crate::io::git::Git;
use crate::io::validation::{ValidationOutput, ValidationRequest, ValidationRunner};

/// A throwaway git repository seeded with a tiny backend/frontend pair whose
/// contract is intact.
pub struct TestRepo {
    _temp: TempDir,
    root: PathBuf,
}

impl TestRepo {
    pub const APP_JS: &'static str = "console.log('app');\n";
    pub const ROUTES_JS: &'static str = "router.get('/api/orders', listOrders);\n";
    pub const API_JS: &'static str = "export const loadOrders = () => fetch('/api/orders');\n";

    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create temp dir")?;
        let root = temp.path().to_path_buf();
        git(&root, &["init", "-q"])?;
        git(&root, &["symbolic-ref", "HEAD", "refs/heads/main"])?;
        git(&root, &["config", "user.email", "pipeline@example.com"])?;
        git(&root, &["config", "user.name", "Pipeline Test"])?;
        git(&root, &["config", "commit.gpgsign", "false"])?;

        let repo = Self { _temp: temp, root };
        repo.write("app.js", Self::APP_JS)?;
        repo.write("server/routes.js", Self::ROUTES_JS)?;
        repo.write("frontend/src/api.js", Self::API_JS)?;
        git(&repo.root, &["add", "-A"])?;
        git(&repo.root, &["commit", "-q", "-m", "seed"])?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn git(&self) -> Git {
        Git::new(&self.root)
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        let path = self.root.join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    pub fn remove(&self, rel: &str) -> Result<()> {
        let path = self.root.join(rel);
        fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.root.join(rel).exists()
    }

    /// Commit everything currently in the worktree.
    pub fn commit(&self, message: &str) -> Result<()> {
        git(&self.root, &["add", "-A"])?;
        git(&self.root, &["commit", "-q", "-m", message])
    }
}

fn git(root: &Path, args: &[&str]) -> Result<()> {
    let output = Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !output.status.success() {
        return Err(anyhow!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(())
}

/// One scripted generator reply.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    Fail(String),
}

/// Generator that replays queued replies in order, checking each request's
/// stage against the script.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    queue: RefCell<VecDeque<(Stage, ScriptedReply)>>,
    seen: RefCell<Vec<(Stage, String)>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the three report stages with short canned text. `plan` is used
    /// verbatim so tests control the impacted-file list.
    pub fn with_reports(self, plan: &str) -> Self {
        self.then(Stage::Research, "research notes")
            .then(Stage::Design, "design notes")
            .then(Stage::Plan, plan)
    }

    pub fn then(self, stage: Stage, text: &str) -> Self {
        self.queue
            .borrow_mut()
            .push_back((stage, ScriptedReply::Text(text.to_string())));
        self
    }

    pub fn then_fail(self, stage: Stage, message: &str) -> Self {
        self.queue
            .borrow_mut()
            .push_back((stage, ScriptedReply::Fail(message.to_string())));
        self
    }

    /// Prompts received so far, in order.
    pub fn prompts(&self) -> Vec<(Stage, String)> {
        self.seen.borrow().clone()
    }

    pub fn assert_drained(&self) -> Result<()> {
        let remaining = self.queue.borrow().len();
        if remaining > 0 {
            return Err(anyhow!("scripted generator has {remaining} unused replies"));
        }
        Ok(())
    }
}

impl ChangeGenerator for ScriptedGenerator {
    fn generate(&self, request: &GenerateRequest) -> Result<GeneratedText> {
        self.seen
            .borrow_mut()
            .push((request.stage, request.prompt.clone()));
        let (stage, reply) = self
            .queue
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted generator exhausted at {}", request.stage))?;
        if stage != request.stage {
            return Err(anyhow!(
                "scripted generator expected {stage} request, got {}",
                request.stage
            ));
        }
        match reply {
            ScriptedReply::Text(text) => Ok(GeneratedText { text }),
            ScriptedReply::Fail(message) => Err(anyhow!(message)),
        }
    }
}

/// Validation runner that replays queued outputs and writes each to the
/// requested log.
#[derive(Debug, Default)]
pub struct ScriptedValidationRunner {
    queue: RefCell<VecDeque<ValidationOutput>>,
    calls: RefCell<usize>,
}

impl ScriptedValidationRunner {
    pub fn new(outputs: impl IntoIterator<Item = ValidationOutput>) -> Self {
        Self {
            queue: RefCell::new(outputs.into_iter().collect()),
            calls: RefCell::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        *self.calls.borrow()
    }

    pub fn assert_drained(&self) -> Result<()> {
        let remaining = self.queue.borrow().len();
        if remaining > 0 {
            return Err(anyhow!("scripted validation has {remaining} unused outputs"));
        }
        Ok(())
    }
}

impl ValidationRunner for ScriptedValidationRunner {
    fn run(&self, request: &ValidationRequest) -> Result<ValidationOutput> {
        *self.calls.borrow_mut() += 1;
        let output = self
            .queue
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted validation exhausted"))?;
        if let Some(log) = &request.log_path {
            fs::write(log, &output.output).with_context(|| format!("write {}", log.display()))?;
        }
        Ok(output)
    }
}

/// A passing validation output.
pub fn validation_pass() -> ValidationOutput {
    ValidationOutput {
        exit_code: Some(0),
        output: "Tests: 3 passed, 3 total\n".to_string(),
        timed_out: false,
    }
}

/// A failing validation output carrying `output` verbatim.
pub fn validation_fail(output: &str) -> ValidationOutput {
    ValidationOutput {
        exit_code: Some(1),
        output: output.to_string(),
        timed_out: false,
    }
}

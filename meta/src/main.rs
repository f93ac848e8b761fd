//! `meta` CLI: chain `pipeline run` invocations into a resumable multi-step
//! run with self-healing.

mod adapter;
mod config;
mod context_health;
mod exit_codes;
mod harness;
mod heal;
mod orchestrate;
mod plan;
mod state;
#[cfg(test)]
mod test_support;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::{ArgGroup, Args, Parser, Subcommand};

use pipeline::io::config::load_config;
use pipeline::io::init::PipelinePaths;
use pipeline::io::validation::CommandValidationRunner;
use pipeline::logging;

use crate::config::{MetaOverrides, apply_overrides, load_meta_config};
use crate::harness::{ProcessStepInvoker, pipeline_binary_path};
use crate::orchestrate::{MetaCollaborators, resume_task, run_task};

#[derive(Parser)]
#[command(
    name = "meta",
    version,
    about = "Multi-step pipeline runs with self-healing and resume"
)]
struct Cli {
    /// Workspace root (a git repository).
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Plan and run a task, or resume an earlier meta run.
    Run(RunArgs),
}

#[derive(Args)]
#[command(group(ArgGroup::new("source").required(true).args(["task", "resume"])))]
struct RunArgs {
    #[arg(long)]
    task: Option<String>,
    /// Meta run id to resume.
    #[arg(long, value_name = "META_RUN_ID")]
    resume: Option<String>,
    /// Per-step implement attempts.
    #[arg(long)]
    max_retries: Option<u32>,
    #[arg(long, overrides_with = "no_self_heal")]
    self_heal: bool,
    #[arg(long, overrides_with = "self_heal")]
    no_self_heal: bool,
    #[arg(long)]
    max_self_heal_attempts: Option<u32>,
    #[arg(long = "self-heal-stall-threshold")]
    stall_threshold: Option<u32>,
}

impl RunArgs {
    fn overrides(&self) -> MetaOverrides {
        let self_heal = match (self.self_heal, self.no_self_heal) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        };
        MetaOverrides {
            self_heal,
            max_self_heal_attempts: self.max_self_heal_attempts,
            stall_threshold: self.stall_threshold,
            max_retries: self.max_retries,
        }
    }
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::for_error(&err)
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => cmd_run(cli.root, &args),
    }
}

fn cmd_run(root: PathBuf, args: &RunArgs) -> Result<i32> {
    let paths = PipelinePaths::new(&root);
    let cfg = apply_overrides(load_meta_config(&paths.meta_config_path)?, &args.overrides())?;
    let pipeline_cfg = load_config(&paths.config_path)?;

    let invoker = ProcessStepInvoker {
        binary: pipeline_binary_path()?,
        root: root.clone(),
        timeout: Duration::from_secs(cfg.step_timeout_secs),
        output_limit_bytes: pipeline_cfg.output_limit_bytes,
    };
    let validation = CommandValidationRunner {
        argv: pipeline_cfg.validation.command.clone(),
        timeout: Duration::from_secs(pipeline_cfg.validation.timeout_secs),
        output_limit_bytes: pipeline_cfg.output_limit_bytes,
    };
    let collab = MetaCollaborators {
        invoker: &invoker,
        validation: &validation,
    };

    let outcome = match (&args.task, &args.resume) {
        (_, Some(meta_run_id)) => resume_task(&root, &cfg, meta_run_id, collab)?,
        (Some(task), None) => run_task(&root, &cfg, task, collab)?,
        (None, None) => bail!("either --task or --resume is required"),
    };
    println!("{} {}", outcome.meta_run_id, outcome.status.as_str());
    if !outcome.passed()
        && let Some(reason) = &outcome.reason
    {
        eprintln!("{reason}");
    }
    Ok(exit_codes::for_status(outcome.status))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(argv: &[&str]) -> RunArgs {
        let cli = Cli::try_parse_from(argv).expect("parse");
        let Command::Run(args) = cli.command;
        args
    }

    #[test]
    fn parse_task_with_overrides() {
        let args = run_args(&[
            "meta",
            "run",
            "--task",
            "add logging to backend",
            "--max-retries",
            "2",
            "--no-self-heal",
            "--self-heal-stall-threshold",
            "4",
        ]);
        assert_eq!(args.task.as_deref(), Some("add logging to backend"));
        let overrides = args.overrides();
        assert_eq!(overrides.self_heal, Some(false));
        assert_eq!(overrides.stall_threshold, Some(4));
        assert_eq!(overrides.max_retries, Some(2));
        assert_eq!(overrides.max_self_heal_attempts, None);
    }

    #[test]
    fn last_self_heal_flag_wins() {
        let args = run_args(&["meta", "run", "--resume", "meta-1", "--no-self-heal", "--self-heal"]);
        assert_eq!(args.overrides().self_heal, Some(true));
        assert_eq!(args.resume.as_deref(), Some("meta-1"));
    }

    #[test]
    fn no_flag_keeps_file_value() {
        let args = run_args(&["meta", "run", "--task", "x"]);
        assert_eq!(args.overrides().self_heal, None);
    }

    #[test]
    fn task_or_resume_is_required_and_exclusive() {
        assert!(Cli::try_parse_from(["meta", "run"]).is_err());
        assert!(
            Cli::try_parse_from(["meta", "run", "--task", "x", "--resume", "meta-1"]).is_err()
        );
    }
}

//! `pipeline` CLI: scaffold `.pipeline/` and drive one task run.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use pipeline::core::lifecycle::verify_transition_table;
use pipeline::exit_codes;
use pipeline::io::config::load_config;
use pipeline::io::contract_scan::RegexContractScanner;
use pipeline::io::generator::CommandGenerator;
use pipeline::io::init::{InitOptions, PipelinePaths, init_pipeline};
use pipeline::io::validation::CommandValidationRunner;
use pipeline::logging;
use pipeline::run::{Collaborators, RunOptions, run_task};

#[derive(Parser)]
#[command(
    name = "pipeline",
    version,
    about = "Bounded research/plan/implement/validate runs with rollback"
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
    /// Create `.pipeline/` with a default config.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Run one task to PASS or a rolled-back FAILED.
    Run {
        #[arg(long)]
        task: String,
        /// Override `max_retries` from the config.
        #[arg(long)]
        max_retries: Option<u32>,
        /// Declare an impacted file in addition to those the plan names.
        #[arg(long = "impacted", value_name = "PATH")]
        impacted: Vec<String>,
    },
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    verify_transition_table().context("lifecycle table self-check")?;
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => {
            let paths = init_pipeline(&cli.root, InitOptions { force })?;
            println!("initialized {}", paths.pipeline_dir.display());
            Ok(exit_codes::OK)
        }
        Command::Run {
            task,
            max_retries,
            impacted,
        } => cmd_run(cli.root, task, max_retries, impacted),
    }
}

fn cmd_run(
    root: PathBuf,
    task: String,
    max_retries: Option<u32>,
    impacted: Vec<String>,
) -> Result<i32> {
    let paths = PipelinePaths::new(&root);
    let cfg = load_config(&paths.config_path)?;
    let generator = CommandGenerator {
        argv: cfg.generator_argv(),
        timeout: Duration::from_secs(cfg.generator.timeout_secs),
        output_limit_bytes: cfg.output_limit_bytes,
    };
    let validation = CommandValidationRunner {
        argv: cfg.validation.command.clone(),
        timeout: Duration::from_secs(cfg.validation.timeout_secs),
        output_limit_bytes: cfg.output_limit_bytes,
    };
    let outcome = run_task(
        &root,
        &cfg,
        &RunOptions {
            task,
            max_retries,
            impacted,
        },
        Collaborators {
            generator: &generator,
            validation: &validation,
            scanner: &RegexContractScanner,
        },
    )?;
    println!("{} {}", outcome.run_id, outcome.state);
    if let Some(reason) = &outcome.manifest.reason {
        eprintln!("{reason}");
    }
    Ok(exit_codes::for_outcome(&outcome))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["pipeline", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn parse_run_with_impacted_files() {
        let cli = Cli::parse_from([
            "pipeline",
            "--root",
            "/tmp/ws",
            "run",
            "--task",
            "add health route",
            "--max-retries",
            "2",
            "--impacted",
            "server/routes.js",
            "--impacted",
            "server/health.js",
        ]);
        assert_eq!(cli.root, PathBuf::from("/tmp/ws"));
        let Command::Run {
            task,
            max_retries,
            impacted,
        } = cli.command
        else {
            panic!("expected run");
        };
        assert_eq!(task, "add health route");
        assert_eq!(max_retries, Some(2));
        assert_eq!(impacted, vec!["server/routes.js", "server/health.js"]);
    }
}

//! Sandboxed action runner for file-forensics challenges.
//!
//! `solve` drives one session against a challenge directory and prints the
//! flag (exit 0) or `NO_FLAG_FOUND` (exit 1). `init-config` writes a default
//! `runner.toml`.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand};
use ctf_runner::exit_codes;
use ctf_runner::io::config::{ProviderMode, RunnerConfig, load_config, write_config};
use ctf_runner::logging;
use ctf_runner::solve::{SolveRequest, solve};

#[derive(Parser)]
#[command(
    name = "ctf-runner",
    version,
    about = "Sandboxed action runner for file-forensics challenges"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Investigate a challenge directory until a flag is found or the budget runs out.
    Solve(SolveArgs),
    /// Write the default `runner.toml`.
    InitConfig {
        #[arg(long, default_value = "runner.toml")]
        path: PathBuf,
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Args)]
struct SolveArgs {
    /// Directory holding the challenge files (read-only to the runner).
    challenge_dir: PathBuf,
    /// Where state.json, report.md, flag.txt and step outputs go.
    #[arg(long, default_value = "artifacts/latest")]
    out: PathBuf,
    /// Scratch area for commands and extraction.
    #[arg(long, default_value = "artifacts/work")]
    work: PathBuf,
    #[arg(long, default_value = "runner.toml")]
    config: PathBuf,
    #[arg(long)]
    max_steps: Option<u32>,
    #[arg(long, value_enum)]
    provider: Option<ProviderMode>,
    #[arg(long)]
    allow_network: bool,
    #[arg(long)]
    allow_install: bool,
}

fn main() {
    logging::init();
    let code = match run(Cli::parse()) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Solve(args) => cmd_solve(args),
        Command::InitConfig { path, force } => cmd_init_config(&path, force),
    }
}

fn cmd_solve(args: SolveArgs) -> Result<i32> {
    let config = apply_overrides(load_config(&args.config)?, &args);
    let report = solve(&SolveRequest {
        challenge_dir: args.challenge_dir,
        out_dir: args.out,
        work_dir: args.work,
        config,
    })?;
    eprintln!(
        "status: {} after {} step(s); report: {}",
        report.outcome.status,
        report.outcome.steps_executed,
        report.paths.report_path.display()
    );
    match report.outcome.found_flag() {
        Some(flag) => {
            println!("{flag}");
            Ok(exit_codes::OK)
        }
        None => {
            println!("NO_FLAG_FOUND");
            Ok(exit_codes::NOT_FOUND)
        }
    }
}

fn apply_overrides(mut config: RunnerConfig, args: &SolveArgs) -> RunnerConfig {
    if let Some(max_steps) = args.max_steps {
        config.policy.max_steps = max_steps;
    }
    if let Some(mode) = args.provider {
        config.provider.mode = mode;
    }
    // Flags only ever widen what the config allows.
    config.policy.allow_network |= args.allow_network;
    config.policy.allow_install |= args.allow_install;
    config
}

fn cmd_init_config(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &RunnerConfig::default())?;
    println!("{}", path.display());
    Ok(exit_codes::OK)
}

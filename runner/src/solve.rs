//! `ctf-runner solve`: wire config, sandbox, provider and artifacts around the loop.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use tracing::{info, instrument, warn};

use crate::agents::DecisionProvider;
use crate::agents::external::external_provider;
use crate::agents::rules::RuleProvider;
use crate::core::state::AgentState;
use crate::io::artifacts::{ArtifactPaths, write_session, write_step_output};
use crate::io::config::{ProviderMode, RunnerConfig};
use crate::io::inventory::scan_inventory;
use crate::io::sandbox::SandboxRunner;
use crate::session::{SessionConfig, SessionOutcome, run_session};

/// Everything `solve` needs; CLI overrides are already folded into `config`.
#[derive(Debug, Clone)]
pub struct SolveRequest {
    pub challenge_dir: PathBuf,
    pub out_dir: PathBuf,
    pub work_dir: PathBuf,
    pub config: RunnerConfig,
}

#[derive(Debug)]
pub struct SolveReport {
    pub outcome: SessionOutcome,
    pub paths: ArtifactPaths,
}

/// Run one session against `challenge_dir` and persist its artifacts.
///
/// Errors only for setup problems; a session that ends without a flag is a
/// normal outcome.
#[instrument(skip_all, fields(challenge = %request.challenge_dir.display()))]
pub fn solve(request: &SolveRequest) -> Result<SolveReport> {
    let config = &request.config;
    config.validate().context("validate config")?;

    let runner = SandboxRunner::new(
        &request.challenge_dir,
        &request.work_dir,
        config.policy.clone(),
    )?;

    fs::create_dir_all(&request.out_dir)
        .with_context(|| format!("create directory {}", request.out_dir.display()))?;
    let out_dir = request
        .out_dir
        .canonicalize()
        .with_context(|| format!("resolve out dir {}", request.out_dir.display()))?;
    if out_dir.starts_with(runner.challenge_root()) {
        bail!(
            "out dir {} must be outside the challenge root {}",
            out_dir.display(),
            runner.challenge_root().display()
        );
    }
    let paths = ArtifactPaths::new(&out_dir);
    paths.prepare()?;

    let inventory = scan_inventory(runner.challenge_root(), config.policy.max_files)?;
    let state = AgentState::new(runner.challenge_root().to_path_buf(), inventory);

    let provider: Box<dyn DecisionProvider> = match config.provider.mode {
        ProviderMode::Rules => Box::new(RuleProvider),
        ProviderMode::External => Box::new(
            external_provider(&config.provider, &config.policy, runner.scratch_dir())
                .context("build external provider")?,
        ),
    };
    info!(mode = ?config.provider.mode, "provider ready");

    let session_config =
        SessionConfig::from_policy(&config.policy, config.provider.summary_limit_bytes);
    let outcome = run_session(state, &provider, &runner, &session_config, |record, result| {
        if let Some(result) = result
            && let Err(err) = write_step_output(&paths, record.index, result)
        {
            warn!(err = %format!("{err:#}"), step = record.index, "failed to write step output");
        }
    });

    write_session(&paths, outcome.status, &outcome.state).context("write session artifacts")?;
    Ok(SolveReport { outcome, paths })
}

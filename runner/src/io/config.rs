//! Runner configuration stored in `runner.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::policy::Policy;

/// Runner configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to the
/// values `init-config` writes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    pub policy: Policy,
    pub provider: ProviderConfig,
}

/// Which decision provider drives the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ProviderMode {
    /// Built-in heuristics; no external process.
    #[default]
    Rules,
    /// Planner and chooser commands fed a rendered prompt on stdin.
    External,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderConfig {
    pub mode: ProviderMode,

    /// Command for the planning role (e.g. `["codex","exec","-"]`).
    pub planner_command: Vec<String>,

    /// Command for the execution-choosing role.
    pub chooser_command: Vec<String>,

    /// Wall-clock limit for one provider call.
    pub timeout_secs: u64,

    /// Truncate provider stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Bytes of the last run's output shown to providers.
    pub summary_limit_bytes: usize,

    /// Override the built-in planner prompt template.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub planner_template: Option<PathBuf>,

    /// Override the built-in chooser prompt template.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chooser_template: Option<PathBuf>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        let agent = vec!["codex".to_string(), "exec".to_string(), "-".to_string()];
        Self {
            mode: ProviderMode::Rules,
            planner_command: agent.clone(),
            chooser_command: agent,
            timeout_secs: 300,
            output_limit_bytes: 200_000,
            summary_limit_bytes: 4_000,
            planner_template: None,
            chooser_template: None,
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        self.policy.validate()?;
        let provider = &self.provider;
        if provider.timeout_secs == 0 {
            return Err(anyhow!("provider.timeout_secs must be > 0"));
        }
        if provider.output_limit_bytes == 0 {
            return Err(anyhow!("provider.output_limit_bytes must be > 0"));
        }
        if provider.summary_limit_bytes == 0 {
            return Err(anyhow!("provider.summary_limit_bytes must be > 0"));
        }
        for (name, command) in [
            ("planner_command", &provider.planner_command),
            ("chooser_command", &provider.chooser_command),
        ] {
            if command.first().is_none_or(|first| first.trim().is_empty()) {
                return Err(anyhow!("provider.{name} must be a non-empty array"));
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        let cfg = RunnerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunnerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RunnerConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("runner.toml");
        let mut cfg = RunnerConfig::default();
        cfg.policy.allow_install = true;
        cfg.provider.mode = ProviderMode::External;
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("runner.toml");
        fs::write(&path, "[policy]\nmax_steps = 5\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.policy.max_steps, 5);
        assert_eq!(cfg.policy.max_files, Policy::default().max_files);
        assert_eq!(cfg.provider, ProviderConfig::default());
    }

    #[test]
    fn empty_provider_command_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("runner.toml");
        fs::write(&path, "[provider]\nchooser_command = []\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("chooser_command"));
    }
}

//! Policy-gated execution of one validated action.
//!
//! [`SandboxRunner`] never returns an error to its caller: gate refusals become
//! a failed [`RunResult`] with `blocked` set, and execution problems become a
//! failed result carrying whatever output was captured.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, instrument, warn};

use crate::core::action::{Action, ExecOptions};
use crate::core::archive::ArchiveFormat;
use crate::core::policy::Policy;
use crate::core::types::{BlockReason, RunResult};
use crate::io::confine::{ConfineError, confine_dir, confine_existing};
use crate::io::host::{HostEnv, PackageManager, detect_host};
use crate::io::inventory::{render_listing, scan_inventory};
use crate::io::process::run_with_timeout;

/// Directory under the scratch area that receives archive contents.
pub const EXTRACTED_DIR: &str = "extracted";

/// Executes validated actions. Implementations must not panic on bad input.
pub trait ActionRunner {
    fn run(&self, action: &Action) -> RunResult;
}

impl<T: ActionRunner + ?Sized> ActionRunner for &T {
    fn run(&self, action: &Action) -> RunResult {
        (**self).run(action)
    }
}

/// The real runner: confined to one challenge root and one scratch area.
#[derive(Debug, Clone)]
pub struct SandboxRunner {
    challenge_root: PathBuf,
    scratch_dir: PathBuf,
    policy: Policy,
    host: HostEnv,
}

impl SandboxRunner {
    /// Canonicalize both roots and prepare the scratch area.
    ///
    /// The scratch area must live outside the challenge root so that nothing the
    /// runner writes can be mistaken for evidence.
    pub fn new(challenge_root: &Path, scratch_dir: &Path, policy: Policy) -> Result<Self> {
        policy.validate().context("validate policy")?;
        let challenge_root = challenge_root
            .canonicalize()
            .with_context(|| format!("resolve challenge root {}", challenge_root.display()))?;
        if !challenge_root.is_dir() {
            bail!(
                "challenge root is not a directory: {}",
                challenge_root.display()
            );
        }
        fs::create_dir_all(scratch_dir)
            .with_context(|| format!("create scratch dir {}", scratch_dir.display()))?;
        let scratch_dir = scratch_dir
            .canonicalize()
            .with_context(|| format!("resolve scratch dir {}", scratch_dir.display()))?;
        if scratch_dir.starts_with(&challenge_root) {
            bail!(
                "scratch dir {} must be outside the challenge root {}",
                scratch_dir.display(),
                challenge_root.display()
            );
        }
        let extracted = scratch_dir.join(EXTRACTED_DIR);
        fs::create_dir_all(&extracted)
            .with_context(|| format!("create directory {}", extracted.display()))?;

        debug!(
            root = %challenge_root.display(),
            scratch = %scratch_dir.display(),
            "sandbox ready"
        );
        Ok(Self {
            challenge_root,
            scratch_dir,
            policy,
            host: detect_host(),
        })
    }

    /// Replace the detected host, e.g. to pin the package manager in tests.
    pub fn with_host(mut self, host: HostEnv) -> Self {
        self.host = host;
        self
    }

    pub fn challenge_root(&self) -> &Path {
        &self.challenge_root
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub fn extracted_dir(&self) -> PathBuf {
        self.scratch_dir.join(EXTRACTED_DIR)
    }

    fn list_files(&self) -> RunResult {
        match scan_inventory(&self.challenge_root, self.policy.max_files) {
            Ok(entries) => RunResult::success(render_listing(&entries)).scanned(),
            Err(err) => RunResult::failed(format!("{err:#}")),
        }
    }

    fn read_file_head(&self, target: &str) -> RunResult {
        let path = match confine_existing(&self.challenge_root, target) {
            Ok(path) => path,
            Err(err) => return confine_failure(err),
        };
        match read_head(&path, self.policy.max_file_size_bytes) {
            Ok(text) => RunResult::success(text).scanned(),
            Err(err) => RunResult::failed(format!("{err:#}")),
        }
    }

    fn run_command(&self, command: &[String], options: &ExecOptions) -> RunResult {
        if let Err(reason) = self.policy.check_command(command) {
            return RunResult::blocked(reason);
        }
        let timeout = self.policy.timeout_or_default(options.timeout_secs);
        self.exec(command, options, timeout)
    }

    fn run_script(&self, script_body: &str, options: &ExecOptions) -> RunResult {
        let command = vec![
            self.policy.script_interpreter.clone(),
            "-c".to_string(),
            script_body.to_string(),
        ];
        self.run_command(&command, options)
    }

    fn extract_archive(&self, target: &str, timeout_secs: Option<u64>) -> RunResult {
        let source = match confine_existing(&self.challenge_root, target) {
            Ok(path) => path,
            Err(err) => return confine_failure(err),
        };
        let Some(format) = ArchiveFormat::detect(target) else {
            return RunResult::blocked(BlockReason::UnknownArchiveType {
                target: target.to_string(),
            });
        };
        let out_dir = self.extracted_dir();
        if let Err(err) = fs::create_dir_all(&out_dir) {
            return RunResult::failed(format!("create directory {}: {err}", out_dir.display()));
        }
        let command = format.command(&source, &out_dir);
        // Runner-built line: only the binary needs checking.
        if let Err(reason) = self.policy.check_binary(&command) {
            return RunResult::blocked(reason);
        }
        let timeout = Duration::from_secs(timeout_secs.unwrap_or(self.policy.extract_timeout_secs));
        let mut result = self.exec(&command, &ExecOptions::default(), timeout);

        match scan_inventory(&out_dir, self.policy.max_files) {
            Ok(entries) => {
                result.stdout.push_str("\n[extracted files]\n");
                result.stdout.push_str(&render_listing(&entries));
            }
            Err(err) => warn!(err = %err, "failed to list extracted files"),
        }
        result.scanned()
    }

    fn install_packages(&self, packages: &[String], timeout_secs: Option<u64>) -> RunResult {
        if let Err(reason) = self.policy.check_packages(packages) {
            return RunResult::blocked(reason);
        }
        let Some(manager) = PackageManager::for_host(&self.host) else {
            return RunResult::blocked(BlockReason::UnsupportedHost {
                host: self.host.label(),
            });
        };
        let command = manager.install_command(packages);
        info!(?manager, packages = ?packages, "installing packages");
        let timeout = Duration::from_secs(timeout_secs.unwrap_or(self.policy.install_timeout_secs));
        self.exec(&command, &ExecOptions::default(), timeout)
    }

    /// Spawn `command` in the scratch area and collect a scanned result.
    fn exec(&self, command: &[String], options: &ExecOptions, timeout: Duration) -> RunResult {
        let Some((program, args)) = command.split_first() else {
            return RunResult::failed("empty command");
        };
        let working_dir = match &options.working_dir {
            Some(dir) => match confine_dir(&self.scratch_dir, dir) {
                Ok(path) => path,
                Err(err) => return confine_failure(err),
            },
            None => self.scratch_dir.clone(),
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&working_dir)
            .envs(&options.extra_env);
        match run_with_timeout(cmd, None, timeout, self.policy.output_limit_bytes) {
            Ok(output) => RunResult {
                succeeded: output.success(),
                stdout: output.stdout_text(),
                stderr: output.stderr_text(),
                timed_out: output.timed_out,
                detected_flag: None,
                blocked: None,
            }
            .scanned(),
            Err(err) => RunResult::failed(format!("{err:#}")),
        }
    }
}

impl ActionRunner for SandboxRunner {
    #[instrument(skip_all, fields(kind = %action.kind()))]
    fn run(&self, action: &Action) -> RunResult {
        let result = match action {
            Action::ListFiles => self.list_files(),
            Action::ReadFileHead { target } => self.read_file_head(target),
            Action::RunCommand {
                command, options, ..
            } => self.run_command(command, options),
            Action::RunScript {
                script_body,
                options,
                ..
            } => self.run_script(script_body, options),
            Action::ExtractArchive {
                target,
                timeout_secs,
            } => self.extract_archive(target, *timeout_secs),
            Action::InstallPackages {
                packages,
                timeout_secs,
            } => self.install_packages(packages, *timeout_secs),
            Action::Stop { .. } => RunResult::failed("stop is handled by the session loop"),
        };
        match &result.blocked {
            Some(reason) => info!(gate = reason.gate(), %reason, "action blocked"),
            None => debug!(
                succeeded = result.succeeded,
                timed_out = result.timed_out,
                flag = result.detected_flag.is_some(),
                "action finished"
            ),
        }
        result
    }
}

fn confine_failure(err: ConfineError) -> RunResult {
    match err {
        ConfineError::Escape { path } => RunResult::blocked(BlockReason::PathEscapeBlocked { path }),
        other => RunResult::failed(other.to_string()),
    }
}

fn read_head(path: &Path, limit: u64) -> Result<String> {
    if !path.is_file() {
        bail!("not a regular file: {}", path.display());
    }
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut buf = Vec::new();
    file.take(limit)
        .read_to_end(&mut buf)
        .with_context(|| format!("read {}", path.display()))?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

//! Shared result types exchanged between the sandbox and the session loop.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::flag::scan_streams;

/// A policy gate refused the action before it produced any output.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "gate", rename_all = "snake_case")]
pub enum BlockReason {
    #[error("path escape blocked: {path}")]
    PathEscapeBlocked { path: String },
    #[error("command not allowed: {binary}")]
    CommandNotAllowed { binary: String },
    #[error("network token blocked: {token}")]
    NetworkBlocked { token: String },
    #[error("package installation is disabled by policy")]
    InstallNotAllowed,
    #[error("package not allowed: {package}")]
    PackageNotAllowed { package: String },
    #[error("unsupported host for package installation: {host}")]
    UnsupportedHost { host: String },
    #[error("unknown archive type: {target}")]
    UnknownArchiveType { target: String },
}

impl BlockReason {
    /// Stable gate name used in reports.
    pub fn gate(&self) -> &'static str {
        match self {
            BlockReason::PathEscapeBlocked { .. } => "path_escape_blocked",
            BlockReason::CommandNotAllowed { .. } => "command_not_allowed",
            BlockReason::NetworkBlocked { .. } => "network_blocked",
            BlockReason::InstallNotAllowed => "install_not_allowed",
            BlockReason::PackageNotAllowed { .. } => "package_not_allowed",
            BlockReason::UnsupportedHost { .. } => "unsupported_host",
            BlockReason::UnknownArchiveType { .. } => "unknown_archive_type",
        }
    }
}

/// Uniform outcome of one sandboxed action.
///
/// `timed_out` implies `!succeeded`. Output captured before a timeout or a
/// non-zero exit is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub succeeded: bool,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub detected_flag: Option<String>,
    /// Set when a policy gate refused the action.
    pub blocked: Option<BlockReason>,
}

impl RunResult {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            succeeded: true,
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            stderr: stderr.into(),
            ..Self::default()
        }
    }

    pub fn blocked(reason: BlockReason) -> Self {
        Self {
            stderr: reason.to_string(),
            blocked: Some(reason),
            ..Self::default()
        }
    }

    /// Attach the first flag found in stdout, then stderr.
    pub fn scanned(mut self) -> Self {
        self.detected_flag = scan_streams(&self.stdout, &self.stderr);
        self
    }

    /// Copy with both streams cut to `limit_bytes`, for feeding back to providers.
    pub fn snapshot(&self, limit_bytes: usize) -> RunResult {
        RunResult {
            stdout: truncate_text(&self.stdout, limit_bytes),
            stderr: truncate_text(&self.stderr, limit_bytes),
            ..self.clone()
        }
    }
}

/// Cut `text` to at most `limit` bytes on a char boundary, noting what was dropped.
pub fn truncate_text(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[truncated {} bytes]", &text[..end], text.len() - end)
}

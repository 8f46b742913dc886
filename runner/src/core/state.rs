//! The session's single mutable record of progress and its audit trail.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::action::{ActionKind, ValidationError};
use crate::core::types::{BlockReason, RunResult};

/// One regular file found under the challenge root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the challenge root, `/`-separated.
    pub path: String,
    pub size: u64,
    /// Lower-cased extension without the dot; empty when absent.
    pub extension: String,
}

/// Where the orchestration loop stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    StoppedFound,
    StoppedByProvider,
    StoppedInvalidAction,
    StoppedMaxSteps,
    StoppedProviderError,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        self != SessionStatus::Running
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::StoppedFound => "stopped_found",
            SessionStatus::StoppedByProvider => "stopped_by_provider",
            SessionStatus::StoppedInvalidAction => "stopped_invalid_action",
            SessionStatus::StoppedMaxSteps => "stopped_max_steps",
            SessionStatus::StoppedProviderError => "stopped_provider_error",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened in one iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepOutcome {
    /// The runner was invoked.
    Executed {
        succeeded: bool,
        timed_out: bool,
        blocked: Option<BlockReason>,
        detected_flag: Option<String>,
        stderr_excerpt: String,
        stdout_file: String,
        stderr_file: String,
    },
    /// The descriptor failed structural validation.
    Rejected { error: ValidationError },
    /// The provider asked to stop, with or without a flag.
    Stopped { flag: Option<String> },
    /// The provider itself failed.
    ProviderFailed { error: String },
}

/// Append-only audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    /// 1-based iteration number.
    pub index: u32,
    pub objective: Option<String>,
    pub note: Option<String>,
    /// The descriptor as the provider sent it.
    pub action: Option<Value>,
    pub kind: Option<ActionKind>,
    pub target: Option<String>,
    pub outcome: StepOutcome,
}

impl StepRecord {
    pub fn stdout_file_name(index: u32) -> String {
        format!("steps/{index:03}.stdout.txt")
    }

    pub fn stderr_file_name(index: u32) -> String {
        format!("steps/{index:03}.stderr.txt")
    }

    pub fn blocked(&self) -> Option<&BlockReason> {
        match &self.outcome {
            StepOutcome::Executed { blocked, .. } => blocked.as_ref(),
            _ => None,
        }
    }
}

/// Progress of one solve session. Only the orchestration loop mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentState {
    pub challenge_root: PathBuf,
    pub file_inventory: Vec<FileEntry>,
    /// Targets already attempted, per kind. Advisory only.
    pub done: BTreeMap<ActionKind, BTreeSet<String>>,
    pub step_log: Vec<StepRecord>,
    pub found_flag: Option<String>,
    pub current_objective: Option<String>,
    pub last_execution_summary: Option<RunResult>,
}

impl AgentState {
    pub fn new(challenge_root: PathBuf, file_inventory: Vec<FileEntry>) -> Self {
        Self {
            challenge_root,
            file_inventory,
            done: BTreeMap::new(),
            step_log: Vec::new(),
            found_flag: None,
            current_objective: None,
            last_execution_summary: None,
        }
    }

    /// Store the first flag seen. Later calls leave it untouched and return false.
    pub fn record_flag(&mut self, flag: &str) -> bool {
        if self.found_flag.is_some() {
            return false;
        }
        self.found_flag = Some(flag.to_string());
        true
    }

    pub fn mark_done(&mut self, kind: ActionKind, target: impl Into<String>) {
        self.done.entry(kind).or_default().insert(target.into());
    }

    pub fn is_done(&self, kind: ActionKind, target: &str) -> bool {
        self.done
            .get(&kind)
            .is_some_and(|targets| targets.contains(target))
    }

    /// Number of attempted targets of `kind`.
    pub fn done_count(&self, kind: ActionKind) -> usize {
        self.done.get(&kind).map_or(0, BTreeSet::len)
    }

    /// Most recent step, if any.
    pub fn last_step(&self) -> Option<&StepRecord> {
        self.step_log.last()
    }
}

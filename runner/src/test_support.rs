//! Test-only helpers: scripted providers and runners, and challenge fixtures.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::agents::{Decision, DecisionProvider};
use crate::core::action::Action;
use crate::core::policy::Policy;
use crate::core::state::AgentState;
use crate::core::types::RunResult;
use crate::io::sandbox::ActionRunner;

/// Provider that replays a fixed script; `Err` entries become provider errors.
pub struct ScriptedProvider {
    script: RefCell<VecDeque<Result<Decision, String>>>,
    seen_states: RefCell<Vec<AgentState>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Result<Decision, String>>) -> Self {
        Self {
            script: RefCell::new(script.into()),
            seen_states: RefCell::new(Vec::new()),
        }
    }

    /// Snapshot of the state passed to each call, in order.
    pub fn seen_states(&self) -> Vec<AgentState> {
        self.seen_states.borrow().clone()
    }
}

impl DecisionProvider for ScriptedProvider {
    fn propose(&self, state: &AgentState) -> Result<Decision> {
        self.seen_states.borrow_mut().push(state.clone());
        match self.script.borrow_mut().pop_front() {
            Some(Ok(decision)) => Ok(decision),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("scripted provider exhausted")),
        }
    }
}

/// Provider that proposes the same action forever.
pub struct RepeatingProvider {
    action: Action,
}

impl RepeatingProvider {
    pub fn new(action: Action) -> Self {
        Self { action }
    }
}

impl DecisionProvider for RepeatingProvider {
    fn propose(&self, _state: &AgentState) -> Result<Decision> {
        Ok(Decision::act(&self.action, "again"))
    }
}

/// Runner that records every action and replays canned results.
pub struct ScriptedRunner {
    results: RefCell<VecDeque<RunResult>>,
    calls: RefCell<Vec<Action>>,
}

impl ScriptedRunner {
    pub fn new(results: Vec<RunResult>) -> Self {
        Self {
            results: RefCell::new(results.into()),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Action> {
        self.calls.borrow().clone()
    }
}

impl ActionRunner for ScriptedRunner {
    fn run(&self, action: &Action) -> RunResult {
        self.calls.borrow_mut().push(action.clone());
        self.results
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| RunResult::failed("no scripted result"))
    }
}

/// Temp directory holding `challenge/`, `work/` and `out/` side by side.
pub struct ChallengeFixture {
    temp: TempDir,
}

impl ChallengeFixture {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir()?;
        fs::create_dir_all(temp.path().join("challenge"))?;
        Ok(Self { temp })
    }

    pub fn challenge_dir(&self) -> PathBuf {
        self.temp.path().join("challenge")
    }

    pub fn work_dir(&self) -> PathBuf {
        self.temp.path().join("work")
    }

    pub fn out_dir(&self) -> PathBuf {
        self.temp.path().join("out")
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    /// Write a challenge file, creating parent directories.
    pub fn write(&self, relative: &str, contents: impl AsRef<[u8]>) -> Result<PathBuf> {
        let path = self.challenge_dir().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents)?;
        Ok(path)
    }
}

/// Default policy plus the shell tools process tests rely on.
pub fn test_policy() -> Policy {
    let mut policy = Policy::default();
    for binary in ["sh", "echo", "sleep", "cat", "ls"] {
        policy.command_allowlist.insert(binary.to_string());
    }
    policy
}

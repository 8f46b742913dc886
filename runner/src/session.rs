//! The iterate-until-stop orchestration loop.
//!
//! Each iteration asks the provider for one decision, validates the proposed
//! descriptor, runs it through the runner, and folds the result into the
//! state. Structural and provider failures end the session; anything the
//! runner reports (refusals, non-zero exits, timeouts) is recorded and the
//! loop continues.

use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::agents::DecisionProvider;
use crate::core::action::{Action, validate};
use crate::core::policy::Policy;
use crate::core::state::{AgentState, SessionStatus, StepOutcome, StepRecord};
use crate::core::types::{RunResult, truncate_text};
use crate::io::sandbox::ActionRunner;

/// Loop limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub max_steps: u32,
    /// Bytes of each stream kept in `last_execution_summary`.
    pub summary_limit_bytes: usize,
    /// Bytes of stderr kept in each step record.
    pub error_excerpt_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_steps: 80,
            summary_limit_bytes: 4_000,
            error_excerpt_bytes: 2_000,
        }
    }
}

impl SessionConfig {
    pub fn from_policy(policy: &Policy, summary_limit_bytes: usize) -> Self {
        Self {
            max_steps: policy.max_steps,
            summary_limit_bytes,
            ..Self::default()
        }
    }
}

/// Final status and state of a finished session.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub status: SessionStatus,
    pub steps_executed: u32,
    pub state: AgentState,
}

impl SessionOutcome {
    pub fn found_flag(&self) -> Option<&str> {
        self.state.found_flag.as_deref()
    }
}

/// Drive `state` to a terminal status, calling `on_step` after every iteration.
///
/// `on_step` receives the full (untruncated) run result when the runner was invoked.
pub fn run_session<P, R, F>(
    mut state: AgentState,
    provider: &P,
    runner: &R,
    config: &SessionConfig,
    mut on_step: F,
) -> SessionOutcome
where
    P: DecisionProvider + ?Sized,
    R: ActionRunner + ?Sized,
    F: FnMut(&StepRecord, Option<&RunResult>),
{
    info!(max_steps = config.max_steps, files = state.file_inventory.len(), "session started");
    let mut status = SessionStatus::Running;
    let mut steps_executed = 0u32;
    while steps_executed < config.max_steps {
        steps_executed += 1;
        status = run_iteration(
            &mut state,
            steps_executed,
            provider,
            runner,
            config,
            &mut on_step,
        );
        if status.is_terminal() {
            break;
        }
    }
    if !status.is_terminal() {
        warn!(max_steps = config.max_steps, "step budget exhausted");
        status = SessionStatus::StoppedMaxSteps;
    }

    info!(%status, steps_executed, flag = ?state.found_flag, "session finished");
    SessionOutcome {
        status,
        steps_executed,
        state,
    }
}

#[instrument(skip_all, fields(step = index))]
fn run_iteration<P, R, F>(
    state: &mut AgentState,
    index: u32,
    provider: &P,
    runner: &R,
    config: &SessionConfig,
    on_step: &mut F,
) -> SessionStatus
where
    P: DecisionProvider + ?Sized,
    R: ActionRunner + ?Sized,
    F: FnMut(&StepRecord, Option<&RunResult>),
{
    let decision = match provider.propose(state) {
        Ok(decision) => decision,
        Err(err) => {
            error!(err = %format!("{err:#}"), "provider failed");
            let record = StepRecord {
                index,
                objective: state.current_objective.clone(),
                note: None,
                action: None,
                kind: None,
                target: None,
                outcome: StepOutcome::ProviderFailed {
                    error: format!("{err:#}"),
                },
            };
            append(state, record, None, on_step);
            return SessionStatus::StoppedProviderError;
        }
    };

    if let Some(objective) = non_empty(decision.objective) {
        state.current_objective = Some(objective);
    }
    let mut record = StepRecord {
        index,
        objective: state.current_objective.clone(),
        note: decision.note,
        action: decision.action.clone(),
        kind: None,
        target: None,
        outcome: StepOutcome::Stopped { flag: None },
    };

    if decision.stop {
        let flag = non_empty(decision.flag);
        return finish_with_stop(state, record, flag, on_step);
    }

    let raw = decision.action.unwrap_or(Value::Null);
    let action = match validate(&raw) {
        Ok(action) => action,
        Err(err) => {
            warn!(%err, "invalid action");
            record.outcome = StepOutcome::Rejected { error: err };
            append(state, record, None, on_step);
            return SessionStatus::StoppedInvalidAction;
        }
    };
    record.kind = Some(action.kind());
    record.target = action.dedup_target();

    if let Action::Stop { flag } = &action {
        return finish_with_stop(state, record, non_empty(flag.clone()), on_step);
    }

    debug!(%action, "running action");
    let result = runner.run(&action);
    if let Some(target) = &record.target {
        state.mark_done(action.kind(), target.clone());
    }
    record.outcome = StepOutcome::Executed {
        succeeded: result.succeeded,
        timed_out: result.timed_out,
        blocked: result.blocked.clone(),
        detected_flag: result.detected_flag.clone(),
        stderr_excerpt: truncate_text(&result.stderr, config.error_excerpt_bytes),
        stdout_file: StepRecord::stdout_file_name(index),
        stderr_file: StepRecord::stderr_file_name(index),
    };
    state.last_execution_summary = Some(result.snapshot(config.summary_limit_bytes));
    let detected = result.detected_flag.clone();
    append(state, record, Some(&result), on_step);

    match detected {
        Some(flag) => {
            state.record_flag(&flag);
            info!(%flag, "flag detected");
            SessionStatus::StoppedFound
        }
        None => SessionStatus::Running,
    }
}

fn finish_with_stop<F>(
    state: &mut AgentState,
    mut record: StepRecord,
    flag: Option<String>,
    on_step: &mut F,
) -> SessionStatus
where
    F: FnMut(&StepRecord, Option<&RunResult>),
{
    record.outcome = StepOutcome::Stopped { flag: flag.clone() };
    append(state, record, None, on_step);
    match flag {
        Some(flag) => {
            state.record_flag(&flag);
            info!(%flag, "provider stopped with a flag");
            SessionStatus::StoppedFound
        }
        None => {
            info!("provider stopped without a flag");
            SessionStatus::StoppedByProvider
        }
    }
}

fn append<F>(state: &mut AgentState, record: StepRecord, result: Option<&RunResult>, on_step: &mut F)
where
    F: FnMut(&StepRecord, Option<&RunResult>),
{
    on_step(&record, result);
    state.step_log.push(record);
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use serde_json::json;

    use super::*;
    use crate::agents::Decision;
    use crate::core::action::ActionKind;
    use crate::test_support::{ScriptedProvider, ScriptedRunner};

    fn state() -> AgentState {
        AgentState::new(PathBuf::from("/challenge"), Vec::new())
    }

    fn config(max_steps: u32) -> SessionConfig {
        SessionConfig {
            max_steps,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn provider_error_ends_session_with_a_record() {
        let provider = ScriptedProvider::new(vec![Err("planner offline".to_string())]);
        let runner = ScriptedRunner::new(Vec::new());
        let outcome = run_session(state(), &provider, &runner, &config(5), |_, _| {});
        assert_eq!(outcome.status, SessionStatus::StoppedProviderError);
        assert_eq!(outcome.steps_executed, 1);
        assert!(matches!(
            &outcome.state.step_log[0].outcome,
            StepOutcome::ProviderFailed { error } if error.contains("planner offline")
        ));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn missing_action_is_invalid() {
        let provider = ScriptedProvider::new(vec![Ok(Decision::default())]);
        let runner = ScriptedRunner::new(Vec::new());
        let outcome = run_session(state(), &provider, &runner, &config(5), |_, _| {});
        assert_eq!(outcome.status, SessionStatus::StoppedInvalidAction);
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn stop_action_with_flag_is_found() {
        let provider = ScriptedProvider::new(vec![Ok(Decision {
            action: Some(json!({"kind": "stop", "flag": "ctf{done}"})),
            ..Decision::default()
        })]);
        let runner = ScriptedRunner::new(Vec::new());
        let outcome = run_session(state(), &provider, &runner, &config(5), |_, _| {});
        assert_eq!(outcome.status, SessionStatus::StoppedFound);
        assert_eq!(outcome.found_flag(), Some("ctf{done}"));
        assert_eq!(outcome.state.step_log[0].kind, Some(ActionKind::Stop));
    }

    #[test]
    fn decision_objective_is_carried_forward() {
        let provider = ScriptedProvider::new(vec![
            Ok(Decision::act(&Action::ListFiles, "look").with_objective("survey")),
            Ok(Decision::stop(None, "nothing left")),
        ]);
        let runner = ScriptedRunner::new(vec![RunResult::success("a.txt\n")]);
        let outcome = run_session(state(), &provider, &runner, &config(5), |_, _| {});
        assert_eq!(outcome.status, SessionStatus::StoppedByProvider);
        assert_eq!(outcome.state.current_objective.as_deref(), Some("survey"));
        assert_eq!(outcome.state.step_log[1].objective.as_deref(), Some("survey"));
    }

    #[test]
    fn summary_and_excerpt_are_truncated() {
        let provider = ScriptedProvider::new(vec![Ok(Decision::act(&Action::ListFiles, "look"))]);
        let runner = ScriptedRunner::new(vec![RunResult {
            stdout: "o".repeat(100),
            stderr: "e".repeat(100),
            ..RunResult::default()
        }]);
        let config = SessionConfig {
            max_steps: 1,
            summary_limit_bytes: 10,
            error_excerpt_bytes: 20,
        };
        let mut seen = Vec::new();
        let outcome = run_session(state(), &provider, &runner, &config, |record, result| {
            seen.push((record.index, result.map(|r| r.stdout.len())));
        });
        assert_eq!(outcome.status, SessionStatus::StoppedMaxSteps);
        assert_eq!(seen, vec![(1, Some(100))]);
        let summary = outcome.state.last_execution_summary.expect("summary");
        assert!(summary.stdout.starts_with("oooooooooo\n[truncated"));
        let StepOutcome::Executed { stderr_excerpt, .. } = &outcome.state.step_log[0].outcome
        else {
            panic!("expected executed step");
        };
        assert!(stderr_excerpt.starts_with(&"e".repeat(20)));
        assert!(stderr_excerpt.contains("[truncated 80 bytes]"));
    }
}

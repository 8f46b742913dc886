//! Session artifacts: per-step output files, the state snapshot, the report and the flag.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::state::{AgentState, SessionStatus, StepOutcome, StepRecord};
use crate::core::types::RunResult;

const REPORT_TEMPLATE: &str = include_str!("templates/report.md");

static REPORT_ENV: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.add_template("report.md", REPORT_TEMPLATE)
        .expect("report template should be valid");
    env
});

/// Layout of the artifact directory.
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    pub out_dir: PathBuf,
    pub steps_dir: PathBuf,
    pub state_path: PathBuf,
    pub report_path: PathBuf,
    pub flag_path: PathBuf,
}

impl ArtifactPaths {
    pub fn new(out_dir: &Path) -> Self {
        Self {
            out_dir: out_dir.to_path_buf(),
            steps_dir: out_dir.join("steps"),
            state_path: out_dir.join("state.json"),
            report_path: out_dir.join("report.md"),
            flag_path: out_dir.join("flag.txt"),
        }
    }

    /// Create the directory and drop step files left by an earlier session.
    pub fn prepare(&self) -> Result<()> {
        if self.steps_dir.exists() {
            fs::remove_dir_all(&self.steps_dir)
                .with_context(|| format!("clear {}", self.steps_dir.display()))?;
        }
        fs::create_dir_all(&self.steps_dir)
            .with_context(|| format!("create directory {}", self.steps_dir.display()))?;
        Ok(())
    }
}

/// Full snapshot persisted as `state.json`.
#[derive(Debug, Serialize)]
struct SessionSnapshot<'a> {
    status: SessionStatus,
    steps_executed: usize,
    found_flag: Option<&'a str>,
    state: &'a AgentState,
}

/// Write the untruncated stdout/stderr of one step next to the step log.
pub fn write_step_output(paths: &ArtifactPaths, index: u32, result: &RunResult) -> Result<()> {
    write_text(
        &paths.out_dir.join(StepRecord::stdout_file_name(index)),
        &result.stdout,
    )?;
    write_text(
        &paths.out_dir.join(StepRecord::stderr_file_name(index)),
        &result.stderr,
    )
}

/// Persist the final snapshot, the report and (only when found) the flag.
pub fn write_session(paths: &ArtifactPaths, status: SessionStatus, state: &AgentState) -> Result<()> {
    debug!(out = %paths.out_dir.display(), %status, "writing session artifacts");
    fs::create_dir_all(&paths.out_dir)
        .with_context(|| format!("create directory {}", paths.out_dir.display()))?;

    let snapshot = SessionSnapshot {
        status,
        steps_executed: state.step_log.len(),
        found_flag: state.found_flag.as_deref(),
        state,
    };
    let mut buf = serde_json::to_string_pretty(&snapshot).context("serialize state snapshot")?;
    buf.push('\n');
    write_atomic(&paths.state_path, &buf)?;

    write_atomic(&paths.report_path, &render_report(status, state)?)?;

    match &state.found_flag {
        Some(flag) => write_atomic(&paths.flag_path, &format!("{flag}\n"))?,
        None if paths.flag_path.exists() => fs::remove_file(&paths.flag_path)
            .with_context(|| format!("remove stale {}", paths.flag_path.display()))?,
        None => {}
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct ReportStep {
    index: u32,
    title: String,
    objective: Option<String>,
    note: Option<String>,
    result: String,
    gate: Option<&'static str>,
    stdout_file: Option<String>,
    stderr_file: Option<String>,
    excerpt: Option<String>,
}

impl ReportStep {
    fn from_record(record: &StepRecord) -> Self {
        let kind = record
            .kind
            .map_or_else(|| "(no action)".to_string(), |kind| kind.to_string());
        let title = match &record.target {
            Some(target) => format!("{kind} `{}`", one_line(target)),
            None => kind,
        };
        let mut step = ReportStep {
            index: record.index,
            title,
            objective: record.objective.clone(),
            note: record.note.clone(),
            result: String::new(),
            gate: None,
            stdout_file: None,
            stderr_file: None,
            excerpt: None,
        };
        match &record.outcome {
            StepOutcome::Executed {
                succeeded,
                timed_out,
                blocked,
                detected_flag,
                stderr_excerpt,
                stdout_file,
                stderr_file,
            } => {
                step.result = if let Some(reason) = blocked {
                    format!("blocked ({reason})")
                } else if *timed_out {
                    "timed out".to_string()
                } else if *succeeded {
                    "ok".to_string()
                } else {
                    "failed".to_string()
                };
                if let Some(flag) = detected_flag {
                    step.result.push_str(&format!(", flag detected `{flag}`"));
                }
                step.gate = blocked.as_ref().map(|reason| reason.gate());
                step.stdout_file = Some(stdout_file.clone());
                step.stderr_file = Some(stderr_file.clone());
                if !*succeeded && blocked.is_none() && !stderr_excerpt.trim().is_empty() {
                    step.excerpt = Some(stderr_excerpt.trim_end().to_string());
                }
            }
            StepOutcome::Rejected { error } => {
                step.result = format!("rejected ({error})");
            }
            StepOutcome::Stopped { flag: Some(flag) } => {
                step.result = format!("stopped with flag `{flag}`");
            }
            StepOutcome::Stopped { flag: None } => {
                step.result = "stopped without a flag".to_string();
            }
            StepOutcome::ProviderFailed { error } => {
                step.result = "provider failed".to_string();
                step.excerpt = Some(error.clone());
            }
        }
        step
    }
}

pub fn render_report(status: SessionStatus, state: &AgentState) -> Result<String> {
    let steps: Vec<ReportStep> = state.step_log.iter().map(ReportStep::from_record).collect();
    let template = REPORT_ENV.get_template("report.md")?;
    let rendered = template
        .render(context! {
            challenge_root => state.challenge_root.display().to_string(),
            status => status.as_str(),
            flag => state.found_flag.as_deref(),
            file_count => state.file_inventory.len(),
            steps => steps,
        })
        .context("render report")?;
    Ok(rendered)
}

fn one_line(text: &str) -> String {
    let first = text.lines().next().unwrap_or_default();
    if first.len() < text.len() {
        format!("{first} ...")
    } else {
        first.to_string()
    }
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("artifact path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents).with_context(|| format!("write temp {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::action::{ActionKind, ValidationError};
    use crate::core::types::BlockReason;

    fn sample_state() -> AgentState {
        let mut state = AgentState::new(PathBuf::from("/challenge"), Vec::new());
        state.step_log.push(StepRecord {
            index: 1,
            objective: Some("look around".to_string()),
            note: None,
            action: None,
            kind: Some(ActionKind::RunCommand),
            target: Some("curl http://evil".to_string()),
            outcome: StepOutcome::Executed {
                succeeded: false,
                timed_out: false,
                blocked: Some(BlockReason::NetworkBlocked {
                    token: "curl".to_string(),
                }),
                detected_flag: None,
                stderr_excerpt: "network token blocked: curl".to_string(),
                stdout_file: StepRecord::stdout_file_name(1),
                stderr_file: StepRecord::stderr_file_name(1),
            },
        });
        state.step_log.push(StepRecord {
            index: 2,
            objective: None,
            note: None,
            action: None,
            kind: None,
            target: None,
            outcome: StepOutcome::Rejected {
                error: ValidationError::UnknownActionKind {
                    kind: "dance".to_string(),
                },
            },
        });
        state
    }

    #[test]
    fn report_names_blocking_gate() {
        let report = render_report(SessionStatus::StoppedInvalidAction, &sample_state())
            .expect("render");
        assert!(report.contains("**stopped_invalid_action**"));
        assert!(report.contains("Blocked by: `network_blocked`"));
        assert!(report.contains("rejected (unknown action kind: dance)"));
        assert!(report.contains("Flag: none"));
    }

    #[test]
    fn session_files_are_written_and_stale_flag_removed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ArtifactPaths::new(&temp.path().join("out"));
        paths.prepare().expect("prepare");

        let mut state = sample_state();
        state.record_flag("flag{abc123}");
        write_session(&paths, SessionStatus::StoppedFound, &state).expect("write");
        assert_eq!(
            fs::read_to_string(&paths.flag_path).expect("flag"),
            "flag{abc123}\n"
        );
        let snapshot: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.state_path).expect("state"))
                .expect("json");
        assert_eq!(snapshot["status"], "stopped_found");
        assert_eq!(snapshot["steps_executed"], 2);
        assert_eq!(snapshot["state"]["found_flag"], "flag{abc123}");

        let empty = AgentState::new(PathBuf::from("/challenge"), Vec::new());
        write_session(&paths, SessionStatus::StoppedByProvider, &empty).expect("write");
        assert!(!paths.flag_path.exists());
        assert!(
            fs::read_to_string(&paths.report_path)
                .expect("report")
                .contains("No steps were taken.")
        );
    }

    #[test]
    fn step_output_lands_under_steps_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ArtifactPaths::new(temp.path());
        paths.prepare().expect("prepare");
        write_step_output(&paths, 3, &RunResult::success("out")).expect("write");
        assert_eq!(
            fs::read_to_string(temp.path().join("steps/003.stdout.txt")).expect("stdout"),
            "out"
        );
        assert!(temp.path().join("steps/003.stderr.txt").exists());
    }
}

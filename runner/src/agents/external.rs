//! Planner and chooser backed by an external agent command.
//!
//! Each call renders a prompt (state JSON embedded), feeds it to the configured
//! command on stdin, takes the outermost JSON object from stdout, checks it
//! against an embedded schema and deserializes it. Any failure along the way
//! is a provider error.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::{Validator, validator_for};
use minijinja::Environment;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::agents::pair::PairedProvider;
use crate::agents::{Chooser, Decision, Plan, Planner};
use crate::core::action::ActionKind;
use crate::core::policy::Policy;
use crate::core::state::{AgentState, FileEntry, StepRecord};
use crate::core::types::{RunResult, truncate_text};
use crate::io::config::ProviderConfig;
use crate::io::process::run_with_timeout;

const PLANNER_TEMPLATE: &str = include_str!("prompts/planner.md");
const CHOOSER_TEMPLATE: &str = include_str!("prompts/chooser.md");
const PLAN_SCHEMA: &str = include_str!("schemas/plan.schema.json");
const DECISION_SCHEMA: &str = include_str!("schemas/decision.schema.json");

/// Steps of history included in each prompt.
const RECENT_STEPS: usize = 12;

/// Abstraction over agent backends. Tests use canned replies.
pub trait AgentCommand {
    /// Send `prompt`, return the agent's raw reply.
    fn call(&self, prompt: &str) -> Result<String>;
}

/// Agent reached by spawning a command with the prompt on stdin.
#[derive(Debug, Clone)]
pub struct ProcessAgent {
    pub role: &'static str,
    pub command: Vec<String>,
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl AgentCommand for ProcessAgent {
    #[instrument(skip_all, fields(role = self.role, timeout_secs = self.timeout.as_secs()))]
    fn call(&self, prompt: &str) -> Result<String> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("{} command is empty", self.role))?;
        info!(program = %program, "calling agent");
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.workdir);

        let output = run_with_timeout(cmd, Some(prompt.as_bytes()), self.timeout, self.output_limit_bytes)
            .with_context(|| format!("run {} agent", self.role))?;
        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "agent timed out");
            bail!("{} agent timed out after {:?}", self.role, self.timeout);
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "agent failed");
            bail!(
                "{} agent failed with status {:?}: {}",
                self.role,
                output.status.code(),
                truncate_text(output.stderr_text().trim(), 2_000)
            );
        }
        debug!(bytes = output.stdout.len(), "agent replied");
        Ok(output.stdout_text())
    }
}

/// Policy facts shown to agents so they avoid proposing refused actions.
#[derive(Debug, Clone)]
pub struct PromptSettings {
    pub template: String,
    pub policy: Policy,
}

#[derive(Serialize)]
struct PromptContext<'a> {
    challenge_root: String,
    allow_network: bool,
    allow_install: bool,
    command_allowlist: &'a BTreeSet<String>,
    install_allowlist: &'a BTreeSet<String>,
    script_interpreter: &'a str,
    state_json: String,
    objective: Option<&'a str>,
    message: Option<&'a str>,
}

/// What agents get to see of the state.
#[derive(Serialize)]
struct StateView<'a> {
    files: &'a [FileEntry],
    done: &'a BTreeMap<ActionKind, BTreeSet<String>>,
    recent_steps: &'a [StepRecord],
    found_flag: Option<&'a str>,
    current_objective: Option<&'a str>,
    last_execution: Option<&'a RunResult>,
}

impl PromptSettings {
    fn render(&self, state: &AgentState, plan: Option<&Plan>) -> Result<String> {
        let recent_from = state.step_log.len().saturating_sub(RECENT_STEPS);
        let view = StateView {
            files: &state.file_inventory,
            done: &state.done,
            recent_steps: &state.step_log[recent_from..],
            found_flag: state.found_flag.as_deref(),
            current_objective: state.current_objective.as_deref(),
            last_execution: state.last_execution_summary.as_ref(),
        };
        let ctx = PromptContext {
            challenge_root: state.challenge_root.display().to_string(),
            allow_network: self.policy.allow_network,
            allow_install: self.policy.allow_install,
            command_allowlist: &self.policy.command_allowlist,
            install_allowlist: &self.policy.install_allowlist,
            script_interpreter: &self.policy.script_interpreter,
            state_json: serde_json::to_string_pretty(&view).context("serialize state view")?,
            objective: plan.and_then(|p| p.objective.as_deref()),
            message: plan.map(|p| p.message.as_str()),
        };
        let env = Environment::new();
        env.render_str(&self.template, ctx).context("render prompt")
    }
}

pub struct ExternalPlanner<A> {
    agent: A,
    settings: PromptSettings,
    validator: Validator,
}

impl<A: AgentCommand> ExternalPlanner<A> {
    pub fn new(agent: A, settings: PromptSettings) -> Result<Self> {
        Ok(Self {
            agent,
            settings,
            validator: compile_schema(PLAN_SCHEMA)?,
        })
    }
}

impl<A: AgentCommand> Planner for ExternalPlanner<A> {
    fn plan(&self, state: &AgentState) -> Result<Plan> {
        let prompt = self.settings.render(state, None)?;
        let reply = self.agent.call(&prompt)?;
        parse_reply(&reply, &self.validator).context("planner reply")
    }
}

pub struct ExternalChooser<A> {
    agent: A,
    settings: PromptSettings,
    validator: Validator,
}

impl<A: AgentCommand> ExternalChooser<A> {
    pub fn new(agent: A, settings: PromptSettings) -> Result<Self> {
        Ok(Self {
            agent,
            settings,
            validator: compile_schema(DECISION_SCHEMA)?,
        })
    }
}

impl<A: AgentCommand> Chooser for ExternalChooser<A> {
    fn choose(&self, state: &AgentState, plan: &Plan) -> Result<Decision> {
        let prompt = self.settings.render(state, Some(plan))?;
        let reply = self.agent.call(&prompt)?;
        parse_reply(&reply, &self.validator).context("chooser reply")
    }
}

pub type ExternalProvider = PairedProvider<ExternalPlanner<ProcessAgent>, ExternalChooser<ProcessAgent>>;

/// Build the planner/chooser pair from config. Agents run inside `workdir`.
pub fn external_provider(
    config: &ProviderConfig,
    policy: &Policy,
    workdir: &Path,
) -> Result<ExternalProvider> {
    let agent = |role: &'static str, command: &[String]| ProcessAgent {
        role,
        command: command.to_vec(),
        workdir: workdir.to_path_buf(),
        timeout: Duration::from_secs(config.timeout_secs),
        output_limit_bytes: config.output_limit_bytes,
    };
    let settings = |template: Option<&PathBuf>, builtin: &str| -> Result<PromptSettings> {
        let template = match template {
            Some(path) => fs::read_to_string(path)
                .with_context(|| format!("read prompt template {}", path.display()))?,
            None => builtin.to_string(),
        };
        Ok(PromptSettings {
            template,
            policy: policy.clone(),
        })
    };

    let planner = ExternalPlanner::new(
        agent("planner", &config.planner_command),
        settings(config.planner_template.as_ref(), PLANNER_TEMPLATE)?,
    )?;
    let chooser = ExternalChooser::new(
        agent("chooser", &config.chooser_command),
        settings(config.chooser_template.as_ref(), CHOOSER_TEMPLATE)?,
    )?;
    Ok(PairedProvider::new(planner, chooser))
}

/// The outermost `{...}` span of `text`, tolerating prose or fences around it.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn compile_schema(raw: &str) -> Result<Validator> {
    let schema: Value = serde_json::from_str(raw).context("parse embedded schema")?;
    validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))
}

fn parse_reply<T: DeserializeOwned>(reply: &str, validator: &Validator) -> Result<T> {
    let json = extract_json_object(reply).ok_or_else(|| anyhow!("no JSON object in reply"))?;
    let value: Value = serde_json::from_str(json).context("parse reply json")?;
    if !validator.is_valid(&value) {
        let messages = validator
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        bail!("reply schema validation failed: {}", messages.join("; "));
    }
    serde_json::from_value(value).context("deserialize reply")
}

//! Decision providers: whatever chooses the next action.
//!
//! Provider output is untrusted. The session loop validates every proposed
//! descriptor before anything runs, so providers only ever return loose JSON.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::action::Action;
use crate::core::state::AgentState;

pub mod external;
pub mod pair;
pub mod rules;

/// One provider answer: an action to run, or a request to stop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Decision {
    /// Raw action descriptor, validated by the loop.
    pub action: Option<Value>,
    pub stop: bool,
    /// Flag claimed alongside `stop`.
    pub flag: Option<String>,
    pub note: Option<String>,
    pub objective: Option<String>,
}

impl Decision {
    pub fn act(action: &Action, note: impl Into<String>) -> Self {
        Self {
            action: Some(action.to_descriptor()),
            note: Some(note.into()),
            ..Self::default()
        }
    }

    pub fn stop(flag: Option<String>, note: impl Into<String>) -> Self {
        Self {
            stop: true,
            flag,
            note: Some(note.into()),
            ..Self::default()
        }
    }

    pub fn with_objective(mut self, objective: impl Into<String>) -> Self {
        self.objective = Some(objective.into());
        self
    }
}

/// Supplies the next decision for the current state.
pub trait DecisionProvider {
    fn propose(&self, state: &AgentState) -> Result<Decision>;
}

impl<T: DecisionProvider + ?Sized> DecisionProvider for Box<T> {
    fn propose(&self, state: &AgentState) -> Result<Decision> {
        (**self).propose(state)
    }
}

/// Planning-role output: what to aim for next, and a message for the chooser.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Plan {
    pub objective: Option<String>,
    pub message: String,
    pub stop: bool,
    pub flag: Option<String>,
}

pub trait Planner {
    fn plan(&self, state: &AgentState) -> Result<Plan>;
}

/// Execution-choosing role: turns a plan into at most one action.
pub trait Chooser {
    fn choose(&self, state: &AgentState, plan: &Plan) -> Result<Decision>;
}

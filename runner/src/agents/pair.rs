//! Planner + chooser composed into a single decision provider.

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::agents::{Chooser, Decision, DecisionProvider, Planner};
use crate::core::state::AgentState;

pub struct PairedProvider<P, C> {
    planner: P,
    chooser: C,
}

impl<P: Planner, C: Chooser> PairedProvider<P, C> {
    pub fn new(planner: P, chooser: C) -> Self {
        Self { planner, chooser }
    }
}

impl<P: Planner, C: Chooser> DecisionProvider for PairedProvider<P, C> {
    #[instrument(skip_all, fields(step = state.step_log.len() + 1))]
    fn propose(&self, state: &AgentState) -> Result<Decision> {
        let plan = self.planner.plan(state).context("planner")?;
        debug!(objective = ?plan.objective, stop = plan.stop, "plan received");

        // A planner stop never reaches the chooser.
        if plan.stop {
            return Ok(Decision {
                stop: true,
                flag: plan.flag.clone(),
                note: Some(plan.message.clone()).filter(|m| !m.trim().is_empty()),
                objective: plan.objective.clone(),
                action: None,
            });
        }

        let mut decision = self.chooser.choose(state, &plan).context("chooser")?;
        if decision.objective.is_none() {
            decision.objective = plan.objective;
        }
        Ok(decision)
    }
}

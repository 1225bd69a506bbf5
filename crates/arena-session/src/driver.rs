use crate::engine::{SessionEngine, SessionError, SubmitOutcome, SubmitStatus};
use crate::report::{SessionReport, Stage};
use anyhow::{anyhow, Context, Result};
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Something that answers observations with free-text actions.
pub trait Agent {
    fn name(&self) -> &str;
    fn next_action(&mut self, observation: &str) -> Result<String>;
}

/// Replays a fixed list of actions, one per step.
#[derive(Debug, Clone, Default)]
pub struct ScriptedAgent {
    actions: VecDeque<String>,
}

impl ScriptedAgent {
    pub fn new<I, S>(actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            actions: actions.into_iter().map(Into::into).collect(),
        }
    }

    /// Parses a YAML list of action strings.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let actions: Vec<String> =
            serde_yaml::from_str(text).context("actions file must be a YAML list of strings")?;
        Ok(Self::new(actions))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read actions file {}", path.display()))?;
        Self::from_yaml(&text)
    }

    pub fn remaining(&self) -> usize {
        self.actions.len()
    }
}

impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        "scripted"
    }

    fn next_action(&mut self, _observation: &str) -> Result<String> {
        self.actions
            .pop_front()
            .ok_or_else(|| anyhow!("scripted agent ran out of actions"))
    }
}

fn describe(outcome: &SubmitOutcome) -> String {
    format!("[{}] {}", outcome.stage.as_str(), outcome.detail)
}

/// Runs one problem session to completion with `agent`, spending at most
/// `max_steps` actions. Agent failures and an exhausted budget abort the
/// session; the returned report says which.
pub fn run_agent_session(
    engine: &mut SessionEngine,
    agent: &mut dyn Agent,
    problem_id: &str,
    max_steps: usize,
) -> Result<SessionReport> {
    let ack = engine.start_problem(problem_id)?;
    info!(
        session_id = %ack.session_id,
        agent = agent.name(),
        max_steps,
        "agent session started"
    );
    let mut observation = format!("[{}] {}", ack.stage.as_str(), ack.message);

    for step in 1..=max_steps {
        let action = match agent.next_action(&observation) {
            Ok(action) => action,
            Err(err) => {
                warn!(step, error = %err, "agent failed to produce an action");
                return Ok(engine.abort(&format!("agent error: {:#}", err))?);
            }
        };
        debug!(step, action = %action, "agent action");
        match engine.submit(&action) {
            Ok(outcome) if outcome.status == SubmitStatus::Completed || outcome.stage == Stage::Done => {
                return Ok(engine.report()?);
            }
            Ok(outcome) => observation = describe(&outcome),
            Err(err @ SessionError::Collaborator { .. }) => {
                warn!(step, error = %err, "session ended by a collaborator failure");
                return engine.report().map_err(|_| anyhow!(err));
            }
            Err(err) => return Err(err.into()),
        }
    }

    Ok(engine.abort(&format!("step budget of {} exhausted", max_steps))?)
}

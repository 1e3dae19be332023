//! Session, phase and agent data model plus phase planning.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConcordError, Result};
use crate::pipeline::operation::OperationRecord;

use super::machine::{AgentStatus, SessionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Parallel,
    #[default]
    Sequential,
    Adaptive,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Parallel => "parallel",
            Self::Sequential => "sequential",
            Self::Adaptive => "adaptive",
        };
        write!(f, "{}", s)
    }
}

/// Role/task pair describing an agent to be dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub role: String,
    pub task: String,
}

impl AgentSpec {
    pub fn new(role: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            task: task.into(),
        }
    }
}

/// An ordered step within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub index: usize,
    pub name: String,
    /// Agents planned for this phase but not yet dispatched.
    pub planned: Vec<AgentSpec>,
    /// Agents dispatched into this phase.
    pub agent_ids: Vec<String>,
    pub complete: bool,
}

impl Phase {
    fn new(index: usize, name: impl Into<String>, planned: Vec<AgentSpec>) -> Self {
        Self {
            index,
            name: name.into(),
            planned,
            agent_ids: Vec::new(),
            complete: false,
        }
    }
}

/// One spawned worker within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub role: String,
    pub task: String,
    pub status: AgentStatus,
    pub phase: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    /// Most specific terminal reason, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    pub operation_log: Vec<OperationRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(role: impl Into<String>, task: impl Into<String>, phase: usize) -> Self {
        let now = Utc::now();
        Self {
            id: format!("agent-{}", Uuid::new_v4()),
            role: role.into(),
            task: task.into(),
            status: AgentStatus::Pending,
            phase,
            workspace_id: None,
            outcome: None,
            operation_log: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn set_status(&mut self, target: AgentStatus) -> Result<()> {
        self.status = self.status.transition_to(target)?;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// What a committed agent outcome did to the surrounding session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseAdvance {
    /// The phase still has non-terminal agents.
    None,
    /// The phase completed; the next phase (if any) is ready to dispatch.
    PhaseCompleted { next: Option<usize> },
    /// No phases remain; the session reached a terminal state.
    SessionDone { success: bool },
}

/// One orchestration run. Owns its phases and agents transitively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub objective: String,
    pub strategy: Strategy,
    pub state: SessionState,
    pub phases: Vec<Phase>,
    pub agents: HashMap<String, Agent>,
    /// Adaptive strategy: specs not yet materialized into a phase.
    pub backlog: Vec<AgentSpec>,
    pub current_phase: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(objective: impl Into<String>, strategy: Strategy, initial: Vec<AgentSpec>) -> Self {
        let (phases, backlog) = plan_phases(strategy, initial);
        let now = Utc::now();
        Self {
            id: format!("session-{}", Uuid::new_v4()),
            objective: objective.into(),
            strategy,
            state: SessionState::Planning,
            phases,
            agents: HashMap::new(),
            backlog,
            current_phase: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Terminal sessions are immutable.
    pub fn ensure_mutable(&self) -> Result<()> {
        if self.state.is_terminal() {
            return Err(ConcordError::InvalidTransition {
                entity: "session",
                from: self.state.to_string(),
                to: "<mutation>".to_string(),
                allowed: String::new(),
            });
        }
        Ok(())
    }

    pub fn set_state(&mut self, target: SessionState) -> Result<()> {
        self.state = self.state.transition_to(target)?;
        self.touch();
        Ok(())
    }

    pub fn agent(&self, agent_id: &str) -> Result<&Agent> {
        self.agents
            .get(agent_id)
            .ok_or_else(|| ConcordError::AgentNotFound(agent_id.to_string()))
    }

    pub fn agent_mut(&mut self, agent_id: &str) -> Result<&mut Agent> {
        self.agents
            .get_mut(agent_id)
            .ok_or_else(|| ConcordError::AgentNotFound(agent_id.to_string()))
    }

    pub fn phase(&self, index: usize) -> Result<&Phase> {
        self.phases.get(index).ok_or(ConcordError::PhaseOutOfRange {
            session: self.id.clone(),
            phase: index,
        })
    }

    /// Check that dispatching into `phase` is legal right now.
    ///
    /// Outside the parallel strategy, only the current phase accepts
    /// dispatches; jumping ahead while earlier phases have non-terminal
    /// agents is an invalid transition.
    pub fn check_dispatch(&self, phase: usize) -> Result<()> {
        self.ensure_mutable()?;
        self.phase(phase)?;
        if self.strategy != Strategy::Parallel && phase != self.current_phase {
            return Err(ConcordError::InvalidTransition {
                entity: "phase",
                from: format!("phase-{}", self.current_phase),
                to: format!("phase-{}", phase),
                allowed: format!("phase-{}", self.current_phase),
            });
        }
        Ok(())
    }

    /// Register a freshly created agent into `phase`.
    pub fn add_agent(&mut self, agent: Agent) {
        if let Some(phase) = self.phases.get_mut(agent.phase) {
            phase.agent_ids.push(agent.id.clone());
            // A planned slot is consumed by the dispatch that fills it.
            if let Some(pos) = phase.planned.iter().position(|s| s.role == agent.role) {
                phase.planned.remove(pos);
            }
        }
        self.agents.insert(agent.id.clone(), agent);
        self.touch();
    }

    fn phase_settled(&self, index: usize) -> bool {
        let Some(phase) = self.phases.get(index) else {
            return false;
        };
        phase.planned.is_empty()
            && !phase.agent_ids.is_empty()
            && phase
                .agent_ids
                .iter()
                .all(|id| self.agents.get(id).is_some_and(|a| a.status.is_terminal()))
    }

    /// Mark the phase complete if every agent in it is terminal, and work
    /// out what happens next. Called with the session mutex held, so the
    /// completion decision never runs on a stale agent snapshot.
    pub fn advance_after_outcome(&mut self, phase_index: usize) -> PhaseAdvance {
        if !self.phase_settled(phase_index) {
            return PhaseAdvance::None;
        }
        let already_complete = self.phases[phase_index].complete;
        self.phases[phase_index].complete = true;
        if already_complete {
            return PhaseAdvance::None;
        }
        self.touch();

        // Adaptive: materialize the next phase now that outcomes are known.
        if self.strategy == Strategy::Adaptive && !self.backlog.is_empty() {
            let spec = self.backlog.remove(0);
            let index = self.phases.len();
            let name = format!("phase-{}: {}", index + 1, spec.role);
            self.phases.push(Phase::new(index, name, vec![spec]));
        }

        let next = self.phases.iter().position(|p| !p.complete);

        match next {
            Some(index) => {
                self.current_phase = index;
                PhaseAdvance::PhaseCompleted { next: Some(index) }
            }
            None => {
                let success = self
                    .agents
                    .values()
                    .all(|a| a.status == AgentStatus::Completed);
                PhaseAdvance::SessionDone { success }
            }
        }
    }

    /// Agents that have not reached a terminal state yet.
    pub fn non_terminal_agents(&self) -> Vec<String> {
        self.agents
            .values()
            .filter(|a| !a.status.is_terminal())
            .map(|a| a.id.clone())
            .collect()
    }

    pub fn phases_completed(&self) -> usize {
        self.phases.iter().filter(|p| p.complete).count()
    }
}

/// Compute the initial phase plan for a strategy.
///
/// - parallel: one batch phase holding every spec;
/// - sequential: one phase per spec, strictly ordered;
/// - adaptive: the first spec becomes phase 1, the rest stay in the
///   backlog until prior phase outcomes are known.
fn plan_phases(strategy: Strategy, specs: Vec<AgentSpec>) -> (Vec<Phase>, Vec<AgentSpec>) {
    match strategy {
        Strategy::Parallel => {
            if specs.is_empty() {
                (Vec::new(), Vec::new())
            } else {
                (vec![Phase::new(0, "phase-1", specs)], Vec::new())
            }
        }
        Strategy::Sequential => {
            let phases = specs
                .into_iter()
                .enumerate()
                .map(|(i, spec)| {
                    let name = format!("phase-{}: {}", i + 1, spec.role);
                    Phase::new(i, name, vec![spec])
                })
                .collect();
            (phases, Vec::new())
        }
        Strategy::Adaptive => {
            let mut specs = specs;
            if specs.is_empty() {
                return (Vec::new(), Vec::new());
            }
            let first = specs.remove(0);
            let name = format!("phase-1: {}", first.role);
            (vec![Phase::new(0, name, vec![first])], specs)
        }
    }
}

//! Coordinator facade.
//!
//! Thin composition layer over the lock registry, workspace manager,
//! session store and validation pipeline. External callers (the transport
//! layer, hook shims) only ever talk to this type; it sequences the parts
//! and owns write-through persistence, nothing more.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::capability::{RoleListing, RoleRegistry};
use crate::config::ConcordConfig;
use crate::error::{ConcordError, Result};
use crate::events::{EventType, SessionEvent};
use crate::lock::LockRegistry;
use crate::persist::StateStore;
use crate::pipeline::{CheckContext, OperationDescriptor, OperationVerdict, ValidationPipeline};
use crate::session::{
    Agent, AgentSpec, AgentStatus, PhaseAdvance, Session, SessionState, SessionStore, Strategy,
};
use crate::workspace::{Workspace, WorkspaceBackend, WorkspaceManager};

/// Caller-facing session status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub objective: String,
    pub state: SessionState,
    pub strategy: Strategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<PhaseStatus>,
    pub progress: Progress,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseStatus {
    /// 1-based phase number.
    pub number: usize,
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub agents: Vec<AgentSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    pub id: String,
    pub role: String,
    pub task: String,
    pub status: AgentStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub phases_completed: usize,
    pub phases_total: usize,
    /// 1-based number of the phase currently executing.
    pub current_phase: usize,
}

enum SpawnOutcome {
    Running(String),
    AllocationFailed {
        agent_id: String,
        error: ConcordError,
    },
}

/// One terminal transition waiting to be applied in the outcome loop.
type PendingOutcome = (String, AgentStatus, Option<String>);

pub struct Coordinator {
    config: ConcordConfig,
    locks: Arc<LockRegistry>,
    sessions: Arc<SessionStore>,
    workspaces: Arc<WorkspaceManager>,
    roles: Arc<RoleRegistry>,
    pipeline: ValidationPipeline,
    store: Arc<dyn StateStore>,
}

impl Coordinator {
    pub fn new(
        config: ConcordConfig,
        backend: Arc<dyn WorkspaceBackend>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self> {
        config.validate()?;
        let workspaces = Arc::new(WorkspaceManager::new(
            backend,
            config.workspaces_dir.clone(),
            config.allocate_timeout(),
        ));
        let pipeline = ValidationPipeline::standard(&config);
        let roles = RoleRegistry::with_defaults();
        for role in &config.roles {
            roles.register(role.clone());
        }
        Ok(Self {
            config,
            locks: Arc::new(LockRegistry::new()),
            sessions: Arc::new(SessionStore::new()),
            workspaces,
            roles: Arc::new(roles),
            pipeline,
            store,
        })
    }

    /// Open with persisted state: reload sessions, locks and workspaces,
    /// then reconcile crash leftovers. Any agent that was non-terminal at
    /// shutdown is treated as crashed: forced `failed`, its workspace
    /// released and its locks cleared. Next phases are left planned, not
    /// auto-dispatched; resuming a run is the caller's call.
    pub async fn open(
        config: ConcordConfig,
        backend: Arc<dyn WorkspaceBackend>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self> {
        let coordinator = Self::new(config, backend, store)?;
        coordinator.reconcile().await?;
        Ok(coordinator)
    }

    pub fn roles(&self) -> &RoleRegistry {
        &self.roles
    }

    pub fn config(&self) -> &ConcordConfig {
        &self.config
    }

    fn ctx(&self) -> CheckContext {
        CheckContext {
            locks: Arc::clone(&self.locks),
            sessions: Arc::clone(&self.sessions),
            roles: Arc::clone(&self.roles),
        }
    }

    /// Create a session in `planning` with its phase plan computed from
    /// the strategy. Nothing is dispatched yet.
    pub fn start_session(
        &self,
        objective: impl Into<String>,
        strategy: Strategy,
        initial_agents: Vec<AgentSpec>,
    ) -> Result<String> {
        let session = Session::new(objective, strategy, initial_agents);
        let session_id = session.id.clone();
        info!(session = %session_id, %strategy, "Session created");
        self.sessions.insert(session);
        self.sessions.mutate(&session_id, |session, events| {
            events.emit(SessionEvent::new(EventType::SessionCreated, &session.id));
            Ok(())
        })?;
        self.persist(&session_id)?;
        Ok(session_id)
    }

    /// Dispatch an agent into a phase. Creates the agent `pending`,
    /// allocates its workspace, then moves it to `running`. Allocation
    /// failure marks the agent `failed` (recorded, session continues)
    /// and surfaces the error to the caller.
    pub async fn dispatch_agent(
        &self,
        session_id: &str,
        phase: usize,
        role: &str,
        task: &str,
    ) -> Result<String> {
        let spec = AgentSpec::new(role, task);
        match self.spawn_agent(session_id, phase, &spec).await? {
            SpawnOutcome::Running(agent_id) => {
                self.persist(session_id)?;
                Ok(agent_id)
            }
            SpawnOutcome::AllocationFailed { agent_id, error } => {
                warn!(
                    session = %session_id,
                    agent = %agent_id,
                    error = %error,
                    "Workspace allocation failed, agent marked failed"
                );
                let seed = VecDeque::from([(
                    agent_id,
                    AgentStatus::Failed,
                    Some(format!("workspace allocation failed: {error}")),
                )]);
                self.drain_outcomes(session_id, seed, true).await?;
                Err(error)
            }
        }
    }

    /// Route one operation through the validation pipeline.
    ///
    /// The pre stage decides; the post stage records the outcome and
    /// applies the lock policy. Concord never executes the operation:
    /// the agent runtime does, and only on an allow/warn verdict, so an
    /// allowed verdict is observed as executed.
    pub async fn submit_operation(&self, op: OperationDescriptor) -> Result<OperationVerdict> {
        if !self.sessions.contains(&op.session_id) {
            return Err(ConcordError::SessionNotFound(op.session_id.clone()));
        }
        let ctx = self.ctx();
        let verdict = self.pipeline.evaluate(&op, &ctx).await;
        self.pipeline
            .observe(&op, &verdict, verdict.allowed(), &ctx)
            .await;
        self.persist(&op.session_id)?;
        Ok(verdict)
    }

    /// Commit an agent's terminal outcome. Releases its workspace and
    /// locks, detects phase completion, and auto-dispatches the next
    /// phase (sequential/adaptive) or terminalizes the session.
    pub async fn report_agent_outcome(
        &self,
        session_id: &str,
        agent_id: &str,
        success: bool,
        details: Option<String>,
    ) -> Result<()> {
        let status = if success {
            AgentStatus::Completed
        } else {
            AgentStatus::Failed
        };
        let seed = VecDeque::from([(agent_id.to_string(), status, details)]);
        self.drain_outcomes(session_id, seed, true).await
    }

    /// Forcibly fail every non-terminal agent, release all workspaces
    /// and locks attributable to the session, and fail the session.
    /// Legal from any non-terminal state; terminal sessions no-op.
    pub async fn abort_session(&self, session_id: &str) -> Result<()> {
        let affected = self.sessions.mutate(session_id, |session, events| {
            if session.state.is_terminal() {
                return Ok(Vec::new());
            }
            for agent_id in session.non_terminal_agents() {
                let agent = session.agent_mut(&agent_id)?;
                agent.set_status(AgentStatus::Failed)?;
                agent.outcome = Some("session aborted".to_string());
                events.emit(
                    SessionEvent::new(EventType::AgentFailed, session_id)
                        .with_agent(&agent_id)
                        .with_message("session aborted"),
                );
            }
            session.set_state(SessionState::Failed)?;
            events.emit(SessionEvent::new(EventType::SessionAborted, session_id));
            // Cleanup covers every agent: under hold-until-termination a
            // long-terminated agent can still hold locks.
            Ok(session.agents.keys().cloned().collect::<Vec<String>>())
        })?;

        for agent_id in &affected {
            self.locks.release_all(agent_id);
            if let Some(workspace) = self.workspaces.locate(agent_id) {
                let _ = self.workspaces.release(&workspace).await;
            }
        }
        info!(session = %session_id, "Session aborted");
        self.persist(session_id)?;
        Ok(())
    }

    /// Public "stop now" entry: aborts a non-terminal session, no-ops on
    /// a terminal one.
    pub async fn end_session(&self, session_id: &str) -> Result<()> {
        self.abort_session(session_id).await
    }

    pub fn query_status(&self, session_id: &str, include_agents: bool) -> Result<SessionStatus> {
        self.sessions.read(session_id, |session| {
            let current_phase = session.phases.get(session.current_phase).map(|phase| {
                let agents = if include_agents {
                    phase
                        .agent_ids
                        .iter()
                        .filter_map(|id| session.agents.get(id))
                        .map(|agent| AgentSummary {
                            id: agent.id.clone(),
                            role: agent.role.clone(),
                            task: agent.task.clone(),
                            status: agent.status,
                        })
                        .collect()
                } else {
                    Vec::new()
                };
                PhaseStatus {
                    number: phase.index + 1,
                    name: phase.name.clone(),
                    agents,
                }
            });
            SessionStatus {
                session_id: session.id.clone(),
                objective: session.objective.clone(),
                state: session.state,
                strategy: session.strategy,
                current_phase,
                progress: Progress {
                    phases_completed: session.phases_completed(),
                    phases_total: session.phases.len(),
                    current_phase: session.current_phase + 1,
                },
                created_at: session.created_at,
                updated_at: session.updated_at,
            }
        })
    }

    pub fn list_roles(&self, include_descriptions: bool) -> Vec<RoleListing> {
        self.roles.list(include_descriptions)
    }

    /// Status of every known session, terminal ones included.
    pub fn list_sessions(&self) -> Vec<SessionStatus> {
        self.sessions
            .ids()
            .iter()
            .filter_map(|id| self.query_status(id, false).ok())
            .collect()
    }

    /// Ordered event feed: the committed backlog plus a live receiver.
    pub fn subscribe(
        &self,
        session_id: &str,
    ) -> Result<(Vec<SessionEvent>, broadcast::Receiver<SessionEvent>)> {
        self.sessions.subscribe(session_id)
    }

    pub fn locate_workspace(&self, agent_id: &str) -> Option<Workspace> {
        self.workspaces.locate(agent_id)
    }

    pub fn lock_holder(&self, resource: &std::path::Path) -> Option<String> {
        self.locks.query(resource)
    }

    // ---- internals ----

    /// Register an agent into a phase and allocate its workspace. Hard
    /// errors (unknown session/role, illegal phase) propagate; a backend
    /// allocation failure is returned as an outcome for the caller to
    /// cascade.
    async fn spawn_agent(
        &self,
        session_id: &str,
        phase: usize,
        spec: &AgentSpec,
    ) -> Result<SpawnOutcome> {
        if self.roles.get(&spec.role).is_none() {
            return Err(ConcordError::UnknownRole(spec.role.clone()));
        }
        let agent_id = self.sessions.mutate(session_id, |session, events| {
            session.check_dispatch(phase)?;
            if session.state == SessionState::Planning {
                session.set_state(SessionState::Executing)?;
                events.emit(SessionEvent::new(EventType::SessionStarted, session_id));
                events.emit(
                    SessionEvent::new(EventType::PhaseStarted, session_id)
                        .with_phase(session.current_phase),
                );
            }
            let agent = Agent::new(&spec.role, &spec.task, phase);
            let agent_id = agent.id.clone();
            events.emit(
                SessionEvent::new(EventType::AgentDispatched, session_id)
                    .with_agent(&agent_id)
                    .with_phase(phase)
                    .with_message(format!("{}: {}", spec.role, spec.task)),
            );
            session.add_agent(agent);
            Ok(agent_id)
        })?;

        // Slow branching work happens with no session mutex held.
        match self
            .workspaces
            .allocate(session_id, &agent_id, &spec.role)
            .await
        {
            Ok(workspace) => {
                let promoted = self.sessions.mutate(session_id, |session, _| {
                    let agent = session.agent_mut(&agent_id)?;
                    agent.workspace_id = Some(workspace.id.clone());
                    agent.set_status(AgentStatus::Running)
                });
                if let Err(err) = promoted {
                    // An abort can land between allocation and promotion;
                    // the workspace must not outlive the dead agent.
                    let _ = self.workspaces.release(&workspace).await;
                    return Err(err);
                }
                info!(session = %session_id, agent = %agent_id, role = %spec.role, "Agent running");
                Ok(SpawnOutcome::Running(agent_id))
            }
            Err(error) => Ok(SpawnOutcome::AllocationFailed { agent_id, error }),
        }
    }

    /// Apply terminal outcomes until none are pending. Auto-dispatching
    /// the next phase can itself produce failures (allocation), which
    /// feed back into the queue; the loop guarantees the cascade settles
    /// without recursion.
    async fn drain_outcomes(
        &self,
        session_id: &str,
        mut pending: VecDeque<PendingOutcome>,
        auto_dispatch: bool,
    ) -> Result<()> {
        while let Some((agent_id, status, detail)) = pending.pop_front() {
            let dispatches = self
                .apply_terminal(session_id, &agent_id, status, detail, auto_dispatch)
                .await?;
            for (phase, spec) in dispatches {
                match self.spawn_agent(session_id, phase, &spec).await? {
                    SpawnOutcome::Running(_) => {}
                    SpawnOutcome::AllocationFailed { agent_id, error } => {
                        warn!(
                            session = %session_id,
                            agent = %agent_id,
                            error = %error,
                            "Auto-dispatch allocation failed"
                        );
                        pending.push_back((
                            agent_id,
                            AgentStatus::Failed,
                            Some(format!("workspace allocation failed: {error}")),
                        ));
                    }
                }
            }
        }
        self.persist(session_id)
    }

    /// One terminal transition: status change, cleanup, phase-completion
    /// bookkeeping. Returns the next phase's planned dispatches when the
    /// strategy advances phases automatically.
    async fn apply_terminal(
        &self,
        session_id: &str,
        agent_id: &str,
        status: AgentStatus,
        detail: Option<String>,
        auto_dispatch: bool,
    ) -> Result<Vec<(usize, AgentSpec)>> {
        let dispatches = self.sessions.mutate(session_id, |session, events| {
            session.ensure_mutable()?;
            let agent = session.agent_mut(agent_id)?;
            agent.set_status(status)?;
            agent.outcome = detail.clone();
            let phase_index = agent.phase;

            let event_type = if status == AgentStatus::Completed {
                EventType::AgentCompleted
            } else {
                EventType::AgentFailed
            };
            let mut event =
                SessionEvent::new(event_type, session_id).with_agent(agent_id).with_phase(phase_index);
            if let Some(detail) = &detail {
                event = event.with_message(detail.clone());
            }
            events.emit(event);

            let mut dispatches = Vec::new();
            match session.advance_after_outcome(phase_index) {
                PhaseAdvance::None => {}
                PhaseAdvance::PhaseCompleted { next } => {
                    events.emit(
                        SessionEvent::new(EventType::PhaseCompleted, session_id)
                            .with_phase(phase_index),
                    );
                    if let Some(next) = next {
                        events.emit(
                            SessionEvent::new(EventType::PhaseStarted, session_id)
                                .with_phase(next),
                        );
                        if auto_dispatch && session.strategy != Strategy::Parallel {
                            dispatches = session.phases[next]
                                .planned
                                .iter()
                                .cloned()
                                .map(|spec| (next, spec))
                                .collect();
                        }
                    }
                }
                PhaseAdvance::SessionDone { success } => {
                    events.emit(
                        SessionEvent::new(EventType::PhaseCompleted, session_id)
                            .with_phase(phase_index),
                    );
                    let target = if success {
                        SessionState::Completed
                    } else {
                        SessionState::Failed
                    };
                    session.set_state(target)?;
                    let event_type = if success {
                        EventType::SessionCompleted
                    } else {
                        EventType::SessionFailed
                    };
                    events.emit(SessionEvent::new(event_type, session_id));
                    info!(session = %session_id, state = %target, "Session finished");
                }
            }
            Ok(dispatches)
        })?;

        // Cleanup runs after the transition committed, outside the mutex.
        self.locks.release_all(agent_id);
        if let Some(workspace) = self.workspaces.locate(agent_id) {
            let _ = self.workspaces.release(&workspace).await;
        }
        Ok(dispatches)
    }

    fn persist(&self, session_id: &str) -> Result<()> {
        let snapshot = self.sessions.snapshot(session_id)?;
        self.store.save_session(&snapshot)?;
        self.store.replace_locks(&self.locks.entries())?;
        self.store.replace_workspaces(&self.workspaces.all())?;
        Ok(())
    }

    async fn reconcile(&self) -> Result<()> {
        for entry in self.store.load_locks()? {
            self.locks.restore(entry);
        }
        for workspace in self.store.load_workspaces()? {
            self.workspaces.restore(workspace);
        }

        let sessions = self.store.load_sessions()?;
        let mut crashed: Vec<(String, Vec<String>)> = Vec::new();
        for session in sessions {
            let session_id = session.id.clone();
            let stale = if session.state.is_terminal() {
                Vec::new()
            } else {
                session.non_terminal_agents()
            };
            self.sessions.insert(session);
            if !stale.is_empty() {
                crashed.push((session_id, stale));
            }
        }

        for (session_id, agents) in crashed {
            warn!(
                session = %session_id,
                agents = agents.len(),
                "Reconciling crashed agents after restart"
            );
            for agent_id in agents {
                self.apply_terminal(
                    &session_id,
                    &agent_id,
                    AgentStatus::Failed,
                    Some("crashed: non-terminal at restart".to_string()),
                    false,
                )
                .await?;
            }
            self.persist(&session_id)?;
        }

        // Anything still attached to a terminal or unknown owner is an
        // orphan; no agent survives a restart as live.
        let released = self.workspaces.reconcile_orphans(&[]).await;
        if !released.is_empty() {
            info!(count = released.len(), "Orphaned workspaces released");
        }
        self.locks.entries().into_iter().for_each(|entry| {
            self.locks.release_all(&entry.holder);
        });
        Ok(())
    }
}

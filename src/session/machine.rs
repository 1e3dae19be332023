use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ConcordError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Planning,
    Executing,
    Completed,
    Failed,
}

impl SessionState {
    pub fn allowed_transitions(&self) -> &'static [SessionState] {
        use SessionState::*;
        match self {
            Planning => &[Executing, Failed],
            Executing => &[Completed, Failed],
            Completed => &[],
            Failed => &[],
        }
    }

    pub fn can_transition_to(&self, target: SessionState) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Validate a transition, returning the target on success.
    pub fn transition_to(&self, target: SessionState) -> Result<SessionState> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(invalid_transition("session", *self, target, self.allowed_transitions()))
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl AgentStatus {
    pub fn allowed_transitions(&self) -> &'static [AgentStatus] {
        use AgentStatus::*;
        match self {
            // Pending -> Failed covers workspace allocation failure.
            Pending => &[Running, Failed],
            Running => &[Completed, Failed],
            Completed => &[],
            Failed => &[],
        }
    }

    pub fn can_transition_to(&self, target: AgentStatus) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn transition_to(&self, target: AgentStatus) -> Result<AgentStatus> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(invalid_transition("agent", *self, target, self.allowed_transitions()))
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

fn invalid_transition<S: fmt::Display>(
    entity: &'static str,
    from: S,
    to: S,
    allowed: &[S],
) -> ConcordError {
    ConcordError::InvalidTransition {
        entity,
        from: from.to_string(),
        to: to.to_string(),
        allowed: allowed
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", "),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_forward_only() {
        assert!(SessionState::Planning.can_transition_to(SessionState::Executing));
        assert!(SessionState::Executing.can_transition_to(SessionState::Completed));
        assert!(SessionState::Executing.can_transition_to(SessionState::Failed));
        assert!(!SessionState::Executing.can_transition_to(SessionState::Planning));
        assert!(!SessionState::Completed.can_transition_to(SessionState::Executing));
        assert!(!SessionState::Failed.can_transition_to(SessionState::Planning));
    }

    #[test]
    fn test_session_abort_legal_from_any_non_terminal() {
        assert!(SessionState::Planning.can_transition_to(SessionState::Failed));
        assert!(SessionState::Executing.can_transition_to(SessionState::Failed));
    }

    #[test]
    fn test_agent_transitions() {
        assert!(AgentStatus::Pending.can_transition_to(AgentStatus::Running));
        assert!(AgentStatus::Pending.can_transition_to(AgentStatus::Failed));
        assert!(AgentStatus::Running.can_transition_to(AgentStatus::Completed));
        assert!(!AgentStatus::Pending.can_transition_to(AgentStatus::Completed));
        assert!(!AgentStatus::Completed.can_transition_to(AgentStatus::Running));
    }

    #[test]
    fn test_invalid_transition_is_surfaced() {
        let err = SessionState::Completed
            .transition_to(SessionState::Executing)
            .unwrap_err();
        match err {
            ConcordError::InvalidTransition { entity, from, to, .. } => {
                assert_eq!(entity, "session");
                assert_eq!(from, "completed");
                assert_eq!(to, "executing");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Completed.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::Planning.is_terminal());
        assert!(AgentStatus::Failed.is_terminal());
        assert!(!AgentStatus::Running.is_terminal());
    }
}

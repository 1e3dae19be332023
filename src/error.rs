use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConcordError {
    #[error("Resource {resource} is locked by {holder}")]
    LockHeld { resource: String, holder: String },

    #[error("Agent {agent} does not hold the lock on {resource}")]
    NotHolder { resource: String, agent: String },

    #[error("Agent {agent} already has a workspace")]
    WorkspaceConflict { agent: String },

    #[error("Workspace backend error: {message}")]
    WorkspaceBackend { message: String },

    #[error("Agent {agent} lacks capability: {capability}")]
    CapabilityDenied { agent: String, capability: String },

    #[error("Invalid {entity} transition: {from} -> {to} (allowed: {allowed})")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
        allowed: String,
    },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Phase {phase} out of range for session {session}")]
    PhaseOutOfRange { session: String, phase: usize },

    #[error("Unknown role: {0}")]
    UnknownRole(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ConcordError {
    /// Errors an agent can recover from without failing its session.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::LockHeld { .. }
                | Self::WorkspaceConflict { .. }
                | Self::WorkspaceBackend { .. }
                | Self::CapabilityDenied { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ConcordError>;

pub(crate) fn persist_err(context: &str, err: impl std::fmt::Display) -> ConcordError {
    ConcordError::Persistence(format!("{}: {}", context, err))
}

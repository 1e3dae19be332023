pub mod capability;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod lock;
pub mod persist;
pub mod pipeline;
pub mod session;
pub mod workspace;

pub use capability::{Capability, CapabilitySet, RoleListing, RoleRegistry, RoleSpec};
pub use config::{ConcordConfig, LockPolicy};
pub use coordinator::{Coordinator, PhaseStatus, Progress, SessionStatus};
pub use error::{ConcordError, Result};
pub use events::{EventType, SessionEvent};
pub use lock::{LockEntry, LockRegistry};
pub use persist::{SqliteStore, StateStore};
pub use pipeline::{
    OperationDescriptor, OperationKind, OperationVerdict, PolicyDecision, PostHook, PreCheck,
    ValidationPipeline, Verdict,
};
pub use session::{Agent, AgentSpec, AgentStatus, Session, SessionState, Strategy};
pub use workspace::{
    DirBackend, GitWorktreeBackend, Workspace, WorkspaceBackend, WorkspaceManager,
};

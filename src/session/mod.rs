//! Session, phase and agent lifecycle.

mod machine;
mod model;
mod store;

pub use machine::{AgentStatus, SessionState};
pub use model::{Agent, AgentSpec, Phase, PhaseAdvance, Session, Strategy};
pub use store::SessionStore;

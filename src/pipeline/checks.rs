//! Built-in pipeline checks and post hooks.

use async_trait::async_trait;
use tracing::debug;

use crate::config::LockPolicy;
use crate::error::ConcordError;
use crate::events::{EventType, SessionEvent};

use super::operation::{
    OperationDescriptor, OperationRecord, OperationVerdict, PolicyDecision, Verdict,
};
use super::{CheckContext, PostHook, PreCheck};

/// Denies operations for sessions or agents that are already terminal.
/// This is what stops in-flight operations once an abort has landed.
pub struct SessionActiveCheck;

#[async_trait]
impl PreCheck for SessionActiveCheck {
    fn name(&self) -> &'static str {
        "session_active"
    }

    async fn evaluate(&self, op: &OperationDescriptor, ctx: &CheckContext) -> PolicyDecision {
        let status = ctx.sessions.read(&op.session_id, |session| {
            let agent_terminal = session
                .agents
                .get(&op.agent_id)
                .map(|a| a.status.is_terminal());
            (session.state, agent_terminal)
        });
        match status {
            Err(_) => PolicyDecision::deny(self.name(), format!("unknown session {}", op.session_id)),
            Ok((state, _)) if state.is_terminal() => {
                PolicyDecision::deny(self.name(), format!("session is {state}"))
            }
            Ok((_, None)) => {
                PolicyDecision::deny(self.name(), format!("unknown agent {}", op.agent_id))
            }
            Ok((_, Some(true))) => PolicyDecision::deny(self.name(), "agent is terminal"),
            Ok((_, Some(false))) => PolicyDecision::allow(self.name()),
        }
    }
}

/// Hard-denies operations whose required capability the agent's role does
/// not grant.
pub struct CapabilityCheck;

#[async_trait]
impl PreCheck for CapabilityCheck {
    fn name(&self) -> &'static str {
        "capability"
    }

    async fn evaluate(&self, op: &OperationDescriptor, ctx: &CheckContext) -> PolicyDecision {
        let Some(required) = op.kind.required_capability() else {
            return PolicyDecision::allow(self.name());
        };
        let role = ctx
            .sessions
            .read(&op.session_id, |session| {
                session.agents.get(&op.agent_id).map(|a| a.role.clone())
            })
            .ok()
            .flatten();
        let granted = role
            .map(|r| ctx.roles.capabilities_for(&r))
            .unwrap_or_default();
        if granted.contains(&required) {
            PolicyDecision::allow(self.name())
        } else {
            let err = ConcordError::CapabilityDenied {
                agent: op.agent_id.clone(),
                capability: required.to_string(),
            };
            PolicyDecision::deny(self.name(), err.to_string())
        }
    }
}

/// Advisory file lock check: attempts the lock on write-class operations.
/// A lock held by another agent warns (carrying the holder), never blocks.
pub struct FileLockCheck;

#[async_trait]
impl PreCheck for FileLockCheck {
    fn name(&self) -> &'static str {
        "file_lock"
    }

    async fn evaluate(&self, op: &OperationDescriptor, ctx: &CheckContext) -> PolicyDecision {
        if !op.kind.mutates_files() {
            return PolicyDecision::allow(self.name());
        }
        let Some(resource) = &op.resource else {
            return PolicyDecision::allow(self.name());
        };
        match ctx.locks.acquire(resource, &op.agent_id) {
            Ok(_) => PolicyDecision::allow(self.name()),
            Err(ConcordError::LockHeld { holder, resource }) => PolicyDecision::warn(
                self.name(),
                format!("{resource} is being edited by {holder}"),
            ),
            Err(other) => PolicyDecision::warn(self.name(), other.to_string()),
        }
    }
}

/// Records the operation into the agent's log and emits warn/deny events.
/// Pure observation; cannot fail the operation.
pub struct AuditHook {
    pub max_operation_log: usize,
}

#[async_trait]
impl PostHook for AuditHook {
    fn name(&self) -> &'static str {
        "audit"
    }

    async fn observe(
        &self,
        op: &OperationDescriptor,
        verdict: &OperationVerdict,
        _executed: bool,
        ctx: &CheckContext,
    ) {
        let record = OperationRecord::from_outcome(op, verdict);
        let max = self.max_operation_log;
        let result = ctx.sessions.mutate(&op.session_id, |session, events| {
            if let Ok(agent) = session.agent_mut(&op.agent_id) {
                agent.operation_log.push(record.clone());
                if agent.operation_log.len() > max {
                    let excess = agent.operation_log.len() - max;
                    agent.operation_log.drain(..excess);
                }
            }
            session.touch();
            match verdict.verdict {
                Verdict::Deny => events.emit(
                    SessionEvent::new(EventType::OperationDenied, &session.id)
                        .with_agent(&op.agent_id)
                        .with_message(
                            verdict.decision.reason.clone().unwrap_or_default(),
                        ),
                ),
                Verdict::Warn => events.emit(
                    SessionEvent::new(EventType::OperationWarned, &session.id)
                        .with_agent(&op.agent_id)
                        .with_message(
                            verdict
                                .warnings
                                .first()
                                .and_then(|w| w.reason.clone())
                                .unwrap_or_default(),
                        ),
                ),
                Verdict::Allow => {}
            }
            Ok(())
        });
        if let Err(err) = result {
            debug!(error = %err, "Audit record dropped");
        }
    }
}

/// Releases the write lock once the operation executed, when the policy
/// says locks do not outlive the write.
pub struct LockReleaseHook {
    pub policy: LockPolicy,
}

#[async_trait]
impl PostHook for LockReleaseHook {
    fn name(&self) -> &'static str {
        "lock_release"
    }

    async fn observe(
        &self,
        op: &OperationDescriptor,
        verdict: &OperationVerdict,
        executed: bool,
        ctx: &CheckContext,
    ) {
        if self.policy != LockPolicy::ReleaseOnWrite {
            return;
        }
        if !executed || !verdict.allowed() || !op.kind.mutates_files() {
            return;
        }
        let Some(resource) = &op.resource else { return };
        // NotHolder here means the lock was never ours (warned write);
        // nothing to release.
        if let Err(err) = ctx.locks.release(resource, &op.agent_id) {
            debug!(error = %err, "Post-write lock release skipped");
        }
    }
}

//! Hook-based validation pipeline.
//!
//! Two ordered stages of independently pluggable checks. The pre stage
//! gates the operation: evaluation runs in registration order, stops at
//! the first deny, accumulates warnings, and fail-closes any check that
//! overruns its time budget. The post stage is pure observation: it runs
//! regardless of the pre verdict, records the outcome, and can never fail
//! or block the operation.

mod checks;
pub mod operation;

pub use checks::{AuditHook, CapabilityCheck, FileLockCheck, LockReleaseHook, SessionActiveCheck};
pub use operation::{
    OperationDescriptor, OperationKind, OperationRecord, OperationVerdict, PolicyDecision, Verdict,
};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::capability::RoleRegistry;
use crate::config::{ConcordConfig, LockPolicy};
use crate::lock::LockRegistry;
use crate::session::SessionStore;

/// Shared state every check evaluates against.
pub struct CheckContext {
    pub locks: Arc<LockRegistry>,
    pub sessions: Arc<SessionStore>,
    pub roles: Arc<RoleRegistry>,
}

/// A pre-operation check. Decides allow/warn/deny for one operation.
#[async_trait]
pub trait PreCheck: Send + Sync {
    fn name(&self) -> &'static str;
    async fn evaluate(&self, op: &OperationDescriptor, ctx: &CheckContext) -> PolicyDecision;
}

/// A post-operation hook. Observes the outcome; must not fail.
#[async_trait]
pub trait PostHook: Send + Sync {
    fn name(&self) -> &'static str;
    async fn observe(
        &self,
        op: &OperationDescriptor,
        verdict: &OperationVerdict,
        executed: bool,
        ctx: &CheckContext,
    );
}

pub struct ValidationPipeline {
    pre: Vec<Arc<dyn PreCheck>>,
    post: Vec<Arc<dyn PostHook>>,
    check_timeout: Duration,
}

impl ValidationPipeline {
    /// Empty pipeline; checks run in the order they are registered.
    pub fn new(check_timeout: Duration) -> Self {
        Self {
            pre: Vec::new(),
            post: Vec::new(),
            check_timeout,
        }
    }

    /// The standard stack: session-active, capability, file-lock pre
    /// checks and audit + lock-release post hooks.
    pub fn standard(config: &ConcordConfig) -> Self {
        let mut pipeline = Self::new(config.check_timeout());
        pipeline.register_pre(Arc::new(SessionActiveCheck));
        pipeline.register_pre(Arc::new(CapabilityCheck));
        pipeline.register_pre(Arc::new(FileLockCheck));
        pipeline.register_post(Arc::new(AuditHook {
            max_operation_log: config.max_operation_log,
        }));
        pipeline.register_post(Arc::new(LockReleaseHook {
            policy: config.lock_policy,
        }));
        pipeline
    }

    pub fn register_pre(&mut self, check: Arc<dyn PreCheck>) {
        self.pre.push(check);
    }

    pub fn register_post(&mut self, hook: Arc<dyn PostHook>) {
        self.post.push(hook);
    }

    /// Run the pre-operation stage.
    ///
    /// Short-circuits on the first deny; a check that exceeds its budget
    /// is converted to a deny (fail-closed), never an allow.
    pub async fn evaluate(&self, op: &OperationDescriptor, ctx: &CheckContext) -> OperationVerdict {
        let mut warnings: Vec<PolicyDecision> = Vec::new();
        let mut last = PolicyDecision::allow("pipeline");

        for check in &self.pre {
            let decision =
                match tokio::time::timeout(self.check_timeout, check.evaluate(op, ctx)).await {
                    Ok(decision) => decision,
                    Err(_) => {
                        warn!(check = check.name(), "Check timed out, denying");
                        PolicyDecision::deny(
                            check.name(),
                            format!("check exceeded {}ms budget", self.check_timeout.as_millis()),
                        )
                    }
                };

            match decision.verdict {
                Verdict::Deny => {
                    debug!(check = check.name(), agent = %op.agent_id, "Operation denied");
                    return OperationVerdict {
                        verdict: Verdict::Deny,
                        decision,
                        warnings,
                    };
                }
                Verdict::Warn => {
                    warnings.push(decision.clone());
                    last = decision;
                }
                Verdict::Allow => {
                    last = decision;
                }
            }
        }

        let verdict = if warnings.is_empty() {
            Verdict::Allow
        } else {
            Verdict::Warn
        };
        OperationVerdict {
            verdict,
            decision: last,
            warnings,
        }
    }

    /// Run the post-operation stage. Runs every hook regardless of the
    /// verdict and of other hooks; hooks observe, they cannot veto.
    pub async fn observe(
        &self,
        op: &OperationDescriptor,
        verdict: &OperationVerdict,
        executed: bool,
        ctx: &CheckContext,
    ) {
        for hook in &self.post {
            hook.observe(op, verdict, executed, ctx).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::session::{Agent, AgentSpec, AgentStatus, Session, SessionState, Strategy};

    fn context() -> CheckContext {
        CheckContext {
            locks: Arc::new(LockRegistry::new()),
            sessions: Arc::new(SessionStore::new()),
            roles: Arc::new(RoleRegistry::with_defaults()),
        }
    }

    fn seed_session(ctx: &CheckContext, role: &str) -> (String, String) {
        let mut session = Session::new(
            "objective",
            Strategy::Sequential,
            vec![AgentSpec::new(role, "task")],
        );
        session.set_state(SessionState::Executing).unwrap();
        let mut agent = Agent::new(role, "task", 0);
        agent.set_status(AgentStatus::Running).unwrap();
        let ids = (session.id.clone(), agent.id.clone());
        session.add_agent(agent);
        ctx.sessions.insert(session);
        ids
    }

    struct FixedCheck {
        name: &'static str,
        verdict: Verdict,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PreCheck for FixedCheck {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn evaluate(&self, _op: &OperationDescriptor, _ctx: &CheckContext) -> PolicyDecision {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.verdict {
                Verdict::Allow => PolicyDecision::allow(self.name),
                Verdict::Warn => PolicyDecision::warn(self.name, "advisory"),
                Verdict::Deny => PolicyDecision::deny(self.name, "refused"),
            }
        }
    }

    fn fixed(name: &'static str, verdict: Verdict) -> (Arc<FixedCheck>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(FixedCheck {
                name,
                verdict,
                calls: Arc::clone(&calls),
            }),
            calls,
        )
    }

    #[tokio::test]
    async fn test_short_circuit_on_deny() {
        let ctx = context();
        let mut pipeline = ValidationPipeline::new(Duration::from_secs(1));
        let (first, first_calls) = fixed("first", Verdict::Allow);
        let (second, second_calls) = fixed("second", Verdict::Deny);
        let (third, third_calls) = fixed("third", Verdict::Allow);
        pipeline.register_pre(first);
        pipeline.register_pre(second);
        pipeline.register_pre(third);

        let op = OperationDescriptor::new(OperationKind::Other, "s", "a");
        let verdict = pipeline.evaluate(&op, &ctx).await;

        assert_eq!(verdict.verdict, Verdict::Deny);
        assert_eq!(verdict.decision.check, "second");
        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
        assert_eq!(third_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_warn_does_not_block_later_checks() {
        let ctx = context();
        let mut pipeline = ValidationPipeline::new(Duration::from_secs(1));
        let (warn, _) = fixed("advisory", Verdict::Warn);
        let (tail, tail_calls) = fixed("tail", Verdict::Allow);
        pipeline.register_pre(warn);
        pipeline.register_pre(tail);

        let op = OperationDescriptor::new(OperationKind::Other, "s", "a");
        let verdict = pipeline.evaluate(&op, &ctx).await;

        assert_eq!(verdict.verdict, Verdict::Warn);
        assert_eq!(verdict.warnings.len(), 1);
        assert_eq!(tail_calls.load(Ordering::SeqCst), 1);
        assert!(verdict.allowed());
    }

    struct StalledCheck;

    #[async_trait]
    impl PreCheck for StalledCheck {
        fn name(&self) -> &'static str {
            "stalled"
        }

        async fn evaluate(&self, _op: &OperationDescriptor, _ctx: &CheckContext) -> PolicyDecision {
            tokio::time::sleep(Duration::from_secs(60)).await;
            PolicyDecision::allow("stalled")
        }
    }

    #[tokio::test]
    async fn test_timeout_fails_closed() {
        let ctx = context();
        let mut pipeline = ValidationPipeline::new(Duration::from_millis(20));
        pipeline.register_pre(Arc::new(StalledCheck));

        let op = OperationDescriptor::new(OperationKind::Other, "s", "a");
        let verdict = pipeline.evaluate(&op, &ctx).await;
        assert_eq!(verdict.verdict, Verdict::Deny);
        assert_eq!(verdict.decision.check, "stalled");
    }

    #[tokio::test]
    async fn test_capability_check_denies_missing_grant() {
        let ctx = context();
        // Reviewers cannot write.
        let (session_id, agent_id) = seed_session(&ctx, "reviewer");
        let check = CapabilityCheck;
        let op = OperationDescriptor::new(OperationKind::FileWrite, &session_id, &agent_id)
            .with_resource("src/main.rs");
        let decision = check.evaluate(&op, &ctx).await;
        assert_eq!(decision.verdict, Verdict::Deny);

        let read = OperationDescriptor::new(OperationKind::FileRead, &session_id, &agent_id)
            .with_resource("src/main.rs");
        assert_eq!(check.evaluate(&read, &ctx).await.verdict, Verdict::Allow);
    }

    #[tokio::test]
    async fn test_lock_check_warns_with_holder_identity() {
        let ctx = context();
        let (session_id, agent_id) = seed_session(&ctx, "engineer");
        ctx.locks
            .acquire(std::path::Path::new("src/main.rs"), "agent-other")
            .unwrap();

        let op = OperationDescriptor::new(OperationKind::FileWrite, &session_id, &agent_id)
            .with_resource("src/main.rs");
        let decision = FileLockCheck.evaluate(&op, &ctx).await;
        assert_eq!(decision.verdict, Verdict::Warn);
        assert!(decision.reason.unwrap().contains("agent-other"));
    }

    #[tokio::test]
    async fn test_session_active_check_denies_terminal_session() {
        let ctx = context();
        let (session_id, agent_id) = seed_session(&ctx, "engineer");
        ctx.sessions
            .mutate(&session_id, |session, _| {
                session.set_state(SessionState::Failed)
            })
            .unwrap();

        let op = OperationDescriptor::new(OperationKind::FileRead, &session_id, &agent_id);
        let decision = SessionActiveCheck.evaluate(&op, &ctx).await;
        assert_eq!(decision.verdict, Verdict::Deny);
    }

    #[tokio::test]
    async fn test_standard_stack_allows_engineer_write_and_audits() {
        let ctx = CheckContext {
            locks: Arc::new(LockRegistry::new()),
            sessions: Arc::new(SessionStore::new()),
            roles: Arc::new(RoleRegistry::with_defaults()),
        };
        let (session_id, agent_id) = seed_session(&ctx, "engineer");
        let pipeline = ValidationPipeline::standard(&ConcordConfig::default());

        let op = OperationDescriptor::new(OperationKind::FileWrite, &session_id, &agent_id)
            .with_resource("src/lib.rs");
        let verdict = pipeline.evaluate(&op, &ctx).await;
        assert_eq!(verdict.verdict, Verdict::Allow);

        pipeline.observe(&op, &verdict, true, &ctx).await;
        let log_len = ctx
            .sessions
            .read(&session_id, |s| s.agents[&agent_id].operation_log.len())
            .unwrap();
        assert_eq!(log_len, 1);
        // ReleaseOnWrite: the lock fell with the post stage.
        assert!(ctx.locks.query(std::path::Path::new("src/lib.rs")).is_none());
    }
}

//! Restart and crash-recovery behavior.
//!
//! State is written through to SQLite after every committed transition;
//! reopening against the same database must reconcile whatever the
//! previous process left behind.

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use concord::{
    AgentSpec, AgentStatus, ConcordConfig, Coordinator, DirBackend, LockPolicy,
    OperationDescriptor, OperationKind, SessionState, SqliteStore, Strategy,
};

fn config(dir: &Path) -> ConcordConfig {
    ConcordConfig {
        workspaces_dir: dir.join("worktrees"),
        lock_policy: LockPolicy::HoldUntilTermination,
        ..Default::default()
    }
}

fn open_store(dir: &Path) -> Arc<SqliteStore> {
    Arc::new(SqliteStore::open(dir.join("concord.db")).unwrap())
}

#[tokio::test]
async fn test_reopen_forces_crashed_agents_failed_and_clears_resources() {
    let dir = TempDir::new().unwrap();
    let session_id;
    let agent_id;
    {
        let coord = Coordinator::new(
            config(dir.path()),
            Arc::new(DirBackend),
            open_store(dir.path()),
        )
        .unwrap();
        session_id = coord
            .start_session(
                "interrupted run",
                Strategy::Parallel,
                vec![AgentSpec::new("engineer", "edit")],
            )
            .unwrap();
        agent_id = coord
            .dispatch_agent(&session_id, 0, "engineer", "edit")
            .await
            .unwrap();
        let op = OperationDescriptor::new(OperationKind::FileWrite, &session_id, &agent_id)
            .with_resource("src/main.rs");
        coord.submit_operation(op).await.unwrap();
        assert!(coord.locate_workspace(&agent_id).is_some());
        // Process dies here with the agent still running and a lock held.
    }

    let coord = Coordinator::open(
        config(dir.path()),
        Arc::new(DirBackend),
        open_store(dir.path()),
    )
    .await
    .unwrap();

    let status = coord.query_status(&session_id, true).unwrap();
    assert_eq!(status.state, SessionState::Failed);
    let agent = &status.current_phase.unwrap().agents[0];
    assert_eq!(agent.id, agent_id);
    assert_eq!(agent.status, AgentStatus::Failed);

    assert!(coord.locate_workspace(&agent_id).is_none());
    assert_eq!(coord.lock_holder(Path::new("src/main.rs")), None);
}

#[tokio::test]
async fn test_reopen_leaves_terminal_sessions_untouched() {
    let dir = TempDir::new().unwrap();
    let session_id;
    {
        let coord = Coordinator::new(
            config(dir.path()),
            Arc::new(DirBackend),
            open_store(dir.path()),
        )
        .unwrap();
        session_id = coord
            .start_session(
                "finished run",
                Strategy::Sequential,
                vec![AgentSpec::new("qa", "verify")],
            )
            .unwrap();
        let agent = coord
            .dispatch_agent(&session_id, 0, "qa", "verify")
            .await
            .unwrap();
        coord
            .report_agent_outcome(&session_id, &agent, true, Some("all green".into()))
            .await
            .unwrap();
    }

    let coord = Coordinator::open(
        config(dir.path()),
        Arc::new(DirBackend),
        open_store(dir.path()),
    )
    .await
    .unwrap();

    let status = coord.query_status(&session_id, true).unwrap();
    assert_eq!(status.state, SessionState::Completed);
    assert_eq!(status.progress.phases_completed, 1);
    let agent = &status.current_phase.unwrap().agents[0];
    assert_eq!(agent.status, AgentStatus::Completed);
}

#[tokio::test]
async fn test_reopen_does_not_resume_later_phases() {
    let dir = TempDir::new().unwrap();
    let session_id;
    {
        let coord = Coordinator::new(
            config(dir.path()),
            Arc::new(DirBackend),
            open_store(dir.path()),
        )
        .unwrap();
        session_id = coord
            .start_session(
                "multi phase run",
                Strategy::Sequential,
                vec![
                    AgentSpec::new("architect", "design"),
                    AgentSpec::new("engineer", "build"),
                ],
            )
            .unwrap();
        coord
            .dispatch_agent(&session_id, 0, "architect", "design")
            .await
            .unwrap();
        // Crash with phase 1 in flight; phase 2 is still only planned.
    }

    let coord = Coordinator::open(
        config(dir.path()),
        Arc::new(DirBackend),
        open_store(dir.path()),
    )
    .await
    .unwrap();

    // The crashed architect is failed and its phase settles, but no
    // engineer is spawned on reconcile; the run is left for the caller.
    let status = coord.query_status(&session_id, true).unwrap();
    assert_eq!(status.state, SessionState::Executing);
    assert_eq!(status.progress.phases_completed, 1);
    let phase = status.current_phase.unwrap();
    assert_eq!(phase.number, 2);
    assert!(phase.agents.is_empty());
}

//! Workspace allocation and release.
//!
//! A workspace is an isolated working copy bound to exactly one
//! (session, agent) pair. Allocation reserves the agent's slot in the
//! registry before any backend work starts, so two racing allocations for
//! one agent cannot both proceed; the slow branching operation itself runs
//! without any registry or session mutex held.

mod backend;

pub use backend::{DirBackend, GitWorktreeBackend, WorkspaceBackend};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ConcordError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub session_id: String,
    pub agent_id: String,
    pub path: PathBuf,
    pub branch: String,
    pub created_at: DateTime<Utc>,
}

pub struct WorkspaceManager {
    backend: Arc<dyn WorkspaceBackend>,
    workspaces_dir: PathBuf,
    /// agent id -> workspace; `None` while an allocation is in flight.
    by_agent: DashMap<String, Option<Workspace>>,
    allocate_timeout: Duration,
}

fn short(id: &str) -> &str {
    let tail = id.rsplit('-').next().unwrap_or(id);
    &tail[..tail.len().min(8)]
}

impl WorkspaceManager {
    pub fn new(
        backend: Arc<dyn WorkspaceBackend>,
        workspaces_dir: impl Into<PathBuf>,
        allocate_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            workspaces_dir: workspaces_dir.into(),
            by_agent: DashMap::new(),
            allocate_timeout,
        }
    }

    /// Allocate an isolated workspace for `agent` within `session`.
    ///
    /// Fails with `WorkspaceConflict` if the agent already has (or is
    /// getting) one, and `WorkspaceBackend`/`Timeout` when branching
    /// fails. Backend failures are propagated, never retried here.
    pub async fn allocate(&self, session_id: &str, agent_id: &str, role: &str) -> Result<Workspace> {
        match self.by_agent.entry(agent_id.to_string()) {
            Entry::Occupied(_) => {
                return Err(ConcordError::WorkspaceConflict {
                    agent: agent_id.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(None);
            }
        }

        let name = format!("{}-{}", role, short(agent_id));
        let path = self.workspaces_dir.join(&name);
        let branch = format!("concord/{}/{}", short(session_id), name);

        let created = tokio::time::timeout(
            self.allocate_timeout,
            self.backend.create(&path, &branch),
        )
        .await;

        let outcome = match created {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ConcordError::Timeout(format!(
                "workspace allocation for {agent_id}"
            ))),
        };

        if let Err(err) = outcome {
            // Roll the reservation back so a later attempt can proceed.
            self.by_agent.remove(agent_id);
            return Err(err);
        }

        let workspace = Workspace {
            id: format!("ws-{}", Uuid::new_v4()),
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            path,
            branch,
            created_at: Utc::now(),
        };
        info!(
            workspace = %workspace.id,
            agent = %agent_id,
            path = %workspace.path.display(),
            "Workspace allocated"
        );
        self.by_agent
            .insert(agent_id.to_string(), Some(workspace.clone()));
        Ok(workspace)
    }

    /// Release a workspace. Idempotent: releasing an already-released
    /// workspace succeeds, and backend teardown failure is logged, not
    /// fatal (the storage may already be gone).
    pub async fn release(&self, workspace: &Workspace) -> Result<()> {
        let registered = self
            .by_agent
            .remove(&workspace.agent_id)
            .and_then(|(_, ws)| ws);
        if registered.is_none() {
            debug!(workspace = %workspace.id, "Workspace already released");
        }

        if let Err(err) = self.backend.remove(&workspace.path, &workspace.branch).await {
            warn!(
                workspace = %workspace.id,
                error = %err,
                "Workspace teardown failed, continuing"
            );
        } else {
            debug!(workspace = %workspace.id, "Workspace released");
        }
        Ok(())
    }

    pub fn locate(&self, agent_id: &str) -> Option<Workspace> {
        self.by_agent.get(agent_id).and_then(|w| w.clone())
    }

    /// Snapshot of all live workspaces, for persistence and inspection.
    pub fn all(&self) -> Vec<Workspace> {
        self.by_agent
            .iter()
            .filter_map(|entry| entry.clone())
            .collect()
    }

    /// Restore a persisted workspace record. Startup only.
    pub(crate) fn restore(&self, workspace: Workspace) {
        self.by_agent
            .insert(workspace.agent_id.clone(), Some(workspace));
    }

    /// Release every workspace whose owner is not in `live_agents`.
    /// Crash recovery: a workspace with a terminal or unknown owner is an
    /// orphan and gets garbage-collected.
    pub async fn reconcile_orphans(&self, live_agents: &[String]) -> Vec<Workspace> {
        let orphans: Vec<Workspace> = self
            .all()
            .into_iter()
            .filter(|ws| !live_agents.contains(&ws.agent_id))
            .collect();

        for workspace in &orphans {
            warn!(
                workspace = %workspace.id,
                agent = %workspace.agent_id,
                "Releasing orphaned workspace"
            );
            // Release never fails; teardown errors are logged inside.
            let _ = self.release(workspace).await;
        }
        orphans
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use std::path::Path;

    struct CountingBackend {
        creates: AtomicUsize,
        removes: AtomicUsize,
        fail_create: bool,
    }

    impl CountingBackend {
        fn new(fail_create: bool) -> Arc<Self> {
            Arc::new(Self {
                creates: AtomicUsize::new(0),
                removes: AtomicUsize::new(0),
                fail_create,
            })
        }
    }

    #[async_trait]
    impl WorkspaceBackend for CountingBackend {
        async fn create(&self, _path: &Path, _branch: &str) -> Result<()> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            if self.fail_create {
                Err(ConcordError::WorkspaceBackend {
                    message: "branch refused".into(),
                })
            } else {
                Ok(())
            }
        }

        async fn remove(&self, _path: &Path, _branch: &str) -> Result<()> {
            self.removes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn manager(backend: Arc<CountingBackend>) -> WorkspaceManager {
        WorkspaceManager::new(backend, "/tmp/concord-test", Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_allocate_then_locate() {
        let manager = manager(CountingBackend::new(false));
        let ws = manager.allocate("session-1", "agent-1", "engineer").await.unwrap();
        assert_eq!(manager.locate("agent-1").unwrap().id, ws.id);
        assert!(ws.branch.starts_with("concord/"));
    }

    #[tokio::test]
    async fn test_double_allocate_conflicts() {
        let manager = manager(CountingBackend::new(false));
        manager.allocate("s", "agent-1", "engineer").await.unwrap();
        assert!(matches!(
            manager.allocate("s", "agent-1", "engineer").await,
            Err(ConcordError::WorkspaceConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_backend_failure_rolls_back_reservation() {
        let backend = CountingBackend::new(true);
        let manager = manager(Arc::clone(&backend));
        assert!(manager.allocate("s", "agent-1", "qa").await.is_err());
        assert!(manager.locate("agent-1").is_none());

        // The slot is free again for a later (still failing) attempt.
        assert!(manager.allocate("s", "agent-1", "qa").await.is_err());
        assert_eq!(backend.creates.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let backend = CountingBackend::new(false);
        let manager = manager(Arc::clone(&backend));
        let ws = manager.allocate("s", "agent-1", "qa").await.unwrap();

        manager.release(&ws).await.unwrap();
        manager.release(&ws).await.unwrap();
        assert!(manager.locate("agent-1").is_none());
        assert_eq!(backend.removes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reconcile_orphans_releases_unknown_owners() {
        let manager = manager(CountingBackend::new(false));
        manager.allocate("s", "agent-live", "qa").await.unwrap();
        manager.allocate("s", "agent-dead", "engineer").await.unwrap();

        let orphans = manager.reconcile_orphans(&["agent-live".to_string()]).await;
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].agent_id, "agent-dead");
        assert!(manager.locate("agent-dead").is_none());
        assert!(manager.locate("agent-live").is_some());
    }
}

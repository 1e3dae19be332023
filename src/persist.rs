//! Durable coordination state.
//!
//! The engine is storage-agnostic: everything goes through [`StateStore`].
//! The shipped implementation is SQLite with JSON payload columns.
//! Sessions are written as whole snapshots after every committed
//! transition, locks and workspaces as full-table replacements (both sets
//! are small and the write rate is per-transition, not per-event).

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::debug;

use crate::error::{persist_err, Result};
use crate::lock::LockEntry;
use crate::session::Session;
use crate::workspace::Workspace;

pub trait StateStore: Send + Sync {
    fn save_session(&self, session: &Session) -> Result<()>;
    fn load_sessions(&self) -> Result<Vec<Session>>;
    fn replace_locks(&self, entries: &[LockEntry]) -> Result<()>;
    fn load_locks(&self) -> Result<Vec<LockEntry>>;
    fn replace_workspaces(&self, workspaces: &[Workspace]) -> Result<()>;
    fn load_workspaces(&self) -> Result<Vec<Workspace>>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| persist_err("Failed to create db directory", e))?;
        }
        let conn = Connection::open(db_path)
            .map_err(|e| persist_err("Failed to open database", e))?;
        Self::from_connection(conn)
    }

    /// Non-durable store backed by an in-memory database. Tests and
    /// embedders that opt out of persistence.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| persist_err("Failed to open in-memory database", e))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS locks (
                resource TEXT PRIMARY KEY,
                payload TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS workspaces (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                payload TEXT NOT NULL
            );",
        )
        .map_err(|e| persist_err("Failed to create schema", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl StateStore for SqliteStore {
    fn save_session(&self, session: &Session) -> Result<()> {
        let payload = serde_json::to_string(session)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (id, payload, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET payload = ?2, updated_at = ?3",
            params![session.id, payload, session.updated_at.to_rfc3339()],
        )
        .map_err(|e| persist_err("Failed to save session", e))?;
        debug!(session = %session.id, "Session persisted");
        Ok(())
    }

    fn load_sessions(&self) -> Result<Vec<Session>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT payload FROM sessions ORDER BY updated_at")
            .map_err(|e| persist_err("Failed to prepare session query", e))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| persist_err("Failed to query sessions", e))?;
        let mut sessions = Vec::new();
        for row in rows {
            let payload = row.map_err(|e| persist_err("Failed to read session row", e))?;
            sessions.push(serde_json::from_str(&payload)?);
        }
        Ok(sessions)
    }

    fn replace_locks(&self, entries: &[LockEntry]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| persist_err("Failed to start lock transaction", e))?;
        tx.execute("DELETE FROM locks", [])
            .map_err(|e| persist_err("Failed to clear locks", e))?;
        for entry in entries {
            let payload = serde_json::to_string(entry)?;
            tx.execute(
                "INSERT INTO locks (resource, payload) VALUES (?1, ?2)",
                params![entry.resource.to_string_lossy(), payload],
            )
            .map_err(|e| persist_err("Failed to save lock", e))?;
        }
        tx.commit()
            .map_err(|e| persist_err("Failed to commit locks", e))?;
        Ok(())
    }

    fn load_locks(&self) -> Result<Vec<LockEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT payload FROM locks")
            .map_err(|e| persist_err("Failed to prepare lock query", e))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| persist_err("Failed to query locks", e))?;
        let mut entries = Vec::new();
        for row in rows {
            let payload = row.map_err(|e| persist_err("Failed to read lock row", e))?;
            entries.push(serde_json::from_str(&payload)?);
        }
        Ok(entries)
    }

    fn replace_workspaces(&self, workspaces: &[Workspace]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| persist_err("Failed to start workspace transaction", e))?;
        tx.execute("DELETE FROM workspaces", [])
            .map_err(|e| persist_err("Failed to clear workspaces", e))?;
        for workspace in workspaces {
            let payload = serde_json::to_string(workspace)?;
            tx.execute(
                "INSERT INTO workspaces (id, agent_id, payload) VALUES (?1, ?2, ?3)",
                params![workspace.id, workspace.agent_id, payload],
            )
            .map_err(|e| persist_err("Failed to save workspace", e))?;
        }
        tx.commit()
            .map_err(|e| persist_err("Failed to commit workspaces", e))?;
        Ok(())
    }

    fn load_workspaces(&self) -> Result<Vec<Workspace>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT payload FROM workspaces")
            .map_err(|e| persist_err("Failed to prepare workspace query", e))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| persist_err("Failed to query workspaces", e))?;
        let mut workspaces = Vec::new();
        for row in rows {
            let payload = row.map_err(|e| persist_err("Failed to read workspace row", e))?;
            workspaces.push(serde_json::from_str(&payload)?);
        }
        Ok(workspaces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{AgentSpec, Strategy};

    #[test]
    fn test_session_round_trip() {
        let store = SqliteStore::in_memory().unwrap();
        let session = Session::new(
            "build feature X",
            Strategy::Sequential,
            vec![AgentSpec::new("architect", "design")],
        );
        store.save_session(&session).unwrap();
        // Update in place; re-saving must not duplicate.
        store.save_session(&session).unwrap();

        let loaded = store.load_sessions().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, session.id);
        assert_eq!(loaded[0].objective, "build feature X");
        assert_eq!(loaded[0].phases.len(), 1);
    }

    #[test]
    fn test_lock_table_replacement() {
        let store = SqliteStore::in_memory().unwrap();
        let registry = crate::lock::LockRegistry::new();
        registry.acquire(Path::new("a.rs"), "agent-1").unwrap();
        registry.acquire(Path::new("b.rs"), "agent-2").unwrap();

        store.replace_locks(&registry.entries()).unwrap();
        assert_eq!(store.load_locks().unwrap().len(), 2);

        registry.release_all("agent-1");
        store.replace_locks(&registry.entries()).unwrap();
        let remaining = store.load_locks().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].holder, "agent-2");
    }

    #[test]
    fn test_file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("concord.db");
        let session = Session::new("obj", Strategy::Parallel, vec![]);
        {
            let store = SqliteStore::open(&db_path).unwrap();
            store.save_session(&session).unwrap();
        }
        let store = SqliteStore::open(&db_path).unwrap();
        let loaded = store.load_sessions().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, session.id);
    }
}

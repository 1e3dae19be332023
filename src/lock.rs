//! Advisory file lock registry shared by all agents in a session.
//!
//! At most one holder per resource at any instant. Acquisition is
//! test-and-set through the concurrent map's entry API, so two racing
//! `acquire` calls on the same resource cannot both succeed while
//! unrelated resources proceed in parallel.

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConcordError, Result};

/// One held lock: resource path, holder, acquisition time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockEntry {
    pub resource: PathBuf,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockEntry {
    fn new(resource: PathBuf, holder: impl Into<String>) -> Self {
        Self {
            resource,
            holder: holder.into(),
            acquired_at: Utc::now(),
        }
    }
}

/// Lexically normalize a resource path so equivalent spellings collide.
///
/// Resolves `.` and `..` components without touching the filesystem;
/// leading `..` components are preserved as-is.
pub fn normalize_resource(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other),
        }
    }
    out
}

#[derive(Debug, Default)]
pub struct LockRegistry {
    entries: DashMap<PathBuf, LockEntry>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock on `resource` for `agent`.
    ///
    /// Succeeds if the resource is free or already held by the same agent
    /// (idempotent re-acquire). Held by anyone else: `LockHeld`.
    pub fn acquire(&self, resource: &Path, agent: &str) -> Result<LockEntry> {
        let resource = normalize_resource(resource);
        match self.entries.entry(resource.clone()) {
            Entry::Vacant(slot) => {
                let entry = LockEntry::new(resource.clone(), agent);
                slot.insert(entry.clone());
                debug!(resource = %resource.display(), agent = %agent, "Lock acquired");
                Ok(entry)
            }
            Entry::Occupied(slot) => {
                let existing = slot.get();
                if existing.holder == agent {
                    Ok(existing.clone())
                } else {
                    Err(ConcordError::LockHeld {
                        resource: resource.display().to_string(),
                        holder: existing.holder.clone(),
                    })
                }
            }
        }
    }

    /// Release the lock on `resource` held by `agent`.
    ///
    /// Releasing a resource that is not locked is a no-op success; a
    /// release attempt by a non-holder is a coordination bug and fails.
    pub fn release(&self, resource: &Path, agent: &str) -> Result<()> {
        let resource = normalize_resource(resource);
        match self.entries.entry(resource.clone()) {
            Entry::Vacant(_) => Ok(()),
            Entry::Occupied(slot) => {
                if slot.get().holder == agent {
                    slot.remove();
                    debug!(resource = %resource.display(), agent = %agent, "Lock released");
                    Ok(())
                } else {
                    Err(ConcordError::NotHolder {
                        resource: resource.display().to_string(),
                        agent: agent.to_string(),
                    })
                }
            }
        }
    }

    /// Current holder of `resource`, if any.
    pub fn query(&self, resource: &Path) -> Option<String> {
        let resource = normalize_resource(resource);
        self.entries.get(&resource).map(|e| e.holder.clone())
    }

    /// Drop every lock held by `agent`. Used on agent termination and
    /// crash recovery; never fails. Returns the number of entries cleared.
    pub fn release_all(&self, agent: &str) -> usize {
        // Counted inside the predicate: concurrent acquires on other
        // resources keep the map length moving, so a length diff is wrong.
        let mut cleared = 0;
        self.entries.retain(|_, entry| {
            let keep = entry.holder != agent;
            if !keep {
                cleared += 1;
            }
            keep
        });
        if cleared > 0 {
            debug!(agent = %agent, cleared, "Released all locks for agent");
        }
        cleared
    }

    /// All resources currently held by `agent`.
    pub fn holdings(&self, agent: &str) -> Vec<LockEntry> {
        self.entries
            .iter()
            .filter(|e| e.holder == agent)
            .map(|e| e.clone())
            .collect()
    }

    /// Snapshot of every live entry, for persistence and inspection.
    pub fn entries(&self) -> Vec<LockEntry> {
        self.entries.iter().map(|e| e.clone()).collect()
    }

    /// Restore a persisted entry without contention checks. Startup only.
    pub(crate) fn restore(&self, entry: LockEntry) {
        self.entries.insert(entry.resource.clone(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

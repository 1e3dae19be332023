//! Capability flags and the role registry.
//!
//! A capability is a named permission flag granted to an agent through its
//! role. The validation pipeline hard-denies any operation whose required
//! capability is missing from the requesting agent's granted set.

use std::collections::BTreeSet;
use std::fmt;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// May write and delete files inside its own workspace.
    WorkspaceBound,
    /// May read files anywhere in the shared codebase.
    ReadOnly,
    /// May spawn processes under the sandboxed executor.
    SandboxedExecution,
    /// May perform network calls through the isolated egress.
    NetworkIsolation,
    /// May run long operations under a scheduler-enforced time box.
    TimeBoxed,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkspaceBound => "workspace_bound",
            Self::ReadOnly => "read_only",
            Self::SandboxedExecution => "sandboxed_execution",
            Self::NetworkIsolation => "network_isolation",
            Self::TimeBoxed => "time_boxed",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The set of capabilities granted to one agent.
pub type CapabilitySet = BTreeSet<Capability>;

/// A named role an agent can be dispatched under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleSpec {
    pub name: String,
    pub description: String,
    pub capabilities: CapabilitySet,
}

impl RoleSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            capabilities: capabilities.into_iter().collect(),
        }
    }
}

/// Entry returned by [`RoleRegistry::list`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleListing {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub capabilities: Vec<Capability>,
}

/// Registry of dispatchable roles. Ships the predefined set and accepts
/// custom registrations; lookups are by role name.
#[derive(Debug)]
pub struct RoleRegistry {
    roles: DashMap<String, RoleSpec>,
    order: parking_lot::Mutex<Vec<String>>,
}

impl RoleRegistry {
    /// Registry containing only explicitly registered roles.
    pub fn empty() -> Self {
        Self {
            roles: DashMap::new(),
            order: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Registry pre-populated with the predefined roles.
    pub fn with_defaults() -> Self {
        use Capability::*;
        let registry = Self::empty();
        for role in [
            RoleSpec::new(
                "architect",
                "Designs structure and interfaces; reads broadly, writes design docs",
                [ReadOnly, WorkspaceBound],
            ),
            RoleSpec::new(
                "engineer",
                "Implements changes in an isolated workspace and runs builds",
                [ReadOnly, WorkspaceBound, SandboxedExecution, TimeBoxed],
            ),
            RoleSpec::new(
                "reviewer",
                "Reads and critiques changes; never edits",
                [ReadOnly],
            ),
            RoleSpec::new(
                "researcher",
                "Gathers external context through isolated network access",
                [ReadOnly, NetworkIsolation],
            ),
            RoleSpec::new(
                "qa",
                "Executes test suites against the workspace",
                [ReadOnly, SandboxedExecution, TimeBoxed],
            ),
        ] {
            registry.register(role);
        }
        registry
    }

    /// Register or replace a role.
    pub fn register(&self, role: RoleSpec) {
        let mut order = self.order.lock();
        if !order.iter().any(|n| n == &role.name) {
            order.push(role.name.clone());
        }
        self.roles.insert(role.name.clone(), role);
    }

    pub fn get(&self, name: &str) -> Option<RoleSpec> {
        self.roles.get(name).map(|r| r.clone())
    }

    /// Capabilities granted by `role`, empty set for unknown roles.
    pub fn capabilities_for(&self, role: &str) -> CapabilitySet {
        self.get(role).map(|r| r.capabilities).unwrap_or_default()
    }

    /// Read-only listing in registration order.
    pub fn list(&self, include_descriptions: bool) -> Vec<RoleListing> {
        let order = self.order.lock();
        order
            .iter()
            .filter_map(|name| self.roles.get(name))
            .map(|role| RoleListing {
                name: role.name.clone(),
                description: include_descriptions.then(|| role.description.clone()),
                capabilities: role.capabilities.iter().copied().collect(),
            })
            .collect()
    }
}

impl Default for RoleRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_roles_present() {
        let registry = RoleRegistry::with_defaults();
        for name in ["architect", "engineer", "reviewer", "researcher", "qa"] {
            assert!(registry.get(name).is_some(), "missing role {name}");
        }
    }

    #[test]
    fn test_reviewer_cannot_write() {
        let registry = RoleRegistry::with_defaults();
        let caps = registry.capabilities_for("reviewer");
        assert!(caps.contains(&Capability::ReadOnly));
        assert!(!caps.contains(&Capability::WorkspaceBound));
    }

    #[test]
    fn test_list_respects_description_flag() {
        let registry = RoleRegistry::with_defaults();
        assert!(registry.list(false).iter().all(|r| r.description.is_none()));
        assert!(registry.list(true).iter().all(|r| r.description.is_some()));
    }

    #[test]
    fn test_custom_role_registration() {
        let registry = RoleRegistry::with_defaults();
        registry.register(RoleSpec::new(
            "doc-writer",
            "Writes documentation",
            [Capability::ReadOnly, Capability::WorkspaceBound],
        ));
        let listing = registry.list(false);
        assert_eq!(listing.last().map(|r| r.name.as_str()), Some("doc-writer"));
    }

    #[test]
    fn test_unknown_role_has_no_capabilities() {
        let registry = RoleRegistry::with_defaults();
        assert!(registry.capabilities_for("nonexistent").is_empty());
    }
}

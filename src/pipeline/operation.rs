//! Operation descriptors and policy decisions.
//!
//! An operation descriptor is the coordination layer's view of one tool
//! call an agent is about to perform. The agent runtime is an opaque
//! actor; it describes the operation, the pipeline decides, the runtime
//! executes (or not) and reports back.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capability::Capability;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    FileRead,
    FileWrite,
    FileDelete,
    ProcessSpawn,
    NetworkCall,
    Other,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileRead => "file_read",
            Self::FileWrite => "file_write",
            Self::FileDelete => "file_delete",
            Self::ProcessSpawn => "process_spawn",
            Self::NetworkCall => "network_call",
            Self::Other => "other",
        }
    }

    /// Capability an agent must hold before this operation may execute.
    pub fn required_capability(&self) -> Option<Capability> {
        match self {
            Self::FileRead => Some(Capability::ReadOnly),
            Self::FileWrite | Self::FileDelete => Some(Capability::WorkspaceBound),
            Self::ProcessSpawn => Some(Capability::SandboxedExecution),
            Self::NetworkCall => Some(Capability::NetworkIsolation),
            Self::Other => None,
        }
    }

    /// Write-class operations take (and per policy later drop) file locks.
    pub fn mutates_files(&self) -> bool {
        matches!(self, Self::FileWrite | Self::FileDelete)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One operation an agent wants to perform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationDescriptor {
    pub kind: OperationKind,
    pub session_id: String,
    pub agent_id: String,
    /// Target resource, for file and network operations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<PathBuf>,
    /// Free-form detail (command line, URL, ...), audit only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl OperationDescriptor {
    pub fn new(
        kind: OperationKind,
        session_id: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            session_id: session_id.into(),
            agent_id: agent_id.into(),
            resource: None,
            detail: None,
        }
    }

    pub fn with_resource(mut self, resource: impl Into<PathBuf>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Warn,
    Deny,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Allow => "allow",
            Self::Warn => "warn",
            Self::Deny => "deny",
        };
        write!(f, "{}", s)
    }
}

/// The output of one check evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub verdict: Verdict,
    /// Name of the check that produced this decision.
    pub check: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PolicyDecision {
    pub fn allow(check: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Allow,
            check: check.into(),
            reason: None,
        }
    }

    pub fn warn(check: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Warn,
            check: check.into(),
            reason: Some(reason.into()),
        }
    }

    pub fn deny(check: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Deny,
            check: check.into(),
            reason: Some(reason.into()),
        }
    }
}

/// Aggregate result of the pre-operation stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationVerdict {
    pub verdict: Verdict,
    /// Decision that settled the verdict: the first deny, or the last
    /// evaluated decision otherwise.
    pub decision: PolicyDecision,
    /// Advisory warnings collected along the way, surfaced to the caller.
    pub warnings: Vec<PolicyDecision>,
}

impl OperationVerdict {
    pub fn allowed(&self) -> bool {
        !matches!(self.verdict, Verdict::Deny)
    }
}

/// One line of an agent's operation log, written by the post stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    pub kind: OperationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<PathBuf>,
    pub verdict: Verdict,
    pub check: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

impl OperationRecord {
    pub fn from_outcome(op: &OperationDescriptor, verdict: &OperationVerdict) -> Self {
        Self {
            kind: op.kind,
            resource: op.resource.clone(),
            verdict: verdict.verdict,
            check: verdict.decision.check.clone(),
            reason: verdict.decision.reason.clone(),
            at: Utc::now(),
        }
    }
}

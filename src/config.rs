use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::capability::RoleSpec;
use crate::error::{ConcordError, Result};

/// When write locks taken by the pipeline are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPolicy {
    /// The post stage releases the lock as soon as the write executed.
    #[default]
    ReleaseOnWrite,
    /// Locks stay until the agent terminates and `release_all` runs.
    HoldUntilTermination,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcordConfig {
    /// Directory agent worktrees are created under.
    pub workspaces_dir: PathBuf,
    /// Per-check budget in the pre-operation stage; exceeding it denies.
    pub check_timeout_ms: u64,
    /// Budget for one workspace allocation (worktree branching).
    pub allocate_timeout_ms: u64,
    pub lock_policy: LockPolicy,
    /// Ring bound for each agent's operation log.
    pub max_operation_log: usize,
    /// Roles registered on top of (or replacing) the predefined set.
    pub roles: Vec<RoleSpec>,
}

impl Default for ConcordConfig {
    fn default() -> Self {
        Self {
            workspaces_dir: PathBuf::from("worktrees"),
            check_timeout_ms: 2_000,
            allocate_timeout_ms: 30_000,
            lock_policy: LockPolicy::default(),
            max_operation_log: 512,
            roles: Vec::new(),
        }
    }
}

impl ConcordConfig {
    pub async fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join("concord.toml");
        let config = if config_path.exists() {
            let content = fs::read_to_string(&config_path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, dir: &Path) -> Result<()> {
        self.validate()?;
        let config_path = dir.join("concord.toml");
        let content =
            toml::to_string_pretty(self).map_err(|e| ConcordError::Config(e.to_string()))?;
        fs::write(&config_path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.check_timeout_ms == 0 {
            errors.push("check_timeout_ms must be greater than 0");
        }
        if self.allocate_timeout_ms == 0 {
            errors.push("allocate_timeout_ms must be greater than 0");
        }
        if self.max_operation_log == 0 {
            errors.push("max_operation_log must be greater than 0");
        }
        if self.roles.iter().any(|r| r.name.is_empty()) {
            errors.push("role names must be non-empty");
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConcordError::Config(errors.join("; ")))
        }
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }

    pub fn allocate_timeout(&self) -> Duration {
        Duration::from_millis(self.allocate_timeout_ms)
    }
}

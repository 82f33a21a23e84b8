//! Workspace entity: lifecycle state, persisted record, per-workspace lock.

mod lock;
mod manager;

pub use lock::WorkspaceLock;
pub use manager::{
    CopyDirection, CreateOptions, DestroyReport, ExecReport, PruneReport, RollbackReport,
    RunAgentOptions, RunAgentReport, WorkspaceManager,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::keys::KeyPair;
use crate::remote::SessionTarget;
use crate::revision::Checkpoint;
use crate::sandbox::ContainerHandle;

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkspaceState {
    Uncreated,
    Provisioning,
    Ready,
    Executing,
    Stopping,
    Destroyed,
    Error,
}

impl WorkspaceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uncreated => "uncreated",
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Stopping => "stopping",
            Self::Destroyed => "destroyed",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for WorkspaceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What is persisted in `workspace.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceRecord {
    pub id: String,
    pub name: String,
    pub project_path: PathBuf,
    pub state: WorkspaceState,
    pub backend: String,
    /// Instance-side user and project root.
    pub user: String,
    pub work_dir: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub container: Option<ContainerHandle>,
    #[serde(default)]
    pub keys: Option<KeyPair>,
    pub staging: PathBuf,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl WorkspaceRecord {
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let record = serde_json::from_str(&content)
            .with_context(|| format!("Corrupt workspace record {}", path.display()))?;
        Ok(Some(record))
    }

    /// Write to a sibling temp file and rename over the record.
    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.updated_at = now_secs();
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)
                .with_context(|| format!("Failed to write {}", tmp.display()))?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    pub fn next_seq(&self) -> u32 {
        self.checkpoints.last().map(|c| c.seq + 1).unwrap_or(1)
    }

    /// Where to reach the instance, if it has both an instance and a key.
    pub fn session_target(&self, connect_timeout: Duration) -> Option<SessionTarget> {
        let container = self.container.as_ref()?;
        let keys = self.keys.as_ref()?;
        Some(SessionTarget {
            host: container.host.clone(),
            port: container.port,
            user: self.user.clone(),
            private_key: keys.private_key.clone(),
            connect_timeout,
        })
    }
}

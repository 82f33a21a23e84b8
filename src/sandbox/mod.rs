//! Isolation backends that host a workspace's instance.

mod container;
pub mod dockerfile;

pub use container::DockerBackend;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{BackendKind, Config};
use crate::error::VcodingError;

/// Label carried by every instance this tool starts.
pub const MANAGED_LABEL: &str = "vcoding.managed";
/// Label holding the owning workspace id.
pub const WORKSPACE_LABEL: &str = "vcoding.workspace";

/// Environment file in the work user's home, relative to `$HOME`.
pub const ENV_FILE: &str = ".vcoding_env";

/// Port the in-instance SSH server listens on.
pub const SSH_PORT: u16 = 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Exited,
    Removed,
    Unknown,
}

impl ContainerStatus {
    pub fn parse(state: &str) -> Self {
        match state.trim() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "exited" | "dead" | "stopped" => Self::Exited,
            "removing" => Self::Removed,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_default();
        f.write_str(&s)
    }
}

/// A started instance. Invalid once the instance is removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
    pub image: String,
    pub host: String,
    pub port: u16,
    pub status: ContainerStatus,
}

/// Everything needed to turn a project into a bootable image.
#[derive(Debug, Clone)]
pub struct BuildSpec {
    pub workspace_id: String,
    /// User build file, used unmodified. `None` means start from `base_image`.
    pub dockerfile: Option<PathBuf>,
    pub base_image: String,
    pub user: String,
    pub work_dir: String,
    /// Shell snippets run as root after the setup fragment.
    pub installs: Vec<String>,
    /// Receives the complete raw build output.
    pub log_path: PathBuf,
}

impl BuildSpec {
    pub fn image_tag(&self) -> String {
        format!("vcoding-{}:latest", short(&self.workspace_id))
    }
}

#[derive(Debug, Clone)]
pub struct StartOptions {
    pub name: String,
    pub workspace_id: String,
    /// Forwarded into the instance. Values never appear on a command line.
    pub env: Vec<(String, String)>,
}

/// An instance found on the backend carrying the managed label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagedInstance {
    pub id: String,
    pub name: String,
    pub workspace_id: String,
    pub status: ContainerStatus,
}

impl ManagedInstance {
    /// Handle good enough for `stop` and `remove`; connection details are unknown.
    pub fn handle(&self) -> ContainerHandle {
        ContainerHandle {
            id: self.id.clone(),
            name: self.name.clone(),
            image: String::new(),
            host: String::new(),
            port: 0,
            status: self.status,
        }
    }
}

/// Lifecycle operations a backend must provide.
pub trait IsolationBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Build an image; returns its reference.
    fn build(&self, spec: &BuildSpec) -> Result<String>;

    /// Start a long-lived instance of `image` with the SSH port published.
    fn start(&self, image: &str, opts: &StartOptions) -> Result<ContainerHandle>;

    fn status(&self, handle: &ContainerHandle) -> Result<ContainerStatus>;

    /// Append `public_key` to `user`'s authorized keys, running as root.
    fn install_public_key(&self, handle: &ContainerHandle, user: &str, public_key: &str)
    -> Result<()>;

    /// Write `env` to the work user's environment file, sourced by every remote command.
    fn install_env(&self, handle: &ContainerHandle, user: &str, env: &[(String, String)])
    -> Result<()>;

    fn logs(&self, handle: &ContainerHandle, tail: usize) -> Result<String>;

    fn stop(&self, handle: &ContainerHandle) -> Result<()>;

    /// Remove the instance. Already-gone instances succeed.
    fn remove(&self, handle: &ContainerHandle) -> Result<()>;

    fn list_managed(&self) -> Result<Vec<ManagedInstance>>;
}

/// Pick the backend named by configuration.
pub fn select_backend(config: &Config) -> Result<Box<dyn IsolationBackend>> {
    match config.backend() {
        BackendKind::Container => Ok(Box::new(DockerBackend::new(config.runtime()))),
        BackendKind::Vm => Err(VcodingError::UnsupportedBackend(
            "vm (no hypervisor driver is available in this build)".to_string(),
        )
        .into()),
    }
}

/// Try `remove` up to `attempts` times. Returns the last error if every attempt failed.
pub fn remove_with_retry(
    backend: &dyn IsolationBackend,
    handle: &ContainerHandle,
    attempts: u32,
    pause: Duration,
) -> Result<()> {
    let mut last = None;
    for attempt in 1..=attempts.max(1) {
        match backend.remove(handle) {
            Ok(()) => {
                info!(instance = %handle.name, attempt, "sandbox:removed");
                return Ok(());
            }
            Err(err) => {
                warn!(instance = %handle.name, attempt, error = %err, "sandbox:remove failed");
                last = Some(err);
                if attempt < attempts {
                    thread::sleep(pause);
                }
            }
        }
    }
    Err(last.unwrap_or_else(|| anyhow::anyhow!("remove was never attempted")))
}

/// Instance name for a workspace: readable prefix plus id fragment.
pub fn instance_name(workspace_name: &str, workspace_id: &str) -> String {
    let slug = slug::slugify(workspace_name);
    let slug = if slug.is_empty() { "workspace".to_string() } else { slug };
    let slug: String = slug.chars().take(40).collect();
    let suffix = workspace_id.get(..8).unwrap_or(workspace_id);
    format!("vcoding-{}-{suffix}", slug.trim_end_matches('-'))
}

fn short(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

pub mod agent;
pub mod cp;
pub mod create;
pub mod destroy;
pub mod exec;
pub mod list;
pub mod logs;
pub mod prune;
pub mod revision;
pub mod sync;
pub mod tool;

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::cli::Target;
use vcoding::config::Config;
use vcoding::error::VcodingError;
use vcoding::paths;
use vcoding::remote::SshTransport;
use vcoding::sandbox::select_backend;
use vcoding::workspace::WorkspaceManager;

/// Manager wired to the configured backend and the OpenSSH transport.
pub fn manager() -> Result<WorkspaceManager> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    let config = Config::load(&cwd)?;
    let backend = select_backend(&config)?;
    Ok(WorkspaceManager::new(
        paths::data_dir()?,
        Arc::from(backend),
        Arc::new(SshTransport::new()),
    ))
}

/// The `-n` argument, or the workspace of the project containing the current directory.
pub fn resolve_target(target: &Target, manager: &WorkspaceManager) -> Result<String> {
    if let Some(name) = &target.name {
        return Ok(name.clone());
    }
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    match manager.find_for_directory(&cwd)? {
        Some(record) => Ok(record.id),
        None => Err(VcodingError::WorkspaceNotFound(format!(
            "no workspace for {} (use -n NAME)",
            cwd.display()
        ))
        .into()),
    }
}

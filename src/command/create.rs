use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::spinner;
use vcoding::workspace::CreateOptions;

pub fn run(path: Option<PathBuf>, name: Option<String>) -> Result<()> {
    let project = match path {
        Some(path) => path,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let manager = super::manager()?;
    let record = spinner::with_spinner("Provisioning workspace", || {
        manager.create(&project, &CreateOptions { name })
    })?;

    println!("Workspace '{}' is ready", record.name);
    println!("  id:       {}", record.id);
    println!("  project:  {}", record.project_path.display());
    if let Some(container) = &record.container {
        println!("  instance: {} ({}:{})", container.name, container.host, container.port);
    }
    if let Some(checkpoint) = record.checkpoints.last() {
        println!("  checkpoint #{} {}", checkpoint.seq, checkpoint.short_commit());
    }
    Ok(())
}

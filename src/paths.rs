//! On-disk layout of the application data directory.

use anyhow::{Context, Result, anyhow};
use sha2::{Digest, Sha256};
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

/// Overrides the data directory (default `~/.vcoding`).
pub const HOME_ENV: &str = "VCODING_HOME";

const TRASH_PREFIX: &str = ".trash_";

pub fn data_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(HOME_ENV)
        && !dir.is_empty()
    {
        return Ok(PathBuf::from(dir));
    }
    home::home_dir()
        .map(|h| h.join(".vcoding"))
        .ok_or_else(|| anyhow!("Could not determine home directory; set {HOME_ENV}"))
}

/// Absolute, symlink-resolved form of `project`.
pub fn normalize_project(project: &Path) -> Result<PathBuf> {
    let abs = if project.is_absolute() {
        project.to_path_buf()
    } else {
        std::env::current_dir()?.join(project)
    };
    fs::canonicalize(&abs)
        .with_context(|| format!("Project directory does not exist: {}", abs.display()))
}

/// Lowercase hex SHA-256 of the normalised project path.
pub fn workspace_id(project: &Path) -> String {
    let mut text = project.to_string_lossy().replace('\\', "/");
    while text.len() > 1 && text.ends_with('/') {
        text.pop();
    }
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

/// Files belonging to one workspace.
#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
}

impl WorkspacePaths {
    pub fn new(data_dir: &Path, id: &str) -> Self {
        let shard = id.get(..2).unwrap_or(id);
        Self {
            root: workspaces_dir(data_dir).join(shard).join(id),
        }
    }

    pub fn record(&self) -> PathBuf {
        self.root.join("workspace.json")
    }

    pub fn lock(&self) -> PathBuf {
        self.root.join("lock")
    }

    pub fn keys(&self) -> PathBuf {
        self.root.join("keys")
    }

    pub fn staging(&self) -> PathBuf {
        self.root.join("staging")
    }

    pub fn build_log(&self) -> PathBuf {
        self.root.join("build.log")
    }

    /// Create the workspace root readable only by the owner.
    pub fn create(&self) -> Result<()> {
        create_private_dir(&self.root)
    }

    /// Move the directory out of the listing, then delete it.
    pub fn remove(&self) -> Result<()> {
        if !self.root.exists() {
            return Ok(());
        }
        let name = self
            .root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let trash = self.root.with_file_name(format!("{TRASH_PREFIX}{name}"));
        if trash.exists() {
            fs::remove_dir_all(&trash).ok();
        }
        fs::rename(&self.root, &trash)
            .with_context(|| format!("Failed to retire {}", self.root.display()))?;
        fs::remove_dir_all(&trash)
            .with_context(|| format!("Failed to delete {}", trash.display()))?;
        Ok(())
    }
}

pub fn workspaces_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("workspaces")
}

/// Every persisted record file, skipping directories being deleted.
pub fn record_files(data_dir: &Path) -> Result<Vec<PathBuf>> {
    let pattern = workspaces_dir(data_dir).join("*").join("*").join("workspace.json");
    let pattern = pattern.to_string_lossy();
    let mut files = Vec::new();
    for entry in glob::glob(&pattern).context("Invalid workspace glob")? {
        let path = entry?;
        let retired = path
            .parent()
            .and_then(Path::file_name)
            .is_some_and(|n| n.to_string_lossy().starts_with(TRASH_PREFIX));
        if !retired {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// `mkdir -p` with mode 0700 on every directory created.
pub fn create_private_dir(path: &Path) -> Result<()> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
        .with_context(|| format!("Failed to create {}", path.display()))
}

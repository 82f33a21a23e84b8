//! Moving files between the host project and an instance through a private staging area.
//!
//! The project tree is read while staging outbound files and written only when
//! merging explicitly requested inbound paths. Nothing is ever mounted.

use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::VcodingError;
use crate::paths::create_private_dir;
use crate::remote::RemoteSession;
use crate::shell::shell_quote;

/// Request for the whole tree.
pub const WHOLE_TREE: &str = ".";

#[derive(Debug, Clone, Serialize)]
pub struct PushReport {
    /// Project-relative entries copied into the instance.
    pub pushed: Vec<String>,
    pub staged_files: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PullReport {
    /// Host paths written by the merge.
    pub written: Vec<PathBuf>,
}

pub struct SyncEngine {
    staging: PathBuf,
    excludes: Vec<glob::Pattern>,
}

impl SyncEngine {
    pub fn new(staging: impl Into<PathBuf>, exclude: &[String]) -> Result<Self> {
        let excludes = exclude
            .iter()
            .map(|p| glob::Pattern::new(p).with_context(|| format!("Invalid exclude pattern '{p}'")))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            staging: staging.into(),
            excludes,
        })
    }

    fn outbound(&self) -> PathBuf {
        self.staging.join("outbound")
    }

    fn inbound(&self) -> PathBuf {
        self.staging.join("inbound")
    }

    /// Excluded when the path or any of its components matches a pattern.
    fn is_excluded(&self, rel: &Path) -> bool {
        let whole = rel.to_string_lossy();
        self.excludes.iter().any(|pattern| {
            pattern.matches(&whole)
                || rel
                    .components()
                    .any(|c| pattern.matches(&c.as_os_str().to_string_lossy()))
        })
    }

    fn reset_area(dir: &Path) -> Result<()> {
        if dir.exists() {
            fs::remove_dir_all(dir)
                .with_context(|| format!("Failed to clear staging area {}", dir.display()))?;
        }
        create_private_dir(dir)
    }

    /// Copy `paths` (or the whole project) from `project` into the instance under `remote_root`.
    ///
    /// A whole-tree push first empties `remote_root` so the instance mirrors the project.
    pub fn push(
        &self,
        project: &Path,
        session: &RemoteSession,
        remote_root: &str,
        paths: Option<&[String]>,
    ) -> Result<PushReport> {
        let outbound = self.outbound();
        Self::reset_area(&outbound)?;

        let requested: Vec<PathBuf> = match paths {
            None => vec![PathBuf::from(WHOLE_TREE)],
            Some(list) => list
                .iter()
                .map(|p| validate_relative(p))
                .collect::<Result<Vec<_>>>()?,
        };
        let whole = requested.iter().any(|p| p == Path::new(WHOLE_TREE));
        if !whole && let Some(rel) = requested.iter().find(|rel| self.is_excluded(rel)) {
            bail!("Cannot push {}: path is excluded from sync", rel.display());
        }

        let root = fs::canonicalize(project)
            .with_context(|| format!("Project directory missing: {}", project.display()))?;
        let mut staged_files = 0;
        if whole {
            staged_files += self.stage_dir(&root, project, &outbound, Path::new(""))?;
        } else {
            for rel in &requested {
                let src = project.join(rel);
                let dst = outbound.join(rel);
                if let Some(parent) = dst.parent() {
                    create_private_dir(parent)?;
                }
                let meta = fs::symlink_metadata(&src)
                    .with_context(|| format!("Cannot push missing path {}", rel.display()))?;
                if meta.is_dir() {
                    create_private_dir(&dst)?;
                    staged_files += self.stage_dir(&root, &src, &dst, rel)?;
                } else if stage_entry(&root, &src, &dst, &meta)? {
                    staged_files += 1;
                } else {
                    bail!("Cannot push {}: symlink leaves the project", rel.display());
                }
            }
        }
        debug!(staged_files, outbound = %outbound.display(), "sync:staged");

        if whole {
            let clear = format!(
                "mkdir -p {root} && find {root} -mindepth 1 -maxdepth 1 -exec rm -rf {{}} +",
                root = shell_quote(remote_root)
            );
            check(session, &clear, "clear instance work dir")?;
        }

        let entries: Vec<PathBuf> = if whole {
            let mut names: Vec<PathBuf> = fs::read_dir(&outbound)?
                .filter_map(|e| e.ok())
                .map(|e| PathBuf::from(e.file_name()))
                .collect();
            names.sort();
            names
        } else {
            requested
        };

        let mut pushed = Vec::new();
        let mut failed = Vec::new();
        for rel in entries {
            let label = rel.display().to_string();
            match self.push_entry(session, &outbound, remote_root, &rel) {
                Ok(()) => pushed.push(label),
                Err(err) => {
                    warn!(path = %label, error = %format!("{err:#}"), "sync:push entry failed");
                    failed.push((label, format!("{err:#}")));
                }
            }
        }
        if !failed.is_empty() {
            return Err(VcodingError::Sync {
                succeeded: pushed,
                failed,
            }
            .into());
        }
        info!(entries = pushed.len(), staged_files, "sync:pushed");
        Ok(PushReport {
            pushed,
            staged_files,
        })
    }

    fn push_entry(
        &self,
        session: &RemoteSession,
        outbound: &Path,
        remote_root: &str,
        rel: &Path,
    ) -> Result<()> {
        let local = outbound.join(rel);
        let remote = remote_join(remote_root, rel);
        let parent = remote_parent(&remote);
        check(session, &format!("mkdir -p {}", shell_quote(&parent)), "create remote parent")?;
        if local.is_dir() {
            // scp -r places the directory inside the destination directory.
            session.copy_to(&local, &format!("{parent}/"), true)
        } else {
            session.copy_to(&local, &remote, false)
        }
    }

    /// Recursively copy `src` into `dst`, honouring excludes relative to the project root.
    fn stage_dir(&self, root: &Path, src: &Path, dst: &Path, rel: &Path) -> Result<usize> {
        let mut count = 0;
        let mut entries: Vec<_> = fs::read_dir(src)
            .with_context(|| format!("Failed to read {}", src.display()))?
            .collect::<std::io::Result<_>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let child_rel = rel.join(entry.file_name());
            if self.is_excluded(&child_rel) {
                continue;
            }
            let meta = fs::symlink_metadata(entry.path())?;
            let target = dst.join(entry.file_name());
            if meta.is_dir() {
                create_private_dir(&target)?;
                count += self.stage_dir(root, &entry.path(), &target, &child_rel)?;
            } else if stage_entry(root, &entry.path(), &target, &meta)? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Fetch `paths` from the instance and merge them into `project`.
    ///
    /// Only the requested paths are written on the host, existing host files
    /// outside them are untouched, and nothing is deleted.
    pub fn pull(
        &self,
        session: &RemoteSession,
        remote_root: &str,
        paths: &[String],
        project: &Path,
    ) -> Result<PullReport> {
        if paths.is_empty() {
            bail!("pull needs at least one path (use '.' for the whole tree)");
        }
        let mut requested = paths
            .iter()
            .map(|p| validate_relative(p))
            .collect::<Result<Vec<_>>>()?;
        if requested.iter().any(|p| p == Path::new(WHOLE_TREE)) {
            requested = self.remote_top_level(session, remote_root)?;
        }
        let requested = collapse_nested(requested);

        let inbound = self.inbound();
        Self::reset_area(&inbound)?;

        let mut fetched = Vec::new();
        let mut failed = Vec::new();
        for rel in requested {
            let label = rel.display().to_string();
            match self.fetch(session, remote_root, &rel, &inbound) {
                Ok(()) => fetched.push(rel),
                Err(err) => {
                    warn!(path = %label, error = %format!("{err:#}"), "sync:pull entry failed");
                    failed.push((label, format!("{err:#}")));
                }
            }
        }

        let mut written = Vec::new();
        let mut succeeded = Vec::new();
        for rel in fetched {
            let label = rel.display().to_string();
            match merge_into(&inbound.join(&rel), &project.join(&rel)) {
                Ok(()) => {
                    written.push(project.join(&rel));
                    succeeded.push(label);
                }
                Err(err) => failed.push((label, format!("{err:#}"))),
            }
        }

        if !failed.is_empty() {
            return Err(VcodingError::Sync { succeeded, failed }.into());
        }
        info!(paths = written.len(), "sync:pulled");
        Ok(PullReport { written })
    }

    fn fetch(&self, session: &RemoteSession, remote_root: &str, rel: &Path, inbound: &Path) -> Result<()> {
        if self.is_excluded(rel) {
            bail!("path is excluded from sync");
        }
        let remote = remote_join(remote_root, rel);
        let probe = format!(
            "if [ -d {p} ]; then echo dir; elif [ -e {p} ]; then echo file; else echo missing; fi",
            p = shell_quote(&remote)
        );
        let kind = check(session, &probe, "inspect remote path")?;
        let local = inbound.join(rel);
        if let Some(parent) = local.parent() {
            create_private_dir(parent)?;
        }
        match kind.trim() {
            "dir" => session.copy_from(&remote, &local, true),
            "file" => session.copy_from(&remote, &local, false),
            _ => bail!("no such path in instance: {remote}"),
        }
    }

    fn remote_top_level(&self, session: &RemoteSession, remote_root: &str) -> Result<Vec<PathBuf>> {
        let listing = check(
            session,
            &format!("ls -A1 {}", shell_quote(remote_root)),
            "list instance work dir",
        )?;
        Ok(listing
            .lines()
            .filter(|l| !l.is_empty())
            .map(PathBuf::from)
            .filter(|p| !self.is_excluded(p))
            .collect())
    }
}

/// Run a helper command remotely and return stdout, failing on non-zero exit.
fn check(session: &RemoteSession, command: &str, what: &str) -> Result<String> {
    let out = session.exec(command, None, None)?;
    if !out.success() {
        bail!("Failed to {what}: {}", out.stderr.trim());
    }
    Ok(out.stdout)
}

/// A project-relative path with no escape from the project root.
pub fn validate_relative(path: &str) -> Result<PathBuf> {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() || trimmed == WHOLE_TREE {
        return Ok(PathBuf::from(WHOLE_TREE));
    }
    let candidate = Path::new(trimmed);
    let mut clean = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => bail!("path must be relative to the project and stay inside it: {path}"),
        }
    }
    if clean.as_os_str().is_empty() {
        return Ok(PathBuf::from(WHOLE_TREE));
    }
    Ok(clean)
}

/// Drop paths already covered by a requested ancestor.
fn collapse_nested(mut paths: Vec<PathBuf>) -> Vec<PathBuf> {
    paths.sort();
    paths.dedup();
    let mut kept: Vec<PathBuf> = Vec::new();
    for path in paths {
        if !kept.iter().any(|k| path.starts_with(k)) {
            kept.push(path);
        }
    }
    kept
}

fn remote_join(root: &str, rel: &Path) -> String {
    let rel = rel.to_string_lossy();
    if rel.is_empty() || rel == WHOLE_TREE {
        root.to_string()
    } else {
        format!("{}/{}", root.trim_end_matches('/'), rel)
    }
}

fn remote_parent(remote: &str) -> String {
    match remote.rsplit_once('/') {
        Some(("", _)) => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
        None => ".".to_string(),
    }
}

/// Stage one non-directory entry. Symlinks are materialised only when they
/// resolve to a regular file inside `root`; anything else is skipped.
fn stage_entry(root: &Path, src: &Path, dst: &Path, meta: &fs::Metadata) -> Result<bool> {
    if meta.file_type().is_symlink() {
        let inside = fs::canonicalize(src)
            .ok()
            .filter(|target| target.starts_with(root) && target.is_file());
        let Some(target) = inside else {
            debug!(path = %src.display(), "sync:skipping symlink");
            return Ok(false);
        };
        fs::copy(&target, dst).with_context(|| format!("Failed to stage {}", src.display()))?;
        return Ok(true);
    }
    fs::copy(src, dst).with_context(|| format!("Failed to stage {}", src.display()))?;
    Ok(true)
}

/// Copy a staged file or directory over its host counterpart.
fn merge_into(staged: &Path, dest: &Path) -> Result<()> {
    let parent = dest
        .parent()
        .context("Destination has no parent directory")?;
    fs::create_dir_all(parent)?;
    if staged.is_dir() {
        if dest.exists() && !dest.is_dir() {
            bail!("{} is a file on the host but a directory in the instance", dest.display());
        }
        let options = fs_extra::dir::CopyOptions::new().overwrite(true);
        fs_extra::dir::copy(staged, parent, &options)
            .with_context(|| format!("Failed to merge {}", dest.display()))?;
    } else {
        if dest.is_dir() {
            bail!("{} is a directory on the host but a file in the instance", dest.display());
        }
        fs::copy(staged, dest).with_context(|| format!("Failed to write {}", dest.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{local_session, tree_snapshot};
    use tempfile::TempDir;

    fn engine(staging: &Path) -> SyncEngine {
        SyncEngine::new(staging, &[".git".to_string(), "*.secret".to_string()]).unwrap()
    }

    #[test]
    fn validate_rejects_escapes() {
        assert_eq!(validate_relative("src/./main.rs").unwrap(), PathBuf::from("src/main.rs"));
        assert_eq!(validate_relative("./").unwrap(), PathBuf::from("."));
        assert!(validate_relative("../etc/passwd").is_err());
        assert!(validate_relative("/etc/passwd").is_err());
        assert!(validate_relative("a/../../b").is_err());
    }

    #[test]
    fn nested_requests_collapse() {
        let kept = collapse_nested(vec!["src/a.rs".into(), "src".into(), "docs".into()]);
        assert_eq!(kept, vec![PathBuf::from("docs"), PathBuf::from("src")]);
    }

    #[test]
    fn push_then_pull_leaves_host_unchanged() {
        let project = TempDir::new().unwrap();
        fs::write(project.path().join("app.py"), "print(1)\n").unwrap();
        fs::create_dir_all(project.path().join("pkg/sub")).unwrap();
        fs::write(project.path().join("pkg/sub/mod.py"), "x = 1\n").unwrap();
        fs::write(project.path().join("token.secret"), "hunter2").unwrap();
        fs::create_dir(project.path().join(".git")).unwrap();
        fs::write(project.path().join(".git/HEAD"), "ref: refs/heads/main\n").unwrap();
        let before = tree_snapshot(project.path());

        let staging = TempDir::new().unwrap();
        let (remote, session) = local_session("/workspace");
        let sync = engine(staging.path());

        let report = sync.push(project.path(), &session, "/workspace", None).unwrap();
        assert_eq!(report.staged_files, 2);
        assert!(remote.path().join("app.py").exists());
        assert!(!remote.path().join("token.secret").exists());
        assert!(!remote.path().join(".git").exists());

        sync.pull(&session, "/workspace", &[".".to_string()], project.path())
            .unwrap();
        assert_eq!(tree_snapshot(project.path()), before);
    }

    #[test]
    fn pull_writes_only_requested_paths() {
        let project = TempDir::new().unwrap();
        fs::write(project.path().join("app.py"), "print(1)\n").unwrap();
        fs::write(project.path().join("keep.txt"), "host").unwrap();

        let staging = TempDir::new().unwrap();
        let (remote, session) = local_session("/workspace");
        let sync = engine(staging.path());
        sync.push(project.path(), &session, "/workspace", None).unwrap();

        fs::write(remote.path().join("app.py"), "print(1)\nprint(2)\n").unwrap();
        fs::write(remote.path().join("keep.txt"), "changed remotely").unwrap();
        fs::write(remote.path().join("extra.txt"), "new").unwrap();

        let report = sync
            .pull(&session, "/workspace", &["app.py".to_string()], project.path())
            .unwrap();
        assert_eq!(report.written, vec![project.path().join("app.py")]);
        assert_eq!(
            fs::read_to_string(project.path().join("app.py")).unwrap(),
            "print(1)\nprint(2)\n"
        );
        assert_eq!(fs::read_to_string(project.path().join("keep.txt")).unwrap(), "host");
        assert!(!project.path().join("extra.txt").exists());
    }

    #[test]
    fn partial_pull_reports_both_sides() {
        let project = TempDir::new().unwrap();
        fs::write(project.path().join("a.txt"), "a").unwrap();
        let staging = TempDir::new().unwrap();
        let (_remote, session) = local_session("/workspace");
        let sync = engine(staging.path());
        sync.push(project.path(), &session, "/workspace", None).unwrap();

        let err = sync
            .pull(
                &session,
                "/workspace",
                &["a.txt".to_string(), "missing.txt".to_string()],
                project.path(),
            )
            .unwrap_err();
        match crate::error::find_kind(&err) {
            Some(VcodingError::Sync { succeeded, failed }) => {
                assert_eq!(succeeded, &vec!["a.txt".to_string()]);
                assert_eq!(failed[0].0, "missing.txt");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn selective_push_creates_remote_parents() {
        let project = TempDir::new().unwrap();
        fs::create_dir_all(project.path().join("src/deep")).unwrap();
        fs::write(project.path().join("src/deep/x.rs"), "fn x() {}").unwrap();
        let staging = TempDir::new().unwrap();
        let (remote, session) = local_session("/workspace");
        let sync = engine(staging.path());

        sync.push(
            project.path(),
            &session,
            "/workspace",
            Some(&["src/deep/x.rs".to_string()]),
        )
        .unwrap();
        assert_eq!(
            fs::read_to_string(remote.path().join("src/deep/x.rs")).unwrap(),
            "fn x() {}"
        );
    }

    #[test]
    fn selective_push_refuses_excluded_paths() {
        let project = TempDir::new().unwrap();
        fs::write(project.path().join("app.py"), "print(1)\n").unwrap();
        fs::write(project.path().join("token.secret"), "hunter2").unwrap();
        fs::create_dir(project.path().join(".git")).unwrap();
        fs::write(project.path().join(".git/HEAD"), "ref: refs/heads/main\n").unwrap();
        let staging = TempDir::new().unwrap();
        let (remote, session) = local_session("/workspace");
        let sync = engine(staging.path());

        for request in [".git", ".git/HEAD", "token.secret"] {
            let err = sync
                .push(
                    project.path(),
                    &session,
                    "/workspace",
                    Some(&["app.py".to_string(), request.to_string()]),
                )
                .unwrap_err();
            assert!(format!("{err:#}").contains("excluded"), "{request}: {err:#}");
        }
        assert!(!remote.path().join("token.secret").exists());
        assert!(!remote.path().join(".git").exists());
        assert!(!remote.path().join("app.py").exists());
    }
}

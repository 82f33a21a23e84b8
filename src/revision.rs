//! Checkpoints of the host project as git commits.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::cmd::{Cmd, lossy};
use crate::config::GitConfig;
use crate::error::VcodingError;
use crate::workspace::now_secs;

const IDENTITY: [&str; 6] = [
    "-c",
    "user.name=vcoding",
    "-c",
    "user.email=vcoding@localhost",
    "-c",
    "commit.gpgsign=false",
];

/// Minimum length of a commit prefix accepted as a checkpoint id.
const MIN_PREFIX: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "kebab-case")]
pub enum CheckpointLabel {
    Initial,
    PreAgentRun,
    PostAgentRun,
    PreExec,
    PostExec,
    User(String),
    Rollback { to: u32 },
}

impl std::fmt::Display for CheckpointLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initial => f.write_str("initial"),
            Self::PreAgentRun => f.write_str("pre-agent-run"),
            Self::PostAgentRun => f.write_str("post-agent-run"),
            Self::PreExec => f.write_str("pre-exec"),
            Self::PostExec => f.write_str("post-exec"),
            Self::User(message) => f.write_str(message),
            Self::Rollback { to } => write!(f, "rollback to #{to}"),
        }
    }
}

/// One entry of a workspace's append-only history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub seq: u32,
    pub commit: String,
    pub label: CheckpointLabel,
    pub created_at: u64,
}

impl Checkpoint {
    pub fn short_commit(&self) -> &str {
        self.commit.get(..10).unwrap_or(&self.commit)
    }
}

/// Git repository co-located with the project.
pub struct RevisionController {
    repo: PathBuf,
    ref_prefix: String,
    workspace: String,
    git: GitConfig,
}

impl RevisionController {
    pub fn new(repo: impl Into<PathBuf>, workspace_id: &str, git: GitConfig) -> Self {
        let short = workspace_id.get(..12).unwrap_or(workspace_id).to_string();
        Self {
            repo: repo.into(),
            ref_prefix: format!("refs/vcoding/{short}"),
            workspace: short,
            git,
        }
    }

    fn git(&self) -> Cmd<'_> {
        Cmd::new("git").workdir(&self.repo)
    }

    fn git_commit(&self) -> Cmd<'_> {
        self.git().args(IDENTITY).arg("commit")
    }

    /// Initialise a repository if the project has none. Returns whether one was created.
    pub fn ensure_repository(&self) -> Result<bool> {
        if self.repo.join(".git").exists() {
            debug!(repo = %self.repo.display(), "revision:repository present");
            return Ok(false);
        }
        self.git()
            .args(["init", "-q"])
            .run()
            .with_context(|| format!("Failed to initialise git in {}", self.repo.display()))?;

        let gitignore = self.repo.join(".gitignore");
        if !gitignore.exists() {
            let mut body = self.git.ignore().join("\n");
            body.push('\n');
            fs::write(&gitignore, body).context("Failed to write .gitignore")?;
        }
        info!(repo = %self.repo.display(), "revision:initialised");
        Ok(true)
    }

    fn head(&self) -> Result<Option<String>> {
        let out = self
            .git()
            .args(["rev-parse", "-q", "--verify", "HEAD^{commit}"])
            .output()?;
        Ok(out
            .status
            .success()
            .then(|| lossy(&out.stdout).trim().to_string()))
    }

    fn conflicted_paths(&self) -> Result<Vec<String>> {
        let out = self
            .git()
            .args(["diff", "--name-only", "--diff-filter=U"])
            .run_and_capture_stdout()?;
        Ok(out.lines().map(str::to_string).collect())
    }

    pub fn is_dirty(&self) -> Result<bool> {
        let out = self
            .git()
            .args(["status", "--porcelain", "--untracked-files=all"])
            .run_and_capture_stdout()?;
        Ok(!out.is_empty())
    }

    /// Keep oversized untracked files out of every checkpoint.
    fn exclude_large_untracked(&self) -> Result<()> {
        let limit = self.git.max_file_size();
        let out = self
            .git()
            .args(["ls-files", "--others", "--exclude-standard", "-z"])
            .run()?;
        let large: Vec<String> = lossy(&out.stdout)
            .split('\0')
            .filter(|p| !p.is_empty())
            .filter(|p| {
                fs::metadata(self.repo.join(p))
                    .map(|m| m.is_file() && m.len() > limit)
                    .unwrap_or(false)
            })
            .map(|p| format!("/{p}"))
            .collect();
        if large.is_empty() {
            return Ok(());
        }

        let exclude = self.repo.join(".git").join("info").join("exclude");
        let existing = fs::read_to_string(&exclude).unwrap_or_default();
        let known: BTreeSet<&str> = existing.lines().collect();
        let mut text = existing.clone();
        for path in large.iter().filter(|p| !known.contains(p.as_str())) {
            warn!(path = %path, limit, "revision:excluding large file");
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(path);
            text.push('\n');
        }
        if let Some(parent) = exclude.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&exclude, text).context("Failed to update .git/info/exclude")
    }

    /// Stage everything and commit it as checkpoint `seq`.
    ///
    /// A clean tree reuses the current commit instead of adding an empty one.
    pub fn checkpoint(&self, label: CheckpointLabel, seq: u32) -> Result<Checkpoint> {
        let conflicts = self.conflicted_paths()?;
        if !conflicts.is_empty() {
            return Err(VcodingError::GitConflict {
                paths: conflicts,
                message: "unmerged paths must be resolved before a checkpoint".to_string(),
            }
            .into());
        }

        self.exclude_large_untracked()?;
        let head = self.head()?;
        let commit = if head.is_some() && !self.is_dirty()? {
            head.unwrap_or_default()
        } else {
            self.git().args(["add", "-A"]).run().context("git add failed")?;
            let message = format!("vcoding: {label}");
            let out = self
                .git_commit()
                .args(["-q", "--no-verify", "--allow-empty", "-m", message.as_str()])
                .output()?;
            if !out.status.success() {
                let stderr = lossy(&out.stderr);
                let stdout = lossy(&out.stdout);
                if stderr.contains("conflict") || stdout.contains("conflict") {
                    return Err(VcodingError::GitConflict {
                        paths: self.conflicted_paths().unwrap_or_default(),
                        message: stderr.trim().to_string(),
                    }
                    .into());
                }
                anyhow::bail!("git commit failed: {}{}", stdout.trim(), stderr.trim());
            }
            self.head()?
                .context("HEAD missing after commit")?
        };

        self.pin(seq, &commit)?;
        let checkpoint = Checkpoint {
            seq,
            commit,
            label,
            created_at: now_secs(),
        };
        info!(
            workspace = %self.workspace,
            seq,
            commit = checkpoint.short_commit(),
            label = %checkpoint.label,
            "revision:checkpoint"
        );
        Ok(checkpoint)
    }

    /// Keep the commit reachable whatever happens to branches.
    fn pin(&self, seq: u32, commit: &str) -> Result<()> {
        let name = format!("{}/{seq}", self.ref_prefix);
        self.git()
            .args(["update-ref", name.as_str(), commit])
            .run()
            .with_context(|| format!("Failed to pin checkpoint {seq}"))?;
        Ok(())
    }

    /// Find a checkpoint by `#seq`, unique commit prefix, or bare sequence number.
    ///
    /// A bare number is tried as a commit prefix first.
    pub fn resolve<'h>(&self, history: &'h [Checkpoint], id: &str) -> Result<&'h Checkpoint> {
        let unknown = || -> anyhow::Error {
            VcodingError::UnknownCheckpoint {
                workspace: self.workspace.clone(),
                checkpoint: id.to_string(),
            }
            .into()
        };
        let id = id.trim();
        let by_seq = |seq: &str| -> Result<&'h Checkpoint> {
            let seq: u32 = seq.parse().map_err(|_| unknown())?;
            history.iter().find(|c| c.seq == seq).ok_or_else(unknown)
        };
        if let Some(seq) = id.strip_prefix('#') {
            return by_seq(seq);
        }

        let numeric = !id.is_empty() && id.chars().all(|c| c.is_ascii_digit());
        if id.len() >= MIN_PREFIX && id.chars().all(|c| c.is_ascii_hexdigit()) {
            let prefix = id.to_lowercase();
            let matches: Vec<&Checkpoint> = history
                .iter()
                .filter(|c| c.commit.starts_with(&prefix))
                .collect();
            let distinct: BTreeSet<&str> = matches.iter().map(|c| c.commit.as_str()).collect();
            match (distinct.len(), matches.first()) {
                (1, Some(found)) => return Ok(*found),
                (0, _) if numeric => {}
                _ => return Err(unknown()),
            }
        }
        if numeric {
            return by_seq(id);
        }
        Err(unknown())
    }

    /// Make the working tree byte-identical to `target` and record that as a new checkpoint.
    ///
    /// Uncommitted changes and untracked, non-ignored files are discarded.
    /// Existing commits are left in place: the restored tree is committed on top.
    pub fn rollback(&self, target: &Checkpoint, seq: u32) -> Result<Checkpoint> {
        let previous = self.head()?;
        info!(workspace = %self.workspace, to = target.seq, commit = target.short_commit(), "revision:rollback");

        self.git()
            .args(["reset", "-q", "--hard", target.commit.as_str()])
            .run()
            .with_context(|| format!("Failed to reset to {}", target.commit))?;
        self.git()
            .args(["clean", "-q", "-fd"])
            .run()
            .context("Failed to remove untracked files")?;

        let commit = match previous {
            Some(prev) if prev != target.commit => {
                self.git()
                    .args(["reset", "-q", "--soft", prev.as_str()])
                    .run()
                    .context("Failed to restore branch tip")?;
                let message = format!("vcoding: rollback to #{} ({})", target.seq, target.short_commit());
                self.git_commit()
                    .args(["-q", "--no-verify", "--allow-empty", "-m", message.as_str()])
                    .run()
                    .context("Failed to record rollback")?;
                self.head()?.context("HEAD missing after rollback")?
            }
            _ => target.commit.clone(),
        };

        self.pin(seq, &commit)?;
        Ok(Checkpoint {
            seq,
            commit,
            label: CheckpointLabel::Rollback { to: target.seq },
            created_at: now_secs(),
        })
    }
}

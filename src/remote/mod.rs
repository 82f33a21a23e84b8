//! Authenticated command execution and file transfer into a running instance.

mod ssh;

pub use ssh::SshTransport;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{VcodingError, find_kind};
use crate::sandbox::ENV_FILE;
use crate::shell::remote_line;

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub private_key: PathBuf,
    pub connect_timeout: Duration,
}

impl SessionTarget {
    pub fn display(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The wire underneath a session.
pub trait Transport: Send + Sync {
    /// Run `line` through the remote login shell.
    fn exec(&self, target: &SessionTarget, line: &str, timeout: Duration) -> Result<ExecOutput>;

    fn copy_to(
        &self,
        target: &SessionTarget,
        local: &Path,
        remote: &str,
        recursive: bool,
        timeout: Duration,
    ) -> Result<()>;

    fn copy_from(
        &self,
        target: &SessionTarget,
        remote: &str,
        local: &Path,
        recursive: bool,
        timeout: Duration,
    ) -> Result<()>;

    /// Attach the terminal. Returns the remote exit status.
    fn interactive(&self, target: &SessionTarget, line: Option<&str>) -> Result<i32>;
}

/// Messages that mean the server is not listening yet.
pub fn is_startup_transient(message: &str) -> bool {
    let lower = message.to_lowercase();
    [
        "connection refused",
        "connection reset",
        "connection closed",
        "kex_exchange_identification",
        "banner exchange",
        "connection timed out",
    ]
    .iter()
    .any(|m| lower.contains(m))
}

/// A channel to one instance, bound to the workspace's key.
#[derive(Clone)]
pub struct RemoteSession {
    transport: Arc<dyn Transport>,
    target: SessionTarget,
    default_timeout: Duration,
}

impl RemoteSession {
    pub fn new(transport: Arc<dyn Transport>, target: SessionTarget, default_timeout: Duration) -> Self {
        Self {
            transport,
            target,
            default_timeout,
        }
    }

    pub fn target(&self) -> &SessionTarget {
        &self.target
    }

    fn line(workdir: Option<&str>, command: &str) -> String {
        let prelude = format!("[ -f \"$HOME/{ENV_FILE}\" ] && . \"$HOME/{ENV_FILE}\"");
        remote_line(Some(&prelude), workdir, command)
    }

    /// Run `command` in `workdir`, blocking until it exits or `timeout` elapses.
    pub fn exec(
        &self,
        command: &str,
        workdir: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        debug!(target = %self.target.display(), command, secs = timeout.as_secs(), "remote:exec");
        self.transport
            .exec(&self.target, &Self::line(workdir, command), timeout)
    }

    pub fn copy_to(&self, local: &Path, remote: &str, recursive: bool) -> Result<()> {
        self.transport
            .copy_to(&self.target, local, remote, recursive, self.default_timeout)
    }

    pub fn copy_from(&self, remote: &str, local: &Path, recursive: bool) -> Result<()> {
        self.transport
            .copy_from(&self.target, remote, local, recursive, self.default_timeout)
    }

    pub fn interactive(&self, command: Option<&str>, workdir: Option<&str>) -> Result<i32> {
        let line = command.map(|c| Self::line(workdir, c));
        let line = match (line, workdir) {
            (Some(line), _) => Some(line),
            (None, Some(dir)) => Some(Self::line(Some(dir), "exec \"${SHELL:-/bin/bash}\" -l")),
            (None, None) => None,
        };
        self.transport.interactive(&self.target, line.as_deref())
    }

    /// Poll until a trivial command succeeds, retrying only while the server is
    /// still coming up.
    pub fn wait_until_ready(&self, attempts: u32, interval: Duration) -> Result<()> {
        let probe = self.target.connect_timeout * 2;
        let mut last = String::new();
        for attempt in 1..=attempts.max(1) {
            match self.transport.exec(&self.target, "true", probe) {
                Ok(out) if out.success() => {
                    info!(target = %self.target.display(), attempt, "remote:ready");
                    return Ok(());
                }
                Ok(out) => {
                    last = out.stderr.trim().to_string();
                    if !is_startup_transient(&last) {
                        return Err(VcodingError::Connection {
                            target: self.target.display(),
                            message: last,
                        }
                        .into());
                    }
                }
                Err(err) => {
                    let transient = match find_kind(&err) {
                        Some(VcodingError::Connection { message, .. }) => {
                            is_startup_transient(message)
                        }
                        Some(VcodingError::Timeout { .. }) => true,
                        _ => false,
                    };
                    if !transient {
                        return Err(err);
                    }
                    last = format!("{err:#}");
                }
            }
            debug!(target = %self.target.display(), attempt, last = %last, "remote:not ready");
            // Linear backoff, capped at four intervals.
            thread::sleep(interval * attempt.min(4));
        }
        Err(VcodingError::Connection {
            target: self.target.display(),
            message: format!("not reachable after {attempts} attempts: {last}"),
        }
        .into())
    }
}

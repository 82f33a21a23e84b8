//! OpenSSH client transport (`ssh` and `scp` binaries).

use anyhow::{Context, Result};
use std::ffi::OsStr;
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use tracing::{debug, warn};

use super::{ExecOutput, SessionTarget, Transport};
use crate::cmd::{Cmd, lossy};
use crate::error::VcodingError;

/// Exit status the ssh client reserves for its own failures.
const SSH_CLIENT_FAILURE: i32 = 255;

#[derive(Debug, Default, Clone)]
pub struct SshTransport;

impl SshTransport {
    pub fn new() -> Self {
        Self
    }
}

/// Options shared by `ssh` and `scp`.
///
/// Host keys are not checked or recorded: every target is a freshly built
/// instance reachable only on loopback.
fn common_options(target: &SessionTarget) -> Vec<String> {
    let mut opts = vec!["-i".to_string(), target.private_key.display().to_string()];
    for opt in [
        "IdentitiesOnly=yes".to_string(),
        "BatchMode=yes".to_string(),
        "PasswordAuthentication=no".to_string(),
        "KbdInteractiveAuthentication=no".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "LogLevel=ERROR".to_string(),
        format!("ConnectTimeout={}", target.connect_timeout.as_secs().max(1)),
    ] {
        opts.push("-o".to_string());
        opts.push(opt);
    }
    opts
}

fn destination(target: &SessionTarget) -> String {
    format!("{}@{}", target.user, target.host)
}

fn connection_error(target: &SessionTarget, stderr: &str) -> anyhow::Error {
    VcodingError::Connection {
        target: target.display(),
        message: stderr.trim().to_string(),
    }
    .into()
}

/// Whether a 255 exit came from the client rather than the remote command.
fn is_client_failure(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    [
        "connection refused",
        "connection reset",
        "connection closed",
        "connection timed out",
        "kex_exchange_identification",
        "banner exchange",
        "permission denied",
        "could not resolve hostname",
        "no route to host",
        "host key verification failed",
    ]
    .iter()
    .any(|m| lower.contains(m))
}

impl Transport for SshTransport {
    fn exec(&self, target: &SessionTarget, line: &str, timeout: Duration) -> Result<ExecOutput> {
        let out = Cmd::new("ssh")
            .args(common_options(target))
            .arg("-p")
            .arg(target.port.to_string())
            .arg(destination(target))
            .arg(line)
            .timeout(timeout)
            .output()?;
        let exit_code = out.status.code().unwrap_or(-1);
        let stderr = lossy(&out.stderr);
        if exit_code == SSH_CLIENT_FAILURE && is_client_failure(&stderr) {
            debug!(target = %target.display(), stderr = %stderr.trim(), "ssh:connection failure");
            return Err(connection_error(target, &stderr));
        }
        Ok(ExecOutput {
            exit_code,
            stdout: lossy(&out.stdout),
            stderr,
        })
    }

    fn copy_to(
        &self,
        target: &SessionTarget,
        local: &Path,
        remote: &str,
        recursive: bool,
        timeout: Duration,
    ) -> Result<()> {
        let dest = format!("{}:{}", destination(target), remote);
        scp(target, recursive, local.as_os_str(), OsStr::new(&dest), timeout)
    }

    fn copy_from(
        &self,
        target: &SessionTarget,
        remote: &str,
        local: &Path,
        recursive: bool,
        timeout: Duration,
    ) -> Result<()> {
        let src = format!("{}:{}", destination(target), remote);
        scp(target, recursive, OsStr::new(&src), local.as_os_str(), timeout)
    }

    fn interactive(&self, target: &SessionTarget, line: Option<&str>) -> Result<i32> {
        let mut cmd = Command::new("ssh");
        cmd.arg("-t")
            .args(common_options(target))
            .arg("-p")
            .arg(target.port.to_string())
            .arg(destination(target));
        if let Some(line) = line {
            cmd.arg(line);
        }
        let status = cmd.status().context("Failed to launch ssh")?;
        Ok(status.code().unwrap_or(-1))
    }
}

fn scp(
    target: &SessionTarget,
    recursive: bool,
    from: &OsStr,
    to: &OsStr,
    timeout: Duration,
) -> Result<()> {
    let mut cmd = Cmd::new("scp")
        .args(common_options(target))
        .arg("-q")
        .arg("-p")
        .arg("-P")
        .arg(target.port.to_string());
    if recursive {
        cmd = cmd.arg("-r");
    }
    let out = cmd.arg(from).arg(to).timeout(timeout).output()?;
    if out.status.success() {
        return Ok(());
    }
    let stderr = lossy(&out.stderr);
    if is_client_failure(&stderr) && !stderr.to_lowercase().contains("no such file") {
        return Err(connection_error(target, &stderr));
    }
    warn!(
        from = %from.to_string_lossy(),
        to = %to.to_string_lossy(),
        stderr = %stderr.trim(),
        "scp:failed"
    );
    anyhow::bail!(
        "scp {} -> {} failed: {}",
        from.to_string_lossy(),
        to.to_string_lossy(),
        stderr.trim()
    )
}

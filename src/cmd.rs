use anyhow::{Context, Result, anyhow};
use std::ffi::{OsStr, OsString};
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};
use wait_timeout::ChildExt;

use crate::error::VcodingError;

/// A builder for executing host commands with unified error handling
pub struct Cmd<'a> {
    command: &'a str,
    args: Vec<OsString>,
    workdir: Option<&'a Path>,
    envs: Vec<(String, String)>,
    stdin: Option<Vec<u8>>,
    timeout: Option<Duration>,
}

impl<'a> Cmd<'a> {
    /// Create a new command builder
    pub fn new(command: &'a str) -> Self {
        Self {
            command,
            args: Vec::new(),
            workdir: None,
            envs: Vec::new(),
            stdin: None,
            timeout: None,
        }
    }

    /// Add a single argument
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Set the working directory for the command
    pub fn workdir(mut self, path: &'a Path) -> Self {
        self.workdir = Some(path);
        self
    }

    /// Set an environment variable on the child only. Values never appear in argv.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Bytes written to the child's stdin, which is then closed.
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Kill the child and fail with a timeout error if it runs longer than `limit`.
    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    fn display(&self) -> String {
        let mut line = self.command.to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }

    /// Execute the command and return its output regardless of exit status.
    /// Only spawn failures and timeouts are errors.
    pub fn output(self) -> Result<Output> {
        let shown = self.display();
        let workdir_display = self.workdir.map(|p| p.display().to_string());
        trace!(command = %shown, workdir = ?workdir_display, "cmd:output start");

        let mut cmd = Command::new(self.command);
        cmd.args(&self.args)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = self.workdir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to execute command: {shown}"))?;

        let writer = self.stdin.and_then(|input| {
            child.stdin.take().map(|mut pipe| {
                thread::spawn(move || {
                    // The child may exit before reading everything.
                    let _ = pipe.write_all(&input);
                })
            })
        });
        let stdout = pump(child.stdout.take());
        let stderr = pump(child.stderr.take());

        let status = match self.timeout {
            Some(limit) => match wait_with_limit(&mut child, limit)? {
                Some(status) => status,
                None => {
                    warn!(command = %shown, secs = limit.as_secs(), "cmd:output timeout");
                    let _ = child.kill();
                    let _ = child.wait();
                    // Grandchildren may still hold the pipes; leave the pumps detached.
                    drop((stdout, stderr));
                    return Err(VcodingError::Timeout {
                        command: shown,
                        after: limit,
                    }
                    .into());
                }
            },
            None => child
                .wait()
                .with_context(|| format!("Failed to wait for command: {shown}"))?,
        };

        if let Some(handle) = writer {
            let _ = handle.join();
        }
        let output = Output {
            status,
            stdout: join_pump(stdout),
            stderr: join_pump(stderr),
        };
        trace!(command = %shown, status = ?output.status.code(), "cmd:output done");
        Ok(output)
    }

    /// Execute the command and return the output
    /// Returns an error if the command fails (non-zero exit code)
    pub fn run(self) -> Result<Output> {
        let shown = self.display();
        let output = self.output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(
                command = %shown,
                status = ?output.status.code(),
                stderr = %stderr.trim(),
                "cmd:run failure"
            );
            return Err(anyhow!("Command failed: {}\n{}", shown, stderr.trim()));
        }
        Ok(output)
    }

    /// Execute the command and return stdout as a trimmed string
    pub fn run_and_capture_stdout(self) -> Result<String> {
        let output = self.run()?;
        Ok(String::from_utf8(output.stdout)?.trim().to_string())
    }
}

fn wait_with_limit(child: &mut Child, limit: Duration) -> Result<Option<ExitStatus>> {
    child
        .wait_timeout(limit)
        .context("Failed to wait for child process")
}

fn pump<R: Read + Send + 'static>(source: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    source.map(|mut reader| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = reader.read_to_end(&mut buf);
            buf
        })
    })
}

fn join_pump(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

/// Decode captured bytes as text, replacing invalid UTF-8.
pub fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::find_kind;

    #[test]
    fn output_reports_nonzero_without_error() {
        let out = Cmd::new("sh").args(["-c", "echo oops >&2; exit 3"]).output().unwrap();
        assert_eq!(out.status.code(), Some(3));
        assert_eq!(lossy(&out.stderr).trim(), "oops");
    }

    #[test]
    fn run_fails_with_stderr_in_message() {
        let err = Cmd::new("sh").args(["-c", "echo broken >&2; exit 1"]).run().unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn env_and_stdin_reach_child() {
        let out = Cmd::new("sh")
            .args(["-c", "printf '%s-' \"$GREETING\"; cat"])
            .env("GREETING", "hi")
            .stdin("there")
            .run_and_capture_stdout()
            .unwrap();
        assert_eq!(out, "hi-there");
    }

    #[test]
    fn timeout_kills_child() {
        let err = Cmd::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(200))
            .output()
            .unwrap_err();
        assert_eq!(find_kind(&err).map(|e| e.kind()), Some("timeout-error"));
    }
}

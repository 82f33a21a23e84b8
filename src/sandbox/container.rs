//! Docker/Podman CLI backend.

use std::fs;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use regex::Regex;
use tracing::{debug, info, warn};

use super::{
    BuildSpec, ContainerHandle, ContainerStatus, ENV_FILE, IsolationBackend, MANAGED_LABEL, ManagedInstance,
    SSH_PORT, StartOptions, WORKSPACE_LABEL, dockerfile,
};
use crate::cmd::{Cmd, lossy};
use crate::config::ContainerRuntime;
use crate::error::VcodingError;
use crate::shell::shell_quote;

/// Grace period before checking that a fresh instance stayed up.
const START_SETTLE: Duration = Duration::from_millis(750);
/// Log lines kept in error messages; the full log stays on disk.
const LOG_TAIL: usize = 60;

pub struct DockerBackend {
    runtime: ContainerRuntime,
}

impl DockerBackend {
    pub fn new(runtime: ContainerRuntime) -> Self {
        Self { runtime }
    }

    fn bin(&self) -> &'static str {
        self.runtime.binary()
    }

    fn inspect(&self, id: &str, format: &str) -> Result<Option<String>> {
        let out = Cmd::new(self.bin())
            .args(["inspect", "-f", format, id])
            .output()?;
        if out.status.success() {
            return Ok(Some(lossy(&out.stdout).trim().to_string()));
        }
        let stderr = lossy(&out.stderr);
        if is_missing(&stderr) {
            return Ok(None);
        }
        bail!("{} inspect {} failed: {}", self.bin(), id, stderr.trim())
    }

    fn published_port(&self, id: &str) -> Result<u16> {
        let out = Cmd::new(self.bin())
            .args(["port", id, format!("{SSH_PORT}/tcp").as_str()])
            .run_and_capture_stdout()?;
        parse_port(&out).with_context(|| format!("No published SSH port in: {out}"))
    }

    fn force_remove(&self, id: &str) -> Result<bool> {
        let out = Cmd::new(self.bin()).args(["rm", "-f", id]).output()?;
        if out.status.success() || is_missing(&lossy(&out.stderr)) {
            return Ok(true);
        }
        debug!(id, stderr = %lossy(&out.stderr).trim(), "container:rm failed");
        Ok(false)
    }
}

impl IsolationBackend for DockerBackend {
    fn name(&self) -> &'static str {
        self.bin()
    }

    fn build(&self, spec: &BuildSpec) -> Result<String> {
        let text = dockerfile::render(spec)?;
        let tag = spec.image_tag();

        let context_dir = tempfile::Builder::new()
            .prefix("vcoding-build-")
            .tempdir()
            .context("Failed to create temporary build directory")?;
        let file = context_dir.path().join("Dockerfile");
        fs::write(&file, &text).context("Failed to write build file")?;

        info!(runtime = self.bin(), image = %tag, "container:build start");
        let out = Cmd::new(self.bin())
            .arg("build")
            .args(["-t", tag.as_str(), "-f"])
            .arg(&file)
            .arg(context_dir.path())
            .output()?;

        let mut log = lossy(&out.stdout);
        log.push_str(&lossy(&out.stderr));
        fs::write(&spec.log_path, &log)
            .with_context(|| format!("Failed to write {}", spec.log_path.display()))?;

        if !out.status.success() {
            warn!(image = %tag, status = ?out.status.code(), log = %spec.log_path.display(), "container:build failed");
            return Err(VcodingError::Build {
                runtime: self.bin().to_string(),
                status: out.status.code().unwrap_or(-1),
                log: tail(&log, LOG_TAIL),
            }
            .into());
        }
        info!(image = %tag, "container:build done");
        Ok(tag)
    }

    fn start(&self, image: &str, opts: &StartOptions) -> Result<ContainerHandle> {
        // A previous run may have left an instance under the same name.
        self.force_remove(&opts.name)?;

        let mut cmd = Cmd::new(self.bin()).args([
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            opts.name.clone(),
            "--label".to_string(),
            format!("{MANAGED_LABEL}=true"),
            "--label".to_string(),
            format!("{WORKSPACE_LABEL}={}", opts.workspace_id),
            "-p".to_string(),
            format!("127.0.0.1::{SSH_PORT}"),
        ]);
        for (key, value) in &opts.env {
            cmd = cmd.arg("-e").arg(key).env(key, value);
        }
        let out = cmd.arg(image).output()?;
        if !out.status.success() {
            return Err(VcodingError::Start {
                instance: opts.name.clone(),
                reason: format!("{} run exited with {:?}", self.bin(), out.status.code()),
                logs: lossy(&out.stderr).trim().to_string(),
            }
            .into());
        }
        let id = lossy(&out.stdout).trim().to_string();
        info!(instance = %opts.name, id = %id, "container:started");

        thread::sleep(START_SETTLE);
        let running = self.inspect(&id, "{{.State.Running}}")?;
        if running.as_deref() != Some("true") {
            let handle = ContainerHandle {
                id: id.clone(),
                name: opts.name.clone(),
                image: image.to_string(),
                host: String::new(),
                port: 0,
                status: ContainerStatus::Exited,
            };
            let logs = self.logs(&handle, LOG_TAIL).unwrap_or_default();
            self.force_remove(&id).ok();
            return Err(VcodingError::Start {
                instance: opts.name.clone(),
                reason: "instance exited immediately".to_string(),
                logs,
            }
            .into());
        }

        let port = match self.published_port(&id) {
            Ok(port) => port,
            Err(err) => {
                self.force_remove(&id).ok();
                return Err(VcodingError::Start {
                    instance: opts.name.clone(),
                    reason: format!("{err:#}"),
                    logs: String::new(),
                }
                .into());
            }
        };

        Ok(ContainerHandle {
            id,
            name: opts.name.clone(),
            image: image.to_string(),
            host: "127.0.0.1".to_string(),
            port,
            status: ContainerStatus::Running,
        })
    }

    fn status(&self, handle: &ContainerHandle) -> Result<ContainerStatus> {
        Ok(match self.inspect(&handle.id, "{{.State.Status}}")? {
            Some(state) => ContainerStatus::parse(&state),
            None => ContainerStatus::Removed,
        })
    }

    fn install_public_key(
        &self,
        handle: &ContainerHandle,
        user: &str,
        public_key: &str,
    ) -> Result<()> {
        let user = shell_quote(user);
        let script = format!(
            "set -e; home=$(getent passwd {user} | cut -d: -f6); home=${{home:-/home/{user}}}; \
             mkdir -p \"$home/.ssh\"; cat >> \"$home/.ssh/authorized_keys\"; \
             chmod 700 \"$home/.ssh\"; chmod 600 \"$home/.ssh/authorized_keys\"; \
             chown -R {user}:{user} \"$home/.ssh\""
        );
        Cmd::new(self.bin())
            .args(["exec", "-i", "-u", "root", handle.id.as_str(), "sh", "-c", script.as_str()])
            .stdin(format!("{}\n", public_key.trim()))
            .timeout(Duration::from_secs(60))
            .run()
            .with_context(|| format!("Failed to install public key into {}", handle.name))?;
        debug!(instance = %handle.name, "container:key installed");
        Ok(())
    }

    fn install_env(
        &self,
        handle: &ContainerHandle,
        user: &str,
        env: &[(String, String)],
    ) -> Result<()> {
        let body: String = env
            .iter()
            .map(|(key, value)| format!("export {key}={}\n", shell_quote(value)))
            .collect();
        let user = shell_quote(user);
        let script = format!(
            "set -e; home=$(getent passwd {user} | cut -d: -f6); home=${{home:-/home/{user}}}; \
             umask 077; cat > \"$home/{ENV_FILE}\"; chown {user}:{user} \"$home/{ENV_FILE}\""
        );
        Cmd::new(self.bin())
            .args(["exec", "-i", "-u", "root", handle.id.as_str(), "sh", "-c", script.as_str()])
            .stdin(body)
            .timeout(Duration::from_secs(60))
            .run()
            .with_context(|| format!("Failed to write environment into {}", handle.name))?;
        debug!(instance = %handle.name, vars = env.len(), "container:env installed");
        Ok(())
    }

    fn logs(&self, handle: &ContainerHandle, tail_lines: usize) -> Result<String> {
        let out = Cmd::new(self.bin())
            .args(["logs", "--tail", tail_lines.to_string().as_str(), handle.id.as_str()])
            .output()?;
        let mut text = lossy(&out.stdout);
        text.push_str(&lossy(&out.stderr));
        Ok(text)
    }

    fn stop(&self, handle: &ContainerHandle) -> Result<()> {
        let out = Cmd::new(self.bin())
            .args(["stop", "-t", "5", handle.id.as_str()])
            .timeout(Duration::from_secs(30))
            .output()?;
        let stderr = lossy(&out.stderr);
        if !out.status.success() && !is_missing(&stderr) {
            bail!("{} stop {} failed: {}", self.bin(), handle.name, stderr.trim());
        }
        Ok(())
    }

    fn remove(&self, handle: &ContainerHandle) -> Result<()> {
        if self.force_remove(&handle.id)? {
            Ok(())
        } else {
            bail!("{} rm -f {} did not succeed", self.bin(), handle.name)
        }
    }

    fn list_managed(&self) -> Result<Vec<ManagedInstance>> {
        let format = format!(
            "{{{{.ID}}}}\t{{{{.Names}}}}\t{{{{.Label \"{WORKSPACE_LABEL}\"}}}}\t{{{{.State}}}}"
        );
        let out = Cmd::new(self.bin())
            .args([
                "ps",
                "-a",
                "--filter",
                format!("label={MANAGED_LABEL}=true").as_str(),
                "--format",
                format.as_str(),
            ])
            .run_and_capture_stdout()?;
        Ok(out.lines().filter_map(parse_ps_line).collect())
    }
}

fn is_missing(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such container") || lower.contains("no such object") || lower.contains("no container with")
}

/// First port in `docker port` output such as `127.0.0.1:49153` or `[::]:49153`.
fn parse_port(output: &str) -> Option<u16> {
    let re = Regex::new(r":(\d+)\s*$").ok()?;
    output
        .lines()
        .find_map(|line| re.captures(line.trim()))
        .and_then(|c| c[1].parse().ok())
}

fn parse_ps_line(line: &str) -> Option<ManagedInstance> {
    let mut parts = line.split('\t');
    Some(ManagedInstance {
        id: parts.next()?.to_string(),
        name: parts.next()?.to_string(),
        workspace_id: parts.next()?.to_string(),
        status: ContainerStatus::parse(parts.next().unwrap_or_default()),
    })
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

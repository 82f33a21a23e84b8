//! Test doubles: an in-memory isolation backend and a transport that runs on the host.

use anyhow::{Result, anyhow, bail};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use crate::cmd::{Cmd, lossy};
use crate::error::VcodingError;
use crate::remote::{ExecOutput, RemoteSession, SessionTarget, Transport};
use crate::sandbox::{
    BuildSpec, ContainerHandle, ContainerStatus, IsolationBackend, ManagedInstance, StartOptions,
};

pub fn git_available() -> bool {
    which::which("git").is_ok()
}

/// Every file under `dir` (including `.git`), keyed by relative path.
pub fn tree_snapshot(dir: &Path) -> BTreeMap<String, Vec<u8>> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<String, Vec<u8>>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                let rel = path.strip_prefix(root).unwrap().display().to_string();
                out.insert(rel, fs::read(&path).unwrap());
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(dir, dir, &mut out);
    out
}

#[derive(Default)]
struct FakeState {
    calls: Vec<String>,
    fail_build: bool,
    fail_start: bool,
    fail_install: bool,
    remove_failures: u32,
    remove_calls: u32,
    next_id: u32,
    instances: BTreeMap<String, (String, ContainerStatus)>,
}

/// Records calls and keeps instances in memory.
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<FakeState>,
}

impl FakeBackend {
    pub fn fail_build(&self) {
        self.state.lock().unwrap().fail_build = true;
    }

    pub fn fail_start(&self) {
        self.state.lock().unwrap().fail_start = true;
    }

    pub fn fail_install(&self) {
        self.state.lock().unwrap().fail_install = true;
    }

    pub fn fail_removes(&self, n: u32) {
        self.state.lock().unwrap().remove_failures = n;
    }

    pub fn remove_calls(&self) -> u32 {
        self.state.lock().unwrap().remove_calls
    }

    pub fn live_instances(&self) -> usize {
        self.state.lock().unwrap().instances.len()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }
}

impl IsolationBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn build(&self, spec: &BuildSpec) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("build".into());
        if state.fail_build {
            return Err(VcodingError::Build {
                runtime: "fake".into(),
                status: 1,
                log: "step 3/7: exit code 1".into(),
            }
            .into());
        }
        Ok(spec.image_tag())
    }

    fn start(&self, image: &str, opts: &StartOptions) -> Result<ContainerHandle> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("start".into());
        if state.fail_start {
            return Err(VcodingError::Start {
                instance: opts.name.clone(),
                reason: "instance exited immediately".into(),
                logs: String::new(),
            }
            .into());
        }
        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        state
            .instances
            .insert(id.clone(), (opts.workspace_id.clone(), ContainerStatus::Running));
        Ok(ContainerHandle {
            id,
            name: opts.name.clone(),
            image: image.to_string(),
            host: "127.0.0.1".into(),
            port: 2200 + state.next_id as u16,
            status: ContainerStatus::Running,
        })
    }

    fn status(&self, handle: &ContainerHandle) -> Result<ContainerStatus> {
        let state = self.state.lock().unwrap();
        Ok(state
            .instances
            .get(&handle.id)
            .map(|(_, s)| *s)
            .unwrap_or(ContainerStatus::Removed))
    }

    fn install_public_key(&self, handle: &ContainerHandle, _: &str, key: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("install_public_key".into());
        if state.fail_install {
            bail!("exec into {} failed", handle.name);
        }
        if !key.starts_with("ssh-ed25519 ") {
            bail!("unexpected key format");
        }
        Ok(())
    }

    fn install_env(&self, _: &ContainerHandle, _: &str, _: &[(String, String)]) -> Result<()> {
        self.state.lock().unwrap().calls.push("install_env".into());
        Ok(())
    }

    fn logs(&self, _: &ContainerHandle, _: usize) -> Result<String> {
        Ok(String::new())
    }

    fn stop(&self, handle: &ContainerHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("stop".into());
        if let Some(entry) = state.instances.get_mut(&handle.id) {
            entry.1 = ContainerStatus::Exited;
        }
        Ok(())
    }

    fn remove(&self, handle: &ContainerHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("remove".into());
        state.remove_calls += 1;
        if state.remove_failures > 0 {
            state.remove_failures -= 1;
            bail!("daemon busy");
        }
        state.instances.remove(&handle.id);
        Ok(())
    }

    fn list_managed(&self) -> Result<Vec<ManagedInstance>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .instances
            .iter()
            .map(|(id, (ws, status))| ManagedInstance {
                id: id.clone(),
                name: id.clone(),
                workspace_id: ws.clone(),
                status: *status,
            })
            .collect())
    }
}

/// Runs "remote" commands with bash on the host, with the instance work dir
/// mapped onto a temporary directory.
pub struct LocalTransport {
    remote_root: String,
    local_root: PathBuf,
}

impl LocalTransport {
    pub fn new(remote_root: &str, local_root: &Path) -> Self {
        Self {
            remote_root: remote_root.trim_end_matches('/').to_string(),
            local_root: local_root.to_path_buf(),
        }
    }

    fn map(&self, text: &str) -> String {
        text.replace(&self.remote_root, &self.local_root.display().to_string())
    }
}

impl Transport for LocalTransport {
    fn exec(&self, _: &SessionTarget, line: &str, timeout: Duration) -> Result<ExecOutput> {
        let out = Cmd::new("bash")
            .arg("-c")
            .arg(self.map(line))
            .timeout(timeout)
            .output()?;
        Ok(ExecOutput {
            exit_code: out.status.code().unwrap_or(-1),
            stdout: lossy(&out.stdout),
            stderr: lossy(&out.stderr),
        })
    }

    fn copy_to(&self, _: &SessionTarget, local: &Path, remote: &str, recursive: bool, _: Duration) -> Result<()> {
        let dest = PathBuf::from(self.map(remote));
        if recursive && local.is_dir() {
            let options = fs_extra::dir::CopyOptions::new().overwrite(true);
            fs_extra::dir::copy(local, &dest, &options)?;
        } else if dest.is_dir() {
            let name = local.file_name().ok_or_else(|| anyhow!("no file name"))?;
            fs::copy(local, dest.join(name))?;
        } else {
            fs::copy(local, &dest)?;
        }
        Ok(())
    }

    fn copy_from(&self, _: &SessionTarget, remote: &str, local: &Path, recursive: bool, _: Duration) -> Result<()> {
        let src = PathBuf::from(self.map(remote));
        if !src.exists() {
            bail!("scp: {remote}: No such file or directory");
        }
        if recursive && src.is_dir() {
            fs::create_dir_all(local)?;
            let options = fs_extra::dir::CopyOptions::new()
                .overwrite(true)
                .content_only(true);
            fs_extra::dir::copy(&src, local, &options)?;
        } else {
            fs::copy(&src, local)?;
        }
        Ok(())
    }

    fn interactive(&self, _: &SessionTarget, _: Option<&str>) -> Result<i32> {
        Ok(0)
    }
}

pub fn local_target() -> SessionTarget {
    SessionTarget {
        host: "127.0.0.1".into(),
        port: 22,
        user: "vcoding".into(),
        private_key: PathBuf::from("/nonexistent"),
        connect_timeout: Duration::from_secs(1),
    }
}

/// A session whose `remote_root` lives in the returned temp dir.
pub fn local_session(remote_root: &str) -> (TempDir, RemoteSession) {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(LocalTransport::new(remote_root, dir.path()));
    let session = RemoteSession::new(transport, local_target(), Duration::from_secs(30));
    (dir, session)
}

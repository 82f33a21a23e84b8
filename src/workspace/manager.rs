use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{WorkspaceLock, WorkspaceRecord, WorkspaceState, now_secs};
use crate::agent::{AgentContext, AgentOutput, select_agent};
use crate::cmd::{Cmd, lossy};
use crate::config::{self, Config};
use crate::error::{VcodingError, find_kind};
use crate::keys::KeyStore;
use crate::paths::{self, WorkspacePaths, create_private_dir};
use crate::remote::{ExecOutput, RemoteSession, SessionTarget, Transport};
use crate::revision::{Checkpoint, CheckpointLabel, RevisionController};
use crate::sandbox::{
    BuildSpec, ContainerStatus, IsolationBackend, ManagedInstance, StartOptions, dockerfile,
    instance_name, remove_with_retry,
};
use crate::shell::shell_quote;
use crate::sync::{PullReport, PushReport, SyncEngine};

const REMOVE_ATTEMPTS: u32 = 3;
const REMOVE_PAUSE: Duration = Duration::from_millis(500);

/// Token variables the `gh auth token` fallback fills in.
const GITHUB_TOKEN_VARS: &[&str] = &["COPILOT_GITHUB_TOKEN", "GH_TOKEN", "GITHUB_TOKEN"];

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Display name. Default: the project directory's name
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RunAgentOptions {
    pub model: Option<String>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecReport {
    pub workspace: String,
    pub command: String,
    #[serde(flatten)]
    pub output: ExecOutput,
    pub pre_checkpoint: u32,
    pub post_checkpoint: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunAgentReport {
    pub workspace: String,
    #[serde(flatten)]
    pub output: AgentOutput,
    pub pre_checkpoint: u32,
    pub post_checkpoint: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackReport {
    pub workspace: String,
    pub target: Checkpoint,
    pub checkpoint: Checkpoint,
    /// Entries pushed so the instance matches the restored tree.
    pub resynced: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DestroyReport {
    pub workspace: String,
    pub removed_instance: Option<String>,
    /// Set when the backend kept refusing to remove the instance.
    pub orphaned_instance: Option<String>,
    pub already_destroyed: bool,
}

impl DestroyReport {
    fn nothing_to_do(workspace: &str) -> Self {
        Self {
            workspace: workspace.to_string(),
            removed_instance: None,
            orphaned_instance: None,
            already_destroyed: true,
        }
    }
}

/// Managed instances that no workspace record claims any more.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PruneReport {
    pub removed: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    ToWorkspace,
    FromWorkspace,
}

/// Drives every workspace through its lifecycle.
///
/// Mutating operations on one workspace are serialised by its lock file;
/// different workspaces never contend.
pub struct WorkspaceManager {
    data_dir: PathBuf,
    backend: Arc<dyn IsolationBackend>,
    transport: Arc<dyn Transport>,
    keys: KeyStore,
    global_config: Option<PathBuf>,
}

/// State shared by the steps of one locked operation.
struct Operation {
    record: WorkspaceRecord,
    config: Config,
    paths: WorkspacePaths,
    transport: Arc<dyn Transport>,
}

impl Operation {
    fn session(&self) -> Result<RemoteSession> {
        session_for(&self.record, &self.config, self.transport.clone())
    }

    fn revision(&self) -> RevisionController {
        RevisionController::new(
            &self.record.project_path,
            &self.record.id,
            self.config.git.clone(),
        )
    }

    fn sync(&self) -> Result<SyncEngine> {
        SyncEngine::new(self.paths.staging(), &self.config.sync.exclude())
    }

    /// Take a checkpoint and persist it before doing anything else.
    fn checkpoint(&mut self, label: CheckpointLabel) -> Result<Checkpoint> {
        let seq = self.record.next_seq();
        let checkpoint = self.revision().checkpoint(label, seq)?;
        self.record_checkpoint(checkpoint.clone())?;
        Ok(checkpoint)
    }

    fn record_checkpoint(&mut self, checkpoint: Checkpoint) -> Result<()> {
        self.record.checkpoints.push(checkpoint);
        self.record.save(&self.paths.record())
    }
}

fn session_for(
    record: &WorkspaceRecord,
    config: &Config,
    transport: Arc<dyn Transport>,
) -> Result<RemoteSession> {
    let target = record
        .session_target(config.ssh.connect_timeout())
        .ok_or_else(|| VcodingError::InvalidState {
            workspace: record.name.clone(),
            state: record.state.to_string(),
            operation: "open a session (no running instance)".to_string(),
        })?;
    Ok(RemoteSession::new(
        transport,
        target,
        config.ssh.command_timeout(),
    ))
}

impl WorkspaceManager {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        backend: Arc<dyn IsolationBackend>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let data_dir = data_dir.into();
        Self {
            keys: KeyStore::new(&data_dir),
            data_dir,
            backend,
            transport,
            global_config: config::global_config_path(),
        }
    }

    /// Replace the global configuration file (`None` uses built-in defaults only).
    pub fn with_global_config(mut self, path: Option<PathBuf>) -> Self {
        self.global_config = path;
        self
    }

    fn config_for(&self, project: &Path) -> Result<Config> {
        Config::load_layers(self.global_config.as_deref(), project)
    }

    fn paths(&self, id: &str) -> WorkspacePaths {
        WorkspacePaths::new(&self.data_dir, id)
    }

    /// Workspace id for a project path, name, or id prefix.
    fn resolve_id(&self, target: &str) -> Result<String> {
        let as_path = Path::new(target);
        if as_path.is_dir() {
            let project = paths::normalize_project(as_path)?;
            let id = paths::workspace_id(&project);
            if self.paths(&id).record().exists() {
                return Ok(id);
            }
        }

        let records = self.load_all()?;
        let matches: Vec<&WorkspaceRecord> = records
            .iter()
            .filter(|r| r.name == target || (target.len() >= 8 && r.id.starts_with(target)))
            .collect();
        match matches.as_slice() {
            [one] => Ok(one.id.clone()),
            [] => Err(VcodingError::WorkspaceNotFound(target.to_string()).into()),
            many => bail!(
                "'{target}' matches {} workspaces; use the project path or id instead",
                many.len()
            ),
        }
    }

    /// Workspace of the project directory containing `dir`, if any.
    pub fn find_for_directory(&self, dir: &Path) -> Result<Option<WorkspaceRecord>> {
        let mut current = paths::normalize_project(dir)?;
        loop {
            let id = paths::workspace_id(&current);
            if let Some(record) = WorkspaceRecord::load(&self.paths(&id).record())? {
                return Ok(Some(record));
            }
            if !current.pop() {
                return Ok(None);
            }
        }
    }

    fn load_all(&self) -> Result<Vec<WorkspaceRecord>> {
        let mut records = Vec::new();
        for file in paths::record_files(&self.data_dir)? {
            match WorkspaceRecord::load(&file) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(err) => warn!(file = %file.display(), error = %format!("{err:#}"), "manager:skipping record"),
            }
        }
        Ok(records)
    }

    pub fn get(&self, target: &str) -> Result<WorkspaceRecord> {
        let id = self.resolve_id(target)?;
        WorkspaceRecord::load(&self.paths(&id).record())?
            .ok_or_else(|| VcodingError::WorkspaceNotFound(target.to_string()).into())
    }

    /// All workspaces, with each instance's status refreshed from the backend.
    pub fn list(&self, running_only: bool) -> Result<Vec<WorkspaceRecord>> {
        let mut records = self.load_all()?;
        for record in &mut records {
            if let Some(handle) = record.container.as_mut() {
                handle.status = match self.backend.status(handle) {
                    Ok(status) => status,
                    Err(err) => {
                        debug!(instance = %handle.name, error = %err, "manager:status unavailable");
                        ContainerStatus::Unknown
                    }
                };
            }
        }
        if running_only {
            records.retain(|r| {
                r.container
                    .as_ref()
                    .is_some_and(|c| c.status == ContainerStatus::Running)
            });
        }
        records.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    pub fn history(&self, target: &str) -> Result<Vec<Checkpoint>> {
        Ok(self.get(target)?.checkpoints)
    }

    pub fn session_target(&self, target: &str) -> Result<SessionTarget> {
        let record = self.get(target)?;
        let config = self.config_for(&record.project_path)?;
        Ok(session_for(&record, &config, self.transport.clone())?
            .target()
            .clone())
    }

    /// Attach the terminal to the instance, holding the workspace lock until it detaches.
    ///
    /// Fails instead of waiting when another operation holds the lock.
    pub fn interactive(&self, target: &str, command: Option<&str>) -> Result<i32> {
        let id = self.resolve_id(target)?;
        let paths = self.paths(&id);
        let Some(_lock) = WorkspaceLock::try_acquire(&paths.lock())? else {
            let record = self.get(&id)?;
            warn!(workspace = %record.name, "manager:shell refused, workspace busy");
            return Err(invalid_state(&record, "open a shell while another operation is running"));
        };
        let record = WorkspaceRecord::load(&paths.record())?
            .ok_or_else(|| VcodingError::WorkspaceNotFound(target.to_string()))?;
        // Executing without the lock held means its owner died.
        if record.state != WorkspaceState::Ready && record.state != WorkspaceState::Executing {
            return Err(invalid_state(&record, "open a shell"));
        }
        let config = self.config_for(&record.project_path)?;
        let session = session_for(&record, &config, self.transport.clone())?;
        session.interactive(command, Some(config.work_dir()))
    }

    /// Recent output of the workspace's instance.
    pub fn logs(&self, target: &str, tail: usize) -> Result<String> {
        let record = self.get(target)?;
        let handle = record
            .container
            .as_ref()
            .ok_or_else(|| invalid_state(&record, "read logs (no instance)"))?;
        self.backend.logs(handle, tail)
    }

    /// Managed instances whose workspace record no longer exists.
    pub fn orphans(&self) -> Result<Vec<ManagedInstance>> {
        let known: HashSet<String> = self.load_all()?.into_iter().map(|r| r.id).collect();
        let mut orphans = self.backend.list_managed()?;
        orphans.retain(|instance| !known.contains(&instance.workspace_id));
        Ok(orphans)
    }

    /// Remove instances left behind by workspaces that no longer exist.
    pub fn prune(&self) -> Result<PruneReport> {
        let mut report = PruneReport::default();
        for instance in self.orphans()? {
            info!(instance = %instance.name, workspace_id = %instance.workspace_id, "manager:pruning");
            match remove_with_retry(
                self.backend.as_ref(),
                &instance.handle(),
                REMOVE_ATTEMPTS,
                REMOVE_PAUSE,
            ) {
                Ok(()) => report.removed.push(instance.name),
                Err(err) => {
                    error!(instance = %instance.name, error = %format!("{err:#}"), "manager:prune failed");
                    report.failed.push(instance.name);
                }
            }
        }
        Ok(report)
    }

    /// Provision a workspace for `project`, replacing any previous one.
    ///
    /// On failure everything allocated here is released again and the record
    /// is left in the error state with neither an instance nor a key.
    pub fn create(&self, project: &Path, opts: &CreateOptions) -> Result<WorkspaceRecord> {
        let project = paths::normalize_project(project)?;
        if !project.is_dir() {
            bail!("Project path is not a directory: {}", project.display());
        }
        let id = paths::workspace_id(&project);
        let config = self.config_for(&project)?;
        let paths = self.paths(&id);
        paths.create()?;
        let _lock = WorkspaceLock::acquire(&paths.lock())?;

        let mut history = Vec::new();
        if let Some(mut old) = WorkspaceRecord::load(&paths.record())? {
            info!(workspace = %old.name, state = %old.state, "manager:recreate");
            if let Some(orphan) = self.teardown(&mut old, &paths) {
                warn!(instance = %orphan, "manager:previous instance left behind");
            }
            history = old.checkpoints;
        }

        let name = opts.name.clone().unwrap_or_else(|| {
            project
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "workspace".to_string())
        });
        let now = now_secs();
        let mut record = WorkspaceRecord {
            id: id.clone(),
            name,
            project_path: project.clone(),
            state: WorkspaceState::Provisioning,
            backend: self.backend.name().to_string(),
            user: config.user().to_string(),
            work_dir: config.work_dir().to_string(),
            image: None,
            container: None,
            keys: None,
            staging: paths.staging(),
            checkpoints: history,
            created_at: now,
            updated_at: now,
            last_error: None,
        };
        record.save(&paths.record())?;
        info!(workspace = %record.name, id = %id, project = %project.display(), "manager:create start");

        match self.provision(&mut record, &config, &paths) {
            Ok(()) => {
                record.state = WorkspaceState::Ready;
                record.save(&paths.record())?;
                info!(workspace = %record.name, "manager:create done");
                Ok(record)
            }
            Err(err) => {
                error!(workspace = %record.name, error = %format!("{err:#}"), "manager:create failed");
                let orphan = self.teardown(&mut record, &paths);
                record.state = WorkspaceState::Error;
                record.last_error = Some(format!("{err:#}"));
                if let Err(save_err) = record.save(&paths.record()) {
                    warn!(error = %save_err, "manager:could not record failure");
                }
                match orphan {
                    Some(instance) => Err(err.context(format!(
                        "instance {instance} could not be removed and must be cleaned up by hand"
                    ))),
                    None => Err(err),
                }
            }
        }
    }

    fn provision(
        &self,
        record: &mut WorkspaceRecord,
        config: &Config,
        paths: &WorkspacePaths,
    ) -> Result<()> {
        let project = record.project_path.clone();
        let revision = RevisionController::new(&project, &record.id, config.git.clone());
        if config.git.auto_init() {
            revision.ensure_repository()?;
        } else if !project.join(".git").exists() {
            bail!(
                "{} is not a git repository and git.auto_init is disabled",
                project.display()
            );
        }
        let initial = revision.checkpoint(CheckpointLabel::Initial, record.next_seq())?;
        record.checkpoints.push(initial);
        record.save(&paths.record())?;

        let dockerfile = project.join(config.dockerfile());
        let spec = BuildSpec {
            workspace_id: record.id.clone(),
            dockerfile: dockerfile.is_file().then_some(dockerfile),
            base_image: config.base_image().to_string(),
            user: config.user().to_string(),
            work_dir: config.work_dir().to_string(),
            installs: agent_installs(config),
            log_path: paths.build_log(),
        };
        let image = self.backend.build(&spec)?;
        record.image = Some(image.clone());

        let pair = self.keys.generate(&record.id)?;
        record.keys = Some(pair.clone());
        record.save(&paths.record())?;

        let env = collect_env(config);
        let handle = self.backend.start(
            &image,
            &StartOptions {
                name: instance_name(&record.name, &record.id),
                workspace_id: record.id.clone(),
                env: env.clone(),
            },
        )?;
        record.container = Some(handle.clone());
        record.save(&paths.record())?;

        self.backend
            .install_public_key(&handle, config.user(), &pair.public_key)
            .context("Failed to install the workspace key")?;
        self.backend
            .install_env(&handle, config.user(), &env)
            .context("Failed to install the instance environment")?;

        let session = session_for(record, config, self.transport.clone())?;
        session.wait_until_ready(config.ssh.startup_retries(), config.ssh.startup_interval())?;

        create_private_dir(&paths.staging())?;
        let sync = SyncEngine::new(paths.staging(), &config.sync.exclude())?;
        sync.push(&project, &session, config.work_dir(), None)?;
        Ok(())
    }

    /// Release the instance, the key pair and the staging area.
    ///
    /// Returns the instance name when the backend would not remove it.
    fn teardown(&self, record: &mut WorkspaceRecord, paths: &WorkspacePaths) -> Option<String> {
        let mut orphan = None;
        if let Some(handle) = record.container.take()
            && let Err(err) = remove_with_retry(
                self.backend.as_ref(),
                &handle,
                REMOVE_ATTEMPTS,
                REMOVE_PAUSE,
            )
        {
            warn!(instance = %handle.name, error = %format!("{err:#}"), "manager:instance orphaned");
            orphan = Some(handle.name);
        }
        if let Err(err) = self.keys.destroy(&record.id) {
            warn!(workspace = %record.name, error = %format!("{err:#}"), "manager:key erase failed");
        }
        record.keys = None;
        let staging = paths.staging();
        if staging.exists()
            && let Err(err) = fs::remove_dir_all(&staging)
        {
            warn!(dir = %staging.display(), error = %err, "manager:staging not removed");
        }
        orphan
    }

    /// Tear the workspace down. Destroying a missing workspace is a no-op.
    pub fn destroy(&self, target: &str) -> Result<DestroyReport> {
        let id = match self.resolve_id(target) {
            Ok(id) => id,
            Err(err) if matches!(find_kind(&err), Some(VcodingError::WorkspaceNotFound(_))) => {
                debug!(target, "manager:destroy nothing to do");
                return Ok(DestroyReport::nothing_to_do(target));
            }
            Err(err) => return Err(err),
        };
        let paths = self.paths(&id);
        if !paths.root.exists() {
            return Ok(DestroyReport::nothing_to_do(target));
        }
        let _lock = WorkspaceLock::acquire(&paths.lock())?;
        let Some(mut record) = WorkspaceRecord::load(&paths.record())? else {
            paths.remove()?;
            return Ok(DestroyReport::nothing_to_do(target));
        };

        info!(workspace = %record.name, state = %record.state, "manager:destroy start");
        record.state = WorkspaceState::Stopping;
        record.save(&paths.record())?;
        if let Some(handle) = &record.container
            && let Err(err) = self.backend.stop(handle)
        {
            debug!(instance = %handle.name, error = %err, "manager:stop failed");
        }
        let instance = record.container.as_ref().map(|h| h.name.clone());
        let orphan = self.teardown(&mut record, &paths);
        record.state = WorkspaceState::Destroyed;
        paths.remove()?;
        info!(workspace = %record.name, orphaned = orphan.is_some(), "manager:destroy done");

        Ok(DestroyReport {
            workspace: record.name,
            removed_instance: if orphan.is_none() { instance } else { None },
            orphaned_instance: orphan,
            already_destroyed: false,
        })
    }

    /// Run `f` holding the workspace lock with the workspace in `Executing`.
    fn with_ready<T>(
        &self,
        target: &str,
        operation: &str,
        f: impl FnOnce(&mut Operation) -> Result<T>,
    ) -> Result<T> {
        let id = self.resolve_id(target)?;
        let paths = self.paths(&id);
        let _lock = WorkspaceLock::acquire(&paths.lock())?;
        let mut record = WorkspaceRecord::load(&paths.record())?
            .ok_or_else(|| VcodingError::WorkspaceNotFound(target.to_string()))?;

        if record.state == WorkspaceState::Executing {
            // The lock is ours, so whoever left this state behind is gone.
            warn!(workspace = %record.name, "manager:recovering stale executing state");
            record.state = WorkspaceState::Ready;
        }
        if record.state != WorkspaceState::Ready {
            return Err(invalid_state(&record, operation));
        }

        let config = self.config_for(&record.project_path)?;
        record.state = WorkspaceState::Executing;
        record.save(&paths.record())?;
        debug!(workspace = %record.name, operation, "manager:operation start");

        let mut op = Operation {
            record,
            config,
            paths,
            transport: self.transport.clone(),
        };
        let result = f(&mut op);

        let Operation {
            mut record, paths, ..
        } = op;
        record.state = match &result {
            Err(err) if self.instance_lost(&record, err) => WorkspaceState::Error,
            _ => WorkspaceState::Ready,
        };
        record.last_error = result.as_ref().err().map(|err| format!("{err:#}"));
        record.save(&paths.record())?;
        debug!(workspace = %record.name, operation, state = %record.state, "manager:operation done");
        result
    }

    /// A connection failure is fatal only when the instance itself is gone.
    fn instance_lost(&self, record: &WorkspaceRecord, err: &anyhow::Error) -> bool {
        if !matches!(find_kind(err), Some(VcodingError::Connection { .. })) {
            return false;
        }
        match &record.container {
            Some(handle) => !matches!(self.backend.status(handle), Ok(ContainerStatus::Running)),
            None => true,
        }
    }

    /// Run a shell command in the instance's work dir, bracketed by checkpoints.
    pub fn execute(
        &self,
        target: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecReport> {
        self.with_ready(target, "execute", |op| {
            let pre = op.checkpoint(CheckpointLabel::PreExec)?;
            let session = op.session()?;
            info!(workspace = %op.record.name, command, "manager:execute");
            let output = session.exec(command, Some(op.config.work_dir()), timeout)?;
            let post = op.checkpoint(CheckpointLabel::PostExec)?;
            Ok(ExecReport {
                workspace: op.record.name.clone(),
                command: command.to_string(),
                output,
                pre_checkpoint: pre.seq,
                post_checkpoint: post.seq,
            })
        })
    }

    /// Run a coding agent. The agent is resolved before the workspace is touched.
    pub fn run_agent(
        &self,
        target: &str,
        agent: &str,
        instruction: &str,
        opts: &RunAgentOptions,
    ) -> Result<RunAgentReport> {
        let record = self.get(target)?;
        let config = self.config_for(&record.project_path)?;
        let runner = select_agent(agent, &config)?;

        self.with_ready(target, "run an agent", |op| {
            let pre = op.checkpoint(CheckpointLabel::PreAgentRun)?;
            let session = op.session()?;
            let ctx = AgentContext {
                workdir: op.config.work_dir().to_string(),
                model: opts.model.clone(),
            };
            let output = runner.run(&session, instruction, &ctx, opts.timeout)?;
            let post = op.checkpoint(CheckpointLabel::PostAgentRun)?;
            Ok(RunAgentReport {
                workspace: op.record.name.clone(),
                output,
                pre_checkpoint: pre.seq,
                post_checkpoint: post.seq,
            })
        })
    }

    /// Push the project (or `paths` within it) into the instance.
    pub fn sync_to(&self, target: &str, paths: Option<&[String]>) -> Result<PushReport> {
        self.with_ready(target, "sync to the instance", |op| {
            let session = op.session()?;
            op.sync()?
                .push(&op.record.project_path, &session, op.config.work_dir(), paths)
        })
    }

    /// Pull `paths` from the instance into the project.
    pub fn sync_from(&self, target: &str, paths: &[String]) -> Result<PullReport> {
        self.with_ready(target, "sync from the instance", |op| {
            let session = op.session()?;
            op.sync()?
                .pull(&session, op.config.work_dir(), paths, &op.record.project_path)
        })
    }

    /// User-requested checkpoint of the project tree.
    pub fn checkpoint(&self, target: &str, message: Option<&str>) -> Result<Checkpoint> {
        let message = message
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or("changes by vcoding")
            .to_string();
        self.with_ready(target, "checkpoint", |op| {
            op.checkpoint(CheckpointLabel::User(message))
        })
    }

    /// Restore the project to `checkpoint` and mirror the result into the instance.
    pub fn rollback(&self, target: &str, checkpoint: &str) -> Result<RollbackReport> {
        self.with_ready(target, "roll back", |op| {
            let revision = op.revision();
            let wanted = revision.resolve(&op.record.checkpoints, checkpoint)?.clone();
            let restored = revision.rollback(&wanted, op.record.next_seq())?;
            op.record_checkpoint(restored.clone())?;

            let session = op.session()?;
            let pushed = op
                .sync()?
                .push(&op.record.project_path, &session, op.config.work_dir(), None)?;
            Ok(RollbackReport {
                workspace: op.record.name.clone(),
                target: wanted,
                checkpoint: restored,
                resynced: pushed.pushed,
            })
        })
    }

    /// Copy between the host and the instance.
    ///
    /// `remote` is relative to the work dir unless absolute. Downloads land in
    /// the staging area before being moved to `local`.
    pub fn copy(
        &self,
        target: &str,
        direction: CopyDirection,
        local: &Path,
        remote: &str,
        recursive: bool,
    ) -> Result<()> {
        self.with_ready(target, "copy", |op| {
            let session = op.session()?;
            let remote = if remote.starts_with('/') {
                remote.to_string()
            } else {
                format!("{}/{}", op.config.work_dir().trim_end_matches('/'), remote)
            };
            match direction {
                CopyDirection::ToWorkspace => {
                    if let Some((parent, _)) = remote.rsplit_once('/')
                        && !parent.is_empty()
                    {
                        let out = session.exec(&format!("mkdir -p {}", shell_quote(parent)), None, None)?;
                        if !out.success() {
                            bail!("Failed to create {parent}: {}", out.stderr.trim());
                        }
                    }
                    session.copy_to(local, &remote, recursive)
                }
                CopyDirection::FromWorkspace => {
                    let inbound = op.paths.staging().join("copy");
                    if inbound.exists() {
                        fs::remove_dir_all(&inbound)?;
                    }
                    create_private_dir(&inbound)?;
                    let name = remote
                        .trim_end_matches('/')
                        .rsplit('/')
                        .next()
                        .filter(|n| !n.is_empty())
                        .ok_or_else(|| anyhow!("Cannot copy '{remote}'"))?
                        .to_string();
                    let staged = inbound.join(&name);
                    session.copy_from(&remote, &staged, recursive)?;
                    let dest = if local.is_dir() { local.join(&name) } else { local.to_path_buf() };
                    place(&staged, &dest)
                }
            }
        })
    }
}

fn invalid_state(record: &WorkspaceRecord, operation: &str) -> anyhow::Error {
    VcodingError::InvalidState {
        workspace: record.name.clone(),
        state: record.state.to_string(),
        operation: operation.to_string(),
    }
    .into()
}

/// Move a staged download to its host destination.
fn place(staged: &Path, dest: &Path) -> Result<()> {
    if staged.is_dir() {
        let options = fs_extra::dir::CopyOptions::new()
            .overwrite(true)
            .content_only(true);
        fs::create_dir_all(dest)?;
        fs_extra::dir::copy(staged, dest, &options)
            .with_context(|| format!("Failed to write {}", dest.display()))?;
    } else {
        fs::copy(staged, dest).with_context(|| format!("Failed to write {}", dest.display()))?;
    }
    Ok(())
}

/// Install steps for the configured agent tools.
fn agent_installs(config: &Config) -> Vec<String> {
    let mut installs = Vec::new();
    for agent in config.install_agents() {
        match dockerfile::builtin_install(agent) {
            Some(step) => installs.push(step.to_string()),
            None if config.agents.contains_key(agent) => {}
            None => warn!(agent, "manager:no install step for agent"),
        }
    }
    installs.extend(config.agents.values().filter_map(|a| a.install.clone()));
    installs
}

/// Host variables forwarded to the instance, with a `gh` token fallback.
fn collect_env(config: &Config) -> Vec<(String, String)> {
    let names = config.env_passthrough();
    let mut env: Vec<(String, String)> = names
        .iter()
        .filter_map(|name| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.is_empty())
                .map(|v| (name.to_string(), v))
        })
        .collect();

    let wants_github = names.iter().any(|n| GITHUB_TOKEN_VARS.contains(n));
    let has_github = env.iter().any(|(k, _)| GITHUB_TOKEN_VARS.contains(&k.as_str()));
    if wants_github
        && !has_github
        && let Some(token) = gh_auth_token()
    {
        for name in GITHUB_TOKEN_VARS.iter().filter(|n| names.contains(n)) {
            env.push((name.to_string(), token.clone()));
        }
    }
    debug!(vars = ?env.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(), "manager:forwarding env");
    env
}

fn gh_auth_token() -> Option<String> {
    which::which("gh").ok()?;
    let out = Cmd::new("gh")
        .args(["auth", "token"])
        .timeout(Duration::from_secs(5))
        .output()
        .ok()?;
    let token = lossy(&out.stdout).trim().to_string();
    (out.status.success() && !token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBackend, LocalTransport, git_available};
    use tempfile::TempDir;

    struct Harness {
        _data: TempDir,
        project: TempDir,
        remote: TempDir,
        backend: Arc<FakeBackend>,
        manager: WorkspaceManager,
    }

    impl Harness {
        fn target(&self) -> String {
            self.project.path().display().to_string()
        }

        fn record(&self) -> WorkspaceRecord {
            self.manager.get(&self.target()).unwrap()
        }
    }

    fn harness() -> Harness {
        let data = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        let backend = Arc::new(FakeBackend::default());
        let transport = Arc::new(LocalTransport::new("/workspace", remote.path()));
        let manager =
            WorkspaceManager::new(data.path(), backend.clone(), transport).with_global_config(None);
        fs::write(
            project.path().join(".vcoding.yaml"),
            r#"
install_agents: []
env_passthrough: []
ssh:
  startup_retries: 2
  startup_interval_ms: 10
agents:
  demo:
    command: printf 'print(2)\n' >> app.py
"#,
        )
        .unwrap();
        fs::write(project.path().join("app.py"), "print(1)\n").unwrap();
        Harness {
            _data: data,
            project,
            remote,
            backend,
            manager,
        }
    }

    fn created() -> Harness {
        let h = harness();
        h.manager
            .create(h.project.path(), &CreateOptions::default())
            .unwrap();
        h
    }

    fn kind(err: &anyhow::Error) -> &'static str {
        find_kind(err).map(|e| e.kind()).unwrap_or("untyped")
    }

    #[test]
    fn edit_pull_and_rollback_round_trip() {
        if !git_available() {
            return;
        }
        let h = created();
        let target = h.target();
        assert_eq!(h.record().state, WorkspaceState::Ready);
        assert_eq!(
            fs::read_to_string(h.remote.path().join("app.py")).unwrap(),
            "print(1)\n"
        );
        assert!(!h.remote.path().join(".vcoding.yaml").exists());

        let exec = h.manager.execute(&target, "cat app.py", None).unwrap();
        assert_eq!(exec.output.exit_code, 0);
        assert_eq!(exec.output.stdout.trim(), "print(1)");

        let run = h
            .manager
            .run_agent(&target, "demo", "add a print(2) line", &RunAgentOptions::default())
            .unwrap();
        assert_eq!(run.output.files_modified, vec!["app.py".to_string()]);
        assert_eq!(
            fs::read_to_string(h.project.path().join("app.py")).unwrap(),
            "print(1)\n",
            "the host tree only changes on an explicit pull"
        );

        h.manager.sync_from(&target, &["app.py".to_string()]).unwrap();
        assert_eq!(
            fs::read_to_string(h.project.path().join("app.py")).unwrap(),
            "print(1)\nprint(2)\n"
        );

        let back = h
            .manager
            .rollback(&target, &format!("#{}", run.pre_checkpoint))
            .unwrap();
        assert_eq!(back.target.seq, run.pre_checkpoint);
        assert_eq!(
            fs::read_to_string(h.project.path().join("app.py")).unwrap(),
            "print(1)\n"
        );
        assert_eq!(
            fs::read_to_string(h.remote.path().join("app.py")).unwrap(),
            "print(1)\n"
        );

        let history = h.manager.history(&target).unwrap();
        assert_eq!(history.first().map(|c| &c.label), Some(&CheckpointLabel::Initial));
        assert_eq!(
            history.last().map(|c| &c.label),
            Some(&CheckpointLabel::Rollback { to: run.pre_checkpoint })
        );
        assert_eq!(h.record().state, WorkspaceState::Ready);
    }

    #[test]
    fn failed_create_leaves_no_instance_or_key() {
        if !git_available() {
            return;
        }
        let cases: [(fn(&FakeBackend), &str); 3] = [
            (FakeBackend::fail_build, "build-error"),
            (FakeBackend::fail_start, "start-error"),
            (FakeBackend::fail_install, "untyped"),
        ];
        for (inject, expected) in cases {
            let h = harness();
            inject(&h.backend);
            let err = h
                .manager
                .create(h.project.path(), &CreateOptions::default())
                .unwrap_err();
            assert_eq!(kind(&err), expected);

            let record = h.record();
            assert_eq!(record.state, WorkspaceState::Error);
            assert!(record.container.is_none());
            assert!(record.keys.is_none());
            assert!(record.last_error.is_some());
            assert!(!h.manager.keys.exists(&record.id));
            assert!(!record.staging.exists());
            assert_eq!(h.backend.live_instances(), 0);
        }
    }

    #[test]
    fn destroy_twice_is_a_no_op() {
        if !git_available() {
            return;
        }
        let h = created();
        let id = h.record().id;
        let first = h.manager.destroy(&h.target()).unwrap();
        assert!(!first.already_destroyed);
        assert!(first.removed_instance.is_some());
        assert_eq!(h.backend.live_instances(), 0);
        assert!(!h.manager.keys.exists(&id));
        assert!(!h.manager.paths(&id).root.exists());

        let second = h.manager.destroy(&h.target()).unwrap();
        assert!(second.already_destroyed);
        assert_eq!(h.backend.remove_calls(), 1);
    }

    #[test]
    fn stubborn_instance_is_reported_as_orphan() {
        if !git_available() {
            return;
        }
        let h = created();
        h.backend.fail_removes(REMOVE_ATTEMPTS);
        let report = h.manager.destroy(&h.target()).unwrap();
        assert!(report.orphaned_instance.is_some());
        assert!(report.removed_instance.is_none());
        assert!(h.manager.list(false).unwrap().is_empty());
    }

    #[test]
    fn prune_removes_only_unclaimed_instances() {
        if !git_available() {
            return;
        }
        let h = created();
        h.backend.fail_removes(REMOVE_ATTEMPTS);
        let orphan = h.manager.destroy(&h.target()).unwrap().orphaned_instance;
        assert!(orphan.is_some());

        let other = harness();
        let kept = WorkspaceManager::new(
            h._data.path(),
            h.backend.clone(),
            Arc::new(LocalTransport::new("/workspace", other.remote.path())),
        )
        .with_global_config(None)
        .create(other.project.path(), &CreateOptions::default())
        .unwrap();
        assert_eq!(h.backend.live_instances(), 2);

        let report = h.manager.prune().unwrap();
        assert_eq!(report.removed.len(), 1);
        assert!(report.failed.is_empty());
        assert_eq!(h.backend.live_instances(), 1);
        assert!(h.manager.get(&kept.id).is_ok());
        assert!(h.manager.prune().unwrap().removed.is_empty());
    }

    #[test]
    fn logs_need_an_instance() {
        if !git_available() {
            return;
        }
        let h = created();
        assert!(h.manager.logs(&h.target(), 10).is_ok());
        h.manager.destroy(&h.target()).unwrap();
        assert_eq!(kind(&h.manager.logs(&h.target(), 10).unwrap_err()), "workspace-not-found");
    }

    #[test]
    fn concurrent_executes_are_serialised() {
        if !git_available() {
            return;
        }
        let h = created();
        let target = h.target();
        std::thread::scope(|scope| {
            for tag in ["a", "b"] {
                let manager = &h.manager;
                let target = target.as_str();
                scope.spawn(move || {
                    let command = format!("echo {tag}-start >> log.txt; sleep 0.3; echo {tag}-end >> log.txt");
                    manager.execute(target, &command, None).unwrap();
                });
            }
        });

        let log = fs::read_to_string(h.remote.path().join("log.txt")).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 4);
        for pair in lines.chunks(2) {
            let tag = pair[0].trim_end_matches("-start");
            assert_eq!(pair[1], format!("{tag}-end"));
        }
        let seqs: Vec<u32> = h.record().checkpoints.iter().map(|c| c.seq).collect();
        assert_eq!(seqs, (1..=5).collect::<Vec<_>>());
    }

    #[test]
    fn unknown_agent_fails_before_any_checkpoint() {
        if !git_available() {
            return;
        }
        let h = created();
        let before = h.record().checkpoints.len();
        let err = h
            .manager
            .run_agent(&h.target(), "cursor", "hi", &RunAgentOptions::default())
            .unwrap_err();
        assert_eq!(kind(&err), "unsupported-agent");
        let record = h.record();
        assert_eq!(record.checkpoints.len(), before);
        assert_eq!(record.state, WorkspaceState::Ready);
    }

    #[test]
    fn unknown_checkpoint_is_surfaced() {
        if !git_available() {
            return;
        }
        let h = created();
        let err = h.manager.rollback(&h.target(), "#99").unwrap_err();
        assert_eq!(kind(&err), "unknown-checkpoint");
        assert_eq!(h.record().state, WorkspaceState::Ready);
    }

    #[test]
    fn stale_executing_state_is_recovered() {
        if !git_available() {
            return;
        }
        let h = created();
        let mut record = h.record();
        record.state = WorkspaceState::Executing;
        record.save(&h.manager.paths(&record.id).record()).unwrap();

        let out = h.manager.execute(&h.target(), "true", None).unwrap();
        assert_eq!(out.output.exit_code, 0);
        assert_eq!(h.record().state, WorkspaceState::Ready);
    }

    #[test]
    fn timed_out_command_returns_workspace_to_ready() {
        if !git_available() {
            return;
        }
        let h = created();
        let before = h.record().checkpoints.len();

        let err = h
            .manager
            .execute(&h.target(), "sleep 5", Some(Duration::from_millis(200)))
            .unwrap_err();
        assert_eq!(kind(&err), "timeout-error");

        let record = h.record();
        assert_eq!(record.state, WorkspaceState::Ready);
        assert!(record.last_error.as_deref().is_some_and(|e| e.contains("sleep 5")));
        assert_eq!(record.checkpoints.len(), before + 1);
        assert_eq!(
            record.checkpoints.last().map(|c| c.label.clone()),
            Some(CheckpointLabel::PreExec)
        );

        let report = h.manager.execute(&h.target(), "true", None).unwrap();
        assert_eq!(report.output.exit_code, 0);
        assert!(h.record().last_error.is_none());
    }

    #[test]
    fn shell_is_refused_while_the_workspace_is_locked() {
        if !git_available() {
            return;
        }
        let h = created();
        let id = h.record().id;
        {
            let _held = WorkspaceLock::acquire(&h.manager.paths(&id).lock()).unwrap();
            let err = h.manager.interactive(&h.target(), None).unwrap_err();
            assert_eq!(kind(&err), "invalid-state");
        }
        assert_eq!(h.manager.interactive(&h.target(), None).unwrap(), 0);
    }

    #[test]
    fn errored_workspace_rejects_operations() {
        if !git_available() {
            return;
        }
        let h = harness();
        h.backend.fail_start();
        h.manager
            .create(h.project.path(), &CreateOptions::default())
            .unwrap_err();
        let err = h.manager.execute(&h.target(), "true", None).unwrap_err();
        assert_eq!(kind(&err), "invalid-state");
    }

    #[test]
    fn lookup_by_name_and_copy_round_trip() {
        if !git_available() {
            return;
        }
        let h = harness();
        h.manager
            .create(
                h.project.path(),
                &CreateOptions {
                    name: Some("demo-ws".into()),
                },
            )
            .unwrap();
        assert_eq!(h.manager.get("demo-ws").unwrap().name, "demo-ws");
        assert_eq!(h.manager.list(true).unwrap().len(), 1);

        let out = TempDir::new().unwrap();
        h.manager
            .copy("demo-ws", CopyDirection::FromWorkspace, out.path(), "app.py", false)
            .unwrap();
        assert_eq!(
            fs::read_to_string(out.path().join("app.py")).unwrap(),
            "print(1)\n"
        );

        let note = out.path().join("note.txt");
        fs::write(&note, "hi").unwrap();
        h.manager
            .copy("demo-ws", CopyDirection::ToWorkspace, &note, "docs/note.txt", false)
            .unwrap();
        assert_eq!(
            fs::read_to_string(h.remote.path().join("docs/note.txt")).unwrap(),
            "hi"
        );
    }

    #[test]
    fn recreate_replaces_instance_and_keeps_history() {
        if !git_available() {
            return;
        }
        let h = created();
        let first = h.record();
        let again = h
            .manager
            .create(h.project.path(), &CreateOptions::default())
            .unwrap();
        assert_ne!(again.container.map(|c| c.id), first.container.map(|c| c.id));
        assert_eq!(h.backend.live_instances(), 1);
        assert!(again.checkpoints.len() > first.checkpoints.len());
    }
}

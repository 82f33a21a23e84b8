//! JSON tool-invocation boundary for agent orchestration clients.
//!
//! A request is `{"tool": "<name>", "arguments": {...}}`. The response is the
//! operation's report, or `{"error": {"kind": ..., "message": ...}}`.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::find_kind;
use crate::workspace::{CreateOptions, RunAgentOptions, WorkspaceManager, WorkspaceRecord};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "tool", content = "arguments", rename_all = "snake_case")]
pub enum ToolCall {
    CreateWorkspace {
        target: PathBuf,
        #[serde(default)]
        name: Option<String>,
    },
    ExecuteCommand {
        workspace: String,
        command: String,
        /// Seconds.
        #[serde(default)]
        timeout: Option<u64>,
    },
    RunAgent {
        workspace: String,
        agent: String,
        instruction: String,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        timeout: Option<u64>,
    },
    CommitChanges {
        workspace: String,
        #[serde(default)]
        message: Option<String>,
    },
    Rollback {
        workspace: String,
        checkpoint: String,
    },
    SyncToWorkspace {
        workspace: String,
        #[serde(default)]
        paths: Option<Vec<String>>,
    },
    SyncFromWorkspace {
        workspace: String,
        paths: Vec<String>,
    },
    DestroyWorkspace {
        workspace: String,
    },
    ListWorkspaces {
        #[serde(default)]
        running: bool,
    },
    GetCommits {
        workspace: String,
    },
    /// Argument object may be empty.
    FindOrphanedWorkspaces {},
    CleanupOrphanedWorkspaces {},
}

impl ToolCall {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateWorkspace { .. } => "create_workspace",
            Self::ExecuteCommand { .. } => "execute_command",
            Self::RunAgent { .. } => "run_agent",
            Self::CommitChanges { .. } => "commit_changes",
            Self::Rollback { .. } => "rollback",
            Self::SyncToWorkspace { .. } => "sync_to_workspace",
            Self::SyncFromWorkspace { .. } => "sync_from_workspace",
            Self::DestroyWorkspace { .. } => "destroy_workspace",
            Self::ListWorkspaces { .. } => "list_workspaces",
            Self::GetCommits { .. } => "get_commits",
            Self::FindOrphanedWorkspaces {} => "find_orphaned_workspaces",
            Self::CleanupOrphanedWorkspaces {} => "cleanup_orphaned_workspaces",
        }
    }
}

/// Compact view of a workspace for tool clients.
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceSummary {
    pub id: String,
    pub name: String,
    pub project: PathBuf,
    pub state: String,
    pub instance: Option<String>,
    pub status: Option<String>,
    pub checkpoints: usize,
    pub last_error: Option<String>,
}

impl From<&WorkspaceRecord> for WorkspaceSummary {
    fn from(record: &WorkspaceRecord) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            project: record.project_path.clone(),
            state: record.state.to_string(),
            instance: record.container.as_ref().map(|c| c.name.clone()),
            status: record.container.as_ref().map(|c| c.status.to_string()),
            checkpoints: record.checkpoints.len(),
            last_error: record.last_error.clone(),
        }
    }
}

/// Run one call against the manager.
pub fn dispatch(manager: &WorkspaceManager, call: ToolCall) -> Result<Value> {
    info!(tool = call.name(), "tools:dispatch");
    let value = match call {
        ToolCall::CreateWorkspace { target, name } => {
            let record = manager.create(&target, &CreateOptions { name })?;
            serde_json::to_value(WorkspaceSummary::from(&record))?
        }
        ToolCall::ExecuteCommand {
            workspace,
            command,
            timeout,
        } => serde_json::to_value(manager.execute(
            &workspace,
            &command,
            timeout.map(Duration::from_secs),
        )?)?,
        ToolCall::RunAgent {
            workspace,
            agent,
            instruction,
            model,
            timeout,
        } => {
            let opts = RunAgentOptions {
                model,
                timeout: timeout.map(Duration::from_secs),
            };
            serde_json::to_value(manager.run_agent(&workspace, &agent, &instruction, &opts)?)?
        }
        ToolCall::CommitChanges { workspace, message } => {
            serde_json::to_value(manager.checkpoint(&workspace, message.as_deref())?)?
        }
        ToolCall::Rollback {
            workspace,
            checkpoint,
        } => serde_json::to_value(manager.rollback(&workspace, &checkpoint)?)?,
        ToolCall::SyncToWorkspace { workspace, paths } => {
            serde_json::to_value(manager.sync_to(&workspace, paths.as_deref())?)?
        }
        ToolCall::SyncFromWorkspace { workspace, paths } => {
            serde_json::to_value(manager.sync_from(&workspace, &paths)?)?
        }
        ToolCall::DestroyWorkspace { workspace } => {
            serde_json::to_value(manager.destroy(&workspace)?)?
        }
        ToolCall::ListWorkspaces { running } => {
            let summaries: Vec<WorkspaceSummary> = manager
                .list(running)?
                .iter()
                .map(WorkspaceSummary::from)
                .collect();
            serde_json::to_value(summaries)?
        }
        ToolCall::GetCommits { workspace } => serde_json::to_value(manager.history(&workspace)?)?,
        ToolCall::FindOrphanedWorkspaces {} => serde_json::to_value(manager.orphans()?)?,
        ToolCall::CleanupOrphanedWorkspaces {} => serde_json::to_value(manager.prune()?)?,
    };
    Ok(value)
}

pub fn error_value(err: &anyhow::Error) -> Value {
    let kind = find_kind(err).map(|e| e.kind()).unwrap_or("error");
    json!({ "error": { "kind": kind, "message": format!("{err:#}") } })
}

/// Parse `request`, run it, and render the response. Never fails: errors are
/// part of the response.
pub fn handle(manager: &WorkspaceManager, request: &str) -> Value {
    let call: ToolCall = match serde_json::from_str(request) {
        Ok(call) => call,
        Err(err) => {
            warn!(error = %err, "tools:invalid request");
            return json!({ "error": { "kind": "invalid-request", "message": err.to_string() } });
        }
    };
    let tool = call.name();
    dispatch(manager, call).unwrap_or_else(|err| {
        warn!(tool, error = %format!("{err:#}"), "tools:call failed");
        error_value(&err)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::IsolationBackend;
    use crate::testing::{FakeBackend, LocalTransport, git_available};
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn manager(data: &TempDir, remote: &TempDir) -> WorkspaceManager {
        WorkspaceManager::new(
            data.path(),
            Arc::new(FakeBackend::default()),
            Arc::new(LocalTransport::new("/workspace", remote.path())),
        )
        .with_global_config(None)
    }

    #[test]
    fn requests_parse_with_optional_arguments() {
        let call: ToolCall = serde_json::from_str(
            r#"{"tool": "execute_command", "arguments": {"workspace": "demo", "command": "ls"}}"#,
        )
        .unwrap();
        assert_eq!(
            call,
            ToolCall::ExecuteCommand {
                workspace: "demo".into(),
                command: "ls".into(),
                timeout: None,
            }
        );
        let call: ToolCall =
            serde_json::from_str(r#"{"tool": "list_workspaces", "arguments": {}}"#).unwrap();
        assert_eq!(call.name(), "list_workspaces");
    }

    #[test]
    fn bad_requests_and_failures_become_error_objects() {
        let data = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        let manager = manager(&data, &remote);

        let out = handle(&manager, r#"{"tool": "format_disk", "arguments": {}}"#);
        assert_eq!(out["error"]["kind"], "invalid-request");

        let out = handle(
            &manager,
            r##"{"tool": "rollback", "arguments": {"workspace": "ghost", "checkpoint": "#1"}}"##,
        );
        assert_eq!(out["error"]["kind"], "workspace-not-found");
        assert!(out["error"]["message"].as_str().unwrap().contains("ghost"));
    }

    #[test]
    fn orphaned_instances_are_found_then_cleaned_up() {
        let data = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        let backend = Arc::new(FakeBackend::default());
        let manager = WorkspaceManager::new(
            data.path(),
            backend.clone(),
            Arc::new(LocalTransport::new("/workspace", remote.path())),
        )
        .with_global_config(None);
        backend
            .start(
                "vcoding/ghost:latest",
                &crate::sandbox::StartOptions {
                    name: "vcoding-ghost".into(),
                    workspace_id: "deadbeef".into(),
                    env: Vec::new(),
                },
            )
            .unwrap();

        let found = handle(&manager, r#"{"tool": "find_orphaned_workspaces", "arguments": {}}"#);
        assert_eq!(found.as_array().map(Vec::len), Some(1), "{found}");
        assert_eq!(found[0]["workspace_id"], "deadbeef");
        assert_eq!(backend.live_instances(), 1);

        let cleaned = handle(&manager, r#"{"tool": "cleanup_orphaned_workspaces", "arguments": {}}"#);
        assert_eq!(cleaned["removed"].as_array().map(Vec::len), Some(1), "{cleaned}");
        assert_eq!(backend.live_instances(), 0);

        let found = handle(&manager, r#"{"tool": "find_orphaned_workspaces", "arguments": {}}"#);
        assert_eq!(found.as_array().map(Vec::len), Some(0));
    }

    #[test]
    fn create_execute_commit_list_destroy() {
        if !git_available() {
            return;
        }
        let data = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        fs::write(
            project.path().join(".vcoding.yaml"),
            "install_agents: []\nenv_passthrough: []\n",
        )
        .unwrap();
        fs::write(project.path().join("README.md"), "hello\n").unwrap();
        let manager = manager(&data, &remote);

        let request = json!({
            "tool": "create_workspace",
            "arguments": {"target": project.path(), "name": "tooling"},
        });
        let created = handle(&manager, &request.to_string());
        assert_eq!(created["state"], "ready", "{created}");

        let out = handle(
            &manager,
            r#"{"tool": "execute_command", "arguments": {"workspace": "tooling", "command": "cat README.md"}}"#,
        );
        assert_eq!(out["exit_code"], 0);
        assert_eq!(out["stdout"], "hello\n");

        fs::write(project.path().join("NOTES.md"), "later\n").unwrap();
        let out = handle(
            &manager,
            r#"{"tool": "commit_changes", "arguments": {"workspace": "tooling", "message": "notes"}}"#,
        );
        assert_eq!(out["label"]["kind"], "user");
        assert_eq!(out["label"]["detail"], "notes");

        let out = handle(&manager, r#"{"tool": "list_workspaces", "arguments": {"running": true}}"#);
        assert_eq!(out.as_array().map(Vec::len), Some(1));

        let out = handle(&manager, r#"{"tool": "get_commits", "arguments": {"workspace": "tooling"}}"#);
        let commits = out.as_array().expect("history array");
        assert_eq!(commits.first().map(|c| c["label"]["kind"].clone()), Some(json!("initial")));
        assert_eq!(commits.last().map(|c| c["label"]["detail"].clone()), Some(json!("notes")));

        let out = handle(&manager, r#"{"tool": "destroy_workspace", "arguments": {"workspace": "tooling"}}"#);
        assert_eq!(out["already_destroyed"], false);
        let out = handle(&manager, r#"{"tool": "destroy_workspace", "arguments": {"workspace": "tooling"}}"#);
        assert_eq!(out["already_destroyed"], true);
    }
}

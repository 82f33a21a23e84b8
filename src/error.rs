use std::time::Duration;

/// Typed failures raised by the workspace core.
///
/// These travel inside `anyhow::Error` and are recovered with
/// `err.downcast_ref::<VcodingError>()` where a caller needs to branch on kind.
#[derive(Debug, thiserror::Error)]
pub enum VcodingError {
    #[error("{runtime} build exited with status {status}\n{log}")]
    Build {
        runtime: String,
        status: i32,
        log: String,
    },

    #[error("instance {instance} failed to start: {reason}\n{logs}")]
    Start {
        instance: String,
        reason: String,
        logs: String,
    },

    #[error("cannot reach {target}: {message}")]
    Connection { target: String, message: String },

    #[error("command timed out after {}s: {command}", after.as_secs())]
    Timeout { command: String, after: Duration },

    #[error("sync incomplete: {} succeeded, failed: {}", succeeded.len(), format_failures(failed))]
    Sync {
        succeeded: Vec<String>,
        failed: Vec<(String, String)>,
    },

    #[error("checkpoint '{checkpoint}' is not in the history of workspace {workspace}")]
    UnknownCheckpoint {
        workspace: String,
        checkpoint: String,
    },

    #[error("version control conflict in {}: {message}", paths.join(", "))]
    GitConflict { paths: Vec<String>, message: String },

    #[error("unsupported agent '{name}' (known: {})", known.join(", "))]
    UnsupportedAgent { name: String, known: Vec<String> },

    #[error("unsupported isolation backend: {0}")]
    UnsupportedBackend(String),

    #[error("workspace {workspace} is {state}; cannot {operation}")]
    InvalidState {
        workspace: String,
        state: String,
        operation: String,
    },

    #[error("workspace not found: {0}")]
    WorkspaceNotFound(String),
}

impl VcodingError {
    /// Stable, machine-readable name of the failure class.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Build { .. } => "build-error",
            Self::Start { .. } => "start-error",
            Self::Connection { .. } => "connection-error",
            Self::Timeout { .. } => "timeout-error",
            Self::Sync { .. } => "sync-error",
            Self::UnknownCheckpoint { .. } => "unknown-checkpoint",
            Self::GitConflict { .. } => "git-conflict",
            Self::UnsupportedAgent { .. } => "unsupported-agent",
            Self::UnsupportedBackend(_) => "unsupported-backend",
            Self::InvalidState { .. } => "invalid-state",
            Self::WorkspaceNotFound(_) => "workspace-not-found",
        }
    }
}

/// Find the typed error anywhere in an `anyhow` chain.
pub fn find_kind(err: &anyhow::Error) -> Option<&VcodingError> {
    err.chain().find_map(|cause| cause.downcast_ref::<VcodingError>())
}

fn format_failures(failed: &[(String, String)]) -> String {
    failed
        .iter()
        .map(|(path, reason)| format!("{path} ({reason})"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_survives_context_layers() {
        let err: anyhow::Error = VcodingError::WorkspaceNotFound("demo".into()).into();
        let err = err.context("looking up workspace");
        assert_eq!(find_kind(&err).map(|e| e.kind()), Some("workspace-not-found"));
    }

    #[test]
    fn sync_error_lists_failed_paths() {
        let err = VcodingError::Sync {
            succeeded: vec!["a.txt".into()],
            failed: vec![("b.txt".into(), "no such file".into())],
        };
        let msg = err.to_string();
        assert!(msg.contains("1 succeeded"));
        assert!(msg.contains("b.txt (no such file)"));
    }
}

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// File names probed for project configuration, in order.
pub const PROJECT_CONFIG_FILES: [&str; 2] = [".vcoding.yaml", ".vcoding.yml"];

/// Written as `.gitignore` when a project has none.
pub const DEFAULT_IGNORE: &[&str] = &[
    "__pycache__/",
    "*.pyc",
    ".venv/",
    "node_modules/",
    "target/",
    "dist/",
    "build/",
    ".env",
    "*.log",
    "*.o",
    "*.so",
    "*.dylib",
    "*.exe",
    "*.zip",
    "*.tar.gz",
    ".DS_Store",
    "Thumbs.db",
];

const DEFAULT_ENV_PASSTHROUGH: &[&str] = &[
    "COPILOT_GITHUB_TOKEN",
    "GH_TOKEN",
    "GITHUB_TOKEN",
    "ANTHROPIC_API_KEY",
];

/// Isolation backend family.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Container,
    /// Reserved for a hypervisor-backed driver.
    Vm,
}

/// CLI used to drive the container backend.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    #[default]
    Docker,
    Podman,
}

impl ContainerRuntime {
    pub fn binary(&self) -> &'static str {
        match self {
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::Podman => "podman",
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct SshConfig {
    /// Seconds allowed for the TCP/SSH handshake. Default: 10
    #[serde(default)]
    pub connect_timeout: Option<u64>,

    /// Default seconds a remote command may run. Default: 300
    #[serde(default)]
    pub command_timeout: Option<u64>,

    /// Attempts made while the instance's SSH server comes up. Default: 30
    #[serde(default)]
    pub startup_retries: Option<u32>,

    /// Pause between startup attempts, in milliseconds. Default: 1000
    #[serde(default)]
    pub startup_interval_ms: Option<u64>,
}

impl SshConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout.unwrap_or(10))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout.unwrap_or(300))
    }

    pub fn startup_retries(&self) -> u32 {
        self.startup_retries.unwrap_or(30).max(1)
    }

    pub fn startup_interval(&self) -> Duration {
        Duration::from_millis(self.startup_interval_ms.unwrap_or(1000))
    }

    fn merge(self, project: Self) -> Self {
        Self {
            connect_timeout: project.connect_timeout.or(self.connect_timeout),
            command_timeout: project.command_timeout.or(self.command_timeout),
            startup_retries: project.startup_retries.or(self.startup_retries),
            startup_interval_ms: project.startup_interval_ms.or(self.startup_interval_ms),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct GitConfig {
    /// Initialise a repository in the project on create. Default: true
    #[serde(default)]
    pub auto_init: Option<bool>,

    /// Ignore rules written when the project has no `.gitignore`.
    #[serde(default)]
    pub ignore: Option<Vec<String>>,

    /// Untracked files larger than this are kept out of checkpoints. Default: 10
    #[serde(default)]
    pub max_file_size_mb: Option<u64>,
}

impl GitConfig {
    pub fn auto_init(&self) -> bool {
        self.auto_init.unwrap_or(true)
    }

    pub fn ignore(&self) -> Vec<String> {
        self.ignore
            .clone()
            .unwrap_or_else(|| DEFAULT_IGNORE.iter().map(|s| s.to_string()).collect())
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size_mb.unwrap_or(10) * 1024 * 1024
    }

    fn merge(self, project: Self) -> Self {
        Self {
            auto_init: project.auto_init.or(self.auto_init),
            ignore: project.ignore.or(self.ignore),
            max_file_size_mb: project.max_file_size_mb.or(self.max_file_size_mb),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct SyncConfig {
    /// Extra glob patterns never pushed into the instance.
    #[serde(default)]
    pub exclude: Option<Vec<String>>,
}

impl SyncConfig {
    /// Patterns applied to project-relative paths; `.git` is always excluded.
    pub fn exclude(&self) -> Vec<String> {
        let mut patterns = vec![".git".to_string(), ".vcoding.yaml".to_string()];
        patterns.extend(self.exclude.iter().flatten().cloned());
        patterns
    }
}

/// An agent declared in configuration rather than built in.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CustomAgentConfig {
    /// Template rendered with `instruction`, `quoted_instruction`, `model` and `workdir`.
    pub command: String,

    /// Seconds the agent may run. Default: the ssh command timeout
    #[serde(default)]
    pub timeout: Option<u64>,

    /// Shell run as root during the image build.
    #[serde(default)]
    pub install: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct Config {
    /// Isolation backend. Default: container
    #[serde(default)]
    pub backend: Option<BackendKind>,

    /// Container runtime. Default: docker
    #[serde(default)]
    pub runtime: Option<ContainerRuntime>,

    /// Build file, relative to the project. Default: Dockerfile
    #[serde(default)]
    pub dockerfile: Option<PathBuf>,

    /// Image used when the project has no build file. Default: ubuntu:24.04
    #[serde(default)]
    pub base_image: Option<String>,

    /// Unprivileged account agents run as. Default: vcoding
    #[serde(default)]
    pub user: Option<String>,

    /// Project root inside the instance. Default: /workspace
    #[serde(default)]
    pub work_dir: Option<String>,

    /// Built-in agent tools installed into the image. Default: [claude, copilot]
    #[serde(default)]
    pub install_agents: Option<Vec<String>>,

    /// Host environment variables forwarded to the instance.
    #[serde(default)]
    pub env_passthrough: Option<Vec<String>>,

    #[serde(default)]
    pub ssh: SshConfig,

    #[serde(default)]
    pub git: GitConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub agents: BTreeMap<String, CustomAgentConfig>,
}

impl Config {
    /// Load global configuration merged with the project's own file.
    pub fn load(project: &Path) -> anyhow::Result<Self> {
        let global = global_config_path();
        Self::load_layers(global.as_deref(), project)
    }

    /// Merge `global` (if any) with the project file found in `project`.
    pub fn load_layers(global: Option<&Path>, project: &Path) -> anyhow::Result<Self> {
        let global_config = match global {
            Some(path) => Self::load_from_path(path)?.unwrap_or_default(),
            None => Self::default(),
        };
        let project_config = match find_project_config(project) {
            Some(path) => Self::load_from_path(&path)?.unwrap_or_default(),
            None => Self::default(),
        };
        let config = global_config.merge(project_config);
        debug!(
            project = %project.display(),
            backend = ?config.backend(),
            runtime = ?config.runtime(),
            "config:loaded"
        );
        Ok(config)
    }

    fn load_from_path(path: &Path) -> anyhow::Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        debug!(path = %path.display(), "config:reading file");
        let contents = fs::read_to_string(path)?;
        if contents.trim().is_empty() {
            return Ok(Some(Self::default()));
        }
        let config: Config = serde_yaml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse config at {}: {}", path.display(), e))?;
        Ok(Some(config))
    }

    /// Project values win field by field; lists replace, agents union.
    fn merge(self, project: Self) -> Self {
        let mut agents = self.agents;
        agents.extend(project.agents);
        Self {
            backend: project.backend.or(self.backend),
            runtime: project.runtime.or(self.runtime),
            dockerfile: project.dockerfile.or(self.dockerfile),
            base_image: project.base_image.or(self.base_image),
            user: project.user.or(self.user),
            work_dir: project.work_dir.or(self.work_dir),
            install_agents: project.install_agents.or(self.install_agents),
            env_passthrough: project.env_passthrough.or(self.env_passthrough),
            ssh: self.ssh.merge(project.ssh),
            git: self.git.merge(project.git),
            sync: SyncConfig {
                exclude: project.sync.exclude.or(self.sync.exclude),
            },
            agents,
        }
    }

    pub fn backend(&self) -> BackendKind {
        self.backend.unwrap_or_default()
    }

    pub fn runtime(&self) -> ContainerRuntime {
        self.runtime.unwrap_or_default()
    }

    pub fn dockerfile(&self) -> &Path {
        self.dockerfile
            .as_deref()
            .unwrap_or_else(|| Path::new("Dockerfile"))
    }

    pub fn base_image(&self) -> &str {
        self.base_image.as_deref().unwrap_or("ubuntu:24.04")
    }

    pub fn user(&self) -> &str {
        self.user.as_deref().unwrap_or("vcoding")
    }

    pub fn work_dir(&self) -> &str {
        self.work_dir.as_deref().unwrap_or("/workspace")
    }

    pub fn install_agents(&self) -> Vec<&str> {
        self.install_agents
            .as_ref()
            .map(|v| v.iter().map(|s| s.as_str()).collect())
            .unwrap_or_else(|| vec!["claude", "copilot"])
    }

    pub fn env_passthrough(&self) -> Vec<&str> {
        self.env_passthrough
            .as_ref()
            .map(|v| v.iter().map(|s| s.as_str()).collect())
            .unwrap_or_else(|| DEFAULT_ENV_PASSTHROUGH.to_vec())
    }
}

/// `~/.config/vcoding/config.yaml` (or `.yml`) if it exists.
pub fn global_config_path() -> Option<PathBuf> {
    let dir = home::home_dir()?.join(".config").join("vcoding");
    ["config.yaml", "config.yml"]
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// The project configuration file inside `project`, if any.
pub fn find_project_config(project: &Path) -> Option<PathBuf> {
    PROJECT_CONFIG_FILES
        .iter()
        .map(|name| project.join(name))
        .find(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_apply_without_files() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_layers(None, dir.path()).unwrap();
        assert_eq!(config.backend(), BackendKind::Container);
        assert_eq!(config.runtime().binary(), "docker");
        assert_eq!(config.user(), "vcoding");
        assert_eq!(config.work_dir(), "/workspace");
        assert_eq!(config.ssh.command_timeout(), Duration::from_secs(300));
        assert!(config.git.auto_init());
        assert!(config.env_passthrough().contains(&"GITHUB_TOKEN"));
    }

    #[test]
    fn project_overrides_global_field_by_field() {
        let global_dir = TempDir::new().unwrap();
        let global = global_dir.path().join("config.yaml");
        fs::write(
            &global,
            "runtime: podman\nuser: dev\nssh:\n  connect_timeout: 3\n  command_timeout: 60\nagents:\n  echo:\n    command: echo hi\n",
        )
        .unwrap();

        let project = TempDir::new().unwrap();
        fs::write(
            project.path().join(".vcoding.yaml"),
            "user: agent\nssh:\n  command_timeout: 30\nagents:\n  demo:\n    command: \"true\"\n    timeout: 5\n",
        )
        .unwrap();

        let config = Config::load_layers(Some(&global), project.path()).unwrap();
        assert_eq!(config.runtime(), ContainerRuntime::Podman);
        assert_eq!(config.user(), "agent");
        assert_eq!(config.ssh.connect_timeout(), Duration::from_secs(3));
        assert_eq!(config.ssh.command_timeout(), Duration::from_secs(30));
        assert!(config.agents.contains_key("echo"));
        assert_eq!(config.agents["demo"].timeout, Some(5));
    }

    #[test]
    fn vm_backend_parses() {
        let project = TempDir::new().unwrap();
        fs::write(project.path().join(".vcoding.yml"), "backend: vm\n").unwrap();
        let config = Config::load_layers(None, project.path()).unwrap();
        assert_eq!(config.backend(), BackendKind::Vm);
    }

    #[test]
    fn invalid_yaml_names_the_file() {
        let project = TempDir::new().unwrap();
        fs::write(project.path().join(".vcoding.yaml"), "runtime: [oops\n").unwrap();
        let err = Config::load_layers(None, project.path()).unwrap_err();
        assert!(err.to_string().contains(".vcoding.yaml"));
    }

    #[test]
    fn sync_exclude_always_keeps_git() {
        let config = SyncConfig {
            exclude: Some(vec!["*.bin".into()]),
        };
        let patterns = config.exclude();
        assert_eq!(patterns[0], ".git");
        assert!(patterns.contains(&"*.bin".to_string()));
    }
}

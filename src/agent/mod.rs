//! Coding agents invoked inside an instance.

mod claude;
mod copilot;
mod custom;

pub use claude::ClaudeAgent;
pub use copilot::CopilotAgent;
pub use custom::CustomAgent;

use anyhow::Result;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::VcodingError;
use crate::remote::RemoteSession;
use crate::shell::shell_quote;

/// Prefix of the file touched before each run so modified files can be found afterwards.
const MARKER_PREFIX: &str = "/tmp/.vcoding-marker-";

/// Per-run inputs that shape the command line.
#[derive(Debug, Clone, Default)]
pub struct AgentContext {
    pub workdir: String,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentOutput {
    pub agent: String,
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Work-dir-relative files changed during the run.
    pub files_modified: Vec<String>,
    pub duration_ms: u128,
}

pub trait AgentRunner: Send + Sync {
    fn name(&self) -> &str;

    /// The shell line that carries out `instruction`.
    fn build_command(&self, instruction: &str, ctx: &AgentContext) -> Result<String>;

    fn timeout(&self) -> Duration;

    /// Run through `session`, reporting which files the agent touched.
    fn run(
        &self,
        session: &RemoteSession,
        instruction: &str,
        ctx: &AgentContext,
        timeout: Option<Duration>,
    ) -> Result<AgentOutput> {
        let command = self.build_command(instruction, ctx)?;
        let timeout = timeout.unwrap_or_else(|| self.timeout());
        let workdir = Some(ctx.workdir.as_str());

        let marker = marker_path();
        // Timestamps are coarse; a pause keeps writes that follow the marker strictly newer.
        session.exec(&format!("touch {marker} && sleep 1"), None, None)?;
        info!(agent = self.name(), secs = timeout.as_secs(), "agent:run start");
        let started = Instant::now();
        let out = session.exec(&command, workdir, Some(timeout))?;
        let duration_ms = started.elapsed().as_millis();

        let listing = session.exec(
            &format!("find . -type f -newer {marker} -not -path './.git/*'; rm -f {marker}"),
            workdir,
            None,
        )?;
        let mut files_modified: Vec<String> = listing
            .stdout
            .lines()
            .map(|l| l.trim_start_matches("./").to_string())
            .filter(|l| !l.is_empty())
            .collect();
        files_modified.sort();
        debug!(agent = self.name(), files = files_modified.len(), "agent:modified files");
        info!(agent = self.name(), exit_code = out.exit_code, duration_ms, "agent:run done");

        Ok(AgentOutput {
            agent: self.name().to_string(),
            command,
            exit_code: out.exit_code,
            stdout: out.stdout,
            stderr: out.stderr,
            files_modified,
            duration_ms,
        })
    }
}

/// Built-in agents and their accepted aliases.
const BUILTINS: &[(&str, &[&str])] = &[
    ("copilot", &["copilot", "github-copilot", "copilot-cli"]),
    ("claude", &["claude", "claude-code", "claudecode"]),
];

pub fn known_agents(config: &Config) -> Vec<String> {
    let mut names: Vec<String> = BUILTINS.iter().map(|(n, _)| n.to_string()).collect();
    names.extend(config.agents.keys().cloned());
    names
}

/// Resolve `name` to a runner. Unknown names fail here, before anything runs.
pub fn select_agent(name: &str, config: &Config) -> Result<Box<dyn AgentRunner>> {
    let wanted = name.trim().to_lowercase();
    if let Some(custom) = config.agents.get(&wanted) {
        return Ok(Box::new(CustomAgent::new(
            &wanted,
            custom,
            config.ssh.command_timeout(),
        )));
    }
    let builtin = BUILTINS
        .iter()
        .find(|(_, aliases)| aliases.contains(&wanted.as_str()))
        .map(|(canonical, _)| *canonical);
    let timeout = config.ssh.command_timeout();
    match builtin {
        Some("copilot") => Ok(Box::new(CopilotAgent::new(timeout))),
        Some("claude") => Ok(Box::new(ClaudeAgent::new(timeout))),
        _ => Err(VcodingError::UnsupportedAgent {
            name: name.to_string(),
            known: known_agents(config),
        }
        .into()),
    }
}

fn marker_path() -> String {
    let mut nonce = [0u8; 8];
    if getrandom::fill(&mut nonce).is_err() {
        nonce = (std::process::id() as u64).to_be_bytes();
    }
    let hex: String = nonce.iter().map(|b| format!("{b:02x}")).collect();
    format!("{MARKER_PREFIX}{hex}")
}

/// Single-quoted instruction, safe to splice into a command line.
pub(crate) fn quote_instruction(instruction: &str) -> String {
    shell_quote(instruction)
}

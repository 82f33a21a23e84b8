use crate::command;
use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "vcoding")]
#[command(about = "Disposable, isolated workspaces for running coding agents on a copy of your project")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Workspace selector shared by most subcommands.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct Target {
    /// Workspace name, id prefix, or project path (defaults to the workspace of the current directory)
    #[arg(short = 'n', long = "name")]
    pub name: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an isolated instance for a project and push the project into it
    Create {
        /// Project directory (defaults to the current directory)
        path: Option<PathBuf>,

        /// Display name for the workspace (defaults to the directory name)
        #[arg(long)]
        name: Option<String>,
    },

    /// List workspaces and their status
    #[command(visible_alias = "ls")]
    List {
        /// Only show workspaces whose instance is running
        #[arg(long)]
        running: bool,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Open a shell in the instance, or run a one-shot command there
    #[command(visible_alias = "ssh")]
    Exec {
        #[command(flatten)]
        target: Target,

        /// Seconds the command may run (default from ssh.command_timeout)
        #[arg(long)]
        timeout: Option<u64>,

        /// Command to run; omit for an interactive shell
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Copy files between the host and a workspace (remote paths are <workspace>:<path>)
    #[command(visible_alias = "copy")]
    Cp {
        /// Copy directories recursively
        #[arg(short = 'r', long)]
        recursive: bool,

        src: String,
        dst: String,
    },

    /// Run a coding agent in the workspace, bracketed by checkpoints
    Agent {
        #[command(flatten)]
        target: Target,

        /// Agent to run (claude, copilot, or one declared under `agents`)
        agent: String,

        /// Natural-language instruction for the agent
        #[arg(required = true, trailing_var_arg = true)]
        instruction: Vec<String>,

        /// Model passed to the agent tool
        #[arg(long)]
        model: Option<String>,

        /// Seconds the agent may run
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Record a checkpoint of the project tree
    Checkpoint {
        #[command(flatten)]
        target: Target,

        /// Checkpoint message
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Show the workspace's checkpoints
    History {
        #[command(flatten)]
        target: Target,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Restore the project to a checkpoint (#seq or commit prefix)
    Rollback {
        #[command(flatten)]
        target: Target,

        checkpoint: String,
    },

    /// Copy the project (or selected paths) into the instance
    Push {
        #[command(flatten)]
        target: Target,

        /// Project-relative paths (defaults to the whole tree)
        paths: Vec<String>,
    },

    /// Copy selected paths from the instance into the project
    Pull {
        #[command(flatten)]
        target: Target,

        /// Project-relative paths ('.' for the whole tree)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Remove the instance, erase the key, and forget the workspace
    #[command(visible_alias = "rm")]
    Destroy {
        #[command(flatten)]
        target: Target,
    },

    /// Show recent output of the workspace's instance
    Logs {
        #[command(flatten)]
        target: Target,

        /// Number of lines from the end
        #[arg(long, default_value_t = 100)]
        tail: usize,
    },

    /// Remove managed instances whose workspace no longer exists
    Prune,

    /// Serve tool calls: one JSON request per stdin line, one JSON response per stdout line
    Tool,

    /// Generate shell completions
    Completions {
        /// The shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Create { path, name } => command::create::run(path, name),
        Commands::List { running, json } => command::list::run(running, json),
        Commands::Exec {
            target,
            timeout,
            command,
        } => command::exec::run(&target, timeout, &command),
        Commands::Cp {
            recursive,
            src,
            dst,
        } => command::cp::run(&src, &dst, recursive),
        Commands::Agent {
            target,
            agent,
            instruction,
            model,
            timeout,
        } => command::agent::run(&target, &agent, &instruction.join(" "), model, timeout),
        Commands::Checkpoint { target, message } => {
            command::revision::checkpoint(&target, message.as_deref())
        }
        Commands::History { target, json } => command::revision::history(&target, json),
        Commands::Rollback { target, checkpoint } => {
            command::revision::rollback(&target, &checkpoint)
        }
        Commands::Push { target, paths } => command::sync::push(&target, &paths),
        Commands::Pull { target, paths } => command::sync::pull(&target, &paths),
        Commands::Destroy { target } => command::destroy::run(&target),
        Commands::Logs { target, tail } => command::logs::run(&target, tail),
        Commands::Prune => command::prune::run(),
        Commands::Tool => command::tool::run(),
        Commands::Completions { shell } => {
            generate_completions(shell);
            Ok(())
        }
    }
}

fn generate_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut std::io::stdout());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn exec_keeps_hyphenated_command_words() {
        let cli = Cli::try_parse_from(["vcoding", "exec", "-n", "demo", "ls", "-la"]).unwrap();
        match cli.command {
            Commands::Exec {
                target, command, ..
            } => {
                assert_eq!(target.name.as_deref(), Some("demo"));
                assert_eq!(command, vec!["ls", "-la"]);
            }
            _ => panic!("expected exec"),
        }
    }

    #[test]
    fn aliases_resolve() {
        assert!(matches!(
            Cli::try_parse_from(["vcoding", "ls", "--running"]).unwrap().command,
            Commands::List { running: true, .. }
        ));
        assert!(matches!(
            Cli::try_parse_from(["vcoding", "rm"]).unwrap().command,
            Commands::Destroy { .. }
        ));
    }
}

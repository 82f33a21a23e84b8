use anyhow::{Result, bail};
use std::path::{Path, PathBuf};

use vcoding::workspace::CopyDirection;

#[derive(Debug, PartialEq, Eq)]
enum Location {
    Local(PathBuf),
    Remote { workspace: String, path: String },
}

/// `<workspace>:<path>` is remote; anything with a `/` before the colon is a host path.
fn parse_location(arg: &str) -> Location {
    match arg.split_once(':') {
        Some((workspace, path)) if !workspace.is_empty() && !workspace.contains('/') => {
            Location::Remote {
                workspace: workspace.to_string(),
                path: if path.is_empty() { ".".to_string() } else { path.to_string() },
            }
        }
        _ => Location::Local(PathBuf::from(arg)),
    }
}

pub fn run(src: &str, dst: &str, recursive: bool) -> Result<()> {
    let (workspace, direction, local, remote) = match (parse_location(src), parse_location(dst)) {
        (Location::Local(local), Location::Remote { workspace, path }) => {
            (workspace, CopyDirection::ToWorkspace, local, path)
        }
        (Location::Remote { workspace, path }, Location::Local(local)) => {
            (workspace, CopyDirection::FromWorkspace, local, path)
        }
        (Location::Local(_), Location::Local(_)) => {
            bail!("One side must be a workspace path written as <workspace>:<path>")
        }
        (Location::Remote { .. }, Location::Remote { .. }) => {
            bail!("Copying between two workspaces is not supported")
        }
    };
    if direction == CopyDirection::ToWorkspace && local.is_dir() && !recursive {
        bail!("{} is a directory (use -r)", local.display());
    }

    let manager = super::manager()?;
    manager.copy(&workspace, direction, Path::new(&local), &remote, recursive)?;
    println!("Copied {src} -> {dst}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_paths_need_a_bare_workspace_prefix() {
        assert_eq!(
            parse_location("demo:src/main.rs"),
            Location::Remote {
                workspace: "demo".into(),
                path: "src/main.rs".into()
            }
        );
        assert_eq!(
            parse_location("./odd:name"),
            Location::Local(PathBuf::from("./odd:name"))
        );
        assert_eq!(parse_location("notes.txt"), Location::Local(PathBuf::from("notes.txt")));
        assert_eq!(
            parse_location("demo:"),
            Location::Remote {
                workspace: "demo".into(),
                path: ".".into()
            }
        );
    }
}

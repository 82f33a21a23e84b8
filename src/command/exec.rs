use anyhow::Result;
use std::io::Write;
use std::time::Duration;

use crate::cli::Target;
use vcoding::shell::join_quoted;

/// Interactive shell when `command` is empty, otherwise a checkpointed one-shot run.
/// Exits with the remote status.
pub fn run(target: &Target, timeout: Option<u64>, command: &[String]) -> Result<()> {
    let manager = super::manager()?;
    let target = super::resolve_target(target, &manager)?;

    let code = if command.is_empty() {
        manager.interactive(&target, None)?
    } else {
        // A single word may already be a full shell line: `vcoding exec 'make && make test'`.
        let line = match command {
            [single] => single.clone(),
            words => join_quoted(words),
        };
        let report = manager.execute(&target, &line, timeout.map(Duration::from_secs))?;
        print!("{}", report.output.stdout);
        eprint!("{}", report.output.stderr);
        std::io::stdout().flush()?;
        report.output.exit_code
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

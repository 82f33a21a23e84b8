use anyhow::Result;
use std::io::{BufRead, Write};

use vcoding::tools;

/// One request per input line, one response per output line, until EOF.
pub fn run() -> Result<()> {
    let manager = super::manager()?;
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = tools::handle(&manager, &line);
        writeln!(stdout, "{response}")?;
        stdout.flush()?;
    }
    Ok(())
}

use anyhow::Result;
use std::time::Duration;

use crate::cli::Target;
use crate::spinner;
use vcoding::workspace::RunAgentOptions;

pub fn run(
    target: &Target,
    agent: &str,
    instruction: &str,
    model: Option<String>,
    timeout: Option<u64>,
) -> Result<()> {
    let manager = super::manager()?;
    let target = super::resolve_target(target, &manager)?;
    let opts = RunAgentOptions {
        model,
        timeout: timeout.map(Duration::from_secs),
    };
    let report = spinner::with_spinner(&format!("Running {agent}"), || {
        manager.run_agent(&target, agent, instruction, &opts)
    })?;

    print!("{}", report.output.stdout);
    eprint!("{}", report.output.stderr);
    println!();
    println!(
        "{} exited with {} in {:.1}s (checkpoints #{} -> #{})",
        report.output.agent,
        report.output.exit_code,
        report.output.duration_ms as f64 / 1000.0,
        report.pre_checkpoint,
        report.post_checkpoint
    );
    if report.output.files_modified.is_empty() {
        println!("No files modified");
    } else {
        println!("Modified in the instance (pull to apply):");
        for file in &report.output.files_modified {
            println!("  {file}");
        }
    }
    Ok(())
}

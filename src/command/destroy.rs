use anyhow::Result;

use crate::cli::Target;
use crate::spinner;

pub fn run(target: &Target) -> Result<()> {
    let manager = super::manager()?;
    let target = super::resolve_target(target, &manager)?;
    let report = spinner::with_spinner("Destroying workspace", || manager.destroy(&target))?;

    if report.already_destroyed {
        println!("Nothing to destroy for '{}'", report.workspace);
        return Ok(());
    }
    println!("Destroyed workspace '{}'", report.workspace);
    if let Some(instance) = report.orphaned_instance {
        eprintln!("warning: instance {instance} could not be removed; run `vcoding prune` to retry");
    }
    Ok(())
}

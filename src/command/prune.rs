use anyhow::{Result, bail};

use crate::spinner;

pub fn run() -> Result<()> {
    let manager = super::manager()?;
    let report = spinner::with_spinner("Looking for orphaned instances", || manager.prune())?;

    if report.removed.is_empty() && report.failed.is_empty() {
        println!("No orphaned instances");
        return Ok(());
    }
    for name in &report.removed {
        println!("Removed {name}");
    }
    if !report.failed.is_empty() {
        bail!("could not remove: {}", report.failed.join(", "));
    }
    Ok(())
}

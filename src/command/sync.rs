use anyhow::Result;

use crate::cli::Target;
use crate::spinner;

pub fn push(target: &Target, paths: &[String]) -> Result<()> {
    let manager = super::manager()?;
    let target = super::resolve_target(target, &manager)?;
    let selected = (!paths.is_empty()).then_some(paths);
    let report = spinner::with_spinner("Pushing to the instance", || {
        manager.sync_to(&target, selected)
    })?;
    println!(
        "Pushed {} entries ({} files)",
        report.pushed.len(),
        report.staged_files
    );
    Ok(())
}

pub fn pull(target: &Target, paths: &[String]) -> Result<()> {
    let manager = super::manager()?;
    let target = super::resolve_target(target, &manager)?;
    let report = spinner::with_spinner("Pulling from the instance", || {
        manager.sync_from(&target, paths)
    })?;
    for path in &report.written {
        println!("  {}", path.display());
    }
    println!("Wrote {} paths", report.written.len());
    Ok(())
}

use anyhow::Result;

use crate::cli::Target;

pub fn run(target: &Target, tail: usize) -> Result<()> {
    let manager = super::manager()?;
    let target = super::resolve_target(target, &manager)?;
    print!("{}", manager.logs(&target, tail)?);
    Ok(())
}

use anyhow::Result;
use tabled::{
    Table, Tabled,
    settings::{Padding, Style, object::Columns},
};

use crate::cli::Target;

#[derive(Tabled)]
struct CheckpointRow {
    #[tabled(rename = "#")]
    seq: u32,
    #[tabled(rename = "COMMIT")]
    commit: String,
    #[tabled(rename = "LABEL")]
    label: String,
    #[tabled(rename = "AGE")]
    age: String,
}

fn age(created_at: u64, now: u64) -> String {
    let secs = now.saturating_sub(created_at);
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3599 => format!("{}m", secs / 60),
        3600..=86399 => format!("{}h", secs / 3600),
        _ => format!("{}d", secs / 86400),
    }
}

pub fn checkpoint(target: &Target, message: Option<&str>) -> Result<()> {
    let manager = super::manager()?;
    let target = super::resolve_target(target, &manager)?;
    let checkpoint = manager.checkpoint(&target, message)?;
    println!("Checkpoint #{} {} {}", checkpoint.seq, checkpoint.short_commit(), checkpoint.label);
    Ok(())
}

pub fn history(target: &Target, json: bool) -> Result<()> {
    let manager = super::manager()?;
    let target = super::resolve_target(target, &manager)?;
    let history = manager.history(&target)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&history)?);
        return Ok(());
    }
    if history.is_empty() {
        println!("No checkpoints");
        return Ok(());
    }
    let now = vcoding::workspace::now_secs();
    let rows: Vec<CheckpointRow> = history
        .iter()
        .map(|c| CheckpointRow {
            seq: c.seq,
            commit: c.short_commit().to_string(),
            label: c.label.to_string(),
            age: age(c.created_at, now),
        })
        .collect();
    let mut table = Table::new(rows);
    table
        .with(Style::blank())
        .modify(Columns::new(0..4), Padding::new(0, 1, 0, 0));
    println!("{table}");
    Ok(())
}

pub fn rollback(target: &Target, checkpoint: &str) -> Result<()> {
    let manager = super::manager()?;
    let target = super::resolve_target(target, &manager)?;
    let report = manager.rollback(&target, checkpoint)?;
    println!(
        "Restored #{} ({}) as checkpoint #{}; {} entries re-pushed",
        report.target.seq,
        report.target.short_commit(),
        report.checkpoint.seq,
        report.resynced.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::age;

    #[test]
    fn ages_use_the_largest_whole_unit() {
        assert_eq!(age(100, 130), "30s");
        assert_eq!(age(0, 7200), "2h");
        assert_eq!(age(500, 100), "0s");
    }
}

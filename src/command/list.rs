use anyhow::Result;
use tabled::{
    Table, Tabled,
    settings::{Padding, Style, object::Columns},
};

use vcoding::tools::WorkspaceSummary;

#[derive(Tabled)]
struct WorkspaceRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "INSTANCE")]
    instance: String,
    #[tabled(rename = "CHECKPOINTS")]
    checkpoints: usize,
    #[tabled(rename = "PROJECT")]
    project: String,
}

pub fn run(running: bool, json: bool) -> Result<()> {
    let manager = super::manager()?;
    let records = manager.list(running)?;

    if json {
        let summaries: Vec<WorkspaceSummary> = records.iter().map(WorkspaceSummary::from).collect();
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No workspaces found");
        return Ok(());
    }

    let rows: Vec<WorkspaceRow> = records
        .iter()
        .map(|record| WorkspaceRow {
            name: record.name.clone(),
            state: record.state.to_string(),
            instance: record
                .container
                .as_ref()
                .map(|c| format!("{} ({})", c.name, c.status))
                .unwrap_or_else(|| "-".to_string()),
            checkpoints: record.checkpoints.len(),
            project: record.project_path.display().to_string(),
        })
        .collect();

    let mut table = Table::new(rows);
    table
        .with(Style::blank())
        .modify(Columns::new(0..5), Padding::new(0, 1, 0, 0));
    println!("{table}");
    Ok(())
}

use std::path::Path;

use anyhow::Context;
use dvops_core::orchestrator::{load_rows, BatchRow, RowAction, RowError};
use serde::Serialize;

use crate::output::{print_json, print_table};

#[derive(Serialize)]
struct CheckedRow {
    row: usize,
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    entity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    action: Option<String>,
    detail: String,
}

impl CheckedRow {
    fn from_result(index: usize, result: Result<BatchRow, RowError>) -> Self {
        match result {
            Ok(row) => {
                let (action, detail) = match &row.action {
                    RowAction::Merge { duplicates, .. } => {
                        let keys: Vec<String> = duplicates.iter().map(ToString::to_string).collect();
                        ("merge", format!("{} <- {}", row.target, keys.join(", ")))
                    }
                    RowAction::Update { fields } => {
                        let names: Vec<&str> = fields.keys().map(String::as_str).collect();
                        ("update", format!("{}: {}", row.target, names.join(", ")))
                    }
                    RowAction::Create { fields } => {
                        let names: Vec<&str> = fields.keys().map(String::as_str).collect();
                        ("create", names.join(", "))
                    }
                };
                Self {
                    row: index,
                    valid: true,
                    entity: Some(row.entity.name.clone()),
                    action: Some(action.to_string()),
                    detail,
                }
            }
            Err(e) => Self {
                row: index,
                valid: false,
                entity: None,
                action: None,
                detail: e.to_string(),
            },
        }
    }
}

/// Validate every row without contacting Dataverse.
pub fn run(config_path: Option<&Path>, rows: &Path, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(config_path)?;
    let catalog = config.catalog().context("invalid entities in config")?;
    let inputs =
        load_rows(rows).with_context(|| format!("failed to read rows from {}", rows.display()))?;

    let checked: Vec<CheckedRow> = inputs
        .into_iter()
        .enumerate()
        .map(|(index, input)| {
            let result = input
                .map_err(RowError::Malformed)
                .and_then(|raw| raw.validate(index, &catalog, &config.batch.default_entity));
            CheckedRow::from_result(index, result)
        })
        .collect();
    let invalid = checked.iter().filter(|c| !c.valid).count();

    if json {
        print_json(&checked)?;
    } else if checked.is_empty() {
        println!("No rows.");
    } else {
        let table = checked
            .iter()
            .map(|c| {
                vec![
                    c.row.to_string(),
                    if c.valid { "ok" } else { "invalid" }.to_string(),
                    c.entity.clone().unwrap_or_else(|| "-".into()),
                    c.action.clone().unwrap_or_else(|| "-".into()),
                    c.detail.clone(),
                ]
            })
            .collect();
        print_table(&["ROW", "CHECK", "ENTITY", "ACTION", "DETAIL"], table);
    }

    if invalid > 0 {
        anyhow::bail!("{invalid} of {} rows are invalid", checked.len());
    }
    Ok(())
}

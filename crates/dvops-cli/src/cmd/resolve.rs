use std::path::Path;

use anyhow::Context;
use dvops_core::orchestrator::{load_rows, RowAction, RowError};
use dvops_core::retry::CallFailure;
use dvops_core::{ObjectIdResolver, ResolutionQuery, ResolutionResult};
use serde::Serialize;

use crate::output::{print_json, print_table};
use crate::session::Session;

#[derive(Serialize)]
struct Resolution {
    row: usize,
    role: &'static str,
    key: String,
    result: String,
    ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Resolve the keys of every row, read-only.
pub fn run(config_path: Option<&Path>, rows: &Path, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(config_path)?;
    let inputs =
        load_rows(rows).with_context(|| format!("failed to read rows from {}", rows.display()))?;
    let session = Session::connect(&config)?;

    let mut queries = Vec::new();
    let mut roles = Vec::new();
    let mut output = Vec::new();
    for (index, input) in inputs.into_iter().enumerate() {
        let row = match input
            .map_err(RowError::Malformed)
            .and_then(|raw| raw.validate(index, &session.catalog, &config.batch.default_entity))
        {
            Ok(row) => row,
            Err(e) => {
                output.push(Resolution {
                    row: index,
                    role: "-",
                    key: "-".into(),
                    result: "invalid".into(),
                    ids: Vec::new(),
                    error: Some(e.to_string()),
                });
                continue;
            }
        };
        match &row.action {
            RowAction::Merge { duplicates, .. } => {
                queries.push(ResolutionQuery::new(row.entity.clone(), row.target.clone(), index));
                roles.push("master");
                for duplicate in duplicates {
                    queries.push(ResolutionQuery::new(row.entity.clone(), duplicate.clone(), index));
                    roles.push("duplicate");
                }
            }
            RowAction::Update { .. } => {
                queries.push(ResolutionQuery::new(row.entity.clone(), row.target.clone(), index));
                roles.push("target");
            }
            // an unkeyed create has nothing to look up
            RowAction::Create { .. } if row.target.primary.is_empty() => {}
            RowAction::Create { .. } => {
                queries.push(ResolutionQuery::new(row.entity.clone(), row.target.clone(), index));
                roles.push("existing");
            }
        }
    }

    let resolver = ObjectIdResolver::new(session.gateway, session.caller);
    let rt = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    let results = rt.block_on(resolver.resolve_all(&queries));

    let mut fatal = None;
    for ((query, role), result) in queries.iter().zip(roles).zip(results) {
        let mut entry = Resolution {
            row: query.source_row,
            role,
            key: query.key.to_string(),
            result: String::new(),
            ids: Vec::new(),
            error: None,
        };
        match result {
            Ok(resolution) => {
                entry.result = resolution.label().to_string();
                entry.ids = match &resolution {
                    ResolutionResult::Resolved { record } => vec![record.id.to_string()],
                    ResolutionResult::Ambiguous { candidates } => {
                        candidates.iter().map(ToString::to_string).collect()
                    }
                    ResolutionResult::NotFound => Vec::new(),
                };
            }
            Err(failure) => {
                entry.result = "error".into();
                entry.error = Some(failure.detail());
                if let CallFailure::Fatal(e) = failure {
                    fatal = Some(e);
                }
            }
        }
        output.push(entry);
    }
    output.sort_by_key(|r| r.row);

    if json {
        print_json(&output)?;
    } else {
        let table = output
            .iter()
            .map(|r| {
                let detail = match &r.error {
                    Some(e) => e.clone(),
                    None if r.ids.is_empty() => "-".into(),
                    None => r.ids.join(", "),
                };
                vec![
                    r.row.to_string(),
                    r.role.to_string(),
                    r.key.clone(),
                    r.result.clone(),
                    detail,
                ]
            })
            .collect();
        print_table(&["ROW", "ROLE", "KEY", "RESULT", "IDS"], table);
    }

    if let Some(e) = fatal {
        return Err(e).context("resolution stopped: no access token");
    }
    Ok(())
}

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::Args;
use dvops_core::orchestrator::{load_rows, RawRow, RowInput, RunState};
use dvops_core::timeline::{self, DEACTIVATION_SIGNATURE};
use dvops_core::{paths, report, BatchOptions, Orchestrator, RunJournal};
use tokio_util::sync::CancellationToken;

use crate::output::{print_json, print_table};
use crate::session::Session;

#[derive(Args)]
pub struct BatchArgs {
    /// Row file (YAML or JSON)
    pub rows: PathBuf,

    /// Rows in flight at once (default: batch.workers)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Report path (default: .dvops/runs/<run-id>.json)
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,
}

pub enum Operation {
    Merge,
    Update,
    Create,
    Deactivate { reason: String, performed_by: String },
    Reactivate,
}

impl Operation {
    fn name(&self) -> &'static str {
        match self {
            Operation::Merge => "merge",
            Operation::Update => "update",
            Operation::Create => "create",
            Operation::Deactivate { .. } => "deactivate",
            Operation::Reactivate => "reactivate",
        }
    }

    /// Shape a parsed row for this operation. Rows that don't fit are turned
    /// into parse failures so the run quarantines them.
    fn prepare(&self, input: RowInput, default_entity: &str) -> RowInput {
        let mut row = input?;
        let has_duplicate = row.has_duplicate();

        match self {
            Operation::Merge => {
                if row.fields.is_some() {
                    return Err("merge rows take a duplicate, not fields".into());
                }
            }
            Operation::Update => {
                if has_duplicate {
                    return Err("update rows take fields, not a duplicate".into());
                }
            }
            Operation::Create => {
                if row.has_target() || has_duplicate {
                    return Err("create rows take fields only; the key goes in fields".into());
                }
                row.create = Some(true);
            }
            Operation::Deactivate {
                reason,
                performed_by,
            } => {
                state_change_row(&row, has_duplicate, "deactivate")?;
                row.fields = Some(timeline::deactivate_fields());
                if row.note_body.is_none() {
                    let entity = row.entity.clone().unwrap_or_else(|| default_entity.to_string());
                    let note = timeline::deactivation_note(&entity, reason, performed_by, Utc::now());
                    row.note_subject = Some(note.subject);
                    row.note_body = Some(note.body);
                }
            }
            Operation::Reactivate => {
                state_change_row(&row, has_duplicate, "reactivate")?;
                row.fields = Some(timeline::reactivate_fields());
                if row.retract_note.is_none() {
                    row.retract_note = Some(DEACTIVATION_SIGNATURE.to_string());
                }
            }
        }
        Ok(row)
    }
}

fn state_change_row(row: &RawRow, has_duplicate: bool, verb: &str) -> Result<(), String> {
    if has_duplicate {
        return Err(format!("{verb} rows name a target only, not a duplicate"));
    }
    if row.fields.is_some() {
        return Err(format!("{verb} rows set the state fields themselves; remove fields"));
    }
    Ok(())
}

pub fn run(
    config_path: Option<&Path>,
    operation: Operation,
    args: BatchArgs,
    json: bool,
) -> anyhow::Result<()> {
    let config = super::load_config(config_path)?;
    let rows = load_rows(&args.rows)
        .with_context(|| format!("failed to read rows from {}", args.rows.display()))?;
    let rows: Vec<RowInput> = rows
        .into_iter()
        .map(|row| operation.prepare(row, &config.batch.default_entity))
        .collect();

    let session = Session::connect(&config)?;
    let journal = RunJournal::open(&config.batch.journal)
        .with_context(|| format!("failed to open journal {}", config.batch.journal.display()))?;

    let options = BatchOptions {
        operation: operation.name().to_string(),
        workers: args.workers.unwrap_or(config.batch.workers),
        default_entity: config.batch.default_entity.clone(),
        merge_notes: config.batch.merge_notes,
    };
    let orchestrator = Orchestrator::new(session.gateway, session.caller, session.catalog, options)
        .with_journal(Arc::new(journal));

    let rt = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    let run = rt.block_on(async {
        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, finishing rows in flight");
                on_signal.cancel();
            }
        });
        orchestrator.run(rows, cancel).await
    });

    let report_path = args
        .output
        .unwrap_or_else(|| paths::run_report_path(Path::new("."), run.id));
    report::write_json(&run, &report_path)
        .with_context(|| format!("failed to write report {}", report_path.display()))?;

    if json {
        print_json(&run)?;
    } else {
        print_table(&report::ROW_HEADERS, report::rows_table(&run));
        println!();
        println!("Run {}: {}", run.id, report::summary(&run));
        println!("Report: {}", report_path.display());
    }

    if let RunState::Aborted { detail, .. } = &run.state {
        anyhow::bail!("run aborted: {detail}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(key: &str) -> RawRow {
        RawRow {
            target: Some(key.into()),
            ..Default::default()
        }
    }

    #[test]
    fn deactivate_adds_state_fields_and_note() {
        let op = Operation::Deactivate {
            reason: "closed".into(),
            performed_by: "ops".into(),
        };
        let row = op.prepare(Ok(target("BUS-1")), "account").unwrap();
        let fields = row.fields.unwrap();
        assert_eq!(fields["statecode"], 1);
        assert_eq!(fields["statuscode"], 2);
        let body = row.note_body.unwrap();
        assert!(body.contains("This account was deactivated on "));
        assert!(body.contains("Reason: closed"));
    }

    #[test]
    fn reactivate_retracts_deactivation_note() {
        let row = Operation::Reactivate.prepare(Ok(target("BUS-1")), "account").unwrap();
        assert_eq!(row.fields.unwrap()["statecode"], 0);
        assert_eq!(row.retract_note.as_deref(), Some(DEACTIVATION_SIGNATURE));
    }

    #[test]
    fn operation_rejects_rows_of_the_other_kind() {
        let mut merge = target("BUS-1");
        merge.duplicate = Some("BUS-2".into());
        assert!(Operation::Update.prepare(Ok(merge.clone()), "account").is_err());
        assert!(Operation::Reactivate.prepare(Ok(merge.clone()), "account").is_err());
        assert!(Operation::Merge.prepare(Ok(merge), "account").is_ok());

        let mut update = target("BUS-1");
        update.fields = Some(timeline::deactivate_fields());
        assert!(Operation::Merge.prepare(Ok(update), "account").is_err());
    }

    #[test]
    fn create_marks_rows_and_rejects_keys() {
        let mut fields = serde_json::Map::new();
        fields.insert("name".into(), serde_json::json!("Acme North"));
        let plain = RawRow {
            fields: Some(fields),
            ..Default::default()
        };
        let row = Operation::Create.prepare(Ok(plain.clone()), "account").unwrap();
        assert_eq!(row.create, Some(true));

        let mut keyed = plain.clone();
        keyed.target = Some("BUS-1".into());
        assert!(Operation::Create.prepare(Ok(keyed), "account").is_err());

        let mut grouped = plain;
        grouped.duplicates = Some(vec!["BUS-2".into()]);
        assert!(Operation::Create.prepare(Ok(grouped), "account").is_err());
    }

    #[test]
    fn update_rejects_duplicate_groups() {
        let mut row = target("BUS-1");
        row.duplicates = Some(vec!["BUS-2".into(), "BUS-3".into()]);
        assert!(Operation::Update.prepare(Ok(row.clone()), "account").is_err());
        assert!(Operation::Merge.prepare(Ok(row), "account").is_ok());
    }

    #[test]
    fn parse_failures_pass_through() {
        let err = Operation::Update.prepare(Err("bad row".into()), "account").unwrap_err();
        assert_eq!(err, "bad row");
    }
}

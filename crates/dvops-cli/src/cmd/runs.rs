use std::path::Path;

use anyhow::Context;
use clap::Subcommand;
use dvops_core::{report, RunJournal};

use crate::output::{print_json, print_table};

#[derive(Subcommand)]
pub enum RunsSubcommand {
    /// List recorded runs, newest first
    List,

    /// Show one run's rows
    Show {
        /// Run id or a unique prefix of it
        id: String,
    },
}

pub fn run(config_path: Option<&Path>, subcmd: RunsSubcommand, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(config_path)?;
    let journal_path = &config.batch.journal;

    if !journal_path.exists() {
        return match subcmd {
            RunsSubcommand::List if json => print_json(&Vec::<()>::new()),
            RunsSubcommand::List => {
                println!("No runs recorded.");
                Ok(())
            }
            RunsSubcommand::Show { id } => anyhow::bail!("run not found: {id}"),
        };
    }

    let journal = RunJournal::open(journal_path)
        .with_context(|| format!("failed to open journal {}", journal_path.display()))?;
    match subcmd {
        RunsSubcommand::List => list(&journal, json),
        RunsSubcommand::Show { id } => show(&journal, &id, json),
    }
}

fn list(journal: &RunJournal, json: bool) -> anyhow::Result<()> {
    let runs = journal.list_runs().context("failed to read runs")?;
    if json {
        let value: Vec<_> = runs
            .iter()
            .map(|run| {
                serde_json::json!({
                    "id": run.id,
                    "operation": run.operation,
                    "started_at": run.started_at,
                    "summary": run.summary(),
                })
            })
            .collect();
        return print_json(&value);
    }
    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }

    let table = runs
        .iter()
        .map(|run| {
            let s = run.summary();
            vec![
                run.id.to_string(),
                run.operation.clone(),
                run.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                s.status,
                s.total.to_string(),
                s.success.to_string(),
                s.failed.to_string(),
                s.skipped.to_string(),
            ]
        })
        .collect();
    print_table(
        &["ID", "OPERATION", "STARTED", "STATUS", "ROWS", "OK", "FAILED", "SKIPPED"],
        table,
    );
    Ok(())
}

fn show(journal: &RunJournal, id: &str, json: bool) -> anyhow::Result<()> {
    let run = journal.find_run(id)?;
    if json {
        return print_json(&run);
    }
    println!("Run {} ({})", run.id, run.operation);
    println!("Started: {}", run.started_at.to_rfc3339());
    print_table(&report::ROW_HEADERS, report::rows_table(&run));
    println!();
    println!("{}", run.summary());
    if let dvops_core::orchestrator::RunState::Aborted { reason, detail } = &run.state {
        println!("Aborted ({reason:?}): {detail}");
    }
    Ok(())
}

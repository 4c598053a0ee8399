//! Durable run journal backed by redb.
//!
//! # Table design
//!
//! `RUNS` uses a 24-byte composite key:
//! ```text
//! [ started_at_ms: u64 big-endian (8 bytes) | run uuid: 16 bytes ]
//! ```
//! so a plain iteration yields runs oldest first and a reversed one newest
//! first. Values are the JSON-encoded [`BatchRun`].
//!
//! `COMPLETED` maps a merge key (see [`merge_key`]) to the id of the run
//! that applied it. A rerun of the same file consults it to
//! skip merges that already happened.

use std::collections::HashSet;
use std::fmt::Display;
use std::path::Path;

use chrono::{DateTime, Utc};
use dataverse_client::RecordId;
use redb::{Database, ReadableTable, TableDefinition};
use uuid::Uuid;

use crate::error::{OpsError, Result};

use super::ledger::BatchRun;

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

const RUNS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("runs");

const COMPLETED: TableDefinition<&str, &str> = TableDefinition::new("completed");

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

fn run_key(ts: DateTime<Utc>, id: Uuid) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = ts.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].copy_from_slice(id.as_bytes());
    key
}

pub fn merge_key(entity: &str, master: RecordId, duplicate: RecordId) -> String {
    format!("{entity}:{master}:{duplicate}")
}

fn journal_err(e: impl Display) -> OpsError {
    OpsError::Journal(e.to_string())
}

// ---------------------------------------------------------------------------
// RunJournal
// ---------------------------------------------------------------------------

pub struct RunJournal {
    db: Database,
}

impl std::fmt::Debug for RunJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunJournal").finish_non_exhaustive()
    }
}

impl RunJournal {
    /// Open or create the journal at `path`, creating parent directories and
    /// both tables as needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(journal_err)?;
        let wt = db.begin_write().map_err(journal_err)?;
        wt.open_table(RUNS).map_err(journal_err)?;
        wt.open_table(COMPLETED).map_err(journal_err)?;
        wt.commit().map_err(journal_err)?;
        Ok(Self { db })
    }

    /// Insert or replace a run record.
    pub fn record_run(&self, run: &BatchRun) -> Result<()> {
        let key = run_key(run.started_at, run.id);
        let value = serde_json::to_vec(run)?;
        let wt = self.db.begin_write().map_err(journal_err)?;
        {
            let mut table = wt.open_table(RUNS).map_err(journal_err)?;
            table
                .insert(key.as_slice(), value.as_slice())
                .map_err(journal_err)?;
        }
        wt.commit().map_err(journal_err)?;
        Ok(())
    }

    /// Remember that `key` was applied by `run_id`. Committed immediately so a
    /// crash mid-run still protects the rows that finished.
    pub fn mark_completed(&self, key: &str, run_id: Uuid) -> Result<()> {
        let run = run_id.to_string();
        let wt = self.db.begin_write().map_err(journal_err)?;
        {
            let mut table = wt.open_table(COMPLETED).map_err(journal_err)?;
            table.insert(key, run.as_str()).map_err(journal_err)?;
        }
        wt.commit().map_err(journal_err)?;
        Ok(())
    }

    pub fn completed_keys(&self) -> Result<HashSet<String>> {
        let rt = self.db.begin_read().map_err(journal_err)?;
        let table = rt.open_table(COMPLETED).map_err(journal_err)?;
        let mut keys = HashSet::new();
        for entry in table.iter().map_err(journal_err)? {
            let (k, _) = entry.map_err(journal_err)?;
            keys.insert(k.value().to_string());
        }
        Ok(keys)
    }

    /// All recorded runs, newest first.
    pub fn list_runs(&self) -> Result<Vec<BatchRun>> {
        let rt = self.db.begin_read().map_err(journal_err)?;
        let table = rt.open_table(RUNS).map_err(journal_err)?;
        let mut runs = Vec::new();
        for entry in table.iter().map_err(journal_err)?.rev() {
            let (_, v) = entry.map_err(journal_err)?;
            runs.push(serde_json::from_slice(v.value())?);
        }
        Ok(runs)
    }

    /// Look a run up by full id or unique id prefix.
    pub fn find_run(&self, prefix: &str) -> Result<BatchRun> {
        let prefix = prefix.trim().to_ascii_lowercase();
        if prefix.is_empty() {
            return Err(OpsError::RunNotFound(prefix));
        }
        let mut matches: Vec<BatchRun> = self
            .list_runs()?
            .into_iter()
            .filter(|r| r.id.to_string().starts_with(&prefix))
            .collect();
        match matches.len() {
            0 => Err(OpsError::RunNotFound(prefix)),
            1 => Ok(matches.remove(0)),
            n => Err(OpsError::RunNotFound(format!(
                "{prefix} is ambiguous ({n} runs match)"
            ))),
        }
    }
}

//! The batch run loop.
//!
//! ```text
//! rows ──▶ validate ──▶ Semaphore(workers) ──▶ JoinSet::spawn(process row)
//!              │                                        │
//!              └─ Failed(InvalidRow) ──┐                │ join_next_with_id
//!                                      ▼                ▼
//!                               OrderedCommit ──▶ BatchRun.rows (input order)
//! ```
//!
//! Every dispatched row yields exactly one outcome, a panicking worker
//! included. A row that shares a record key with an earlier row waits for
//! that row to finish before it starts. A token that cannot be obtained, or
//! cancellation, stops dispatch; rows already in flight finish.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use dataverse_client::{
    AuthError, ErrorKind, Gateway, MergeOptions, RecordId, RecordSummary,
};
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::entity::EntityCatalog;
use crate::paths::validate_logical_name;
use crate::resolver::{NaturalKey, ObjectIdResolver, ResolutionQuery, ResolutionResult};
use crate::retry::{CallFailure, Caller};
use crate::timeline::{attach_note, merge_note, retract_note, NoteSpec};

use super::directive::MergeDirective;
use super::journal::{merge_key, RunJournal};
use super::ledger::{
    AbortReason, BatchRun, FailureReason, OrderedCommit, RowOutcome, SkipReason,
};
use super::row::{BatchRow, RowAction, RowError, RowInput};

#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Label stored on the run (`merge`, `update`, `deactivate`, ...).
    pub operation: String,
    pub workers: usize,
    pub default_entity: String,
    /// Leave a summary note on the master after each merge that has no note
    /// of its own.
    pub merge_notes: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            operation: "merge".into(),
            workers: 4,
            default_entity: "account".into(),
            merge_notes: false,
        }
    }
}

pub struct Orchestrator {
    gateway: Arc<dyn Gateway>,
    caller: Arc<Caller>,
    catalog: EntityCatalog,
    options: BatchOptions,
    journal: Option<Arc<RunJournal>>,
}

impl Orchestrator {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        caller: Arc<Caller>,
        catalog: EntityCatalog,
        options: BatchOptions,
    ) -> Self {
        Self {
            gateway,
            caller,
            catalog,
            options,
            journal: None,
        }
    }

    #[must_use]
    pub fn with_journal(mut self, journal: Arc<RunJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub async fn run(&self, rows: Vec<RowInput>, cancel: CancellationToken) -> BatchRun {
        let mut run = BatchRun::start(&self.options.operation);
        let total = rows.len();
        info!(
            run = %run.id,
            operation = %run.operation,
            rows = total,
            workers = self.options.workers,
            "batch run started"
        );

        if let Err(e) = self.caller.credentials().get_token().await {
            error!(run = %run.id, error = %e, "cannot obtain a token, aborting run");
            run.abort(AbortReason::Auth, e.to_string());
            self.finish(&run);
            return run;
        }

        let prior = match &self.journal {
            Some(journal) => journal.completed_keys().unwrap_or_else(|e| {
                warn!(error = %e, "journal unreadable, prior-run skips disabled");
                HashSet::new()
            }),
            None => HashSet::new(),
        };

        let worker = Arc::new(RowWorker {
            run_id: run.id,
            gateway: self.gateway.clone(),
            caller: self.caller.clone(),
            resolver: ObjectIdResolver::new(self.gateway.clone(), self.caller.clone()),
            journal: self.journal.clone(),
            prior,
            merge_notes: self.options.merge_notes,
        });

        let stop = cancel.child_token();
        let fatal: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let semaphore = Arc::new(Semaphore::new(self.options.workers.max(1)));
        let mut tasks: JoinSet<RowOutcome> = JoinSet::new();
        let mut task_rows: HashMap<tokio::task::Id, usize> = HashMap::new();
        // key -> cancelled once the latest row touching that key has finished
        let mut last_touch: HashMap<String, CancellationToken> = HashMap::new();
        let mut commit = OrderedCommit::default();
        let mut dispatched = 0usize;

        for (index, input) in rows.into_iter().enumerate() {
            if stop.is_cancelled() {
                break;
            }
            let permit = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            dispatched += 1;

            let row = match input
                .map_err(RowError::Malformed)
                .and_then(|raw| raw.validate(index, &self.catalog, &self.options.default_entity))
            {
                Ok(row) => row,
                Err(e) => {
                    warn!(row = index, error = %e, "row quarantined");
                    let outcome = RowOutcome::failed(index, FailureReason::InvalidRow, e.to_string());
                    commit.accept(&mut run, outcome);
                    continue;
                }
            };

            let done = CancellationToken::new();
            let earlier: Vec<CancellationToken> = row
                .lock_keys()
                .into_iter()
                .filter_map(|key| last_touch.insert(key, done.clone()))
                .collect();
            if !earlier.is_empty() {
                debug!(row = index, waits = earlier.len(), "row shares a key with an earlier row");
            }

            let (worker, stop, fatal) = (worker.clone(), stop.clone(), fatal.clone());
            let handle = tasks.spawn(async move {
                let _permit = permit;
                // signals later rows on return and on panic alike
                let _done = done.drop_guard();
                for token in &earlier {
                    token.cancelled().await;
                }
                let outcome = match worker.process(&row).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(row = row.index, error = %e, "credentials lost, stopping dispatch");
                        fatal
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .get_or_insert_with(|| e.to_string());
                        stop.cancel();
                        RowOutcome::failed(row.index, FailureReason::Auth, e.to_string())
                    }
                };
                debug!(row = outcome.row_index, status = %outcome.status, "row finished");
                outcome
            });
            task_rows.insert(handle.id(), index);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            let outcome = match joined {
                Ok((_, outcome)) => outcome,
                Err(e) => {
                    let Some(&index) = task_rows.get(&e.id()) else {
                        error!(error = %e, "unknown row worker failed");
                        continue;
                    };
                    error!(row = index, error = %e, "row worker failed");
                    RowOutcome::failed(index, FailureReason::Internal, format!("row worker failed: {e}"))
                }
            };
            commit.accept(&mut run, outcome);
        }
        commit.flush(&mut run);

        let fatal = fatal.lock().unwrap_or_else(|p| p.into_inner()).take();
        match fatal {
            Some(detail) => run.abort(AbortReason::Auth, detail),
            None if dispatched < total => {
                warn!(run = %run.id, dispatched, total, "run cancelled");
                run.abort(
                    AbortReason::Cancelled,
                    format!("cancelled after {dispatched} of {total} rows"),
                );
            }
            None => run.complete(),
        }
        self.finish(&run);
        run
    }

    fn finish(&self, run: &BatchRun) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.record_run(run) {
                warn!(run = %run.id, error = %e, "failed to record run in journal");
            }
        }
        info!(run = %run.id, summary = %run.summary(), "batch run finished");
    }
}

// ---------------------------------------------------------------------------
// Per-row processing
// ---------------------------------------------------------------------------

/// Why a row stopped early: a finished outcome, or a credential failure that
/// ends the run.
enum Halt {
    Done(RowOutcome),
    Fatal(AuthError),
}

type Step<T> = std::result::Result<T, Halt>;

/// Map a failed call to the row's failure reason; a lost credential is not a
/// row failure.
fn classify_failure(failure: CallFailure) -> Result<(FailureReason, String), AuthError> {
    let reason = match &failure {
        CallFailure::Fatal(e) => return Err(e.clone()),
        CallFailure::RateLimited(_) => FailureReason::RateLimited,
        CallFailure::Unauthorized(_) => FailureReason::Auth,
        CallFailure::Exhausted(_) => FailureReason::Transport,
        CallFailure::Rejected(e) if e.kind == ErrorKind::Conflict => FailureReason::Conflict,
        CallFailure::Rejected(_) => FailureReason::Rejected,
    };
    Ok((reason, failure.detail()))
}

fn halt(index: usize, failure: CallFailure, attempts: u32) -> Halt {
    match classify_failure(failure) {
        Ok((reason, detail)) => Halt::Done(RowOutcome::failed(index, reason, detail).with_attempts(attempts)),
        Err(e) => Halt::Fatal(e),
    }
}

struct RowWorker {
    run_id: Uuid,
    gateway: Arc<dyn Gateway>,
    caller: Arc<Caller>,
    resolver: ObjectIdResolver,
    journal: Option<Arc<RunJournal>>,
    /// Completed keys from earlier runs, read once at run start.
    prior: HashSet<String>,
    merge_notes: bool,
}

impl RowWorker {
    async fn process(&self, row: &BatchRow) -> Result<RowOutcome, AuthError> {
        let step = match &row.action {
            RowAction::Merge { duplicates, options } => self.merge(row, duplicates, options).await,
            RowAction::Update { fields } => self.update(row, fields).await,
            RowAction::Create { fields } => self.create(row, fields).await,
        };
        match step {
            Ok(outcome) | Err(Halt::Done(outcome)) => Ok(outcome),
            Err(Halt::Fatal(e)) => Err(e),
        }
    }

    async fn resolve(
        &self,
        row: &BatchRow,
        key: &NaturalKey,
        role: &str,
        extra_select: Vec<String>,
    ) -> Step<RecordSummary> {
        let mut query = ResolutionQuery::new(row.entity.clone(), key.clone(), row.index);
        query.extra_select = extra_select;
        let result = self
            .resolver
            .resolve(&query)
            .await
            .map_err(|f| halt(row.index, f, 0))?;

        match result {
            ResolutionResult::Resolved { record } => Ok(record),
            ResolutionResult::NotFound => Err(Halt::Done(RowOutcome::skipped(
                row.index,
                SkipReason::NotFound,
                format!("{role} '{key}' matched no {}", row.entity.name),
            ))),
            ResolutionResult::Ambiguous { candidates } => {
                let ids: Vec<String> = candidates.iter().map(ToString::to_string).collect();
                Err(Halt::Done(
                    RowOutcome::skipped(
                        row.index,
                        SkipReason::Ambiguous,
                        format!("{role} '{key}' matched {} records: {}", ids.len(), ids.join(", ")),
                    )
                    .with_targets(candidates),
                ))
            }
        }
    }

    /// Fold each duplicate into the master in turn. Every key must resolve
    /// before anything is merged; after that a failed duplicate does not
    /// stop the rest of the group.
    async fn merge(
        &self,
        row: &BatchRow,
        duplicate_keys: &[NaturalKey],
        options: &MergeOptions,
    ) -> Step<RowOutcome> {
        let index = row.index;
        let master = self.resolve(row, &row.target, "master", Vec::new()).await?;
        let mut duplicates = Vec::with_capacity(duplicate_keys.len());
        for key in duplicate_keys {
            duplicates.push(self.resolve(row, key, "duplicate", Vec::new()).await?);
        }
        let dup_ids: Vec<RecordId> = duplicates.iter().map(|d| d.id).collect();

        let directive = MergeDirective::new(row.entity.clone(), master.id, dup_ids.clone(), options.clone());
        if let Err(e) = directive.validate(&master, &duplicates) {
            return Err(Halt::Done(
                RowOutcome::failed(index, FailureReason::Validation, e.to_string())
                    .with_master(master.id)
                    .with_targets(dup_ids),
            ));
        }

        let mut attempts = 0u32;
        let mut merged = 0usize;
        let mut failure: Option<FailureReason> = None;
        let mut results = Vec::with_capacity(duplicates.len());

        for duplicate in &duplicates {
            let dup_id = duplicate.id;
            let key = merge_key(&row.entity.logical_name, master.id, dup_id);
            if duplicate.is_merged() {
                results.push(format!("duplicate {dup_id} is already merged"));
                continue;
            }
            if self.prior.contains(&key) {
                results.push(format!("{dup_id} was merged into {} by a previous run", master.id));
                continue;
            }

            let (gateway, directive_ref) = (self.gateway.as_ref(), &directive);
            let report = self
                .caller
                .call("merge", move |token| {
                    let request = directive_ref.request(dup_id);
                    async move { gateway.merge(&token, &request).await }
                })
                .await;
            attempts += report.attempts;
            match report.result {
                Ok(()) => {
                    self.mark_completed(&key);
                    merged += 1;
                    results.push(format!("merged {dup_id} into {}", master.id));
                }
                Err(e) => {
                    let (reason, detail) = classify_failure(e).map_err(Halt::Fatal)?;
                    warn!(row = index, duplicate = %dup_id, %detail, "merge failed");
                    failure.get_or_insert(reason);
                    results.push(format!("{dup_id} not merged: {detail}"));
                }
            }
        }

        let mut detail = results.join("; ");
        if merged > 0 {
            let note = row.note.clone().or_else(|| {
                self.merge_notes.then(|| {
                    merge_note(&row.target, duplicate_keys.iter().zip(results.iter().map(String::as_str)))
                })
            });
            if let Some(note) = note {
                self.add_note(row, master.id, &note, &mut detail).await;
            }
        }

        let outcome = match (failure, merged) {
            (Some(reason), _) => RowOutcome::failed(index, reason, detail),
            (None, 0) => RowOutcome::skipped(index, SkipReason::AlreadyMerged, detail),
            (None, _) => RowOutcome::success(index, detail),
        };
        Ok(outcome
            .with_attempts(attempts)
            .with_master(master.id)
            .with_targets(dup_ids))
    }

    async fn update(&self, row: &BatchRow, fields: &Map<String, Value>) -> Step<RowOutcome> {
        let index = row.index;
        // only plain attributes can be read back; binds and annotations cannot
        let readable: Vec<String> = fields
            .keys()
            .filter(|k| validate_logical_name(k).is_ok())
            .cloned()
            .collect();
        let comparable = readable.len() == fields.len();
        let target = self.resolve(row, &row.target, "target", readable).await?;

        if comparable && fields.iter().all(|(k, v)| target.field(k) == Some(v)) {
            let mut detail = format!("{} already holds the requested values", target.id);
            // an earlier run may have updated the record but stopped before
            // the note went away
            if let Some(signature) = &row.retract_note {
                self.retract(row, target.id, signature, &mut detail).await;
            }
            return Err(Halt::Done(
                RowOutcome::skipped(index, SkipReason::AlreadyApplied, detail)
                    .with_targets([target.id]),
            ));
        }

        let (gateway, entity, target_id) = (self.gateway.as_ref(), &row.entity, target.id);
        let report = self
            .caller
            .call("update", move |token| async move {
                gateway.update(&token, entity, target_id, fields).await
            })
            .await;
        let attempts = report.attempts;
        if let Err(failure) = report.result {
            return Err(match halt(index, failure, attempts) {
                Halt::Done(outcome) => Halt::Done(outcome.with_targets([target_id])),
                fatal => fatal,
            });
        }

        let mut detail = format!("updated {target_id} ({} fields)", fields.len());
        if let Some(signature) = &row.retract_note {
            self.retract(row, target_id, signature, &mut detail).await;
        }
        if let Some(note) = &row.note {
            self.add_note(row, target_id, note, &mut detail).await;
        }

        Ok(RowOutcome::success(index, detail)
            .with_attempts(attempts)
            .with_targets([target_id]))
    }

    /// Create a record from `fields`. A keyed row whose key already matches
    /// a record is skipped, so rerunning a file does not create it twice.
    async fn create(&self, row: &BatchRow, fields: &Map<String, Value>) -> Step<RowOutcome> {
        let index = row.index;
        if !row.target.primary.is_empty() {
            let query = ResolutionQuery::new(row.entity.clone(), row.target.clone(), index);
            let existing = self
                .resolver
                .resolve(&query)
                .await
                .map_err(|f| halt(index, f, 0))?;
            let found: Vec<RecordId> = match existing {
                ResolutionResult::Resolved { record } => vec![record.id],
                ResolutionResult::Ambiguous { candidates } => candidates.into_iter().collect(),
                ResolutionResult::NotFound => Vec::new(),
            };
            if !found.is_empty() {
                return Err(Halt::Done(
                    RowOutcome::skipped(
                        index,
                        SkipReason::AlreadyApplied,
                        format!("{} '{}' already exists", row.entity.name, row.target),
                    )
                    .with_targets(found),
                ));
            }
        }

        let body = Value::Object(fields.clone());
        let (gateway, set) = (self.gateway.as_ref(), row.entity.entity_set.as_str());
        let report = self
            .caller
            .call("create", |token| {
                let body = &body;
                async move { gateway.create(&token, set, body).await }
            })
            .await;
        let attempts = report.attempts;
        let created = report.result.map_err(|f| halt(index, f, attempts))?;

        let Some(id) = created else {
            return Ok(RowOutcome::success(index, "created; the service returned no id")
                .with_attempts(attempts));
        };
        let mut detail = format!("created {id}");
        if let Some(note) = &row.note {
            self.add_note(row, id, note, &mut detail).await;
        }
        Ok(RowOutcome::success(index, detail)
            .with_attempts(attempts)
            .with_targets([id]))
    }

    async fn retract(&self, row: &BatchRow, target: RecordId, signature: &str, detail: &mut String) {
        match retract_note(&self.caller, self.gateway.as_ref(), target, signature).await {
            Ok(Some(note)) => detail.push_str(&format!("; note {note} retracted")),
            Ok(None) => detail.push_str("; no note to retract"),
            Err(e) => {
                warn!(row = row.index, error = %e.detail(), "note retraction failed");
                detail.push_str(&format!("; note retraction failed: {}", e.detail()));
            }
        }
    }

    async fn add_note(&self, row: &BatchRow, on: RecordId, note: &NoteSpec, detail: &mut String) {
        match attach_note(&self.caller, self.gateway.as_ref(), &row.entity, on, note).await {
            Ok(_) => detail.push_str("; note attached"),
            Err(e) => {
                warn!(row = row.index, error = %e, "note creation failed");
                detail.push_str(&format!("; note failed: {e}"));
            }
        }
    }

    fn mark_completed(&self, key: &str) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.mark_completed(key, self.run_id) {
                warn!(key, error = %e, "failed to journal completed row");
            }
        }
    }
}

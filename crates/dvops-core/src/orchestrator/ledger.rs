//! Per-row outcomes and the run that owns them.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use dataverse_client::RecordId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Row status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    /// Row failed schema validation; nothing was sent.
    InvalidRow,
    /// Merge directive invariant violated.
    Validation,
    RateLimited,
    Auth,
    Transport,
    /// Remote business-rule conflict (already merged, locked, ...).
    Conflict,
    /// Any other non-retryable rejection from the service.
    Rejected,
    /// The worker processing the row panicked.
    Internal,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::InvalidRow => "invalid-row",
            FailureReason::Validation => "validation",
            FailureReason::RateLimited => "rate-limited",
            FailureReason::Auth => "auth",
            FailureReason::Transport => "transport",
            FailureReason::Conflict => "conflict",
            FailureReason::Rejected => "rejected",
            FailureReason::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    NotFound,
    Ambiguous,
    AlreadyMerged,
    /// Target already holds every requested value.
    AlreadyApplied,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::NotFound => "not-found",
            SkipReason::Ambiguous => "ambiguous",
            SkipReason::AlreadyMerged => "already-merged",
            SkipReason::AlreadyApplied => "already-applied",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum RowStatus {
    Success,
    Failed(FailureReason),
    Skipped(SkipReason),
}

impl fmt::Display for RowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowStatus::Success => f.write_str("success"),
            RowStatus::Failed(r) => write!(f, "failed ({})", r.as_str()),
            RowStatus::Skipped(r) => write!(f, "skipped ({})", r.as_str()),
        }
    }
}

// ---------------------------------------------------------------------------
// RowOutcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowOutcome {
    /// Zero-based position in the input file.
    pub row_index: usize,
    #[serde(flatten)]
    pub status: RowStatus,
    pub detail: String,
    /// Times the merge/update call was sent for this row.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_id: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_ids: Vec<RecordId>,
    pub finished_at: DateTime<Utc>,
}

impl RowOutcome {
    fn new(row_index: usize, status: RowStatus, detail: impl Into<String>) -> Self {
        Self {
            row_index,
            status,
            detail: detail.into(),
            attempts: 0,
            master_id: None,
            target_ids: Vec::new(),
            finished_at: Utc::now(),
        }
    }

    pub fn success(row_index: usize, detail: impl Into<String>) -> Self {
        Self::new(row_index, RowStatus::Success, detail)
    }

    pub fn failed(row_index: usize, reason: FailureReason, detail: impl Into<String>) -> Self {
        Self::new(row_index, RowStatus::Failed(reason), detail)
    }

    pub fn skipped(row_index: usize, reason: SkipReason, detail: impl Into<String>) -> Self {
        Self::new(row_index, RowStatus::Skipped(reason), detail)
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_master(mut self, id: RecordId) -> Self {
        self.master_id = Some(id);
        self
    }

    pub fn with_targets(mut self, ids: impl IntoIterator<Item = RecordId>) -> Self {
        self.target_ids = ids.into_iter().collect();
        self
    }

    /// Sends beyond the first.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, RowStatus::Success)
    }
}

// ---------------------------------------------------------------------------
// BatchRun
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    Auth,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Running,
    Completed,
    Aborted { reason: AbortReason, detail: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRun {
    pub id: Uuid,
    pub operation: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub state: RunState,
    #[serde(default)]
    pub rows: Vec<RowOutcome>,
}

impl BatchRun {
    pub fn start(operation: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation: operation.into(),
            started_at: Utc::now(),
            completed_at: None,
            state: RunState::Running,
            rows: Vec::new(),
        }
    }

    pub fn append(&mut self, outcome: RowOutcome) {
        debug_assert!(
            self.rows.last().map_or(true, |last| last.row_index < outcome.row_index),
            "ledger entries must be appended in input order"
        );
        self.rows.push(outcome);
    }

    pub fn complete(&mut self) {
        self.state = RunState::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn abort(&mut self, reason: AbortReason, detail: impl Into<String>) {
        self.state = RunState::Aborted {
            reason,
            detail: detail.into(),
        };
        self.completed_at = Some(Utc::now());
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.state, RunState::Aborted { .. })
    }

    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary {
            status: match &self.state {
                RunState::Running => "running",
                RunState::Completed => "completed",
                RunState::Aborted { .. } => "aborted",
            }
            .to_string(),
            total: self.rows.len(),
            success: 0,
            failed: 0,
            skipped: 0,
        };
        for row in &self.rows {
            match row.status {
                RowStatus::Success => summary.success += 1,
                RowStatus::Failed(_) => summary.failed += 1,
                RowStatus::Skipped(_) => summary.skipped += 1,
            }
        }
        summary
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub status: String,
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} rows, {} succeeded, {} failed, {} skipped",
            self.status, self.total, self.success, self.failed, self.skipped
        )
    }
}

// ---------------------------------------------------------------------------
// OrderedCommit
// ---------------------------------------------------------------------------

/// Reorder buffer between the worker pool and the ledger.
///
/// Outcomes arrive in completion order; each is appended to the run only
/// once every earlier row index has been appended.
#[derive(Debug, Default)]
pub struct OrderedCommit {
    next: usize,
    pending: BTreeMap<usize, RowOutcome>,
}

impl OrderedCommit {
    pub fn accept(&mut self, run: &mut BatchRun, outcome: RowOutcome) {
        self.pending.insert(outcome.row_index, outcome);
        while let Some(outcome) = self.pending.remove(&self.next) {
            run.append(outcome);
            self.next += 1;
        }
    }

    /// Append whatever is still buffered, in index order. Only rows that were
    /// never dispatched leave gaps, and those all sit after the last
    /// dispatched row.
    pub fn flush(self, run: &mut BatchRun) {
        for outcome in self.pending.into_values() {
            run.append(outcome);
        }
    }

    pub fn committed(&self) -> usize {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_order_completion_commits_in_order() {
        let mut run = BatchRun::start("merge");
        let mut commit = OrderedCommit::default();

        commit.accept(&mut run, RowOutcome::success(2, "c"));
        commit.accept(&mut run, RowOutcome::success(1, "b"));
        assert!(run.rows.is_empty(), "nothing commits before row 0");

        commit.accept(&mut run, RowOutcome::success(0, "a"));
        let order: Vec<_> = run.rows.iter().map(|r| r.row_index).collect();
        assert_eq!(order, [0, 1, 2]);
        assert_eq!(commit.committed(), 3);
    }

    #[test]
    fn gaps_are_skipped() {
        let mut run = BatchRun::start("merge");
        let mut commit = OrderedCommit::default();
        commit.accept(&mut run, RowOutcome::success(0, "a"));
        commit.accept(&mut run, RowOutcome::success(3, "d"));
        assert_eq!(run.rows.len(), 1);
        commit.flush(&mut run);
        let order: Vec<_> = run.rows.iter().map(|r| r.row_index).collect();
        assert_eq!(order, [0, 3]);
    }

    #[test]
    fn summary_counts() {
        let mut run = BatchRun::start("update");
        run.append(RowOutcome::success(0, "ok"));
        run.append(RowOutcome::failed(1, FailureReason::Conflict, "already merged"));
        run.append(RowOutcome::skipped(2, SkipReason::NotFound, "no match"));
        run.append(RowOutcome::skipped(3, SkipReason::Ambiguous, "3 matches"));
        run.complete();
        let summary = run.summary();
        assert_eq!(
            summary,
            RunSummary {
                status: "completed".into(),
                total: 4,
                success: 1,
                failed: 1,
                skipped: 2
            }
        );
        assert_eq!(summary.to_string(), "completed: 4 rows, 1 succeeded, 1 failed, 2 skipped");
    }

    #[test]
    fn outcome_json_shape() {
        let outcome = RowOutcome::failed(4, FailureReason::RateLimited, "still throttled").with_attempts(6);
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["reason"], "rate-limited");
        assert_eq!(value["attempts"], 6);
        assert_eq!(outcome.retries(), 5);
        let back: RowOutcome = serde_json::from_value(value).unwrap();
        assert_eq!(back, outcome);
    }

    #[test]
    fn aborted_run_serializes_reason() {
        let mut run = BatchRun::start("merge");
        run.abort(AbortReason::Auth, "invalid_client");
        let value = serde_json::to_value(&run).unwrap();
        assert_eq!(value["state"]["state"], "aborted");
        assert_eq!(value["state"]["reason"], "auth");
        assert!(run.is_aborted());
        assert_eq!(run.summary().status, "aborted");
    }
}

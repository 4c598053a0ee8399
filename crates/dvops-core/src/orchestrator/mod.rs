//! Batch orchestration: typed rows in, an ordered ledger of outcomes out.
//!
//! - [`row`] parses and validates row files.
//! - [`directive`] checks a merge before it is sent.
//! - [`runner`] drives the worker pool and commits outcomes in input order.
//! - [`ledger`] holds the per-row outcomes and the run state.
//! - [`journal`] persists runs and completed rows across invocations.

pub mod directive;
pub mod journal;
pub mod ledger;
pub mod row;
pub mod runner;

pub use directive::{DirectiveError, MergeDirective};
pub use journal::RunJournal;
pub use ledger::{
    AbortReason, BatchRun, FailureReason, OrderedCommit, RowOutcome, RowStatus, RunState,
    RunSummary, SkipReason,
};
pub use row::{load_rows, parse_rows, BatchRow, RawRow, RowAction, RowError, RowInput};
pub use runner::{BatchOptions, Orchestrator};

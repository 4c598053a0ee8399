pub mod attachments;
pub mod config;
pub mod entity;
pub mod error;
pub mod io;
pub mod orchestrator;
pub mod paths;
pub mod report;
pub mod resolver;
pub mod retry;
pub mod timeline;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use entity::EntityCatalog;
pub use error::{OpsError, Result};
pub use orchestrator::{BatchOptions, BatchRun, Orchestrator, RunJournal};
pub use resolver::{NaturalKey, ObjectIdResolver, ResolutionQuery, ResolutionResult};
pub use retry::{CallFailure, Caller, RetryPolicy, ThrottleGate};

use crate::error::{OpsError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const RUNS_DIR: &str = ".dvops/runs";
pub const JOURNAL_FILE: &str = ".dvops/journal.redb";

pub const CONFIG_FILE: &str = "dvops.yaml";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

/// Default location of the JSON report for one run.
pub fn run_report_path(root: &Path, run_id: Uuid) -> PathBuf {
    root.join(RUNS_DIR).join(format!("{run_id}.json"))
}

// ---------------------------------------------------------------------------
// Logical name validation
// ---------------------------------------------------------------------------

static LOGICAL_NAME_RE: OnceLock<Regex> = OnceLock::new();

fn logical_name_re() -> &'static Regex {
    LOGICAL_NAME_RE.get_or_init(|| Regex::new(r"^[a-z_][a-z0-9_]*$").unwrap())
}

/// Dataverse logical and entity-set names end up in URLs and `$filter`
/// expressions unquoted, so only the documented character set is allowed.
pub fn validate_logical_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 128 || !logical_name_re().is_match(name) {
        return Err(OpsError::InvalidLogicalName(name.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

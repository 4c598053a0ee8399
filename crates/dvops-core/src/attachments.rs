//! Downloading files from a record's timeline.
//!
//! Two sources are collected under one directory:
//! ```text
//! <dir>/Notes/<filename>                    annotations with isdocument = true
//! <dir>/Emails/<email subject>/<filename>   activitymimeattachments of emails
//!                                           regarding the record
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use dataverse_client::{EntityDescriptor, Gateway, QueryFilter, RecordId, RecordSummary};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::OpsError;
use crate::io::atomic_write;
use crate::retry::{CallFailure, Caller};

const INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*', '\0'];

/// Longest email subject used as a folder name.
const SUBJECT_CHARS: usize = 120;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AttachmentCounts {
    pub notes: usize,
    pub emails: usize,
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("{}", .0.detail())]
    Call(CallFailure),

    #[error("cannot write {}: {source}", path.display())]
    Write { path: PathBuf, source: OpsError },
}

impl From<CallFailure> for DownloadError {
    fn from(failure: CallFailure) -> Self {
        DownloadError::Call(failure)
    }
}

/// Replace characters no common filesystem accepts and drop trailing dots
/// and spaces. Never returns an empty name.
pub fn safe_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| if INVALID_CHARS.contains(&c) || c.is_control() { '_' } else { c })
        .collect();
    let trimmed = replaced.trim().trim_end_matches(['.', ' ']);
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Download every note file and email attachment on `target` into `dir`.
pub async fn download_timeline(
    caller: &Caller,
    gateway: &dyn Gateway,
    target: RecordId,
    dir: &Path,
) -> Result<AttachmentCounts, DownloadError> {
    let mut counts = AttachmentCounts::default();
    let mut taken = HashSet::new();

    let annotations = EntityDescriptor::annotation();
    let filter = QueryFilter::new()
        .and_eq_bool("isdocument", true)
        .and_eq_id("_objectid_value", target)
        .select(["annotationid", "filename", "mimetype", "documentbody", "createdon"]);
    let notes_dir = dir.join("Notes");
    for note in query(caller, gateway, &annotations, &filter, "find note files").await? {
        let name = file_name(&note, || format!("note_{}.bin", note.id));
        if save(&notes_dir, &name, note.field_str("documentbody"), &mut taken)? {
            counts.notes += 1;
        }
    }

    let emails = EntityDescriptor::email();
    let filter = QueryFilter::new()
        .and_eq_id("_regardingobjectid_value", target)
        .select(["activityid", "subject", "createdon"])
        .order_by_desc("createdon");
    let attachments = EntityDescriptor::email_attachment();
    for email in query(caller, gateway, &emails, &filter, "find emails").await? {
        let folder = match email.field_str("subject").map(str::trim).filter(|s| !s.is_empty()) {
            Some(subject) => safe_filename(subject).chars().take(SUBJECT_CHARS).collect(),
            None => "no_subject".to_string(),
        };
        let email_dir = dir.join("Emails").join(folder);

        let filter = QueryFilter::new()
            .and_eq_id("_objectid_value", email.id)
            .select(["activitymimeattachmentid", "filename", "mimetype", "body"]);
        for file in query(caller, gateway, &attachments, &filter, "find email attachments").await? {
            let name = file_name(&file, || format!("emailatt_{}.bin", file.id));
            if save(&email_dir, &name, file.field_str("body"), &mut taken)? {
                counts.emails += 1;
            }
        }
    }

    debug!(%target, notes = counts.notes, emails = counts.emails, "timeline downloaded");
    Ok(counts)
}

async fn query(
    caller: &Caller,
    gateway: &dyn Gateway,
    entity: &EntityDescriptor,
    filter: &QueryFilter,
    label: &str,
) -> Result<Vec<RecordSummary>, CallFailure> {
    caller
        .call(label, |token| async move { gateway.query(&token, entity, filter).await })
        .await
        .result
}

fn file_name(record: &RecordSummary, fallback: impl FnOnce() -> String) -> String {
    let name = record
        .field_str("filename")
        .filter(|n| !n.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(fallback);
    safe_filename(&name)
}

/// Write one decoded file. Returns false when the record carried no
/// readable body.
fn save(
    dir: &Path,
    name: &str,
    body: Option<&str>,
    taken: &mut HashSet<PathBuf>,
) -> Result<bool, DownloadError> {
    let Some(body) = body.filter(|b| !b.is_empty()) else {
        return Ok(false);
    };
    let bytes = match STANDARD.decode(body) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(file = name, error = %e, "attachment body is not valid base64, skipped");
            return Ok(false);
        }
    };
    let path = unique_path(dir, name, taken);
    atomic_write(&path, &bytes).map_err(|source| DownloadError::Write {
        path: path.clone(),
        source,
    })?;
    Ok(true)
}

/// `name`, or `name (2)`, `name (3)`, ... when an earlier file of this
/// download already took the path.
fn unique_path(dir: &Path, name: &str, taken: &mut HashSet<PathBuf>) -> PathBuf {
    let mut path = dir.join(name);
    let original = Path::new(name);
    let stem = original
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let ext = original.extension().map(|e| e.to_string_lossy().into_owned());

    let mut n = 2;
    while !taken.insert(path.clone()) {
        let candidate = match &ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        path = dir.join(candidate);
        n += 1;
    }
    path
}

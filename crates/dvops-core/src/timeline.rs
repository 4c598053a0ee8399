//! Timeline notes (annotations) attached to records after a batch action.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use dataverse_client::{EntityDescriptor, Gateway, QueryFilter, RecordId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::resolver::NaturalKey;
use crate::retry::{CallFailure, Caller};

pub const DEFAULT_NOTE_SUBJECT: &str = "Batch update";

/// Text every deactivation note contains, used to find it again on
/// reactivation.
pub const DEACTIVATION_SIGNATURE: &str = "was deactivated on ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteSpec {
    pub subject: String,
    pub body: String,
    /// File uploaded with the note. Read when the note is attached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl NoteSpec {
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
            file: None,
        }
    }

    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }
}

/// A file carried by an annotation, base64-encoded the way the Web API
/// expects `documentbody`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteDocument {
    pub filename: String,
    pub mimetype: String,
    pub body: String,
}

impl NoteDocument {
    pub fn from_bytes(filename: impl Into<String>, bytes: &[u8]) -> Self {
        let filename = filename.into();
        let mimetype = mime_guess::from_path(&filename)
            .first_or_octet_stream()
            .to_string();
        Self {
            filename,
            mimetype,
            body: STANDARD.encode(bytes),
        }
    }

    pub async fn load(path: &Path) -> std::io::Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment".to_string());
        Ok(Self::from_bytes(filename, &bytes))
    }
}

#[derive(Debug, Error)]
pub enum NoteError {
    #[error("cannot read note file {}: {source}", path.display())]
    File {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{}", .0.detail())]
    Call(CallFailure),
}

impl From<CallFailure> for NoteError {
    fn from(failure: CallFailure) -> Self {
        NoteError::Call(failure)
    }
}

/// Audit note left on the master after a merge, one line per subordinate
/// with what happened to it.
pub fn merge_note<'a, I>(master: &NaturalKey, subordinates: I) -> NoteSpec
where
    I: IntoIterator<Item = (&'a NaturalKey, &'a str)>,
{
    let mut body = format!("Merge executed\n- Master: {master}");
    for (key, result) in subordinates {
        body.push_str(&format!("\n- Subordinate {key}: {result}"));
    }
    NoteSpec::new("Merge summary", body)
}

/// Note recording why and by whom a record was deactivated.
pub fn deactivation_note(
    entity: &str,
    reason: &str,
    performed_by: &str,
    at: DateTime<Utc>,
) -> NoteSpec {
    NoteSpec::new(
        "Deactivated",
        format!(
            "This {entity} {DEACTIVATION_SIGNATURE}{}.\nReason: {reason}\nPerformed by: {performed_by}",
            at.format("%Y-%m-%d")
        ),
    )
}

/// `statecode`/`statuscode` for an inactive record.
pub fn deactivate_fields() -> Map<String, Value> {
    state_fields(1, 2)
}

/// `statecode`/`statuscode` for an active record.
pub fn reactivate_fields() -> Map<String, Value> {
    state_fields(0, 1)
}

fn state_fields(state: i64, status: i64) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("statecode".into(), Value::from(state));
    fields.insert("statuscode".into(), Value::from(status));
    fields
}

/// Annotation body bound to `target`.
pub fn note_payload(
    entity: &EntityDescriptor,
    target: RecordId,
    note: &NoteSpec,
    document: Option<&NoteDocument>,
) -> Value {
    let mut body = json!({
        "subject": note.subject,
        "notetext": note.body,
    });
    body[format!("objectid_{}@odata.bind", entity.logical_name)] =
        Value::String(entity.bind_path(target));
    if let Some(doc) = document {
        body["isdocument"] = Value::Bool(true);
        body["filename"] = Value::String(doc.filename.clone());
        body["mimetype"] = Value::String(doc.mimetype.clone());
        body["documentbody"] = Value::String(doc.body.clone());
    }
    body
}

pub async fn attach_note(
    caller: &Caller,
    gateway: &dyn Gateway,
    entity: &EntityDescriptor,
    target: RecordId,
    note: &NoteSpec,
) -> Result<Option<RecordId>, NoteError> {
    let document = match &note.file {
        Some(path) => Some(NoteDocument::load(path).await.map_err(|source| NoteError::File {
            path: path.clone(),
            source,
        })?),
        None => None,
    };
    let annotations = EntityDescriptor::annotation();
    let body = note_payload(entity, target, note, document.as_ref());
    let report = caller
        .call("create note", |token| {
            let body = &body;
            let set = annotations.entity_set.as_str();
            async move { gateway.create(&token, set, body).await }
        })
        .await;
    let id = report.result?;
    debug!(%target, note = ?id, "note attached");
    Ok(id)
}

/// Delete the most recent note on `target` whose text contains `signature`.
/// Returns the deleted note's id, or `None` when there was nothing to delete.
pub async fn retract_note(
    caller: &Caller,
    gateway: &dyn Gateway,
    target: RecordId,
    signature: &str,
) -> Result<Option<RecordId>, CallFailure> {
    let annotations = EntityDescriptor::annotation();
    let filter = QueryFilter::new()
        .and_eq_id("_objectid_value", target)
        .and_contains("notetext", signature)
        .select(["annotationid", "subject", "createdon"])
        .order_by_desc("createdon")
        .top(1);

    let found = caller
        .call("find note", |token| {
            let (annotations, filter) = (&annotations, &filter);
            async move { gateway.query(&token, annotations, filter).await }
        })
        .await
        .result?;

    let Some(note_id) = found.first().map(|n| n.id) else {
        return Ok(None);
    };

    caller
        .call("delete note", |token| {
            let set = annotations.entity_set.as_str();
            async move { gateway.delete(&token, set, note_id).await }
        })
        .await
        .result?;
    debug!(%target, note = %note_id, "note retracted");
    Ok(Some(note_id))
}

//! Typed row files.
//!
//! A row file is a YAML (or JSON) list. Each element is parsed on its own so
//! one bad row is quarantined instead of rejecting the whole file.

use std::path::Path;

use dataverse_client::{EntityDescriptor, MergeOptions, RecordId};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::entity::EntityCatalog;
use crate::error::{OpsError, Result};
use crate::resolver::NaturalKey;
use crate::timeline::{NoteSpec, DEFAULT_NOTE_SUBJECT};

/// One element of a row file: parsed, or the reason it could not be.
pub type RowInput = std::result::Result<RawRow, String>;

/// A row as written by the operator. Key columns accept numbers as well as
/// strings, since spreadsheet exports turn numeric ids into numbers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawRow {
    #[serde(default, deserialize_with = "scalar", skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    #[serde(default, deserialize_with = "scalar", skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, deserialize_with = "scalar", skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,
    #[serde(default, deserialize_with = "scalar", skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, deserialize_with = "scalar", skip_serializing_if = "Option::is_none")]
    pub duplicate: Option<String>,
    #[serde(default, deserialize_with = "scalar", skip_serializing_if = "Option::is_none")]
    pub duplicate_name: Option<String>,
    #[serde(default, deserialize_with = "scalar", skip_serializing_if = "Option::is_none")]
    pub duplicate_id: Option<String>,
    /// Several duplicates folded into the same master, by primary key.
    #[serde(default, deserialize_with = "scalars", skip_serializing_if = "Option::is_none")]
    pub duplicates: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Map<String, Value>>,
    /// Create a new record from `fields` instead of updating one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<bool>,
    #[serde(default, deserialize_with = "scalar", skip_serializing_if = "Option::is_none")]
    pub note_subject: Option<String>,
    #[serde(default, deserialize_with = "scalar", skip_serializing_if = "Option::is_none")]
    pub note_body: Option<String>,
    /// File uploaded with the note.
    #[serde(default, deserialize_with = "scalar", skip_serializing_if = "Option::is_none")]
    pub note_file: Option<String>,
    #[serde(default, deserialize_with = "scalar", skip_serializing_if = "Option::is_none")]
    pub retract_note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parenting_checks: Option<bool>,
}

/// Text of a key cell. Integers keep their digits (YAML already reads `007`
/// as a string); numbers with a fraction or exponent are refused because
/// `1.50` would come back as `1.5`.
fn key_text<E: de::Error>(value: serde_yaml::Value) -> std::result::Result<Option<String>, E> {
    use serde_yaml::Value as Yaml;
    match value {
        Yaml::Null => Ok(None),
        Yaml::String(s) => Ok(Some(s)),
        Yaml::Number(n) if n.is_f64() => Err(E::custom(format!(
            "number {n} would lose its original form; quote the key"
        ))),
        Yaml::Number(n) => Ok(Some(n.to_string())),
        Yaml::Bool(b) => Ok(Some(b.to_string())),
        _ => Err(E::custom("expected a string or number")),
    }
}

fn scalar<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<String>, D::Error> {
    match Option::<serde_yaml::Value>::deserialize(deserializer)? {
        None => Ok(None),
        Some(value) => key_text(value),
    }
}

fn scalars<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<Vec<String>>, D::Error> {
    let Some(items) = Option::<Vec<serde_yaml::Value>>::deserialize(deserializer)? else {
        return Ok(None);
    };
    let mut keys = Vec::with_capacity(items.len());
    for item in items {
        if let Some(key) = key_text::<D::Error>(item)? {
            keys.push(key);
        }
    }
    Ok(Some(keys))
}

fn present(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

// ---------------------------------------------------------------------------
// Validated rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RowError {
    #[error("malformed row: {0}")]
    Malformed(String),

    #[error("unknown entity '{0}'")]
    UnknownEntity(String),

    #[error("missing {0} key: set {0} or {0}_id")]
    MissingKey(&'static str),

    #[error("{field} '{value}' is not a GUID")]
    InvalidId { field: &'static str, value: String },

    #[error("{field} given but entity '{entity}' has no secondary key field")]
    NoSecondaryKey { field: &'static str, entity: String },

    #[error("row has both a duplicate and fields; merges and updates go in separate rows")]
    MergeAndUpdate,

    #[error("row has both duplicate and duplicates; use one of them")]
    DuplicateAndGroup,

    #[error("duplicates is empty")]
    EmptyDuplicates,

    #[error("duplicate '{0}' is listed more than once")]
    RepeatedDuplicate(String),

    #[error("row has neither a duplicate nor fields")]
    NoAction,

    #[error("fields is empty")]
    EmptyFields,

    #[error("create rows take fields only, not target or duplicate columns")]
    CreateWithKey,

    #[error("create rows need fields")]
    CreateWithoutFields,

    #[error("note_subject given without note_body or note_file")]
    NoteWithoutBody,

    #[error("retract_note only applies to update rows")]
    RetractWithoutUpdate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RowAction {
    /// Fold every duplicate into the target, in order.
    Merge {
        duplicates: Vec<NaturalKey>,
        options: MergeOptions,
    },
    Update {
        fields: Map<String, Value>,
    },
    Create {
        fields: Map<String, Value>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchRow {
    pub index: usize,
    pub entity: EntityDescriptor,
    pub target: NaturalKey,
    pub action: RowAction,
    pub note: Option<NoteSpec>,
    pub retract_note: Option<String>,
}

impl BatchRow {
    pub fn is_merge(&self) -> bool {
        matches!(self.action, RowAction::Merge { .. })
    }

    /// Records this row may touch, as `entity:key` strings. Two rows sharing
    /// a key must not run at the same time.
    pub fn lock_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        let mut push = |key: &NaturalKey| {
            let text = match key.record_id {
                Some(id) => format!("id:{id}"),
                None if key.primary.trim().is_empty() => return,
                None => key.primary.trim().to_lowercase(),
            };
            keys.push(format!("{}:{text}", self.entity.logical_name));
        };
        push(&self.target);
        if let RowAction::Merge { duplicates, .. } = &self.action {
            duplicates.iter().for_each(&mut push);
        }
        keys.sort();
        keys.dedup();
        keys
    }
}

impl RawRow {
    pub fn has_target(&self) -> bool {
        [&self.target, &self.target_name, &self.target_id]
            .iter()
            .any(|v| v.as_deref().is_some_and(|s| !s.trim().is_empty()))
    }

    /// Whether any duplicate column, single or grouped, is filled in.
    pub fn has_duplicate(&self) -> bool {
        [&self.duplicate, &self.duplicate_name, &self.duplicate_id]
            .iter()
            .any(|v| v.as_deref().is_some_and(|s| !s.trim().is_empty()))
            || self.duplicates.is_some()
    }

    /// Check the row against the schema and resolve its entity.
    pub fn validate(
        self,
        index: usize,
        catalog: &EntityCatalog,
        default_entity: &str,
    ) -> std::result::Result<BatchRow, RowError> {
        let entity_name = present(self.entity.clone()).unwrap_or_else(|| default_entity.to_string());
        let entity = catalog
            .get(&entity_name)
            .map_err(|_| RowError::UnknownEntity(entity_name.clone()))?
            .clone();

        let (target, action) = if self.create == Some(true) {
            create_action(&self, &entity)?
        } else {
            let target = natural_key(
                "target",
                present(self.target.clone()),
                present(self.target_name.clone()),
                present(self.target_id.clone()),
                &entity,
            )?;
            (target, change_action(&self, &entity)?)
        };

        let note_file = present(self.note_file);
        let note = match (present(self.note_subject), present(self.note_body), note_file) {
            (Some(_), None, None) => return Err(RowError::NoteWithoutBody),
            (None, None, None) => None,
            (subject, body, file) => {
                let mut note = NoteSpec::new(
                    subject.unwrap_or_else(|| DEFAULT_NOTE_SUBJECT.to_string()),
                    body.unwrap_or_default(),
                );
                if let Some(file) = file {
                    note = note.with_file(file);
                }
                Some(note)
            }
        };

        let retract_note = present(self.retract_note);
        if retract_note.is_some() && !matches!(action, RowAction::Update { .. }) {
            return Err(RowError::RetractWithoutUpdate);
        }

        Ok(BatchRow {
            index,
            entity,
            target,
            action,
            note,
            retract_note,
        })
    }
}

/// Merge or update, depending on which columns are filled in.
fn change_action(row: &RawRow, entity: &EntityDescriptor) -> std::result::Result<RowAction, RowError> {
    let single = [&row.duplicate, &row.duplicate_name, &row.duplicate_id]
        .iter()
        .any(|v| v.as_deref().is_some_and(|s| !s.trim().is_empty()));

    match (single, &row.duplicates, &row.fields) {
        (true, Some(_), _) => Err(RowError::DuplicateAndGroup),
        (true, None, Some(_)) | (false, Some(_), Some(_)) => Err(RowError::MergeAndUpdate),
        (false, None, None) => Err(RowError::NoAction),
        (false, None, Some(fields)) if fields.is_empty() => Err(RowError::EmptyFields),
        (false, None, Some(fields)) => Ok(RowAction::Update {
            fields: fields.clone(),
        }),
        (true, None, None) => Ok(RowAction::Merge {
            duplicates: vec![natural_key(
                "duplicate",
                present(row.duplicate.clone()),
                present(row.duplicate_name.clone()),
                present(row.duplicate_id.clone()),
                entity,
            )?],
            options: merge_options(row),
        }),
        (false, Some(group), None) => {
            let mut duplicates: Vec<NaturalKey> = Vec::with_capacity(group.len());
            for key in group.iter().filter_map(|k| present(Some(k.clone()))) {
                if duplicates.iter().any(|d| d.primary.eq_ignore_ascii_case(&key)) {
                    return Err(RowError::RepeatedDuplicate(key));
                }
                duplicates.push(NaturalKey::new(key));
            }
            if duplicates.is_empty() {
                return Err(RowError::EmptyDuplicates);
            }
            Ok(RowAction::Merge {
                duplicates,
                options: merge_options(row),
            })
        }
    }
}

fn merge_options(row: &RawRow) -> MergeOptions {
    MergeOptions {
        perform_parenting_checks: row.parenting_checks.unwrap_or(false),
        ..Default::default()
    }
}

/// A create row has no target; its key, if any, comes from the entity's key
/// field among `fields` and is used to find a record created earlier.
fn create_action(
    row: &RawRow,
    entity: &EntityDescriptor,
) -> std::result::Result<(NaturalKey, RowAction), RowError> {
    if row.has_target() || row.has_duplicate() {
        return Err(RowError::CreateWithKey);
    }
    let fields = match &row.fields {
        None => return Err(RowError::CreateWithoutFields),
        Some(fields) if fields.is_empty() => return Err(RowError::EmptyFields),
        Some(fields) => fields.clone(),
    };
    let key = match fields.get(&entity.key_field) {
        Some(Value::String(s)) if !s.trim().is_empty() => NaturalKey::new(s.trim()),
        Some(Value::Number(n)) => NaturalKey::new(n.to_string()),
        _ => NaturalKey::default(),
    };
    Ok((key, RowAction::Create { fields }))
}

fn natural_key(
    role: &'static str,
    primary: Option<String>,
    secondary: Option<String>,
    id: Option<String>,
    entity: &EntityDescriptor,
) -> std::result::Result<NaturalKey, RowError> {
    if secondary.is_some() && entity.secondary_field.is_none() {
        let field = if role == "target" { "target_name" } else { "duplicate_name" };
        return Err(RowError::NoSecondaryKey {
            field,
            entity: entity.name.clone(),
        });
    }

    let record_id = match id {
        Some(raw) => Some(raw.parse::<RecordId>().map_err(|_| RowError::InvalidId {
            field: if role == "target" { "target_id" } else { "duplicate_id" },
            value: raw,
        })?),
        None => None,
    };

    match (primary, record_id) {
        (None, None) => Err(RowError::MissingKey(role)),
        (primary, record_id) => Ok(NaturalKey {
            primary: primary.unwrap_or_default(),
            secondary,
            record_id,
        }),
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Parse a row file body. The document must be a list, or a mapping with a
/// `rows` list.
pub fn parse_rows(text: &str) -> Result<Vec<RowInput>> {
    use serde_yaml::Value as Yaml;

    let doc: Yaml = serde_yaml::from_str(text)?;
    let items = match doc {
        Yaml::Null => Vec::new(),
        Yaml::Sequence(items) => items,
        Yaml::Mapping(mut map) => match map.remove("rows") {
            Some(Yaml::Sequence(items)) => items,
            _ => {
                return Err(OpsError::InvalidRows(
                    "expected a list of rows or a 'rows:' list".into(),
                ))
            }
        },
        _ => return Err(OpsError::InvalidRows("expected a list of rows".into())),
    };

    Ok(items
        .into_iter()
        .map(|item| serde_yaml::from_value::<RawRow>(item).map_err(|e| e.to_string()))
        .collect())
}

pub fn load_rows(path: &Path) -> Result<Vec<RowInput>> {
    let text = std::fs::read_to_string(path)?;
    parse_rows(&text)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

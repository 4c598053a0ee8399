use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::DataverseError;

// ─── RecordId ─────────────────────────────────────────────────────────────

/// Canonical Dataverse record identifier.
///
/// Accepts the forms operators paste from the UI and from exports:
/// plain, braced (`{...}`) and upper-case GUIDs. Always displays lower-case
/// hyphenated, which is what the Web API emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordId(Uuid);

impl RecordId {
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl FromStr for RecordId {
    type Err = DataverseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let inner = trimmed
            .strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
            .unwrap_or(trimmed);
        Uuid::parse_str(inner)
            .map(RecordId)
            .map_err(|_| DataverseError::InvalidRecordId(s.to_string()))
    }
}

impl TryFrom<String> for RecordId {
    type Error = DataverseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RecordId> for String {
    fn from(id: RecordId) -> Self {
        id.to_string()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

// ─── EntityDescriptor ─────────────────────────────────────────────────────

/// How to address one Dataverse table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    /// Name operators use in row files (`account`, `case`, ...).
    pub name: String,
    /// Dataverse logical name (`account`, `incident`).
    pub logical_name: String,
    /// Web API entity set (`accounts`, `incidents`).
    pub entity_set: String,
    /// Primary key attribute (`accountid`).
    pub id_field: String,
    /// Attribute the natural key is matched against.
    pub key_field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_field: Option<String>,
    #[serde(default)]
    pub mergeable: bool,
}

impl EntityDescriptor {
    pub fn account() -> Self {
        Self::builtin("account", "account", "accounts", "accountnumber", "name")
    }

    pub fn contact() -> Self {
        Self::builtin("contact", "contact", "contacts", "emailaddress1", "fullname")
    }

    pub fn incident() -> Self {
        Self::builtin("incident", "incident", "incidents", "ticketnumber", "title")
    }

    pub fn lead() -> Self {
        Self::builtin("lead", "lead", "leads", "emailaddress1", "fullname")
    }

    /// Timeline notes. Not addressable from row files.
    pub fn annotation() -> Self {
        Self {
            name: "annotation".into(),
            logical_name: "annotation".into(),
            entity_set: "annotations".into(),
            id_field: "annotationid".into(),
            key_field: "subject".into(),
            secondary_field: None,
            mergeable: false,
        }
    }

    /// Email activities. Their primary key is the shared `activityid`.
    pub fn email() -> Self {
        Self {
            name: "email".into(),
            logical_name: "email".into(),
            entity_set: "emails".into(),
            id_field: "activityid".into(),
            key_field: "subject".into(),
            secondary_field: None,
            mergeable: false,
        }
    }

    /// Files attached to an email.
    pub fn email_attachment() -> Self {
        Self {
            name: "email attachment".into(),
            logical_name: "activitymimeattachment".into(),
            entity_set: "activitymimeattachments".into(),
            id_field: "activitymimeattachmentid".into(),
            key_field: "filename".into(),
            secondary_field: None,
            mergeable: false,
        }
    }

    /// The built-in mergeable tables.
    pub fn builtins() -> Vec<Self> {
        vec![
            Self::account(),
            Self::contact(),
            Self::incident(),
            Self::lead(),
        ]
    }

    fn builtin(name: &str, logical: &str, set: &str, key: &str, secondary: &str) -> Self {
        Self {
            name: name.into(),
            logical_name: logical.into(),
            entity_set: set.into(),
            id_field: format!("{logical}id"),
            key_field: key.into(),
            secondary_field: Some(secondary.into()),
            mergeable: true,
        }
    }

    /// `@odata.type` annotation for entity references in action payloads.
    pub fn odata_type(&self) -> String {
        format!("Microsoft.Dynamics.CRM.{}", self.logical_name)
    }

    /// Relative path used in `@odata.bind` values.
    pub fn bind_path(&self, id: RecordId) -> String {
        format!("/{}({})", self.entity_set, id)
    }
}

// ─── RecordSummary ────────────────────────────────────────────────────────

/// One row returned by a query: the id plus whatever attributes were selected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSummary {
    pub id: RecordId,
    pub entity: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl RecordSummary {
    pub fn new(id: RecordId, entity: impl Into<String>) -> Self {
        Self {
            id,
            entity: entity.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// The `merged` attribute Dataverse sets on a subordinate after a merge.
    pub fn is_merged(&self) -> bool {
        matches!(self.fields.get("merged"), Some(Value::Bool(true)))
    }

    pub fn state_code(&self) -> Option<i64> {
        self.fields.get("statecode").and_then(Value::as_i64)
    }
}

// ─── Merge ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeOptions {
    #[serde(default)]
    pub perform_parenting_checks: bool,
    /// Attributes copied onto the master as part of the merge.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub update_content: Map<String, Value>,
}

/// A single `Merge` action call: one subordinate folded into one master.
#[derive(Debug, Clone)]
pub struct MergeRequest<'a> {
    pub entity: &'a EntityDescriptor,
    pub master: RecordId,
    pub duplicate: RecordId,
    pub options: &'a MergeOptions,
}

impl MergeRequest<'_> {
    fn reference(&self, id: RecordId) -> Value {
        let mut obj = Map::new();
        obj.insert("@odata.type".into(), Value::String(self.entity.odata_type()));
        obj.insert(self.entity.id_field.clone(), Value::String(id.to_string()));
        Value::Object(obj)
    }

    /// Body for `POST {webapi}/Merge`.
    pub fn to_body(&self) -> Value {
        let mut body = Map::new();
        body.insert("Target".into(), self.reference(self.master));
        body.insert("Subordinate".into(), self.reference(self.duplicate));
        body.insert(
            "PerformParentingChecks".into(),
            Value::Bool(self.options.perform_parenting_checks),
        );
        if !self.options.update_content.is_empty() {
            let mut content = self.options.update_content.clone();
            content.insert("@odata.type".into(), Value::String(self.entity.odata_type()));
            body.insert("UpdateContent".into(), Value::Object(content));
        }
        Value::Object(body)
    }
}

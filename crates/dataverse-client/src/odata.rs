//! OData query building and response envelopes.

use std::fmt;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::types::RecordId;

/// Quote a string literal for use inside `$filter`.
pub fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Guid(RecordId),
    Bool(bool),
    Int(i64),
}

impl Literal {
    /// Whether a JSON attribute value equals this literal. Strings compare
    /// case-insensitively, as Dataverse does with its default collation.
    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (Literal::Str(s), Value::String(v)) => s.eq_ignore_ascii_case(v),
            (Literal::Guid(id), Value::String(v)) => {
                v.parse::<RecordId>().map(|v| v == *id).unwrap_or(false)
            }
            (Literal::Bool(b), Value::Bool(v)) => b == v,
            (Literal::Int(n), Value::Number(v)) => v.as_i64() == Some(*n),
            _ => false,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Str(s) => write!(f, "'{}'", escape_literal(s)),
            Literal::Guid(id) => write!(f, "{id}"),
            Literal::Bool(b) => write!(f, "{b}"),
            Literal::Int(n) => write!(f, "{n}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    Eq { field: String, value: Literal },
    Contains { field: String, value: String },
}

impl Clause {
    pub fn field(&self) -> &str {
        match self {
            Clause::Eq { field, .. } | Clause::Contains { field, .. } => field,
        }
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Clause::Eq { field, value } => write!(f, "{field} eq {value}"),
            Clause::Contains { field, value } => {
                write!(f, "contains({field},'{}')", escape_literal(value))
            }
        }
    }
}

/// Conjunctive `$filter` plus `$select`, `$orderby` and `$top`.
///
/// Clauses stay structured so in-memory gateways can evaluate them; the wire
/// form comes from [`QueryFilter::query_pairs`], which leaves URL encoding to
/// the HTTP client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryFilter {
    clauses: Vec<Clause>,
    select: Vec<String>,
    order_by: Option<String>,
    top: Option<u32>,
}

impl QueryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new().and_eq(field, value)
    }

    pub fn and_eq(self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.and(Clause::Eq {
            field: field.into(),
            value: Literal::Str(value.into()),
        })
    }

    pub fn and_eq_id(self, field: impl Into<String>, id: RecordId) -> Self {
        self.and(Clause::Eq {
            field: field.into(),
            value: Literal::Guid(id),
        })
    }

    pub fn and_eq_bool(self, field: impl Into<String>, value: bool) -> Self {
        self.and(Clause::Eq {
            field: field.into(),
            value: Literal::Bool(value),
        })
    }

    pub fn and_contains(self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.and(Clause::Contains {
            field: field.into(),
            value: value.into(),
        })
    }

    pub fn and(mut self, clause: Clause) -> Self {
        self.clauses.push(clause);
        self
    }

    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for field in fields {
            let field = field.into();
            if !self.select.contains(&field) {
                self.select.push(field);
            }
        }
        self
    }

    pub fn order_by_desc(mut self, field: &str) -> Self {
        self.order_by = Some(format!("{field} desc"));
        self
    }

    pub fn top(mut self, n: u32) -> Self {
        self.top = Some(n);
        self
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    pub fn selected(&self) -> &[String] {
        &self.select
    }

    pub fn ordering(&self) -> Option<&str> {
        self.order_by.as_deref()
    }

    pub fn limit(&self) -> Option<u32> {
        self.top
    }

    /// The `$filter` expression, or `None` when no clause was added.
    pub fn filter_expr(&self) -> Option<String> {
        if self.clauses.is_empty() {
            return None;
        }
        let parts: Vec<String> = self.clauses.iter().map(ToString::to_string).collect();
        Some(parts.join(" and "))
    }

    /// Query-string pairs in the order Dataverse documents them.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if !self.select.is_empty() {
            pairs.push(("$select", self.select.join(",")));
        }
        if let Some(expr) = self.filter_expr() {
            pairs.push(("$filter", expr));
        }
        if let Some(order) = &self.order_by {
            pairs.push(("$orderby", order.clone()));
        }
        if let Some(top) = self.top {
            pairs.push(("$top", top.to_string()));
        }
        pairs
    }
}

// ─── Response envelopes ───────────────────────────────────────────────────

/// A collection page: `{"value": [...], "@odata.nextLink": "..."}`.
#[derive(Debug, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub value: Vec<Map<String, Value>>,
    #[serde(rename = "@odata.nextLink")]
    pub next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Deserialize)]
pub struct ErrorBody {
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

/// Extract `(code, message)` from an OData error body. Non-JSON bodies
/// (gateway HTML pages, empty 503s) come back as the raw text.
pub fn parse_error_body(body: &str) -> (Option<String>, String) {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => (
            envelope.error.code.filter(|c| !c.is_empty()),
            envelope.error.message,
        ),
        Err(_) => (None, body.trim().chars().take(500).collect()),
    }
}

/// Record id from an `OData-EntityId` header such as
/// `https://org.crm.dynamics.com/api/data/v9.2/annotations(1b2c...)`.
pub fn entity_id_from_header(header: &str) -> Option<RecordId> {
    let open = header.rfind('(')?;
    let close = header[open..].find(')')? + open;
    header[open + 1..close].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const GUID: &str = "0a1b2c3d-4e5f-4a6b-8c7d-9e0f1a2b3c4d";

    #[test]
    fn escapes_single_quotes() {
        let filter = QueryFilter::eq("name", "O'Brien's Bakery");
        assert_eq!(
            filter.filter_expr().unwrap(),
            "name eq 'O''Brien''s Bakery'"
        );
    }

    #[test]
    fn guids_are_unquoted_and_clauses_joined() {
        let id: RecordId = GUID.parse().unwrap();
        let filter = QueryFilter::new()
            .and_eq_id("_objectid_value", id)
            .and_contains("notetext", "deactivated on ");
        assert_eq!(
            filter.filter_expr().unwrap(),
            format!("_objectid_value eq {GUID} and contains(notetext,'deactivated on ')")
        );
    }

    #[test]
    fn bool_clause_is_unquoted() {
        let id: RecordId = GUID.parse().unwrap();
        let filter = QueryFilter::new()
            .and_eq_bool("isdocument", true)
            .and_eq_id("_objectid_value", id);
        assert_eq!(
            filter.filter_expr().unwrap(),
            format!("isdocument eq true and _objectid_value eq {GUID}")
        );
    }

    #[test]
    fn query_pairs_order_and_dedup() {
        let filter = QueryFilter::eq("accountnumber", "BUS-1")
            .select(["accountid", "name"])
            .select(["accountid", "statecode"])
            .order_by_desc("createdon")
            .top(1);
        let pairs = filter.query_pairs();
        assert_eq!(pairs[0], ("$select", "accountid,name,statecode".to_string()));
        assert_eq!(pairs[1], ("$filter", "accountnumber eq 'BUS-1'".to_string()));
        assert_eq!(pairs[2], ("$orderby", "createdon desc".to_string()));
        assert_eq!(pairs[3], ("$top", "1".to_string()));
    }

    #[test]
    fn empty_filter_has_no_filter_pair() {
        assert!(QueryFilter::new().filter_expr().is_none());
        assert!(QueryFilter::new().query_pairs().is_empty());
    }

    #[test]
    fn literal_matching() {
        let id: RecordId = GUID.parse().unwrap();
        assert!(Literal::Str("bus-1".into()).matches(&Value::String("BUS-1".into())));
        assert!(Literal::Guid(id).matches(&Value::String(GUID.to_uppercase())));
        assert!(!Literal::Int(1).matches(&Value::String("1".into())));
    }

    #[test]
    fn error_body_json_and_plain() {
        let (code, message) = parse_error_body(
            r#"{"error":{"code":"0x80072322","message":"Number of requests exceeded the limit"}}"#,
        );
        assert_eq!(code.as_deref(), Some("0x80072322"));
        assert!(message.starts_with("Number of requests"));

        let (code, message) = parse_error_body("<html>Bad Gateway</html>\n");
        assert!(code.is_none());
        assert_eq!(message, "<html>Bad Gateway</html>");
    }

    #[test]
    fn entity_id_header() {
        let header = format!("https://org.crm.dynamics.com/api/data/v9.2/annotations({GUID})");
        assert_eq!(entity_id_from_header(&header).unwrap().to_string(), GUID);
        assert!(entity_id_from_header("https://org/api/data/v9.2/annotations").is_none());
    }
}

//! Natural key → record id resolution.
//!
//! A key either matches exactly one live record or it is reported back to
//! the operator: several matches are `Ambiguous` with every candidate id,
//! never a silent pick of the first.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use dataverse_client::{EntityDescriptor, Gateway, QueryFilter, RecordId, RecordSummary};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::retry::{CallFailure, Caller};

/// What an operator typed to identify a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NaturalKey {
    pub primary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary: Option<String>,
    /// A previously resolved id; when present it is the whole filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<RecordId>,
}

impl NaturalKey {
    pub fn new(primary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            ..Default::default()
        }
    }

    pub fn with_secondary(mut self, secondary: impl Into<String>) -> Self {
        self.secondary = Some(secondary.into());
        self
    }

    pub fn by_id(id: RecordId) -> Self {
        Self {
            record_id: Some(id),
            ..Default::default()
        }
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(id) = self.record_id {
            return write!(f, "id:{id}");
        }
        match &self.secondary {
            Some(secondary) => write!(f, "{} / {}", self.primary, secondary),
            None => f.write_str(&self.primary),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolutionQuery {
    pub entity: EntityDescriptor,
    pub key: NaturalKey,
    pub source_row: usize,
    /// Attributes to fetch on top of the id, key and state fields.
    pub extra_select: Vec<String>,
}

impl ResolutionQuery {
    pub fn new(entity: EntityDescriptor, key: NaturalKey, source_row: usize) -> Self {
        Self {
            entity,
            key,
            source_row,
            extra_select: Vec::new(),
        }
    }

    /// The `$filter`/`$select` sent for this query.
    pub fn filter(&self) -> QueryFilter {
        let entity = &self.entity;
        let mut filter = match self.key.record_id {
            Some(id) => QueryFilter::new().and_eq_id(&entity.id_field, id),
            None => {
                let mut f = QueryFilter::eq(&entity.key_field, self.key.primary.trim());
                if let (Some(value), Some(field)) = (&self.key.secondary, &entity.secondary_field) {
                    f = f.and_eq(field, value.trim());
                }
                f
            }
        };

        filter = filter.select([entity.id_field.as_str(), entity.key_field.as_str(), "statecode"]);
        if let Some(field) = &entity.secondary_field {
            filter = filter.select([field.as_str()]);
        }
        if entity.mergeable {
            filter = filter.select(["merged"]);
        }
        filter.select(self.extra_select.iter().map(String::as_str))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ResolutionResult {
    Resolved { record: RecordSummary },
    Ambiguous { candidates: BTreeSet<RecordId> },
    NotFound,
}

impl ResolutionResult {
    pub fn from_matches(mut matches: Vec<RecordSummary>) -> Self {
        match matches.len() {
            0 => ResolutionResult::NotFound,
            1 => ResolutionResult::Resolved {
                record: matches.remove(0),
            },
            _ => ResolutionResult::Ambiguous {
                candidates: matches.into_iter().map(|r| r.id).collect(),
            },
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ResolutionResult::Resolved { .. } => "resolved",
            ResolutionResult::Ambiguous { .. } => "ambiguous",
            ResolutionResult::NotFound => "not_found",
        }
    }

    pub fn record(&self) -> Option<&RecordSummary> {
        match self {
            ResolutionResult::Resolved { record } => Some(record),
            _ => None,
        }
    }
}

/// Read-only lookups through the gateway, with the shared retry policy.
pub struct ObjectIdResolver {
    gateway: Arc<dyn Gateway>,
    caller: Arc<Caller>,
}

impl ObjectIdResolver {
    pub fn new(gateway: Arc<dyn Gateway>, caller: Arc<Caller>) -> Self {
        Self { gateway, caller }
    }

    pub async fn resolve(&self, query: &ResolutionQuery) -> Result<ResolutionResult, CallFailure> {
        let filter = query.filter();
        let entity = &query.entity;
        let gateway = &self.gateway;

        let report = self
            .caller
            .call("resolve", |token| {
                let filter = &filter;
                async move { gateway.query(&token, entity, filter).await }
            })
            .await;

        let result = ResolutionResult::from_matches(report.result?);
        debug!(
            row = query.source_row,
            entity = %entity.name,
            key = %query.key,
            result = result.label(),
            "resolved"
        );
        Ok(result)
    }

    /// Resolve in input order. Stops at the first fatal failure; other
    /// failures are returned per query.
    pub async fn resolve_all(
        &self,
        queries: &[ResolutionQuery],
    ) -> Vec<Result<ResolutionResult, CallFailure>> {
        let mut results = Vec::with_capacity(queries.len());
        for query in queries {
            let result = self.resolve(query).await;
            let fatal = matches!(result, Err(CallFailure::Fatal(_)));
            results.push(result);
            if fatal {
                break;
            }
        }
        results
    }
}

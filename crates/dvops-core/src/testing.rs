//! In-memory stand-ins for the identity provider and the Web API.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use dataverse_client::odata::entity_id_from_header;
use dataverse_client::{
    AuthError, Clause, Credential, CredentialManager, EntityDescriptor, ErrorKind, Gateway,
    GatewayError, MergeRequest, QueryFilter, RecordId, RecordSummary, TokenSource,
};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::retry::{Caller, RetryPolicy, ThrottleGate};

// ---------------------------------------------------------------------------
// FakeTokenSource
// ---------------------------------------------------------------------------

/// Issues `token-1`, `token-2`, ... and counts fetches.
pub struct FakeTokenSource {
    fetches: AtomicU32,
    fail: bool,
    expires_in: Duration,
    delay: Duration,
}

impl FakeTokenSource {
    pub fn new() -> Self {
        Self {
            fetches: AtomicU32::new(0),
            fail: false,
            expires_in: Duration::from_secs(3600),
            delay: Duration::ZERO,
        }
    }

    /// Rejects every request the way a wrong client secret does.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn with_expires_in(mut self, expires_in: Duration) -> Self {
        self.expires_in = expires_in;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fetches(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenSource for FakeTokenSource {
    async fn fetch(&self) -> Result<Credential, AuthError> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(AuthError::Rejected {
                error: "invalid_client".into(),
                description: "AADSTS7000215: Invalid client secret provided.".into(),
            });
        }
        Ok(Credential::new(
            format!("token-{n}"),
            self.expires_in,
            "https://org.crm.dynamics.com/.default",
        ))
    }
}

// ---------------------------------------------------------------------------
// FakeGateway
// ---------------------------------------------------------------------------

#[derive(Default)]
struct State {
    records: Vec<RecordSummary>,
    query_failures: VecDeque<GatewayError>,
    merge_failures: VecDeque<GatewayError>,
    update_failures: VecDeque<GatewayError>,
    rejected_tokens: HashSet<String>,
    merge_delays: HashMap<RecordId, Duration>,
    merge_panics: HashSet<RecordId>,
    merged: HashSet<RecordId>,
    merges: Vec<(RecordId, RecordId)>,
    merge_calls: usize,
    query_calls: usize,
    updates: Vec<(RecordId, Map<String, Value>)>,
    created: Vec<RecordSummary>,
    deleted: Vec<RecordId>,
}

impl State {
    fn check_token(&self, token: &str) -> Result<(), GatewayError> {
        if self.rejected_tokens.contains(token) {
            return Err(GatewayError::unauthorized("token rejected"));
        }
        Ok(())
    }
}

/// Scriptable [`Gateway`] over a record list.
///
/// Queries evaluate the filter clauses against stored fields. A merge marks
/// the duplicate as merged in the gateway only, so a second merge of the same
/// duplicate fails with an "already merged" conflict while the stored record
/// still looks live to the resolver.
#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<State>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn insert(&self, record: RecordSummary) {
        self.state().records.push(record);
    }

    /// Errors returned by the next queries, in order.
    pub fn fail_queries(&self, errors: Vec<GatewayError>) {
        self.state().query_failures.extend(errors);
    }

    pub fn fail_merges(&self, errors: Vec<GatewayError>) {
        self.state().merge_failures.extend(errors);
    }

    pub fn fail_updates(&self, errors: Vec<GatewayError>) {
        self.state().update_failures.extend(errors);
    }

    /// Answer 401 to every call made with `token`.
    pub fn reject_token(&self, token: &str) {
        self.state().rejected_tokens.insert(token.to_string());
    }

    /// Hold the merge of `duplicate` for `delay` before applying it.
    pub fn delay_merge(&self, duplicate: RecordId, delay: Duration) {
        self.state().merge_delays.insert(duplicate, delay);
    }

    /// Panic inside the merge of `duplicate`.
    pub fn panic_on_merge(&self, duplicate: RecordId) {
        self.state().merge_panics.insert(duplicate);
    }

    /// Applied merges as `(master, duplicate)`.
    pub fn merges(&self) -> Vec<(RecordId, RecordId)> {
        self.state().merges.clone()
    }

    /// Merge calls received, failed ones included.
    pub fn merge_count(&self) -> usize {
        self.state().merge_calls
    }

    pub fn query_count(&self) -> usize {
        self.state().query_calls
    }

    pub fn updates(&self) -> Vec<(RecordId, Map<String, Value>)> {
        self.state().updates.clone()
    }

    pub fn created(&self) -> Vec<RecordSummary> {
        self.state().created.clone()
    }

    pub fn deleted(&self) -> Vec<RecordId> {
        self.state().deleted.clone()
    }
}

fn field_value(record: &RecordSummary, entity: &EntityDescriptor, field: &str) -> Option<Value> {
    if field == entity.id_field {
        return Some(Value::String(record.id.to_string()));
    }
    record.field(field).cloned()
}

fn clause_matches(record: &RecordSummary, entity: &EntityDescriptor, clause: &Clause) -> bool {
    match clause {
        Clause::Eq { field, value } => {
            field_value(record, entity, field).is_some_and(|v| value.matches(&v))
        }
        Clause::Contains { field, value } => record
            .field_str(field)
            .is_some_and(|v| v.to_lowercase().contains(&value.to_lowercase())),
    }
}

fn not_found(id: RecordId) -> GatewayError {
    GatewayError::new(ErrorKind::NotFound, format!("record {id} does not exist")).with_status(404)
}

#[async_trait]
impl Gateway for FakeGateway {
    async fn query(
        &self,
        token: &str,
        entity: &EntityDescriptor,
        filter: &QueryFilter,
    ) -> Result<Vec<RecordSummary>, GatewayError> {
        let mut state = self.state();
        state.query_calls += 1;
        state.check_token(token)?;
        if let Some(err) = state.query_failures.pop_front() {
            return Err(err);
        }

        let mut matches: Vec<RecordSummary> = state
            .records
            .iter()
            .filter(|r| r.entity == entity.logical_name)
            .filter(|r| filter.clauses().iter().all(|c| clause_matches(r, entity, c)))
            .cloned()
            .collect();
        // records are stored in creation order
        if filter.ordering().is_some_and(|o| o.ends_with(" desc")) {
            matches.reverse();
        }
        if let Some(top) = filter.limit() {
            matches.truncate(top as usize);
        }
        Ok(matches)
    }

    async fn merge(&self, token: &str, request: &MergeRequest<'_>) -> Result<(), GatewayError> {
        let delay = {
            let mut state = self.state();
            state.merge_calls += 1;
            state.check_token(token)?;
            if let Some(err) = state.merge_failures.pop_front() {
                return Err(err);
            }
            if state.merge_panics.contains(&request.duplicate) {
                drop(state);
                panic!("merge of {} blew up", request.duplicate);
            }
            state.merge_delays.get(&request.duplicate).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if !state.merged.insert(request.duplicate) {
            return Err(GatewayError::conflict(format!(
                "subordinate {} was already merged",
                request.duplicate
            ))
            .with_status(400));
        }
        state.merges.push((request.master, request.duplicate));
        Ok(())
    }

    async fn update(
        &self,
        token: &str,
        entity: &EntityDescriptor,
        id: RecordId,
        fields: &Map<String, Value>,
    ) -> Result<(), GatewayError> {
        let mut state = self.state();
        state.check_token(token)?;
        if let Some(err) = state.update_failures.pop_front() {
            return Err(err);
        }
        let record = state
            .records
            .iter_mut()
            .find(|r| r.id == id && r.entity == entity.logical_name)
            .ok_or_else(|| not_found(id))?;
        for (k, v) in fields {
            record.fields.insert(k.clone(), v.clone());
        }
        state.updates.push((id, fields.clone()));
        Ok(())
    }

    async fn create(
        &self,
        token: &str,
        entity_set: &str,
        body: &Value,
    ) -> Result<Option<RecordId>, GatewayError> {
        let mut state = self.state();
        state.check_token(token)?;

        let id = RecordId::new(Uuid::new_v4());
        let mut record = match EntityDescriptor::builtins()
            .into_iter()
            .chain([EntityDescriptor::annotation()])
            .find(|e| e.entity_set == entity_set)
        {
            Some(entity) => RecordSummary::new(id, entity.logical_name.clone())
                .with_field(entity.id_field.as_str(), json!(id.to_string())),
            None => RecordSummary::new(id, entity_set),
        };
        if let Some(fields) = body.as_object() {
            for (k, v) in fields {
                match (k.ends_with("@odata.bind"), v.as_str()) {
                    (true, Some(path)) => {
                        let target = entity_id_from_header(path)
                            .map(|t| t.to_string())
                            .unwrap_or_default();
                        record.fields.insert("_objectid_value".into(), json!(target));
                    }
                    _ => {
                        record.fields.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        state.records.push(record.clone());
        state.created.push(record);
        Ok(Some(id))
    }

    async fn delete(&self, token: &str, _entity_set: &str, id: RecordId) -> Result<(), GatewayError> {
        let mut state = self.state();
        state.check_token(token)?;
        let pos = state
            .records
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| not_found(id))?;
        state.records.remove(pos);
        state.deleted.push(id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Millisecond delays so retry tests stay fast.
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        throttle_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    }
}

pub fn caller(source: Arc<dyn TokenSource>) -> Arc<Caller> {
    let credentials = Arc::new(CredentialManager::new(source, Duration::ZERO));
    Arc::new(Caller::new(
        credentials,
        Arc::new(ThrottleGate::new(Duration::ZERO)),
        fast_policy(),
    ))
}

/// A live account with a fresh id.
pub fn account(number: &str, name: &str) -> RecordSummary {
    let id = RecordId::new(Uuid::new_v4());
    RecordSummary::new(id, "account")
        .with_field("accountid", json!(id.to_string()))
        .with_field("accountnumber", json!(number))
        .with_field("name", json!(name))
        .with_field("statecode", json!(0))
}

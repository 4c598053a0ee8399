use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Method, RequestBuilder, Response};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::classify::classify;
use crate::error::{DataverseError, ErrorKind, GatewayError};
use crate::odata::{entity_id_from_header, parse_error_body, Page, QueryFilter};
use crate::types::{EntityDescriptor, MergeRequest, RecordId, RecordSummary};

/// Typed Web API calls. Every call takes the bearer token to use, so the
/// caller decides when to refresh it.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn query(
        &self,
        token: &str,
        entity: &EntityDescriptor,
        filter: &QueryFilter,
    ) -> Result<Vec<RecordSummary>, GatewayError>;

    async fn merge(&self, token: &str, request: &MergeRequest<'_>) -> Result<(), GatewayError>;

    async fn update(
        &self,
        token: &str,
        entity: &EntityDescriptor,
        id: RecordId,
        fields: &Map<String, Value>,
    ) -> Result<(), GatewayError>;

    async fn create(
        &self,
        token: &str,
        entity_set: &str,
        body: &Value,
    ) -> Result<Option<RecordId>, GatewayError>;

    async fn delete(&self, token: &str, entity_set: &str, id: RecordId) -> Result<(), GatewayError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Environment URL, e.g. `https://org.crm.dynamics.com`.
    pub base_uri: String,
    pub api_version: String,
    pub timeout: Duration,
    pub max_page_size: u32,
    pub max_pages: u32,
}

impl GatewayConfig {
    pub fn new(base_uri: impl Into<String>) -> Self {
        Self {
            base_uri: base_uri.into(),
            api_version: "9.2".into(),
            timeout: Duration::from_secs(30),
            max_page_size: 500,
            max_pages: 50,
        }
    }

    pub fn webapi_url(&self) -> String {
        format!(
            "{}/api/data/v{}",
            self.base_uri.trim_end_matches('/'),
            self.api_version.trim_start_matches('v')
        )
    }
}

/// [`Gateway`] over the Dataverse Web API.
pub struct HttpGateway {
    client: reqwest::Client,
    webapi_url: String,
    max_page_size: u32,
    max_pages: u32,
}

impl HttpGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self, DataverseError> {
        if !(config.base_uri.starts_with("https://") || config.base_uri.starts_with("http://")) {
            return Err(DataverseError::Config(format!(
                "base URI '{}' must be an http(s) URL",
                config.base_uri
            )));
        }
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            webapi_url: config.webapi_url(),
            max_page_size: config.max_page_size.max(1),
            max_pages: config.max_pages.max(1),
        })
    }

    pub fn webapi_url(&self) -> &str {
        &self.webapi_url
    }

    fn request(&self, method: Method, url: &str, token: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(token)
            .header(ACCEPT, "application/json")
            .header("OData-MaxVersion", "4.0")
            .header("OData-Version", "4.0")
    }

    async fn send(&self, what: &str, builder: RequestBuilder) -> Result<Response, GatewayError> {
        let resp = builder.send().await.map_err(transport_error)?;
        let status = resp.status();
        debug!(call = what, status = status.as_u16(), "dataverse response");
        if status.is_success() {
            return Ok(resp);
        }
        Err(error_from_response(resp).await)
    }

    fn record_url(&self, entity_set: &str, id: RecordId) -> String {
        format!("{}/{}({})", self.webapi_url, entity_set, id)
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn query(
        &self,
        token: &str,
        entity: &EntityDescriptor,
        filter: &QueryFilter,
    ) -> Result<Vec<RecordSummary>, GatewayError> {
        let prefer = format!("odata.maxpagesize={}", self.max_page_size);
        let first = self
            .request(Method::GET, &format!("{}/{}", self.webapi_url, entity.entity_set), token)
            .header("Prefer", prefer.as_str())
            .query(&filter.query_pairs());

        let mut records = Vec::new();
        let mut next = Some(first);
        let mut pages = 0u32;

        while let Some(builder) = next.take() {
            pages += 1;
            let resp = self.send("query", builder).await?;
            let page: Page = resp
                .json()
                .await
                .map_err(|e| GatewayError::new(ErrorKind::Other, format!("unreadable page: {e}")))?;

            for row in page.value {
                records.push(summary_from_row(entity, row)?);
            }

            match page.next_link {
                Some(link) if pages < self.max_pages => {
                    next = Some(
                        self.request(Method::GET, &link, token)
                            .header("Prefer", prefer.as_str()),
                    );
                }
                Some(_) => {
                    warn!(
                        entity = %entity.entity_set,
                        pages,
                        "page limit reached, remaining results not fetched"
                    );
                }
                None => {}
            }
        }

        debug!(entity = %entity.entity_set, count = records.len(), pages, "query complete");
        Ok(records)
    }

    async fn merge(&self, token: &str, request: &MergeRequest<'_>) -> Result<(), GatewayError> {
        debug!(
            entity = %request.entity.logical_name,
            master = %request.master,
            duplicate = %request.duplicate,
            "merge"
        );
        let url = format!("{}/Merge", self.webapi_url);
        let builder = self
            .request(Method::POST, &url, token)
            .header(CONTENT_TYPE, "application/json")
            .json(&request.to_body());
        self.send("merge", builder).await?;
        Ok(())
    }

    async fn update(
        &self,
        token: &str,
        entity: &EntityDescriptor,
        id: RecordId,
        fields: &Map<String, Value>,
    ) -> Result<(), GatewayError> {
        let url = self.record_url(&entity.entity_set, id);
        let builder = self
            .request(Method::PATCH, &url, token)
            .header(CONTENT_TYPE, "application/json")
            .header("If-Match", "*")
            .json(fields);
        self.send("update", builder).await?;
        Ok(())
    }

    async fn create(
        &self,
        token: &str,
        entity_set: &str,
        body: &Value,
    ) -> Result<Option<RecordId>, GatewayError> {
        let url = format!("{}/{}", self.webapi_url, entity_set);
        let builder = self
            .request(Method::POST, &url, token)
            .header(CONTENT_TYPE, "application/json")
            .header("Prefer", "return=representation")
            .json(body);
        let resp = self.send("create", builder).await?;

        Ok(header_str(resp.headers(), "OData-EntityId").and_then(entity_id_from_header))
    }

    async fn delete(&self, token: &str, entity_set: &str, id: RecordId) -> Result<(), GatewayError> {
        let url = self.record_url(entity_set, id);
        self.send("delete", self.request(Method::DELETE, &url, token))
            .await?;
        Ok(())
    }
}

fn summary_from_row(
    entity: &EntityDescriptor,
    fields: Map<String, Value>,
) -> Result<RecordSummary, GatewayError> {
    let id = fields
        .get(&entity.id_field)
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<RecordId>().ok())
        .ok_or_else(|| {
            GatewayError::new(
                ErrorKind::Other,
                format!("{} row without a readable {}", entity.entity_set, entity.id_field),
            )
        })?;
    Ok(RecordSummary {
        id,
        entity: entity.logical_name.clone(),
        fields,
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn transport_error(e: reqwest::Error) -> GatewayError {
    if e.is_builder() {
        return GatewayError::new(ErrorKind::Other, e.to_string());
    }
    let what = if e.is_timeout() { "timed out" } else { "transport error" };
    GatewayError::transient(format!("{what}: {e}"))
}

async fn error_from_response(resp: Response) -> GatewayError {
    let status = resp.status().as_u16();
    let retry_after = header_str(resp.headers(), RETRY_AFTER.as_str())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = resp.text().await.unwrap_or_default();
    let (code, message) = parse_error_body(&body);
    let err = classify(status, code.as_deref(), &message, retry_after);
    debug!(status, kind = %err.kind, code = ?err.code, "dataverse call failed");
    err
}

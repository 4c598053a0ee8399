//! `dataverse-client` - typed access to the Dataverse Web API.
//!
//! Two halves: a token cache that keeps an OAuth2 client-credentials bearer
//! token fresh for many concurrent callers, and a [`Gateway`] that turns
//! query/merge/update/create/delete calls into Web API requests and every
//! failure into a classified [`GatewayError`].
//!
//! # Architecture
//!
//! ```text
//! ClientCredentials
//!     │
//!     ▼
//! ClientCredentialsSource ← POST {authority}/oauth2/v2.0/token
//!     │                     retries transport failures, not rejections
//!     ▼
//! CredentialManager       ← RwLock'd cache + single-flight refresh
//!     │                     get_token / force_refresh / invalidate
//!     ▼  bearer token
//! HttpGateway             ← reqwest client, OData headers, nextLink paging
//!     │
//!     ▼
//! classify()              ← status + Dataverse error code → ErrorKind
//! ```
//!
//! Retry decisions are left to the caller: the gateway reports whether a
//! failure is retryable, it never retries on its own.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use dataverse_client::*;
//!
//! let creds = ClientCredentials { /* tenant, client id, secret, resource */ };
//! let source = ClientCredentialsSource::new(reqwest::Client::new(), creds);
//! let tokens = CredentialManager::new(Arc::new(source), Duration::from_secs(180));
//! let gateway = HttpGateway::new(&GatewayConfig::new("https://org.crm.dynamics.com"))?;
//!
//! let token = tokens.get_token().await?;
//! let hits = gateway
//!     .query(&token, &EntityDescriptor::account(), &QueryFilter::eq("accountnumber", "BUS-1"))
//!     .await?;
//! ```

pub mod auth;
pub mod classify;
pub mod error;
pub mod gateway;
pub mod odata;
pub mod types;

#[cfg(test)]
mod tests;

pub use auth::{ClientCredentials, ClientCredentialsSource, Credential, CredentialManager, TokenSource};
pub use error::{AuthError, DataverseError, ErrorKind, GatewayError};
pub use gateway::{Gateway, GatewayConfig, HttpGateway};
pub use odata::{Clause, Literal, QueryFilter};
pub use types::{EntityDescriptor, MergeOptions, MergeRequest, RecordId, RecordSummary};

/// Convenience `Result` alias for this crate.
pub type Result<T> = std::result::Result<T, DataverseError>;

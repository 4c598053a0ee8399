use thiserror::Error;

#[derive(Debug, Error)]
pub enum OpsError {
    #[error("config file not found: {0}")]
    NotConfigured(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid row file: {0}")]
    InvalidRows(String),

    #[error("unknown entity '{0}'")]
    UnknownEntity(String),

    #[error("invalid logical name '{0}': must match ^[a-z_][a-z0-9_]*$")]
    InvalidLogicalName(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("journal error: {0}")]
    Journal(String),

    #[error(transparent)]
    Auth(#[from] dataverse_client::AuthError),

    #[error(transparent)]
    Dataverse(#[from] dataverse_client::DataverseError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OpsError>;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dataverse_client::{ClientCredentialsSource, CredentialManager, HttpGateway};
use dvops_core::{Caller, Config, EntityCatalog, ThrottleGate};

/// Everything a command needs to talk to one environment.
pub struct Session {
    pub gateway: Arc<HttpGateway>,
    pub caller: Arc<Caller>,
    pub catalog: EntityCatalog,
}

impl Session {
    pub fn connect(config: &Config) -> anyhow::Result<Self> {
        let gateway_config = config.gateway_config().context("dataverse settings incomplete")?;
        let gateway = HttpGateway::new(&gateway_config).context("failed to build Web API client")?;
        let credentials = credential_manager(config, gateway_config.timeout)?;
        let gate = Arc::new(ThrottleGate::new(Duration::from_millis(config.batch.jitter_ms)));
        let caller = Arc::new(Caller::new(credentials, gate, config.retry_policy()));
        let catalog = config.catalog().context("invalid entities in config")?;
        Ok(Self {
            gateway: Arc::new(gateway),
            caller,
            catalog,
        })
    }
}

pub fn credential_manager(config: &Config, timeout: Duration) -> anyhow::Result<Arc<CredentialManager>> {
    let credentials = config.credentials().context("auth settings incomplete")?;
    let http = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("failed to build token client")?;
    let policy = config.retry_policy();
    let source = ClientCredentialsSource::new(http, credentials)
        .with_max_attempts(config.auth.fetch_attempts.max(1))
        .with_base_delay(policy.base_delay)
        .with_max_delay(policy.max_delay);
    Ok(Arc::new(CredentialManager::new(
        Arc::new(source),
        config.safety_margin(),
    )))
}

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;

use crate::output::print_json;
use crate::session::credential_manager;

#[derive(Serialize)]
struct TokenInfo {
    expires_at: chrono::DateTime<chrono::Utc>,
    scope: String,
}

/// Fetch a token to prove the credentials work. The token itself is never
/// printed.
pub fn run(config_path: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(config_path)?;
    let timeout = Duration::from_secs(config.dataverse.timeout_secs.max(1));
    let credentials = credential_manager(&config, timeout)?;

    let rt = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    let credential = rt
        .block_on(async {
            credentials.get_token().await?;
            Ok::<_, dataverse_client::AuthError>(credentials.current().await)
        })
        .context("token request failed")?
        .context("token request returned no credential")?;

    let info = TokenInfo {
        expires_at: credential.expires_at(),
        scope: credential.scope().to_string(),
    };
    if json {
        print_json(&info)?;
    } else {
        println!("Token acquired.");
        println!("  scope:      {}", info.scope);
        println!("  expires at: {}", info.expires_at.to_rfc3339());
    }
    Ok(())
}

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Args;
use dataverse_client::RecordId;
use dvops_core::attachments::{download_timeline, safe_filename, AttachmentCounts, DownloadError};
use dvops_core::retry::CallFailure;
use dvops_core::{NaturalKey, ObjectIdResolver, ResolutionQuery, ResolutionResult};
use serde::Serialize;

use crate::output::{print_json, print_table};
use crate::session::Session;

#[derive(Args)]
pub struct AttachmentArgs {
    /// Record keys, or record ids
    #[arg(required = true)]
    pub keys: Vec<String>,

    /// Entity the keys belong to (default: batch.default_entity)
    #[arg(long)]
    pub entity: Option<String>,

    /// Download directory; each record gets <out>/<key>/Timeline
    #[arg(long, short = 'o', default_value = "downloads")]
    pub out: PathBuf,
}

#[derive(Serialize)]
struct Downloaded {
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    counts: Option<AttachmentCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Downloaded {
    fn failed(key: &str, id: Option<RecordId>, error: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            id: id.map(|i| i.to_string()),
            counts: None,
            dir: None,
            error: Some(error.into()),
        }
    }
}

/// Download note files and email attachments from each record's timeline.
pub fn run(config_path: Option<&Path>, args: AttachmentArgs, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(config_path)?;
    let session = Session::connect(&config)?;
    let entity_name = args.entity.as_deref().unwrap_or(&config.batch.default_entity);
    let entity = session.catalog.get(entity_name).context("unknown entity")?.clone();

    let resolver = ObjectIdResolver::new(session.gateway.clone(), session.caller.clone());
    let rt = tokio::runtime::Runtime::new().context("failed to start async runtime")?;

    let mut output = Vec::with_capacity(args.keys.len());
    let mut fatal = None;
    rt.block_on(async {
        for (index, key) in args.keys.iter().enumerate() {
            let natural = match key.trim().parse::<RecordId>() {
                Ok(id) => NaturalKey::by_id(id),
                Err(_) => NaturalKey::new(key.trim()),
            };
            let query = ResolutionQuery::new(entity.clone(), natural, index);
            let record = match resolver.resolve(&query).await {
                Ok(ResolutionResult::Resolved { record }) => record,
                Ok(ResolutionResult::NotFound) => {
                    output.push(Downloaded::failed(key, None, format!("no {} matches '{key}'", entity.name)));
                    continue;
                }
                Ok(ResolutionResult::Ambiguous { candidates }) => {
                    let ids: Vec<String> = candidates.iter().map(ToString::to_string).collect();
                    output.push(Downloaded::failed(
                        key,
                        None,
                        format!("'{key}' matches {} records: {}", ids.len(), ids.join(", ")),
                    ));
                    continue;
                }
                Err(failure) => {
                    output.push(Downloaded::failed(key, None, failure.detail()));
                    if let CallFailure::Fatal(e) = failure {
                        fatal = Some(e);
                        break;
                    }
                    continue;
                }
            };

            let dir = args.out.join(safe_filename(key.trim())).join("Timeline");
            match download_timeline(&session.caller, session.gateway.as_ref(), record.id, &dir).await {
                Ok(counts) => {
                    tracing::info!(key = %key, notes = counts.notes, emails = counts.emails, "attachments downloaded");
                    output.push(Downloaded {
                        key: key.clone(),
                        id: Some(record.id.to_string()),
                        counts: Some(counts),
                        dir: Some(dir),
                        error: None,
                    });
                }
                Err(e) => {
                    output.push(Downloaded::failed(key, Some(record.id), e.to_string()));
                    if let DownloadError::Call(CallFailure::Fatal(e)) = e {
                        fatal = Some(e);
                        break;
                    }
                }
            }
        }
    });

    if json {
        print_json(&output)?;
    } else {
        let table = output
            .iter()
            .map(|d| {
                let (notes, emails) = d
                    .counts
                    .map(|c| (c.notes.to_string(), c.emails.to_string()))
                    .unwrap_or_else(|| ("-".into(), "-".into()));
                let detail = match (&d.error, &d.dir) {
                    (Some(e), _) => e.clone(),
                    (None, Some(dir)) => dir.display().to_string(),
                    (None, None) => "-".into(),
                };
                vec![d.key.clone(), notes, emails, detail]
            })
            .collect();
        print_table(&["KEY", "NOTES", "EMAILS", "DETAIL"], table);
    }

    if let Some(e) = fatal {
        return Err(e).context("download stopped: no access token");
    }
    let failed = output.iter().filter(|d| d.error.is_some()).count();
    if failed > 0 {
        anyhow::bail!("{failed} of {} records could not be downloaded", output.len());
    }
    Ok(())
}

pub mod attachments;
pub mod batch;
pub mod check;
pub mod config;
pub mod resolve;
pub mod runs;
pub mod token;

use std::path::Path;

use anyhow::Context;
use dvops_core::Config;

pub(crate) fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    Config::load(path).context("failed to load config")
}

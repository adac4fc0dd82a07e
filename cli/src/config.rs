use anyhow::{Context, Result};
use mpp_core::MppConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Json,
    Text,
}

impl OutputFormat {
    pub fn from_flag(json: bool) -> Self {
        if json {
            OutputFormat::Json
        } else {
            OutputFormat::Text
        }
    }
}

/// Load the MPP configuration, or the defaults when no file is given
pub fn load_mpp_config(path: Option<&Path>) -> Result<MppConfig> {
    match path {
        Some(path) => MppConfig::load(path)
            .with_context(|| format!("Failed to load MPP configuration from {}", path.display())),
        None => Ok(MppConfig::default()),
    }
}

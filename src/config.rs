use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{LcaError, Result};
use crate::helper::HelperCommand;
use crate::sheet::MATERIAL_SHEET;

/// Settings of one pipeline instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    pub material_sheet_name: String,
    pub material_skip_rows: usize,
    /// Unused columns left of the `Stream Name` column.
    pub leading_columns: usize,
    /// Worksheet read from the utility workbook; the first one when unset.
    pub utility_sheet_name: Option<String>,
    pub assessment_framework: String,
    pub search_limit: usize,
    /// Prepended to searches for resources taken from nature.
    pub biosphere_search_prefix: String,
    pub helper: Option<HelperCommand>,
    pub call_timeout_secs: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            material_sheet_name: MATERIAL_SHEET.to_string(),
            material_skip_rows: 3,
            leading_columns: 2,
            utility_sheet_name: None,
            assessment_framework: "EF v3.1".to_string(),
            search_limit: 50,
            biosphere_search_prefix: "natural ".to_string(),
            helper: None,
            call_timeout_secs: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|err| {
            LcaError::Configuration(format!("unable to parse the pipeline configuration: {err}"))
        })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        let config = Self::from_json(&data)?;
        if config.search_limit == 0 {
            return Err(LcaError::Configuration(format!(
                "{}: searchLimit must be at least 1",
                path.display()
            )));
        }
        debug!(path = %path.display(), "loaded pipeline configuration");
        Ok(config)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_secs.map(Duration::from_secs)
    }
}

//! Entry points used by the presentation layer.
//!
//! A [`Pipeline`] holds the shared service context and configuration. Runs
//! borrow it immutably, so one instance can serve concurrent requests; the
//! only per-run mutable state is the engine session opened by
//! [`Pipeline::compute_impacts`].

use serde::Serialize;
use tracing::{info, warn};

use crate::aggregate;
use crate::cancel::CallGuard;
use crate::classify::{self, Classifications, ClassifiedFlows};
use crate::config::PipelineConfig;
use crate::errors::{ErrorStage, LcaError, Result};
use crate::model::{FlowDirection, FlowRecord, ImpactCategory, ImpactReport, LcaSetupTable};
use crate::normalize;
use crate::service::{Database, ServiceContext};
use crate::sheet::{self, MaterialTables};
use crate::workbook;

/// Result of an upload: either parsed content or a message for the user.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum UploadOutcome<T> {
    Accepted { content: T },
    Rejected { message: String },
}

impl<T> UploadOutcome<T> {
    pub fn accepted(self) -> Option<T> {
        match self {
            UploadOutcome::Accepted { content } => Some(content),
            UploadOutcome::Rejected { .. } => None,
        }
    }
}

/// Dropdown option for an inventory search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOption {
    pub label: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    context: ServiceContext,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(context: ServiceContext, config: PipelineConfig) -> Self {
        Self { context, config }
    }

    pub fn guard(&self) -> CallGuard {
        match self.config.call_timeout() {
            Some(timeout) => CallGuard::unbounded().with_timeout(timeout),
            None => CallGuard::unbounded(),
        }
    }

    pub fn parse_material_bytes(&self, bytes: &[u8], filename: &str) -> Result<MaterialTables> {
        let raw = workbook::read_sheet(bytes, filename, Some(&self.config.material_sheet_name))?;
        let grid = raw.trimmed(self.config.material_skip_rows, self.config.leading_columns);
        sheet::parse_material_sheet(&grid)
    }

    pub fn parse_utility_bytes(&self, bytes: &[u8], filename: &str) -> Result<Vec<FlowRecord>> {
        let raw = workbook::read_sheet(bytes, filename, self.config.utility_sheet_name.as_deref())?;
        sheet::parse_utility_sheet(&raw)
    }

    /// Decodes and parses an uploaded material workbook.
    ///
    /// Parsing problems become a rejection message naming the sheet and row;
    /// only failures outside parsing are returned as errors.
    pub fn upload_material(
        &self,
        contents: &str,
        filename: &str,
    ) -> Result<UploadOutcome<MaterialTables>> {
        recover_parsing(filename, || {
            let bytes = workbook::decode_upload(contents, filename)?;
            self.parse_material_bytes(&bytes, filename)
        })
    }

    pub fn upload_utility(
        &self,
        contents: &str,
        filename: &str,
    ) -> Result<UploadOutcome<Vec<FlowRecord>>> {
        recover_parsing(filename, || {
            let bytes = workbook::decode_upload(contents, filename)?;
            self.parse_utility_bytes(&bytes, filename)
        })
    }

    pub fn classify(
        &self,
        material: &MaterialTables,
        utilities: &[FlowRecord],
        classifications: &Classifications,
        guard: &CallGuard,
    ) -> Result<ClassifiedFlows> {
        classify::classify(
            material,
            utilities,
            classifications,
            self.context.inventory(),
            guard,
        )
    }

    /// Classifies and normalizes the uploaded flows into a setup table.
    pub fn run_pipeline(
        &self,
        material: &MaterialTables,
        utilities: &[FlowRecord],
        classifications: &Classifications,
        guard: &CallGuard,
    ) -> Result<LcaSetupTable> {
        let flows = self.classify(material, utilities, classifications, guard)?;
        let table = normalize::build_setup_table(&flows)?;
        if !table.skipped.is_empty() {
            info!(streams = ?table.skipped, "streams without an activity are not evaluated");
        }
        Ok(table)
    }

    pub fn compute_impacts(
        &self,
        table: &LcaSetupTable,
        categories: &[ImpactCategory],
        guard: &CallGuard,
    ) -> Result<ImpactReport> {
        aggregate::compute_impacts(table, categories, self.context.engine(), guard)
    }

    pub fn categories(&self) -> Result<Vec<ImpactCategory>> {
        let framework = &self.config.assessment_framework;
        self.context
            .engine()
            .categories(framework)
            .map_err(|reason| LcaError::ServiceUnavailable {
                operation: format!("listing the {framework} impact categories"),
                reason,
            })
    }

    /// Categories of the configured framework whose name is in `names`, in
    /// the order given. Unknown names are an error.
    pub fn select_categories(&self, names: &[String]) -> Result<Vec<ImpactCategory>> {
        let available = self.categories()?;
        names
            .iter()
            .map(|name| {
                available
                    .iter()
                    .find(|category| &category.name == name)
                    .cloned()
                    .ok_or_else(|| {
                        LcaError::Configuration(format!(
                            "'{name}' is not an impact category of {}",
                            self.config.assessment_framework
                        ))
                    })
            })
            .collect()
    }

    pub fn search_technosphere(&self, query: &str) -> Result<Vec<SearchOption>> {
        self.search(Database::Technosphere, query)
    }

    /// Searches biosphere flows. Inputs are resources taken from nature, so
    /// their query gets the configured prefix.
    pub fn search_biosphere(
        &self,
        query: &str,
        direction: FlowDirection,
    ) -> Result<Vec<SearchOption>> {
        match direction {
            FlowDirection::Input if !query.trim().is_empty() => {
                let prefixed = format!("{}{}", self.config.biosphere_search_prefix, query.trim());
                self.search(Database::Biosphere, &prefixed)
            }
            _ => self.search(Database::Biosphere, query),
        }
    }

    fn search(&self, database: Database, query: &str) -> Result<Vec<SearchOption>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let guard = self.guard();
        let candidates = self
            .context
            .inventory()
            .search(database, query.trim(), self.config.search_limit, &guard)
            .map_err(|reason| LcaError::ServiceUnavailable {
                operation: format!("searching the {database} database for '{query}'"),
                reason,
            })?;
        Ok(candidates
            .into_iter()
            .map(|candidate| SearchOption {
                label: candidate.label(),
                value: candidate.id,
            })
            .collect())
    }

    /// `Reference product: <name>` line shown under a chosen activity.
    pub fn reference_product_label(&self, flow: &str, id: &str) -> Result<Option<String>> {
        let info = self
            .context
            .inventory()
            .get_activity(id, &self.guard())
            .map_err(|reason| LcaError::LookupFailure {
                flow: flow.to_string(),
                activity: id.to_string(),
                reason,
            })?;
        Ok(info
            .reference_product
            .map(|product| format!("Reference product: {product}")))
    }
}

fn recover_parsing<T>(
    filename: &str,
    parse: impl FnOnce() -> Result<T>,
) -> Result<UploadOutcome<T>> {
    match parse() {
        Ok(content) => Ok(UploadOutcome::Accepted { content }),
        Err(err) if err.stage() == ErrorStage::Parsing => {
            warn!(filename, error = %err, "rejected upload");
            Ok(UploadOutcome::Rejected {
                message: err.to_string(),
            })
        }
        Err(err) => Err(err),
    }
}

//! Life-cycle impact scoring for process-simulation flow sheets.
//!
//! Material and utility streams exported from a process simulator are
//! classified by the user, mapped to life-cycle inventory activities,
//! expressed per unit of a single reference flow, and scored against the
//! impact categories of an assessment framework.
//!
//! The inventory database and the impact engine are external services
//! reached through the traits in [`service`]. Two backends are provided: an
//! in-process [`Catalog`] and a [`HelperBackend`] that talks to a helper
//! program over JSON lines.

pub mod aggregate;
pub mod cancel;
pub mod catalog;
pub mod classify;
pub mod config;
pub mod export;
pub mod helper;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod service;
pub mod sheet;
pub mod units;
pub mod workbook;

mod errors;

pub use catalog::{Catalog, CatalogActivity};
pub use classify::{Classifications, ClassifiedFlows};
pub use config::PipelineConfig;
pub use errors::{ErrorStage, LcaError, Result};
pub use helper::{HelperBackend, HelperCommand};
pub use model::{
    ActivityRef, CategoryTotal, FlowDirection, FlowRecord, FlowRole, ImpactCategory,
    ImpactReport, ImpactResultRow, InputRole, LcaSetupTable, OutputRole, SetupRecord,
};
pub use pipeline::{Pipeline, SearchOption, UploadOutcome};
pub use service::{ImpactEngine, InventoryService, ServiceContext};
pub use units::{ActivityUnit, SourceUnit};

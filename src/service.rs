//! Contracts of the external inventory database and impact engine.
//!
//! Both services are long-lived and shared read-only between pipeline runs.
//! Engine sessions are the exception: each run opens its own and drops it
//! when the run ends.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cancel::CallGuard;
use crate::model::ImpactCategory;

/// Result of a call into an external service; the error is the service's
/// own description of what went wrong.
pub type ServiceResult<T> = std::result::Result<T, String>;

/// Database a search runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Database {
    Technosphere,
    Biosphere,
}

impl fmt::Display for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Database::Technosphere => "technosphere",
            Database::Biosphere => "biosphere",
        })
    }
}

/// Ranked search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityCandidate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
}

impl ActivityCandidate {
    /// Label shown next to the candidate: location for technosphere
    /// activities, compartment for biosphere flows.
    pub fn label(&self) -> String {
        match (&self.location, self.categories.is_empty()) {
            (Some(location), _) => format!("{}, {}", self.name, location),
            (None, false) => format!("{}, ({})", self.name, self.categories.join(", ")),
            (None, true) => self.name.clone(),
        }
    }
}

/// Declared properties of an inventory activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityInfo {
    pub unit: String,
    #[serde(default)]
    pub reference_product: Option<String>,
    #[serde(default = "default_production_amount")]
    pub production_amount: f64,
}

fn default_production_amount() -> f64 {
    1.0
}

/// Score returned by the engine for the selected method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Score {
    pub value: f64,
    pub unit: String,
}

/// Calls taking a [`CallGuard`] must give up once it is cancelled or its
/// deadline passes, including while waiting on an answer.
pub trait InventoryService: Send + Sync {
    fn search(
        &self,
        database: Database,
        query: &str,
        limit: usize,
        guard: &CallGuard,
    ) -> ServiceResult<Vec<ActivityCandidate>>;

    fn get_activity(&self, id: &str, guard: &CallGuard) -> ServiceResult<ActivityInfo>;
}

pub trait ImpactEngine: Send + Sync {
    /// Impact categories of one assessment framework.
    fn categories(&self, framework: &str) -> ServiceResult<Vec<ImpactCategory>>;

    /// Builds the inventory for `amount` of `activity` and returns a session
    /// owned by the caller. The session stays bound to `guard`.
    fn new_inventory(
        &self,
        activity: &str,
        amount: f64,
        guard: &CallGuard,
    ) -> ServiceResult<Box<dyn EngineSession>>;
}

/// Stateful solver session: one inventory re-solved for successive demands.
pub trait EngineSession: Send {
    /// Replaces the demand with `amount` of `activity` without rebuilding
    /// the technology matrix.
    fn recompute(&mut self, activity: &str, amount: f64) -> ServiceResult<()>;

    fn select_method(&mut self, category: &ImpactCategory) -> ServiceResult<()>;

    fn compute_score(&mut self) -> ServiceResult<Score>;
}

/// Process-wide handles to the external services, injected into pipelines.
#[derive(Clone)]
pub struct ServiceContext {
    inventory: Arc<dyn InventoryService>,
    engine: Arc<dyn ImpactEngine>,
}

impl ServiceContext {
    pub fn new(inventory: Arc<dyn InventoryService>, engine: Arc<dyn ImpactEngine>) -> Self {
        Self { inventory, engine }
    }

    /// Context whose inventory and engine are served by the same backend.
    pub fn shared<B>(backend: Arc<B>) -> Self
    where
        B: InventoryService + ImpactEngine + 'static,
    {
        Self {
            inventory: backend.clone(),
            engine: backend,
        }
    }

    pub fn inventory(&self) -> &dyn InventoryService {
        self.inventory.as_ref()
    }

    pub fn engine(&self) -> &dyn ImpactEngine {
        self.engine.as_ref()
    }
}

impl fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceContext").finish_non_exhaustive()
    }
}

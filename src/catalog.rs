//! In-process inventory and impact backend backed by a JSON catalog.
//!
//! The catalog lists activities with their declared unit and one
//! characterization factor per impact category. Scores are the demanded
//! amount times the factor, which is enough to run the pipeline without a
//! full matrix solver.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cancel::CallGuard;
use crate::errors::{LcaError, Result};
use crate::model::ImpactCategory;
use crate::service::{
    ActivityCandidate, ActivityInfo, Database, EngineSession, ImpactEngine, InventoryService,
    Score, ServiceResult,
};

/// Catalog entry for one activity or biosphere flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogActivity {
    pub id: String,
    pub name: String,
    #[serde(default = "default_database")]
    pub database: Database,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    pub unit: String,
    #[serde(default)]
    pub reference_product: Option<String>,
    #[serde(default = "default_production_amount")]
    pub production_amount: f64,
    /// Score per unit of activity, keyed by impact category name.
    #[serde(default)]
    pub factors: BTreeMap<String, f64>,
}

fn default_database() -> Database {
    Database::Technosphere
}

fn default_production_amount() -> f64 {
    1.0
}

impl CatalogActivity {
    pub fn new(id: &str, name: &str, unit: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            database: Database::Technosphere,
            location: None,
            categories: Vec::new(),
            unit: unit.to_string(),
            reference_product: None,
            production_amount: 1.0,
            factors: BTreeMap::new(),
        }
    }

    pub fn located(mut self, location: &str) -> Self {
        self.location = Some(location.to_string());
        self
    }

    pub fn biosphere(mut self, categories: &[&str]) -> Self {
        self.database = Database::Biosphere;
        self.categories = categories.iter().map(|value| value.to_string()).collect();
        self
    }

    pub fn producing(mut self, reference_product: &str, production_amount: f64) -> Self {
        self.reference_product = Some(reference_product.to_string());
        self.production_amount = production_amount;
        self
    }

    pub fn factor(mut self, category: &str, value: f64) -> Self {
        self.factors.insert(category.to_string(), value);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogFile {
    #[serde(default)]
    categories: Vec<ImpactCategory>,
    #[serde(default)]
    activities: Vec<CatalogActivity>,
}

#[derive(Debug, Default)]
struct CatalogData {
    categories: Vec<ImpactCategory>,
    activities: Vec<CatalogActivity>,
    index: HashMap<String, usize>,
}

impl CatalogData {
    fn activity(&self, id: &str) -> Option<&CatalogActivity> {
        self.index.get(id).map(|&position| &self.activities[position])
    }
}

/// Catalog-backed implementation of both external services.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    data: Arc<CatalogData>,
}

impl Catalog {
    pub fn new(categories: Vec<ImpactCategory>, activities: Vec<CatalogActivity>) -> Self {
        let index = activities
            .iter()
            .enumerate()
            .map(|(position, activity)| (activity.id.clone(), position))
            .collect();
        Self {
            data: Arc::new(CatalogData {
                categories,
                activities,
                index,
            }),
        }
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        let file: CatalogFile = serde_json::from_slice(data)
            .map_err(|err| LcaError::Configuration(format!("unable to parse the catalog: {err}")))?;
        Ok(Self::new(file.categories, file.activities))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        let catalog = Self::from_json(&data)?;
        debug!(
            path = %path.display(),
            activities = catalog.data.activities.len(),
            categories = catalog.data.categories.len(),
            "loaded activity catalog"
        );
        Ok(catalog)
    }

    pub fn to_json(&self) -> Result<String> {
        let file = CatalogFile {
            categories: self.data.categories.clone(),
            activities: self.data.activities.clone(),
        };
        serde_json::to_string_pretty(&file)
            .map_err(|err| LcaError::Configuration(format!("unable to serialize the catalog: {err}")))
    }
}

fn search_tokens(text: &str) -> Vec<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}

impl InventoryService for Catalog {
    fn search(
        &self,
        database: Database,
        query: &str,
        limit: usize,
        _guard: &CallGuard,
    ) -> ServiceResult<Vec<ActivityCandidate>> {
        let tokens = search_tokens(query);
        if tokens.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let mut ranked: Vec<(usize, &CatalogActivity)> = self
            .data
            .activities
            .iter()
            .filter(|activity| activity.database == database)
            .filter_map(|activity| {
                let haystack = search_tokens(&format!(
                    "{} {} {}",
                    activity.name,
                    activity.reference_product.as_deref().unwrap_or(""),
                    activity.categories.join(" ")
                ));
                let hits = tokens
                    .iter()
                    .filter(|token| haystack.iter().any(|word| word.starts_with(token.as_str())))
                    .count();
                (hits > 0).then_some((hits, activity))
            })
            .collect();

        ranked.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.name.cmp(&b.1.name)));
        ranked.truncate(limit);

        Ok(ranked
            .into_iter()
            .map(|(_, activity)| ActivityCandidate {
                id: activity.id.clone(),
                name: activity.name.clone(),
                location: activity.location.clone(),
                categories: activity.categories.clone(),
            })
            .collect())
    }

    fn get_activity(&self, id: &str, _guard: &CallGuard) -> ServiceResult<ActivityInfo> {
        self.data
            .activity(id)
            .map(|activity| ActivityInfo {
                unit: activity.unit.clone(),
                reference_product: activity.reference_product.clone(),
                production_amount: activity.production_amount,
            })
            .ok_or_else(|| format!("activity '{id}' is not in the catalog"))
    }
}

impl ImpactEngine for Catalog {
    fn categories(&self, framework: &str) -> ServiceResult<Vec<ImpactCategory>> {
        Ok(self
            .data
            .categories
            .iter()
            .filter(|category| category.framework == framework)
            .cloned()
            .collect())
    }

    fn new_inventory(
        &self,
        activity: &str,
        amount: f64,
        _guard: &CallGuard,
    ) -> ServiceResult<Box<dyn EngineSession>> {
        if self.data.activity(activity).is_none() {
            return Err(format!("activity '{activity}' is not in the catalog"));
        }
        Ok(Box::new(CatalogSession {
            data: Arc::clone(&self.data),
            demand: (activity.to_string(), amount),
            method: None,
        }))
    }
}

struct CatalogSession {
    data: Arc<CatalogData>,
    demand: (String, f64),
    method: Option<ImpactCategory>,
}

impl EngineSession for CatalogSession {
    fn recompute(&mut self, activity: &str, amount: f64) -> ServiceResult<()> {
        if self.data.activity(activity).is_none() {
            return Err(format!("activity '{activity}' is not in the catalog"));
        }
        self.demand = (activity.to_string(), amount);
        Ok(())
    }

    fn select_method(&mut self, category: &ImpactCategory) -> ServiceResult<()> {
        if !self.data.categories.contains(category) {
            return Err(format!("method {:?} is not in the catalog", category.method()));
        }
        self.method = Some(category.clone());
        Ok(())
    }

    fn compute_score(&mut self) -> ServiceResult<Score> {
        let method = self
            .method
            .as_ref()
            .ok_or_else(|| "no impact method has been selected".to_string())?;
        let (activity, amount) = &self.demand;
        let factor = self
            .data
            .activity(activity)
            .and_then(|entry| entry.factors.get(&method.name))
            .copied()
            .unwrap_or(0.0);
        Ok(Score {
            value: amount * factor,
            unit: method.unit.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unbounded() -> CallGuard {
        CallGuard::unbounded()
    }

    fn climate() -> ImpactCategory {
        ImpactCategory::new("EF v3.1", "climate change", None, "kg CO2-Eq")
    }

    fn catalog() -> Catalog {
        Catalog::new(
            vec![
                climate(),
                ImpactCategory::new("ReCiPe 2016", "climate change", None, "kg CO2-Eq"),
            ],
            vec![
                CatalogActivity::new("elec-de", "market for electricity, medium voltage", "kilowatt hour")
                    .located("DE")
                    .factor("climate change", 0.45),
                CatalogActivity::new("elec-fr", "market for electricity, low voltage", "kilowatt hour")
                    .located("FR"),
                CatalogActivity::new("co2", "Carbon dioxide, fossil", "kilogram")
                    .biosphere(&["air"]),
            ],
        )
    }

    #[test]
    fn search_ranks_by_matching_tokens_and_respects_database() {
        let results = catalog()
            .search(Database::Technosphere, "electricity medium", 10, &unbounded())
            .unwrap();
        assert_eq!(results[0].id, "elec-de");
        assert_eq!(results.len(), 2);

        let biosphere = catalog()
            .search(Database::Biosphere, "carbon", 10, &unbounded())
            .unwrap();
        assert_eq!(biosphere.len(), 1);
        assert_eq!(biosphere[0].categories, vec!["air"]);
    }

    #[test]
    fn search_honours_the_limit() {
        let results = catalog()
            .search(Database::Technosphere, "electricity", 1, &unbounded())
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn categories_are_filtered_by_framework() {
        let categories = catalog().categories("EF v3.1").unwrap();
        assert_eq!(categories, vec![climate()]);
    }

    #[test]
    fn sessions_scale_factors_by_the_demanded_amount() {
        let catalog = catalog();
        let mut session = catalog.new_inventory("elec-de", 2.0, &unbounded()).unwrap();
        session.select_method(&climate()).unwrap();
        assert!((session.compute_score().unwrap().value - 0.9).abs() < 1e-12);

        session.recompute("elec-fr", 3.0).unwrap();
        assert_eq!(session.compute_score().unwrap().value, 0.0);
    }

    #[test]
    fn scoring_without_a_method_fails() {
        let mut session = catalog().new_inventory("elec-de", 1.0, &unbounded()).unwrap();
        assert!(session.compute_score().is_err());
    }

    #[test]
    fn unknown_activities_are_reported() {
        assert!(catalog().get_activity("missing", &unbounded()).is_err());
        assert!(catalog().new_inventory("missing", 1.0, &unbounded()).is_err());
    }

    #[test]
    fn catalogs_survive_a_json_round_trip() {
        let json = catalog().to_json().unwrap();
        let restored = Catalog::from_json(json.as_bytes()).unwrap();
        assert_eq!(
            restored.get_activity("co2", &unbounded()).unwrap().unit,
            "kilogram"
        );
    }
}

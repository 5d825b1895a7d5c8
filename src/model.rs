use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::units::ActivityUnit;

/// Which table of the uploaded sheets a stream came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FlowDirection {
    Input,
    Output,
    Utility,
}

/// Semantic role declared for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowRole {
    #[serde(rename = "Technosphere")]
    Technosphere,
    #[serde(rename = "Biosphere")]
    Biosphere,
    #[serde(rename = "No impact")]
    NoImpact,
    #[serde(rename = "Reference flow")]
    Reference,
    #[serde(rename = "Waste flow")]
    Waste,
    #[serde(rename = "By-product")]
    ByProduct,
    #[serde(rename = "Biosphere flow")]
    BiosphereEmission,
    #[serde(rename = "Utility")]
    Utility,
}

impl FlowRole {
    pub fn label(self) -> &'static str {
        match self {
            FlowRole::Technosphere => "Technosphere",
            FlowRole::Biosphere => "Biosphere",
            FlowRole::NoImpact => "No impact",
            FlowRole::Reference => "Reference flow",
            FlowRole::Waste => "Waste flow",
            FlowRole::ByProduct => "By-product",
            FlowRole::BiosphereEmission => "Biosphere flow",
            FlowRole::Utility => "Utility",
        }
    }
}

impl fmt::Display for FlowRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputRole {
    #[serde(rename = "Technosphere")]
    Technosphere,
    #[serde(rename = "Biosphere")]
    Biosphere,
    #[serde(rename = "No impact")]
    NoImpact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputRole {
    #[serde(rename = "Reference flow")]
    Reference,
    #[serde(rename = "Waste flow")]
    Waste,
    #[serde(rename = "By-product")]
    ByProduct,
    #[serde(rename = "Biosphere flow")]
    Biosphere,
}

impl From<InputRole> for FlowRole {
    fn from(role: InputRole) -> Self {
        match role {
            InputRole::Technosphere => FlowRole::Technosphere,
            InputRole::Biosphere => FlowRole::Biosphere,
            InputRole::NoImpact => FlowRole::NoImpact,
        }
    }
}

impl From<OutputRole> for FlowRole {
    fn from(role: OutputRole) -> Self {
        match role {
            OutputRole::Reference => FlowRole::Reference,
            OutputRole::Waste => FlowRole::Waste,
            OutputRole::ByProduct => FlowRole::ByProduct,
            OutputRole::Biosphere => FlowRole::BiosphereEmission,
        }
    }
}

/// Key a flow is evaluated under.
///
/// The reference flow is never looked up in the inventory; its stream name
/// stands in as its key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "camelCase")]
pub enum ActivityRef {
    Inventory(String),
    ReferenceFlow(String),
}

impl ActivityRef {
    pub fn key(&self) -> &str {
        match self {
            ActivityRef::Inventory(key) | ActivityRef::ReferenceFlow(key) => key,
        }
    }

    pub fn inventory_id(&self) -> Option<&str> {
        match self {
            ActivityRef::Inventory(id) => Some(id),
            ActivityRef::ReferenceFlow(_) => None,
        }
    }
}

/// One named stream from the uploaded sheets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowRecord {
    pub name: String,
    pub direction: FlowDirection,
    #[serde(default)]
    pub role: Option<FlowRole>,
    /// kg/hr
    #[serde(default)]
    pub mass_flow: Option<f64>,
    /// m3/hr
    #[serde(default)]
    pub volume_flow: Option<f64>,
    /// MJ/hr
    #[serde(default)]
    pub duty: Option<f64>,
    #[serde(default)]
    pub utility_type: Option<String>,
    #[serde(default)]
    pub fuel_source: Option<String>,
    #[serde(default)]
    pub activity: Option<ActivityRef>,
    #[serde(default)]
    pub activity_unit: Option<ActivityUnit>,
}

impl FlowRecord {
    pub fn new(name: impl Into<String>, direction: FlowDirection) -> Self {
        Self {
            name: name.into(),
            direction,
            role: if direction == FlowDirection::Utility {
                Some(FlowRole::Utility)
            } else {
                None
            },
            mass_flow: None,
            volume_flow: None,
            duty: None,
            utility_type: None,
            fuel_source: None,
            activity: None,
            activity_unit: None,
        }
    }

    pub fn with_mass_flow(mut self, value: f64) -> Self {
        self.mass_flow = Some(value);
        self
    }

    pub fn with_volume_flow(mut self, value: f64) -> Self {
        self.volume_flow = Some(value);
        self
    }

    pub fn with_duty(mut self, value: f64) -> Self {
        self.duty = Some(value);
        self
    }

    pub fn is_biosphere(&self) -> bool {
        matches!(self.role, Some(FlowRole::BiosphereEmission))
    }
}

/// Row of the setup table: a flow with a resolved activity and an amount
/// per unit of reference flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupRecord {
    pub stream_name: String,
    pub role: FlowRole,
    pub activity: ActivityRef,
    pub activity_unit: Option<ActivityUnit>,
    pub amount: f64,
}

impl SetupRecord {
    pub fn is_scored(&self) -> bool {
        self.activity.inventory_id().is_some()
    }
}

/// Normalized flows ready for impact evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LcaSetupTable {
    pub reference_flow: String,
    pub reference_mass_flow: f64,
    pub records: Vec<SetupRecord>,
    /// Streams left out because they have no activity to evaluate.
    #[serde(default)]
    pub skipped: Vec<String>,
}

impl LcaSetupTable {
    pub fn scored_records(&self) -> impl Iterator<Item = &SetupRecord> {
        self.records.iter().filter(|record| record.is_scored())
    }
}

/// Impact category of an assessment framework.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpactCategory {
    pub framework: String,
    pub name: String,
    #[serde(default)]
    pub indicator: Option<String>,
    pub unit: String,
}

impl ImpactCategory {
    pub fn new(framework: &str, name: &str, indicator: Option<&str>, unit: &str) -> Self {
        Self {
            framework: framework.to_string(),
            name: name.to_string(),
            indicator: indicator.map(str::to_string),
            unit: unit.to_string(),
        }
    }

    /// Method key as the engine expects it: framework, category, indicator.
    pub fn method(&self) -> Vec<&str> {
        let mut method = vec![self.framework.as_str(), self.name.as_str()];
        if let Some(indicator) = &self.indicator {
            method.push(indicator);
        }
        method
    }
}

/// One flow scored under one impact category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpactResultRow {
    pub stream_name: String,
    pub flow_type: FlowRole,
    pub activity: String,
    pub activity_unit: Option<ActivityUnit>,
    pub amount: f64,
    pub impact_category: String,
    pub impact_unit: String,
    pub impact: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryTotal {
    pub score: f64,
    pub unit: String,
}

impl CategoryTotal {
    pub fn display(&self) -> String {
        format!("{:.1e} {}", self.score, self.unit)
    }
}

/// Result of one impact evaluation run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpactReport {
    pub rows: Vec<ImpactResultRow>,
    pub totals_by_category: BTreeMap<String, CategoryTotal>,
}

impl ImpactReport {
    pub fn from_rows(rows: Vec<ImpactResultRow>) -> Self {
        let mut totals_by_category: BTreeMap<String, CategoryTotal> = BTreeMap::new();
        for row in &rows {
            let total = totals_by_category
                .entry(row.impact_category.clone())
                .or_insert_with(|| CategoryTotal {
                    score: 0.0,
                    unit: row.impact_unit.clone(),
                });
            total.score += row.impact;
        }
        Self {
            rows,
            totals_by_category,
        }
    }

    pub fn rows_for<'a>(&'a self, category: &'a str) -> impl Iterator<Item = &'a ImpactResultRow> {
        self.rows
            .iter()
            .filter(move |row| row.impact_category == category)
    }

    pub fn total_for(&self, category: &str) -> Option<&CategoryTotal> {
        self.totals_by_category.get(category)
    }

    /// Per-stream scores of one category, largest magnitude first.
    pub fn contributions(&self, category: &str) -> Vec<(String, f64)> {
        let mut contributions: Vec<(String, f64)> = self
            .rows_for(category)
            .map(|row| (row.stream_name.clone(), row.impact))
            .collect();
        contributions.sort_by(|a, b| {
            b.1.abs()
                .partial_cmp(&a.1.abs())
                .unwrap_or(Ordering::Equal)
        });
        contributions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(stream: &str, category: &str, impact: f64) -> ImpactResultRow {
        ImpactResultRow {
            stream_name: stream.into(),
            flow_type: FlowRole::Technosphere,
            activity: format!("act-{stream}"),
            activity_unit: Some(ActivityUnit::Kilogram),
            amount: 1.0,
            impact_category: category.into(),
            impact_unit: "kg CO2-Eq".into(),
            impact,
        }
    }

    #[test]
    fn totals_sum_each_category() {
        let report = ImpactReport::from_rows(vec![
            row("A", "climate change", 2.0),
            row("B", "climate change", -0.5),
            row("A", "acidification", 7.0),
        ]);
        assert_eq!(report.total_for("climate change").unwrap().score, 1.5);
        assert_eq!(report.total_for("acidification").unwrap().score, 7.0);
        assert!(report.total_for("land use").is_none());
    }

    #[test]
    fn contributions_are_ordered_by_magnitude() {
        let report = ImpactReport::from_rows(vec![
            row("A", "climate change", 0.1),
            row("B", "climate change", -4.0),
            row("C", "climate change", 2.0),
        ]);
        let names: Vec<String> = report
            .contributions("climate change")
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["B", "C", "A"]);
    }

    #[test]
    fn total_display_uses_scientific_notation() {
        let total = CategoryTotal {
            score: 1234.0,
            unit: "kg CO2-Eq".into(),
        };
        assert_eq!(total.display(), "1.2e3 kg CO2-Eq");
    }

    #[test]
    fn method_key_includes_indicator_when_present() {
        let category = ImpactCategory::new(
            "EF v3.1",
            "climate change",
            Some("global warming potential (GWP100)"),
            "kg CO2-Eq",
        );
        assert_eq!(
            category.method(),
            vec![
                "EF v3.1",
                "climate change",
                "global warming potential (GWP100)"
            ]
        );
    }
}

//! Application of user-declared flow roles and inventory activities.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cancel::CallGuard;
use crate::errors::{LcaError, Result};
use crate::model::{ActivityRef, FlowRecord, FlowRole, InputRole, OutputRole};
use crate::service::{ActivityInfo, InventoryService};
use crate::sheet::MaterialTables;
use crate::units::ActivityUnit;

/// Declared role of a material input and the activity chosen for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputDeclaration {
    pub role: InputRole,
    #[serde(default)]
    pub activity: Option<String>,
}

/// Declared role of a material output and the activity chosen for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputDeclaration {
    pub role: OutputRole,
    #[serde(default)]
    pub activity: Option<String>,
}

/// Everything the user declared about the uploaded streams, keyed by
/// stream name. Utilities only carry the chosen activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classifications {
    #[serde(default)]
    pub inputs: BTreeMap<String, InputDeclaration>,
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputDeclaration>,
    #[serde(default)]
    pub utilities: BTreeMap<String, Option<String>>,
}

impl Classifications {
    pub fn input(mut self, stream: &str, role: InputRole, activity: Option<&str>) -> Self {
        self.inputs.insert(
            stream.to_string(),
            InputDeclaration {
                role,
                activity: activity.map(str::to_string),
            },
        );
        self
    }

    pub fn output(mut self, stream: &str, role: OutputRole, activity: Option<&str>) -> Self {
        self.outputs.insert(
            stream.to_string(),
            OutputDeclaration {
                role,
                activity: activity.map(str::to_string),
            },
        );
        self
    }

    pub fn utility(mut self, stream: &str, activity: Option<&str>) -> Self {
        self.utilities
            .insert(stream.to_string(), activity.map(str::to_string));
        self
    }
}

/// Flows with roles, activities, and activity units applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedFlows {
    pub inputs: Vec<FlowRecord>,
    pub outputs: Vec<FlowRecord>,
    pub utilities: Vec<FlowRecord>,
    pub reference_flow: String,
}

impl ClassifiedFlows {
    pub fn reference(&self) -> Option<&FlowRecord> {
        self.outputs
            .iter()
            .find(|record| record.role == Some(FlowRole::Reference))
    }
}

/// Returns the single output declared as reference flow.
///
/// Runs before any inventory lookup so a missing or ambiguous functional
/// unit is reported first.
pub fn check_reference_declared<'a, I>(roles: I) -> Result<String>
where
    I: IntoIterator<Item = (&'a str, OutputRole)>,
{
    let names: Vec<String> = roles
        .into_iter()
        .filter(|(_, role)| *role == OutputRole::Reference)
        .map(|(name, _)| name.to_string())
        .collect();

    match names.len() {
        0 => Err(LcaError::MissingReferenceFlow),
        1 => Ok(names.into_iter().next().unwrap_or_default()),
        _ => Err(LcaError::MultipleReferenceFlows { names }),
    }
}

/// Merges declarations onto the parsed streams and resolves activity units.
///
/// Waste activities whose production amount is negative are declared as
/// consuming the waste, so the stream's mass and volume are negated to match.
pub fn classify(
    material: &MaterialTables,
    utilities: &[FlowRecord],
    declarations: &Classifications,
    inventory: &dyn InventoryService,
    guard: &CallGuard,
) -> Result<ClassifiedFlows> {
    let input_roles = material
        .inputs
        .iter()
        .map(|record| {
            declarations
                .inputs
                .get(&record.name)
                .map(|declaration| (record, declaration))
                .ok_or_else(|| LcaError::Unclassified {
                    flow: record.name.clone(),
                })
        })
        .collect::<Result<Vec<_>>>()?;

    let output_roles = material
        .outputs
        .iter()
        .map(|record| {
            declarations
                .outputs
                .get(&record.name)
                .map(|declaration| (record, declaration))
                .ok_or_else(|| LcaError::Unclassified {
                    flow: record.name.clone(),
                })
        })
        .collect::<Result<Vec<_>>>()?;

    let reference_flow = check_reference_declared(
        output_roles
            .iter()
            .map(|(record, declaration)| (record.name.as_str(), declaration.role)),
    )?;

    let lookup = Lookup { inventory, guard };

    let mut inputs = Vec::with_capacity(input_roles.len());
    for (record, declaration) in input_roles {
        let mut record = record.clone();
        record.role = Some(declaration.role.into());
        match declaration.role {
            InputRole::NoImpact => {
                if declaration.activity.is_some() {
                    warn!(flow = %record.name, "ignoring activity declared for a no-impact input");
                }
            }
            InputRole::Technosphere | InputRole::Biosphere => {
                if let Some(info) = lookup.resolve(&mut record, declaration.activity.as_deref())? {
                    record.activity_unit = Some(ActivityUnit::from_label(&info.unit));
                }
            }
        }
        inputs.push(record);
    }

    let mut outputs = Vec::with_capacity(output_roles.len());
    for (record, declaration) in output_roles {
        let mut record = record.clone();
        record.role = Some(declaration.role.into());
        match declaration.role {
            OutputRole::Reference => {
                record.activity = Some(ActivityRef::ReferenceFlow(record.name.clone()));
                record.activity_unit = Some(ActivityUnit::Kilogram);
            }
            OutputRole::ByProduct => {
                if declaration.activity.is_some() {
                    warn!(flow = %record.name, "ignoring activity declared for a by-product");
                }
                record.activity_unit = Some(ActivityUnit::Kilogram);
            }
            OutputRole::Waste => {
                if let Some(info) = lookup.resolve(&mut record, declaration.activity.as_deref())? {
                    record.activity_unit = Some(ActivityUnit::from_label(&info.unit));
                    if info.production_amount < 0.0 {
                        info!(flow = %record.name, "negating waste flow for a treatment activity");
                        record.mass_flow = record.mass_flow.map(|value| -value);
                        record.volume_flow = record.volume_flow.map(|value| -value);
                    }
                }
            }
            OutputRole::Biosphere => {
                // Emissions never reach the setup table, so no lookup is made.
                let declared = declaration.activity.as_deref().map(str::trim);
                if let Some(id) = declared.filter(|id| !id.is_empty()) {
                    debug!(flow = %record.name, activity = id, "emission left out of the setup table");
                    record.activity = Some(ActivityRef::Inventory(id.to_string()));
                }
            }
        }
        outputs.push(record);
    }

    let mut resolved_utilities = Vec::with_capacity(utilities.len());
    for record in utilities {
        let mut record = record.clone();
        record.role = Some(FlowRole::Utility);
        let activity = declarations
            .utilities
            .get(&record.name)
            .and_then(|activity| activity.as_deref());
        if let Some(info) = lookup.resolve(&mut record, activity)? {
            record.activity_unit = Some(ActivityUnit::from_label(&info.unit));
        }
        resolved_utilities.push(record);
    }

    debug!(
        inputs = inputs.len(),
        outputs = outputs.len(),
        utilities = resolved_utilities.len(),
        reference = %reference_flow,
        "applied flow classifications"
    );

    Ok(ClassifiedFlows {
        inputs,
        outputs,
        utilities: resolved_utilities,
        reference_flow,
    })
}

struct Lookup<'a> {
    inventory: &'a dyn InventoryService,
    guard: &'a CallGuard,
}

impl Lookup<'_> {
    /// Attaches `activity` to `record` and fetches its declaration.
    /// Returns `None` when no activity was chosen for the stream.
    fn resolve(
        &self,
        record: &mut FlowRecord,
        activity: Option<&str>,
    ) -> Result<Option<ActivityInfo>> {
        let Some(id) = activity.map(str::trim).filter(|id| !id.is_empty()) else {
            warn!(flow = %record.name, "no activity selected; the flow will not be evaluated");
            return Ok(None);
        };

        self.guard.check(&record.name)?;
        let info = self
            .inventory
            .get_activity(id, self.guard)
            .map_err(|reason| match self.guard.check(&record.name) {
                Err(abort) => abort,
                Ok(()) => LcaError::LookupFailure {
                    flow: record.name.clone(),
                    activity: id.to_string(),
                    reason,
                },
            })?;
        record.activity = Some(ActivityRef::Inventory(id.to_string()));
        Ok(Some(info))
    }
}

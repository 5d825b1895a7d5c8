//! Expression of every flow per unit of the reference flow.

use tracing::{debug, warn};

use crate::classify::ClassifiedFlows;
use crate::errors::{LcaError, Result};
use crate::model::{FlowDirection, FlowRecord, FlowRole, LcaSetupTable, SetupRecord};
use crate::sheet::{MATERIAL_SHEET, UTILITY_SHEET};
use crate::units::ActivityUnit;

const MJ_PER_KWH: f64 = 3.6;

/// Amount of `record` per unit of reference mass flow, measured in the unit
/// its activity declares.
///
/// Activities with an unknown unit, and flows without a resolved activity,
/// normalize to zero. A resolved unit whose magnitude is missing from the
/// sheet is an error naming the stream.
pub fn normalize(record: &FlowRecord, reference_mass_flow: f64) -> Result<f64> {
    let magnitude = match &record.activity_unit {
        Some(ActivityUnit::Kilogram) => magnitude(record, record.mass_flow, "mass flow")?,
        Some(ActivityUnit::CubicMeter) => magnitude(record, record.volume_flow, "volume flow")?,
        Some(ActivityUnit::Megajoule) => magnitude(record, record.duty, "duty")?,
        Some(ActivityUnit::KilowattHour) => magnitude(record, record.duty, "duty")? / MJ_PER_KWH,
        Some(ActivityUnit::Unknown(_)) | None => return Ok(0.0),
    };
    Ok(magnitude / reference_mass_flow)
}

fn magnitude(record: &FlowRecord, value: Option<f64>, quantity: &str) -> Result<f64> {
    value.ok_or_else(|| LcaError::MalformedSheet {
        sheet: match record.direction {
            FlowDirection::Utility => UTILITY_SHEET.to_string(),
            _ => MATERIAL_SHEET.to_string(),
        },
        missing: format!(
            "a {quantity} for stream '{}', needed by its {} activity",
            record.name,
            record
                .activity_unit
                .as_ref()
                .map(ActivityUnit::label)
                .unwrap_or_default()
        ),
    })
}

/// Mass flow of the reference flow, validated as a usable divisor.
pub fn reference_mass_flow(flows: &ClassifiedFlows) -> Result<f64> {
    let reference = flows.reference().ok_or(LcaError::MissingReferenceFlow)?;
    let invalid = |detail: &str| LcaError::InvalidReferenceFlow {
        name: reference.name.clone(),
        detail: detail.to_string(),
    };

    match reference.mass_flow {
        None => Err(invalid("the mass flow is missing")),
        Some(value) if !value.is_finite() => Err(invalid("the mass flow is not a number")),
        Some(value) if value == 0.0 => Err(invalid("the mass flow is zero")),
        Some(value) if value < 0.0 => Err(invalid("the mass flow is negative")),
        Some(value) => Ok(value),
    }
}

/// Builds the table of flows to evaluate.
///
/// Biosphere outputs are direct emissions and are left out. Flows without an
/// activity (no-impact inputs, by-products, unresolved streams) are listed in
/// `skipped` instead of the table.
pub fn build_setup_table(flows: &ClassifiedFlows) -> Result<LcaSetupTable> {
    let reference = reference_mass_flow(flows)?;
    let mut table = LcaSetupTable {
        reference_flow: flows.reference_flow.clone(),
        reference_mass_flow: reference,
        records: Vec::new(),
        skipped: Vec::new(),
    };

    let candidates = flows
        .inputs
        .iter()
        .chain(flows.outputs.iter())
        .chain(flows.utilities.iter());

    for record in candidates {
        if record.is_biosphere() {
            debug!(flow = %record.name, "excluding biosphere output from the setup table");
            continue;
        }

        let (Some(role), Some(activity)) = (record.role, record.activity.clone()) else {
            table.skipped.push(record.name.clone());
            continue;
        };

        if let Some(ActivityUnit::Unknown(unit)) = &record.activity_unit {
            warn!(flow = %record.name, unit = %unit, "activity unit is not supported; amount set to zero");
        }

        let amount = normalize(record, reference)?;
        table.records.push(SetupRecord {
            stream_name: record.name.clone(),
            role,
            activity,
            activity_unit: record.activity_unit.clone(),
            amount,
        });
    }
    check_reference_count(&table.records)?;

    debug!(
        records = table.records.len(),
        skipped = table.skipped.len(),
        reference = %table.reference_flow,
        "built setup table"
    );

    Ok(table)
}

/// Checks that exactly one reference flow is present in a setup table.
pub fn check_reference_count(records: &[SetupRecord]) -> Result<()> {
    let names: Vec<String> = records
        .iter()
        .filter(|record| record.role == FlowRole::Reference)
        .map(|record| record.stream_name.clone())
        .collect();
    match names.len() {
        1 => Ok(()),
        0 => Err(LcaError::MissingReferenceFlow),
        _ => Err(LcaError::MultipleReferenceFlows { names }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ActivityRef;

    fn resolved(
        name: &str,
        direction: FlowDirection,
        role: FlowRole,
        unit: ActivityUnit,
    ) -> FlowRecord {
        let mut record = FlowRecord::new(name, direction);
        record.role = Some(role);
        record.activity = Some(ActivityRef::Inventory(format!("act-{name}")));
        record.activity_unit = Some(unit);
        record
    }

    fn reference(mass: f64) -> FlowRecord {
        let mut record = FlowRecord::new("PRODUCT", FlowDirection::Output).with_mass_flow(mass);
        record.role = Some(FlowRole::Reference);
        record.activity = Some(ActivityRef::ReferenceFlow("PRODUCT".into()));
        record.activity_unit = Some(ActivityUnit::Kilogram);
        record
    }

    #[test]
    fn mass_based_activities_use_mass_flow() {
        let feed = resolved(
            "FEED",
            FlowDirection::Input,
            FlowRole::Technosphere,
            ActivityUnit::Kilogram,
        )
        .with_mass_flow(500.0);
        assert_eq!(normalize(&feed, 1000.0).unwrap(), 0.5);
    }

    #[test]
    fn volume_based_activities_use_volume_flow() {
        let water = resolved(
            "WATER",
            FlowDirection::Input,
            FlowRole::Technosphere,
            ActivityUnit::CubicMeter,
        )
        .with_mass_flow(999.0)
        .with_volume_flow(6.0);
        assert_eq!(normalize(&water, 2.0).unwrap(), 3.0);
    }

    #[test]
    fn kilowatt_hour_activities_convert_duty_from_megajoules() {
        let power = resolved(
            "ELEC",
            FlowDirection::Utility,
            FlowRole::Utility,
            ActivityUnit::KilowattHour,
        )
        .with_duty(100.0);
        let expected = (100.0 / 3.6) / 50.0;
        assert!((normalize(&power, 50.0).unwrap() - expected).abs() < 1e-12);
    }

    #[test]
    fn megajoule_activities_use_duty() {
        let steam = resolved(
            "STEAM",
            FlowDirection::Utility,
            FlowRole::Utility,
            ActivityUnit::Megajoule,
        )
        .with_duty(100.0);
        assert_eq!(normalize(&steam, 4.0).unwrap(), 25.0);
    }

    #[test]
    fn unknown_and_missing_units_normalize_to_zero() {
        let odd = resolved(
            "ODD",
            FlowDirection::Input,
            FlowRole::Technosphere,
            ActivityUnit::Unknown("unit".into()),
        )
        .with_mass_flow(10.0);
        assert_eq!(normalize(&odd, 1.0).unwrap(), 0.0);

        let unresolved = FlowRecord::new("LOOSE", FlowDirection::Input).with_mass_flow(10.0);
        assert_eq!(normalize(&unresolved, 1.0).unwrap(), 0.0);
    }

    #[test]
    fn normalization_is_repeatable() {
        let feed = resolved(
            "FEED",
            FlowDirection::Input,
            FlowRole::Technosphere,
            ActivityUnit::Kilogram,
        )
        .with_mass_flow(123.0);
        let first = normalize(&feed, 7.0).unwrap();
        let second = normalize(&feed, 7.0).unwrap();
        assert_eq!(first.to_bits(), second.to_bits());
    }

    #[test]
    fn missing_magnitudes_are_reported_by_stream() {
        let water = resolved(
            "WATER",
            FlowDirection::Input,
            FlowRole::Technosphere,
            ActivityUnit::CubicMeter,
        );
        match normalize(&water, 1.0).unwrap_err() {
            LcaError::MalformedSheet { sheet, missing } => {
                assert_eq!(sheet, "Material");
                assert!(missing.contains("WATER"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    fn flows(outputs: Vec<FlowRecord>) -> ClassifiedFlows {
        ClassifiedFlows {
            inputs: vec![resolved(
                "FEED",
                FlowDirection::Input,
                FlowRole::Technosphere,
                ActivityUnit::Kilogram,
            )
            .with_mass_flow(500.0)],
            outputs,
            utilities: Vec::new(),
            reference_flow: "PRODUCT".into(),
        }
    }

    #[test]
    fn zero_reference_mass_flow_is_rejected() {
        let err = reference_mass_flow(&flows(vec![reference(0.0)])).unwrap_err();
        assert!(matches!(err, LcaError::InvalidReferenceFlow { name, .. } if name == "PRODUCT"));

        let mut missing = reference(1.0);
        missing.mass_flow = None;
        assert!(matches!(
            reference_mass_flow(&flows(vec![missing])),
            Err(LcaError::InvalidReferenceFlow { .. })
        ));
    }

    #[test]
    fn negative_reference_mass_flow_is_rejected() {
        match reference_mass_flow(&flows(vec![reference(-5.0)])) {
            Err(LcaError::InvalidReferenceFlow { name, detail }) => {
                assert_eq!(name, "PRODUCT");
                assert!(detail.contains("negative"), "{detail}");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn non_finite_reference_mass_flow_is_rejected() {
        for value in [f64::NAN, f64::INFINITY] {
            match reference_mass_flow(&flows(vec![reference(value)])) {
                Err(LcaError::InvalidReferenceFlow { detail, .. }) => {
                    assert!(detail.contains("not a number"), "{detail}");
                }
                other => panic!("unexpected result for {value}: {other:?}"),
            }
        }
    }

    #[test]
    fn setup_table_excludes_biosphere_outputs_and_unresolved_flows() {
        let mut emission = FlowRecord::new("VENT", FlowDirection::Output).with_mass_flow(5.0);
        emission.role = Some(FlowRole::BiosphereEmission);
        emission.activity = Some(ActivityRef::Inventory("co2".into()));
        emission.activity_unit = Some(ActivityUnit::Kilogram);

        let mut by_product = FlowRecord::new("TAR", FlowDirection::Output).with_mass_flow(5.0);
        by_product.role = Some(FlowRole::ByProduct);
        by_product.activity_unit = Some(ActivityUnit::Kilogram);

        let table = build_setup_table(&flows(vec![reference(1000.0), emission, by_product])).unwrap();

        let names: Vec<&str> = table
            .records
            .iter()
            .map(|record| record.stream_name.as_str())
            .collect();
        assert_eq!(names, vec!["FEED", "PRODUCT"]);
        assert_eq!(table.skipped, vec!["TAR"]);
        assert_eq!(table.records[0].amount, 0.5);
        assert_eq!(table.records[1].amount, 1.0);
        assert!(check_reference_count(&table.records).is_ok());
    }

    #[test]
    fn reference_count_must_be_exactly_one() {
        let record = |name: &str| SetupRecord {
            stream_name: name.into(),
            role: FlowRole::Reference,
            activity: ActivityRef::ReferenceFlow(name.into()),
            activity_unit: Some(ActivityUnit::Kilogram),
            amount: 1.0,
        };
        assert!(matches!(
            check_reference_count(&[]),
            Err(LcaError::MissingReferenceFlow)
        ));
        assert!(matches!(
            check_reference_count(&[record("A"), record("B")]),
            Err(LcaError::MultipleReferenceFlows { names }) if names == vec!["A", "B"]
        ));
    }
}

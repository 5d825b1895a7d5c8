//! Extraction of material and utility flow tables from simulator exports.
//!
//! The material sheet lists one stream per column with attribute rows
//! (`From`, `To`, `Mass Flows`, `Volume Flow`, ...). A stream coming from a
//! block and going nowhere is an output of the process; a stream coming from
//! nowhere and feeding a block is an input. Internal streams (both ends set)
//! and orphans (neither end set) are dropped.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::errors::{LcaError, Result};
use crate::model::{FlowDirection, FlowRecord};
use crate::units::{convert, SourceUnit};
use crate::workbook::RawSheet;

pub const MATERIAL_SHEET: &str = "Material";
pub const UTILITY_SHEET: &str = "Utility";

const STREAM_NAME: &str = "Stream Name";
const UTILITY_ID: &str = "Utility ID";
const UNITS: &str = "Units";
const FROM: &str = "From";
const TO: &str = "To";
const MASS_FLOWS: &str = "Mass Flows";
const VOLUME_FLOW: &str = "Volume Flow";
const UTILITY_TYPE: &str = "Utility type";
const FUEL_SOURCE: &str = "Ultimate fuel source";
const UTILITY_MASS_FLOW: &str = "Mass flow";
const DUTY: &str = "Duty";

/// Streams extracted from the material sheet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaterialTables {
    pub inputs: Vec<FlowRecord>,
    pub outputs: Vec<FlowRecord>,
    /// Streams that are neither inputs nor outputs of the process.
    pub dropped: Vec<String>,
}

impl MaterialTables {
    pub fn stream_count(&self) -> usize {
        self.inputs.len() + self.outputs.len() + self.dropped.len()
    }
}

/// A sheet whose first column labels attribute rows and whose remaining
/// columns (after the units column) are streams.
struct AttributeTable<'a> {
    sheet: &'a str,
    header: &'a [String],
    rows: &'a [Vec<String>],
    label_col: usize,
    units_col: usize,
    stream_cols: Vec<usize>,
    row_index: HashMap<&'a str, usize>,
}

impl<'a> AttributeTable<'a> {
    fn row(&self, label: &str) -> Result<&'a [String]> {
        self.row_index
            .get(label)
            .map(|&index| self.rows[index].as_slice())
            .ok_or_else(|| LcaError::MalformedSheet {
                sheet: self.sheet.to_string(),
                missing: format!("the '{label}' row"),
            })
    }

    fn unit(&self, label: &str) -> Result<SourceUnit> {
        let row = self.row(label)?;
        let value = cell(row, self.units_col);
        if value.is_empty() {
            return Err(LcaError::MalformedSheet {
                sheet: self.sheet.to_string(),
                missing: format!("a unit for the '{label}' row"),
            });
        }
        SourceUnit::parse_for(
            value,
            &format!("the '{label}' row of the {} sheet", self.sheet),
        )
    }

    fn stream_name(&self, col: usize) -> &'a str {
        cell(self.header, col)
    }

    fn quantity(
        &self,
        row: &[String],
        label: &str,
        col: usize,
        unit: SourceUnit,
    ) -> Result<Option<f64>> {
        let raw = cell(row, col);
        if raw.is_empty() {
            return Ok(None);
        }
        parse_number(raw)
            .map(|value| Some(convert(value, unit)))
            .ok_or_else(|| LcaError::MalformedSheet {
                sheet: self.sheet.to_string(),
                missing: format!(
                    "a numeric '{label}' value for stream '{}' (found '{raw}')",
                    self.stream_name(col)
                ),
            })
    }
}

fn cell(row: &[String], col: usize) -> &str {
    row.get(col).map(|value| value.trim()).unwrap_or("")
}

fn parse_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw.chars().filter(|ch| *ch != ',' && *ch != ' ').collect();
    cleaned.parse::<f64>().ok().filter(|value| value.is_finite())
}

fn attribute_table<'a>(
    sheet: &'a str,
    grid: &'a [Vec<String>],
    label_headers: &[&str],
) -> Result<AttributeTable<'a>> {
    let mut non_empty = grid
        .iter()
        .enumerate()
        .filter(|(_, row)| row.iter().any(|value| !value.trim().is_empty()));

    let Some((header_index, header)) = non_empty.next() else {
        return Err(LcaError::EmptyInput {
            sheet: sheet.to_string(),
        });
    };

    let label_col = header
        .iter()
        .position(|value| label_headers.contains(&value.trim()))
        .ok_or_else(|| LcaError::MalformedSheet {
            sheet: sheet.to_string(),
            missing: format!("the '{}' column", label_headers[0]),
        })?;
    let units_col = label_col + 1;

    let stream_cols: Vec<usize> = (units_col + 1..header.len())
        .filter(|&col| !cell(header, col).is_empty())
        .collect();

    let mut seen = HashSet::new();
    if let Some(duplicate) = stream_cols
        .iter()
        .map(|&col| cell(header, col))
        .find(|name| !seen.insert(*name))
    {
        return Err(LcaError::MalformedSheet {
            sheet: sheet.to_string(),
            missing: format!("a unique name for stream '{duplicate}'"),
        });
    }

    let rows = &grid[header_index + 1..];
    let mut row_index = HashMap::new();
    for (index, row) in rows.iter().enumerate() {
        let label = cell(row, label_col);
        if !label.is_empty() {
            row_index.entry(label).or_insert(index);
        }
    }

    Ok(AttributeTable {
        sheet,
        header,
        rows,
        label_col,
        units_col,
        stream_cols,
        row_index,
    })
}

/// Splits the streams of a material sheet into process inputs and outputs.
///
/// `grid` must already have banner rows and leading columns removed so that
/// the first non-empty row is the `Stream Name` header.
pub fn parse_material_sheet(grid: &RawSheet) -> Result<MaterialTables> {
    let table = attribute_table(MATERIAL_SHEET, &grid.rows, &[STREAM_NAME])?;
    if table.label_col != 0 || cell(table.header, table.units_col) != UNITS {
        return Err(LcaError::MalformedSheet {
            sheet: MATERIAL_SHEET.into(),
            missing: format!("the '{UNITS}' column next to '{STREAM_NAME}'"),
        });
    }

    let from = table.row(FROM)?;
    let to = table.row(TO)?;
    let mass = table.row(MASS_FLOWS)?;
    let volume = table.row(VOLUME_FLOW)?;
    let mass_unit = table.unit(MASS_FLOWS)?;
    let volume_unit = table.unit(VOLUME_FLOW)?;

    if table.stream_cols.is_empty() {
        return Err(LcaError::EmptyInput {
            sheet: MATERIAL_SHEET.into(),
        });
    }

    let mut tables = MaterialTables::default();
    for &col in &table.stream_cols {
        let name = table.stream_name(col);
        let has_source = !cell(from, col).is_empty();
        let has_destination = !cell(to, col).is_empty();

        let direction = match (has_source, has_destination) {
            (true, false) => FlowDirection::Output,
            (false, true) => FlowDirection::Input,
            _ => {
                debug!(stream = name, "dropping internal or unconnected stream");
                tables.dropped.push(name.to_string());
                continue;
            }
        };

        let mut record = FlowRecord::new(name, direction);
        record.mass_flow = table.quantity(mass, MASS_FLOWS, col, mass_unit)?;
        record.volume_flow = table.quantity(volume, VOLUME_FLOW, col, volume_unit)?;

        match direction {
            FlowDirection::Output => tables.outputs.push(record),
            _ => tables.inputs.push(record),
        }
    }

    info!(
        inputs = tables.inputs.len(),
        outputs = tables.outputs.len(),
        dropped = tables.dropped.len(),
        "parsed material sheet"
    );

    if tables.inputs.is_empty() && tables.outputs.is_empty() {
        return Err(LcaError::EmptyInput {
            sheet: MATERIAL_SHEET.into(),
        });
    }

    Ok(tables)
}

/// Reads utility streams (steam, cooling water, electricity, ...) from the
/// utility sheet.
pub fn parse_utility_sheet(grid: &RawSheet) -> Result<Vec<FlowRecord>> {
    let table = attribute_table(UTILITY_SHEET, &grid.rows, &[UTILITY_ID, STREAM_NAME])?;

    let utility_type = table.row(UTILITY_TYPE)?;
    let fuel_source = table.row(FUEL_SOURCE)?;
    let mass = table.row(UTILITY_MASS_FLOW)?;
    let duty = table.row(DUTY)?;
    let mass_unit = table.unit(UTILITY_MASS_FLOW)?;
    let energy_unit = table.unit(DUTY)?;

    if table.stream_cols.is_empty() {
        return Err(LcaError::EmptyInput {
            sheet: UTILITY_SHEET.into(),
        });
    }

    let mut utilities = Vec::with_capacity(table.stream_cols.len());
    for &col in &table.stream_cols {
        let mut record = FlowRecord::new(table.stream_name(col), FlowDirection::Utility);
        record.utility_type = Some(cell(utility_type, col))
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        record.fuel_source = Some(cell(fuel_source, col))
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        record.mass_flow = table.quantity(mass, UTILITY_MASS_FLOW, col, mass_unit)?;
        record.duty = table.quantity(duty, DUTY, col, energy_unit)?;
        utilities.push(record);
    }

    info!(utilities = utilities.len(), "parsed utility sheet");
    Ok(utilities)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn material(rows: &[&[&str]]) -> RawSheet {
        RawSheet::from_rows(MATERIAL_SHEET, rows)
    }

    fn standard_material() -> RawSheet {
        material(&[
            &["Stream Name", "Units", "FEED", "PRODUCT", "RECYCLE", "VENT"],
            &["Description", "", "", "", "", ""],
            &["From", "", "", "B1", "B2", "B3"],
            &["To", "", "B1", "", "B1", ""],
            &["Mass Flows", "kg/hr", "500", "1000", "80", "20"],
            &["Volume Flow", "l/min", "100", "", "10", "5"],
        ])
    }

    #[test]
    fn streams_are_split_by_their_connections() {
        let tables = parse_material_sheet(&standard_material()).unwrap();
        let inputs: Vec<&str> = tables.inputs.iter().map(|r| r.name.as_str()).collect();
        let outputs: Vec<&str> = tables.outputs.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(inputs, vec!["FEED"]);
        assert_eq!(outputs, vec!["PRODUCT", "VENT"]);
        assert_eq!(tables.dropped, vec!["RECYCLE"]);
        assert_eq!(tables.stream_count(), 4);
    }

    #[test]
    fn magnitudes_are_converted_to_canonical_units() {
        let tables = parse_material_sheet(&standard_material()).unwrap();
        let feed = &tables.inputs[0];
        assert_eq!(feed.mass_flow, Some(500.0));
        assert!((feed.volume_flow.unwrap() - 6.0).abs() < 1e-12);
        assert_eq!(tables.outputs[0].volume_flow, None);
    }

    #[test]
    fn unconnected_streams_are_dropped_and_counted() {
        let sheet = material(&[
            &["Stream Name", "Units", "A", "B", "C"],
            &["From", "", "", "B1", ""],
            &["To", "", "B2", "", ""],
            &["Mass Flows", "tonne/year", "8760", "8760", "1"],
            &["Volume Flow", "l/min", "", "", ""],
        ]);
        let tables = parse_material_sheet(&sheet).unwrap();
        assert_eq!(tables.inputs.len() + tables.outputs.len(), 2);
        assert_eq!(tables.dropped, vec!["C"]);
        assert!((tables.inputs[0].mass_flow.unwrap() - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn missing_rows_are_named() {
        let sheet = material(&[
            &["Stream Name", "Units", "A"],
            &["From", "", ""],
            &["To", "", "B1"],
            &["Mass Flows", "kg/hr", "1"],
        ]);
        match parse_material_sheet(&sheet).unwrap_err() {
            LcaError::MalformedSheet { sheet, missing } => {
                assert_eq!(sheet, "Material");
                assert!(missing.contains("Volume Flow"), "{missing}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unsupported_sheet_units_fail_the_upload() {
        let sheet = material(&[
            &["Stream Name", "Units", "A"],
            &["From", "", ""],
            &["To", "", "B1"],
            &["Mass Flows", "lb/hr", "1"],
            &["Volume Flow", "l/min", "1"],
        ]);
        assert!(matches!(
            parse_material_sheet(&sheet),
            Err(LcaError::UnsupportedUnit { .. })
        ));
    }

    #[test]
    fn sheets_without_stream_columns_are_empty_input() {
        let sheet = material(&[
            &["Stream Name", "Units"],
            &["From", ""],
            &["To", ""],
            &["Mass Flows", "kg/hr"],
            &["Volume Flow", "l/min"],
        ]);
        assert!(matches!(
            parse_material_sheet(&sheet),
            Err(LcaError::EmptyInput { .. })
        ));
        assert!(matches!(
            parse_material_sheet(&material(&[])),
            Err(LcaError::EmptyInput { .. })
        ));
    }

    #[test]
    fn non_numeric_magnitudes_name_the_stream() {
        let sheet = material(&[
            &["Stream Name", "Units", "FEED"],
            &["From", "", ""],
            &["To", "", "B1"],
            &["Mass Flows", "kg/hr", "n/a"],
            &["Volume Flow", "l/min", ""],
        ]);
        match parse_material_sheet(&sheet).unwrap_err() {
            LcaError::MalformedSheet { missing, .. } => assert!(missing.contains("FEED")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn repeated_stream_names_are_rejected() {
        let sheet = material(&[
            &["Stream Name", "Units", "FEED", "PRODUCT", "FEED"],
            &["From", "", "", "B1", ""],
            &["To", "", "B1", "", "B2"],
            &["Mass Flows", "kg/hr", "500", "1000", "20"],
            &["Volume Flow", "l/min", "", "", ""],
        ]);
        match parse_material_sheet(&sheet).unwrap_err() {
            LcaError::MalformedSheet { sheet, missing } => {
                assert_eq!(sheet, "Material");
                assert!(missing.contains("'FEED'"), "{missing}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    fn utility_sheet() -> RawSheet {
        RawSheet::from_rows(
            UTILITY_SHEET,
            &[
                &["Utility ID", "", "LP-STEAM", "ELEC"],
                &["Description", "", "", ""],
                &["Utility type", "", "Steam", "Electricity"],
                &["Ultimate fuel source", "", "Natural gas", ""],
                &["Mass flow", "kg/hr", "250", ""],
                &["Duty", "MJ/hr", "100", "36"],
            ],
        )
    }

    #[test]
    fn utilities_carry_mass_flow_duty_and_descriptors() {
        let utilities = parse_utility_sheet(&utility_sheet()).unwrap();
        assert_eq!(utilities.len(), 2);
        let steam = &utilities[0];
        assert_eq!(steam.name, "LP-STEAM");
        assert_eq!(steam.direction, FlowDirection::Utility);
        assert_eq!(steam.mass_flow, Some(250.0));
        assert_eq!(steam.duty, Some(100.0));
        assert_eq!(steam.utility_type.as_deref(), Some("Steam"));
        assert_eq!(utilities[1].fuel_source, None);
        assert_eq!(utilities[1].mass_flow, None);
    }

    #[test]
    fn utility_sheet_requires_duty_row() {
        let sheet = RawSheet::from_rows(
            UTILITY_SHEET,
            &[
                &["Utility ID", "", "LP-STEAM"],
                &["Utility type", "", "Steam"],
                &["Ultimate fuel source", "", "Natural gas"],
                &["Mass flow", "kg/hr", "250"],
            ],
        );
        match parse_utility_sheet(&sheet).unwrap_err() {
            LcaError::MalformedSheet { sheet, missing } => {
                assert_eq!(sheet, "Utility");
                assert_eq!(missing, "the 'Duty' row");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn repeated_utility_ids_are_rejected() {
        let sheet = RawSheet::from_rows(
            UTILITY_SHEET,
            &[
                &["Utility ID", "", "LP-STEAM", "LP-STEAM"],
                &["Utility type", "", "Steam", "Steam"],
                &["Ultimate fuel source", "", "Natural gas", "Natural gas"],
                &["Mass flow", "kg/hr", "250", "10"],
                &["Duty", "MJ/hr", "100", "4"],
            ],
        );
        match parse_utility_sheet(&sheet).unwrap_err() {
            LcaError::MalformedSheet { sheet, missing } => {
                assert_eq!(sheet, "Utility");
                assert!(missing.contains("'LP-STEAM'"), "{missing}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn utility_sheet_without_utilities_is_empty_input() {
        let sheet = RawSheet::from_rows(
            UTILITY_SHEET,
            &[
                &["Utility ID", ""],
                &["Utility type", ""],
                &["Ultimate fuel source", ""],
                &["Mass flow", "kg/hr"],
                &["Duty", "MJ/hr"],
            ],
        );
        assert!(matches!(
            parse_utility_sheet(&sheet),
            Err(LcaError::EmptyInput { .. })
        ));
    }
}

//! Downloadable renderings of an impact report.

use std::fs;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD as Base64Engine, Engine as _};
use chrono::Utc;
use rust_xlsxwriter::{Format, Workbook};
use serde::Serialize;
use tracing::info;

use crate::errors::{LcaError, Result};
use crate::model::{ImpactReport, ImpactResultRow};

pub const RESULTS_SHEET: &str = "LCA results";
pub const TOTALS_SHEET: &str = "Totals";

/// Column order of the long-form result table.
pub const RESULT_COLUMNS: [&str; 8] = [
    "Stream Name",
    "Type",
    "Activity",
    "Act unit",
    "Amount",
    "Impact category",
    "Impact unit",
    "Impact",
];

const XLSX_MIME_TYPE: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Encoded workbook ready to hand to a browser download.
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedSpreadsheet {
    pub filename: String,
    pub mime_type: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

fn text_cells(row: &ImpactResultRow) -> [String; 4] {
    [
        row.stream_name.clone(),
        row.flow_type.label().to_string(),
        row.activity.clone(),
        row.activity_unit
            .as_ref()
            .map(|unit| unit.label().to_string())
            .unwrap_or_default(),
    ]
}

/// Builds an xlsx workbook with one row per flow and category, followed by
/// a sheet of category totals.
pub fn results_workbook(report: &ImpactReport) -> Result<Vec<u8>> {
    let export_error = |context: &str, err: rust_xlsxwriter::XlsxError| {
        LcaError::Export(format!("unable to {context}: {err}"))
    };

    let mut workbook = Workbook::new();
    let header_format = Format::new().set_bold();

    {
        let sheet = workbook.add_worksheet();
        sheet
            .set_name(RESULTS_SHEET)
            .map_err(|err| export_error("configure the results worksheet", err))?;

        for (col_index, header) in RESULT_COLUMNS.iter().enumerate() {
            sheet
                .write_string_with_format(0, col_index as u16, *header, &header_format)
                .map_err(|err| export_error("write the results header row", err))?;
        }

        for (row_index, entry) in report.rows.iter().enumerate() {
            let row = (row_index + 1) as u32;
            let [stream, flow_type, activity, activity_unit] = text_cells(entry);
            sheet
                .write_string(row, 0, stream)
                .map_err(|err| export_error("write the stream name", err))?;
            sheet
                .write_string(row, 1, flow_type)
                .map_err(|err| export_error("write the flow type", err))?;
            sheet
                .write_string(row, 2, activity)
                .map_err(|err| export_error("write the activity", err))?;
            sheet
                .write_string(row, 3, activity_unit)
                .map_err(|err| export_error("write the activity unit", err))?;
            sheet
                .write_number(row, 4, entry.amount)
                .map_err(|err| export_error("write the amount", err))?;
            sheet
                .write_string(row, 5, entry.impact_category.as_str())
                .map_err(|err| export_error("write the impact category", err))?;
            sheet
                .write_string(row, 6, entry.impact_unit.as_str())
                .map_err(|err| export_error("write the impact unit", err))?;
            sheet
                .write_number(row, 7, entry.impact)
                .map_err(|err| export_error("write the impact score", err))?;
        }
    }

    {
        let sheet = workbook.add_worksheet();
        sheet
            .set_name(TOTALS_SHEET)
            .map_err(|err| export_error("configure the totals worksheet", err))?;
        for (col_index, header) in ["Impact category", "Impact unit", "Total"].iter().enumerate() {
            sheet
                .write_string_with_format(0, col_index as u16, *header, &header_format)
                .map_err(|err| export_error("write the totals header row", err))?;
        }
        for (row_index, (category, total)) in report.totals_by_category.iter().enumerate() {
            let row = (row_index + 1) as u32;
            sheet
                .write_string(row, 0, category.as_str())
                .map_err(|err| export_error("write the total category", err))?;
            sheet
                .write_string(row, 1, total.unit.as_str())
                .map_err(|err| export_error("write the total unit", err))?;
            sheet
                .write_number(row, 2, total.score)
                .map_err(|err| export_error("write the total score", err))?;
        }
    }

    workbook
        .save_to_buffer()
        .map_err(|err| export_error("save the results workbook", err))
}

pub fn default_results_workbook_name() -> String {
    let timestamp = Utc::now().format("%Y%m%d-%H%M%S");
    format!("lca_results_{timestamp}.xlsx")
}

/// Base64-encoded results workbook with a timestamped file name.
pub fn download_payload(report: &ImpactReport) -> Result<GeneratedSpreadsheet> {
    let workbook_bytes = results_workbook(report)?;
    Ok(GeneratedSpreadsheet {
        filename: default_results_workbook_name(),
        mime_type: XLSX_MIME_TYPE.into(),
        content: Base64Engine.encode(workbook_bytes),
        encoding: Some("base64".into()),
    })
}

pub fn write_results_csv(report: &ImpactReport, path: &Path) -> Result<()> {
    let csv_error =
        |err: csv::Error| LcaError::Export(format!("unable to write {}: {err}", path.display()));

    let mut writer = csv::Writer::from_path(path).map_err(csv_error)?;
    writer.write_record(RESULT_COLUMNS).map_err(csv_error)?;
    for entry in &report.rows {
        let [stream, flow_type, activity, activity_unit] = text_cells(entry);
        writer
            .write_record([
                stream,
                flow_type,
                activity,
                activity_unit,
                entry.amount.to_string(),
                entry.impact_category.clone(),
                entry.impact_unit.clone(),
                entry.impact.to_string(),
            ])
            .map_err(csv_error)?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes the report to `path`, as csv when the extension asks for it and
/// as an xlsx workbook otherwise.
pub fn write_results(report: &ImpactReport, path: &Path) -> Result<()> {
    let is_csv = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("csv"))
        .unwrap_or(false);

    if is_csv {
        write_results_csv(report, path)?;
    } else {
        fs::write(path, results_workbook(report)?)?;
    }
    info!(path = %path.display(), rows = report.rows.len(), "wrote impact results");
    Ok(())
}

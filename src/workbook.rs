//! Decoding of uploaded spreadsheets into plain string grids.

use std::io::{BufRead, Cursor, Read, Seek};

use base64::{engine::general_purpose::STANDARD as Base64Engine, Engine as _};
use calamine::{open_workbook_from_rs, DataType, Reader, Xls, Xlsb, Xlsx};
use tracing::debug;

use crate::errors::{LcaError, Result};

const EXCEL_EXTENSIONS: &[&str] = &["xlsx", "xlsm", "xls", "xlsb"];
const DELIMITED_EXTENSIONS: &[&str] = &["csv", "tsv", "txt"];

/// Worksheet contents as trimmed strings, all rows padded to the same width.
///
/// Row and column indexes are absolute: row 0 is the first row of the sheet
/// even when the used range starts further down.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawSheet {
    pub name: String,
    pub rows: Vec<Vec<String>>,
}

impl RawSheet {
    pub fn new(name: impl Into<String>, mut rows: Vec<Vec<String>>) -> Self {
        align_row_lengths(&mut rows);
        Self {
            name: name.into(),
            rows,
        }
    }

    pub fn from_rows(name: &str, rows: &[&[&str]]) -> Self {
        Self::new(
            name,
            rows.iter()
                .map(|row| row.iter().map(|cell| cell.trim().to_string()).collect())
                .collect(),
        )
    }

    pub fn trimmed(&self, rows: usize, columns: usize) -> Self {
        Self {
            name: self.name.clone(),
            rows: self
                .rows
                .iter()
                .skip(rows)
                .map(|row| row.iter().skip(columns).cloned().collect())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpreadsheetKind {
    Xlsx,
    Xls,
    Xlsb,
    Delimited,
}

fn spreadsheet_kind(filename: &str) -> Result<SpreadsheetKind> {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "xlsx" | "xlsm" => Ok(SpreadsheetKind::Xlsx),
        "xls" => Ok(SpreadsheetKind::Xls),
        "xlsb" => Ok(SpreadsheetKind::Xlsb),
        ext if DELIMITED_EXTENSIONS.contains(&ext) => Ok(SpreadsheetKind::Delimited),
        _ => Err(LcaError::UnreadableUpload {
            filename: filename.to_string(),
            reason: format!(
                "upload a spreadsheet ({})",
                EXCEL_EXTENSIONS
                    .iter()
                    .chain(DELIMITED_EXTENSIONS)
                    .map(|ext| format!(".{ext}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }),
    }
}

/// Decodes upload contents of the form `data:<mime>;base64,<payload>`.
///
/// A bare base64 payload without the data-URL prefix is accepted as well.
pub fn decode_upload(contents: &str, filename: &str) -> Result<Vec<u8>> {
    let payload = match contents.split_once(',') {
        Some((header, payload)) if header.starts_with("data:") => {
            if !header.ends_with(";base64") {
                return Err(LcaError::UnreadableUpload {
                    filename: filename.to_string(),
                    reason: "the upload is not base64 encoded".into(),
                });
            }
            payload
        }
        _ => contents,
    };

    Base64Engine
        .decode(payload.trim().as_bytes())
        .map_err(|err| LcaError::UnreadableUpload {
            filename: filename.to_string(),
            reason: format!("unable to decode the upload: {err}"),
        })
}

/// Reads one worksheet from spreadsheet bytes.
///
/// `sheet_name` selects a worksheet by name; `None` reads the first one.
/// Delimited files have a single sheet and ignore `sheet_name`.
pub fn read_sheet(bytes: &[u8], filename: &str, sheet_name: Option<&str>) -> Result<RawSheet> {
    let kind = spreadsheet_kind(filename)?;
    let cursor = Cursor::new(bytes.to_vec());
    let sheet = match kind {
        SpreadsheetKind::Xlsx => read_excel_sheet::<Xlsx<_>, _>(cursor, filename, sheet_name),
        SpreadsheetKind::Xls => read_excel_sheet::<Xls<_>, _>(cursor, filename, sheet_name),
        SpreadsheetKind::Xlsb => read_excel_sheet::<Xlsb<_>, _>(cursor, filename, sheet_name),
        SpreadsheetKind::Delimited => read_delimited_sheet(bytes, filename),
    }?;

    debug!(
        filename,
        sheet = %sheet.name,
        rows = sheet.rows.len(),
        "decoded spreadsheet"
    );
    Ok(sheet)
}

fn read_excel_sheet<R, RS>(
    reader: RS,
    filename: &str,
    sheet_name: Option<&str>,
) -> Result<RawSheet>
where
    RS: Read + Seek,
    R: Reader<RS>,
    R::Error: std::fmt::Display,
{
    let unreadable = |reason: String| LcaError::UnreadableUpload {
        filename: filename.to_string(),
        reason,
    };

    let mut workbook: R = open_workbook_from_rs(reader)
        .map_err(|err| unreadable(format!("unable to open the workbook: {err}")))?;

    let names = workbook.sheet_names().to_vec();
    let name = match sheet_name {
        Some(wanted) => names
            .iter()
            .find(|name| name.as_str() == wanted)
            .cloned()
            .ok_or_else(|| LcaError::MalformedSheet {
                sheet: wanted.to_string(),
                missing: format!("the '{wanted}' worksheet in {filename}"),
            })?,
        None => names
            .first()
            .cloned()
            .ok_or_else(|| unreadable("the workbook does not contain any worksheets".into()))?,
    };

    let range = workbook
        .worksheet_range(&name)
        .ok_or_else(|| unreadable(format!("unable to read the worksheet named '{name}'")))?
        .map_err(|err| unreadable(format!("unable to read the worksheet data: {err}")))?;

    let (start_row, start_col) = range
        .start()
        .map(|(row, col)| (row as usize, col as usize))
        .unwrap_or((0, 0));

    let mut rows: Vec<Vec<String>> = vec![Vec::new(); start_row];
    for row in range.rows() {
        let mut values = vec![String::new(); start_col];
        values.extend(row.iter().map(cell_to_string));
        rows.push(values);
    }

    Ok(RawSheet::new(name, rows))
}

fn read_delimited_sheet(bytes: &[u8], filename: &str) -> Result<RawSheet> {
    let delimiter = detect_delimiter(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| LcaError::UnreadableUpload {
            filename: filename.to_string(),
            reason: format!("unable to read spreadsheet rows: {err}"),
        })?;
        rows.push(
            record
                .iter()
                .map(|value| value.trim().to_string())
                .collect(),
        );
    }

    let name = filename
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(filename);
    Ok(RawSheet::new(name, rows))
}

fn cell_to_string(cell: &DataType) -> String {
    match cell {
        DataType::Empty => String::new(),
        _ => cell.to_string().trim().to_string(),
    }
}

fn align_row_lengths(rows: &mut [Vec<String>]) {
    let column_count = rows.iter().map(Vec::len).max().unwrap_or(0);
    for row in rows.iter_mut() {
        if row.len() < column_count {
            row.resize(column_count, String::new());
        }
    }
}

fn detect_delimiter(data: &[u8]) -> u8 {
    for line in Cursor::new(data).lines().take(5) {
        let Ok(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let counts = [
            (b'\t', line.matches('\t').count()),
            (b',', line.matches(',').count()),
            (b';', line.matches(';').count()),
        ];

        if let Some((delimiter, count)) = counts.iter().max_by_key(|(_, count)| *count) {
            if *count > 0 {
                return *delimiter;
            }
        }
    }

    b'\t'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_url_uploads_are_decoded() {
        let encoded = Base64Engine.encode(b"Stream Name,Units\n");
        let contents = format!("data:text/csv;base64,{encoded}");
        let bytes = decode_upload(&contents, "material.csv").unwrap();
        assert_eq!(bytes, b"Stream Name,Units\n");
    }

    #[test]
    fn non_base64_data_urls_are_rejected() {
        let err = decode_upload("data:text/csv,plain", "material.csv").unwrap_err();
        assert!(matches!(err, LcaError::UnreadableUpload { .. }));
    }

    #[test]
    fn unsupported_extensions_are_rejected() {
        let err = read_sheet(b"", "flows.pdf", None).unwrap_err();
        match err {
            LcaError::UnreadableUpload { filename, reason } => {
                assert_eq!(filename, "flows.pdf");
                assert!(reason.contains(".xlsx"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn delimited_sheets_are_padded_to_a_rectangle() {
        let sheet = read_sheet(b"a;b;c\nd\n", "utility.csv", None).unwrap();
        assert_eq!(sheet.name, "utility");
        assert_eq!(
            sheet.rows,
            vec![
                vec!["a".to_string(), "b".into(), "c".into()],
                vec!["d".to_string(), String::new(), String::new()],
            ]
        );
    }

    #[test]
    fn tab_is_the_default_delimiter() {
        assert_eq!(detect_delimiter(b"single\n"), b'\t');
        assert_eq!(detect_delimiter(b"x\ty,z\tw\n"), b'\t');
    }

    #[test]
    fn trimmed_drops_banner_rows_and_leading_columns() {
        let sheet = RawSheet::from_rows(
            "Material",
            &[&["banner", "", "", ""], &["", "", "Stream Name", "S1"]],
        );
        let trimmed = sheet.trimmed(1, 2);
        assert_eq!(
            trimmed.rows,
            vec![vec!["Stream Name".to_string(), "S1".into()]]
        );
    }
}

//! Tabular result artifacts.
//!
//! Rows are built from [`WorkerResult`]s in the order given, generated text is
//! sanitised, and the table is written with the first [`TableWriter`] that
//! succeeds: an `.xlsx` workbook first, RFC 4180 CSV second.

use std::fs;
use std::path::{Path, PathBuf};

use csv::WriterBuilder;
use rust_xlsxwriter::{Format, Workbook};

use crate::error::ArtifactError;
use crate::generator::cell_text;
use crate::job::{SKIPPED_MARKER, WorkerResult};

/// Largest cell a spreadsheet will hold.
pub const SPREADSHEET_CELL_LIMIT: usize = 32_767;
/// Rows per worksheet, header included.
pub const SPREADSHEET_ROW_LIMIT: usize = 1_048_576;
/// Columns per worksheet.
pub const SPREADSHEET_COLUMN_LIMIT: usize = 16_384;

const META_COLUMNS: [&str; 5] = ["status", "model_used", "error_kind", "retry_count", "row_index"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    /// One row per result, in the order given. Payload fields come first, in
    /// first-seen order; a payload field that collides with a generated column
    /// is renamed `input_<name>`.
    ///
    /// Single-step results fill `output_column`. When any result carries
    /// per-step outputs, their columns replace it, in first-seen order.
    pub fn from_results(results: &[WorkerResult], output_column: &str) -> Self {
        let mut generated: Vec<&str> = Vec::new();
        for result in results {
            for step in &result.outputs {
                if !generated.contains(&step.column.as_str()) {
                    generated.push(&step.column);
                }
            }
        }
        if generated.is_empty() {
            generated.push(output_column);
        }
        let reserved = |name: &str| generated.contains(&name) || META_COLUMNS.contains(&name);

        let mut fields: Vec<&str> = Vec::new();
        for result in results {
            for key in result.payload.keys() {
                if !fields.contains(&key.as_str()) {
                    fields.push(key);
                }
            }
        }

        let mut columns: Vec<String> = fields
            .iter()
            .map(|f| {
                if reserved(f) {
                    format!("input_{f}")
                } else {
                    f.to_string()
                }
            })
            .collect();
        columns.extend(generated.iter().map(|c| c.to_string()));
        columns.extend(META_COLUMNS.iter().map(|c| c.to_string()));

        let rows = results
            .iter()
            .map(|r| {
                let mut row: Vec<String> = fields
                    .iter()
                    .map(|f| r.payload.get(*f).map(cell_text).unwrap_or_default())
                    .collect();
                row.extend(
                    generated
                        .iter()
                        .enumerate()
                        .map(|(position, column)| sanitize_text(&generated_cell(r, position, column))),
                );
                row.push(r.status.to_string());
                row.push(r.model_used.clone());
                row.push(r.error_kind.map(|k| k.to_string()).unwrap_or_default());
                row.push(r.retry_count.map(|n| n.to_string()).unwrap_or_default());
                row.push(r.index.to_string());
                row
            })
            .collect();

        Self { columns, rows }
    }
}

/// Text for generated column `column` of `result`. The first column falls
/// back to `output`; a later one the row never produced is marked skipped on
/// error rows and left empty otherwise.
fn generated_cell(result: &WorkerResult, position: usize, column: &str) -> String {
    if let Some(step) = result.outputs.iter().find(|s| s.column == column) {
        return step.text.clone();
    }
    if position == 0 {
        result.output.clone()
    } else if result.is_success() {
        String::new()
    } else {
        format!("{SKIPPED_MARKER}: task incomplete")
    }
}

/// Strip NUL and other control characters, keeping newline, carriage return and tab.
pub fn sanitize_text(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .collect()
}

/// Where and how an artifact was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub format: &'static str,
    pub rows: usize,
}

pub trait TableWriter: Send + Sync {
    fn name(&self) -> &'static str;
    fn extension(&self) -> &'static str;
    fn write(&self, path: &Path, table: &Table) -> Result<(), ArtifactError>;
}

/// Single-sheet `.xlsx` workbook with a bold header row.
///
/// Rejects tables a spreadsheet cannot hold so the chain can fall back.
#[derive(Debug, Clone)]
pub struct XlsxWriter {
    pub max_cell_len: usize,
}

impl Default for XlsxWriter {
    fn default() -> Self {
        Self {
            max_cell_len: SPREADSHEET_CELL_LIMIT,
        }
    }
}

impl XlsxWriter {
    fn check_fits(&self, table: &Table) -> Result<(), ArtifactError> {
        if table.rows.len() >= SPREADSHEET_ROW_LIMIT || table.columns.len() > SPREADSHEET_COLUMN_LIMIT {
            return Err(ArtifactError::TableTooLarge {
                rows: table.rows.len(),
                columns: table.columns.len(),
            });
        }
        if let Some(len) = table
            .columns
            .iter()
            .chain(table.rows.iter().flatten())
            .map(|cell| cell.chars().count())
            .find(|len| *len > self.max_cell_len)
        {
            return Err(ArtifactError::CellTooLarge {
                len,
                limit: self.max_cell_len,
            });
        }
        Ok(())
    }
}

impl TableWriter for XlsxWriter {
    fn name(&self) -> &'static str {
        "xlsx"
    }

    fn extension(&self) -> &'static str {
        "xlsx"
    }

    fn write(&self, path: &Path, table: &Table) -> Result<(), ArtifactError> {
        self.check_fits(table)?;

        let mut workbook = Workbook::new();
        let bold = Format::new().set_bold();
        let sheet = workbook.add_worksheet();
        sheet.set_name("results")?;

        for (col, name) in (0u16..).zip(&table.columns) {
            sheet.write_string_with_format(0, col, name.as_str(), &bold)?;
        }
        for (row, cells) in (1u32..).zip(&table.rows) {
            for (col, cell) in (0u16..).zip(cells) {
                if !cell.is_empty() {
                    sheet.write_string(row, col, cell.as_str())?;
                }
            }
        }
        workbook.save(path)?;
        Ok(())
    }
}

/// RFC 4180 CSV. Accepts any table.
#[derive(Debug, Clone, Default)]
pub struct CsvWriter;

impl TableWriter for CsvWriter {
    fn name(&self) -> &'static str {
        "csv"
    }

    fn extension(&self) -> &'static str {
        "csv"
    }

    fn write(&self, path: &Path, table: &Table) -> Result<(), ArtifactError> {
        let mut writer = WriterBuilder::new().from_path(path)?;
        writer.write_record(&table.columns)?;
        for row in &table.rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// The default writer chain: workbook, then CSV.
pub fn default_writers() -> Vec<Box<dyn TableWriter>> {
    vec![Box::new(XlsxWriter::default()), Box::new(CsvWriter)]
}

/// Write `table` to `<dir>/<stem>.<ext>` using the first writer that succeeds.
/// Partial files left by a failed writer are removed.
pub fn write_with_fallback(
    dir: &Path,
    stem: &str,
    table: &Table,
    writers: &[Box<dyn TableWriter>],
) -> Result<Artifact, ArtifactError> {
    fs::create_dir_all(dir)?;
    let mut failures = Vec::new();
    for writer in writers {
        let path = dir.join(format!("{stem}.{}", writer.extension()));
        match writer.write(&path, table) {
            Ok(()) => {
                return Ok(Artifact {
                    path,
                    format: writer.name(),
                    rows: table.rows.len(),
                });
            }
            Err(e) => {
                tracing::warn!(
                    format = writer.name(),
                    path = %path.display(),
                    error = %e,
                    "Artifact format failed, trying next",
                );
                let _ = fs::remove_file(&path);
                failures.push(format!("{}: {e}", writer.name()));
            }
        }
    }
    Err(ArtifactError::AllFormatsFailed(failures.join("; ")))
}

//! Reads submitted rows from a file: a JSON array of objects, or CSV with a header row.

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde_json::Value;

use crate::job::Payload;

pub fn read_rows(path: &Path) -> Result<Vec<Payload>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let is_json = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => ext.eq_ignore_ascii_case("json"),
        None => raw.trim_start().starts_with('['),
    };
    let rows = if is_json {
        parse_json(&raw).with_context(|| format!("parsing {} as JSON", path.display()))?
    } else {
        parse_csv(&raw).with_context(|| format!("parsing {} as CSV", path.display()))?
    };
    tracing::debug!(path = %path.display(), rows = rows.len(), json = is_json, "Input loaded");
    Ok(rows)
}

pub fn parse_json(raw: &str) -> Result<Vec<Payload>> {
    let Value::Array(items) = serde_json::from_str::<Value>(raw)? else {
        bail!("expected a JSON array of objects");
    };
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(row) => Ok(row),
            other => bail!("row {i} is not an object: {other}"),
        })
        .collect()
}

pub fn parse_csv(raw: &str) -> Result<Vec<Payload>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::Headers)
        .from_reader(raw.as_bytes());
    let headers = reader.headers()?.clone();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row: Payload = headers
            .iter()
            .zip(record.iter())
            .map(|(field, value)| (field.to_string(), Value::String(value.to_string())))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use dropline_config::ClientDefaults;
use tracing::info;

use crate::PipelineError;
use crate::address::Record;

const TRACKING_FIELDS: [&str; 7] = [
    "full_name",
    "postcode",
    "service",
    "weight_kg",
    "reference",
    "notes",
    "review_flag",
];

/// Write the headerless label-import CSV.
///
/// Client defaults fill empty service and country values, a configured
/// reference prefix numbers records that carry no reference, and each field
/// lands in the 1-based column its mapping names. Unmapped columns stay
/// empty so the file lines up with the carrier's import template.
pub fn write_ready_csv(
    records: &[Record],
    out_path: &Path,
    mapping: &BTreeMap<String, u32>,
    defaults: &ClientDefaults,
) -> Result<PathBuf, PipelineError> {
    if records.is_empty() {
        return Err(PipelineError::NoRecords);
    }

    let mut rows = records.to_vec();
    merge_defaults(&mut rows, defaults);
    apply_reference_prefix(&mut rows, defaults.reference_prefix.as_deref());

    let output_path = ensure_csv_extension(out_path);
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let width = mapping.values().copied().max().unwrap_or(0) as usize;
    let mut writer = csv::Writer::from_path(&output_path)?;
    for record in &rows {
        let mut cells = vec![String::new(); width];
        for (field, column) in mapping {
            if *column < 1 {
                continue;
            }
            if let Some(value) = field_value(record, field) {
                cells[*column as usize - 1] = value;
            }
        }
        writer.write_record(&cells)?;
    }
    writer.flush()?;

    info!(path = %output_path.display(), rows = rows.len(), "wrote ready csv");
    Ok(output_path)
}

/// Write the operator-facing tracking CSV, header row included.
pub fn write_tracking_csv(records: &[Record], out_path: &Path) -> Result<PathBuf, PipelineError> {
    if records.is_empty() {
        return Err(PipelineError::NoRecords);
    }
    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut writer = csv::Writer::from_path(out_path)?;
    writer.write_record(TRACKING_FIELDS)?;
    for record in records {
        let weight = format_weight(record.weight_kg);
        writer.write_record([
            record.full_name.as_str(),
            record.postcode.as_str(),
            record.service.as_str(),
            weight.as_str(),
            record.reference.as_str(),
            record.notes.as_str(),
            if record.needs_review { "Yes" } else { "No" },
        ])?;
    }
    writer.flush()?;

    info!(path = %out_path.display(), rows = records.len(), "wrote tracking csv");
    Ok(out_path.to_path_buf())
}

// reference_prefix is handled separately; it numbers records instead of
// filling a field.
fn merge_defaults(records: &mut [Record], defaults: &ClientDefaults) {
    for record in records {
        if record.service.trim().is_empty() {
            record.service = defaults.service.clone();
        }
        if record.country.trim().is_empty() {
            record.country = defaults
                .country
                .clone()
                .unwrap_or_else(|| "UNITED KINGDOM".to_string());
        }
    }
}

fn apply_reference_prefix(records: &mut [Record], prefix: Option<&str>) {
    let Some(prefix) = prefix else {
        return;
    };
    if prefix.is_empty() {
        return;
    }
    for (index, record) in records.iter_mut().enumerate() {
        if !record.reference.is_empty() {
            continue;
        }
        record.reference = format!("{prefix}{}", index + 1);
    }
}

fn ensure_csv_extension(path: &Path) -> PathBuf {
    match path.extension() {
        Some(ext) if ext.eq_ignore_ascii_case("csv") => path.to_path_buf(),
        _ => path.with_extension("csv"),
    }
}

fn field_value(record: &Record, field: &str) -> Option<String> {
    let value = match field {
        "full_name" => record.full_name.trim().to_string(),
        "address_line_1" => record.address_line_1.trim().to_string(),
        "address_line_2" => record.address_line_2.trim().to_string(),
        "town_city" => record.town_city.trim().to_string(),
        "county" => record.county.trim().to_string(),
        "postcode" => record.postcode.trim().to_uppercase(),
        "country" => record.country.trim().to_uppercase(),
        "service" => record.service.trim().to_string(),
        "weight_kg" => format_weight(record.weight_kg),
        "reference" => record.reference.trim().to_string(),
        "phone" | "email" => String::new(),
        _ => return None,
    };
    Some(value)
}

// str(float) in most tools prints "1.0", and the downstream import expects
// that shape for whole weights.
pub(crate) fn format_weight(weight: f64) -> String {
    if weight == weight.trunc() {
        format!("{weight:.1}")
    } else {
        weight.to_string()
    }
}

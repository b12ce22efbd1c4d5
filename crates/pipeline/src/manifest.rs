//! Batch manifest records for the audit trail.
//!
//! Every processed batch leaves a small JSON manifest in the log directory so
//! an operator can answer "what produced this file" months later without the
//! original input.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use dropline_config::{ClientDefaults, RiskLevel};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::PipelineError;
use crate::address::Record;

pub const MANIFEST_VERSION: &str = "1.0";

static UNSAFE_FILENAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_.-]").unwrap());

/// Summary of the review pass over a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewSummary {
    pub assist_enabled: bool,
    pub auto_apply_max_risk: RiskLevel,
    pub flagged_count: usize,
    pub applied_count: usize,
}

/// Audit manifest for a single processing batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchManifest {
    pub manifest_version: String,
    pub batch_id: String,
    pub created_utc: String,
    pub client_id: String,
    pub source: String,
    pub input_files: Vec<String>,
    pub input_text_sha256: String,
    pub output_ready: String,
    pub output_tracking: String,
    pub record_count: usize,
    pub defaults_used: ClientDefaults,
    pub services_used_summary: BTreeMap<String, usize>,
    pub review: ReviewSummary,
    #[serde(default)]
    pub notes: Vec<String>,
}

/// SHA-256 hex digest of a text payload.
pub fn sha256_text(text: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Count records per service name. Records without a service land under
/// `"unknown"`.
pub fn services_summary(records: &[Record]) -> BTreeMap<String, usize> {
    let mut summary = BTreeMap::new();
    for record in records {
        let key = if record.service.trim().is_empty() {
            "unknown".to_string()
        } else {
            record.service.clone()
        };
        *summary.entry(key).or_insert(0) += 1;
    }
    summary
}

fn safe_filename(value: &str) -> String {
    let cleaned = value.trim().replace(' ', "_");
    let cleaned = UNSAFE_FILENAME.replace_all(&cleaned, "_");
    if cleaned.is_empty() {
        "client".to_string()
    } else {
        cleaned.into_owned()
    }
}

/// Write the manifest JSON into `out_dir` and return the written path.
///
/// The filename embeds the client, the batch date, and the batch id:
/// `client_01_2026-08-23_<uuid>.manifest.json`.
pub fn write_manifest(manifest: &BatchManifest, out_dir: &Path) -> Result<PathBuf, PipelineError> {
    if out_dir.as_os_str().is_empty() {
        return Err(PipelineError::MissingOutputDir);
    }
    fs::create_dir_all(out_dir)?;

    let created = DateTime::parse_from_rfc3339(&manifest.created_utc)
        .map(|stamp| stamp.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    let date_str = created.date_naive().to_string();
    let client_safe = safe_filename(&manifest.client_id);
    let filename = format!("{client_safe}_{date_str}_{}.manifest.json", manifest.batch_id);

    let path = out_dir.join(filename);
    let payload = serde_json::to_string_pretty(manifest)?;
    fs::write(&path, payload)?;
    Ok(path)
}

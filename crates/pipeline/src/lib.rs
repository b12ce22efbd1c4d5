//! Batch processing pipeline: raw pasted text in, carrier-ready CSV out.
//!
//! A batch is a text file of blank-line-separated chunks, one recipient per
//! chunk. Each chunk is parsed into an address record, matched against the
//! client's service rules, and written out three ways:
//!
//! * a headerless positional CSV for the carrier import,
//! * a tracking CSV for the operator,
//! * a JSON manifest for the audit trail.

pub mod address;
pub mod export;
pub mod manifest;
pub mod redact;
pub mod tagging;

pub use address::{Record, clean_line, is_probably_uk_postcode, normalize_uk_postcode, parse_batch};
pub use export::{write_ready_csv, write_tracking_csv};
pub use manifest::{
    BatchManifest, MANIFEST_VERSION, ReviewSummary, services_summary, sha256_text, write_manifest,
};
pub use redact::redact;
pub use tagging::{find_service_tag, parse_records};

use std::path::{Path, PathBuf};

use chrono::{Local, Utc};
use dropline_config::{ResolvedClient, RiskLevel};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no valid records were parsed from the input")]
    EmptyBatch,
    #[error("no records to write")]
    NoRecords,
    #[error("output directory is not set")]
    MissingOutputDir,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Per-batch knobs, normally filled from the daemon config.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub use_ai: bool,
    pub auto_apply_max_risk: RiskLevel,
    pub max_ai_calls: u32,
    /// Parse and report without writing any output files.
    pub dry_run: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            use_ai: false,
            auto_apply_max_risk: RiskLevel::Low,
            max_ai_calls: 50,
            dry_run: false,
        }
    }
}

/// What a pipeline run produced.
///
/// On a dry run the output paths are still filled in so callers can report
/// where files would have landed, but nothing exists on disk and
/// `manifest_path` is `None`.
#[derive(Debug)]
pub struct PipelineReport {
    pub records: Vec<Record>,
    pub output_ready: PathBuf,
    pub output_tracking: PathBuf,
    pub manifest_path: Option<PathBuf>,
    pub flagged_count: usize,
    pub applied_count: usize,
    pub dry_run: bool,
}

// A record with no postcode or no first address line cannot produce a valid
// label, so it gets surfaced in the tracking CSV instead of silently dropped.
fn flag_for_review(records: &mut [Record]) -> usize {
    let mut flagged = 0;
    for record in records.iter_mut() {
        record.needs_review =
            record.postcode.trim().is_empty() || record.address_line_1.trim().is_empty();
        if record.needs_review {
            flagged += 1;
        }
    }
    flagged
}

/// Run the full batch pipeline for one client and return output metadata.
///
/// `source` names where the batch came from (`watch_folder`, `telegram`,
/// `manual`) and is recorded in the manifest. The manifest itself is written
/// to `log_dir` so the audit trail survives clients clearing out their ready
/// folders.
pub fn run_pipeline(
    client: &ResolvedClient,
    raw_text: &str,
    input_files: &[String],
    source: &str,
    log_dir: &Path,
    options: &PipelineOptions,
) -> Result<PipelineReport, PipelineError> {
    let mut records = tagging::parse_records(raw_text, &client.services, &client.defaults);
    if records.is_empty() {
        warn!(
            client = %client.client_id,
            snippet = %redact(raw_text),
            "no records parsed from batch"
        );
        return Err(PipelineError::EmptyBatch);
    }

    let flagged_count = flag_for_review(&mut records);
    // Flag-only review, nothing is auto-applied.
    let applied_count = 0;
    if options.use_ai {
        warn!(
            max_calls = options.max_ai_calls,
            "assist requested but no backend is available, running flag-only review"
        );
    }

    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    let base_name = format!("{}_{timestamp}", client.client_id);
    let output_ready = client.folders.ready.join(format!("{base_name}.csv"));
    let output_tracking = client.folders.tracking.join(format!("{base_name}_tracking.csv"));

    let manifest_path = if options.dry_run {
        None
    } else {
        export::write_ready_csv(
            &records,
            &output_ready,
            &client.export.column_mapping,
            &client.defaults,
        )?;
        export::write_tracking_csv(&records, &output_tracking)?;

        let batch = BatchManifest {
            manifest_version: MANIFEST_VERSION.to_string(),
            batch_id: Uuid::new_v4().to_string(),
            created_utc: Utc::now().to_rfc3339(),
            client_id: client.client_id.clone(),
            source: source.to_string(),
            input_files: input_files.to_vec(),
            input_text_sha256: manifest::sha256_text(raw_text),
            output_ready: output_ready.display().to_string(),
            output_tracking: output_tracking.display().to_string(),
            record_count: records.len(),
            defaults_used: client.defaults.clone(),
            services_used_summary: manifest::services_summary(&records),
            review: ReviewSummary {
                assist_enabled: options.use_ai,
                auto_apply_max_risk: options.auto_apply_max_risk,
                flagged_count,
                applied_count,
            },
            notes: Vec::new(),
        };
        Some(manifest::write_manifest(&batch, log_dir)?)
    };

    info!(
        client = %client.client_id,
        records = records.len(),
        flagged = flagged_count,
        dry_run = options.dry_run,
        "batch processed"
    );

    Ok(PipelineReport {
        records,
        output_ready,
        output_tracking,
        manifest_path,
        flagged_count,
        applied_count,
        dry_run: options.dry_run,
    })
}

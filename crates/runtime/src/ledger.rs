//! Durable record of files the daemon has finished with.
//!
//! One JSON line per terminal outcome. The daemon reloads this at startup so
//! a restart cannot re-queue a file that was already archived or quarantined,
//! even if someone has since emptied the archive folder.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::outcome::TerminalOutcome;

/// One terminal outcome, as appended to the ledger file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeRecord {
    pub path: PathBuf,
    pub client_id: String,
    pub outcome: TerminalOutcome,
    /// Where the file ended up (archive or quarantine entry).
    pub moved_to: PathBuf,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct IntakeLedger {
    path: PathBuf,
}

impl IntakeLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, record: &IntakeRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let line = serde_json::to_string(record)?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        // Flush and fsync so the entry survives a crash right after the
        // matching archive/quarantine move.
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Atomically replace the ledger with a new set of records.
    ///
    /// Written to a `.tmp` sibling, fsync'd, then renamed over the original,
    /// so a crash at any point leaves either the old or the new file intact.
    pub async fn overwrite(&self, records: &[IntakeRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = {
            let filename = self
                .path
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_else(|| "intake_ledger.jsonl".to_string());
            self.path.with_file_name(format!("{filename}.tmp"))
        };

        let write_result: Result<()> = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .await?;
            for record in records {
                let line = serde_json::to_string(record)?;
                file.write_all(line.as_bytes()).await?;
                file.write_all(b"\n").await?;
            }
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;

        if let Err(err) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        if let Err(err) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }

        Ok(())
    }

    /// Load every readable record. Corrupt lines are skipped with a warning
    /// and preserved in a `.corrupt` sidecar for inspection.
    pub fn load(&self) -> Result<Vec<IntakeRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = fs::OpenOptions::new().read(true).open(&self.path)?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut corrupt_count = 0usize;

        for (line_idx, line_result) in reader.lines().enumerate() {
            let line = line_result?;
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<IntakeRecord>(&line) {
                Ok(record) => records.push(record),
                Err(err) => {
                    corrupt_count += 1;
                    tracing::warn!(
                        line = line_idx + 1,
                        error = %err,
                        path = %self.path.display(),
                        "corrupt ledger line, skipping"
                    );
                    let corrupt_path = self.path.with_extension("jsonl.corrupt");
                    if let Ok(mut sidecar) = fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&corrupt_path)
                    {
                        use std::io::Write as _;
                        let _ = writeln!(sidecar, "{line}");
                    }
                }
            }
        }

        if corrupt_count > 0 {
            tracing::warn!(
                corrupt_lines = corrupt_count,
                path = %self.path.display(),
                "ledger loaded with skipped lines, originals kept in the .corrupt sidecar"
            );
        }

        Ok(records)
    }

    /// Load the ledger, drop entries older than `retention`, and rewrite the
    /// file in place. The rewrite also sheds any corrupt lines `load` skipped.
    /// Returns the surviving records.
    pub async fn compact(&self, retention: chrono::Duration) -> Result<Vec<IntakeRecord>> {
        let records = self.load()?;
        let cutoff = Utc::now() - retention;
        let kept: Vec<IntakeRecord> = records
            .into_iter()
            .filter(|record| record.occurred_at >= cutoff)
            .collect();

        let before = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if before > 0 {
            self.overwrite(&kept).await?;
        }
        Ok(kept)
    }
}

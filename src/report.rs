//! Writes the JSON summary report for the `report` subcommand (spec.md §6).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::storage::db::Database;
use crate::types::{now_ts, SummaryReport};

/// Count rows whose stored evidence hash no longer matches what's on disk,
/// mirroring the `verify` subcommand's check so `report` can surface it too.
async fn count_evidence_mismatches(db: &Database) -> Result<i64> {
    let rows = db.iter_messages(None).await?;
    let mut mismatches = 0;
    for row in rows {
        let (Some(path), Some(expected)) = (row.eml_path.as_deref(), row.eml_sha256.as_deref()) else {
            continue;
        };
        match crate::mail::sha256_file_hex(Path::new(path)) {
            Ok(actual) if actual == expected => {}
            _ => mismatches += 1,
        }
    }
    Ok(mismatches)
}

/// Build a [`SummaryReport`] from the current ledger state and write it to
/// `{reports_dir}/summary-{iso timestamp}.json`.
pub async fn write_summary(db: &Database, reports_dir: &Path) -> Result<PathBuf> {
    let counts = db.counts_by_status().await?;
    let evidence_mismatches = count_evidence_mismatches(db).await?;

    let report = SummaryReport {
        created_at: now_ts(),
        sqlite_path: db.path().display().to_string(),
        counts,
        evidence_mismatches,
    };

    std::fs::create_dir_all(reports_dir)
        .with_context(|| format!("creating reports directory {}", reports_dir.display()))?;

    let file_name = format!("summary-{}.json", report.created_at.format("%Y%m%dT%H%M%SZ"));
    let target = reports_dir.join(file_name);

    let body = serde_json::to_string_pretty(&report).context("serializing summary report")?;
    std::fs::write(&target, body).with_context(|| format!("writing summary report {}", target.display()))?;

    Ok(target)
}

//! Markdown digest of the most recent run directories.

use std::path::Path;

use anyhow::{Context, Result};
use hymnal_storage::OutputStore;
use tokio::fs;

use crate::export::{MANIFEST_FILE, PARQUET_DIR};
use crate::writer::{BRIEF_FILE, ERRORS_FILE, SUMMARY_FILE};

fn count_line(summary: &serde_json::Value, pointer: &str) -> u64 {
    summary.pointer(pointer).and_then(|v| v.as_u64()).unwrap_or(0)
}

pub async fn report_runs_markdown(runs: usize, output_dir: &Path) -> Result<String> {
    let store = OutputStore::new(output_dir);
    let dirs = store
        .recent_run_dirs(runs)
        .await
        .with_context(|| format!("listing runs under {}", output_dir.display()))?;

    let mut lines = vec!["# Hymnal Run Report".to_string(), String::new()];
    if dirs.is_empty() {
        lines.push("No runs found.".to_string());
    }
    for dir in dirs {
        let stamp = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let summary_path = dir.join(SUMMARY_FILE);
        if !fs::try_exists(&summary_path).await.unwrap_or(false) {
            lines.push(format!("## Run `{stamp}`"));
            lines.push("- incomplete: no run summary".to_string());
            lines.push(String::new());
            continue;
        }

        let summary: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(&summary_path)
                .await
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;
        let run_id = summary.get("run_id").and_then(|v| v.as_str()).unwrap_or("unknown");

        lines.push(format!("## Run `{stamp}`"));
        lines.push(format!("- run id: `{run_id}`"));
        lines.push(format!("- input records: {}", count_line(&summary, "/stats/input_records")));
        lines.push(format!("- canonical hymns: {}", count_line(&summary, "/stats/canonical_hymns")));
        if let Some(counts) = summary.get("error_counts").and_then(|v| v.as_object()) {
            let total: u64 = counts.values().filter_map(|v| v.as_u64()).sum();
            let by_kind = counts
                .iter()
                .map(|(k, v)| format!("{k}={}", v.as_u64().unwrap_or(0)))
                .collect::<Vec<_>>()
                .join(", ");
            if by_kind.is_empty() {
                lines.push(format!("- errors: {total}"));
            } else {
                lines.push(format!("- errors: {total} ({by_kind})"));
            }
        }
        lines.push(format!("- errors file: `{}`", dir.join(ERRORS_FILE).display()));
        let brief_path = dir.join(BRIEF_FILE);
        if fs::try_exists(&brief_path).await.unwrap_or(false) {
            lines.push(format!("- run brief: `{}`", brief_path.display()));
        }
        let manifest_path = dir.join(PARQUET_DIR).join(MANIFEST_FILE);
        if fs::try_exists(&manifest_path).await.unwrap_or(false) {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

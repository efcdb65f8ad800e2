//! Run directory contents: the catalog, the error list, a markdown brief and
//! the run summary.

use std::path::Path;

use anyhow::{Context, Result};
use hymnal_core::{ErrorKind, PipelineError};
use hymnal_dedup::RunOutput;
use hymnal_storage::OutputStore;

use crate::SyncRunSummary;

pub const CATALOG_FILE: &str = "catalog.json";
pub const ERRORS_FILE: &str = "errors.json";
pub const BRIEF_FILE: &str = "run_brief.md";
pub const SUMMARY_FILE: &str = "run_summary.json";

const REVIEW_LIMIT: usize = 25;

fn needs_review(error: &PipelineError) -> bool {
    matches!(error.kind, ErrorKind::AmbiguousDuplicate | ErrorKind::IdentityConflict)
}

pub fn render_brief(summary: &SyncRunSummary, errors: &[PipelineError]) -> String {
    let mut lines = vec![
        "# Hymnal Run Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Enabled sources: {}", summary.enabled_sources),
        format!("- Input records: {}", summary.stats.input_records),
        format!(
            "- Canonical hymns: {} ({} merged classes)",
            summary.stats.canonical_hymns, summary.stats.merged_classes
        ),
        format!("- Patches applied: {}", summary.stats.patches_applied),
        String::new(),
        "## Records per Source".to_string(),
    ];
    lines.extend(summary.records_per_source.iter().map(|(k, v)| format!("- {k}: {v}")));

    lines.push(String::new());
    lines.push("## Errors by Kind".to_string());
    if summary.error_counts.is_empty() {
        lines.push("- none".to_string());
    }
    lines.extend(summary.error_counts.iter().map(|(k, v)| format!("- {k}: {v}")));

    let review: Vec<&PipelineError> = errors.iter().filter(|e| needs_review(e)).collect();
    if !review.is_empty() {
        lines.push(String::new());
        lines.push("## Needs Review".to_string());
        lines.extend(review.iter().take(REVIEW_LIMIT).map(|e| format!("- {e}")));
        if review.len() > REVIEW_LIMIT {
            lines.push(format!("- ... and {} more in `{ERRORS_FILE}`", review.len() - REVIEW_LIMIT));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Write every run artifact into `run_dir`. The summary goes last so its
/// presence marks a complete run.
pub async fn write_run_outputs(run_dir: &Path, summary: &SyncRunSummary, output: &RunOutput) -> Result<()> {
    let catalog = serde_json::to_vec_pretty(output.catalog()).context("serializing catalog")?;
    OutputStore::write_atomic(run_dir, CATALOG_FILE, &catalog).await?;

    let errors = serde_json::to_vec_pretty(output.errors()).context("serializing errors")?;
    OutputStore::write_atomic(run_dir, ERRORS_FILE, &errors).await?;

    let brief = render_brief(summary, output.errors());
    OutputStore::write_atomic(run_dir, BRIEF_FILE, brief.as_bytes()).await?;

    let summary_json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    OutputStore::write_atomic(run_dir, SUMMARY_FILE, &summary_json).await?;
    Ok(())
}

//! Run orchestration: collect every enabled source in parallel, reduce the
//! pooled records with the dedup engine, and write the run directory.

pub mod config;
pub mod export;
pub mod report;
pub mod writer;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use hymnal_adapters::{adapter_for_source, AdapterOutput, SourceAdapter};
use hymnal_core::{tally_by_kind, ErrorKind, Hymn, PipelineError, Severity, Stage};
use hymnal_dedup::{DedupEngine, RunStats};
use hymnal_storage::{OutputStore, SnapshotStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{load_engine_config, load_source_registry, SourceConfig, SourceRegistry, SyncConfig};
pub use report::report_runs_markdown;

pub const CRATE_NAME: &str = "hymnal-sync";

/// A fatal failure: nothing was written for this run.
#[derive(Debug, Error)]
#[error("run aborted: {error}")]
pub struct RunAborted {
    pub error: PipelineError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub enabled_sources: usize,
    pub records_per_source: BTreeMap<String, usize>,
    pub stats: RunStats,
    pub error_counts: BTreeMap<String, usize>,
    pub output_dir: String,
    #[serde(default)]
    pub parquet_manifest: Option<String>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    snapshots: SnapshotStore,
    outputs: OutputStore,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Self {
        let snapshots = SnapshotStore::new(config.snapshots_dir.clone());
        let outputs = OutputStore::new(config.output_dir.clone());
        Self {
            config,
            snapshots,
            outputs,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        self.run_inner(run_id)
            .instrument(info_span!("sync_run", %run_id))
            .await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let registry = load_source_registry(&self.config).await?;
        let enabled = registry.enabled();
        let engine_config = load_engine_config(&self.config, &registry).await?;
        let engine = DedupEngine::new(engine_config).context("invalid dedup configuration")?;

        let mut adapters: Vec<Box<dyn SourceAdapter>> = Vec::with_capacity(enabled.len());
        for source in &enabled {
            let adapter = adapter_for_source(&source.source_id)
                .with_context(|| format!("no adapter registered for {}", source.source_id))?;
            if adapter.format() != source.format {
                anyhow::bail!(
                    "{} is configured as {:?} but its adapter reads {:?}",
                    source.source_id,
                    source.format,
                    adapter.format()
                );
            }
            adapters.push(adapter);
        }

        let outputs = collect_sources(adapters, &self.snapshots).await?;
        let mut records_per_source = BTreeMap::new();
        let mut hymns: Vec<Hymn> = Vec::new();
        let mut upstream: Vec<PipelineError> = Vec::new();
        for (source, output) in enabled.iter().zip(outputs) {
            records_per_source.insert(source.source_id.clone(), output.hymns.len());
            hymns.extend(output.hymns);
            upstream.extend(output.errors);
        }
        info!(sources = enabled.len(), records = hymns.len(), "sources collected");

        let result = engine.run(&hymns, upstream);
        for error in result.errors().iter().filter(|e| e.severity != Severity::Warning) {
            warn!(kind = %error.kind, "{error}");
        }

        let run_dir = self.outputs.create_run_dir(started_at).await?;
        let parquet_manifest = if self.config.export_parquet {
            let path = export::export_parquet(&run_dir, result.catalog(), result.errors()).await?;
            Some(path.display().to_string())
        } else {
            None
        };

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            enabled_sources: enabled.len(),
            records_per_source,
            stats: result.stats().clone(),
            error_counts: tally_by_kind(result.errors()),
            output_dir: run_dir.display().to_string(),
            parquet_manifest,
        };
        writer::write_run_outputs(&run_dir, &summary, &result).await?;
        info!(
            canonical = summary.stats.canonical_hymns,
            errors = result.errors().len(),
            output = %summary.output_dir,
            "sync run complete"
        );
        Ok(summary)
    }
}

/// Run every adapter as its own task. Outputs come back in input order; the
/// first adapter failure aborts the remaining tasks and the run.
pub async fn collect_sources(
    adapters: Vec<Box<dyn SourceAdapter>>,
    store: &SnapshotStore,
) -> Result<Vec<AdapterOutput>> {
    let store = Arc::new(store.clone());
    let mut tasks = JoinSet::new();
    for (index, adapter) in adapters.into_iter().enumerate() {
        let store = Arc::clone(&store);
        tasks.spawn(async move {
            let source_id = adapter.source_id();
            let result = adapter.produce(&store).await;
            (index, source_id, result)
        });
    }

    let mut slots: Vec<Option<AdapterOutput>> = Vec::new();
    slots.resize_with(tasks.len(), || None);
    while let Some(joined) = tasks.join_next().await {
        let (index, source_id, result) = match joined {
            Ok(done) => done,
            Err(err) => {
                tasks.abort_all();
                let error = PipelineError::new(
                    Stage::Adapter,
                    ErrorKind::InfrastructureFailure,
                    format!("adapter task failed: {err}"),
                );
                return Err(RunAborted { error }.into());
            }
        };
        match result {
            Ok(output) => {
                info!(
                    source = source_id,
                    records = output.hymns.len(),
                    errors = output.errors.len(),
                    "adapter finished"
                );
                slots[index] = Some(output);
            }
            Err(err) => {
                tasks.abort_all();
                let error = PipelineError::new(Stage::Adapter, ErrorKind::InfrastructureFailure, err.to_string())
                    .with_source(source_id);
                return Err(RunAborted { error }.into());
            }
        }
    }
    Ok(slots.into_iter().flatten().collect())
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    SyncPipeline::new(SyncConfig::from_env()).run_once().await
}

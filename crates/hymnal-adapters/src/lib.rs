//! Source adapter contract and the per-source snapshot parsers.

pub mod chinese_epub;
pub mod h4a;
pub mod hymnal_net;
pub mod liederbuch;
pub mod normalize;
pub mod russian;

use async_trait::async_trait;
use hymnal_core::{Hymn, PipelineError};
use hymnal_storage::{Snapshot, SnapshotStore, StorageError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use chinese_epub::ChineseEpubAdapter;
pub use h4a::H4aAdapter;
pub use hymnal_net::HymnalNetAdapter;
pub use liederbuch::LiederbuchAdapter;
pub use russian::RussianAdapter;

pub const CRATE_NAME: &str = "hymnal-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotFormat {
    Json,
    FlatText,
    Yaml,
    JsonLines,
    EpubXhtml,
}

impl SnapshotFormat {
    pub fn extension(self) -> &'static str {
        match self {
            SnapshotFormat::Json | SnapshotFormat::EpubXhtml => "json",
            SnapshotFormat::FlatText => "txt",
            SnapshotFormat::Yaml => "yaml",
            SnapshotFormat::JsonLines => "jsonl",
        }
    }
}

/// Failures that make a whole snapshot unusable. Per-record problems are
/// reported as `MALFORMED_RECORD` entries in [`AdapterOutput::errors`] instead.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Everything one adapter contributes to a run.
#[derive(Debug, Clone, Default)]
pub struct AdapterOutput {
    pub hymns: Vec<Hymn>,
    pub errors: Vec<PipelineError>,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn format(&self) -> SnapshotFormat;

    fn parse_snapshot(&self, snapshot: &Snapshot) -> Result<AdapterOutput, AdapterError>;

    /// Load the newest snapshot for this source and parse it.
    async fn produce(&self, store: &SnapshotStore) -> Result<AdapterOutput, AdapterError> {
        let snapshot = store
            .load_latest(self.source_id(), self.format().extension())
            .await?;
        self.parse_snapshot(&snapshot)
    }
}

pub fn adapter_for_source(source_id: &str) -> Option<Box<dyn SourceAdapter>> {
    match source_id {
        hymnal_net::SOURCE_ID => Some(Box::new(HymnalNetAdapter)),
        h4a::SOURCE_ID => Some(Box::new(H4aAdapter)),
        liederbuch::SOURCE_ID => Some(Box::new(LiederbuchAdapter)),
        russian::SOURCE_ID => Some(Box::new(RussianAdapter)),
        chinese_epub::SOURCE_ID => Some(Box::new(ChineseEpubAdapter)),
        _ => None,
    }
}

fn check_source(adapter: &dyn SourceAdapter, snapshot: &Snapshot) -> Result<(), AdapterError> {
    if snapshot.source_id != adapter.source_id() {
        return Err(AdapterError::Message(format!(
            "snapshot source_id={} does not match adapter source_id={}",
            snapshot.source_id,
            adapter.source_id()
        )));
    }
    Ok(())
}

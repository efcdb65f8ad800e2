//! Environment settings and the YAML files that drive a run.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use hymnal_adapters::SnapshotFormat;
use hymnal_core::SourceId;
use hymnal_dedup::{ClusterConfig, EngineConfig, MergeConfig, PatchSet};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

pub const SOURCES_FILE: &str = "sources.yaml";
pub const DEDUP_FILE: &str = "dedup.yaml";
pub const PATCHES_FILE: &str = "patches.yaml";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    /// Declaration order is the merge priority order.
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn enabled(&self) -> Vec<SourceConfig> {
        self.sources.iter().filter(|s| s.enabled).cloned().collect()
    }

    pub fn priority(&self) -> Vec<SourceId> {
        self.sources
            .iter()
            .filter(|s| s.enabled)
            .map(|s| SourceId::new(&s.source_id))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub format: SnapshotFormat,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub snapshots_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Overrides `fuzzy_threshold` from `dedup.yaml` when set.
    pub fuzzy_threshold: Option<f64>,
    pub export_parquet: bool,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("HYMNAL_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self {
            snapshots_dir: std::env::var("HYMNAL_SNAPSHOTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("snapshots")),
            output_dir: std::env::var("HYMNAL_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("output")),
            fuzzy_threshold: std::env::var("HYMNAL_FUZZY_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok()),
            export_parquet: std::env::var("HYMNAL_EXPORT_PARQUET")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            workspace_root,
        }
    }

    /// Layout rooted at `root`, with nothing read from the environment.
    pub fn for_workspace(root: impl Into<PathBuf>) -> Self {
        let workspace_root = root.into();
        Self {
            snapshots_dir: workspace_root.join("snapshots"),
            output_dir: workspace_root.join("output"),
            fuzzy_threshold: None,
            export_parquet: false,
            workspace_root,
        }
    }
}

async fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

async fn read_yaml_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if fs::try_exists(path)
        .await
        .with_context(|| format!("checking {}", path.display()))?
    {
        read_yaml(path).await
    } else {
        debug!(path = %path.display(), "optional config file absent; using defaults");
        Ok(T::default())
    }
}

pub async fn load_source_registry(config: &SyncConfig) -> Result<SourceRegistry> {
    read_yaml(&config.workspace_root.join(SOURCES_FILE)).await
}

/// Engine settings from `dedup.yaml` and `patches.yaml`, with merge priority
/// taken from the registry order.
pub async fn load_engine_config(config: &SyncConfig, registry: &SourceRegistry) -> Result<EngineConfig> {
    let mut cluster: ClusterConfig = read_yaml_or_default(&config.workspace_root.join(DEDUP_FILE)).await?;
    if let Some(threshold) = config.fuzzy_threshold {
        cluster.fuzzy_threshold = threshold;
    }
    let patches: PatchSet = read_yaml_or_default(&config.workspace_root.join(PATCHES_FILE)).await?;
    Ok(EngineConfig {
        cluster,
        merge: MergeConfig {
            source_priority: registry.priority(),
        },
        patches,
    })
}

//! Cross-source deduplication and merge engine.
//!
//! Stages run in a fixed order over an immutable pool of [`Hymn`] records:
//! [`Clusterer`] partitions the pool, [`Resolver`] reduces each class to a
//! [`CanonicalHymn`](hymnal_core::CanonicalHymn), and [`Patcher`] applies the
//! configured manual corrections. Each stage returns its own snapshot; errors
//! are accumulated and handed back with the catalog.

pub mod cluster;
pub mod merge;
pub mod patch;

use hymnal_core::{Catalog, Hymn, PipelineError, SongReference};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub use cluster::{
    title_similarity, ClusterConfig, ClusterOutcome, Clusterer, EquivalenceClass, Evidence, EvidenceKind,
    ReferencePair, DEFAULT_FUZZY_THRESHOLD,
};
pub use merge::{MergeConfig, MergeOutcome, Resolver};
pub use patch::{prune_dangling_links, Patch, PatchAction, PatchOutcome, PatchSet, Patcher};

pub const CRATE_NAME: &str = "hymnal-dedup";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("fuzzy threshold {0} is outside [0, 1]")]
    InvalidThreshold(f64),
    #[error("override pair names {0} twice")]
    SelfPair(SongReference),
    #[error("pair {0} is both forced and excluded")]
    ContradictoryOverride(String),
    #[error("patch id `{0}` is used more than once")]
    DuplicatePatchId(String),
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub cluster: ClusterConfig,
    pub merge: MergeConfig,
    pub patches: PatchSet,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub input_records: usize,
    pub classes: usize,
    pub merged_classes: usize,
    pub fuzzy_unions: usize,
    pub canonical_hymns: usize,
    pub patches_applied: usize,
}

/// Finished run: catalog and error list are read-only from here on.
#[derive(Debug, Clone)]
pub struct RunOutput {
    catalog: Catalog,
    errors: Vec<PipelineError>,
    stats: RunStats,
}

impl RunOutput {
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn errors(&self) -> &[PipelineError] {
        &self.errors
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }
}

pub struct DedupEngine {
    clusterer: Clusterer,
    resolver: Resolver,
    patcher: Patcher,
}

impl DedupEngine {
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            clusterer: Clusterer::new(config.cluster)?,
            resolver: Resolver::new(config.merge),
            patcher: Patcher::new(config.patches)?,
        })
    }

    /// Cluster, merge and patch `hymns`. `upstream` errors (from adapters)
    /// lead the returned error list.
    pub fn run(&self, hymns: &[Hymn], upstream: Vec<PipelineError>) -> RunOutput {
        let clustered = self.clusterer.cluster(hymns);
        let merged = self.resolver.resolve(hymns, &clustered.classes);
        let patched = self.patcher.apply(merged.catalog);

        let stats = RunStats {
            input_records: hymns.len(),
            classes: clustered.classes.len(),
            merged_classes: clustered.classes.iter().filter(|c| !c.is_singleton()).count(),
            fuzzy_unions: clustered
                .classes
                .iter()
                .flat_map(|c| &c.evidence)
                .filter(|e| !e.kind.is_confirming())
                .count(),
            canonical_hymns: patched.catalog.len(),
            patches_applied: patched.applied.len(),
        };

        let mut errors = upstream;
        errors.extend(clustered.errors);
        errors.extend(merged.errors);
        errors.extend(patched.errors);

        info!(
            records = stats.input_records,
            canonical = stats.canonical_hymns,
            errors = errors.len(),
            "dedup run complete"
        );
        RunOutput {
            catalog: patched.catalog,
            errors,
            stats,
        }
    }
}

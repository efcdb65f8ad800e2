//! Partition of pooled source records into equivalence classes.
//!
//! Edges are applied strongest first: exact primary key, then explicit
//! cross-references and forced overrides, then fuzzy title similarity. A fuzzy
//! edge may never join two classes that are both already confirmed by strong
//! evidence; such candidates are reported as ambiguous instead.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use hymnal_core::{ErrorKind, Hymn, HymnType, LinkKind, PipelineError, SongReference, Stage};
use serde::{Deserialize, Serialize};
use strsim::normalized_levenshtein;
use tracing::{debug, info};

use crate::ConfigError;

pub const DEFAULT_FUZZY_THRESHOLD: f64 = 0.9;

/// Unordered pair of references, written `[h/40, h/41]` in configuration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "[SongReference; 2]", into = "[SongReference; 2]")]
pub struct ReferencePair {
    first: SongReference,
    second: SongReference,
}

impl ReferencePair {
    pub fn new(a: SongReference, b: SongReference) -> Self {
        if a <= b {
            Self { first: a, second: b }
        } else {
            Self { first: b, second: a }
        }
    }

    pub fn first(&self) -> &SongReference {
        &self.first
    }

    pub fn second(&self) -> &SongReference {
        &self.second
    }

    pub fn matches(&self, a: &SongReference, b: &SongReference) -> bool {
        (self.first == *a && self.second == *b) || (self.first == *b && self.second == *a)
    }
}

impl From<[SongReference; 2]> for ReferencePair {
    fn from([a, b]: [SongReference; 2]) -> Self {
        Self::new(a, b)
    }
}

impl From<ReferencePair> for [SongReference; 2] {
    fn from(pair: ReferencePair) -> Self {
        [pair.first, pair.second]
    }
}

impl fmt::Display for ReferencePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.first, self.second)
    }
}

/// Clusterer settings, usually read from `dedup.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub fuzzy_threshold: f64,
    /// Link kinds trusted as identity evidence when they cross source boundaries.
    pub cross_reference_kinds: Vec<LinkKind>,
    /// Known false positives: never fuzzy-merged, never reported.
    pub exclusions: Vec<ReferencePair>,
    /// Known false negatives: always merged.
    pub forced: Vec<ReferencePair>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: DEFAULT_FUZZY_THRESHOLD,
            cross_reference_kinds: vec![LinkKind::Language, LinkKind::Relevant],
            exclusions: Vec::new(),
            forced: Vec::new(),
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.fuzzy_threshold) {
            return Err(ConfigError::InvalidThreshold(self.fuzzy_threshold));
        }
        for pair in self.exclusions.iter().chain(&self.forced) {
            if pair.first == pair.second {
                return Err(ConfigError::SelfPair(pair.first.clone()));
            }
        }
        if let Some(pair) = self.forced.iter().find(|p| self.exclusions.contains(p)) {
            return Err(ConfigError::ContradictoryOverride(pair.to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvidenceKind {
    ExactKey,
    CrossReference { link: LinkKind },
    Forced,
    Fuzzy { score: f64 },
}

impl EvidenceKind {
    /// Everything except a fuzzy score confirms an identity.
    pub fn is_confirming(&self) -> bool {
        !matches!(self, EvidenceKind::Fuzzy { .. })
    }
}

/// One union that was applied, by index into the input slice.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evidence {
    pub left: usize,
    pub right: usize,
    pub kind: EvidenceKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EquivalenceClass {
    /// Indices into the clustered slice, ascending.
    pub members: Vec<usize>,
    pub evidence: Vec<Evidence>,
}

impl EquivalenceClass {
    pub fn hymns<'a>(&'a self, hymns: &'a [Hymn]) -> impl Iterator<Item = &'a Hymn> + 'a {
        self.members.iter().map(move |&i| &hymns[i])
    }

    pub fn is_singleton(&self) -> bool {
        self.members.len() == 1
    }
}

#[derive(Debug, Clone)]
pub struct ClusterOutcome {
    pub classes: Vec<EquivalenceClass>,
    pub errors: Vec<PipelineError>,
}

struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
    confirmed: Vec<bool>,
}

impl UnionFind {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
            rank: vec![0; len],
            confirmed: vec![false; len],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// Returns `false` when both already share a root.
    fn union(&mut self, a: usize, b: usize, confirming: bool) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            if confirming {
                self.confirmed[ra] = true;
            }
            return false;
        }
        let (root, child) = match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => (rb, ra),
            std::cmp::Ordering::Greater => (ra, rb),
            std::cmp::Ordering::Equal => {
                let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
                self.rank[root] += 1;
                (root, child)
            }
        };
        self.parent[child] = root;
        self.confirmed[root] = self.confirmed[root] || self.confirmed[child] || confirming;
        true
    }

    fn is_confirmed(&mut self, x: usize) -> bool {
        let root = self.find(x);
        self.confirmed[root]
    }
}

/// Case- and whitespace-folded title used for similarity scoring.
pub fn normalize_title(title: &str) -> String {
    title
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalized Levenshtein similarity in `[0, 1]` over folded titles.
pub fn title_similarity(a: &str, b: &str) -> f64 {
    normalized_levenshtein(&normalize_title(a), &normalize_title(b))
}

pub struct Clusterer {
    config: ClusterConfig,
}

impl Clusterer {
    pub fn new(config: ClusterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn cluster(&self, hymns: &[Hymn]) -> ClusterOutcome {
        let mut uf = UnionFind::new(hymns.len());
        let mut evidence = Vec::new();
        let mut errors = Vec::new();

        let mut by_reference: BTreeMap<&SongReference, Vec<usize>> = BTreeMap::new();
        for (i, hymn) in hymns.iter().enumerate() {
            by_reference.entry(&hymn.reference).or_default().push(i);
        }

        // Exact primary key.
        for indices in by_reference.values() {
            let first = indices[0];
            for &other in &indices[1..] {
                if uf.union(first, other, true) {
                    evidence.push(Evidence {
                        left: first,
                        right: other,
                        kind: EvidenceKind::ExactKey,
                    });
                }
            }
        }

        // Authored cross-references. A source's links into its own catalog point
        // at distinct songs, so only links that land on another source and stay
        // inside one hymnal count.
        for (i, hymn) in hymns.iter().enumerate() {
            for (kind, target) in hymn.links() {
                if !self.config.cross_reference_kinds.contains(&kind) {
                    continue;
                }
                let Some(targets) = by_reference.get(target) else {
                    continue;
                };
                // A link into another hymnal names a translation or a sibling
                // song, never the same identity.
                if target.hymn_type() != hymn.reference.hymn_type() {
                    continue;
                }
                for &j in targets {
                    if j == i || hymns[j].source() == hymn.source() {
                        continue;
                    }
                    if uf.union(i, j, true) {
                        evidence.push(Evidence {
                            left: i,
                            right: j,
                            kind: EvidenceKind::CrossReference { link: kind },
                        });
                    }
                }
            }
        }

        for pair in &self.config.forced {
            match (by_reference.get(&pair.first), by_reference.get(&pair.second)) {
                (Some(a), Some(b)) => {
                    if uf.union(a[0], b[0], true) {
                        evidence.push(Evidence {
                            left: a[0],
                            right: b[0],
                            kind: EvidenceKind::Forced,
                        });
                    }
                }
                _ => errors.push(
                    PipelineError::new(
                        Stage::Cluster,
                        ErrorKind::DanglingReference,
                        format!("forced pair {pair} names a reference absent from the input"),
                    )
                    .with_references([pair.first.clone(), pair.second.clone()]),
                ),
            }
        }

        let fuzzy_unions = self.apply_fuzzy_edges(hymns, &mut uf, &mut evidence, &mut errors);

        let classes = build_classes(hymns.len(), &mut uf, evidence);
        info!(
            records = hymns.len(),
            classes = classes.len(),
            fuzzy_unions,
            ambiguous = errors
                .iter()
                .filter(|e| e.kind == ErrorKind::AmbiguousDuplicate)
                .count(),
            "clustering complete"
        );
        ClusterOutcome { classes, errors }
    }

    fn apply_fuzzy_edges(
        &self,
        hymns: &[Hymn],
        uf: &mut UnionFind,
        evidence: &mut Vec<Evidence>,
        errors: &mut Vec<PipelineError>,
    ) -> usize {
        let threshold = self.config.fuzzy_threshold;
        let titles: Vec<Option<String>> = hymns
            .iter()
            .map(|h| h.title.as_deref().map(normalize_title).filter(|t| !t.is_empty()))
            .collect();
        let lengths: Vec<usize> = titles
            .iter()
            .map(|t| t.as_ref().map_or(0, |t| t.chars().count()))
            .collect();

        let mut by_type: BTreeMap<HymnType, Vec<usize>> = BTreeMap::new();
        for (i, hymn) in hymns.iter().enumerate() {
            by_type.entry(hymn.reference.hymn_type()).or_default().push(i);
        }

        let mut excluded: Vec<(&ReferencePair, Vec<usize>, Vec<usize>)> = Vec::new();
        for pair in &self.config.exclusions {
            let at = |reference: &SongReference| -> Vec<usize> {
                hymns
                    .iter()
                    .enumerate()
                    .filter(|(_, h)| h.reference == *reference)
                    .map(|(i, _)| i)
                    .collect()
            };
            let (first, second) = (at(pair.first()), at(pair.second()));
            if !first.is_empty() && !second.is_empty() {
                excluded.push((pair, first, second));
            }
        }

        let mut reported: BTreeSet<ReferencePair> = BTreeSet::new();
        let mut unions = 0;
        for indices in by_type.values() {
            for (pos, &i) in indices.iter().enumerate() {
                let Some(title_i) = &titles[i] else {
                    continue;
                };
                for &j in &indices[pos + 1..] {
                    let Some(title_j) = &titles[j] else {
                        continue;
                    };
                    if uf.find(i) == uf.find(j) {
                        continue;
                    }
                    // Edit distance is at least the length gap.
                    let longest = lengths[i].max(lengths[j]);
                    let gap = lengths[i].abs_diff(lengths[j]);
                    if 1.0 - (gap as f64 / longest as f64) < threshold {
                        continue;
                    }
                    let score = normalized_levenshtein(title_i, title_j);
                    if score < threshold {
                        continue;
                    }

                    let (ref_i, ref_j) = (&hymns[i].reference, &hymns[j].reference);
                    if let Some(pair) = excluded_across(&excluded, uf, i, j) {
                        debug!(%ref_i, %ref_j, score, %pair, "fuzzy union would join an excluded pair");
                        continue;
                    }
                    if uf.is_confirmed(i) && uf.is_confirmed(j) {
                        let pair = ReferencePair::new(ref_i.clone(), ref_j.clone());
                        if reported.insert(pair.clone()) {
                            errors.push(
                                PipelineError::new(
                                    Stage::Cluster,
                                    ErrorKind::AmbiguousDuplicate,
                                    format!(
                                        "titles match with score {score:.3} but {pair} already belong to distinct confirmed hymns"
                                    ),
                                )
                                .with_references([ref_i.clone(), ref_j.clone()]),
                            );
                        }
                        continue;
                    }

                    debug!(%ref_i, %ref_j, score, "fuzzy union");
                    uf.union(i, j, false);
                    evidence.push(Evidence {
                        left: i,
                        right: j,
                        kind: EvidenceKind::Fuzzy { score },
                    });
                    unions += 1;
                }
            }
        }
        unions
    }
}

fn in_class(uf: &mut UnionFind, members: &[usize], root: usize) -> bool {
    members.iter().any(|&m| uf.find(m) == root)
}

/// An exclusion pair that joining the classes of `i` and `j` would put into
/// one class. Checked per class so a chain of near matches cannot bridge it.
fn excluded_across<'p>(
    excluded: &[(&'p ReferencePair, Vec<usize>, Vec<usize>)],
    uf: &mut UnionFind,
    i: usize,
    j: usize,
) -> Option<&'p ReferencePair> {
    let (root_i, root_j) = (uf.find(i), uf.find(j));
    for (pair, first, second) in excluded {
        let crosses = (in_class(uf, first, root_i) && in_class(uf, second, root_j))
            || (in_class(uf, first, root_j) && in_class(uf, second, root_i));
        if crosses {
            return Some(*pair);
        }
    }
    None
}

fn build_classes(len: usize, uf: &mut UnionFind, evidence: Vec<Evidence>) -> Vec<EquivalenceClass> {
    let mut slot_by_root: BTreeMap<usize, usize> = BTreeMap::new();
    let mut classes: Vec<EquivalenceClass> = Vec::new();
    for i in 0..len {
        let root = uf.find(i);
        let slot = *slot_by_root.entry(root).or_insert_with(|| {
            classes.push(EquivalenceClass {
                members: Vec::new(),
                evidence: Vec::new(),
            });
            classes.len() - 1
        });
        classes[slot].members.push(i);
    }
    for item in evidence {
        let root = uf.find(item.left);
        if let Some(&slot) = slot_by_root.get(&root) {
            classes[slot].evidence.push(item);
        }
    }
    classes
}

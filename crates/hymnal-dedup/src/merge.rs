//! Reduction of each equivalence class to one canonical hymn.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use hymnal_core::{
    CanonicalHymn, Catalog, ErrorKind, Hymn, HymnMetadata, HymnType, LinkKind, PipelineError,
    SongReference, SourceId, Stage,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cluster::EquivalenceClass;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Highest priority first. Unlisted sources rank after every listed one.
    pub source_priority: Vec<SourceId>,
}

impl MergeConfig {
    pub fn rank(&self, source: &SourceId) -> usize {
        self.source_priority
            .iter()
            .position(|s| s == source)
            .unwrap_or(self.source_priority.len())
    }
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub catalog: Catalog,
    pub errors: Vec<PipelineError>,
}

pub struct Resolver {
    config: MergeConfig,
}

impl Resolver {
    pub fn new(config: MergeConfig) -> Self {
        Self { config }
    }

    /// Members ordered by `(source priority, reference, input position)`.
    pub fn priority_order(&self, hymns: &[Hymn], members: &[usize]) -> Vec<usize> {
        let mut ordered = members.to_vec();
        ordered.sort_by(|&a, &b| {
            self.config
                .rank(hymns[a].source())
                .cmp(&self.config.rank(hymns[b].source()))
                .then_with(|| hymns[a].reference.cmp(&hymns[b].reference))
                .then_with(|| a.cmp(&b))
        });
        ordered
    }

    pub fn resolve(&self, hymns: &[Hymn], classes: &[EquivalenceClass]) -> MergeOutcome {
        let mut errors = Vec::new();
        let ordered: Vec<Vec<usize>> = classes
            .iter()
            .filter(|c| !c.members.is_empty())
            .map(|c| self.priority_order(hymns, &c.members))
            .collect();

        let mut resolution: HashMap<&SongReference, &SongReference> = HashMap::new();
        for members in &ordered {
            let identity = &hymns[members[0]].reference;
            for &m in members {
                resolution.entry(&hymns[m].reference).or_insert(identity);
            }
        }

        let mut catalog = Catalog::new();
        for members in &ordered {
            let identity = &hymns[members[0]].reference;
            if catalog.contains(identity) {
                // Only reachable when the classes do not partition the keys.
                errors.push(
                    PipelineError::new(
                        Stage::Merge,
                        ErrorKind::IdentityConflict,
                        format!("two classes resolved to identity {identity}; keeping the first"),
                    )
                    .with_reference(identity.clone()),
                );
                continue;
            }
            if let Some(conflict) = identity_conflict(hymns, members) {
                warn!(%identity, "{}", conflict.message);
                errors.push(conflict);
            }
            let canonical = self.merge_class(hymns, members, &resolution, &mut errors);
            catalog.insert(canonical);
        }

        info!(
            classes = ordered.len(),
            canonical = catalog.len(),
            dangling = errors
                .iter()
                .filter(|e| e.kind == ErrorKind::DanglingReference)
                .count(),
            "merge complete"
        );
        MergeOutcome { catalog, errors }
    }

    fn merge_class(
        &self,
        hymns: &[Hymn],
        members: &[usize],
        resolution: &HashMap<&SongReference, &SongReference>,
        errors: &mut Vec<PipelineError>,
    ) -> CanonicalHymn {
        let winner = &hymns[members[0]];
        let identity = &winner.reference;

        let mut languages: BTreeMap<String, BTreeSet<SongReference>> = BTreeMap::new();
        let mut relevant = BTreeSet::new();
        let mut reported: BTreeSet<(LinkKind, &SongReference)> = BTreeSet::new();
        let mut metadata = HymnMetadata::default();

        for &m in members {
            let hymn = &hymns[m];
            for (language, targets) in &hymn.languages {
                for target in targets {
                    if let Some(resolved) =
                        resolve_link(identity, hymn, LinkKind::Language, target, resolution, &mut reported, errors)
                    {
                        languages.entry(language.clone()).or_default().insert(resolved);
                    }
                }
            }
            for target in &hymn.relevant {
                if let Some(resolved) =
                    resolve_link(identity, hymn, LinkKind::Relevant, target, resolution, &mut reported, errors)
                {
                    relevant.insert(resolved);
                }
            }
            metadata.fill_missing_from(&hymn.metadata);
        }

        // Whole-field content from the best member that has it.
        let title = members.iter().find_map(|&m| hymns[m].title.clone());
        let verses = members
            .iter()
            .map(|&m| &hymns[m].verses)
            .find(|v| !v.is_empty())
            .cloned()
            .unwrap_or_default();

        CanonicalHymn {
            reference: identity.clone(),
            aliases: members.iter().map(|&m| hymns[m].reference.clone()).collect(),
            languages,
            relevant,
            title,
            verses,
            metadata,
            sources: members.iter().map(|&m| hymns[m].source().clone()).collect(),
        }
    }
}

fn resolve_link<'a>(
    identity: &SongReference,
    holder: &Hymn,
    kind: LinkKind,
    target: &'a SongReference,
    resolution: &HashMap<&SongReference, &SongReference>,
    reported: &mut BTreeSet<(LinkKind, &'a SongReference)>,
    errors: &mut Vec<PipelineError>,
) -> Option<SongReference> {
    match resolution.get(target) {
        Some(&resolved) if resolved == identity => {
            debug!(%identity, %target, "link collapsed into its own class");
            None
        }
        Some(&resolved) => Some(resolved.clone()),
        None => {
            if reported.insert((kind, target)) {
                errors.push(
                    PipelineError::new(
                        Stage::Merge,
                        ErrorKind::DanglingReference,
                        format!("{kind} link from {} to {target} does not resolve to any hymn", holder.reference),
                    )
                    .with_references([identity.clone(), target.clone()])
                    .with_source(holder.source()),
                );
            }
            None
        }
    }
}

fn identity_conflict(hymns: &[Hymn], members: &[usize]) -> Option<PipelineError> {
    let types: BTreeSet<HymnType> = members
        .iter()
        .map(|&m| hymns[m].reference.hymn_type())
        .collect();
    if types.len() < 2 {
        return None;
    }
    let references: BTreeSet<&SongReference> = members.iter().map(|&m| &hymns[m].reference).collect();
    let listed = types.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
    Some(
        PipelineError::new(
            Stage::Merge,
            ErrorKind::IdentityConflict,
            format!(
                "class mixes hymn types [{listed}]; keeping {} by source priority",
                hymns[members[0]].reference
            ),
        )
        .with_references(references.into_iter().cloned()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterConfig, Clusterer, ReferencePair};
    use hymnal_core::Provenance;

    fn r(s: &str) -> SongReference {
        s.parse().unwrap()
    }

    fn hymn(reference: &str, source: &str) -> Hymn {
        Hymn::new(r(reference), Provenance::new(source))
    }

    fn priority() -> MergeConfig {
        MergeConfig {
            source_priority: vec!["hymnal-net".into(), "h4a".into(), "russian".into()],
        }
    }

    fn run(hymns: &[Hymn], threshold: f64) -> MergeOutcome {
        let clusterer = Clusterer::new(ClusterConfig {
            fuzzy_threshold: threshold,
            ..Default::default()
        })
        .unwrap();
        let outcome = clusterer.cluster(hymns);
        Resolver::new(priority()).resolve(hymns, &outcome.classes)
    }

    #[test]
    fn two_sources_merge_languages_and_provenance() {
        let hymns = vec![
            hymn("h/40", "hymnal-net").with_language("zh", r("ch/40z")),
            hymn("h/40", "h4a"),
            hymn("ch/40z", "hymnal-net"),
        ];
        let outcome = run(&hymns, 1.0);
        assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
        let merged = outcome.catalog.get(&r("h/40")).unwrap();
        assert_eq!(
            merged.sources,
            BTreeSet::from([SourceId::from("hymnal-net"), SourceId::from("h4a")])
        );
        assert_eq!(merged.languages.len(), 1);
        assert_eq!(merged.languages["zh"], BTreeSet::from([r("ch/40z")]));
    }

    #[test]
    fn dangling_link_is_dropped_and_reported_once() {
        let hymns = vec![
            hymn("h/1", "hymnal-net").with_language("zh", r("ts/99")),
            hymn("h/1", "h4a").with_language("zh", r("ts/99")),
        ];
        let outcome = run(&hymns, 1.0);
        let merged = outcome.catalog.get(&r("h/1")).unwrap();
        assert!(merged.languages.is_empty());
        let dangling: Vec<_> = outcome
            .errors
            .iter()
            .filter(|e| e.kind == ErrorKind::DanglingReference)
            .collect();
        assert_eq!(dangling.len(), 1);
        assert!(dangling[0].references.contains(&r("ts/99")));
        assert!(outcome.catalog.dangling_links().is_empty());
    }

    #[test]
    fn priority_winner_supplies_identity_and_text() {
        let hymns = vec![
            hymn("h/12b", "h4a").with_title("Amazng Grac").with_verses(["ocr verse"]),
            hymn("h/12", "hymnal-net").with_title("Amazing Grace"),
        ];
        let outcome = run(&hymns, 0.8);
        assert_eq!(outcome.catalog.len(), 1);
        let merged = outcome.catalog.get(&r("h/12")).unwrap();
        assert_eq!(merged.title.as_deref(), Some("Amazing Grace"));
        // Winner has no verses; fallback to the next member.
        assert_eq!(merged.verses, vec!["ocr verse".to_string()]);
        assert_eq!(merged.aliases, BTreeSet::from([r("h/12"), r("h/12b")]));
    }

    #[test]
    fn smallest_reference_wins_within_a_source() {
        let hymns = vec![
            hymn("h/12b", "hymnal-net").with_title("Amazing Grace!"),
            hymn("h/12", "hymnal-net").with_title("Amazing Grace"),
        ];
        let outcome = run(&hymns, 0.8);
        assert!(outcome.catalog.contains(&r("h/12")));
        assert!(!outcome.catalog.contains(&r("h/12b")));
    }

    #[test]
    fn links_to_folded_aliases_resolve_to_canonical_identity() {
        let hymns = vec![
            hymn("h/12", "hymnal-net").with_title("Amazing Grace"),
            hymn("h/12b", "h4a").with_title("Amazing Grace"),
            hymn("h/13", "h4a").with_relevant(r("h/12b")),
        ];
        let outcome = run(&hymns, 0.9);
        let linking = outcome.catalog.get(&r("h/13")).unwrap();
        assert_eq!(linking.relevant, BTreeSet::from([r("h/12")]));
    }

    #[test]
    fn translation_from_a_third_source_stays_a_language_link() {
        let hymns = vec![
            hymn("h/40", "hymnal-net").with_title("English").with_language("zh", r("ch/40")),
            hymn("h/40", "h4a").with_title("English"),
            hymn("ch/40", "chinese-epub").with_title("Chinese").with_language("en", r("h/40")),
        ];
        let outcome = run(&hymns, 1.0);
        assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
        assert_eq!(outcome.catalog.len(), 2);
        let merged = outcome.catalog.get(&r("h/40")).unwrap();
        assert_eq!(merged.aliases, BTreeSet::from([r("h/40")]));
        assert_eq!(merged.languages["zh"], BTreeSet::from([r("ch/40")]));
        let chinese = outcome.catalog.get(&r("ch/40")).unwrap();
        assert_eq!(chinese.languages["en"], BTreeSet::from([r("h/40")]));
    }

    #[test]
    fn mixed_types_raise_identity_conflict_but_still_merge() {
        let hymns = vec![
            hymn("h/40", "hymnal-net").with_title("English"),
            hymn("ru/40", "russian").with_title("Russian").with_language("en", r("h/40")),
        ];
        let clusterer = Clusterer::new(ClusterConfig {
            fuzzy_threshold: 1.0,
            forced: vec![ReferencePair::new(r("h/40"), r("ru/40"))],
            ..Default::default()
        })
        .unwrap();
        let classes = clusterer.cluster(&hymns).classes;
        let outcome = Resolver::new(priority()).resolve(&hymns, &classes);
        assert_eq!(outcome.catalog.len(), 1);
        let merged = outcome.catalog.get(&r("h/40")).unwrap();
        assert_eq!(merged.title.as_deref(), Some("English"));
        // The language link now points inside its own class and disappears.
        assert!(merged.languages.is_empty());
        let conflicts: Vec<_> = outcome
            .errors
            .iter()
            .filter(|e| e.kind == ErrorKind::IdentityConflict)
            .collect();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].severity, hymnal_core::Severity::High);
    }

    #[test]
    fn metadata_fills_per_field_by_priority() {
        let hymns = vec![
            hymn("h/7", "h4a").with_metadata(HymnMetadata {
                author: Some("h4a author".into()),
                meter: Some("7.7.7.7".into()),
                ..Default::default()
            }),
            hymn("h/7", "hymnal-net").with_metadata(HymnMetadata {
                author: Some("net author".into()),
                ..Default::default()
            }),
        ];
        let outcome = run(&hymns, 1.0);
        let merged = outcome.catalog.get(&r("h/7")).unwrap();
        assert_eq!(merged.metadata.author.as_deref(), Some("net author"));
        assert_eq!(merged.metadata.meter.as_deref(), Some("7.7.7.7"));
    }

    #[test]
    fn unlisted_sources_rank_last() {
        let config = priority();
        assert_eq!(config.rank(&"hymnal-net".into()), 0);
        assert_eq!(config.rank(&"unknown".into()), 3);
    }
}

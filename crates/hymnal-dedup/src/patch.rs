//! Ordered manual corrections applied to the merged catalog.

use std::collections::BTreeSet;

use hymnal_core::{
    normalize_language, CanonicalHymn, Catalog, ErrorKind, LinkKind, PipelineError, SongReference, Stage,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::ConfigError;

/// Closed set of corrections. Every action is idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PatchAction {
    ClearLanguages,
    ClearRelevant,
    RemoveLanguage { language: String },
    RemoveLanguageLink { link: SongReference },
    RemoveRelevant { link: SongReference },
    AddRelevant { link: SongReference },
    AddLanguageLink { language: String, link: SongReference },
    SetTitle { title: String },
    ReplaceVerses { verses: Vec<String> },
}

impl PatchAction {
    pub fn apply(&self, hymn: &CanonicalHymn) -> CanonicalHymn {
        let mut next = hymn.clone();
        match self {
            PatchAction::ClearLanguages => next.languages.clear(),
            PatchAction::ClearRelevant => next.relevant.clear(),
            PatchAction::RemoveLanguage { language } => {
                next.languages.remove(&normalize_language(language));
            }
            PatchAction::RemoveLanguageLink { link } => {
                for targets in next.languages.values_mut() {
                    targets.remove(link);
                }
                next.languages.retain(|_, targets| !targets.is_empty());
            }
            PatchAction::RemoveRelevant { link } => {
                next.relevant.remove(link);
            }
            PatchAction::AddRelevant { link } => {
                next.relevant.insert(link.clone());
            }
            PatchAction::AddLanguageLink { language, link } => {
                next.languages
                    .entry(normalize_language(language))
                    .or_default()
                    .insert(link.clone());
            }
            PatchAction::SetTitle { title } => next.title = Some(title.clone()),
            PatchAction::ReplaceVerses { verses } => next.verses.clone_from(verses),
        }
        next
    }
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub id: String,
    pub target: SongReference,
    #[serde(flatten)]
    pub action: PatchAction,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Patch table as read from `patches.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchSet {
    #[serde(default)]
    pub patches: Vec<Patch>,
}

impl PatchSet {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = BTreeSet::new();
        for patch in &self.patches {
            if !ids.insert(patch.id.as_str()) {
                return Err(ConfigError::DuplicatePatchId(patch.id.clone()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PatchOutcome {
    pub catalog: Catalog,
    pub errors: Vec<PipelineError>,
    /// Ids of patches whose target was found, in application order.
    pub applied: Vec<String>,
}

pub struct Patcher {
    patches: PatchSet,
}

impl Patcher {
    pub fn new(patches: PatchSet) -> Result<Self, ConfigError> {
        patches.validate()?;
        Ok(Self { patches })
    }

    pub fn apply(&self, mut catalog: Catalog) -> PatchOutcome {
        let mut errors = Vec::new();
        let mut applied = Vec::new();

        for patch in &self.patches.patches {
            if !patch.enabled {
                debug!(patch = %patch.id, "patch disabled");
                continue;
            }
            let Some(current) = catalog.get(&patch.target) else {
                let hint = catalog
                    .canonical_for_alias(&patch.target)
                    .map(|c| format!("; it was folded into {c}"))
                    .unwrap_or_default();
                errors.push(
                    PipelineError::new(
                        Stage::Patch,
                        ErrorKind::PatchTargetNotFound,
                        format!("patch `{}` targets {} which is not in the catalog{hint}", patch.id, patch.target),
                    )
                    .with_reference(patch.target.clone()),
                );
                continue;
            };
            let patched = patch.action.apply(current);
            if patched != *current {
                catalog.insert(patched);
            }
            applied.push(patch.id.clone());
        }

        let (catalog, dangling) = prune_dangling_links(catalog, Stage::Patch);
        errors.extend(dangling);
        info!(applied = applied.len(), errors = errors.len(), "patches applied");
        PatchOutcome {
            catalog,
            errors,
            applied,
        }
    }
}

/// Drop every link whose target is not a catalog identity, reporting each one.
pub fn prune_dangling_links(mut catalog: Catalog, stage: Stage) -> (Catalog, Vec<PipelineError>) {
    let dangling = catalog.dangling_links();
    let mut errors = Vec::with_capacity(dangling.len());
    for link in dangling {
        let Some(hymn) = catalog.get(&link.holder) else {
            continue;
        };
        let mut next = hymn.clone();
        match (link.kind, link.language.as_deref()) {
            (LinkKind::Language, Some(language)) => {
                if let Some(targets) = next.languages.get_mut(language) {
                    targets.remove(&link.target);
                    if targets.is_empty() {
                        next.languages.remove(language);
                    }
                }
            }
            _ => {
                next.relevant.remove(&link.target);
            }
        }
        catalog.insert(next);
        errors.push(
            PipelineError::new(
                stage,
                ErrorKind::DanglingReference,
                format!("{} link from {} to {} was dropped", link.kind, link.holder, link.target),
            )
            .with_references([link.holder, link.target]),
        );
    }
    (catalog, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn r(s: &str) -> SongReference {
        s.parse().unwrap()
    }

    fn canonical(reference: &str) -> CanonicalHymn {
        CanonicalHymn {
            reference: r(reference),
            aliases: BTreeSet::from([r(reference)]),
            languages: BTreeMap::new(),
            relevant: BTreeSet::new(),
            title: Some(format!("Hymn {reference}")),
            verses: vec!["verse".into()],
            metadata: Default::default(),
            sources: BTreeSet::from(["hymnal-net".into()]),
        }
    }

    fn catalog() -> Catalog {
        let mut h40 = canonical("h/40");
        h40.languages.insert("zh".into(), BTreeSet::from([r("h/41")]));
        let mut h41 = canonical("h/41");
        h41.languages.insert("zh".into(), BTreeSet::from([r("h/40")]));
        h41.aliases.insert(r("h/41b"));
        Catalog::from(vec![h40, h41, canonical("ch/40")])
    }

    fn patch(id: &str, target: &str, action: PatchAction) -> Patch {
        Patch {
            id: id.into(),
            target: r(target),
            action,
            enabled: true,
            note: None,
        }
    }

    #[test]
    fn clears_known_bad_language_links() {
        let patcher = Patcher::new(PatchSet {
            patches: vec![
                patch("h40-languages", "h/40", PatchAction::ClearLanguages),
                patch("h41-languages", "h/41", PatchAction::ClearLanguages),
            ],
        })
        .unwrap();
        let outcome = patcher.apply(catalog());
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.applied, vec!["h40-languages", "h41-languages"]);
        assert!(outcome.catalog.get(&r("h/40")).unwrap().languages.is_empty());
        assert!(outcome.catalog.get(&r("h/41")).unwrap().languages.is_empty());
    }

    #[test]
    fn applying_twice_equals_applying_once() {
        let patches = PatchSet {
            patches: vec![
                patch("add", "h/40", PatchAction::AddRelevant { link: r("ch/40") }),
                patch(
                    "lang",
                    "h/41",
                    PatchAction::AddLanguageLink {
                        language: "ZH ".into(),
                        link: r("ch/40"),
                    },
                ),
                patch("drop", "h/41", PatchAction::RemoveLanguageLink { link: r("h/40") }),
                patch("title", "ch/40", PatchAction::SetTitle { title: "Fixed".into() }),
            ],
        };
        let patcher = Patcher::new(patches).unwrap();
        let once = patcher.apply(catalog()).catalog;
        let twice = patcher.apply(once.clone()).catalog;
        assert_eq!(once, twice);
        assert_eq!(
            once.get(&r("h/41")).unwrap().languages["zh"],
            BTreeSet::from([r("ch/40")])
        );
    }

    #[test]
    fn missing_target_is_reported_with_alias_hint() {
        let patcher = Patcher::new(PatchSet {
            patches: vec![
                patch("gone", "h/999", PatchAction::ClearRelevant),
                patch("alias", "h/41b", PatchAction::ClearRelevant),
            ],
        })
        .unwrap();
        let outcome = patcher.apply(catalog());
        assert_eq!(outcome.errors.len(), 2);
        assert!(outcome.errors.iter().all(|e| e.kind == ErrorKind::PatchTargetNotFound));
        assert!(outcome.errors[1].message.contains("folded into h/41"));
        assert!(outcome.applied.is_empty());
    }

    #[test]
    fn disabled_patches_are_skipped() {
        let mut disabled = patch("off", "h/40", PatchAction::ClearLanguages);
        disabled.enabled = false;
        let outcome = Patcher::new(PatchSet { patches: vec![disabled] })
            .unwrap()
            .apply(catalog());
        assert!(!outcome.catalog.get(&r("h/40")).unwrap().languages.is_empty());
        assert!(outcome.applied.is_empty());
    }

    #[test]
    fn patches_cannot_leave_dangling_links() {
        let patcher = Patcher::new(PatchSet {
            patches: vec![patch("bad", "h/40", PatchAction::AddRelevant { link: r("nt/1") })],
        })
        .unwrap();
        let outcome = patcher.apply(catalog());
        assert!(outcome.catalog.get(&r("h/40")).unwrap().relevant.is_empty());
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].kind, ErrorKind::DanglingReference);
        assert_eq!(outcome.errors[0].stage, Stage::Patch);
        assert!(outcome.catalog.dangling_links().is_empty());
    }

    #[test]
    fn duplicate_patch_ids_are_rejected() {
        let set = PatchSet {
            patches: vec![
                patch("same", "h/40", PatchAction::ClearLanguages),
                patch("same", "h/41", PatchAction::ClearLanguages),
            ],
        };
        assert!(matches!(Patcher::new(set), Err(ConfigError::DuplicatePatchId(id)) if id == "same"));
    }

    #[test]
    fn patch_table_parses_from_yaml() {
        let set: PatchSet = serde_yaml::from_str(
            r#"
patches:
  - id: h40-bad-languages
    target: h/40
    action: clear_languages
    note: points at h/41 instead of the Chinese hymn
  - id: ch40-title
    target: ch/40
    action: set_title
    title: Corrected
    enabled: false
  - id: h40-new-tune
    target: h/40
    action: add_relevant
    link: nt/40
"#,
        )
        .unwrap();
        assert_eq!(set.patches.len(), 3);
        assert_eq!(set.patches[0].action, PatchAction::ClearLanguages);
        assert!(set.patches[0].enabled);
        assert!(!set.patches[1].enabled);
        assert_eq!(
            set.patches[1].action,
            PatchAction::SetTitle {
                title: "Corrected".into()
            }
        );
        assert_eq!(set.patches[2].target, r("h/40"));
        assert_eq!(set.patches[2].action, PatchAction::AddRelevant { link: r("nt/40") });
    }
}

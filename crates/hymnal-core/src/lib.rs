//! Core domain model, provenance and error taxonomy for the hymnal catalog reducer.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const CRATE_NAME: &str = "hymnal-core";

/// Fixed set of hymnals a reference can point into. Declaration order is the
/// ordering used when picking the smallest reference of a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HymnType {
    ClassicHymn,
    NewTune,
    NewSong,
    Children,
    HowardHigashi,
    Chinese,
    ChineseSupplement,
    German,
    Russian,
    Spanish,
    French,
    Korean,
    Japanese,
    Tagalog,
    Dutch,
    BeFilled,
}

impl HymnType {
    pub const ALL: [HymnType; 16] = [
        HymnType::ClassicHymn,
        HymnType::NewTune,
        HymnType::NewSong,
        HymnType::Children,
        HymnType::HowardHigashi,
        HymnType::Chinese,
        HymnType::ChineseSupplement,
        HymnType::German,
        HymnType::Russian,
        HymnType::Spanish,
        HymnType::French,
        HymnType::Korean,
        HymnType::Japanese,
        HymnType::Tagalog,
        HymnType::Dutch,
        HymnType::BeFilled,
    ];

    pub fn abbreviation(self) -> &'static str {
        match self {
            HymnType::ClassicHymn => "h",
            HymnType::NewTune => "nt",
            HymnType::NewSong => "ns",
            HymnType::Children => "c",
            HymnType::HowardHigashi => "lb",
            HymnType::Chinese => "ch",
            HymnType::ChineseSupplement => "ts",
            HymnType::German => "de",
            HymnType::Russian => "ru",
            HymnType::Spanish => "es",
            HymnType::French => "fr",
            HymnType::Korean => "ko",
            HymnType::Japanese => "ja",
            HymnType::Tagalog => "tl",
            HymnType::Dutch => "nl",
            HymnType::BeFilled => "bf",
        }
    }

    pub fn from_abbreviation(input: &str) -> Option<Self> {
        let needle = input.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|t| t.abbreviation() == needle)
    }
}

impl fmt::Display for HymnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.abbreviation())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseReferenceError {
    #[error("reference `{0}` is missing the `<type>/<number>` separator")]
    MissingSeparator(String),
    #[error("unknown hymn type `{0}`")]
    UnknownHymnType(String),
    #[error("reference number is empty")]
    EmptyNumber,
    #[error("reference number `{0}` contains whitespace or `/`")]
    InvalidNumber(String),
}

/// Identity of a hymn inside one hymnal: `(type, number)`.
///
/// The number is trimmed and case-folded on construction, so `h/12B` and
/// `h/ 12b` denote the same song. Textual form is `<abbr>/<number>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SongReference {
    hymn_type: HymnType,
    number: String,
}

impl SongReference {
    pub fn new(hymn_type: HymnType, number: impl AsRef<str>) -> Result<Self, ParseReferenceError> {
        let number = number.as_ref().trim().to_lowercase();
        if number.is_empty() {
            return Err(ParseReferenceError::EmptyNumber);
        }
        if number.contains('/') || number.chars().any(char::is_whitespace) {
            return Err(ParseReferenceError::InvalidNumber(number));
        }
        Ok(Self { hymn_type, number })
    }

    pub fn hymn_type(&self) -> HymnType {
        self.hymn_type
    }

    pub fn number(&self) -> &str {
        &self.number
    }

    /// Leading decimal digits of the number, if any (`12b` -> 12).
    pub fn numeric_part(&self) -> Option<u64> {
        let digits: String = self.number.chars().take_while(|c| c.is_ascii_digit()).collect();
        digits.parse().ok()
    }
}

impl Ord for SongReference {
    fn cmp(&self, other: &Self) -> Ordering {
        // Numbered references sort before purely textual ones.
        let key = |r: &SongReference| {
            let numeric = r.numeric_part();
            (numeric.is_none(), numeric.unwrap_or(0))
        };
        self.hymn_type
            .cmp(&other.hymn_type)
            .then_with(|| key(self).cmp(&key(other)))
            .then_with(|| self.number.cmp(&other.number))
    }
}

impl PartialOrd for SongReference {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SongReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hymn_type, self.number)
    }
}

impl FromStr for SongReference {
    type Err = ParseReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (kind, number) = trimmed
            .split_once('/')
            .ok_or_else(|| ParseReferenceError::MissingSeparator(trimmed.to_string()))?;
        let hymn_type = HymnType::from_abbreviation(kind)
            .ok_or_else(|| ParseReferenceError::UnknownHymnType(kind.trim().to_string()))?;
        Self::new(hymn_type, number)
    }
}

impl Serialize for SongReference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SongReference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// Stable identifier of a contributing source (`hymnal-net`, `h4a`, ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<&SourceId> for SourceId {
    fn from(value: &SourceId) -> Self {
        value.clone()
    }
}

/// Where a candidate record came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source: SourceId,
    pub snapshot: Option<String>,
    pub captured_at: Option<DateTime<Utc>>,
}

impl Provenance {
    pub fn new(source: impl Into<SourceId>) -> Self {
        Self {
            source: source.into(),
            snapshot: None,
            captured_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    Language,
    Relevant,
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkKind::Language => f.write_str("language"),
            LinkKind::Relevant => f.write_str("relevant"),
        }
    }
}

/// Descriptive fields that travel with a hymn but never take part in identity.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HymnMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subcategory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scriptures: Option<String>,
}

impl HymnMetadata {
    /// Fill every empty field from `other`, leaving populated fields untouched.
    pub fn fill_missing_from(&mut self, other: &HymnMetadata) {
        fn fill(slot: &mut Option<String>, candidate: &Option<String>) {
            if slot.is_none() {
                slot.clone_from(candidate);
            }
        }
        fill(&mut self.category, &other.category);
        fill(&mut self.subcategory, &other.subcategory);
        fill(&mut self.author, &other.author);
        fill(&mut self.composer, &other.composer);
        fill(&mut self.meter, &other.meter);
        fill(&mut self.key, &other.key);
        fill(&mut self.time, &other.time);
        fill(&mut self.scriptures, &other.scriptures);
    }

    pub fn is_empty(&self) -> bool {
        *self == HymnMetadata::default()
    }
}

/// Candidate record handed from a source adapter into the dedup engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hymn {
    pub reference: SongReference,
    pub languages: BTreeMap<String, BTreeSet<SongReference>>,
    pub relevant: BTreeSet<SongReference>,
    pub title: Option<String>,
    pub verses: Vec<String>,
    pub metadata: HymnMetadata,
    pub provenance: Provenance,
}

impl Hymn {
    pub fn new(reference: SongReference, provenance: Provenance) -> Self {
        Self {
            reference,
            languages: BTreeMap::new(),
            relevant: BTreeSet::new(),
            title: None,
            verses: Vec::new(),
            metadata: HymnMetadata::default(),
            provenance,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_verses<I, S>(mut self, verses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.verses = verses.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_language(mut self, language: &str, target: SongReference) -> Self {
        self.languages
            .entry(normalize_language(language))
            .or_default()
            .insert(target);
        self
    }

    pub fn with_relevant(mut self, target: SongReference) -> Self {
        self.relevant.insert(target);
        self
    }

    pub fn with_metadata(mut self, metadata: HymnMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn source(&self) -> &SourceId {
        &self.provenance.source
    }

    /// Every outgoing link, language variants first.
    pub fn links(&self) -> impl Iterator<Item = (LinkKind, &SongReference)> + '_ {
        self.languages
            .values()
            .flatten()
            .map(|r| (LinkKind::Language, r))
            .chain(self.relevant.iter().map(|r| (LinkKind::Relevant, r)))
    }
}

pub fn normalize_language(code: &str) -> String {
    code.trim().to_ascii_lowercase()
}

/// One merged hymn in the output catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalHymn {
    pub reference: SongReference,
    /// Member references folded into this identity, the identity included.
    pub aliases: BTreeSet<SongReference>,
    pub languages: BTreeMap<String, BTreeSet<SongReference>>,
    pub relevant: BTreeSet<SongReference>,
    pub title: Option<String>,
    pub verses: Vec<String>,
    pub metadata: HymnMetadata,
    pub sources: BTreeSet<SourceId>,
}

impl CanonicalHymn {
    pub fn links(&self) -> impl Iterator<Item = (LinkKind, Option<&str>, &SongReference)> + '_ {
        self.languages
            .iter()
            .flat_map(|(lang, refs)| refs.iter().map(move |r| (LinkKind::Language, Some(lang.as_str()), r)))
            .chain(self.relevant.iter().map(|r| (LinkKind::Relevant, None, r)))
    }
}

/// A link on a canonical hymn whose target is not in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DanglingLink {
    pub holder: SongReference,
    pub kind: LinkKind,
    pub language: Option<String>,
    pub target: SongReference,
}

/// Output catalog keyed by canonical identity, so identities are unique by construction.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<CanonicalHymn>", into = "Vec<CanonicalHymn>")]
pub struct Catalog {
    hymns: BTreeMap<SongReference, CanonicalHymn>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the hymn stored under its identity.
    pub fn insert(&mut self, hymn: CanonicalHymn) -> Option<CanonicalHymn> {
        self.hymns.insert(hymn.reference.clone(), hymn)
    }

    pub fn get(&self, reference: &SongReference) -> Option<&CanonicalHymn> {
        self.hymns.get(reference)
    }

    pub fn contains(&self, reference: &SongReference) -> bool {
        self.hymns.contains_key(reference)
    }

    pub fn len(&self) -> usize {
        self.hymns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hymns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CanonicalHymn> {
        self.hymns.values()
    }

    /// Canonical identity that absorbed `alias`, if any.
    pub fn canonical_for_alias(&self, alias: &SongReference) -> Option<&SongReference> {
        self.hymns
            .values()
            .find(|h| h.aliases.contains(alias))
            .map(|h| &h.reference)
    }

    pub fn dangling_links(&self) -> Vec<DanglingLink> {
        let mut dangling = Vec::new();
        for hymn in self.hymns.values() {
            for (kind, language, target) in hymn.links() {
                if self.contains(target) {
                    continue;
                }
                dangling.push(DanglingLink {
                    holder: hymn.reference.clone(),
                    kind,
                    language: language.map(ToString::to_string),
                    target: target.clone(),
                });
            }
        }
        dangling
    }
}

impl From<Vec<CanonicalHymn>> for Catalog {
    fn from(hymns: Vec<CanonicalHymn>) -> Self {
        let mut catalog = Catalog::new();
        for hymn in hymns {
            catalog.insert(hymn);
        }
        catalog
    }
}

impl From<Catalog> for Vec<CanonicalHymn> {
    fn from(catalog: Catalog) -> Self {
        catalog.hymns.into_values().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Adapter,
    Cluster,
    Merge,
    Patch,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    High,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    AmbiguousDuplicate,
    DanglingReference,
    IdentityConflict,
    PatchTargetNotFound,
    MalformedRecord,
    InfrastructureFailure,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::AmbiguousDuplicate => "AMBIGUOUS_DUPLICATE",
            ErrorKind::DanglingReference => "DANGLING_REFERENCE",
            ErrorKind::IdentityConflict => "IDENTITY_CONFLICT",
            ErrorKind::PatchTargetNotFound => "PATCH_TARGET_NOT_FOUND",
            ErrorKind::MalformedRecord => "MALFORMED_RECORD",
            ErrorKind::InfrastructureFailure => "INFRASTRUCTURE_FAILURE",
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            ErrorKind::AmbiguousDuplicate
            | ErrorKind::DanglingReference
            | ErrorKind::PatchTargetNotFound
            | ErrorKind::MalformedRecord => Severity::Warning,
            ErrorKind::IdentityConflict => Severity::High,
            ErrorKind::InfrastructureFailure => Severity::Fatal,
        }
    }

    pub fn is_recoverable(self) -> bool {
        self.severity() != Severity::Fatal
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured, accumulated problem report. Recoverable kinds never stop a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineError {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub severity: Severity,
    pub references: Vec<SongReference>,
    pub source: Option<SourceId>,
    pub message: String,
}

impl PipelineError {
    pub fn new(stage: Stage, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            severity: kind.severity(),
            references: Vec::new(),
            source: None,
            message: message.into(),
        }
    }

    pub fn with_reference(mut self, reference: SongReference) -> Self {
        self.references.push(reference);
        self
    }

    pub fn with_references(mut self, references: impl IntoIterator<Item = SongReference>) -> Self {
        self.references.extend(references);
        self
    }

    pub fn with_source(mut self, source: impl Into<SourceId>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {} {}", self.stage, self.kind, self.message)?;
        if !self.references.is_empty() {
            let refs = self
                .references
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, " ({refs})")?;
        }
        if let Some(source) = &self.source {
            write!(f, " from {source}")?;
        }
        Ok(())
    }
}

/// Count errors per kind, keyed by the wire name.
pub fn tally_by_kind(errors: &[PipelineError]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for error in errors {
        *counts.entry(error.kind.as_str().to_string()).or_default() += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(s: &str) -> SongReference {
        s.parse().unwrap()
    }

    #[test]
    fn references_normalize_case_and_whitespace() {
        assert_eq!(r(" h/12B "), r("h/12b"));
        assert_eq!(r("NS/ 154").to_string(), "ns/154");
        assert_ne!(r("h/12"), r("nt/12"));
    }

    #[test]
    fn malformed_references_are_rejected() {
        assert_eq!("h40".parse::<SongReference>(), Err(ParseReferenceError::MissingSeparator("h40".into())));
        assert_eq!(
            "zz/1".parse::<SongReference>(),
            Err(ParseReferenceError::UnknownHymnType("zz".into()))
        );
        assert_eq!("h/ ".parse::<SongReference>(), Err(ParseReferenceError::EmptyNumber));
        assert!("h/1 2".parse::<SongReference>().is_err());
    }

    #[test]
    fn references_order_numerically_within_type() {
        let mut refs = vec![r("nt/1"), r("h/100"), r("h/12b"), r("h/9"), r("h/12"), r("h/x")];
        refs.sort();
        let rendered: Vec<String> = refs.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["h/9", "h/12", "h/12b", "h/100", "h/x", "nt/1"]);
    }

    #[test]
    fn references_serialize_as_strings() {
        let json = serde_json::to_string(&r("ch/40")).unwrap();
        assert_eq!(json, "\"ch/40\"");
        let back: SongReference = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r("ch/40"));
        assert!(serde_json::from_str::<SongReference>("\"nope\"").is_err());
    }

    #[test]
    fn metadata_fill_keeps_populated_fields() {
        let mut winner = HymnMetadata {
            author: Some("Newton".into()),
            ..Default::default()
        };
        let fallback = HymnMetadata {
            author: Some("Anonymous".into()),
            meter: Some("8.6.8.6".into()),
            ..Default::default()
        };
        winner.fill_missing_from(&fallback);
        assert_eq!(winner.author.as_deref(), Some("Newton"));
        assert_eq!(winner.meter.as_deref(), Some("8.6.8.6"));
    }

    #[test]
    fn catalog_reports_dangling_links() {
        let mut catalog = Catalog::new();
        let mut languages = BTreeMap::new();
        languages.insert("zh".to_string(), BTreeSet::from([r("ch/40"), r("ch/999")]));
        catalog.insert(CanonicalHymn {
            reference: r("h/40"),
            aliases: BTreeSet::from([r("h/40")]),
            languages,
            relevant: BTreeSet::new(),
            title: None,
            verses: vec![],
            metadata: HymnMetadata::default(),
            sources: BTreeSet::new(),
        });
        catalog.insert(CanonicalHymn {
            reference: r("ch/40"),
            aliases: BTreeSet::from([r("ch/40")]),
            languages: BTreeMap::new(),
            relevant: BTreeSet::new(),
            title: None,
            verses: vec![],
            metadata: HymnMetadata::default(),
            sources: BTreeSet::new(),
        });
        let dangling = catalog.dangling_links();
        assert_eq!(dangling.len(), 1);
        assert_eq!(dangling[0].target, r("ch/999"));
        assert_eq!(dangling[0].language.as_deref(), Some("zh"));
    }

    #[test]
    fn error_severity_follows_kind() {
        let err = PipelineError::new(Stage::Merge, ErrorKind::IdentityConflict, "types disagree")
            .with_reference(r("h/1"))
            .with_source("h4a");
        assert_eq!(err.severity, Severity::High);
        assert!(err.to_string().contains("IDENTITY_CONFLICT"));
        assert!(!ErrorKind::InfrastructureFailure.is_recoverable());
    }
}

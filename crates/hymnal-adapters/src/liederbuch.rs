//! German songbook, a YAML list whose entries point at their English original.

use anyhow::Context;
use hymnal_core::{Hymn, HymnMetadata, HymnType};
use hymnal_storage::Snapshot;
use serde::Deserialize;

use crate::normalize::{clean_verse, malformed, provenance, text_or_none, NumberOrText};
use crate::{check_source, AdapterError, AdapterOutput, SnapshotFormat, SourceAdapter};

pub const SOURCE_ID: &str = "liederbuch";

#[derive(Debug, Deserialize)]
struct Lied {
    nummer: NumberOrText,
    #[serde(default)]
    titel: Option<String>,
    /// English original: a bare number is a classic hymn.
    #[serde(default)]
    englisch: Option<NumberOrText>,
    #[serde(default)]
    strophen: Vec<String>,
    #[serde(default)]
    rubrik: Option<String>,
    #[serde(default)]
    dichter: Option<String>,
    #[serde(default)]
    komponist: Option<String>,
    #[serde(default)]
    versmass: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LiederbuchAdapter;

impl LiederbuchAdapter {
    fn convert(&self, position: usize, lied: Lied, snapshot: &Snapshot, output: &mut AdapterOutput) {
        let reference = match lied.nummer.to_reference(HymnType::German) {
            Ok(reference) => reference,
            Err(message) => {
                output.errors.push(malformed(SOURCE_ID, format!("entry {position}: {message}")));
                return;
            }
        };
        let mut hymn = Hymn::new(reference.clone(), provenance(snapshot)).with_metadata(HymnMetadata {
            category: lied.rubrik.as_deref().and_then(text_or_none),
            author: lied.dichter.as_deref().and_then(text_or_none),
            composer: lied.komponist.as_deref().and_then(text_or_none),
            meter: lied.versmass.as_deref().and_then(text_or_none),
            ..Default::default()
        });
        hymn.title = lied.titel.as_deref().and_then(text_or_none);
        hymn.verses = lied.strophen.iter().filter_map(|s| clean_verse(s.lines())).collect();
        if let Some(english) = &lied.englisch {
            match english.to_reference(HymnType::ClassicHymn) {
                Ok(target) => hymn = hymn.with_language("en", target),
                Err(message) => output
                    .errors
                    .push(malformed(SOURCE_ID, format!("{reference}: {message}")).with_reference(reference.clone())),
            }
        }
        output.hymns.push(hymn);
    }
}

#[async_trait::async_trait]
impl SourceAdapter for LiederbuchAdapter {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn format(&self) -> SnapshotFormat {
        SnapshotFormat::Yaml
    }

    fn parse_snapshot(&self, snapshot: &Snapshot) -> Result<AdapterOutput, AdapterError> {
        check_source(self, snapshot)?;
        // Entries are decoded one by one so a bad entry only costs itself.
        let entries: Vec<serde_yaml::Value> = serde_yaml::from_str(&snapshot.text)
            .with_context(|| format!("parsing {}", snapshot.path.display()))?;
        let mut output = AdapterOutput::default();
        for (idx, entry) in entries.into_iter().enumerate() {
            match serde_yaml::from_value::<Lied>(entry) {
                Ok(lied) => self.convert(idx + 1, lied, snapshot, &mut output),
                Err(err) => output
                    .errors
                    .push(malformed(SOURCE_ID, format!("entry {}: {err}", idx + 1))),
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::snapshot;
    use hymnal_core::{ErrorKind, SongReference};
    use std::collections::BTreeSet;

    fn r(s: &str) -> SongReference {
        s.parse().unwrap()
    }

    const SAMPLE: &str = r#"
- nummer: 12
  titel: "Jesus, du bist voll Erbarmen"
  englisch: 40
  rubrik: Lobpreis
  strophen:
    - |
      Jesus, du bist voll Erbarmen,
        voller Gnade
    - "  "
- nummer: "12a"
  englisch: "ns/7"
- titel: ohne Nummer
- nummer: 13
  englisch: "zz/1"
"#;

    #[test]
    fn parses_entries_and_english_links() {
        let output = LiederbuchAdapter.parse_snapshot(&snapshot(SOURCE_ID, SAMPLE)).unwrap();
        assert_eq!(output.hymns.len(), 3);
        let first = &output.hymns[0];
        assert_eq!(first.reference, r("de/12"));
        assert_eq!(first.title.as_deref(), Some("Jesus, du bist voll Erbarmen"));
        assert_eq!(first.verses, vec!["Jesus, du bist voll Erbarmen,\nvoller Gnade"]);
        assert_eq!(first.languages["en"], BTreeSet::from([r("h/40")]));
        assert_eq!(first.metadata.category.as_deref(), Some("Lobpreis"));
        assert_eq!(output.hymns[1].languages["en"], BTreeSet::from([r("ns/7")]));
        assert!(output.hymns[2].languages.is_empty());
    }

    #[test]
    fn bad_entries_are_malformed_records() {
        let output = LiederbuchAdapter.parse_snapshot(&snapshot(SOURCE_ID, SAMPLE)).unwrap();
        assert_eq!(output.errors.len(), 2);
        assert!(output.errors.iter().all(|e| e.kind == ErrorKind::MalformedRecord));
        assert!(output.errors[0].message.starts_with("entry 3:"));
        assert_eq!(output.errors[1].references, vec![r("de/13")]);
    }

    #[test]
    fn non_list_snapshot_fails_the_adapter() {
        assert!(LiederbuchAdapter
            .parse_snapshot(&snapshot(SOURCE_ID, "nummer: 1"))
            .is_err());
    }
}

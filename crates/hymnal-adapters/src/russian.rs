//! Russian hymnal as JSON Lines, one hymn per line.

use hymnal_core::{Hymn, HymnType};
use hymnal_storage::Snapshot;
use serde::Deserialize;

use crate::normalize::{clean_verse, malformed, provenance, text_or_none, NumberOrText};
use crate::{check_source, AdapterError, AdapterOutput, SnapshotFormat, SourceAdapter};

pub const SOURCE_ID: &str = "russian";

#[derive(Debug, Deserialize)]
struct Line {
    number: NumberOrText,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    verses: Vec<Vec<String>>,
    /// Classic hymn this one translates.
    #[serde(default)]
    english: Option<NumberOrText>,
    #[serde(default)]
    related: Vec<NumberOrText>,
    #[serde(default)]
    category: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RussianAdapter;

impl RussianAdapter {
    fn convert(&self, line_no: usize, line: Line, snapshot: &Snapshot, output: &mut AdapterOutput) {
        let reference = match line.number.to_reference(HymnType::Russian) {
            Ok(reference) => reference,
            Err(message) => {
                output.errors.push(malformed(SOURCE_ID, format!("line {line_no}: {message}")));
                return;
            }
        };
        let mut hymn = Hymn::new(reference.clone(), provenance(snapshot));
        hymn.title = line.title.as_deref().and_then(text_or_none);
        hymn.verses = line
            .verses
            .iter()
            .filter_map(|v| clean_verse(v.iter().map(String::as_str)))
            .collect();
        hymn.metadata.category = line.category.as_deref().and_then(text_or_none);

        let links = line
            .english
            .iter()
            .map(|n| (true, n.to_reference(HymnType::ClassicHymn)))
            .chain(line.related.iter().map(|n| (false, n.to_reference(HymnType::Russian))));
        for (is_language, target) in links {
            match target {
                Ok(target) if is_language => hymn = hymn.with_language("en", target),
                Ok(target) => hymn = hymn.with_relevant(target),
                Err(message) => output.errors.push(
                    malformed(SOURCE_ID, format!("line {line_no}: {message}")).with_reference(reference.clone()),
                ),
            }
        }
        output.hymns.push(hymn);
    }
}

#[async_trait::async_trait]
impl SourceAdapter for RussianAdapter {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn format(&self) -> SnapshotFormat {
        SnapshotFormat::JsonLines
    }

    fn parse_snapshot(&self, snapshot: &Snapshot) -> Result<AdapterOutput, AdapterError> {
        check_source(self, snapshot)?;
        let mut output = AdapterOutput::default();
        for (idx, raw) in snapshot.text.lines().enumerate() {
            if raw.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Line>(raw) {
                Ok(line) => self.convert(idx + 1, line, snapshot, &mut output),
                Err(err) => output
                    .errors
                    .push(malformed(SOURCE_ID, format!("line {}: {err}", idx + 1))),
            }
        }
        Ok(output)
    }
}

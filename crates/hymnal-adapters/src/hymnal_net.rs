//! Primary network catalog. The snapshot is a JSON array of captured API
//! responses keyed by site path.

use anyhow::Context;
use hymnal_core::{Hymn, HymnMetadata, SongReference};
use hymnal_storage::Snapshot;
use serde::Deserialize;

use crate::normalize::{clean_verse, language_of, malformed, parse_site_path, provenance, text_or_none};
use crate::{check_source, AdapterError, AdapterOutput, SnapshotFormat, SourceAdapter};

pub const SOURCE_ID: &str = "hymnal-net";

#[derive(Debug, Deserialize)]
struct ApiHymn {
    path: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    lyrics: Vec<ApiVerse>,
    #[serde(default)]
    meta_data: Vec<ApiMeta>,
}

#[derive(Debug, Deserialize)]
struct ApiVerse {
    #[serde(default)]
    lines: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ApiMeta {
    name: String,
    #[serde(default)]
    data: Vec<ApiDatum>,
}

#[derive(Debug, Deserialize)]
struct ApiDatum {
    #[serde(default)]
    value: String,
    #[serde(default)]
    path: Option<String>,
}

impl ApiMeta {
    fn joined_values(&self) -> Option<String> {
        let values: Vec<&str> = self.data.iter().map(|d| d.value.trim()).filter(|v| !v.is_empty()).collect();
        text_or_none(values.join(", "))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HymnalNetAdapter;

impl HymnalNetAdapter {
    fn convert(&self, raw: ApiHymn, snapshot: &Snapshot, output: &mut AdapterOutput) {
        let reference = match parse_site_path(&raw.path) {
            Ok(reference) => reference,
            Err(message) => {
                output.errors.push(malformed(SOURCE_ID, message));
                return;
            }
        };

        let mut hymn = Hymn::new(reference.clone(), provenance(snapshot));
        hymn.title = raw.title.as_deref().and_then(text_or_none);
        hymn.verses = raw
            .lyrics
            .iter()
            .filter_map(|v| clean_verse(v.lines.iter().map(String::as_str)))
            .collect();

        let mut metadata = HymnMetadata::default();
        for meta in &raw.meta_data {
            match meta.name.trim().to_ascii_lowercase().as_str() {
                "languages" | "relevant" => {
                    let is_language = meta.name.eq_ignore_ascii_case("languages");
                    for datum in &meta.data {
                        let Some(path) = datum.path.as_deref() else {
                            continue;
                        };
                        match parse_site_path(path) {
                            Ok(target) if is_language => {
                                hymn = hymn.with_language(language_of(target.hymn_type()), target);
                            }
                            Ok(target) => hymn = hymn.with_relevant(target),
                            Err(message) => output.errors.push(
                                malformed(SOURCE_ID, format!("{reference}: {message}")).with_reference(reference.clone()),
                            ),
                        }
                    }
                }
                "category" => metadata.category = meta.joined_values(),
                "subcategory" => metadata.subcategory = meta.joined_values(),
                "lyrics" => metadata.author = meta.joined_values(),
                "music" => metadata.composer = meta.joined_values(),
                "meter" => metadata.meter = meta.joined_values(),
                "key" => metadata.key = meta.joined_values(),
                "time" => metadata.time = meta.joined_values(),
                "scriptures" => metadata.scriptures = meta.joined_values(),
                _ => {}
            }
        }
        hymn.metadata = metadata;
        drop_self_links(&mut hymn);
        output.hymns.push(hymn);
    }
}

/// The site lists a hymn under its own "Languages" block; those entries carry no information.
fn drop_self_links(hymn: &mut Hymn) {
    let own: SongReference = hymn.reference.clone();
    for targets in hymn.languages.values_mut() {
        targets.remove(&own);
    }
    hymn.languages.retain(|_, targets| !targets.is_empty());
    hymn.relevant.remove(&own);
}

#[async_trait::async_trait]
impl SourceAdapter for HymnalNetAdapter {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn format(&self) -> SnapshotFormat {
        SnapshotFormat::Json
    }

    fn parse_snapshot(&self, snapshot: &Snapshot) -> Result<AdapterOutput, AdapterError> {
        check_source(self, snapshot)?;
        let raw: Vec<ApiHymn> = serde_json::from_str(&snapshot.text)
            .with_context(|| format!("parsing {}", snapshot.path.display()))?;
        let mut output = AdapterOutput::default();
        for item in raw {
            self.convert(item, snapshot, &mut output);
        }
        Ok(output)
    }
}

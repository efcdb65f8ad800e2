//! Key and text normalization shared by the source adapters.

use std::fmt;

use hymnal_core::{ErrorKind, HymnType, PipelineError, Provenance, SongReference, Stage};
use hymnal_storage::Snapshot;
use serde::Deserialize;

pub fn text_or_none(value: impl AsRef<str>) -> Option<String> {
    let trimmed = value.as_ref().trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Collapse runs of whitespace inside a single line of text.
pub fn clean_line(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Trim every line and drop empty ones; `None` when nothing is left.
pub fn clean_verse<'a>(lines: impl IntoIterator<Item = &'a str>) -> Option<String> {
    let kept: Vec<String> = lines
        .into_iter()
        .map(clean_line)
        .filter(|l| !l.is_empty())
        .collect();
    if kept.is_empty() {
        None
    } else {
        Some(kept.join("\n"))
    }
}

/// Split a text body into verses on blank lines.
pub fn split_verses(body: &str) -> Vec<String> {
    let mut verses = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in body.lines() {
        if line.trim().is_empty() {
            if let Some(verse) = clean_verse(current.drain(..)) {
                verses.push(verse);
            }
        } else {
            current.push(line);
        }
    }
    if let Some(verse) = clean_verse(current) {
        verses.push(verse);
    }
    verses
}

/// Undo the usual OCR confusions in a hymn number (`4O` -> `40`, `l2` -> `12`).
/// Letters after the first digit run are kept as suffixes.
pub fn repair_ocr_digits(raw: &str) -> String {
    let trimmed = raw.trim();
    let mut out = String::with_capacity(trimmed.len());
    let mut in_digits = true;
    for ch in trimmed.chars() {
        let mapped = match ch {
            'O' | 'o' if in_digits => '0',
            'l' | 'I' | '|' if in_digits => '1',
            c => c,
        };
        if !mapped.is_ascii_digit() {
            in_digits = false;
        }
        out.push(mapped);
    }
    out
}

/// Language code under which a link into `hymn_type` is filed.
pub fn language_of(hymn_type: HymnType) -> &'static str {
    match hymn_type {
        HymnType::ClassicHymn
        | HymnType::NewTune
        | HymnType::NewSong
        | HymnType::Children
        | HymnType::HowardHigashi
        | HymnType::BeFilled => "en",
        HymnType::Chinese | HymnType::ChineseSupplement => "zh",
        HymnType::German => "de",
        HymnType::Russian => "ru",
        HymnType::Spanish => "es",
        HymnType::French => "fr",
        HymnType::Korean => "ko",
        HymnType::Japanese => "ja",
        HymnType::Tagalog => "tl",
        HymnType::Dutch => "nl",
    }
}

/// Parse a site path like `/en/hymn/h/40` (query strings allowed).
pub fn parse_site_path(path: &str) -> Result<SongReference, String> {
    let without_query = path.split(['?', '#']).next().unwrap_or_default();
    let segments: Vec<&str> = without_query.split('/').filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        [_, "hymn", kind, number] => {
            let hymn_type =
                HymnType::from_abbreviation(kind).ok_or_else(|| format!("unknown hymn type `{kind}` in `{path}`"))?;
            SongReference::new(hymn_type, number).map_err(|e| format!("bad path `{path}`: {e}"))
        }
        _ => Err(format!("`{path}` is not a /<lang>/hymn/<type>/<number> path")),
    }
}

const LETTER_PREFIXES: &[(&str, HymnType)] = &[
    ("E", HymnType::ClassicHymn),
    ("NS", HymnType::NewSong),
    ("NT", HymnType::NewTune),
    ("CH", HymnType::Chinese),
    ("CS", HymnType::ChineseSupplement),
    ("C", HymnType::Children),
    ("G", HymnType::German),
    ("R", HymnType::Russian),
    ("S", HymnType::Spanish),
    ("F", HymnType::French),
    ("K", HymnType::Korean),
    ("J", HymnType::Japanese),
    ("T", HymnType::Tagalog),
    ("BF", HymnType::BeFilled),
];

/// Parse a letter-prefixed key like `E40`, `NS154` or `CS12b`.
pub fn parse_letter_key(key: &str) -> Result<SongReference, String> {
    let key = key.trim();
    let split = key.find(|c: char| c.is_ascii_digit()).unwrap_or(key.len());
    let (prefix, number) = key.split_at(split);
    let prefix = prefix.to_ascii_uppercase();
    let hymn_type = LETTER_PREFIXES
        .iter()
        .find(|(p, _)| *p == prefix)
        .map(|(_, t)| *t)
        .ok_or_else(|| format!("unknown key prefix `{prefix}` in `{key}`"))?;
    SongReference::new(hymn_type, number).map_err(|e| format!("bad key `{key}`: {e}"))
}

/// Number fields that some sources write as integers and others as strings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum NumberOrText {
    Number(u64),
    Text(String),
}

impl fmt::Display for NumberOrText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NumberOrText::Number(n) => write!(f, "{n}"),
            NumberOrText::Text(s) => f.write_str(s.trim()),
        }
    }
}

impl NumberOrText {
    /// Bare numbers belong to `default_type`; anything else is read as `<abbr>/<number>`.
    pub fn to_reference(&self, default_type: HymnType) -> Result<SongReference, String> {
        let text = self.to_string();
        if text.contains('/') {
            return text.parse().map_err(|e| format!("bad reference `{text}`: {e}"));
        }
        SongReference::new(default_type, &text).map_err(|e| format!("bad number `{text}`: {e}"))
    }
}

pub fn provenance(snapshot: &Snapshot) -> Provenance {
    Provenance {
        snapshot: Some(snapshot.file_name()),
        captured_at: Some(snapshot.captured_at),
        ..Provenance::new(snapshot.source_id.as_str())
    }
}

pub fn malformed(source_id: &str, message: impl Into<String>) -> PipelineError {
    PipelineError::new(Stage::Adapter, ErrorKind::MalformedRecord, message).with_source(source_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(s: &str) -> SongReference {
        s.parse().unwrap()
    }

    #[test]
    fn verses_split_on_blank_lines() {
        let body = "  Line one \n line   two\n\n\n Chorus line\n   \nlast\n";
        assert_eq!(
            split_verses(body),
            vec!["Line one\nline two", "Chorus line", "last"]
        );
        assert!(split_verses("\n \n").is_empty());
    }

    #[test]
    fn ocr_digits_are_repaired_only_in_the_number_run() {
        assert_eq!(repair_ocr_digits(" 4O "), "40");
        assert_eq!(repair_ocr_digits("l2"), "12");
        assert_eq!(repair_ocr_digits("12b"), "12b");
        assert_eq!(repair_ocr_digits("12bo"), "12bo");
    }

    #[test]
    fn site_paths_parse_to_references() {
        assert_eq!(parse_site_path("/en/hymn/h/40"), Ok(r("h/40")));
        assert_eq!(parse_site_path("/en/hymn/ns/154?gb=1"), Ok(r("ns/154")));
        assert!(parse_site_path("/en/search/h/40").is_err());
        assert!(parse_site_path("/en/hymn/zz/1").is_err());
    }

    #[test]
    fn letter_keys_use_the_longest_prefix() {
        assert_eq!(parse_letter_key("E40"), Ok(r("h/40")));
        assert_eq!(parse_letter_key("CS12b"), Ok(r("ts/12b")));
        assert_eq!(parse_letter_key("CH40"), Ok(r("ch/40")));
        assert_eq!(parse_letter_key("c3"), Ok(r("c/3")));
        assert!(parse_letter_key("X1").is_err());
        assert!(parse_letter_key("E").is_err());
    }

    #[test]
    fn number_or_text_defaults_the_hymn_type() {
        let plain: NumberOrText = serde_json::from_str("40").unwrap();
        assert_eq!(plain.to_reference(HymnType::ClassicHymn), Ok(r("h/40")));
        let text: NumberOrText = serde_json::from_str("\"40A\"").unwrap();
        assert_eq!(text.to_reference(HymnType::Russian), Ok(r("ru/40a")));
        let full: NumberOrText = serde_json::from_str("\"ns/7\"").unwrap();
        assert_eq!(full.to_reference(HymnType::ClassicHymn), Ok(r("ns/7")));
    }
}

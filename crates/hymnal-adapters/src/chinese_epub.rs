//! Chinese hymnal extracted from an EPUB. The snapshot is a JSON list of
//! XHTML chapters; each chapter holds one or more `section.hymn` blocks.

use anyhow::Context;
use hymnal_core::{Hymn, HymnType, SongReference};
use hymnal_storage::Snapshot;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;

use crate::normalize::{clean_verse, malformed, provenance, repair_ocr_digits, text_or_none};
use crate::{check_source, AdapterError, AdapterOutput, SnapshotFormat, SourceAdapter};

pub const SOURCE_ID: &str = "chinese-epub";

#[derive(Debug, Deserialize)]
struct Chapter {
    href: String,
    xhtml: String,
}

struct Selectors {
    hymn: Selector,
    number: Selector,
    title: Selector,
    verse: Selector,
    line: Selector,
    english: Selector,
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

impl Selectors {
    fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            hymn: selector("section.hymn")?,
            number: selector(".number")?,
            title: selector(".title")?,
            verse: selector(".verse")?,
            line: selector("p")?,
            english: selector(".english")?,
        })
    }
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(element.text().collect::<String>())
}

fn select_first_text(element: ElementRef<'_>, selector: &Selector) -> Option<String> {
    element.select(selector).next().and_then(element_text)
}

/// Digits inside free text like `English 40` or `E 4O`.
fn english_number(text: &str) -> Option<String> {
    let repaired = repair_ocr_digits(text.trim_start_matches(|c: char| !c.is_ascii_digit() && c != 'O'));
    let digits: String = repaired.chars().take_while(char::is_ascii_digit).collect();
    text_or_none(digits)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChineseEpubAdapter;

impl ChineseEpubAdapter {
    fn convert_section(
        &self,
        chapter: &Chapter,
        section: ElementRef<'_>,
        selectors: &Selectors,
        snapshot: &Snapshot,
        output: &mut AdapterOutput,
    ) {
        let hymn_type = match section.value().attr("data-hymnal") {
            None => HymnType::Chinese,
            Some(abbr) => match HymnType::from_abbreviation(abbr) {
                Some(t) => t,
                None => {
                    output
                        .errors
                        .push(malformed(SOURCE_ID, format!("{}: unknown hymnal `{abbr}`", chapter.href)));
                    return;
                }
            },
        };
        let Some(raw_number) = select_first_text(section, &selectors.number) else {
            output
                .errors
                .push(malformed(SOURCE_ID, format!("{}: hymn section without a number", chapter.href)));
            return;
        };
        let reference = match SongReference::new(hymn_type, repair_ocr_digits(&raw_number)) {
            Ok(reference) => reference,
            Err(err) => {
                output
                    .errors
                    .push(malformed(SOURCE_ID, format!("{}: number `{raw_number}`: {err}", chapter.href)));
                return;
            }
        };

        let mut hymn = Hymn::new(reference.clone(), provenance(snapshot));
        hymn.title = select_first_text(section, &selectors.title);
        hymn.verses = section
            .select(&selectors.verse)
            .filter_map(|verse| {
                let lines: Vec<String> = verse.select(&selectors.line).filter_map(element_text).collect();
                if lines.is_empty() {
                    element_text(verse)
                } else {
                    clean_verse(lines.iter().map(String::as_str))
                }
            })
            .collect();

        if let Some(text) = select_first_text(section, &selectors.english) {
            match english_number(&text).map(|n| SongReference::new(HymnType::ClassicHymn, n)) {
                Some(Ok(target)) => hymn = hymn.with_language("en", target),
                _ => output.errors.push(
                    malformed(SOURCE_ID, format!("{}: unreadable English cross-reference `{text}`", chapter.href))
                        .with_reference(reference.clone()),
                ),
            }
        }
        output.hymns.push(hymn);
    }
}

#[async_trait::async_trait]
impl SourceAdapter for ChineseEpubAdapter {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn format(&self) -> SnapshotFormat {
        SnapshotFormat::EpubXhtml
    }

    fn parse_snapshot(&self, snapshot: &Snapshot) -> Result<AdapterOutput, AdapterError> {
        check_source(self, snapshot)?;
        let chapters: Vec<Chapter> = serde_json::from_str(&snapshot.text)
            .with_context(|| format!("parsing {}", snapshot.path.display()))?;
        let selectors = Selectors::new()?;
        let mut output = AdapterOutput::default();
        for chapter in &chapters {
            let document = Html::parse_document(&chapter.xhtml);
            for section in document.select(&selectors.hymn) {
                self.convert_section(chapter, section, &selectors, snapshot, &mut output);
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::snapshot;
    use hymnal_core::ErrorKind;
    use std::collections::BTreeSet;

    fn r(s: &str) -> SongReference {
        s.parse().unwrap()
    }

    fn chapters(xhtml: &[&str]) -> String {
        let list: Vec<serde_json::Value> = xhtml
            .iter()
            .enumerate()
            .map(|(i, x)| serde_json::json!({"href": format!("OEBPS/Text/ch{i:04}.xhtml"), "xhtml": x}))
            .collect();
        serde_json::to_string(&list).unwrap()
    }

    const CHAPTER: &str = r#"<html><body>
      <section class="hymn">
        <h1 class="number">4O</h1>
        <h2 class="title"> 何等奇妙 </h2>
        <div class="verse"><p>何等奇妙，</p><p>  何等奥秘</p></div>
        <div class="verse">副歌</div>
        <span class="english">English 40</span>
      </section>
      <section class="hymn" data-hymnal="ts">
        <h1 class="number">12</h1>
        <h2 class="title">补充本</h2>
      </section>
      <section class="hymn"><h2 class="title">缺号</h2></section>
    </body></html>"#;

    #[test]
    fn parses_sections_with_ocr_repair() {
        let text = chapters(&[CHAPTER]);
        let output = ChineseEpubAdapter.parse_snapshot(&snapshot(SOURCE_ID, &text)).unwrap();
        assert_eq!(output.hymns.len(), 2);
        let first = &output.hymns[0];
        assert_eq!(first.reference, r("ch/40"));
        assert_eq!(first.title.as_deref(), Some("何等奇妙"));
        assert_eq!(first.verses, vec!["何等奇妙，\n何等奥秘", "副歌"]);
        assert_eq!(first.languages["en"], BTreeSet::from([r("h/40")]));
        assert_eq!(output.hymns[1].reference, r("ts/12"));
    }

    #[test]
    fn sections_without_numbers_are_reported() {
        let text = chapters(&[CHAPTER]);
        let output = ChineseEpubAdapter.parse_snapshot(&snapshot(SOURCE_ID, &text)).unwrap();
        assert_eq!(output.errors.len(), 1);
        assert_eq!(output.errors[0].kind, ErrorKind::MalformedRecord);
        assert!(output.errors[0].message.contains("ch0000.xhtml"));
    }

    #[test]
    fn english_numbers_survive_ocr_noise() {
        assert_eq!(english_number("English 4O").as_deref(), Some("40"));
        assert_eq!(english_number("E12"), Some("12".to_string()));
        assert_eq!(english_number("none"), None);
    }
}

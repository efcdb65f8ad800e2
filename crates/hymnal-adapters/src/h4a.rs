//! Flat-text export keyed by letter-prefixed numbers.
//!
//! ```text
//! #E40
//! title=What a miracle! What a mystery!
//! languages=zh:CH40,de:G12
//! related=NT40
//! ---
//! first verse line
//! second verse line
//!
//! next verse
//! ```

use hymnal_core::{Hymn, PipelineError};
use hymnal_storage::Snapshot;

use crate::normalize::{malformed, parse_letter_key, provenance, split_verses, text_or_none};
use crate::{check_source, AdapterError, AdapterOutput, SnapshotFormat, SourceAdapter};

pub const SOURCE_ID: &str = "h4a";

#[derive(Debug, Clone, Copy, Default)]
pub struct H4aAdapter;

struct RawRecord<'a> {
    line_no: usize,
    key: &'a str,
    headers: Vec<(usize, &'a str)>,
    body: Vec<&'a str>,
}

fn split_records<'a>(text: &'a str, errors: &mut Vec<PipelineError>) -> Vec<RawRecord<'a>> {
    let mut records: Vec<RawRecord<'_>> = Vec::new();
    let mut in_body = false;
    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        if let Some(key) = line.strip_prefix('#') {
            records.push(RawRecord {
                line_no,
                key: key.trim(),
                headers: Vec::new(),
                body: Vec::new(),
            });
            in_body = false;
            continue;
        }
        let Some(current) = records.last_mut() else {
            if !line.trim().is_empty() {
                errors.push(malformed(SOURCE_ID, format!("line {line_no}: text before the first record")));
            }
            continue;
        };
        if in_body {
            current.body.push(line);
        } else if line.trim() == "---" {
            in_body = true;
        } else if !line.trim().is_empty() {
            current.headers.push((line_no, line));
        }
    }
    records
}

fn parse_key_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

impl H4aAdapter {
    fn convert(&self, record: RawRecord<'_>, snapshot: &Snapshot, output: &mut AdapterOutput) {
        let reference = match parse_letter_key(record.key) {
            Ok(reference) => reference,
            Err(message) => {
                output
                    .errors
                    .push(malformed(SOURCE_ID, format!("line {}: {message}", record.line_no)));
                return;
            }
        };
        let mut hymn = Hymn::new(reference.clone(), provenance(snapshot));
        let link_error = |line_no: usize, message: String, errors: &mut Vec<PipelineError>| {
            errors.push(
                malformed(SOURCE_ID, format!("line {line_no}: {message}")).with_reference(reference.clone()),
            );
        };

        for (line_no, line) in record.headers {
            let Some((name, value)) = line.split_once('=') else {
                link_error(line_no, format!("header `{}` has no `=`", line.trim()), &mut output.errors);
                continue;
            };
            let value = value.trim();
            match name.trim().to_ascii_lowercase().as_str() {
                "title" => hymn.title = text_or_none(value),
                "category" => hymn.metadata.category = text_or_none(value),
                "subcategory" => hymn.metadata.subcategory = text_or_none(value),
                "author" => hymn.metadata.author = text_or_none(value),
                "composer" => hymn.metadata.composer = text_or_none(value),
                "meter" => hymn.metadata.meter = text_or_none(value),
                "key" => hymn.metadata.key = text_or_none(value),
                "time" => hymn.metadata.time = text_or_none(value),
                "scriptures" => hymn.metadata.scriptures = text_or_none(value),
                "languages" => {
                    for entry in parse_key_list(value) {
                        let Some((language, key)) = entry.split_once(':') else {
                            link_error(line_no, format!("language entry `{entry}` is not `lang:KEY`"), &mut output.errors);
                            continue;
                        };
                        match parse_letter_key(key) {
                            Ok(target) => hymn = hymn.with_language(language, target),
                            Err(message) => link_error(line_no, message, &mut output.errors),
                        }
                    }
                }
                "related" => {
                    for key in parse_key_list(value) {
                        match parse_letter_key(key) {
                            Ok(target) => hymn = hymn.with_relevant(target),
                            Err(message) => link_error(line_no, message, &mut output.errors),
                        }
                    }
                }
                _ => {}
            }
        }
        hymn.verses = split_verses(&record.body.join("\n"));
        output.hymns.push(hymn);
    }
}

#[async_trait::async_trait]
impl SourceAdapter for H4aAdapter {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn format(&self) -> SnapshotFormat {
        SnapshotFormat::FlatText
    }

    fn parse_snapshot(&self, snapshot: &Snapshot) -> Result<AdapterOutput, AdapterError> {
        check_source(self, snapshot)?;
        let mut output = AdapterOutput::default();
        let records = split_records(&snapshot.text, &mut output.errors);
        for record in records {
            self.convert(record, snapshot, &mut output);
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

    const SAMPLE: &str = "\
stray preamble
#E40
title=What a miracle! What a mystery!
meter=8.8.8.8
languages=zh:CH40, de:G12, ru:QQ1
related=NT40
---
What a miracle! What a mystery!
  That God and man

Oh, what a miracle!

#NS154
title=Lord, keep my heart always true to You
---
Lord, keep my heart
#Q9
title=unknown prefix
---
";

    #[test]
    fn parses_flat_records() {
        let output = H4aAdapter.parse_snapshot(&snapshot(SOURCE_ID, SAMPLE)).unwrap();
        assert_eq!(output.hymns.len(), 2);
        let first = &output.hymns[0];
        assert_eq!(first.reference, r("h/40"));
        assert_eq!(first.metadata.meter.as_deref(), Some("8.8.8.8"));
        assert_eq!(first.verses, vec!["What a miracle! What a mystery!\nThat God and man", "Oh, what a miracle!"]);
        assert_eq!(first.languages["zh"], BTreeSet::from([r("ch/40")]));
        assert_eq!(first.languages["de"], BTreeSet::from([r("de/12")]));
        assert_eq!(first.relevant, BTreeSet::from([r("nt/40")]));
        assert_eq!(output.hymns[1].reference, r("ns/154"));
        assert_eq!(output.hymns[1].verses, vec!["Lord, keep my heart"]);
    }

    #[test]
    fn bad_lines_are_reported_not_fatal() {
        let output = H4aAdapter.parse_snapshot(&snapshot(SOURCE_ID, SAMPLE)).unwrap();
        let messages: Vec<&str> = output.errors.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(output.errors.len(), 3, "{messages:?}");
        assert!(output.errors.iter().all(|e| e.kind == ErrorKind::MalformedRecord));
        assert!(messages[0].starts_with("line 1:"));
        assert!(messages[1].contains("QQ"));
        assert!(messages[2].contains("`Q`"));
    }
}

//! Parquet exports of the catalog, its links and the error list.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use hymnal_core::{Catalog, PipelineError};
use hymnal_storage::{OutputStore, StoredFile};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use tokio::fs;

pub const PARQUET_DIR: &str = "parquet";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

fn encode_parquet(batch: RecordBatch) -> Result<Vec<u8>> {
    let mut writer =
        ArrowWriter::try_new(Vec::new(), batch.schema(), None).context("opening parquet writer")?;
    writer.write(&batch).context("writing record batch")?;
    writer.into_inner().context("closing parquet writer")
}

fn joined<T: ToString>(items: impl IntoIterator<Item = T>) -> String {
    items.into_iter().map(|i| i.to_string()).collect::<Vec<_>>().join(", ")
}

fn hymns_batch(catalog: &Catalog) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("reference", DataType::Utf8, false),
        ArrowField::new("hymn_type", DataType::Utf8, false),
        ArrowField::new("number", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, true),
        ArrowField::new("verse_count", DataType::UInt32, false),
        ArrowField::new("aliases", DataType::Utf8, false),
        ArrowField::new("sources", DataType::Utf8, false),
    ]));
    let hymns: Vec<_> = catalog.iter().collect();

    let references = StringArray::from(hymns.iter().map(|h| h.reference.to_string()).collect::<Vec<_>>());
    let types = StringArray::from(
        hymns
            .iter()
            .map(|h| h.reference.hymn_type().to_string())
            .collect::<Vec<_>>(),
    );
    let numbers = StringArray::from(hymns.iter().map(|h| h.reference.number()).collect::<Vec<_>>());
    let titles = StringArray::from(hymns.iter().map(|h| h.title.as_deref()).collect::<Vec<_>>());
    let verse_counts = UInt32Array::from(
        hymns
            .iter()
            .map(|h| u32::try_from(h.verses.len()).unwrap_or(u32::MAX))
            .collect::<Vec<_>>(),
    );
    let aliases = StringArray::from(hymns.iter().map(|h| joined(&h.aliases)).collect::<Vec<_>>());
    let sources = StringArray::from(hymns.iter().map(|h| joined(&h.sources)).collect::<Vec<_>>());

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(references),
            Arc::new(types),
            Arc::new(numbers),
            Arc::new(titles),
            Arc::new(verse_counts),
            Arc::new(aliases),
            Arc::new(sources),
        ],
    )
    .context("building hymns record batch")
}

fn links_batch(catalog: &Catalog) -> Result<RecordBatch> {
    let rows: Vec<(String, String, Option<String>, String)> = catalog
        .iter()
        .flat_map(|h| {
            h.links().map(move |(kind, language, target)| {
                (
                    h.reference.to_string(),
                    kind.to_string(),
                    language.map(ToString::to_string),
                    target.to_string(),
                )
            })
        })
        .collect();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("holder", DataType::Utf8, false),
        ArrowField::new("kind", DataType::Utf8, false),
        ArrowField::new("language", DataType::Utf8, true),
        ArrowField::new("target", DataType::Utf8, false),
    ]));
    let holders = StringArray::from(rows.iter().map(|r| r.0.as_str()).collect::<Vec<_>>());
    let kinds = StringArray::from(rows.iter().map(|r| r.1.as_str()).collect::<Vec<_>>());
    let languages = StringArray::from(rows.iter().map(|r| r.2.as_deref()).collect::<Vec<_>>());
    let targets = StringArray::from(rows.iter().map(|r| r.3.as_str()).collect::<Vec<_>>());
    RecordBatch::try_new(
        schema,
        vec![Arc::new(holders), Arc::new(kinds), Arc::new(languages), Arc::new(targets)],
    )
    .context("building links record batch")
}

fn errors_batch(errors: &[PipelineError]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("stage", DataType::Utf8, false),
        ArrowField::new("kind", DataType::Utf8, false),
        ArrowField::new("severity", DataType::Utf8, false),
        ArrowField::new("source", DataType::Utf8, true),
        ArrowField::new("references", DataType::Utf8, false),
        ArrowField::new("message", DataType::Utf8, false),
    ]));
    let stages = StringArray::from(
        errors
            .iter()
            .map(|e| format!("{:?}", e.stage).to_ascii_lowercase())
            .collect::<Vec<_>>(),
    );
    let kinds = StringArray::from(errors.iter().map(|e| e.kind.as_str()).collect::<Vec<_>>());
    let severities = StringArray::from(
        errors
            .iter()
            .map(|e| format!("{:?}", e.severity).to_ascii_lowercase())
            .collect::<Vec<_>>(),
    );
    let sources = StringArray::from(
        errors
            .iter()
            .map(|e| e.source.as_ref().map(|s| s.as_str()))
            .collect::<Vec<_>>(),
    );
    let references = StringArray::from(errors.iter().map(|e| joined(&e.references)).collect::<Vec<_>>());
    let messages = StringArray::from(errors.iter().map(|e| e.message.as_str()).collect::<Vec<_>>());
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(stages),
            Arc::new(kinds),
            Arc::new(severities),
            Arc::new(sources),
            Arc::new(references),
            Arc::new(messages),
        ],
    )
    .context("building errors record batch")
}

fn manifest_entry(name: &str, run_dir: &Path, stored: &StoredFile) -> ParquetManifestFile {
    ParquetManifestFile {
        name: name.to_string(),
        path: stored
            .path
            .strip_prefix(run_dir)
            .unwrap_or(&stored.path)
            .display()
            .to_string(),
        sha256: stored.sha256.clone(),
        bytes: stored.byte_size as u64,
    }
}

/// Write `hymns`, `links` and `errors` parquet files plus a manifest under
/// `<run_dir>/parquet/`. Returns the manifest path.
pub async fn export_parquet(run_dir: &Path, catalog: &Catalog, errors: &[PipelineError]) -> Result<PathBuf> {
    let parquet_dir = run_dir.join(PARQUET_DIR);
    fs::create_dir_all(&parquet_dir)
        .await
        .with_context(|| format!("creating {}", parquet_dir.display()))?;

    let batches = [
        ("hymns", hymns_batch(catalog)?),
        ("links", links_batch(catalog)?),
        ("errors", errors_batch(errors)?),
    ];
    let mut files = Vec::with_capacity(batches.len());
    for (name, batch) in batches {
        let bytes = encode_parquet(batch).with_context(|| format!("encoding {name}.parquet"))?;
        let stored = OutputStore::write_atomic(&parquet_dir, &format!("{name}.parquet"), &bytes).await?;
        files.push(manifest_entry(name, run_dir, &stored));
    }

    let manifest = ParquetManifest {
        schema_version: 1,
        files,
    };
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    let stored = OutputStore::write_atomic(&parquet_dir, MANIFEST_FILE, &bytes).await?;
    Ok(stored.path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hymnal_core::{CanonicalHymn, ErrorKind, SongReference, Stage};
    use hymnal_storage::sha256_hex;
    use parquet::file::reader::{FileReader, SerializedFileReader};
    use std::collections::{BTreeMap, BTreeSet};
    use tempfile::tempdir;

    fn r(s: &str) -> SongReference {
        s.parse().unwrap()
    }

    fn catalog() -> Catalog {
        let h40 = CanonicalHymn {
            reference: r("h/40"),
            aliases: BTreeSet::from([r("h/40"), r("ch/40")]),
            languages: BTreeMap::from([("de".to_string(), BTreeSet::from([r("de/12")]))]),
            relevant: BTreeSet::new(),
            title: Some("What a miracle!".into()),
            verses: vec!["one".into(), "two".into()],
            metadata: Default::default(),
            sources: BTreeSet::from(["hymnal-net".into(), "h4a".into()]),
        };
        let de12 = CanonicalHymn {
            reference: r("de/12"),
            aliases: BTreeSet::from([r("de/12")]),
            languages: BTreeMap::new(),
            relevant: BTreeSet::from([r("h/40")]),
            title: None,
            verses: Vec::new(),
            metadata: Default::default(),
            sources: BTreeSet::from(["liederbuch".into()]),
        };
        Catalog::from(vec![h40, de12])
    }

    #[test]
    fn batches_have_one_row_per_item() {
        let catalog = catalog();
        assert_eq!(hymns_batch(&catalog).unwrap().num_rows(), 2);
        assert_eq!(links_batch(&catalog).unwrap().num_rows(), 2);
        let errors = vec![PipelineError::new(Stage::Merge, ErrorKind::DanglingReference, "gone")];
        assert_eq!(errors_batch(&errors).unwrap().num_rows(), 1);
        assert_eq!(errors_batch(&[]).unwrap().num_rows(), 0);
    }

    #[tokio::test]
    async fn manifest_hashes_match_written_files() {
        let dir = tempdir().unwrap();
        let errors = vec![PipelineError::new(Stage::Patch, ErrorKind::PatchTargetNotFound, "missing")
            .with_reference(r("h/999"))];
        let manifest_path = export_parquet(dir.path(), &catalog(), &errors).await.unwrap();

        let manifest: ParquetManifest =
            serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
        assert_eq!(manifest.files.len(), 3);
        for file in &manifest.files {
            let bytes = std::fs::read(dir.path().join(&file.path)).unwrap();
            assert_eq!(sha256_hex(&bytes), file.sha256);
            assert_eq!(bytes.len() as u64, file.bytes);
        }

        let hymns = std::fs::File::open(dir.path().join(PARQUET_DIR).join("hymns.parquet")).unwrap();
        let reader = SerializedFileReader::new(hymns).unwrap();
        assert_eq!(reader.metadata().file_metadata().num_rows(), 2);
    }
}

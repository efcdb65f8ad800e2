//! Snapshot discovery, run output directories and atomic file writes.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "hymnal-storage";

/// Timestamp layout shared by snapshot file names and run directories.
pub const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no snapshot for source {source_id} under {}", dir.display())]
    SnapshotNotFound { source_id: String, dir: PathBuf },
    #[error("output directory {} already exists", .0.display())]
    OutputExists(PathBuf),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> StorageError {
        let context = context.into();
        move |source| StorageError::Io { context, source }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn format_stamp(at: DateTime<Utc>) -> String {
    at.format(STAMP_FORMAT).to_string()
}

/// Raw snapshot text plus the file it came from.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub source_id: String,
    pub path: PathBuf,
    pub captured_at: DateTime<Utc>,
    pub text: String,
}

impl Snapshot {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Per-source snapshot directories: `<root>/<source_id>/<source_id>_<stamp>.<ext>`.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source_dir(&self, source_id: &str) -> PathBuf {
        self.root.join(source_id)
    }

    pub fn snapshot_file_name(source_id: &str, captured_at: DateTime<Utc>, extension: &str) -> String {
        format!(
            "{source_id}_{}.{}",
            format_stamp(captured_at),
            extension.trim_start_matches('.')
        )
    }

    /// Timestamp encoded in `file_name`, or `None` when it does not follow the pattern.
    pub fn parse_snapshot_stamp(source_id: &str, file_name: &str, extension: &str) -> Option<DateTime<Utc>> {
        let rest = file_name.strip_prefix(source_id)?.strip_prefix('_')?;
        let stamp = rest
            .strip_suffix(extension.trim_start_matches('.'))?
            .strip_suffix('.')?;
        NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }

    /// Most recently stamped snapshot path for `source_id`.
    pub async fn latest_snapshot_path(
        &self,
        source_id: &str,
        extension: &str,
    ) -> Result<(PathBuf, DateTime<Utc>), StorageError> {
        let dir = self.source_dir(source_id);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::SnapshotNotFound {
                    source_id: source_id.to_string(),
                    dir,
                })
            }
            Err(err) => return Err(StorageError::io(format!("reading {}", dir.display()))(err)),
        };

        let mut latest: Option<(PathBuf, DateTime<Utc>)> = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(StorageError::io(format!("listing {}", dir.display())))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(stamp) = Self::parse_snapshot_stamp(source_id, &name, extension) else {
                debug!(source_id, file = %name, "ignoring file outside snapshot pattern");
                continue;
            };
            if latest.as_ref().map_or(true, |(_, best)| stamp > *best) {
                latest = Some((entry.path(), stamp));
            }
        }

        latest.ok_or(StorageError::SnapshotNotFound {
            source_id: source_id.to_string(),
            dir,
        })
    }

    pub async fn load_latest(&self, source_id: &str, extension: &str) -> Result<Snapshot, StorageError> {
        let (path, captured_at) = self.latest_snapshot_path(source_id, extension).await?;
        let text = fs::read_to_string(&path)
            .await
            .map_err(StorageError::io(format!("reading snapshot {}", path.display())))?;
        debug!(source_id, path = %path.display(), bytes = text.len(), "loaded snapshot");
        Ok(Snapshot {
            source_id: source_id.to_string(),
            path,
            captured_at,
            text,
        })
    }
}

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub path: PathBuf,
    pub sha256: String,
    pub byte_size: usize,
}

const RUN_DIR_ATTEMPTS: u32 = 100;

/// Sort key of a run directory name: `<stamp>` or `<stamp>-<n>`.
fn run_dir_key(name: &str) -> Option<(NaiveDateTime, u32)> {
    let (stamp, suffix) = match name.split_once('-') {
        Some((stamp, suffix)) => (stamp, suffix.parse().ok()?),
        None => (name, 0),
    };
    let at = NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok()?;
    Some((at, suffix))
}

/// Run output root; every run gets a fresh `<root>/<stamp>/` directory.
#[derive(Debug, Clone)]
pub struct OutputStore {
    root: PathBuf,
}

impl OutputStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a fresh run directory named after `at`. Runs started within the
    /// same second get `-1`, `-2`, ... suffixes.
    pub async fn create_run_dir(&self, at: DateTime<Utc>) -> Result<PathBuf, StorageError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(StorageError::io(format!("creating {}", self.root.display())))?;
        let stamp = format_stamp(at);
        let mut dir = self.root.join(&stamp);
        for attempt in 0..RUN_DIR_ATTEMPTS {
            if attempt > 0 {
                dir = self.root.join(format!("{stamp}-{attempt}"));
            }
            match fs::create_dir(&dir).await {
                Ok(()) => return Ok(dir),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(StorageError::io(format!("creating {}", dir.display()))(err)),
            }
        }
        Err(StorageError::OutputExists(dir))
    }

    /// Write `bytes` to `dir/name` through a temp file and an atomic rename.
    pub async fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<StoredFile, StorageError> {
        let final_path = dir.join(name);
        let temp_path = dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(StorageError::io(format!("opening temp file {}", temp_path.display())))?;
        file.write_all(bytes)
            .await
            .map_err(StorageError::io(format!("writing temp file {}", temp_path.display())))?;
        file.flush()
            .await
            .map_err(StorageError::io(format!("flushing temp file {}", temp_path.display())))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &final_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::io(format!(
                "renaming {} -> {}",
                temp_path.display(),
                final_path.display()
            ))(err));
        }

        Ok(StoredFile {
            path: final_path,
            sha256: sha256_hex(bytes),
            byte_size: bytes.len(),
        })
    }

    /// Run directories, newest first.
    pub async fn recent_run_dirs(&self, limit: usize) -> Result<Vec<PathBuf>, StorageError> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(StorageError::io(format!("reading {}", self.root.display())))?;
        let mut dirs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(StorageError::io(format!("listing {}", self.root.display())))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = entry.file_type().await.map(|ft| ft.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            if let Some(key) = run_dir_key(&name) {
                dirs.push((key, entry.path()));
            }
        }
        dirs.sort_by(|a, b| b.0.cmp(&a.0));
        dirs.truncate(limit.max(1));
        Ok(dirs.into_iter().map(|(_, path)| path).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, 0, 0).single().unwrap()
    }

    #[test]
    fn sha256_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn snapshot_names_round_trip_their_stamp() {
        let name = SnapshotStore::snapshot_file_name("h4a", at(9), "txt");
        assert_eq!(name, "h4a_20260301_090000.txt");
        assert_eq!(SnapshotStore::parse_snapshot_stamp("h4a", &name, "txt"), Some(at(9)));
        assert_eq!(SnapshotStore::parse_snapshot_stamp("h4a", &name, "json"), None);
        assert_eq!(SnapshotStore::parse_snapshot_stamp("h4", &name, "txt"), None);
        assert_eq!(SnapshotStore::parse_snapshot_stamp("h4a", "h4a_latest.txt", "txt"), None);
    }

    #[tokio::test]
    async fn latest_snapshot_wins_by_stamp() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let source_dir = store.source_dir("russian");
        std::fs::create_dir_all(&source_dir).unwrap();
        for (hour, body) in [(8, "old"), (11, "new"), (10, "mid")] {
            let name = SnapshotStore::snapshot_file_name("russian", at(hour), "jsonl");
            std::fs::write(source_dir.join(name), body).unwrap();
        }
        std::fs::write(source_dir.join("notes.md"), "ignored").unwrap();

        let snapshot = store.load_latest("russian", "jsonl").await.unwrap();
        assert_eq!(snapshot.text, "new");
        assert_eq!(snapshot.captured_at, at(11));
        assert_eq!(snapshot.file_name(), "russian_20260301_110000.jsonl");
    }

    #[tokio::test]
    async fn missing_snapshot_is_reported() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let err = store.load_latest("h4a", "txt").await.unwrap_err();
        assert!(matches!(err, StorageError::SnapshotNotFound { .. }));

        std::fs::create_dir_all(store.source_dir("h4a")).unwrap();
        let err = store.load_latest("h4a", "txt").await.unwrap_err();
        assert!(matches!(err, StorageError::SnapshotNotFound { .. }));
    }

    #[tokio::test]
    async fn run_dirs_are_fresh_and_writes_are_atomic() {
        let dir = tempdir().unwrap();
        let outputs = OutputStore::new(dir.path().join("out"));
        let run_dir = outputs.create_run_dir(at(12)).await.unwrap();
        assert!(run_dir.ends_with("20260301_120000"));

        let stored = OutputStore::write_atomic(&run_dir, "catalog.json", b"[]").await.unwrap();
        assert_eq!(std::fs::read(&stored.path).unwrap(), b"[]");
        assert_eq!(stored.byte_size, 2);
        let leftovers = std::fs::read_dir(&run_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);

        outputs.create_run_dir(at(13)).await.unwrap();
        let recent = outputs.recent_run_dirs(1).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert!(recent[0].ends_with("20260301_130000"));
    }

    #[tokio::test]
    async fn runs_in_the_same_second_get_numbered_dirs() {
        let dir = tempdir().unwrap();
        let outputs = OutputStore::new(dir.path().join("out"));
        let mut created = Vec::new();
        for _ in 0..11 {
            created.push(outputs.create_run_dir(at(12)).await.unwrap());
        }
        assert!(created[0].ends_with("20260301_120000"));
        assert!(created[1].ends_with("20260301_120000-1"));
        assert!(created[10].ends_with("20260301_120000-10"));
        std::fs::create_dir_all(dir.path().join("out").join("notes-1")).unwrap();

        let recent = outputs.recent_run_dirs(3).await.unwrap();
        assert_eq!(recent, vec![created[10].clone(), created[9].clone(), created[8].clone()]);
        let all = outputs.recent_run_dirs(50).await.unwrap();
        assert_eq!(all.len(), 11);
        assert_eq!(all.last(), Some(&created[0]));
    }
}

//! File-backed history store.
//!
//! Layout under the history root:
//!
//! ```text
//! 2026-10-18/
//!   records.jsonl              one committed record per line
//!   artifacts/
//!     000001-tts-speech.wav
//!     .tmp-<uuid>              in-progress writes, never referenced
//! ```
//!
//! A record is committed by (1) writing its artifact to a temp file, syncing
//! and renaming it into place, then (2) appending one full line to the log
//! and syncing. If (2) fails the artifact is removed again. Opening the store
//! recovers every existing partition: a torn trailing line is truncated and
//! temp files and artifacts no committed record points at are deleted.

use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::record::{ArtifactRef, HistoryRecord, RecordDraft, StoredRef};
use crate::backend::{ArtifactData, BackendKind};
use crate::error::{Error, Result};

const RECORDS_FILE: &str = "records.jsonl";
const ARTIFACTS_DIR: &str = "artifacts";
const TMP_PREFIX: &str = ".tmp-";
const MAX_NAME_LEN: usize = 64;

pub struct HistoryStore {
    root: PathBuf,
    partitions: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Partition>>>>,
}

/// One date's log. Access is serialized through its mutex.
struct Partition {
    date: String,
    dir: PathBuf,
    next_seq: u64,
    recovered: bool,
}

impl HistoryStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            Error::PersistenceError(format!("Cannot create history dir {:?}: {}", root, e))
        })?;

        let mut partitions = HashMap::new();
        for entry in fs::read_dir(&root).map_err(|e| persistence("scan history", e))? {
            let entry = entry.map_err(|e| persistence("scan history", e))?;
            let date = entry.file_name().to_string_lossy().to_string();
            if validate_date(&date).is_err() || !entry.path().is_dir() {
                continue;
            }
            let mut partition = Partition::new(&root, &date);
            partition.recover()?;
            partitions.insert(date, Arc::new(tokio::sync::Mutex::new(partition)));
        }

        info!(
            "History store at {:?} ({} partitions)",
            root,
            partitions.len()
        );
        Ok(Self {
            root,
            partitions: Mutex::new(partitions),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Commit a record (and its artifact) to today's partition.
    pub async fn append(
        &self,
        draft: RecordDraft,
        artifact: Option<ArtifactData>,
    ) -> Result<StoredRef> {
        let partition = self.partition(&draft.date());
        let guard = partition.lock_owned().await;

        tokio::task::spawn_blocking(move || {
            let mut partition = guard;
            partition.recover()?;
            partition.commit(draft, artifact)
        })
        .await
        .map_err(|e| Error::PersistenceError(format!("history writer panicked: {}", e)))?
    }

    /// Committed records of one date, in log order.
    pub async fn read(&self, date: &str) -> Result<Vec<HistoryRecord>> {
        validate_date(date)?;
        let partition = self.partition(date);
        let guard = partition.lock_owned().await;

        tokio::task::spawn_blocking(move || {
            let path = guard.dir.join(RECORDS_FILE);
            if !path.is_file() {
                return Err(Error::NotFound(format!("No history for {}", guard.date)));
            }
            let bytes = fs::read(&path)?;
            Ok(parse_log(&bytes).records)
        })
        .await
        .map_err(|e| Error::PersistenceError(format!("history reader panicked: {}", e)))?
    }

    pub async fn list(&self, date: &str) -> Result<Vec<HistoryRecord>> {
        self.read(date).await
    }

    /// Dates that have a log, newest first.
    pub async fn dates(&self) -> Result<Vec<String>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let mut dates = Vec::new();
            for entry in fs::read_dir(&root)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if validate_date(&name).is_ok() && entry.path().join(RECORDS_FILE).is_file() {
                    dates.push(name);
                }
            }
            dates.sort_unstable_by(|a, b| b.cmp(a));
            Ok(dates)
        })
        .await
        .map_err(|e| Error::PersistenceError(format!("history reader panicked: {}", e)))?
    }

    /// Resolve a stored artifact for serving.
    pub fn artifact_path(&self, date: &str, name: &str) -> Result<PathBuf> {
        validate_date(date)?;
        if name.is_empty()
            || name.starts_with('.')
            || name.contains('/')
            || name.contains('\\')
            || name.contains("..")
        {
            return Err(Error::InvalidInput(format!("Invalid artifact name: {}", name)));
        }

        let path = self.root.join(date).join(ARTIFACTS_DIR).join(name);
        if !path.is_file() {
            return Err(Error::NotFound(format!("Artifact {}/{}", date, name)));
        }
        Ok(path)
    }

    fn partition(&self, date: &str) -> Arc<tokio::sync::Mutex<Partition>> {
        let mut partitions = self
            .partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        partitions
            .entry(date.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(Partition::new(&self.root, date))))
            .clone()
    }
}

impl Partition {
    fn new(root: &Path, date: &str) -> Self {
        Self {
            date: date.to_string(),
            dir: root.join(date),
            next_seq: 1,
            recovered: false,
        }
    }

    /// Bring the on-disk partition to a consistent state, once per process.
    fn recover(&mut self) -> Result<()> {
        if self.recovered {
            return Ok(());
        }

        let artifacts_dir = self.dir.join(ARTIFACTS_DIR);
        fs::create_dir_all(&artifacts_dir).map_err(|e| persistence("create partition", e))?;

        let log_path = self.dir.join(RECORDS_FILE);
        let mut referenced = HashSet::new();
        if log_path.is_file() {
            let bytes = fs::read(&log_path).map_err(|e| persistence("read log", e))?;
            let parsed = parse_log(&bytes);

            if parsed.valid_len < bytes.len() as u64 {
                warn!(
                    "Truncating torn tail of {:?} ({} bytes)",
                    log_path,
                    bytes.len() as u64 - parsed.valid_len
                );
                let file = OpenOptions::new()
                    .write(true)
                    .open(&log_path)
                    .map_err(|e| persistence("open log", e))?;
                file.set_len(parsed.valid_len)
                    .and_then(|_| file.sync_all())
                    .map_err(|e| persistence("truncate log", e))?;
            }

            for record in &parsed.records {
                if let Some(artifact) = &record.artifact {
                    referenced.insert(artifact.name.clone());
                }
            }
            self.next_seq = parsed.records.iter().map(|r| r.seq).max().unwrap_or(0) + 1;
        }

        for entry in fs::read_dir(&artifacts_dir).map_err(|e| persistence("scan artifacts", e))? {
            let entry = entry.map_err(|e| persistence("scan artifacts", e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(TMP_PREFIX) || !referenced.contains(&name) {
                warn!("Removing uncommitted artifact {}/{}", self.date, name);
                fs::remove_file(entry.path()).map_err(|e| persistence("remove orphan", e))?;
            }
        }

        debug!("Partition {} ready at seq {}", self.date, self.next_seq);
        self.recovered = true;
        Ok(())
    }

    fn commit(&mut self, draft: RecordDraft, artifact: Option<ArtifactData>) -> Result<StoredRef> {
        let seq = self.next_seq;
        let artifact = match artifact {
            Some(data) => Some(self.store_artifact(seq, draft.backend, &data)?),
            None => None,
        };

        let record = HistoryRecord {
            seq,
            date: self.date.clone(),
            backend: draft.backend,
            request_id: draft.request_id,
            timestamp: draft.timestamp,
            input_summary: draft.input_summary,
            output_summary: draft.output_summary,
            artifact,
            duration_ms: draft.duration_ms,
            outcome: draft.outcome,
            error: draft.error,
        };

        if let Err(err) = self.append_line(&record) {
            if let Some(artifact) = &record.artifact {
                let path = self.dir.join(ARTIFACTS_DIR).join(&artifact.name);
                if let Err(e) = fs::remove_file(&path) {
                    warn!("Could not remove uncommitted artifact {:?}: {}", path, e);
                }
            }
            return Err(err);
        }

        self.next_seq += 1;
        debug!("Committed {} #{} ({})", self.date, seq, record.backend);
        Ok(StoredRef {
            date: self.date.clone(),
            seq,
            artifact: record.artifact.map(|a| a.path),
        })
    }

    fn store_artifact(
        &self,
        seq: u64,
        backend: BackendKind,
        data: &ArtifactData,
    ) -> Result<ArtifactRef> {
        let artifacts_dir = self.dir.join(ARTIFACTS_DIR);
        let name = format!(
            "{:06}-{}-{}",
            seq,
            backend,
            sanitize_name(&data.suggested_name)
        );
        let tmp_path = artifacts_dir.join(format!("{}{}", TMP_PREFIX, Uuid::new_v4()));
        let final_path = artifacts_dir.join(&name);

        let written = File::create(&tmp_path)
            .and_then(|mut file| {
                file.write_all(&data.bytes)?;
                file.sync_all()
            })
            .and_then(|_| fs::rename(&tmp_path, &final_path));
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(persistence("write artifact", e));
        }
        // Make the rename itself durable.
        if let Ok(dir) = File::open(&artifacts_dir) {
            let _ = dir.sync_all();
        }

        Ok(ArtifactRef {
            path: format!("{}/{}/{}", self.date, ARTIFACTS_DIR, name),
            name,
            sha256: format!("{:x}", Sha256::digest(&data.bytes)),
            size_bytes: data.bytes.len() as u64,
        })
    }

    fn append_line(&self, record: &HistoryRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)
            .map_err(|e| Error::PersistenceError(format!("encode record: {}", e)))?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(RECORDS_FILE))
            .map_err(|e| persistence("open log", e))?;
        let len_before = file.metadata().map_err(|e| persistence("stat log", e))?.len();

        if let Err(e) = file.write_all(&line).and_then(|_| file.sync_data()) {
            // Never leave half a line behind.
            let _ = file.set_len(len_before);
            return Err(persistence("append record", e));
        }
        Ok(())
    }
}

struct ParsedLog {
    records: Vec<HistoryRecord>,
    /// Length of the prefix made of complete, valid lines.
    valid_len: u64,
}

/// Parse a log, stopping at the first line that is incomplete or unreadable
/// at the tail. Unreadable lines in the middle are skipped.
fn parse_log(bytes: &[u8]) -> ParsedLog {
    let mut records = Vec::new();
    let mut valid_len = 0u64;
    let mut offset = 0usize;

    while offset < bytes.len() {
        let Some(newline) = bytes[offset..].iter().position(|b| *b == b'\n') else {
            break;
        };
        let end = offset + newline + 1;
        let line = &bytes[offset..end - 1];
        let is_last = end == bytes.len();

        if line.iter().all(u8::is_ascii_whitespace) {
            valid_len = end as u64;
            offset = end;
            continue;
        }

        match serde_json::from_slice::<HistoryRecord>(line) {
            Ok(record) => {
                records.push(record);
                valid_len = end as u64;
            }
            Err(e) if is_last => {
                warn!("Ignoring unreadable final history line: {}", e);
            }
            Err(e) => {
                warn!("Skipping unreadable history line: {}", e);
                valid_len = end as u64;
            }
        }
        offset = end;
    }

    ParsedLog { records, valid_len }
}

fn validate_date(date: &str) -> Result<()> {
    chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .ok()
        .filter(|parsed| parsed.format("%Y-%m-%d").to_string() == date)
        .map(|_| ())
        .ok_or_else(|| Error::InvalidInput(format!("Invalid date: {}", date)))
}

fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    // Keep the tail so the extension survives.
    let skip = cleaned.chars().count().saturating_sub(MAX_NAME_LEN);
    let cleaned: String = cleaned.chars().skip(skip).collect();
    if cleaned.is_empty() {
        "artifact".to_string()
    } else {
        cleaned
    }
}

fn persistence(action: &str, e: std::io::Error) -> Error {
    Error::PersistenceError(format!("{}: {}", action, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::history::Outcome;
    use bytes::Bytes;
    use chrono::{Local, TimeZone};
    use tempfile::tempdir;

    fn draft(backend: BackendKind, text: &str) -> RecordDraft {
        RecordDraft::completed(backend, Uuid::new_v4(), text.into(), text.to_uppercase(), 12.5)
    }

    fn audio(name: &str) -> ArtifactData {
        ArtifactData {
            bytes: Bytes::from_static(b"OggS fake audio"),
            suggested_name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_append_and_read_in_order() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::open(dir.path()).unwrap();

        let first = store.append(draft(BackendKind::Asr, "one"), None).await.unwrap();
        let second = store
            .append(draft(BackendKind::Tts, "two"), Some(audio("speech.wav")))
            .await
            .unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);

        let artifact = second.artifact.unwrap();
        assert!(artifact.ends_with("artifacts/000002-tts-speech.wav"));
        assert!(dir.path().join(&artifact).is_file());

        let records = store.read(&first.date).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].input_summary, "one");
        assert_eq!(records[1].output_summary.as_deref(), Some("TWO"));
        let stored = records[1].artifact.as_ref().unwrap();
        assert_eq!(stored.size_bytes, 15);
        assert_eq!(stored.sha256.len(), 64);

        // Re-reading is stable.
        assert_eq!(store.list(&first.date).await.unwrap(), records);
        assert_eq!(store.dates().await.unwrap(), vec![first.date.clone()]);
    }

    #[tokio::test]
    async fn test_failures_are_recorded() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::open(dir.path()).unwrap();
        let err = Error::Timeout {
            backend: BackendKind::Asr,
            elapsed_ms: 30,
        };
        let stored = store
            .append(
                RecordDraft::failed(BackendKind::Asr, Uuid::new_v4(), "x".into(), 30.0, &err),
                None,
            )
            .await
            .unwrap();

        let records = store.read(&stored.date).await.unwrap();
        assert_eq!(records[0].outcome, Outcome::Failed);
        assert_eq!(records[0].error.as_ref().unwrap().kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_recovery_truncates_torn_tail_and_sweeps_orphans() {
        let dir = tempdir().unwrap();
        let date = {
            let store = HistoryStore::open(dir.path()).unwrap();
            let stored = store
                .append(draft(BackendKind::Tts, "kept"), Some(audio("a.wav")))
                .await
                .unwrap();
            stored.date
        };

        // Simulate a crash: artifact renamed into place but its line never
        // made it, a stray temp file, and a half-written line.
        let partition = dir.path().join(&date);
        fs::write(partition.join("artifacts/000002-tts-b.wav"), b"orphan").unwrap();
        fs::write(partition.join("artifacts/.tmp-deadbeef"), b"partial").unwrap();
        let mut log = OpenOptions::new()
            .append(true)
            .open(partition.join(RECORDS_FILE))
            .unwrap();
        log.write_all(br#"{"seq":2,"date":"#).unwrap();
        drop(log);

        let store = HistoryStore::open(dir.path()).unwrap();
        assert_eq!(store.read(&date).await.unwrap().len(), 1);

        let next = store.append(draft(BackendKind::Asr, "after"), None).await.unwrap();
        assert_eq!(next.seq, 2);

        let records = store.read(&date).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].input_summary, "after");
        assert!(!partition.join("artifacts/000002-tts-b.wav").exists());
        assert!(!partition.join("artifacts/.tmp-deadbeef").exists());
        assert!(partition.join("artifacts/000001-tts-a.wav").is_file());
    }

    #[tokio::test]
    async fn test_open_recovers_past_partitions() {
        let dir = tempdir().unwrap();
        let partition = dir.path().join("2020-01-01");
        fs::create_dir_all(partition.join(ARTIFACTS_DIR)).unwrap();
        fs::write(partition.join("artifacts/000001-tts-crash.wav"), b"orphan").unwrap();
        let torn = br#"{"seq":1,"date":"#;
        fs::write(partition.join(RECORDS_FILE), torn).unwrap();

        let store = HistoryStore::open(dir.path()).unwrap();
        // Writing today must not be what cleans up an older date.
        assert!(matches!(
            store.artifact_path("2020-01-01", "000001-tts-crash.wav"),
            Err(Error::NotFound(_))
        ));
        assert!(!partition.join("artifacts/000001-tts-crash.wav").exists());
        assert_eq!(fs::metadata(partition.join(RECORDS_FILE)).unwrap().len(), 0);
        assert!(store.read("2020-01-01").await.unwrap().is_empty());

        // The recovered partition picks up numbering from scratch.
        let mut late = draft(BackendKind::Tts, "late");
        late.timestamp = Local.with_ymd_and_hms(2020, 1, 1, 12, 0, 0).unwrap();
        let stored = store.append(late, None).await.unwrap();
        assert_eq!((stored.date.as_str(), stored.seq), ("2020-01-01", 1));
    }

    #[tokio::test]
    async fn test_failed_log_write_leaves_no_artifact() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::open(dir.path()).unwrap();
        let record = draft(BackendKind::Image, "cat");
        let date = record.date();

        // A directory where the log should be makes the append fail.
        fs::create_dir_all(dir.path().join(&date).join(RECORDS_FILE)).unwrap();

        let err = store.append(record, Some(audio("cat.png"))).await.unwrap_err();
        assert!(matches!(err, Error::PersistenceError(_)));

        let artifacts: Vec<_> = fs::read_dir(dir.path().join(&date).join(ARTIFACTS_DIR))
            .unwrap()
            .collect();
        assert!(artifacts.is_empty());
        assert!(store.dates().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_bad_dates_and_names() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::open(dir.path()).unwrap();

        assert!(matches!(
            store.read("../etc").await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            store.read("2026-1-5").await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            store.read("2026-01-05").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            store.artifact_path("2026-01-05", "../records.jsonl"),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            store.artifact_path("2026-01-05", "000001-asr-a.ogg"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("speech.wav"), "speech.wav");
        assert_eq!(sanitize_name("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_name("..."), "artifact");
        assert_eq!(sanitize_name("voice memo 1.ogg"), "voice_memo_1.ogg");
    }
}

//! Persisted Record Store
//!
//! One pretty-printed JSON array per bucket at
//! `<output_dir>/<domain>/<type>/<n>_round.json`. Appends read the whole
//! file, concatenate, and rewrite it. A missing or corrupt file reads as
//! empty.
//!
//! Also home to the two append-only text sinks that sit next to the stores:
//! the incomplete-bucket log and the raw-response debug dump.

use crate::extract::Record;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Incomplete-bucket log file name, relative to the output directory
pub const INCOMPLETE_LOG_NAME: &str = "incomplete_tasks.txt";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize records for {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn timestamp() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// File name of a bucket's store for a round count
pub fn round_file_name(round_count: u32) -> String {
    format!("{}_round.json", round_count)
}

/// Round count encoded in a store file name (`3_round.json` -> 3)
pub fn round_from_file_name(name: &str) -> Option<u32> {
    let (digits, rest) = name.split_once('_')?;
    if !rest.starts_with("round") {
        return None;
    }
    digits.parse().ok().filter(|n| *n > 0)
}

/// Append-only record file for one bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordStore {
    path: PathBuf,
}

impl RecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store for (domain, type, round) under `output_dir`
    pub fn for_bucket(output_dir: &Path, domain: &str, ambiguity: &str, round_count: u32) -> Self {
        Self::new(
            output_dir
                .join(domain)
                .join(ambiguity)
                .join(round_file_name(round_count)),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling debug dump for this store (`<n>_round_debug.txt`)
    pub fn debug_path(&self) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.path.with_file_name(format!("{}_debug.txt", stem))
    }

    /// Every stored value. Missing, unreadable or corrupt files yield an
    /// empty list.
    pub fn load(&self) -> Vec<Value> {
        let Ok(text) = fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Array(items)) => items,
            Ok(_) => {
                tracing::warn!(path = %self.path.display(), "store is not a JSON array, treating as empty");
                Vec::new()
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "corrupt store, treating as empty");
                Vec::new()
            }
        }
    }

    /// Number of stored records
    pub fn count(&self) -> usize {
        self.load().len()
    }

    /// Append `records` and return the new total. An empty batch leaves the
    /// file untouched.
    pub fn append(&self, records: &[Record]) -> StoreResult<usize> {
        let mut all = self.load();
        if records.is_empty() {
            return Ok(all.len());
        }
        all.extend(records.iter().cloned().map(Value::Object));
        self.write_all(&all)?;
        Ok(all.len())
    }

    /// Replace the file contents with `values`
    pub fn write_all(&self, values: &[Value]) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }

        let tmp = self.path.with_extension("json.tmp");
        let file = fs::File::create(&tmp).map_err(io_err(&tmp))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, values).map_err(|source| {
            StoreError::Serialize {
                path: self.path.clone(),
                source,
            }
        })?;
        writer.flush().map_err(io_err(&tmp))?;
        drop(writer);

        fs::rename(&tmp, &self.path).map_err(io_err(&self.path))
    }

    /// Append a raw response that yielded no records to the debug dump
    pub fn dump_raw(&self, raw: &str) -> StoreResult<PathBuf> {
        let path = self.debug_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let rule = "=".repeat(80);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err(&path))?;
        write!(
            file,
            "\n{rule}\ntimestamp: {}\n{rule}\n{}\n{rule}\n\n",
            timestamp(),
            raw
        )
        .map_err(io_err(&path))?;
        Ok(path)
    }
}

/// Append-only log of buckets that ended below target
#[derive(Debug, Clone)]
pub struct IncompleteLog {
    path: PathBuf,
}

impl IncompleteLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Log at `<output_dir>/incomplete_tasks.txt`
    pub fn in_dir(output_dir: &Path) -> Self {
        Self::new(output_dir.join(INCOMPLETE_LOG_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `[timestamp] domain | type | N_round | count/target`
    pub fn record(
        &self,
        domain: &str,
        ambiguity: &str,
        round_count: u32,
        count: usize,
        target: usize,
    ) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err(&self.path))?;
        // one write per line so concurrent appenders never interleave
        let line = format!(
            "[{}] {} | {} | {}_round | {}/{}\n",
            timestamp(),
            domain,
            ambiguity,
            round_count,
            count,
            target
        );
        file.write_all(line.as_bytes())
            .map_err(io_err(&self.path))
    }

    /// Lines written so far; empty when the log does not exist
    pub fn entries(&self) -> Vec<String> {
        fs::read_to_string(&self.path)
            .map(|text| text.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn rec(system: &str) -> Record {
        match json!({"system": system, "conversations": []}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_bucket_layout() {
        let store = RecordStore::for_bucket(Path::new("out"), "CS", "T1", 3);
        assert_eq!(store.path(), Path::new("out/CS/T1/3_round.json"));
        assert_eq!(store.debug_path(), PathBuf::from("out/CS/T1/3_round_debug.txt"));
    }

    #[test]
    fn test_round_from_file_name() {
        assert_eq!(round_from_file_name("3_round.json"), Some(3));
        assert_eq!(round_from_file_name("12_round.json"), Some(12));
        assert_eq!(round_from_file_name("x_round.json"), None);
        assert_eq!(round_from_file_name("0_round.json"), None);
        assert_eq!(round_from_file_name("notes.json"), None);
    }

    #[test]
    fn test_missing_and_corrupt_read_as_empty() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::new(dir.path().join("1_round.json"));
        assert_eq!(store.count(), 0);

        fs::write(store.path(), "[{\"system\": ").unwrap();
        assert_eq!(store.count(), 0);

        fs::write(store.path(), "{\"system\": \"x\"}").unwrap();
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn test_append_concatenates() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::for_bucket(dir.path(), "D", "T", 2);
        assert_eq!(store.append(&[rec("a"), rec("b")]).unwrap(), 2);
        assert_eq!(store.append(&[rec("c")]).unwrap(), 3);

        let loaded = store.load();
        let systems: Vec<&str> = loaded.iter().filter_map(|v| v["system"].as_str()).collect();
        assert_eq!(systems, vec!["a", "b", "c"]);
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_append_empty_batch_is_noop() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::new(dir.path().join("1_round.json"));
        store.append(&[rec("a")]).unwrap();
        let before = fs::read_to_string(store.path()).unwrap();

        assert_eq!(store.append(&[]).unwrap(), 1);
        assert_eq!(fs::read_to_string(store.path()).unwrap(), before);

        let fresh = RecordStore::new(dir.path().join("2_round.json"));
        assert_eq!(fresh.append(&[]).unwrap(), 0);
        assert!(!fresh.path().exists());
    }

    #[test]
    fn test_dump_raw_appends() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::for_bucket(dir.path(), "D", "T", 1);
        let path = store.dump_raw("first").unwrap();
        store.dump_raw("second").unwrap();
        let text = fs::read_to_string(path).unwrap();
        assert!(text.contains("first"));
        assert!(text.contains("second"));
        assert_eq!(text.matches("timestamp: ").count(), 2);
    }

    #[test]
    fn test_incomplete_log_format() {
        let dir = TempDir::new().unwrap();
        let log = IncompleteLog::in_dir(dir.path());
        assert!(log.entries().is_empty());
        log.record("CS", "T1", 3, 12, 50).unwrap();

        let entries = log.entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].starts_with('['));
        assert!(entries[0].ends_with("] CS | T1 | 3_round | 12/50"));
    }

    #[test]
    fn test_incomplete_log_concurrent_writers() {
        let dir = TempDir::new().unwrap();
        let log = IncompleteLog::in_dir(dir.path());

        std::thread::scope(|s| {
            for worker in 0..16 {
                let log = &log;
                s.spawn(move || {
                    for i in 0..300 {
                        log.record(&format!("domain{}", worker), "amb", 3, i, 50)
                            .unwrap();
                    }
                });
            }
        });

        let entries = log.entries();
        assert_eq!(entries.len(), 16 * 300);
        for entry in &entries {
            assert!(entry.starts_with('['), "{}", entry);
            assert_eq!(entry.matches('[').count(), 1, "{}", entry);
            assert!(entry.ends_with("/50"), "{}", entry);
        }
    }
}

//! Log and snapshot sinks keyed by simulation id.

use crate::journal::LogRecord;
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} line {line}: {source}")]
    Json {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("could not encode log record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Append-only lifecycle log plus latest-snapshot storage.
pub trait SimStore: std::fmt::Debug {
    fn append_log(&mut self, sim_id: &str, records: &[LogRecord]) -> Result<(), StoreError>;
    fn read_log(&self, sim_id: &str) -> Result<Vec<LogRecord>, StoreError>;
    /// Replace the stored snapshot for `sim_id`.
    fn write_snapshot(&mut self, sim_id: &str, bytes: &[u8]) -> Result<(), StoreError>;
    fn read_snapshot(&self, sim_id: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    logs: BTreeMap<String, Vec<LogRecord>>,
    snapshots: BTreeMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the snapshot for `sim_id`, forcing the next load to replay.
    pub fn forget_snapshot(&mut self, sim_id: &str) {
        self.snapshots.remove(sim_id);
    }
}

impl SimStore for MemoryStore {
    fn append_log(&mut self, sim_id: &str, records: &[LogRecord]) -> Result<(), StoreError> {
        self.logs
            .entry(sim_id.to_string())
            .or_default()
            .extend_from_slice(records);
        Ok(())
    }

    fn read_log(&self, sim_id: &str) -> Result<Vec<LogRecord>, StoreError> {
        Ok(self.logs.get(sim_id).cloned().unwrap_or_default())
    }

    fn write_snapshot(&mut self, sim_id: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.snapshots.insert(sim_id.to_string(), bytes.to_vec());
        Ok(())
    }

    fn read_snapshot(&self, sim_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.snapshots.get(sim_id).cloned())
    }
}

// ---------------------------------------------------------------------------
// Directory store
// ---------------------------------------------------------------------------

/// Stores `<sim_id>.log.jsonl` (one JSON record per line) and
/// `<sim_id>.snapshot` (bitcode bytes) under a root directory.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StoreError::Io { path: root.clone(), source })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn log_path(&self, sim_id: &str) -> PathBuf {
        self.root.join(format!("{sim_id}.log.jsonl"))
    }

    fn snapshot_path(&self, sim_id: &str) -> PathBuf {
        self.root.join(format!("{sim_id}.snapshot"))
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io { path: path.to_path_buf(), source }
}

impl SimStore for DirStore {
    fn append_log(&mut self, sim_id: &str, records: &[LogRecord]) -> Result<(), StoreError> {
        let path = self.log_path(sim_id);
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err(&path))?;
        file.write_all(&buf).map_err(io_err(&path))?;
        file.sync_data().map_err(io_err(&path))
    }

    fn read_log(&self, sim_id: &str) -> Result<Vec<LogRecord>, StoreError> {
        let path = self.log_path(sim_id);
        let file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Io { path, source: e }),
        };
        let mut records = Vec::new();
        for (i, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(io_err(&path))?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|source| StoreError::Json {
                path: path.clone(),
                line: i + 1,
                source,
            })?;
            records.push(record);
        }
        Ok(records)
    }

    fn write_snapshot(&mut self, sim_id: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.snapshot_path(sim_id);
        let tmp = path.with_extension("snapshot.tmp");
        fs::write(&tmp, bytes).map_err(io_err(&tmp))?;
        fs::rename(&tmp, &path).map_err(io_err(&path))
    }

    fn read_snapshot(&self, sim_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.snapshot_path(sim_id);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io { path, source: e }),
        }
    }
}

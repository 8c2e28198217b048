//! Quarantine Store
//!
//! Holding area for rejected skills pending manual review. An explicit
//! store object over a [`QuarantineBackend`]; entries are immutable until
//! released, and the list is capped with the oldest entries evicted.

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Maximum retained entries
pub const DEFAULT_CAPACITY: usize = 100;

/// Trust granted on release, independent of the original score
pub const RELEASE_TRUST: f64 = 0.7;

/// Source label passed to admission on release
pub const RELEASE_SOURCE: &str = "quarantine_released";

/// Quarantine errors
#[derive(Debug, thiserror::Error)]
pub enum QuarantineError {
    #[error("Quarantine entry not found: {0}")]
    NotFound(String),
    #[error("Admission refused: {0}")]
    Admission(String),
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuarantineStatus {
    Quarantined,
    Released,
}

impl QuarantineStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Quarantined => "quarantined",
            Self::Released => "released",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "released" => Self::Released,
            _ => Self::Quarantined,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuarantineEntry {
    pub id: String,
    pub content: String,
    /// Reason code, e.g. `security_violation`
    pub reason: String,
    pub trust_score: f64,
    /// RFC 3339
    pub timestamp: String,
    pub status: QuarantineStatus,
}

/// Persistence for quarantine entries
pub trait QuarantineBackend: Send + Sync {
    fn insert(&self, entry: &QuarantineEntry) -> Result<(), QuarantineError>;
    /// All entries, oldest first
    fn list(&self) -> Result<Vec<QuarantineEntry>, QuarantineError>;
    fn get(&self, id: &str) -> Result<Option<QuarantineEntry>, QuarantineError>;
    /// Returns whether an entry was removed
    fn remove(&self, id: &str) -> Result<bool, QuarantineError>;
    /// Drop the oldest entries beyond `capacity`, returning how many went
    fn evict_beyond(&self, capacity: usize) -> Result<usize, QuarantineError>;
}

/// Receives released content for re-admission
pub trait Admission: Send + Sync {
    /// Admit content at `trust_score`, returning the admitted id
    fn admit(&self, content: &str, trust_score: f64, source: &str) -> anyhow::Result<String>;
}

/// SQLite-backed quarantine
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open or create the quarantine database
    pub fn open(path: &Path) -> Result<Self, QuarantineError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let backend = Self {
            conn: Mutex::new(conn),
        };
        backend.init_schema()?;
        info!("Quarantine store opened: {}", path.display());
        Ok(backend)
    }

    pub fn open_in_memory() -> Result<Self, QuarantineError> {
        let backend = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        backend.init_schema()?;
        Ok(backend)
    }

    fn init_schema(&self) -> Result<(), QuarantineError> {
        self.conn.lock().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS quarantine (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                content TEXT NOT NULL,
                reason TEXT NOT NULL,
                trust_score REAL NOT NULL,
                timestamp TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'quarantined'
            );
            "#,
        )?;
        Ok(())
    }

    fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<QuarantineEntry> {
        let status: String = row.get(5)?;
        Ok(QuarantineEntry {
            id: row.get(0)?,
            content: row.get(1)?,
            reason: row.get(2)?,
            trust_score: row.get(3)?,
            timestamp: row.get(4)?,
            status: QuarantineStatus::parse(&status),
        })
    }
}

impl QuarantineBackend for SqliteBackend {
    fn insert(&self, entry: &QuarantineEntry) -> Result<(), QuarantineError> {
        self.conn.lock().execute(
            r#"
            INSERT OR IGNORE INTO quarantine (id, content, reason, trust_score, timestamp, status)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                entry.id,
                entry.content,
                entry.reason,
                entry.trust_score,
                entry.timestamp,
                entry.status.as_str()
            ],
        )?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<QuarantineEntry>, QuarantineError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, content, reason, trust_score, timestamp, status FROM quarantine ORDER BY seq ASC",
        )?;
        let entries = stmt
            .query_map([], Self::row_to_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn get(&self, id: &str) -> Result<Option<QuarantineEntry>, QuarantineError> {
        let conn = self.conn.lock();
        let entry = conn
            .query_row(
                "SELECT id, content, reason, trust_score, timestamp, status FROM quarantine WHERE id = ?1",
                params![id],
                Self::row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    fn remove(&self, id: &str) -> Result<bool, QuarantineError> {
        let rows = self
            .conn
            .lock()
            .execute("DELETE FROM quarantine WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    fn evict_beyond(&self, capacity: usize) -> Result<usize, QuarantineError> {
        let rows = self.conn.lock().execute(
            r#"
            DELETE FROM quarantine WHERE seq NOT IN (
                SELECT seq FROM quarantine ORDER BY seq DESC LIMIT ?1
            )
            "#,
            params![capacity as i64],
        )?;
        Ok(rows)
    }
}

/// Volatile quarantine, for tests and one-shot runs
#[derive(Default)]
pub struct InMemoryBackend {
    entries: Mutex<VecDeque<QuarantineEntry>>,
}

impl QuarantineBackend for InMemoryBackend {
    fn insert(&self, entry: &QuarantineEntry) -> Result<(), QuarantineError> {
        let mut entries = self.entries.lock();
        if !entries.iter().any(|e| e.id == entry.id) {
            entries.push_back(entry.clone());
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<QuarantineEntry>, QuarantineError> {
        Ok(self.entries.lock().iter().cloned().collect())
    }

    fn get(&self, id: &str) -> Result<Option<QuarantineEntry>, QuarantineError> {
        Ok(self.entries.lock().iter().find(|e| e.id == id).cloned())
    }

    fn remove(&self, id: &str) -> Result<bool, QuarantineError> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        Ok(entries.len() < before)
    }

    fn evict_beyond(&self, capacity: usize) -> Result<usize, QuarantineError> {
        let mut entries = self.entries.lock();
        let excess = entries.len().saturating_sub(capacity);
        entries.drain(..excess);
        Ok(excess)
    }
}

/// Content id: first 16 bytes of SHA-256 over content and timestamp
fn entry_id(content: &str, timestamp: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hasher.update(b":");
    hasher.update(timestamp.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// Bounded quarantine list
pub struct QuarantineStore {
    backend: Box<dyn QuarantineBackend>,
    capacity: usize,
}

impl QuarantineStore {
    pub fn new(backend: Box<dyn QuarantineBackend>) -> Self {
        Self {
            backend,
            capacity: DEFAULT_CAPACITY,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// SQLite store at `path`
    pub fn open(path: &Path) -> Result<Self, QuarantineError> {
        Ok(Self::new(Box::new(SqliteBackend::open(path)?)))
    }

    pub fn in_memory() -> Self {
        Self::new(Box::<InMemoryBackend>::default())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add an entry, evicting the oldest beyond capacity
    pub fn quarantine(
        &self,
        content: &str,
        reason: &str,
        trust_score: f64,
    ) -> Result<QuarantineEntry, QuarantineError> {
        let timestamp = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true);
        let entry = QuarantineEntry {
            id: entry_id(content, &timestamp),
            content: content.to_string(),
            reason: reason.to_string(),
            trust_score,
            timestamp,
            status: QuarantineStatus::Quarantined,
        };
        self.backend.insert(&entry)?;
        let evicted = self.backend.evict_beyond(self.capacity)?;
        if evicted > 0 {
            debug!("Evicted {} quarantine entries beyond capacity {}", evicted, self.capacity);
        }
        warn!("Quarantined {} ({}, trust {:.2})", entry.id, reason, trust_score);
        Ok(entry)
    }

    /// Entries, oldest first
    pub fn list(&self) -> Result<Vec<QuarantineEntry>, QuarantineError> {
        self.backend.list()
    }

    pub fn get(&self, id: &str) -> Result<Option<QuarantineEntry>, QuarantineError> {
        self.backend.get(id)
    }

    pub fn len(&self) -> Result<usize, QuarantineError> {
        Ok(self.backend.list()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, QuarantineError> {
        Ok(self.len()? == 0)
    }

    /// Re-admit an entry at [`RELEASE_TRUST`] and remove it.
    ///
    /// The entry stays quarantined if admission fails. A second release of
    /// the same id is `NotFound`.
    pub fn release(&self, id: &str, admission: &dyn Admission) -> Result<QuarantineEntry, QuarantineError> {
        let entry = self
            .backend
            .get(id)?
            .ok_or_else(|| QuarantineError::NotFound(id.to_string()))?;

        let admitted = admission
            .admit(&entry.content, RELEASE_TRUST, RELEASE_SOURCE)
            .map_err(|e| QuarantineError::Admission(format!("{:#}", e)))?;

        if !self.backend.remove(id)? {
            return Err(QuarantineError::NotFound(id.to_string()));
        }

        info!("Released quarantine entry {} as {} (trust {})", id, admitted, RELEASE_TRUST);
        Ok(QuarantineEntry {
            trust_score: RELEASE_TRUST,
            status: QuarantineStatus::Released,
            ..entry
        })
    }
}

/// Admission that appends released entries to a JSON-lines ledger for
/// manual follow-up
pub struct ReleaseLedger {
    path: PathBuf,
}

impl ReleaseLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Admission for ReleaseLedger {
    fn admit(&self, content: &str, trust_score: f64, source: &str) -> anyhow::Result<String> {
        use anyhow::Context;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let released_at = Utc::now().to_rfc3339();
        let id = entry_id(content, &released_at);
        let line = serde_json::json!({
            "id": id,
            "content": content,
            "trustScore": trust_score,
            "source": source,
            "releasedAt": released_at,
        });
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open ledger {}", self.path.display()))?;
        writeln!(file, "{}", line)?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder(Mutex<Vec<(String, f64, String)>>);

    impl Admission for Recorder {
        fn admit(&self, content: &str, trust_score: f64, source: &str) -> anyhow::Result<String> {
            self.0
                .lock()
                .push((content.to_string(), trust_score, source.to_string()));
            Ok("admitted".to_string())
        }
    }

    struct Refuse;

    impl Admission for Refuse {
        fn admit(&self, _: &str, _: f64, _: &str) -> anyhow::Result<String> {
            anyhow::bail!("store is read-only")
        }
    }

    fn stores() -> Vec<QuarantineStore> {
        vec![
            QuarantineStore::in_memory(),
            QuarantineStore::new(Box::new(SqliteBackend::open_in_memory().unwrap())),
        ]
    }

    #[test]
    fn test_quarantine_and_get() {
        for store in stores() {
            let entry = store.quarantine("payload", "security_violation", 0.1).unwrap();
            assert_eq!(entry.id.len(), 32);
            assert_eq!(entry.status, QuarantineStatus::Quarantined);
            assert_eq!(store.get(&entry.id).unwrap(), Some(entry.clone()));
            assert_eq!(store.list().unwrap(), vec![entry]);
        }
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        for store in stores() {
            let store = store.with_capacity(3);
            let ids: Vec<String> = (0..5)
                .map(|i| store.quarantine(&format!("c{}", i), "timeout", 0.0).unwrap().id)
                .collect();
            let kept: Vec<String> = store.list().unwrap().into_iter().map(|e| e.id).collect();
            assert_eq!(kept, ids[2..].to_vec());
        }
    }

    #[test]
    fn test_release_readmits_at_fixed_trust_once() {
        for store in stores() {
            let entry = store.quarantine("skill", "purity_violation", 0.2).unwrap();
            let recorder = Recorder(Mutex::new(Vec::new()));

            let released = store.release(&entry.id, &recorder).unwrap();
            assert_eq!(released.status, QuarantineStatus::Released);
            assert_eq!(released.trust_score, RELEASE_TRUST);
            assert_ne!(released.trust_score, entry.trust_score);
            assert!(store.is_empty().unwrap());

            let calls = recorder.0.lock().clone();
            assert_eq!(calls, vec![("skill".to_string(), RELEASE_TRUST, RELEASE_SOURCE.to_string())]);

            let again = store.release(&entry.id, &recorder);
            assert!(matches!(again, Err(QuarantineError::NotFound(_))));
            assert_eq!(recorder.0.lock().len(), 1);
        }
    }

    #[test]
    fn test_failed_admission_keeps_entry() {
        for store in stores() {
            let entry = store.quarantine("skill", "runtime_failure", 0.3).unwrap();
            let result = store.release(&entry.id, &Refuse);
            assert!(matches!(result, Err(QuarantineError::Admission(_))));
            assert_eq!(store.len().unwrap(), 1);
        }
    }

    #[test]
    fn test_sqlite_persists_across_reopen() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("q.db");
        let id = {
            let store = QuarantineStore::open(&path).unwrap();
            store.quarantine("persisted", "syntax_error", 0.0).unwrap().id
        };
        let store = QuarantineStore::open(&path).unwrap();
        assert_eq!(store.get(&id).unwrap().unwrap().content, "persisted");
    }

    #[test]
    fn test_release_ledger_appends() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ledger = ReleaseLedger::new(tmp.path().join("released.jsonl"));
        ledger.admit("a", RELEASE_TRUST, RELEASE_SOURCE).unwrap();
        ledger.admit("b", RELEASE_TRUST, RELEASE_SOURCE).unwrap();
        let text = std::fs::read_to_string(ledger.path()).unwrap();
        assert_eq!(text.lines().count(), 2);
        let first: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(first["source"], RELEASE_SOURCE);
    }
}

//! Append-and-scan storage for learned patterns.
//!
//! Two implementations: an in-memory store used when no workspace is
//! configured, and a SQLite store (`learned_patterns.db`) for persistent
//! workspaces.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection};

use crate::error::{PerceptionError, Result};
use crate::perception::semantic::CorpusEntry;

/// Default database file name inside the workspace directory.
pub const PATTERN_DB_FILE: &str = "learned_patterns.db";

/// A learned corpus entry with its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct LearnedPattern {
    pub entry: CorpusEntry,
    pub embedding: Vec<f32>,
}

/// Persistent backing for the learned corpus. Append-only.
#[async_trait]
pub trait PatternStore: Send + Sync {
    async fn append_pattern(&self, pattern: LearnedPattern) -> Result<()>;

    /// All patterns in insertion order.
    async fn scan_patterns(&self) -> Result<Vec<LearnedPattern>>;

    /// Record a raw learned fact. Duplicates are ignored.
    async fn append_fact(&self, fact: &str) -> Result<()>;

    async fn scan_facts(&self) -> Result<Vec<String>>;
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryPatternStore {
    patterns: Mutex<Vec<LearnedPattern>>,
    facts: Mutex<Vec<String>>,
}

impl MemoryPatternStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PatternStore for MemoryPatternStore {
    async fn append_pattern(&self, pattern: LearnedPattern) -> Result<()> {
        self.patterns.lock().push(pattern);
        Ok(())
    }

    async fn scan_patterns(&self) -> Result<Vec<LearnedPattern>> {
        Ok(self.patterns.lock().clone())
    }

    async fn append_fact(&self, fact: &str) -> Result<()> {
        let mut facts = self.facts.lock();
        if !facts.iter().any(|f| f == fact) {
            facts.push(fact.to_string());
        }
        Ok(())
    }

    async fn scan_facts(&self) -> Result<Vec<String>> {
        Ok(self.facts.lock().clone())
    }
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

/// SQLite-backed pattern store. Blocking database work runs on the
/// blocking thread pool.
#[derive(Debug, Clone)]
pub struct SqlitePatternStore {
    pub db_path: PathBuf,
}

pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn join_error(e: tokio::task::JoinError) -> PerceptionError {
    PerceptionError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}

impl SqlitePatternStore {
    /// Open (creating if needed) the database at `db_path`.
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let store = Self { db_path };
        store.initialize_db()?;
        Ok(store)
    }

    /// Open `learned_patterns.db` inside `dir`.
    pub fn in_dir(dir: &Path) -> Result<Self> {
        Self::open(dir.join(PATTERN_DB_FILE))
    }

    fn initialize_db(&self) -> Result<()> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS learned_patterns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                phrase TEXT NOT NULL,
                verb TEXT NOT NULL,
                target TEXT NOT NULL,
                constraint_text TEXT NOT NULL,
                confidence REAL NOT NULL,
                embedding BLOB NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS learned_facts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                fact TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }
}

#[async_trait]
impl PatternStore for SqlitePatternStore {
    async fn append_pattern(&self, pattern: LearnedPattern) -> Result<()> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = Connection::open(&db_path)?;
            let e = &pattern.entry;
            conn.execute(
                "INSERT INTO learned_patterns
                    (phrase, verb, target, constraint_text, confidence, embedding, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    e.text_content,
                    e.verb,
                    e.target,
                    e.constraint,
                    e.confidence,
                    encode_embedding(&pattern.embedding),
                    chrono::Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(join_error)?
    }

    async fn scan_patterns(&self) -> Result<Vec<LearnedPattern>> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<LearnedPattern>> {
            let conn = Connection::open(&db_path)?;
            let mut stmt = conn.prepare(
                "SELECT phrase, verb, target, constraint_text, confidence, embedding
                 FROM learned_patterns ORDER BY id ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                let blob: Vec<u8> = row.get(5)?;
                Ok(LearnedPattern {
                    entry: CorpusEntry {
                        text_content: row.get(0)?,
                        verb: row.get(1)?,
                        target: row.get(2)?,
                        constraint: row.get(3)?,
                        confidence: row.get(4)?,
                    },
                    embedding: decode_embedding(&blob),
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
        .map_err(join_error)?
    }

    async fn append_fact(&self, fact: &str) -> Result<()> {
        let db_path = self.db_path.clone();
        let fact = fact.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = Connection::open(&db_path)?;
            conn.execute(
                "INSERT OR IGNORE INTO learned_facts (fact, created_at) VALUES (?1, ?2)",
                params![fact, chrono::Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
        .map_err(join_error)?
    }

    async fn scan_facts(&self) -> Result<Vec<String>> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let conn = Connection::open(&db_path)?;
            let mut stmt = conn.prepare("SELECT fact FROM learned_facts ORDER BY id ASC")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
        .map_err(join_error)?
    }
}

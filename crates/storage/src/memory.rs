//! SQLite-backed memory bank.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::compact::{self, CharEstimate, Digest, ScoreWeights, TokenCounter};
use crate::{MemoryError, Result};

/// A unique identifier for a memory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemoryId(pub Uuid);

impl MemoryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MemoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MemoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One remembered fact. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: MemoryId,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: Value,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Record counts for one user.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemorySummary {
    pub total: usize,
    pub by_type: BTreeMap<String, usize>,
}

/// Durable, cross-session store of memory records.
pub struct MemoryBank {
    conn: Mutex<Connection>,
    counter: Box<dyn TokenCounter>,
    weights: ScoreWeights,
}

impl std::fmt::Debug for MemoryBank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBank")
            .field("weights", &self.weights)
            .finish_non_exhaustive()
    }
}

const COLUMNS: &str = "seq, id, user_id, kind, content, tags, created_at";

impl MemoryBank {
    /// Open or create a memory bank at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    /// Create an in-memory bank (useful for testing).
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS memories (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                tags TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_memories_user
                ON memories(user_id, seq);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            counter: Box::new(CharEstimate::default()),
            weights: ScoreWeights::default(),
        })
    }

    /// Replace the token estimate used by compaction.
    pub fn with_token_counter(mut self, counter: impl TokenCounter + 'static) -> Self {
        self.counter = Box::new(counter);
        self
    }

    pub fn with_weights(mut self, weights: ScoreWeights) -> Self {
        self.weights = weights;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a record. Durable once this returns.
    pub fn add(
        &self,
        user_id: &str,
        kind: &str,
        content: Value,
        tags: &[String],
    ) -> Result<MemoryId> {
        let mut unique: Vec<String> = Vec::with_capacity(tags.len());
        for tag in tags {
            if !unique.contains(tag) {
                unique.push(tag.clone());
            }
        }

        let id = MemoryId::new();
        let created_at = Utc::now();
        self.lock().execute(
            "INSERT INTO memories (id, user_id, kind, content, tags, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id.to_string(),
                user_id,
                kind,
                serde_json::to_string(&content)?,
                serde_json::to_string(&unique)?,
                created_at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            ],
        )?;
        tracing::info!(memory_id = %id, user = user_id, kind, "memory added");
        Ok(id)
    }

    /// Records for a user, newest first, optionally filtered by type and tag
    /// and capped at `limit`.
    pub fn query(
        &self,
        user_id: &str,
        kind: Option<&str>,
        tag: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<MemoryRecord>> {
        Ok(self
            .load_user(user_id)?
            .into_iter()
            .filter(|r| kind.is_none_or(|k| r.kind == k))
            .filter(|r| tag.is_none_or(|t| r.tags.iter().any(|rt| rt == t)))
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }

    /// Case-insensitive substring search over content and tags.
    ///
    /// Results are ranked by occurrences in content plus twice the
    /// occurrences in tags; equal scores keep newest first.
    pub fn search(
        &self,
        user_id: &str,
        term: &str,
        limit: Option<usize>,
    ) -> Result<Vec<MemoryRecord>> {
        let needle = term.to_lowercase();
        if needle.is_empty() {
            return self.query(user_id, None, None, limit);
        }

        let mut matches: Vec<(usize, MemoryRecord)> = self
            .load_user(user_id)?
            .into_iter()
            .filter_map(|record| {
                let content = record.content.to_string().to_lowercase();
                let tags = record.tags.join(" ").to_lowercase();
                let score = content.matches(&needle).count() + 2 * tags.matches(&needle).count();
                (score > 0).then_some((score, record))
            })
            .collect();
        // Stable sort keeps newest-first among equal scores.
        matches.sort_by(|(a, _), (b, _)| b.cmp(a));
        Ok(matches
            .into_iter()
            .map(|(_, record)| record)
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }

    pub fn summary(&self, user_id: &str) -> Result<MemorySummary> {
        let mut summary = MemorySummary::default();
        for record in self.load_user(user_id)? {
            summary.total += 1;
            *summary.by_type.entry(record.kind).or_default() += 1;
        }
        Ok(summary)
    }

    /// Every row that fails to decode, across all users.
    pub fn verify(&self) -> Result<Vec<MemoryError>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM memories ORDER BY seq"))?;
        let rows = stmt
            .query_map([], RawRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.into_iter().filter_map(|row| row.decode().err()).collect())
    }

    /// Digest of the user's memories that fits in `budget` tokens.
    pub fn compact(&self, user_id: &str, budget: usize) -> Result<Digest> {
        self.compact_for(user_id, budget, &[], &[])
    }

    /// Like [`compact`](Self::compact), scoring records higher for each tag in
    /// `focus_tags`. A non-empty `kinds` keeps only records of those types.
    pub fn compact_for(
        &self,
        user_id: &str,
        budget: usize,
        focus_tags: &[String],
        kinds: &[String],
    ) -> Result<Digest> {
        let mut records = self.load_user(user_id)?;
        if !kinds.is_empty() {
            records.retain(|r| kinds.contains(&r.kind));
        }
        Ok(compact::compact(
            &records,
            budget,
            focus_tags,
            self.weights,
            self.counter.as_ref(),
        ))
    }

    /// All decodable records for a user, newest first. Corrupt rows are logged and skipped.
    fn load_user(&self, user_id: &str) -> Result<Vec<MemoryRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM memories WHERE user_id = ?1 ORDER BY seq DESC"
        ))?;
        let rows = stmt
            .query_map([user_id], RawRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match row.decode() {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping corrupt memory record");
                    None
                }
            })
            .collect())
    }
}

/// A row as stored, before any column is trusted.
struct RawRow {
    seq: i64,
    id: SqlValue,
    user_id: SqlValue,
    kind: SqlValue,
    content: SqlValue,
    tags: SqlValue,
    created_at: SqlValue,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            id: row.get(1)?,
            user_id: row.get(2)?,
            kind: row.get(3)?,
            content: row.get(4)?,
            tags: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn decode(self) -> Result<MemoryRecord> {
        let seq = self.seq;
        let corrupt = |reason: String| MemoryError::Corrupted { seq, reason };
        let text = |column: &str, value: SqlValue| match value {
            SqlValue::Text(text) => Ok(text),
            other => Err(corrupt(format!(
                "{column}: expected text, found {}",
                other.data_type()
            ))),
        };

        let id = text("id", self.id)?;
        let user_id = text("user_id", self.user_id)?;
        let kind = text("kind", self.kind)?;
        let content = text("content", self.content)?;
        let tags = text("tags", self.tags)?;
        let created_at = text("created_at", self.created_at)?;

        let id = Uuid::parse_str(&id).map_err(|e| corrupt(format!("id: {e}")))?;
        let content =
            serde_json::from_str(&content).map_err(|e| corrupt(format!("content: {e}")))?;
        let tags = serde_json::from_str(&tags).map_err(|e| corrupt(format!("tags: {e}")))?;
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| corrupt(format!("created_at: {e}")))?
            .with_timezone(&Utc);

        Ok(MemoryRecord {
            id: MemoryId(id),
            user_id,
            kind,
            content,
            tags,
            created_at,
        })
    }
}

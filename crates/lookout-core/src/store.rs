//! SQLite-backed embedding store.
//!
//! One row per person; the embedding is a little-endian f32 blob and the
//! store's dimensionality is recorded once in `store_meta`. Mutations are
//! serialized through the connection mutex. Readers work from an immutable
//! snapshot that is swapped in only after a mutation has committed.

use crate::types::{Embedding, NewPerson, PersonMetadata, PersonRecord};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use thiserror::Error;

const META_DIMENSION: &str = "dimension";

const SELECT_COLUMNS: &str = "id, name, age, description, date_missing, contact, \
     photo_ref, embedding, model_version, created_at";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("person not found: {0}")]
    NotFound(i64),
    #[error("embedding dimension mismatch: store holds {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("corrupt row {id}: {reason}")]
    Corrupt { id: i64, reason: String },
    #[error("store lock poisoned")]
    LockPoisoned,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Durable keyed storage of [`PersonRecord`]s for a single embedding dimensionality.
pub struct EmbeddingStore {
    dimension: usize,
    conn: Mutex<Connection>,
    snapshot: RwLock<Arc<Vec<PersonRecord>>>,
}

impl EmbeddingStore {
    /// Open (or create) the store at `path` for embeddings of `dimension` values.
    ///
    /// Fails with `DimensionMismatch` if the file was created for a different
    /// dimensionality.
    pub fn open(path: impl AsRef<Path>, dimension: usize) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), dimension, "opening embedding store");
        Self::from_connection(conn, dimension)
    }

    /// Open a throwaway store that lives only as long as this value.
    pub fn open_in_memory(dimension: usize) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, dimension)
    }

    fn from_connection(conn: Connection, dimension: usize) -> Result<Self, StoreError> {
        if dimension == 0 {
            return Err(StoreError::InvalidInput(
                "store dimension must be at least 1".into(),
            ));
        }

        create_tables(&conn)?;
        check_dimension(&conn, dimension)?;
        let records = load_all(&conn)?;

        tracing::debug!(count = records.len(), "embedding store loaded");

        Ok(Self {
            dimension,
            conn: Mutex::new(conn),
            snapshot: RwLock::new(Arc::new(records)),
        })
    }

    /// Fixed embedding dimensionality of this store.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Insert a new person and return its assigned id.
    pub fn insert(&self, person: NewPerson) -> Result<i64, StoreError> {
        let name = person.name.trim().to_string();
        if name.is_empty() {
            return Err(StoreError::InvalidInput("name must not be empty".into()));
        }
        self.validate_embedding(&person.embedding)?;

        let metadata = person.metadata.normalized();
        let created_at = Utc::now();

        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO persons
             (name, age, description, date_missing, contact, photo_ref, embedding, model_version, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                name,
                metadata.age,
                metadata.description,
                metadata.date_missing,
                metadata.contact,
                person.photo_ref,
                person.embedding.to_le_bytes(),
                person.embedding.model_version,
                created_at.to_rfc3339(),
            ],
        )?;
        let id = conn.last_insert_rowid();

        let record = PersonRecord {
            id,
            name,
            metadata,
            embedding: person.embedding,
            photo_ref: person.photo_ref,
            created_at,
        };
        self.publish(|records| records.push(record))?;

        tracing::info!(id, "person inserted");
        Ok(id)
    }

    /// Fetch one person by id.
    pub fn get(&self, id: i64) -> Result<PersonRecord, StoreError> {
        self.all()?
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    /// Every stored person, in insertion order.
    ///
    /// The returned snapshot is immutable; later mutations do not affect it.
    pub fn all(&self) -> Result<Arc<Vec<PersonRecord>>, StoreError> {
        let guard = self.snapshot.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(Arc::clone(&guard))
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.all()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.all()?.is_empty())
    }

    /// Remove a person. Returns the removed record so callers can clean up
    /// the photo it referenced.
    pub fn delete(&self, id: i64) -> Result<PersonRecord, StoreError> {
        let conn = self.lock_conn()?;
        let removed = self.get(id)?;

        let changed = conn.execute("DELETE FROM persons WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        self.publish(|records| records.retain(|r| r.id != id))?;

        tracing::info!(id, "person deleted");
        Ok(removed)
    }

    /// Replace a person's metadata. The embedding is left untouched.
    pub fn update_metadata(&self, id: i64, metadata: PersonMetadata) -> Result<(), StoreError> {
        let metadata = metadata.normalized();

        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE persons SET age = ?2, description = ?3, date_missing = ?4, contact = ?5
             WHERE id = ?1",
            params![
                id,
                metadata.age,
                metadata.description,
                metadata.date_missing,
                metadata.contact,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        self.publish(|records| {
            if let Some(r) = records.iter_mut().find(|r| r.id == id) {
                r.metadata = metadata;
            }
        })?;

        tracing::info!(id, "person metadata updated");
        Ok(())
    }

    fn validate_embedding(&self, embedding: &Embedding) -> Result<(), StoreError> {
        embedding
            .validate()
            .map_err(|e| StoreError::InvalidInput(e.to_string()))?;
        if embedding.dimension() != self.dimension {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimension,
                actual: embedding.dimension(),
            });
        }
        Ok(())
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Build the next snapshot from the current one and swap it in.
    /// Must be called while holding the connection lock.
    fn publish(&self, apply: impl FnOnce(&mut Vec<PersonRecord>)) -> Result<(), StoreError> {
        let mut guard = self.snapshot.write().map_err(|_| StoreError::LockPoisoned)?;
        let mut next = Vec::clone(&guard);
        apply(&mut next);
        *guard = Arc::new(next);
        Ok(())
    }
}

fn create_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS store_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS persons (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            age TEXT,
            description TEXT,
            date_missing TEXT,
            contact TEXT,
            photo_ref TEXT,
            embedding BLOB NOT NULL,
            model_version TEXT,
            created_at TEXT NOT NULL
        );",
    )
}

/// Record the dimension on first open; refuse a different one afterwards.
fn check_dimension(conn: &Connection, dimension: usize) -> Result<(), StoreError> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT value FROM store_meta WHERE key = ?1",
            params![META_DIMENSION],
            |row| row.get(0),
        )
        .optional()?;

    match stored {
        None => {
            conn.execute(
                "INSERT INTO store_meta (key, value) VALUES (?1, ?2)",
                params![META_DIMENSION, dimension.to_string()],
            )?;
            Ok(())
        }
        Some(value) => {
            let expected: usize = value.parse().map_err(|_| StoreError::Corrupt {
                id: 0,
                reason: format!("bad stored dimension {value:?}"),
            })?;
            if expected != dimension {
                return Err(StoreError::DimensionMismatch {
                    expected,
                    actual: dimension,
                });
            }
            Ok(())
        }
    }
}

fn load_all(conn: &Connection) -> Result<Vec<PersonRecord>, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT {SELECT_COLUMNS} FROM persons ORDER BY id"))?;
    let rows = stmt.query_map([], read_row)?;

    let mut records = Vec::new();
    for row in rows {
        records.push(decode_row(row?)?);
    }
    Ok(records)
}

/// Raw column values, decoded outside the rusqlite callback so corruption
/// surfaces as `StoreError::Corrupt` instead of a generic SQL error.
struct RawRow {
    id: i64,
    name: String,
    metadata: PersonMetadata,
    photo_ref: Option<String>,
    embedding: Vec<u8>,
    model_version: Option<String>,
    created_at: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        name: row.get(1)?,
        metadata: PersonMetadata {
            age: row.get(2)?,
            description: row.get(3)?,
            date_missing: row.get(4)?,
            contact: row.get(5)?,
        },
        photo_ref: row.get(6)?,
        embedding: row.get(7)?,
        model_version: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn decode_row(raw: RawRow) -> Result<PersonRecord, StoreError> {
    let id = raw.id;
    let embedding =
        Embedding::from_le_bytes(&raw.embedding, raw.model_version).ok_or_else(|| {
            StoreError::Corrupt {
                id,
                reason: format!("embedding blob of {} bytes", raw.embedding.len()),
            }
        })?;
    let created_at = DateTime::parse_from_rfc3339(&raw.created_at)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            id,
            reason: format!("created_at: {e}"),
        })?;

    Ok(PersonRecord {
        id,
        name: raw.name,
        metadata: raw.metadata,
        embedding,
        photo_ref: raw.photo_ref,
        created_at,
    })
}

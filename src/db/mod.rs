//! SQLite backend using sqlite-vec for cosine distance and FTS5 for keywords.
use rusqlite::Connection;
use sqlite_vec::sqlite3_vec_init;
use std::path::PathBuf;
use std::sync::{Once, RwLock};
use std::time::Duration;
use tracing::info;

use crate::error::{RagError, Result};

pub mod documents;
pub mod models;
pub mod relations;
pub mod search;

/// Record columns in the order `documents::map_document` reads them.
pub(crate) const DOCUMENT_COLUMNS: &str =
    "id, content, metadata, content_tokens, embedding_status, chunk_length, revision, created_at";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

static INIT_VEC: Once = Once::new();

/// Initialize the sqlite-vec extension. Safe to call multiple times.
fn init_sqlite_vec() {
    INIT_VEC.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

enum Source {
    File(PathBuf),
    Memory,
}

/// r2d2 manager handing out configured rusqlite connections.
pub struct SqliteConnectionManager {
    source: Source,
}

impl r2d2::ManageConnection for SqliteConnectionManager {
    type Connection = Connection;
    type Error = rusqlite::Error;

    fn connect(&self) -> std::result::Result<Connection, rusqlite::Error> {
        let conn = match &self.source {
            Source::File(path) => Connection::open(path)?,
            Source::Memory => Connection::open_in_memory()?,
        };
        // Set before switching journal mode, which needs the write lock.
        conn.busy_timeout(BUSY_TIMEOUT)?;
        if matches!(self.source, Source::File(_)) {
            conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        }
        Ok(conn)
    }

    fn is_valid(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.execute_batch("")
    }

    fn has_broken(&self, _conn: &mut Connection) -> bool {
        false
    }
}

/// A pool of SQLite connections initialized with sqlite-vec.
///
/// Cheap to clone; every clone shares the pool.
#[derive(Clone)]
pub struct Db {
    pool: r2d2::Pool<SqliteConnectionManager>,
}

impl Db {
    /// Open (or create) a database file with up to `pool_size` connections.
    pub fn open(path: impl Into<PathBuf>, pool_size: u32) -> Result<Self> {
        let path = path.into();
        info!("Opening database: {}", path.display());
        Self::build(Source::File(path), pool_size.max(1))
    }

    /// Open an in-memory database. A single connection is shared so every
    /// caller sees the same data.
    pub fn open_in_memory() -> Result<Self> {
        Self::build(Source::Memory, 1)
    }

    /// `:memory:` selects the in-memory store, anything else is a file path.
    pub fn open_path(path: &str, pool_size: u32) -> Result<Self> {
        if path == ":memory:" {
            Self::open_in_memory()
        } else {
            Self::open(path, pool_size)
        }
    }

    fn build(source: Source, pool_size: u32) -> Result<Self> {
        // Register sqlite-vec extension globally
        init_sqlite_vec();

        // Recycling the only connection of an in-memory pool would drop the database.
        let pool = r2d2::Pool::builder()
            .max_size(pool_size)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(SqliteConnectionManager { source })?;

        // Verify sqlite-vec is loaded
        let conn = pool.get()?;
        let vec_version: String = conn.query_row("SELECT vec_version()", [], |row| row.get(0))?;
        info!("sqlite-vec version: {}", vec_version);

        Ok(Self { pool })
    }

    /// Run blocking SQLite work on the blocking thread pool.
    pub async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await?
    }
}

/// One collection inside a [`Db`]: a record table, its FTS5 shadow, and its
/// triple table. Implements every storage port.
pub struct SqliteStore {
    pub(crate) db: Db,
    pub(crate) collection: String,
    /// Vector column identifiers registered by `initialize`.
    pub(crate) vector_indexes: RwLock<Vec<String>>,
    /// Records at or below this many runes are stored as `completed`.
    pub(crate) min_embeddable_length: usize,
}

impl SqliteStore {
    pub fn new(db: Db, collection: &str) -> Result<Self> {
        validate_identifier(collection)?;
        Ok(Self {
            db,
            collection: collection.to_string(),
            vector_indexes: RwLock::new(Vec::new()),
            min_embeddable_length: documents::MIN_EMBEDDABLE_LENGTH,
        })
    }

    /// Override the rune count at or below which records skip embedding.
    #[must_use]
    pub fn with_min_embeddable_length(mut self, runes: usize) -> Self {
        self.min_embeddable_length = runes;
        self
    }

    pub(crate) fn fts_table(&self) -> String {
        format!("{}_fts", self.collection)
    }

    pub(crate) fn triples_table(&self) -> String {
        format!("{}_triples", self.collection)
    }

    pub(crate) fn registered_vector_columns(&self) -> Vec<String> {
        self.vector_indexes
            .read()
            .map(|ids| ids.iter().map(|id| vector_column(id)).collect())
            .unwrap_or_default()
    }
}

/// Column name backing vector index `identifier`.
pub fn vector_column(identifier: &str) -> String {
    format!("vector_{identifier}")
}

/// Table and column names are interpolated into SQL, so only plain
/// identifiers are accepted.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(RagError::Config(format!("invalid identifier: {name:?}")))
    }
}

/// Helper to serialize a float32 vector into little-endian bytes
pub fn serialize_vector(vec: &[f32]) -> Vec<u8> {
    if cfg!(target_endian = "little") {
        bytemuck::cast_slice(vec).to_vec()
    } else {
        vec.iter().flat_map(|v| v.to_le_bytes()).collect()
    }
}

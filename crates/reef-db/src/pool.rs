//! Pooled SQLite connections for the span store.

use std::path::{Path, PathBuf};

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OpenFlags;
use thiserror::Error;

/// Where the database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbLocation {
    /// A file, created along with its parent directories when missing.
    File(PathBuf),
    /// A private database that vanishes with the pool.
    Memory,
}

impl DbLocation {
    pub fn file(path: impl AsRef<Path>) -> Self {
        Self::File(path.as_ref().to_path_buf())
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::File(path) => Some(path),
            Self::Memory => None,
        }
    }
}

/// Connection tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// How long a writer waits on a locked database, in milliseconds.
    pub busy_timeout_ms: u64,

    /// Upper bound on pooled connections. In-memory pools always use one,
    /// since every SQLite connection to `:memory:` opens its own database.
    pub max_connections: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            max_connections: 4,
        }
    }
}

pub type DbPool = Pool<SqliteConnectionManager>;

/// Errors raised while opening a pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to create database directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to create database connection pool: {0}")]
    PoolInit(#[from] r2d2::Error),
}

/// Opens a pool on `location`. File databases run in WAL mode with
/// `synchronous = NORMAL`.
///
/// # Errors
///
/// `CreateDir` when the parent directory cannot be created, `PoolInit`
/// when the first connection fails.
pub fn open_pool(location: &DbLocation, settings: PoolSettings) -> Result<DbPool, PoolError> {
    let (manager, max_connections) = match location {
        DbLocation::File(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|source| PoolError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            (
                SqliteConnectionManager::file(path),
                settings.max_connections.max(1),
            )
        }
        DbLocation::Memory => (SqliteConnectionManager::memory(), 1),
    };

    let busy_timeout_ms = settings.busy_timeout_ms;
    let manager = manager
        .with_flags(
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .with_init(move |conn| {
            let journal_mode: String =
                conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
            tracing::trace!(journal_mode = %journal_mode, "sqlite connection opened");
            conn.execute_batch(&format!(
                "PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = {busy_timeout_ms};"
            ))
        });

    let pool = Pool::builder().max_size(max_connections).build(manager)?;
    tracing::debug!(location = ?location, max_connections, "sqlite pool ready");
    Ok(pool)
}

//! Database initialization and startup
//!
//! Opens the SQLite database and ensures all required tables exist.

use std::time::Duration;

use rusqlite::{Connection, OpenFlags};

use super::schema::create_all_tables;

/// How long a writer waits on a locked database before reporting an error
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type for database startup
#[derive(Debug)]
pub enum StartError {
    /// Empty database path
    EmptyPath,
    /// SQLite error
    Database(rusqlite::Error),
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartError::EmptyPath => write!(f, "database path cannot be empty"),
            StartError::Database(e) => write!(f, "database error: {}", e),
        }
    }
}

impl std::error::Error for StartError {}

impl From<rusqlite::Error> for StartError {
    fn from(e: rusqlite::Error) -> Self {
        StartError::Database(e)
    }
}

/// Opens the database and ensures all required tables exist
///
/// # Errors
/// - `StartError::EmptyPath` if `db_path` is empty
/// - `StartError::Database` for SQLite errors
pub fn start_db(db_path: &str) -> Result<Connection, StartError> {
    if db_path.trim().is_empty() {
        return Err(StartError::EmptyPath);
    }

    let conn = Connection::open(db_path)?;

    // Only takes effect on a fresh file; must precede table creation
    conn.execute_batch("PRAGMA auto_vacuum = INCREMENTAL;")?;

    // WAL lets the query path read while the ingest worker writes.
    // PRAGMA returns the new mode, so we use query_row instead of execute
    let _: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(BUSY_TIMEOUT)?;

    // Idempotent (`CREATE TABLE IF NOT EXISTS`)
    create_all_tables(&conn)?;

    Ok(conn)
}

/// Opens a second, read-only handle on an existing database file
pub fn open_reader(db_path: &str) -> Result<Connection, StartError> {
    if db_path.trim().is_empty() {
        return Err(StartError::EmptyPath);
    }
    let conn = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

/// Create an in-memory database for testing
pub fn start_memory_db() -> rusqlite::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    // Note: WAL mode doesn't work with in-memory databases, skip it
    create_all_tables(&conn)?;
    Ok(conn)
}

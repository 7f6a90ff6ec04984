//! Durable state store.
//!
//! A single embedded SQLite file holds the watched folders, every file the
//! scanner has seen, the transcribe/convert work queues, skip records, and
//! audio/transcript pairings. All mutations flow through the single-writer
//! worker in [`writer`]; readers open short-lived connections of their own.
//!
//! The default location is `~/.tircorder/state.db`.

pub mod migrations;
pub mod schema;
pub mod store;
pub mod writer;

use rusqlite::Connection;
use std::path::{Path, PathBuf};

use crate::database::migrations::run_migrations;

/// Database error types.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Failed to create database directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Returns the default path of the state database (`~/.tircorder/state.db`).
pub fn default_database_path() -> Result<PathBuf, DatabaseError> {
    let home = dirs::home_dir().ok_or_else(|| {
        DatabaseError::DirectoryCreation(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Could not find home directory",
        ))
    })?;

    Ok(home.join(".tircorder").join("state.db"))
}

/// Opens a connection to the database at `db_path` with foreign keys on.
///
/// Each call creates a new connection; readers should keep theirs
/// short-lived.
pub fn open_connection(db_path: &Path) -> Result<Connection, DatabaseError> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(conn)
}

/// Initialises the database: creates the parent directory, opens the file,
/// and runs any pending migrations. Called once on startup, before the
/// writer worker takes over the connection.
pub fn initialise_database(db_path: &Path) -> Result<Connection, DatabaseError> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            tracing::info!("Created state directory at {:?}", parent);
        }
    }

    tracing::info!("State database: {:?}", db_path);

    let mut conn = open_connection(db_path)?;
    run_migrations(&mut conn)?;

    Ok(conn)
}

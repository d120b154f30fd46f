pub mod schema;

use rusqlite::Connection;
use std::path::{Path, PathBuf};

use crate::error::StorageError;

/// Database connection wrapper shared by the local store and the gateway cache
pub struct Database {
  conn: Connection,
}

impl Database {
  /// Open or create the database at `path` and apply `schema`
  pub fn open(path: &Path, schema: &str) -> Result<Self, StorageError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        StorageError::Unavailable(format!(
          "failed to create database directory {}: {}",
          parent.display(),
          e
        ))
      })?;
    }

    let conn = Connection::open(path)?;
    let _mode: String =
      conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;

    let db = Self { conn };
    db.run_migrations(schema)?;

    Ok(db)
  }

  /// Open a private in-memory database (tests and the degraded path)
  pub fn open_in_memory(schema: &str) -> Result<Self, StorageError> {
    let db = Self {
      conn: Connection::open_in_memory()?,
    };
    db.run_migrations(schema)?;
    Ok(db)
  }

  /// Default location for a database file under the user's data directory
  pub fn default_path(file_name: &str) -> Option<PathBuf> {
    dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .map(|dir| dir.join("fieldsync").join(file_name))
  }

  fn run_migrations(&self, schema: &str) -> Result<(), StorageError> {
    self.conn.execute_batch(schema)?;
    Ok(())
  }

  pub fn into_connection(self) -> Connection {
    self.conn
  }
}

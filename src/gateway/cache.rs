//! Versioned static-asset caches, kept in their own database file.
//!
//! Several named caches can coexist on disk; only the one named by the
//! configured version is ever read, and activation deletes the rest.

use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{GatewayResponse, ResponseSource};
use crate::db::{schema, Database};
use crate::error::StorageError;

/// Blocking storage for cached responses.
pub trait AssetStore: Send + Sync + 'static {
  fn lookup(&self, cache_name: &str, url: &str) -> Result<Option<GatewayResponse>, StorageError>;

  fn put(&self, cache_name: &str, url: &str, response: &GatewayResponse) -> Result<(), StorageError>;

  /// Store every entry or none of them.
  fn put_all(
    &self,
    cache_name: &str,
    entries: &[(String, GatewayResponse)],
  ) -> Result<(), StorageError>;

  fn cache_names(&self) -> Result<Vec<String>, StorageError>;

  /// Drop a whole named cache. Returns the number of entries removed.
  fn delete_cache(&self, cache_name: &str) -> Result<usize, StorageError>;
}

/// Run an asset store call on the blocking pool.
pub(super) async fn blocking<C, R, F>(assets: &Arc<C>, f: F) -> Result<R, StorageError>
where
  C: AssetStore,
  F: FnOnce(&C) -> Result<R, StorageError> + Send + 'static,
  R: Send + 'static,
{
  let assets = Arc::clone(assets);
  tokio::task::spawn_blocking(move || f(&assets)).await?
}

/// Stable, fixed-length key for a request URL
fn request_hash(url: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(url.as_bytes());
  hex::encode(hasher.finalize())
}

pub struct SqliteAssetStore {
  conn: Mutex<Connection>,
}

impl SqliteAssetStore {
  pub fn open(path: &Path) -> Result<Self, StorageError> {
    let db = Database::open(path, schema::ASSET_SCHEMA)?;
    Ok(Self::from_database(db))
  }

  pub fn in_memory() -> Result<Self, StorageError> {
    let db = Database::open_in_memory(schema::ASSET_SCHEMA)?;
    Ok(Self::from_database(db))
  }

  fn from_database(db: Database) -> Self {
    Self {
      conn: Mutex::new(db.into_connection()),
    }
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
    self
      .conn
      .lock()
      .map_err(|e| StorageError::Unavailable(format!("lock poisoned: {}", e)))
  }
}

fn write_asset(
  conn: &Connection,
  cache_name: &str,
  url: &str,
  response: &GatewayResponse,
) -> rusqlite::Result<usize> {
  conn.execute(
    "INSERT OR REPLACE INTO asset_cache
       (cache_name, request_hash, url, status, content_type, body, cached_at)
     VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
    params![
      cache_name,
      request_hash(url),
      url,
      response.status,
      response.content_type,
      response.body
    ],
  )
}

impl AssetStore for SqliteAssetStore {
  fn lookup(&self, cache_name: &str, url: &str) -> Result<Option<GatewayResponse>, StorageError> {
    let conn = self.lock()?;
    let hit = conn
      .query_row(
        "SELECT status, content_type, body FROM asset_cache
         WHERE cache_name = ? AND request_hash = ?",
        params![cache_name, request_hash(url)],
        |row| {
          Ok(GatewayResponse {
            status: row.get(0)?,
            content_type: row.get(1)?,
            body: row.get(2)?,
            source: ResponseSource::Cache,
          })
        },
      )
      .optional()?;
    Ok(hit)
  }

  fn put(&self, cache_name: &str, url: &str, response: &GatewayResponse) -> Result<(), StorageError> {
    let conn = self.lock()?;
    write_asset(&conn, cache_name, url, response)?;
    Ok(())
  }

  fn put_all(
    &self,
    cache_name: &str,
    entries: &[(String, GatewayResponse)],
  ) -> Result<(), StorageError> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    for (url, response) in entries {
      write_asset(&tx, cache_name, url, response)?;
    }
    tx.commit()?;
    Ok(())
  }

  fn cache_names(&self) -> Result<Vec<String>, StorageError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT DISTINCT cache_name FROM asset_cache ORDER BY cache_name")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names)
  }

  fn delete_cache(&self, cache_name: &str) -> Result<usize, StorageError> {
    let conn = self.lock()?;
    let removed = conn.execute(
      "DELETE FROM asset_cache WHERE cache_name = ?",
      params![cache_name],
    )?;
    Ok(removed)
  }
}

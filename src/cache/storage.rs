//! Storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{error, warn};

use super::traits::Cacheable;
use crate::api::types::{Job, JobId};
use crate::db::{schema, Database};
use crate::error::StorageError;
use crate::sync::{NewEntry, Operation, QueueEntry};

/// A single cached document.
#[derive(Debug, Clone)]
pub struct CachedEntity<T> {
  /// The cached document
  pub entity: T,
  /// When it was written
  pub cached_at: DateTime<Utc>,
}

/// Trait for storage backends. Every method is one atomic unit of work.
pub trait CacheStorage: Send + Sync + 'static {
  /// All documents of a collection.
  fn get_all<T: Cacheable>(&self) -> Result<Vec<CachedEntity<T>>, StorageError>;

  /// A single document by key.
  fn get<T: Cacheable>(&self, key: &str) -> Result<Option<CachedEntity<T>>, StorageError>;

  /// Insert or overwrite a document.
  fn put<T: Cacheable>(&self, entity: &T) -> Result<(), StorageError>;

  /// Remove a document. Removing a missing key is not an error.
  fn remove<T: Cacheable>(&self, key: &str) -> Result<(), StorageError>;

  /// Overwrite a whole collection, keeping the rows listed in `retain`.
  fn replace_all<T: Cacheable>(&self, entities: &[T], retain: &[String]) -> Result<(), StorageError>;

  /// Drop every cached document and every queued mutation.
  fn clear(&self) -> Result<(), StorageError>;

  /// Persist a queue entry and return its sequence id.
  fn enqueue(&self, entry: &NewEntry) -> Result<i64, StorageError>;

  /// Pending queue entries in ascending sequence order.
  fn pending(&self) -> Result<Vec<QueueEntry>, StorageError>;

  /// Sequence ids of queued rows that can no longer be decoded.
  fn undecodable(&self) -> Result<Vec<i64>, StorageError>;

  /// Remove a queue entry. Acking a missing id is a no-op.
  fn ack(&self, sequence_id: i64) -> Result<(), StorageError>;

  fn queue_len(&self) -> Result<usize, StorageError>;

  /// Ack a replayed create and swap its placeholder for the server id in the
  /// queued targets and the cached job row. The mapping is kept so later
  /// writes against the placeholder still reach the job.
  fn resolve_placeholder(
    &self,
    sequence_id: i64,
    placeholder: &JobId,
    job: &Job,
  ) -> Result<(), StorageError>;

  /// Server id recorded for a resolved placeholder.
  fn resolved_id(&self, placeholder: &JobId) -> Result<Option<JobId>, StorageError>;
}

/// Storage used when the database cannot be opened.
/// Reads always miss, cache writes are discarded, and the queue refuses entries.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn get_all<T: Cacheable>(&self) -> Result<Vec<CachedEntity<T>>, StorageError> {
    Ok(Vec::new())
  }

  fn get<T: Cacheable>(&self, _key: &str) -> Result<Option<CachedEntity<T>>, StorageError> {
    Ok(None)
  }

  fn put<T: Cacheable>(&self, _entity: &T) -> Result<(), StorageError> {
    Ok(())
  }

  fn remove<T: Cacheable>(&self, _key: &str) -> Result<(), StorageError> {
    Ok(())
  }

  fn replace_all<T: Cacheable>(
    &self,
    _entities: &[T],
    _retain: &[String],
  ) -> Result<(), StorageError> {
    Ok(())
  }

  fn clear(&self) -> Result<(), StorageError> {
    Ok(())
  }

  fn enqueue(&self, _entry: &NewEntry) -> Result<i64, StorageError> {
    Err(StorageError::Unavailable(
      "local storage is disabled, cannot queue offline changes".into(),
    ))
  }

  fn pending(&self) -> Result<Vec<QueueEntry>, StorageError> {
    Ok(Vec::new())
  }

  fn undecodable(&self) -> Result<Vec<i64>, StorageError> {
    Ok(Vec::new())
  }

  fn ack(&self, _sequence_id: i64) -> Result<(), StorageError> {
    Ok(())
  }

  fn queue_len(&self) -> Result<usize, StorageError> {
    Ok(0)
  }

  fn resolve_placeholder(
    &self,
    _sequence_id: i64,
    _placeholder: &JobId,
    _job: &Job,
  ) -> Result<(), StorageError> {
    Ok(())
  }

  fn resolved_id(&self, _placeholder: &JobId) -> Result<Option<JobId>, StorageError> {
    Ok(None)
  }
}

/// SQLite-based storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the store at `path`.
  pub fn open(path: &Path) -> Result<Self, StorageError> {
    let db = Database::open(path, schema::SCHEMA)?;
    Ok(Self::from_database(db))
  }

  pub fn in_memory() -> Result<Self, StorageError> {
    let db = Database::open_in_memory(schema::SCHEMA)?;
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

  /// Decoded entries, plus the sequence ids of rows that no longer decode.
  fn load_queue(&self) -> Result<(Vec<QueueEntry>, Vec<i64>), StorageError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT sequence_id, operation, target_id, local_id, payload, enqueued_at
       FROM sync_queue ORDER BY sequence_id",
    )?;

    let rows = stmt
      .query_map([], |row| {
        Ok(RawEntry {
          sequence_id: row.get(0)?,
          operation: row.get(1)?,
          target_id: row.get(2)?,
          local_id: row.get(3)?,
          payload: row.get(4)?,
          enqueued_at: row.get(5)?,
        })
      })?
      .collect::<Result<Vec<_>, _>>()?;

    let mut entries = Vec::with_capacity(rows.len());
    let mut corrupt = Vec::new();
    for raw in rows {
      let sequence_id = raw.sequence_id;
      match raw.decode() {
        Some(entry) => entries.push(entry),
        None => {
          error!(sequence_id, "queue entry is corrupt and will not be replayed");
          corrupt.push(sequence_id);
        }
      }
    }

    Ok((entries, corrupt))
  }
}

fn lookup_server_id(conn: &Connection, placeholder: &JobId) -> rusqlite::Result<Option<String>> {
  conn
    .query_row(
      "SELECT server_id FROM placeholder_map WHERE placeholder = ?",
      params![placeholder.to_string()],
      |row| row.get(0),
    )
    .optional()
}

fn write_entity(
  conn: &Connection,
  collection: &str,
  key: &str,
  data: &[u8],
) -> rusqlite::Result<usize> {
  conn.execute(
    "INSERT OR REPLACE INTO entity_cache (collection, entity_key, data, cached_at)
     VALUES (?, ?, ?, datetime('now'))",
    params![collection, key, data],
  )
}

impl CacheStorage for SqliteStorage {
  fn get_all<T: Cacheable>(&self) -> Result<Vec<CachedEntity<T>>, StorageError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT entity_key, data, cached_at FROM entity_cache
       WHERE collection = ?
       ORDER BY cached_at DESC, entity_key",
    )?;

    let rows = stmt
      .query_map(params![T::collection()], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, Vec<u8>>(1)?,
          row.get::<_, String>(2)?,
        ))
      })?
      .collect::<Result<Vec<_>, _>>()?;

    let mut entities = Vec::with_capacity(rows.len());
    for (key, data, cached_at) in rows {
      match serde_json::from_slice::<T>(&data) {
        Ok(entity) => entities.push(CachedEntity {
          entity,
          cached_at: parse_datetime(&cached_at)?,
        }),
        Err(e) => warn!(
          collection = T::collection(),
          key = %key,
          error = %e,
          "skipping unreadable cached document"
        ),
      }
    }

    Ok(entities)
  }

  fn get<T: Cacheable>(&self, key: &str) -> Result<Option<CachedEntity<T>>, StorageError> {
    let conn = self.lock()?;
    let row: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT data, cached_at FROM entity_cache
         WHERE collection = ? AND entity_key = ?",
        params![T::collection(), key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()?;

    match row {
      Some((data, cached_at)) => Ok(Some(CachedEntity {
        entity: serde_json::from_slice(&data)?,
        cached_at: parse_datetime(&cached_at)?,
      })),
      None => Ok(None),
    }
  }

  fn put<T: Cacheable>(&self, entity: &T) -> Result<(), StorageError> {
    let data = serde_json::to_vec(entity)?;
    let conn = self.lock()?;
    write_entity(&conn, T::collection(), &entity.cache_key(), &data)?;
    Ok(())
  }

  fn remove<T: Cacheable>(&self, key: &str) -> Result<(), StorageError> {
    let conn = self.lock()?;
    conn.execute(
      "DELETE FROM entity_cache WHERE collection = ? AND entity_key = ?",
      params![T::collection(), key],
    )?;
    Ok(())
  }

  fn replace_all<T: Cacheable>(
    &self,
    entities: &[T],
    retain: &[String],
  ) -> Result<(), StorageError> {
    // Serialize before taking the lock so a bad document leaves the store untouched
    let encoded = entities
      .iter()
      .map(|e| Ok((e.cache_key(), serde_json::to_vec(e)?)))
      .collect::<Result<Vec<_>, StorageError>>()?;
    let retain: HashSet<&str> = retain.iter().map(String::as_str).collect();
    let collection = T::collection();

    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    let existing: Vec<String> = {
      let mut stmt = tx.prepare("SELECT entity_key FROM entity_cache WHERE collection = ?")?;
      let keys = stmt
        .query_map(params![collection], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
      keys
    };

    for key in existing.iter().filter(|k| !retain.contains(k.as_str())) {
      tx.execute(
        "DELETE FROM entity_cache WHERE collection = ? AND entity_key = ?",
        params![collection, key],
      )?;
    }

    for (key, data) in &encoded {
      write_entity(&tx, collection, key, data)?;
    }

    tx.commit()?;
    Ok(())
  }

  fn clear(&self) -> Result<(), StorageError> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM entity_cache", [])?;
    tx.execute("DELETE FROM sync_queue", [])?;
    tx.execute("DELETE FROM placeholder_map", [])?;
    tx.commit()?;
    Ok(())
  }

  fn enqueue(&self, entry: &NewEntry) -> Result<i64, StorageError> {
    let payload = serde_json::to_vec(&entry.payload)?;
    let conn = self.lock()?;
    // A placeholder whose create already replayed is stored as its server id
    let target_id = match &entry.target_id {
      Some(id) if id.is_placeholder() => {
        Some(lookup_server_id(&conn, id)?.unwrap_or_else(|| id.to_string()))
      }
      Some(id) => Some(id.to_string()),
      None => None,
    };
    conn.execute(
      "INSERT INTO sync_queue (operation, target_id, local_id, payload, enqueued_at)
       VALUES (?, ?, ?, ?, ?)",
      params![
        entry.operation.as_str(),
        target_id,
        entry.local_id.as_ref().map(JobId::to_string),
        payload,
        Utc::now().to_rfc3339(),
      ],
    )?;
    Ok(conn.last_insert_rowid())
  }

  fn pending(&self) -> Result<Vec<QueueEntry>, StorageError> {
    let (entries, _) = self.load_queue()?;
    Ok(entries)
  }

  fn undecodable(&self) -> Result<Vec<i64>, StorageError> {
    let (_, corrupt) = self.load_queue()?;
    Ok(corrupt)
  }

  fn ack(&self, sequence_id: i64) -> Result<(), StorageError> {
    let conn = self.lock()?;
    conn.execute(
      "DELETE FROM sync_queue WHERE sequence_id = ?",
      params![sequence_id],
    )?;
    Ok(())
  }

  fn queue_len(&self) -> Result<usize, StorageError> {
    let conn = self.lock()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))?;
    Ok(count as usize)
  }

  fn resolve_placeholder(
    &self,
    sequence_id: i64,
    placeholder: &JobId,
    job: &Job,
  ) -> Result<(), StorageError> {
    let data = serde_json::to_vec(job)?;
    let placeholder = placeholder.to_string();
    let server_id = job.id.to_string();
    let collection = <Job as Cacheable>::collection();

    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    tx.execute(
      "DELETE FROM sync_queue WHERE sequence_id = ?",
      params![sequence_id],
    )?;
    tx.execute(
      "UPDATE sync_queue SET target_id = ? WHERE target_id = ?",
      params![server_id, placeholder],
    )?;
    tx.execute(
      "DELETE FROM entity_cache WHERE collection = ? AND entity_key = ?",
      params![collection, placeholder],
    )?;
    write_entity(&tx, collection, &server_id, &data)?;
    tx.execute(
      "INSERT OR REPLACE INTO placeholder_map (placeholder, server_id) VALUES (?, ?)",
      params![placeholder, server_id],
    )?;
    tx.commit()?;
    Ok(())
  }

  fn resolved_id(&self, placeholder: &JobId) -> Result<Option<JobId>, StorageError> {
    let conn = self.lock()?;
    match lookup_server_id(&conn, placeholder)? {
      Some(id) => id
        .parse::<JobId>()
        .map(Some)
        .map_err(|e| StorageError::Unavailable(e.to_string())),
      None => Ok(None),
    }
  }
}

struct RawEntry {
  sequence_id: i64,
  operation: String,
  target_id: Option<String>,
  local_id: Option<String>,
  payload: Vec<u8>,
  enqueued_at: String,
}

impl RawEntry {
  fn decode(self) -> Option<QueueEntry> {
    let parse_id = |s: Option<String>| match s {
      Some(s) => s.parse::<JobId>().ok().map(Some),
      None => Some(None),
    };

    Some(QueueEntry {
      sequence_id: self.sequence_id,
      operation: self.operation.parse::<Operation>().ok()?,
      target_id: parse_id(self.target_id)?,
      local_id: parse_id(self.local_id)?,
      payload: serde_json::from_slice(&self.payload).ok()?,
      enqueued_at: DateTime::parse_from_rfc3339(&self.enqueued_at)
        .ok()?
        .with_timezone(&Utc),
    })
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StorageError> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| StorageError::Unavailable(format!("bad timestamp '{}': {}", s, e)))
}

//! Async local store over a blocking storage backend, plus network-first reads
//! that fall back to the store when the network is unavailable.

use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::storage::CacheStorage;
use super::traits::{CacheResult, Cacheable, Singleton};
use crate::error::{ApiError, StorageError};

/// Run a storage call on the blocking pool.
pub(crate) async fn blocking<S, R, F>(storage: &Arc<S>, f: F) -> Result<R, StorageError>
where
  S: CacheStorage,
  F: FnOnce(&S) -> Result<R, StorageError> + Send + 'static,
  R: Send + 'static,
{
  let storage = Arc::clone(storage);
  tokio::task::spawn_blocking(move || f(&storage)).await?
}

/// Durable store for cached collections.
///
/// The collection is chosen by the document type: `put(job)` writes to the
/// jobs store, `put_singleton(stats)` to the stats store. Each call is atomic.
pub struct LocalStore<S: CacheStorage> {
  storage: Arc<S>,
}

impl<S: CacheStorage> LocalStore<S> {
  pub fn new(storage: S) -> Self {
    Self::from_shared(Arc::new(storage))
  }

  /// Share a backend that other components (the sync queue) also use.
  pub fn from_shared(storage: Arc<S>) -> Self {
    Self { storage }
  }

  pub async fn get_all<T: Cacheable>(&self) -> Result<Vec<T>, StorageError> {
    let cached = blocking(&self.storage, |s| s.get_all::<T>()).await?;
    Ok(cached.into_iter().map(|c| c.entity).collect())
  }

  pub async fn get<T: Cacheable>(&self, key: String) -> Result<Option<T>, StorageError> {
    let cached = blocking(&self.storage, move |s| s.get::<T>(&key)).await?;
    Ok(cached.map(|c| c.entity))
  }

  pub async fn put<T: Cacheable>(&self, entity: T) -> Result<(), StorageError> {
    blocking(&self.storage, move |s| s.put(&entity)).await
  }

  pub async fn remove<T: Cacheable>(&self, key: String) -> Result<(), StorageError> {
    blocking(&self.storage, move |s| s.remove::<T>(&key)).await
  }

  pub async fn get_singleton<T: Singleton>(&self) -> Result<Option<T>, StorageError> {
    self.get::<T>(T::KEY.to_string()).await
  }

  pub async fn put_singleton<T: Singleton>(&self, entity: T) -> Result<(), StorageError> {
    self.put(entity).await
  }

  /// Overwrite a collection with authoritative data, keeping `retain` rows.
  pub async fn replace_all<T: Cacheable>(
    &self,
    entities: Vec<T>,
    retain: Vec<String>,
  ) -> Result<(), StorageError> {
    blocking(&self.storage, move |s| s.replace_all(&entities, &retain)).await
  }

  /// Wipe cached documents and the queue (logout).
  pub async fn clear(&self) -> Result<(), StorageError> {
    blocking(&self.storage, |s| s.clear()).await
  }

  /// Fetch a collection network-first.
  ///
  /// 1. Fetch from network and overwrite the collection (keeping `retain` rows)
  /// 2. On network failure, serve whatever the store holds (offline mode)
  /// 3. If the store is unusable too, serve an empty list
  pub async fn fetch_list<T, F, Fut>(&self, retain: Vec<String>, fetcher: F) -> CacheResult<Vec<T>>
  where
    T: Cacheable,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<T>, ApiError>>,
  {
    match fetcher().await {
      Ok(data) => {
        if let Err(e) = self.replace_all(data.clone(), retain).await {
          warn!(collection = T::collection(), error = %e, "failed to cache fetched collection");
        }
        CacheResult::from_network(data)
      }
      Err(err) => {
        debug!(collection = T::collection(), error = %err, "network read failed, serving cache");
        match blocking(&self.storage, |s| s.get_all::<T>()).await {
          Ok(cached) => {
            let cached_at = cached.iter().map(|c| c.cached_at).max();
            CacheResult::offline(cached.into_iter().map(|c| c.entity).collect(), cached_at)
          }
          Err(e) => {
            warn!(collection = T::collection(), error = %e, "cache unavailable, serving empty list");
            CacheResult::offline(Vec::new(), None)
          }
        }
      }
    }
  }

  /// Fetch a singleton network-first with the same fallback rules.
  pub async fn fetch_singleton<T, F, Fut>(&self, fetcher: F) -> CacheResult<Option<T>>
  where
    T: Singleton,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
  {
    match fetcher().await {
      Ok(data) => {
        if let Err(e) = self.put_singleton(data.clone()).await {
          warn!(collection = T::collection(), error = %e, "failed to cache fetched record");
        }
        CacheResult::from_network(Some(data))
      }
      Err(err) => {
        debug!(collection = T::collection(), error = %err, "network read failed, serving cache");
        let key = T::KEY;
        match blocking(&self.storage, move |s| s.get::<T>(key)).await {
          Ok(Some(cached)) => CacheResult::offline(Some(cached.entity), Some(cached.cached_at)),
          Ok(None) => CacheResult::offline(None, None),
          Err(e) => {
            warn!(collection = T::collection(), error = %e, "cache unavailable");
            CacheResult::offline(None, None)
          }
        }
      }
    }
  }
}

impl<S: CacheStorage> Clone for LocalStore<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
    }
  }
}

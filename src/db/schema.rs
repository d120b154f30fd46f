//! SQL schemas for the two durable stores.

/// Application database: cached collections plus the pending-mutation queue.
pub const SCHEMA: &str = r#"
-- Cached documents (jobs keyed by id, stats/user as singletons)
CREATE TABLE IF NOT EXISTS entity_cache (
    collection TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (collection, entity_key)
);

-- Offline mutations awaiting replay, ordered by sequence_id
CREATE TABLE IF NOT EXISTS sync_queue (
    sequence_id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL,
    target_id TEXT,
    local_id TEXT,
    payload BLOB NOT NULL,
    enqueued_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_queue_target ON sync_queue(target_id);

-- Server ids assigned to replayed creates, so a stale placeholder still
-- reaches its job
CREATE TABLE IF NOT EXISTS placeholder_map (
    placeholder TEXT PRIMARY KEY,
    server_id TEXT NOT NULL
);
"#;

/// Gateway database: versioned static-asset caches.
pub const ASSET_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS asset_cache (
    cache_name TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    content_type TEXT,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, request_hash)
);
"#;

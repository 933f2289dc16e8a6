//! Entity resolution cache
//!
//! Maps CRM record GUIDs to display names, partitioned by [`EntityType`].
//! Entries live for a fixed TTL and expire lazily: nothing evicts them in the
//! background, a read simply treats an expired entry as absent. Every
//! mutation rewrites the snapshot held by the injected [`CacheBackend`].

pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

pub use store::{CacheBackend, CacheError, JsonFileBackend, MemoryBackend};

/// Kind of record a cached name belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Owner,
    Division,
    Customer,
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityType::Owner => "owner",
            EntityType::Division => "division",
            EntityType::Customer => "customer",
        };
        f.write_str(name)
    }
}

/// One resolved name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub display_name: String,
    pub resolved_at: DateTime<Utc>,
}

/// No live entry exists; the caller must fetch the name and `put` it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheMiss;

/// Result of [`EntityCache::bulk_resolve`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BulkResolution {
    pub hits: HashMap<Uuid, String>,
    pub misses: BTreeSet<Uuid>,
}

/// Live/expired counts, for startup logging
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub live: usize,
    pub expired: usize,
}

/// Source of "now"; swapped out in tests
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

type Key = (EntityType, Uuid);

pub struct EntityCache {
    entries: RwLock<HashMap<Key, CacheEntry>>,
    backend: Arc<dyn CacheBackend>,
    ttl: chrono::Duration,
    clock: Clock,
    // Serializes snapshot writes so an older snapshot never lands last
    persist_lock: Mutex<()>,
}

impl EntityCache {
    /// Load the backend's snapshot. Unreadable or malformed storage is logged
    /// and replaced by an empty cache; it never fails startup.
    pub fn load(backend: Arc<dyn CacheBackend>, ttl: chrono::Duration) -> Self {
        Self::load_with_clock(backend, ttl, Arc::new(Utc::now))
    }

    pub fn load_with_clock(
        backend: Arc<dyn CacheBackend>,
        ttl: chrono::Duration,
        clock: Clock,
    ) -> Self {
        let records = match backend.load() {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!("Ignoring unusable entity cache, starting empty: {}", e);
                Vec::new()
            }
        };

        let mut entries: HashMap<Key, CacheEntry> = HashMap::with_capacity(records.len());
        for record in records {
            let key = (record.entity_type, record.entity_id);
            match entries.get(&key) {
                Some(existing) if existing.resolved_at >= record.resolved_at => {}
                _ => {
                    entries.insert(key, record);
                }
            }
        }

        let now = clock();
        let live = entries
            .values()
            .filter(|e| now.signed_duration_since(e.resolved_at) <= ttl)
            .count();
        tracing::info!(
            "Entity cache loaded: {} live, {} expired",
            live,
            entries.len() - live
        );

        Self {
            entries: RwLock::new(entries),
            backend,
            ttl,
            clock,
            persist_lock: Mutex::new(()),
        }
    }

    /// Cached name for a live entry
    pub async fn resolve(&self, entity_type: EntityType, entity_id: Uuid) -> Result<String, CacheMiss> {
        let now = (self.clock)();
        let entries = self.entries.read().await;
        match entries.get(&(entity_type, entity_id)) {
            Some(entry) if self.is_live(entry, now) => Ok(entry.display_name.clone()),
            _ => Err(CacheMiss),
        }
    }

    /// Split `ids` into cached names and ids that need a remote lookup
    pub async fn bulk_resolve<I>(&self, entity_type: EntityType, ids: I) -> BulkResolution
    where
        I: IntoIterator<Item = Uuid>,
    {
        let now = (self.clock)();
        let entries = self.entries.read().await;
        let mut resolution = BulkResolution::default();

        for id in ids {
            match entries.get(&(entity_type, id)) {
                Some(entry) if self.is_live(entry, now) => {
                    resolution.hits.insert(id, entry.display_name.clone());
                }
                _ => {
                    resolution.misses.insert(id);
                }
            }
        }

        tracing::debug!(
            "bulk_resolve {}: {} hits, {} misses",
            entity_type,
            resolution.hits.len(),
            resolution.misses.len()
        );
        resolution
    }

    /// Insert or overwrite one entry and persist
    pub async fn put(
        &self,
        entity_type: EntityType,
        entity_id: Uuid,
        display_name: impl Into<String>,
    ) -> Result<(), CacheError> {
        let display_name: String = display_name.into();
        self.put_many(entity_type, [(entity_id, display_name)]).await
    }

    /// Insert a batch of entries and persist once
    pub async fn put_many<I>(&self, entity_type: EntityType, names: I) -> Result<(), CacheError>
    where
        I: IntoIterator<Item = (Uuid, String)>,
    {
        let now = (self.clock)();
        let inserted = {
            let mut entries = self.entries.write().await;
            let mut count = 0;
            for (entity_id, display_name) in names {
                entries.insert(
                    (entity_type, entity_id),
                    CacheEntry {
                        entity_type,
                        entity_id,
                        display_name,
                        resolved_at: now,
                    },
                );
                count += 1;
            }
            count
        };

        if inserted == 0 {
            return Ok(());
        }
        self.persist().await
    }

    /// Ids of live entries whose name equals `name`, ignoring case
    pub async fn find_by_name(&self, entity_type: EntityType, name: &str) -> Vec<Uuid> {
        let now = (self.clock)();
        let needle = name.trim().to_lowercase();
        let entries = self.entries.read().await;

        let mut ids: Vec<Uuid> = entries
            .values()
            .filter(|e| e.entity_type == entity_type && self.is_live(e, now))
            .filter(|e| e.display_name.trim().to_lowercase() == needle)
            .map(|e| e.entity_id)
            .collect();
        ids.sort();
        ids
    }

    /// Drop expired entries and write a fresh snapshot
    pub async fn flush(&self) -> Result<(), CacheError> {
        self.persist().await
    }

    pub async fn stats(&self) -> CacheStats {
        let now = (self.clock)();
        let entries = self.entries.read().await;
        self.count(entries.values(), now)
    }

    /// Drop expired entries from memory, returning how many were removed
    pub async fn purge_expired(&self) -> usize {
        let now = (self.clock)();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| self.is_live(e, now));
        before - entries.len()
    }

    async fn persist(&self) -> Result<(), CacheError> {
        let _guard = self.persist_lock.lock().await;

        let purged = self.purge_expired().await;
        if purged > 0 {
            tracing::debug!("Purged {} expired cache entries", purged);
        }

        let snapshot: Vec<CacheEntry> = {
            let entries = self.entries.read().await;
            let mut snapshot: Vec<CacheEntry> = entries.values().cloned().collect();
            snapshot.sort_by(|a, b| {
                (a.entity_type, a.entity_id).cmp(&(b.entity_type, b.entity_id))
            });
            snapshot
        };

        // File backends block on write + fsync
        let backend = self.backend.clone();
        tokio::task::spawn_blocking(move || backend.save(&snapshot))
            .await
            .map_err(|e| CacheError::Io(std::io::Error::other(e)))?
    }

    fn is_live(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(entry.resolved_at) <= self.ttl
    }

    fn count<'a>(&self, entries: impl Iterator<Item = &'a CacheEntry>, now: DateTime<Utc>) -> CacheStats {
        let mut stats = CacheStats::default();
        for entry in entries {
            if self.is_live(entry, now) {
                stats.live += 1;
            } else {
                stats.expired += 1;
            }
        }
        stats
    }
}

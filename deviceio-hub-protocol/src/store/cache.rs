//! Generic snapshot-plus-feed cache
//!
//! Exactly one task mutates each cache: the feed follower spawned by the
//! daemon. Readers take the lock briefly and clone the record they need, so
//! no lock is ever held across I/O.

use std::collections::HashMap;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{CacheSource, Change, Record};
use crate::Result;

/// Delay before re-entering a full hydrate after the feed breaks.
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// In-memory map of one store collection, keyed by record id.
pub struct EntityCache<T: Record> {
    name: &'static str,
    entries: RwLock<HashMap<String, T>>,
}

impl<T: Record> EntityCache<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Look up a record by id.
    pub async fn get(&self, id: &str) -> Option<T> {
        self.entries.read().await.get(id).cloned()
    }

    /// Return the first record matching the predicate, if any.
    pub async fn find<F>(&self, predicate: F) -> Option<T>
    where
        F: Fn(&T) -> bool,
    {
        self.entries
            .read()
            .await
            .values()
            .find(|record| predicate(record))
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Replace the full contents with a fresh snapshot.
    pub async fn replace_all(&self, records: Vec<T>) {
        let mut entries = self.entries.write().await;
        entries.clear();
        for record in records {
            entries.insert(record.id().to_string(), record);
        }
    }

    /// Apply one change-feed event: delete when `new` is absent, upsert
    /// otherwise. Idempotent.
    pub async fn apply(&self, change: Change<T>) {
        let mut entries = self.entries.write().await;
        match change.new {
            Some(record) => {
                entries.insert(record.id().to_string(), record);
            }
            None => {
                if let Some(old) = change.old {
                    entries.remove(old.id());
                }
            }
        }
    }
}

/// Hydrate a cache from a snapshot. Fatal to startup when the store is
/// unreachable; the caller decides.
pub async fn hydrate<T, S>(cache: &EntityCache<T>, source: &S) -> Result<()>
where
    T: Record,
    S: CacheSource<T>,
{
    let snapshot = source.snapshot().await?;
    let count = snapshot.len();
    cache.replace_all(snapshot).await;
    info!(cache = cache.name(), records = count, "cache hydrated");
    Ok(())
}

/// Follow a collection forever: hydrate, then apply feed events in arrival
/// order; on any feed failure re-enter the full hydrate after a delay.
pub async fn follow<T, S>(cache: std::sync::Arc<EntityCache<T>>, source: S)
where
    T: Record,
    S: CacheSource<T>,
{
    loop {
        match hydrate_and_stream(&cache, &source).await {
            Ok(()) => warn!(cache = cache.name(), "cache change feed ended"),
            Err(e) => warn!(cache = cache.name(), error = %e, "cache feed failed"),
        }
        tokio::time::sleep(RETRY_DELAY).await;
    }
}

async fn hydrate_and_stream<T, S>(cache: &EntityCache<T>, source: &S) -> Result<()>
where
    T: Record,
    S: CacheSource<T>,
{
    hydrate(cache, source).await?;

    let mut changes = source.changes().await?;
    while let Some(event) = changes.next().await {
        let change = event?;
        debug!(cache = cache.name(), "applying change event");
        cache.apply(change).await;
    }

    Ok(())
}

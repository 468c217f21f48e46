//! Store contract and in-memory caches
//!
//! The authoritative copies of users, cluster members and device records
//! live in an external store. The core consumes that store through exactly
//! two operations per collection: a full snapshot, and an append-only change
//! feed of `{old, new}` pairs. Everything the hub reads at request time
//! comes from the in-memory caches this module keeps consistent with the
//! feed.

mod cache;
mod model;

pub use cache::{follow, hydrate, EntityCache};
pub use model::{DeviceRecord, Member, User};

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::Result;

/// In-memory cache of users, keyed by id.
pub type UserCache = EntityCache<User>;

/// In-memory cache of cluster members, keyed by id.
pub type MemberCache = EntityCache<Member>;

/// In-memory cache of persisted device records, keyed by id.
pub type DeviceCache = EntityCache<DeviceRecord>;

/// A stored record addressable by a stable string id.
pub trait Record: Clone + Send + Sync + 'static {
    fn id(&self) -> &str;
}

/// One change-feed event.
///
/// `new` absent means the record identified by `old` was deleted; otherwise
/// the record keyed by `new`'s id is inserted or replaced. Applying the same
/// event twice leaves the cache unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change<T> {
    pub old: Option<T>,
    pub new: Option<T>,
}

/// A change feed, consumed in arrival order on a dedicated task.
pub type ChangeStream<T> = Pin<Box<dyn Stream<Item = Result<Change<T>>> + Send>>;

/// The operations the hub consumes from the external store.
///
/// Implementations must deliver changes in commit order. A broken feed is
/// reported as an `Err` item or end-of-stream; the cache layer reacts by
/// re-entering a full hydrate.
#[async_trait::async_trait]
pub trait HubStore: Send + Sync + 'static {
    async fn users(&self) -> Result<Vec<User>>;
    async fn user_changes(&self) -> Result<ChangeStream<User>>;

    async fn members(&self) -> Result<Vec<Member>>;
    async fn member_changes(&self) -> Result<ChangeStream<Member>>;

    async fn devices(&self) -> Result<Vec<DeviceRecord>>;
    async fn device_changes(&self) -> Result<ChangeStream<DeviceRecord>>;
}

/// Snapshot-plus-feed access to one collection of a `HubStore`.
///
/// The three wrappers below let the generic cache machinery stay ignorant
/// of which collection it is following.
#[async_trait::async_trait]
pub trait CacheSource<T: Record>: Send + Sync + 'static {
    async fn snapshot(&self) -> Result<Vec<T>>;
    async fn changes(&self) -> Result<ChangeStream<T>>;
}

/// The users collection of a store.
pub struct Users(pub Arc<dyn HubStore>);

/// The members collection of a store.
pub struct Members(pub Arc<dyn HubStore>);

/// The device records collection of a store.
pub struct Devices(pub Arc<dyn HubStore>);

#[async_trait::async_trait]
impl CacheSource<User> for Users {
    async fn snapshot(&self) -> Result<Vec<User>> {
        self.0.users().await
    }

    async fn changes(&self) -> Result<ChangeStream<User>> {
        self.0.user_changes().await
    }
}

#[async_trait::async_trait]
impl CacheSource<Member> for Members {
    async fn snapshot(&self) -> Result<Vec<Member>> {
        self.0.members().await
    }

    async fn changes(&self) -> Result<ChangeStream<Member>> {
        self.0.member_changes().await
    }
}

#[async_trait::async_trait]
impl CacheSource<DeviceRecord> for Devices {
    async fn snapshot(&self) -> Result<Vec<DeviceRecord>> {
        self.0.devices().await
    }

    async fn changes(&self) -> Result<ChangeStream<DeviceRecord>> {
        self.0.device_changes().await
    }
}

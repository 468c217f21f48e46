//! Live connection registry
//!
//! Indexes every registered device connection twice, by lowercased device
//! id and by lowercased hostname, under a single lock. For every live
//! connection both index entries point at it, no two live connections share
//! a key in either map, and a closed session's entries are removed before a
//! new registration with the same key can succeed.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, info};

use super::connection::DeviceConnection;
use crate::device::DeviceInfo;
use crate::{HubError, Result};

#[derive(Default)]
struct RegistryMaps {
    by_id: HashMap<String, Arc<DeviceConnection>>,
    by_host: HashMap<String, Arc<DeviceConnection>>,
}

impl RegistryMaps {
    /// Any live connection holding one of the candidate keys, in either
    /// map. Cross-map hits count: a hostname that collides with another
    /// device's id would make lookups order-dependent.
    fn collision(&self, id: &str, host: &str) -> Option<Arc<DeviceConnection>> {
        self.by_id
            .get(id)
            .or_else(|| self.by_host.get(host))
            .or_else(|| self.by_id.get(host))
            .or_else(|| self.by_host.get(id))
            .cloned()
    }

    fn remove_entries(&mut self, connection: &Arc<DeviceConnection>) {
        let id = connection.info().id_key();
        let host = connection.info().hostname_key();
        if self
            .by_id
            .get(&id)
            .is_some_and(|c| Arc::ptr_eq(c, connection))
        {
            self.by_id.remove(&id);
        }
        if self
            .by_host
            .get(&host)
            .is_some_and(|c| Arc::ptr_eq(c, connection))
        {
            self.by_host.remove(&host);
        }
    }
}

/// The single per-gateway index of live device connections.
pub struct ConnectionRegistry {
    inner: RwLock<RegistryMaps>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryMaps::default()),
        }
    }

    /// Register a freshly established connection under both of its keys.
    ///
    /// On a duplicate id or hostname (including a cross-map collision)
    /// both the incumbent and the connecting tunnel are closed, the
    /// incumbent's entries are dropped, and neither ends up registered. A
    /// misconfigured impostor asserting an existing identity therefore
    /// cannot silently evict the incumbent.
    pub async fn register(&self, connection: Arc<DeviceConnection>) -> Result<()> {
        let id = connection.info().id_key();
        let host = connection.info().hostname_key();

        let mut maps = self.inner.write().await;

        if let Some(existing) = maps.collision(&id, &host) {
            error!(
                id = %id,
                hostname = %host,
                connected_device_addr = %existing.remote_addr(),
                connecting_device_addr = %connection.remote_addr(),
                "device connections closed due to duplicate identity"
            );
            existing.close();
            connection.close();
            maps.remove_entries(&existing);
            return Err(HubError::DuplicateRegistration(id));
        }

        maps.by_id.insert(id, connection.clone());
        maps.by_host.insert(host, connection.clone());
        drop(maps);

        info!(
            remote_addr = %connection.remote_addr(),
            id = %connection.info().id,
            hostname = %connection.info().hostname,
            platform = %connection.info().platform,
            architecture = %connection.info().architecture,
            tags = ?connection.info().tags,
            "device connected"
        );

        Ok(())
    }

    /// Locate a connection by device id or hostname (case-insensitive).
    ///
    /// The id map is probed first. A lookup never observes a
    /// half-registered connection: registration publishes both entries
    /// under the write lock.
    pub async fn find(&self, device: &str) -> Result<Arc<DeviceConnection>> {
        if device.trim().is_empty() {
            return Err(HubError::invalid_argument("deviceid is empty"));
        }

        let key = device.to_lowercase();
        let maps = self.inner.read().await;
        maps.by_id
            .get(&key)
            .or_else(|| maps.by_host.get(&key))
            .cloned()
            .ok_or_else(|| HubError::DeviceNotConnected(device.to_string()))
    }

    /// Remove a connection's entries, but only while they still point at
    /// it. A key that has since been won by another connection is left
    /// alone. Returns whether anything was removed.
    pub async fn remove_if_current(&self, connection: &Arc<DeviceConnection>) -> bool {
        let mut maps = self.inner.write().await;
        let before = maps.by_id.len() + maps.by_host.len();
        maps.remove_entries(connection);
        maps.by_id.len() + maps.by_host.len() != before
    }

    /// Identities of every currently registered connection.
    pub async fn connected_devices(&self) -> Vec<DeviceInfo> {
        self.inner
            .read()
            .await
            .by_id
            .values()
            .map(|c| c.info().clone())
            .collect()
    }

    /// Number of registered connections.
    pub async fn len(&self) -> usize {
        self.inner.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.by_id.is_empty()
    }

    /// Close every registered connection and clear both maps. Used on
    /// gateway shutdown.
    pub async fn drain(&self) -> usize {
        let mut maps = self.inner.write().await;
        let count = maps.by_id.len();
        for connection in maps.by_id.values() {
            connection.close();
        }
        maps.by_id.clear();
        maps.by_host.clear();
        count
    }
}

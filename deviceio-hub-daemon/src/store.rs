//! File-backed hub store
//!
//! A `HubStore` implementation over a single JSON document holding the
//! `users`, `members` and `devices` collections. A file watcher reloads the
//! document whenever it changes on disk, diffs each collection by id, and
//! emits the resulting `{old, new}` events to change-feed subscribers: the
//! same snapshot-plus-feed shape the caches consume from any store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use deviceio_hub_protocol::store::ChangeStream;
use deviceio_hub_protocol::{
    Change, DeviceRecord, HubError, HubStore, Member, Record, User,
};
use notify::{RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// Buffered change events per collection; a subscriber that lags behind
/// this far gets a feed error and re-hydrates.
const FEED_CAPACITY: usize = 64;

/// The on-disk document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    users: Vec<User>,

    #[serde(default)]
    members: Vec<Member>,

    #[serde(default)]
    devices: Vec<DeviceRecord>,
}

struct Inner {
    path: PathBuf,
    document: Mutex<StoreDocument>,
    users_tx: broadcast::Sender<Change<User>>,
    members_tx: broadcast::Sender<Change<Member>>,
    devices_tx: broadcast::Sender<Change<DeviceRecord>>,
}

/// JSON-file-backed store with a change feed driven by a file watcher.
#[derive(Clone)]
pub struct JsonFileStore {
    inner: Arc<Inner>,
}

impl JsonFileStore {
    /// Open the store document and start watching it for changes.
    ///
    /// # Errors
    ///
    /// Returns `HubError::StoreUnavailable` when the document cannot be
    /// read or parsed, or the watcher cannot be installed. All are fatal
    /// at startup.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, HubError> {
        let path = path.into();
        let document = read_document(&path)?;

        let (users_tx, _) = broadcast::channel(FEED_CAPACITY);
        let (members_tx, _) = broadcast::channel(FEED_CAPACITY);
        let (devices_tx, _) = broadcast::channel(FEED_CAPACITY);

        let inner = Arc::new(Inner {
            path: path.clone(),
            document: Mutex::new(document),
            users_tx,
            members_tx,
            devices_tx,
        });

        // Watch the parent directory: editors and atomic writers replace
        // the file, which would orphan a watch on the file itself.
        let watch_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let (event_tx, event_rx) = mpsc::channel(16);
        let mut watcher = notify::recommended_watcher(move |event| {
            let _ = event_tx.blocking_send(event);
        })
        .map_err(|e| HubError::StoreUnavailable(format!("failed to create store watcher: {e}")))?;
        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| HubError::StoreUnavailable(format!("failed to watch store path: {e}")))?;

        tokio::spawn(watch_loop(Arc::clone(&inner), watcher, event_rx));

        Ok(Self { inner })
    }
}

async fn watch_loop(
    inner: Arc<Inner>,
    _watcher: notify::RecommendedWatcher,
    mut events: mpsc::Receiver<notify::Result<notify::Event>>,
) {
    let file_name = inner.path.file_name().map(|n| n.to_os_string());

    while let Some(event) = events.recv().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "store watcher error");
                continue;
            }
        };

        let touches_store = event.paths.iter().any(|p| p.file_name() == file_name.as_deref());
        if !touches_store {
            continue;
        }

        match read_document(&inner.path) {
            Ok(new_document) => inner.publish(new_document),
            // A partial write can surface as invalid JSON; the next event
            // for the completed write will pick the document up.
            Err(e) => debug!(error = %e, "skipping unreadable store document"),
        }
    }
}

impl Inner {
    /// Swap in the freshly read document and broadcast the per-collection
    /// diffs in order.
    fn publish(&self, new_document: StoreDocument) {
        let old_document = {
            let mut guard = self.document.lock().expect("store mutex poisoned");
            if *guard == new_document {
                return;
            }
            std::mem::replace(&mut *guard, new_document.clone())
        };

        for change in diff_by_id(&old_document.users, &new_document.users) {
            let _ = self.users_tx.send(change);
        }
        for change in diff_by_id(&old_document.members, &new_document.members) {
            let _ = self.members_tx.send(change);
        }
        for change in diff_by_id(&old_document.devices, &new_document.devices) {
            let _ = self.devices_tx.send(change);
        }
    }
}

fn read_document(path: &Path) -> Result<StoreDocument, HubError> {
    let contents = std::fs::read(path).map_err(|e| {
        HubError::StoreUnavailable(format!("failed to read {}: {e}", path.display()))
    })?;
    serde_json::from_slice(&contents).map_err(|e| {
        HubError::StoreUnavailable(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Diff two snapshots of one collection into change-feed events: deletions
/// first, then inserts and updates.
fn diff_by_id<T: Record + PartialEq>(old: &[T], new: &[T]) -> Vec<Change<T>> {
    let old_by_id: HashMap<&str, &T> = old.iter().map(|r| (r.id(), r)).collect();
    let new_by_id: HashMap<&str, &T> = new.iter().map(|r| (r.id(), r)).collect();

    let mut changes = Vec::new();

    for record in old {
        if !new_by_id.contains_key(record.id()) {
            changes.push(Change {
                old: Some(record.clone()),
                new: None,
            });
        }
    }

    for record in new {
        match old_by_id.get(record.id()) {
            None => changes.push(Change {
                old: None,
                new: Some(record.clone()),
            }),
            Some(previous) if *previous != record => changes.push(Change {
                old: Some((*previous).clone()),
                new: Some(record.clone()),
            }),
            Some(_) => {}
        }
    }

    changes
}

/// Wrap a broadcast subscription as a `ChangeStream`.
fn feed<T: Record>(rx: broadcast::Receiver<Change<T>>) -> ChangeStream<T> {
    Box::pin(futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(change) => return Some((Ok(change), rx)),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    return Some((
                        Err(HubError::StoreUnavailable(format!(
                            "change feed lagged by {missed} events"
                        ))),
                        rx,
                    ))
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }))
}

#[async_trait::async_trait]
impl HubStore for JsonFileStore {
    async fn users(&self) -> Result<Vec<User>, HubError> {
        Ok(self.inner.document.lock().expect("store mutex poisoned").users.clone())
    }

    async fn user_changes(&self) -> Result<ChangeStream<User>, HubError> {
        Ok(feed(self.inner.users_tx.subscribe()))
    }

    async fn members(&self) -> Result<Vec<Member>, HubError> {
        Ok(self.inner.document.lock().expect("store mutex poisoned").members.clone())
    }

    async fn member_changes(&self) -> Result<ChangeStream<Member>, HubError> {
        Ok(feed(self.inner.members_tx.subscribe()))
    }

    async fn devices(&self) -> Result<Vec<DeviceRecord>, HubError> {
        Ok(self.inner.document.lock().expect("store mutex poisoned").devices.clone())
    }

    async fn device_changes(&self) -> Result<ChangeStream<DeviceRecord>, HubError> {
        Ok(feed(self.inner.devices_tx.subscribe()))
    }
}

use crate::{
    errors::{MetadataError, Result},
    store::{KeyValueVersion, MetaOptions, MetadataStore},
    watch::{WatchEvent, WatchStream},
};

use async_trait::async_trait;
use dashmap::{mapref::one::RefMut, DashMap};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, trace};

const WATCH_CHANNEL_CAPACITY: usize = 256;

/// MemoryStore is a simple in-memory key-value store that implements the MetadataStore trait.
///
/// Keys are grouped by their first two path segments (`/loadbalance/brokers`), each group
/// is a BTreeMap so the prefix reads come back ordered. Leases never expire on their own,
/// they are only removed by `revoke_lease`, which is how tests simulate a broker disconnect.
/// Used for tests and single broker deployments.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<DashMap<String, BTreeMap<String, Value>>>,
    watchers: Arc<Mutex<Vec<(String, broadcast::Sender<WatchEvent>)>>>,
    leases: Arc<DashMap<i64, HashSet<String>>>,
    next_lease_id: Arc<AtomicI64>,
    #[cfg(any(test, feature = "test-util"))]
    faults: Arc<Mutex<Faults>>,
}

// Failures injected by tests, matched on the path prefix.
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Default)]
struct Faults {
    // prefix -> writes still let through before failing
    writes: Vec<(String, usize)>,
    reads: Vec<String>,
}

impl MemoryStore {
    pub async fn new() -> Result<Self> {
        Ok(MemoryStore {
            inner: Arc::new(DashMap::new()),
            watchers: Arc::new(Mutex::new(Vec::new())),
            leases: Arc::new(DashMap::new()),
            next_lease_id: Arc::new(AtomicI64::new(1)),
            #[cfg(any(test, feature = "test-util"))]
            faults: Arc::default(),
        })
    }

    /// Lets `successes` more writes under `prefix` through, then fails every write under it
    /// with a storage error until `clear_faults` is called.
    #[cfg(any(test, feature = "test-util"))]
    pub fn fail_writes_under(&self, prefix: &str, successes: usize) {
        self.faults().writes.push((prefix.to_owned(), successes));
    }

    /// Fails every read under `prefix` until `clear_faults` is called.
    #[cfg(any(test, feature = "test-util"))]
    pub fn fail_reads_under(&self, prefix: &str) {
        self.faults().reads.push(prefix.to_owned());
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn clear_faults(&self) {
        *self.faults() = Faults::default();
    }

    #[cfg(any(test, feature = "test-util"))]
    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        match self.faults.lock() {
            Ok(faults) => faults,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    #[cfg(any(test, feature = "test-util"))]
    fn check_write(&self, path: &str) -> Result<()> {
        let mut faults = self.faults();
        for (prefix, successes) in faults.writes.iter_mut() {
            if !path.starts_with(prefix.as_str()) {
                continue;
            }
            if *successes == 0 {
                return Err(injected_failure("write", path));
            }
            *successes -= 1;
        }
        Ok(())
    }

    #[cfg(any(test, feature = "test-util"))]
    fn check_read(&self, path: &str) -> Result<()> {
        let faults = self.faults();
        if faults.reads.iter().any(|prefix| path.starts_with(prefix.as_str())) {
            return Err(injected_failure("read", path));
        }
        Ok(())
    }

    #[cfg(not(any(test, feature = "test-util")))]
    fn check_write(&self, _path: &str) -> Result<()> {
        Ok(())
    }

    #[cfg(not(any(test, feature = "test-util")))]
    fn check_read(&self, _path: &str) -> Result<()> {
        Ok(())
    }

    // "/loadbalance/brokers/broker-1" -> ("/loadbalance/brokers", "broker-1")
    fn split_path(path: &str) -> Result<(String, String)> {
        let parts: Vec<&str> = path.split('/').collect();

        if parts.len() < 3 || !parts[0].is_empty() {
            return Err(MetadataError::InvalidArguments(format!(
                "Path must have at least 2 segments: {}",
                path
            )));
        }

        let map_key = parts[..3].join("/");
        let key = parts[3..].join("/");
        Ok((map_key, key))
    }

    fn get_map(&self, map_key: &str) -> RefMut<'_, String, BTreeMap<String, Value>> {
        self.inner.entry(map_key.to_owned()).or_default()
    }

    fn notify_watchers(&self, event: WatchEvent) {
        let key_str = String::from_utf8_lossy(event.key()).to_string();
        let mut watchers = match self.watchers.lock() {
            Ok(watchers) => watchers,
            Err(poisoned) => poisoned.into_inner(),
        };

        // drop the channels nobody listens to anymore
        watchers.retain(|(_, sender)| sender.receiver_count() > 0);

        for (prefix, sender) in watchers.iter() {
            if key_str.starts_with(prefix.as_str()) {
                let _ = sender.send(event.clone());
            }
        }
    }

    fn insert(&self, path: &str, value: Value) -> Result<()> {
        let (map_key, key) = Self::split_path(path)?;

        // Validate that there's actually a key to store
        if key.is_empty() {
            return Err(MetadataError::InvalidArguments(format!(
                "Path must have a key component: {}",
                path
            )));
        }

        let value_bytes = serde_json::to_vec(&value)?;
        self.get_map(&map_key).insert(key, value);

        self.notify_watchers(WatchEvent::Put {
            key: path.as_bytes().to_vec(),
            value: value_bytes,
            mod_revision: None,
            version: None,
        });

        Ok(())
    }

    fn attach_to_lease(&self, path: &str, lease_id: i64) -> Result<()> {
        match self.leases.get_mut(&lease_id) {
            Some(mut keys) => {
                keys.insert(path.to_owned());
                Ok(())
            }
            None => Err(MetadataError::LeaseNotFound(lease_id)),
        }
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    // Read the value of one key, identified by the path
    async fn get(&self, path: &str, _get_options: MetaOptions) -> Result<Option<Value>> {
        self.check_read(path)?;
        let (map_key, key) = Self::split_path(path)?;

        match self.inner.get(&map_key) {
            Some(bmap) => Ok(bmap.get(&key).cloned()),
            None => Ok(None),
        }
    }

    // Return all the paths that are children to the specific path.
    // Returns full paths to match ETCD behavior
    async fn get_childrens(&self, path: &str) -> Result<Vec<String>> {
        self.check_read(path)?;
        let (map_key, minimum_path) = Self::split_path(path.trim_end_matches('/'))?;

        let mut child_paths = Vec::new();

        if let Some(bmap) = self.inner.get(&map_key) {
            for key in bmap.keys() {
                let is_child = minimum_path.is_empty()
                    || (key.len() > minimum_path.len()
                        && key.starts_with(&minimum_path)
                        && key.as_bytes()[minimum_path.len()] == b'/');
                if is_child {
                    child_paths.push(format!("{}/{}", map_key, key));
                }
            }
        }
        Ok(child_paths)
    }

    // Put a new value for a given key
    async fn put(&self, path: &str, value: Value, _put_options: MetaOptions) -> Result<()> {
        self.check_write(path)?;
        self.insert(path, value)
    }

    // Delete the key / value from the store
    async fn delete(&self, path: &str) -> Result<()> {
        self.check_write(path)?;
        let (map_key, key) = Self::split_path(path)?;

        if key.is_empty() {
            return Err(MetadataError::InvalidArguments(format!(
                "Path must have a key component: {}",
                path
            )));
        }

        let removed = self.get_map(&map_key).remove(&key);

        if removed.is_some() {
            self.notify_watchers(WatchEvent::Delete {
                key: path.as_bytes().to_vec(),
                mod_revision: None,
                version: None,
            });
        }

        Ok(())
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream> {
        let (tx, rx) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        match self.watchers.lock() {
            Ok(mut watchers) => watchers.push((prefix.to_owned(), tx)),
            Err(poisoned) => poisoned.into_inner().push((prefix.to_owned(), tx)),
        }
        Ok(WatchStream::from_broadcast(rx))
    }

    /// Keys are returned as full paths, values as JSON-serialized bytes of the stored Value.
    async fn get_bulk(&self, prefix: &str) -> Result<Vec<KeyValueVersion>> {
        self.check_read(prefix)?;
        let (map_key, suffix) = Self::split_path(prefix)?;

        let mut out: Vec<KeyValueVersion> = Vec::new();
        if let Some(bmap) = self.inner.get(&map_key) {
            for (k, v) in bmap.iter().filter(|(k, _)| k.starts_with(&suffix)) {
                out.push(KeyValueVersion {
                    key: format!("{}/{}", map_key, k),
                    value: serde_json::to_vec(v)?,
                    version: 0, // in-memory backend doesn't track versions
                });
            }
        }
        Ok(out)
    }

    async fn create_lease(&self, _ttl: i64) -> Result<i64> {
        let lease_id = self.next_lease_id.fetch_add(1, Ordering::SeqCst);
        self.leases.insert(lease_id, HashSet::new());
        Ok(lease_id)
    }

    async fn keep_lease_alive(&self, lease_id: i64, role: &str) -> Result<()> {
        if self.leases.contains_key(&lease_id) {
            trace!("{}, lease {} kept alive", role, lease_id);
            Ok(())
        } else {
            Err(MetadataError::LeaseNotFound(lease_id))
        }
    }

    async fn revoke_lease(&self, lease_id: i64) -> Result<()> {
        let (_, keys) = self
            .leases
            .remove(&lease_id)
            .ok_or(MetadataError::LeaseNotFound(lease_id))?;

        debug!("lease {} revoked, removing {} keys", lease_id, keys.len());
        for key in keys {
            self.delete(&key).await?;
        }
        Ok(())
    }

    async fn put_with_lease(&self, path: &str, value: Value, lease_id: i64) -> Result<()> {
        self.check_write(path)?;
        self.attach_to_lease(path, lease_id)?;
        self.insert(path, value)
    }

    async fn create_if_absent(
        &self,
        path: &str,
        value: Value,
        lease_id: Option<i64>,
    ) -> Result<bool> {
        self.check_write(path)?;
        let (map_key, key) = Self::split_path(path)?;
        if key.is_empty() {
            return Err(MetadataError::InvalidArguments(format!(
                "Path must have a key component: {}",
                path
            )));
        }
        if let Some(lease_id) = lease_id {
            if !self.leases.contains_key(&lease_id) {
                return Err(MetadataError::LeaseNotFound(lease_id));
            }
        }

        let value_bytes = serde_json::to_vec(&value)?;
        {
            // the shard lock is held across the check and the insert
            let mut bmap = self.get_map(&map_key);
            if bmap.contains_key(&key) {
                return Ok(false);
            }
            bmap.insert(key, value);
        }

        if let Some(lease_id) = lease_id {
            self.attach_to_lease(path, lease_id)?;
        }

        self.notify_watchers(WatchEvent::Put {
            key: path.as_bytes().to_vec(),
            value: value_bytes,
            mod_revision: None,
            version: None,
        });
        Ok(true)
    }
}

#[cfg(any(test, feature = "test-util"))]
fn injected_failure(operation: &str, path: &str) -> MetadataError {
    MetadataError::StorageError(format!("injected {} failure on {}", operation, path).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_put_get_delete() -> Result<()> {
        let store = MemoryStore::new().await?;

        let value: Value = serde_json::from_str("{\"owner\": \"broker-1\"}").unwrap();
        let path = "/loadbalance/ownership/ns1/0x00-0xFF";

        store.put(path, value.clone(), MetaOptions::None).await?;

        let retrieved_value = store.get(path, MetaOptions::None).await?;
        assert_eq!(retrieved_value, Some(value));

        store.delete(path).await?;

        let result = store.get(path, MetaOptions::None).await;
        assert!(matches!(result, Ok(None)));

        Ok(())
    }

    #[tokio::test]
    async fn test_put_invalid_path() -> Result<()> {
        let store = MemoryStore::new().await?;
        let value = Value::String("value".to_string());

        // missing the key segment
        let result = store
            .put("/loadbalance/brokers", value.clone(), MetaOptions::None)
            .await;
        assert!(result.is_err());

        // not an absolute path
        let result = store
            .put("loadbalance/brokers/b1", value, MetaOptions::None)
            .await;
        assert!(result.is_err());

        Ok(())
    }

    #[tokio::test]
    async fn test_get_childrens() -> Result<()> {
        let store = MemoryStore::new().await?;

        for path in [
            "/loadbalance/ownership/ns1/0x00-0x7F",
            "/loadbalance/ownership/ns1/0x80-0xFF",
            "/loadbalance/ownership/ns10/0x00-0xFF",
            "/loadbalance/brokers/b1",
        ] {
            store
                .put(path, Value::String("v".to_string()), MetaOptions::None)
                .await?;
        }

        let paths = store.get_childrens("/loadbalance/ownership/ns1").await?;
        assert_eq!(paths.len(), 2);
        assert!(paths.contains(&"/loadbalance/ownership/ns1/0x00-0x7F".to_string()));
        assert!(paths.contains(&"/loadbalance/ownership/ns1/0x80-0xFF".to_string()));

        // the top level lists every key of the group
        let paths = store.get_childrens("/loadbalance/ownership").await?;
        assert_eq!(paths.len(), 3);

        let paths = store.get_childrens("/non/existent/path").await?;
        assert!(paths.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_get_bulk() -> Result<()> {
        let store = MemoryStore::new().await?;

        store
            .put(
                "/loadbalance/brokers/b1",
                serde_json::json!({"broker_id": "b1"}),
                MetaOptions::None,
            )
            .await?;
        store
            .put(
                "/loadbalance/brokers/b2",
                serde_json::json!({"broker_id": "b2"}),
                MetaOptions::None,
            )
            .await?;

        let kvs = store.get_bulk("/loadbalance/brokers/").await?;
        assert_eq!(kvs.len(), 2);
        assert_eq!(kvs[0].key, "/loadbalance/brokers/b1");
        assert_eq!(kvs[1].key, "/loadbalance/brokers/b2");

        let value: Value = serde_json::from_slice(&kvs[1].value).expect("valid json bytes");
        assert_eq!(value["broker_id"], "b2");

        Ok(())
    }

    #[tokio::test]
    async fn test_revoke_lease_removes_ephemeral_keys() -> Result<()> {
        let store = MemoryStore::new().await?;
        let lease = store.create_lease(10).await?;

        store
            .put_with_lease("/loadbalance/brokers/b1", Value::Null, lease)
            .await?;
        store
            .put("/loadbalance/brokers/b2", Value::Null, MetaOptions::None)
            .await?;
        store.keep_lease_alive(lease, "test").await?;

        store.revoke_lease(lease).await?;

        assert!(store
            .get("/loadbalance/brokers/b1", MetaOptions::None)
            .await?
            .is_none());
        assert!(store
            .get("/loadbalance/brokers/b2", MetaOptions::None)
            .await?
            .is_some());
        assert!(matches!(
            store.keep_lease_alive(lease, "test").await,
            Err(MetadataError::LeaseNotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_create_if_absent() -> Result<()> {
        let store = MemoryStore::new().await?;

        let first = store
            .create_if_absent("/loadbalance/leader/id", Value::from("b1"), None)
            .await?;
        let second = store
            .create_if_absent("/loadbalance/leader/id", Value::from("b2"), None)
            .await?;

        assert!(first);
        assert!(!second);
        assert_eq!(
            store.get("/loadbalance/leader/id", MetaOptions::None).await?,
            Some(Value::from("b1"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_watch_receives_put_and_delete() -> Result<()> {
        let store = MemoryStore::new().await?;
        let mut watch = store.watch("/loadbalance/ownership").await?;

        store
            .put("/loadbalance/ownership/ns1/a", Value::from("b1"), MetaOptions::None)
            .await?;
        store
            .put("/loadbalance/brokers/b1", Value::Null, MetaOptions::None)
            .await?;
        store.delete("/loadbalance/ownership/ns1/a").await?;

        let first = watch.next().await.expect("event").expect("no error");
        assert!(matches!(first, WatchEvent::Put { .. }));
        assert_eq!(first.key(), b"/loadbalance/ownership/ns1/a");

        // the broker key is outside the watched prefix
        let second = watch.next().await.expect("event").expect("no error");
        assert!(matches!(second, WatchEvent::Delete { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_injected_failures() -> Result<()> {
        let store = MemoryStore::new().await?;
        store.fail_writes_under("/loadbalance/ownership", 1);
        store.fail_reads_under("/loadbalance/namespaces");

        store
            .put("/loadbalance/ownership/ns1/a", Value::from("b1"), MetaOptions::None)
            .await?;
        let err = store
            .put("/loadbalance/ownership/ns1/a", Value::from("b2"), MetaOptions::None)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(store.delete("/loadbalance/ownership/ns1/a").await.is_err());

        // other prefixes are untouched
        store
            .put("/loadbalance/brokers/b1", Value::Null, MetaOptions::None)
            .await?;
        assert!(store.get_bulk("/loadbalance/namespaces/").await.is_err());
        assert_eq!(
            store.get("/loadbalance/ownership/ns1/a", MetaOptions::None).await?,
            Some(Value::from("b1"))
        );

        store.clear_faults();
        store
            .put("/loadbalance/ownership/ns1/a", Value::from("b2"), MetaOptions::None)
            .await?;
        assert!(store.get_bulk("/loadbalance/namespaces/").await?.is_empty());
        Ok(())
    }
}

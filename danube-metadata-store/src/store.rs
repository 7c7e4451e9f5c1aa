use async_trait::async_trait;
use etcd_client::{GetOptions as EtcdGetOptions, PutOptions as EtcdPutOptions};
use serde_json::Value;

use crate::{errors::Result, watch::WatchStream};

/// Backend specific options, ignored by the backends that don't understand them.
#[derive(Default)]
pub enum MetaOptions {
    #[default]
    None,
    EtcdGet(EtcdGetOptions),
    EtcdPut(EtcdPutOptions),
}

/// A key with its raw (JSON serialized) value, as returned by the bulk reads.
#[derive(Debug, Clone)]
pub struct KeyValueVersion {
    pub key: String,
    pub value: Vec<u8>,
    pub version: i64,
}

#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    // Read the value of one key, identified by the path
    async fn get(&self, key: &str, get_options: MetaOptions) -> Result<Option<Value>>;
    // Return all the paths that are children to the specific path.
    async fn get_childrens(&self, path: &str) -> Result<Vec<String>>;
    // Put a new value for a given key
    async fn put(&self, key: &str, value: Value, put_options: MetaOptions) -> Result<()>;
    // Delete the key / value from the store
    async fn delete(&self, key: &str) -> Result<()>;
    // Stream of changes for every key starting with prefix
    async fn watch(&self, prefix: &str) -> Result<WatchStream>;
    // All the keys with their values under the prefix, read in one request
    async fn get_bulk(&self, prefix: &str) -> Result<Vec<KeyValueVersion>>;

    /// Grant a lease, keys attached to it are removed once the lease expires or is revoked.
    async fn create_lease(&self, ttl: i64) -> Result<i64>;
    /// Refresh the lease once, `role` is only used for logging.
    async fn keep_lease_alive(&self, lease_id: i64, role: &str) -> Result<()>;
    /// Revoke the lease and delete all the keys attached to it.
    async fn revoke_lease(&self, lease_id: i64) -> Result<()>;
    /// Put a key that lives as long as the lease.
    async fn put_with_lease(&self, key: &str, value: Value, lease_id: i64) -> Result<()>;
    /// Create the key only if it doesn't exist yet. Returns true if the key was created.
    async fn create_if_absent(&self, key: &str, value: Value, lease_id: Option<i64>)
        -> Result<bool>;
}

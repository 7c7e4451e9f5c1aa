use danube_metadata_store::{MetaOptions, MetadataStorage, MetadataStore};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use crate::errors::Result;

mod broker;
mod bundle;
mod namespace;

pub(crate) use broker::BrokerResources;
pub(crate) use bundle::BundleResources;
pub(crate) use namespace::NamespaceResources;

// Every broker posts its LocalBrokerData on "/loadbalance/brokers/{broker_id}",
// the key is bound to the broker lease and goes away with the broker
pub(crate) static BASE_BROKERS_PATH: &str = "/loadbalance/brokers";

// Aggregated bundle statistics, written by the leader "/loadbalance/bundle-data/{bundle}"
pub(crate) static BASE_BUNDLE_DATA_PATH: &str = "/loadbalance/bundle-data";

// The owner of each bundle "/loadbalance/ownership/{bundle}", written by the leader
pub(crate) static BASE_OWNERSHIP_PATH: &str = "/loadbalance/ownership";

// The bundle topology of each namespace "/loadbalance/namespaces/{namespace}"
pub(crate) static BASE_NAMESPACES_PATH: &str = "/loadbalance/namespaces";

// Cluster leader broker_id, posted by the Leader Election service
pub(crate) static LEADER_ELECTION_PATH: &str = "/loadbalance/leader/current";

// Resources translate the load balancer reads and writes into Metadata Store paths.
//
// Separate starting paths keep the broker reports, the leader decisions and the topology
// apart, so each cycle reads every kind of data with a single prefix query.
#[derive(Debug, Clone)]
pub(crate) struct Resources {
    pub(crate) brokers: BrokerResources,
    pub(crate) bundles: BundleResources,
    pub(crate) namespaces: NamespaceResources,
}

impl Resources {
    pub(crate) fn new(store: MetadataStorage) -> Self {
        Resources {
            brokers: BrokerResources::new(store.clone()),
            bundles: BundleResources::new(store.clone()),
            namespaces: NamespaceResources::new(store),
        }
    }
}

pub(crate) async fn get_typed<T: DeserializeOwned>(
    store: &MetadataStorage,
    path: &str,
) -> Result<Option<T>> {
    match store.get(path, MetaOptions::None).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

pub(crate) async fn put_typed<T: Serialize>(
    store: &MetadataStorage,
    path: &str,
    data: &T,
) -> Result<()> {
    let value = serde_json::to_value(data)?;
    store.put(path, value, MetaOptions::None).await?;
    Ok(())
}

// Reads everything under the base path, keyed by the path relative to the base.
// A record that fails to deserialize fails the whole read, the caller never decides on a
// partial view of the cluster.
pub(crate) async fn get_all_typed<T: DeserializeOwned>(
    store: &MetadataStorage,
    base_path: &str,
) -> Result<BTreeMap<String, T>> {
    let prefix = format!("{}/", base_path.trim_end_matches('/'));
    let entries = store.get_bulk(&prefix).await?;

    let mut result = BTreeMap::new();
    for entry in entries {
        let Some(name) = entry.key.strip_prefix(&prefix) else {
            continue;
        };
        let data = serde_json::from_slice::<T>(&entry.value).inspect_err(|err| {
            warn!(key = %entry.key, "undecodable record: {}", err);
        })?;
        result.insert(name.to_owned(), data);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::LoadManagerError;
    use crate::load_data::BundleOwnership;
    use danube_metadata_store::MemoryStore;

    #[tokio::test]
    async fn undecodable_record_fails_the_read() {
        let store = MetadataStorage::InMemory(MemoryStore::new().await.unwrap());
        let ownership = BundleOwnership::assigned("broker-a", 0);
        put_typed(&store, "/loadbalance/ownership/ns1/0x00-0x7F", &ownership)
            .await
            .unwrap();

        let all: BTreeMap<String, BundleOwnership> =
            get_all_typed(&store, BASE_OWNERSHIP_PATH).await.unwrap();
        assert_eq!(all["ns1/0x00-0x7F"], ownership);

        store
            .put(
                "/loadbalance/ownership/ns1/0x80-0xFF",
                serde_json::json!({"owner": 42}),
                MetaOptions::None,
            )
            .await
            .unwrap();

        let err = get_all_typed::<BundleOwnership>(&store, BASE_OWNERSHIP_PATH)
            .await
            .unwrap_err();
        assert!(matches!(err, LoadManagerError::Serialization(_)));
    }
}

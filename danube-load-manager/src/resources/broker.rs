use danube_metadata_store::{MetadataStorage, MetadataStore};
use std::collections::BTreeMap;

use crate::{
    errors::Result,
    load_data::LocalBrokerData,
    resources::{get_all_typed, get_typed, BASE_BROKERS_PATH},
    utils::join_path,
};

#[derive(Debug, Clone)]
pub(crate) struct BrokerResources {
    store: MetadataStorage,
}

impl BrokerResources {
    pub(crate) fn new(store: MetadataStorage) -> Self {
        BrokerResources { store }
    }

    /// Publishes the broker data as an ephemeral key, bound to the broker lease.
    pub(crate) async fn put_broker_data(&self, data: &LocalBrokerData, lease_id: i64) -> Result<()> {
        let path = join_path(&[BASE_BROKERS_PATH, &data.broker_id]);
        let value = serde_json::to_value(data)?;
        self.store.put_with_lease(&path, value, lease_id).await?;
        Ok(())
    }

    pub(crate) async fn get_broker_data(&self, broker_id: &str) -> Result<Option<LocalBrokerData>> {
        let path = join_path(&[BASE_BROKERS_PATH, broker_id]);
        get_typed(&self.store, &path).await
    }

    pub(crate) async fn get_all_brokers(&self) -> Result<BTreeMap<String, LocalBrokerData>> {
        get_all_typed(&self.store, BASE_BROKERS_PATH).await
    }

    pub(crate) async fn delete_broker_data(&self, broker_id: &str) -> Result<()> {
        let path = join_path(&[BASE_BROKERS_PATH, broker_id]);
        self.store.delete(&path).await?;
        Ok(())
    }
}

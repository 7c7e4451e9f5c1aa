use danube_metadata_store::{MetadataStorage, MetadataStore};
use std::collections::BTreeMap;

use crate::{
    errors::Result,
    load_data::{BundleData, BundleOwnership},
    resources::{get_all_typed, get_typed, put_typed, BASE_BUNDLE_DATA_PATH, BASE_OWNERSHIP_PATH},
    utils::join_path,
};

// Ownership and aggregated statistics of the bundles, both written only by the leader.
#[derive(Debug, Clone)]
pub(crate) struct BundleResources {
    store: MetadataStorage,
}

impl BundleResources {
    pub(crate) fn new(store: MetadataStorage) -> Self {
        BundleResources { store }
    }

    pub(crate) async fn get_ownership(&self, bundle: &str) -> Result<Option<BundleOwnership>> {
        let path = join_path(&[BASE_OWNERSHIP_PATH, bundle]);
        get_typed(&self.store, &path).await
    }

    pub(crate) async fn set_ownership(
        &self,
        bundle: &str,
        ownership: &BundleOwnership,
    ) -> Result<()> {
        let path = join_path(&[BASE_OWNERSHIP_PATH, bundle]);
        put_typed(&self.store, &path, ownership).await
    }

    pub(crate) async fn delete_ownership(&self, bundle: &str) -> Result<()> {
        let path = join_path(&[BASE_OWNERSHIP_PATH, bundle]);
        self.store.delete(&path).await?;
        Ok(())
    }

    pub(crate) async fn get_all_ownership(&self) -> Result<BTreeMap<String, BundleOwnership>> {
        get_all_typed(&self.store, BASE_OWNERSHIP_PATH).await
    }

    pub(crate) async fn put_bundle_data(&self, bundle: &str, data: &BundleData) -> Result<()> {
        let path = join_path(&[BASE_BUNDLE_DATA_PATH, bundle]);
        put_typed(&self.store, &path, data).await
    }

    pub(crate) async fn delete_bundle_data(&self, bundle: &str) -> Result<()> {
        let path = join_path(&[BASE_BUNDLE_DATA_PATH, bundle]);
        self.store.delete(&path).await?;
        Ok(())
    }

    pub(crate) async fn get_all_bundle_data(&self) -> Result<BTreeMap<String, BundleData>> {
        get_all_typed(&self.store, BASE_BUNDLE_DATA_PATH).await
    }
}

use danube_metadata_store::{MetadataStorage, MetadataStore};
use std::collections::BTreeMap;

use crate::{
    errors::Result,
    load_data::NamespaceBundles,
    resources::{get_all_typed, get_typed, put_typed, BASE_NAMESPACES_PATH},
    utils::join_path,
};

// The whole bundle topology of a namespace is a single document, replacing a parent
// bundle by its children is then one write.
#[derive(Debug, Clone)]
pub(crate) struct NamespaceResources {
    store: MetadataStorage,
}

impl NamespaceResources {
    pub(crate) fn new(store: MetadataStorage) -> Self {
        NamespaceResources { store }
    }

    pub(crate) async fn get_namespace_bundles(
        &self,
        namespace: &str,
    ) -> Result<Option<NamespaceBundles>> {
        let path = join_path(&[BASE_NAMESPACES_PATH, namespace]);
        get_typed(&self.store, &path).await
    }

    pub(crate) async fn put_namespace_bundles(&self, bundles: &NamespaceBundles) -> Result<()> {
        let path = join_path(&[BASE_NAMESPACES_PATH, &bundles.namespace]);
        put_typed(&self.store, &path, bundles).await
    }

    /// Returns false if the namespace already exists.
    pub(crate) async fn create_namespace_bundles(&self, bundles: &NamespaceBundles) -> Result<bool> {
        let path = join_path(&[BASE_NAMESPACES_PATH, &bundles.namespace]);
        let value = serde_json::to_value(bundles)?;
        Ok(self.store.create_if_absent(&path, value, None).await?)
    }

    pub(crate) async fn get_all_namespaces(&self) -> Result<BTreeMap<String, NamespaceBundles>> {
        get_all_typed(&self.store, BASE_NAMESPACES_PATH).await
    }
}

mod broker_data;
mod bundle;
mod bundle_data;

pub use broker_data::{BrokerStatus, BundleStats, LocalBrokerData, ResourceUsage};
pub use bundle::{BundleOwnership, KeyRange, NamespaceBundle, NamespaceBundles};
pub use bundle_data::{BundleData, TimeAverageMessageData};

use std::collections::{BTreeMap, BTreeSet};

// LoadData is the view of the cluster the leader takes its decisions on.
//
// It is rebuilt every cycle from one read of the metadata store, the strategies only ever
// see this snapshot and never talk to the store themselves.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadData {
    /// broker_id -> the data the broker published about itself
    pub brokers: BTreeMap<String, LocalBrokerData>,
    /// bundle -> aggregated statistics
    pub bundles: BTreeMap<String, BundleData>,
    /// bundle -> current owner
    pub ownership: BTreeMap<String, BundleOwnership>,
    /// namespace -> bundle topology
    pub namespaces: BTreeMap<String, NamespaceBundles>,
    pub snapshot_ms: u64,
}

impl LoadData {
    pub fn new(snapshot_ms: u64) -> Self {
        LoadData {
            snapshot_ms,
            ..Default::default()
        }
    }

    pub fn available_brokers(&self) -> impl Iterator<Item = &LocalBrokerData> {
        self.brokers.values().filter(|broker| broker.is_available())
    }

    pub fn owner_of(&self, bundle: &str) -> Option<&str> {
        self.ownership.get(bundle)?.owner.as_deref()
    }

    /// Bundles waiting for placement, oldest transition first.
    pub fn unassigned_bundles(&self) -> Vec<(&str, &BundleOwnership)> {
        let mut unassigned: Vec<_> = self
            .ownership
            .iter()
            .filter(|(_, ownership)| ownership.owner.is_none())
            .map(|(bundle, ownership)| (bundle.as_str(), ownership))
            .collect();
        unassigned.sort_by_key(|(bundle, ownership)| (ownership.since_ms, *bundle));
        unassigned
    }

    /// Rebuilds the bundles of each broker from the ownership records, which run ahead of
    /// the broker reports within a cycle. A split child the broker didn't report yet gets
    /// half of the stats reported for its parent.
    pub fn align_broker_bundles(&mut self) {
        for broker in self.brokers.values_mut() {
            let owned: BTreeSet<String> = self
                .ownership
                .iter()
                .filter(|(_, ownership)| ownership.is_owned_by(&broker.broker_id))
                .map(|(bundle, _)| bundle.clone())
                .collect();

            for bundle in &owned {
                if broker.last_stats.contains_key(bundle) {
                    continue;
                }
                let inherited = self
                    .bundles
                    .get(bundle)
                    .and_then(|data| data.parent.as_ref())
                    .and_then(|parent| broker.last_stats.get(parent))
                    .map(BundleStats::halved);
                if let Some(stats) = inherited {
                    broker.last_stats.insert(bundle.clone(), stats);
                }
            }

            broker.last_stats.retain(|bundle, _| owned.contains(bundle));
            broker.bundles = owned;
        }
    }

    /// Samples the last stats reported by each broker into the aggregated bundle data.
    ///
    /// Every call adds one sample per bundle, stamped with the snapshot time: a registered
    /// broker stands by the stats it published last, even when the noise filter kept it from
    /// publishing again. Only the bundles the ownership records give to the broker count.
    pub fn update_bundle_data(&mut self, short_term_samples: u32, long_term_samples: u32) {
        for broker in self.brokers.values() {
            for (bundle, stats) in &broker.last_stats {
                let owned = self
                    .ownership
                    .get(bundle)
                    .is_some_and(|ownership| ownership.is_owned_by(&broker.broker_id));
                if !owned {
                    continue;
                }

                self.bundles
                    .entry(bundle.clone())
                    .or_insert_with(|| BundleData::new(short_term_samples, long_term_samples))
                    .update(stats, self.snapshot_ms);
            }
        }
    }
}

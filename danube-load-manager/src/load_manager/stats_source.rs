use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::load_data::{BundleStats, ResourceUsage};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SystemResourceUsage {
    pub cpu: ResourceUsage,
    pub memory: ResourceUsage,
    pub bandwidth_in: ResourceUsage,
    pub bandwidth_out: ResourceUsage,
}

/// Where the load manager reads the current load of its own broker from.
///
/// Both calls are made once per cycle and must not block: the broker keeps these
/// numbers up to date on its own and the load manager only samples them.
pub trait BrokerStatsSource: Send + Sync + 'static {
    fn system_resource_usage(&self) -> SystemResourceUsage;

    /// Traffic per bundle id, for the bundles served by the broker.
    fn bundle_stats(&self) -> BTreeMap<String, BundleStats>;
}

// Stats pushed in by the owner of the broker process, the load manager samples
// whatever was set last.
#[derive(Debug, Clone, Default)]
pub struct StaticStatsSource {
    inner: Arc<Mutex<(SystemResourceUsage, BTreeMap<String, BundleStats>)>>,
}

impl StaticStatsSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_resource_usage(&self, usage: SystemResourceUsage) {
        self.lock().0 = usage;
    }

    /// Shortcut setting the cpu to `percent` of 100, the rest to zero.
    pub fn set_load(&self, percent: f64) {
        self.set_resource_usage(SystemResourceUsage {
            cpu: ResourceUsage::new(percent, 100.0),
            ..Default::default()
        });
    }

    pub fn set_bundle_stats(&self, bundle: &str, stats: BundleStats) {
        self.lock().1.insert(bundle.to_owned(), stats);
    }

    pub fn remove_bundle_stats(&self, bundle: &str) {
        self.lock().1.remove(bundle);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, (SystemResourceUsage, BTreeMap<String, BundleStats>)> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl BrokerStatsSource for StaticStatsSource {
    fn system_resource_usage(&self) -> SystemResourceUsage {
        self.lock().0
    }

    fn bundle_stats(&self) -> BTreeMap<String, BundleStats> {
        self.lock().1.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_source_returns_what_was_set() {
        let source = StaticStatsSource::new();
        source.set_load(40.0);
        source.set_bundle_stats(
            "ns1/0x00-0xFF",
            BundleStats {
                msg_rate_in: 10.0,
                ..Default::default()
            },
        );

        // clones share the same numbers
        let sampled: Box<dyn BrokerStatsSource> = Box::new(source.clone());
        assert_eq!(sampled.system_resource_usage().cpu.percent_usage(), 40.0);
        assert_eq!(sampled.bundle_stats()["ns1/0x00-0xFF"].msg_rate_in, 10.0);

        source.remove_bundle_stats("ns1/0x00-0xFF");
        assert!(sampled.bundle_stats().is_empty());
    }
}

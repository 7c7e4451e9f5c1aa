use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::broker_metrics::{
    LB_BROKER_BUNDLES, LB_BROKER_DATA_WRITES_TOTAL, LB_BROKER_LOAD, LB_BUNDLES_ASSIGNED_TOTAL,
    LB_BUNDLES_RECLAIMED_TOTAL, LB_BUNDLES_SHED_TOTAL, LB_BUNDLES_SPLIT_TOTAL, LB_BUNDLE_SPLITS_SKIPPED_TOTAL,
    LB_CYCLES_TOTAL, LB_CYCLE_DURATION, LB_CYCLE_FAILURES_TOTAL, LB_IS_LEADER,
    LB_UNASSIGNED_BUNDLES, LB_UNASSIGNED_BUNDLES_STUCK,
};
use crate::load_data::LoadData;

/// A named measurement, as handed to the external reporting pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadBalancingMetric {
    pub name: String,
    pub dimensions: BTreeMap<String, String>,
    pub value: f64,
}

impl LoadBalancingMetric {
    fn new(name: &str, value: f64) -> Self {
        LoadBalancingMetric {
            name: name.to_owned(),
            dimensions: BTreeMap::new(),
            value,
        }
    }

    fn with_dimension(mut self, key: &str, value: &str) -> Self {
        self.dimensions.insert(key.to_owned(), value.to_owned());
        self
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub leader: bool,
    pub broker_data_written: bool,
    pub bundles_split: u64,
    pub splits_skipped: u64,
    pub bundles_shed: u64,
    /// bundles whose owner left the cluster, back to unassigned
    pub bundles_reclaimed: u64,
    pub bundles_assigned: u64,
    /// bundles still without owner when the cycle ended
    pub bundles_unassigned: u64,
    /// the unassigned ones waiting for longer than the alert threshold
    pub unassigned_stuck: u64,
    pub bundle_data_written: u64,
}

// Numbers kept between cycles, refreshed at the end of every cycle.
#[derive(Debug, Default)]
pub(crate) struct LoadBalancingStats {
    last_cycle: CycleSummary,
    cycles: u64,
    failed_cycles: u64,
    // broker_id -> (load, owned bundles), from the last leader snapshot
    broker_loads: BTreeMap<String, (f64, usize)>,
}

impl LoadBalancingStats {
    pub(crate) fn record_cycle(&mut self, summary: CycleSummary, duration: Duration) {
        self.last_cycle = summary;
        self.cycles += 1;

        metrics::counter!(LB_CYCLES_TOTAL.name).increment(1);
        metrics::histogram!(LB_CYCLE_DURATION.name).record(duration.as_secs_f64());
        metrics::gauge!(LB_IS_LEADER.name).set(if summary.leader { 1.0 } else { 0.0 });
        if summary.broker_data_written {
            metrics::counter!(LB_BROKER_DATA_WRITES_TOTAL.name).increment(1);
        }
        if summary.leader {
            metrics::counter!(LB_BUNDLES_SPLIT_TOTAL.name).increment(summary.bundles_split);
            metrics::counter!(LB_BUNDLE_SPLITS_SKIPPED_TOTAL.name)
                .increment(summary.splits_skipped);
            metrics::counter!(LB_BUNDLES_SHED_TOTAL.name).increment(summary.bundles_shed);
            metrics::counter!(LB_BUNDLES_RECLAIMED_TOTAL.name)
                .increment(summary.bundles_reclaimed);
            metrics::counter!(LB_BUNDLES_ASSIGNED_TOTAL.name).increment(summary.bundles_assigned);
            metrics::gauge!(LB_UNASSIGNED_BUNDLES.name).set(summary.bundles_unassigned as f64);
            metrics::gauge!(LB_UNASSIGNED_BUNDLES_STUCK.name).set(summary.unassigned_stuck as f64);
        }
    }

    pub(crate) fn record_failure(&mut self) {
        self.cycles += 1;
        self.failed_cycles += 1;
        metrics::counter!(LB_CYCLES_TOTAL.name).increment(1);
        metrics::counter!(LB_CYCLE_FAILURES_TOTAL.name).increment(1);
    }

    pub(crate) fn record_snapshot(&mut self, load_data: &LoadData) {
        let mut owned: BTreeMap<&str, usize> = BTreeMap::new();
        for owner in load_data.ownership.values().filter_map(|o| o.owner.as_deref()) {
            *owned.entry(owner).or_default() += 1;
        }

        self.broker_loads = load_data
            .brokers
            .values()
            .map(|broker| {
                let bundles = owned.get(broker.broker_id.as_str()).copied().unwrap_or(0);
                (broker.broker_id.clone(), (broker.max_resource_usage(), bundles))
            })
            .collect();

        for (broker_id, (load, bundles)) in &self.broker_loads {
            metrics::gauge!(LB_BROKER_LOAD.name, "broker" => broker_id.clone()).set(*load);
            metrics::gauge!(LB_BROKER_BUNDLES.name, "broker" => broker_id.clone())
                .set(*bundles as f64);
        }
    }

    pub(crate) fn last_cycle(&self) -> CycleSummary {
        self.last_cycle
    }

    pub(crate) fn to_metrics(&self, broker_id: &str, is_leader: bool) -> Vec<LoadBalancingMetric> {
        let summary = &self.last_cycle;
        let per_cycle = [
            ("bundles_split", summary.bundles_split),
            ("bundle_splits_skipped", summary.splits_skipped),
            ("bundles_shed", summary.bundles_shed),
            ("bundles_reclaimed", summary.bundles_reclaimed),
            ("bundles_assigned", summary.bundles_assigned),
            ("bundles_unassigned", summary.bundles_unassigned),
            ("unassigned_bundles_stuck", summary.unassigned_stuck),
            ("bundle_data_written", summary.bundle_data_written),
            ("cycles_total", self.cycles),
            ("cycle_failures_total", self.failed_cycles),
        ];

        let mut metrics: Vec<LoadBalancingMetric> = per_cycle
            .into_iter()
            .map(|(name, value)| {
                LoadBalancingMetric::new(name, value as f64).with_dimension("broker", broker_id)
            })
            .collect();

        metrics.push(
            LoadBalancingMetric::new("is_leader", if is_leader { 1.0 } else { 0.0 })
                .with_dimension("broker", broker_id),
        );

        for (broker, (load, bundles)) in &self.broker_loads {
            metrics.push(
                LoadBalancingMetric::new("broker_load_percentage", *load)
                    .with_dimension("broker", broker),
            );
            metrics.push(
                LoadBalancingMetric::new("broker_bundles", *bundles as f64)
                    .with_dimension("broker", broker),
            );
        }

        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_data::{BundleOwnership, LocalBrokerData, ResourceUsage};

    fn find<'a>(metrics: &'a [LoadBalancingMetric], name: &str, broker: &str) -> Option<&'a LoadBalancingMetric> {
        metrics
            .iter()
            .find(|m| m.name == name && m.dimensions.get("broker").map(String::as_str) == Some(broker))
    }

    #[test]
    fn metrics_report_the_last_cycle_and_broker_loads() {
        let mut stats = LoadBalancingStats::default();
        stats.record_cycle(
            CycleSummary {
                leader: true,
                bundles_split: 2,
                bundles_shed: 1,
                ..Default::default()
            },
            Duration::from_millis(5),
        );
        stats.record_failure();

        let mut load_data = LoadData::new(0);
        let mut broker = LocalBrokerData::new("broker-a");
        broker.cpu = ResourceUsage::new(42.0, 100.0);
        load_data.brokers.insert("broker-a".to_string(), broker);
        load_data.ownership.insert(
            "ns1/0x00-0xFF".to_string(),
            BundleOwnership::assigned("broker-a", 0),
        );
        stats.record_snapshot(&load_data);

        let metrics = stats.to_metrics("broker-a", true);

        assert_eq!(find(&metrics, "bundles_split", "broker-a").unwrap().value, 2.0);
        assert_eq!(find(&metrics, "bundles_shed", "broker-a").unwrap().value, 1.0);
        assert_eq!(find(&metrics, "cycles_total", "broker-a").unwrap().value, 2.0);
        assert_eq!(find(&metrics, "cycle_failures_total", "broker-a").unwrap().value, 1.0);
        assert_eq!(find(&metrics, "is_leader", "broker-a").unwrap().value, 1.0);
        assert_eq!(find(&metrics, "broker_load_percentage", "broker-a").unwrap().value, 42.0);
        assert_eq!(find(&metrics, "broker_bundles", "broker-a").unwrap().value, 1.0);
    }
}

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerStatus {
    #[default]
    Active,
    /// excluded from new assignments, keeps the bundles it owns
    Disabled,
    /// excluded from new assignments, on its way out of the cluster
    Draining,
}

impl fmt::Display for BrokerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            BrokerStatus::Active => "active",
            BrokerStatus::Disabled => "disabled",
            BrokerStatus::Draining => "draining",
        };
        f.write_str(status)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub usage: f64,
    pub limit: f64,
}

impl ResourceUsage {
    pub fn new(usage: f64, limit: f64) -> Self {
        ResourceUsage { usage, limit }
    }

    /// Usage as a percentage of the limit, 0 when there is no limit.
    pub fn percent_usage(&self) -> f64 {
        if self.limit > 0.0 {
            self.usage / self.limit * 100.0
        } else {
            0.0
        }
    }
}

/// Instantaneous traffic of one bundle, as observed by the broker owning it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BundleStats {
    pub msg_rate_in: f64,
    pub msg_rate_out: f64,
    /// bytes/s
    pub msg_throughput_in: f64,
    /// bytes/s
    pub msg_throughput_out: f64,
    pub topics: u64,
    pub producer_count: u64,
    pub consumer_count: u64,
}

impl BundleStats {
    pub fn sessions(&self) -> u64 {
        self.producer_count + self.consumer_count
    }

    pub fn total_msg_rate(&self) -> f64 {
        self.msg_rate_in + self.msg_rate_out
    }

    pub fn total_throughput(&self) -> f64 {
        self.msg_throughput_in + self.msg_throughput_out
    }

    /// The share of one of the two children when the bundle is split.
    pub fn halved(&self) -> BundleStats {
        BundleStats {
            msg_rate_in: self.msg_rate_in / 2.0,
            msg_rate_out: self.msg_rate_out / 2.0,
            msg_throughput_in: self.msg_throughput_in / 2.0,
            msg_throughput_out: self.msg_throughput_out / 2.0,
            topics: self.topics.div_ceil(2),
            producer_count: self.producer_count.div_ceil(2),
            consumer_count: self.consumer_count.div_ceil(2),
        }
    }
}

/// The snapshot a broker publishes about itself at `/loadbalance/brokers/{broker_id}`.
/// Only the broker it describes ever writes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalBrokerData {
    pub broker_id: String,
    pub status: BrokerStatus,
    /// bundles owned by the broker when the snapshot was taken
    pub bundles: BTreeSet<String>,
    pub cpu: ResourceUsage,
    pub memory: ResourceUsage,
    pub bandwidth_in: ResourceUsage,
    pub bandwidth_out: ResourceUsage,
    pub msg_rate_in: f64,
    pub msg_rate_out: f64,
    pub msg_throughput_in: f64,
    pub msg_throughput_out: f64,
    pub last_stats: BTreeMap<String, BundleStats>,
    pub last_update_ms: u64,
}

impl LocalBrokerData {
    pub fn new(broker_id: &str) -> Self {
        LocalBrokerData {
            broker_id: broker_id.to_owned(),
            status: BrokerStatus::Active,
            bundles: BTreeSet::new(),
            cpu: ResourceUsage::default(),
            memory: ResourceUsage::default(),
            bandwidth_in: ResourceUsage::default(),
            bandwidth_out: ResourceUsage::default(),
            msg_rate_in: 0.0,
            msg_rate_out: 0.0,
            msg_throughput_in: 0.0,
            msg_throughput_out: 0.0,
            last_stats: BTreeMap::new(),
            last_update_ms: 0,
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == BrokerStatus::Active
    }

    /// Replaces the per bundle stats and recomputes the broker totals from them.
    /// Stats of bundles the broker doesn't own are dropped.
    pub fn update_bundle_stats(&mut self, stats: BTreeMap<String, BundleStats>) {
        self.last_stats = stats
            .into_iter()
            .filter(|(bundle, _)| self.bundles.contains(bundle))
            .collect();

        let totals = self
            .last_stats
            .values()
            .fold(BundleStats::default(), |mut acc, s| {
                acc.msg_rate_in += s.msg_rate_in;
                acc.msg_rate_out += s.msg_rate_out;
                acc.msg_throughput_in += s.msg_throughput_in;
                acc.msg_throughput_out += s.msg_throughput_out;
                acc
            });

        self.msg_rate_in = totals.msg_rate_in;
        self.msg_rate_out = totals.msg_rate_out;
        self.msg_throughput_in = totals.msg_throughput_in;
        self.msg_throughput_out = totals.msg_throughput_out;
    }

    /// The broker aggregate load: the most used of its resources, in percent.
    pub fn max_resource_usage(&self) -> f64 {
        [self.cpu, self.memory, self.bandwidth_in, self.bandwidth_out]
            .iter()
            .map(ResourceUsage::percent_usage)
            .fold(0.0, f64::max)
    }

    /// The largest relative change, in percent, between this snapshot and `previous`.
    pub fn max_change_percentage(&self, previous: &LocalBrokerData) -> f64 {
        [
            (previous.max_resource_usage(), self.max_resource_usage()),
            (previous.msg_rate_in, self.msg_rate_in),
            (previous.msg_rate_out, self.msg_rate_out),
            (previous.msg_throughput_in, self.msg_throughput_in),
            (previous.msg_throughput_out, self.msg_throughput_out),
            (previous.bundles.len() as f64, self.bundles.len() as f64),
        ]
        .into_iter()
        .map(|(old, new)| percent_change(old, new))
        .fold(0.0, f64::max)
    }

    /// Share of the broker traffic carried by the bundle, in `[0, 1]`.
    /// Throughput first, message rate if the broker reports no throughput,
    /// an equal share if it reports no traffic at all.
    pub fn bundle_share(&self, bundle: &str) -> f64 {
        let total_throughput = self.msg_throughput_in + self.msg_throughput_out;
        let total_rate = self.msg_rate_in + self.msg_rate_out;
        let stats = self.last_stats.get(bundle).copied().unwrap_or_default();

        if total_throughput > 0.0 {
            stats.total_throughput() / total_throughput
        } else if total_rate > 0.0 {
            stats.total_msg_rate() / total_rate
        } else if self.bundles.contains(bundle) {
            1.0 / self.bundles.len() as f64
        } else {
            0.0
        }
    }
}

fn percent_change(old: f64, new: f64) -> f64 {
    if old == 0.0 {
        if new > 0.0 {
            f64::INFINITY
        } else {
            0.0
        }
    } else {
        100.0 * (new - old).abs() / old
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker_with_bundles(bundles: &[(&str, f64)]) -> LocalBrokerData {
        let mut broker = LocalBrokerData::new("broker-a");
        broker.bundles = bundles.iter().map(|(b, _)| b.to_string()).collect();
        broker.update_bundle_stats(
            bundles
                .iter()
                .map(|(b, throughput)| {
                    (
                        b.to_string(),
                        BundleStats {
                            msg_throughput_in: *throughput,
                            ..Default::default()
                        },
                    )
                })
                .collect(),
        );
        broker
    }

    #[test]
    fn max_resource_usage_takes_the_busiest_resource() {
        let mut broker = LocalBrokerData::new("broker-a");
        broker.cpu = ResourceUsage::new(40.0, 100.0);
        broker.memory = ResourceUsage::new(3.0, 4.0);
        broker.bandwidth_in = ResourceUsage::new(10.0, 0.0);

        assert_eq!(broker.max_resource_usage(), 75.0);
    }

    #[test]
    fn stats_of_foreign_bundles_are_dropped() {
        let mut broker = broker_with_bundles(&[("ns1/0x00-0x7F", 10.0)]);
        let mut stats = broker.last_stats.clone();
        stats.insert("ns1/0x80-0xFF".to_string(), BundleStats::default());

        broker.update_bundle_stats(stats);

        assert_eq!(broker.last_stats.len(), 1);
        assert_eq!(broker.msg_throughput_in, 10.0);
    }

    #[test]
    fn bundle_share_by_throughput() {
        let broker = broker_with_bundles(&[("ns1/0x00-0x7F", 50.0), ("ns1/0x80-0xFF", 150.0)]);

        assert_eq!(broker.bundle_share("ns1/0x00-0x7F"), 0.25);
        assert_eq!(broker.bundle_share("ns1/0x80-0xFF"), 0.75);
        assert_eq!(broker.bundle_share("ns2/0x00-0xFF"), 0.0);
    }

    #[test]
    fn bundle_share_without_traffic_is_equal() {
        let broker = broker_with_bundles(&[("ns1/0x00-0x7F", 0.0), ("ns1/0x80-0xFF", 0.0)]);
        assert_eq!(broker.bundle_share("ns1/0x00-0x7F"), 0.5);
    }

    #[test]
    fn max_change_percentage() {
        let mut previous = LocalBrokerData::new("broker-a");
        previous.cpu = ResourceUsage::new(50.0, 100.0);
        previous.msg_rate_in = 100.0;

        let mut current = previous.clone();
        assert_eq!(current.max_change_percentage(&previous), 0.0);

        current.msg_rate_in = 105.0;
        assert_eq!(current.max_change_percentage(&previous), 5.0);

        current.cpu = ResourceUsage::new(60.0, 100.0);
        assert!((current.max_change_percentage(&previous) - 20.0).abs() < 1e-9);

        current.msg_rate_out = 1.0;
        assert!(current.max_change_percentage(&previous).is_infinite());
    }
}

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, trace};

use super::LoadBalancerConfig;
use crate::load_data::{BundleData, LoadData};

/// Decides which bundles grew too large and must be split in two.
///
/// Implementations are pure functions of the snapshot: no I/O, no randomness,
/// the same snapshot always yields the same set.
pub trait BundleSplitStrategy {
    fn find_bundles_to_split(&self, load_data: &LoadData, conf: &LoadBalancerConfig)
        -> BTreeSet<String>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitStrategy {
    /// Split a bundle once any of topics, sessions, message rate or bandwidth
    /// crosses its configured maximum.
    #[default]
    Threshold,
}

impl BundleSplitStrategy for SplitStrategy {
    fn find_bundles_to_split(
        &self,
        load_data: &LoadData,
        conf: &LoadBalancerConfig,
    ) -> BTreeSet<String> {
        if !conf.auto_bundle_split_enabled {
            return BTreeSet::new();
        }

        match self {
            SplitStrategy::Threshold => threshold_split(load_data, conf),
        }
    }
}

fn threshold_split(load_data: &LoadData, conf: &LoadBalancerConfig) -> BTreeSet<String> {
    let stale_ms = conf.bundle_data_stale_seconds.saturating_mul(1000);
    let mut bundles_to_split = BTreeSet::new();

    for broker in load_data.brokers.values() {
        for bundle in &broker.bundles {
            let Some(data) = load_data.bundles.get(bundle) else {
                trace!(bundle = %bundle, "no bundle data, not considered for split");
                continue;
            };

            if load_data.snapshot_ms.saturating_sub(data.last_update_ms) > stale_ms {
                trace!(bundle = %bundle, "stale bundle data, not considered for split");
                continue;
            }

            if let Some(reason) = exceeded_threshold(data, conf) {
                debug!(
                    bundle = %bundle,
                    broker_id = %broker.broker_id,
                    reason,
                    "bundle qualifies for split"
                );
                bundles_to_split.insert(bundle.clone());
            }
        }
    }

    bundles_to_split
}

// the long term window, a short burst doesn't split a bundle
fn exceeded_threshold(data: &BundleData, conf: &LoadBalancerConfig) -> Option<&'static str> {
    if data.topics > conf.max_topics_per_bundle {
        Some("topics")
    } else if data.sessions > conf.max_sessions_per_bundle {
        Some("sessions")
    } else if data.long_term.total_msg_rate() > conf.max_msg_rate_per_bundle {
        Some("msg_rate")
    } else if data.long_term.total_throughput_mbytes() > conf.max_bandwidth_per_bundle_mbytes {
        Some("bandwidth")
    } else {
        None
    }
}

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::LoadBalancerConfig;
use crate::load_data::{LoadData, LocalBrokerData};

/// Decides which bundles must leave their overloaded brokers.
///
/// Returns bundle -> broker currently owning it. Pure over the snapshot.
pub trait LoadSheddingStrategy {
    fn find_bundles_for_unloading(
        &self,
        load_data: &LoadData,
        conf: &LoadBalancerConfig,
    ) -> BTreeMap<String, String>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SheddingStrategy {
    /// A broker is overloaded above the absolute `broker_overload_threshold_percentage`.
    #[default]
    Overload,
    /// A broker is overloaded above the cluster average load plus
    /// `threshold_shedder_offset_percentage`.
    Threshold,
}

// load limits applied to every broker of the cycle
#[derive(Debug, Clone, Copy)]
struct SheddingBounds {
    threshold: f64,
    target: f64,
}

impl SheddingStrategy {
    fn bounds(&self, load_data: &LoadData, conf: &LoadBalancerConfig) -> SheddingBounds {
        let threshold = match self {
            SheddingStrategy::Overload => conf.broker_overload_threshold_percentage,
            SheddingStrategy::Threshold => {
                let loads: Vec<f64> = load_data
                    .available_brokers()
                    .map(LocalBrokerData::max_resource_usage)
                    .collect();
                let avg = loads.iter().sum::<f64>() / loads.len().max(1) as f64;
                avg + conf.threshold_shedder_offset_percentage
            }
        };

        SheddingBounds {
            threshold,
            target: threshold - conf.shedding_margin_percentage,
        }
    }
}

impl LoadSheddingStrategy for SheddingStrategy {
    fn find_bundles_for_unloading(
        &self,
        load_data: &LoadData,
        conf: &LoadBalancerConfig,
    ) -> BTreeMap<String, String> {
        let mut result = BTreeMap::new();
        if !conf.load_shedding_enabled {
            return result;
        }

        let available = load_data.available_brokers().count();
        if available < conf.min_brokers_for_shedding {
            debug!(
                available,
                min_brokers = conf.min_brokers_for_shedding,
                "not enough available brokers, load shedding suppressed"
            );
            return result;
        }

        let bounds = self.bounds(load_data, conf);
        for broker in load_data.brokers.values() {
            let load = broker.max_resource_usage();
            if load <= bounds.threshold {
                continue;
            }

            match select_bundles(broker, load, bounds, load_data, conf) {
                Some(bundles) => {
                    info!(
                        broker_id = %broker.broker_id,
                        load,
                        threshold = bounds.threshold,
                        bundles = bundles.len(),
                        "broker overloaded, bundles selected for unloading"
                    );
                    for bundle in bundles {
                        result.insert(bundle, broker.broker_id.clone());
                    }
                }
                None => debug!(
                    broker_id = %broker.broker_id,
                    load,
                    target = bounds.target,
                    "broker overloaded, but no eligible bundle set brings it under target"
                ),
            }
        }

        result
    }
}

// Greedy: heaviest bundles first, ties by bundle id, until the projected load is strictly
// below target. The broker always keeps at least one bundle. None if the target can't be reached.
fn select_bundles(
    broker: &LocalBrokerData,
    load: f64,
    bounds: SheddingBounds,
    load_data: &LoadData,
    conf: &LoadBalancerConfig,
) -> Option<Vec<String>> {
    let cooldown_ms = conf.shedding_cooldown_seconds.saturating_mul(1000);

    let owned: Vec<&String> = broker
        .bundles
        .iter()
        .filter(|bundle| {
            load_data
                .ownership
                .get(*bundle)
                .is_some_and(|ownership| ownership.is_owned_by(&broker.broker_id))
        })
        .collect();

    let mut candidates: Vec<(&String, f64)> = owned
        .iter()
        .filter(|bundle| {
            let since_ms = load_data
                .ownership
                .get(**bundle)
                .map(|ownership| ownership.since_ms)
                .unwrap_or_default();
            load_data.snapshot_ms.saturating_sub(since_ms) >= cooldown_ms
        })
        .map(|bundle| (*bundle, load * broker.bundle_share(bundle)))
        .collect();
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    let mut projected = load;
    let mut remaining = owned.len();
    let mut selected = Vec::new();
    for (bundle, estimate) in candidates {
        if projected < bounds.target || remaining <= 1 {
            break;
        }
        selected.push(bundle.clone());
        projected -= estimate;
        remaining -= 1;
    }

    (projected < bounds.target).then_some(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_data::{BrokerStatus, BundleOwnership, BundleStats, ResourceUsage};

    const NOW: u64 = 10_000_000;

    fn conf() -> LoadBalancerConfig {
        LoadBalancerConfig {
            broker_overload_threshold_percentage: 80.0,
            shedding_margin_percentage: 10.0,
            shedding_cooldown_seconds: 60,
            ..Default::default()
        }
    }

    // bundles given with their share of the broker load, in percent points
    fn add_broker(load_data: &mut LoadData, broker_id: &str, load: f64, bundles: &[(&str, f64)]) {
        let mut broker = LocalBrokerData::new(broker_id);
        broker.cpu = ResourceUsage::new(load, 100.0);
        broker.bundles = bundles.iter().map(|(b, _)| b.to_string()).collect();
        broker.update_bundle_stats(
            bundles
                .iter()
                .map(|(bundle, bundle_load)| {
                    (
                        bundle.to_string(),
                        BundleStats {
                            msg_throughput_in: *bundle_load * 1000.0,
                            ..Default::default()
                        },
                    )
                })
                .collect(),
        );
        for (bundle, _) in bundles {
            load_data.ownership.insert(
                bundle.to_string(),
                BundleOwnership::assigned(broker_id, NOW - 3_600_000),
            );
        }
        load_data.brokers.insert(broker_id.to_string(), broker);
    }

    fn projected_load(load_data: &LoadData, broker_id: &str, shed: &BTreeMap<String, String>) -> f64 {
        let broker = &load_data.brokers[broker_id];
        let load = broker.max_resource_usage();
        shed.iter()
            .filter(|(_, owner)| owner.as_str() == broker_id)
            .map(|(bundle, _)| load * broker.bundle_share(bundle))
            .fold(load, |acc, estimate| acc - estimate)
    }

    #[test]
    fn sheds_the_single_sufficient_bundle() {
        let mut load_data = LoadData::new(NOW);
        add_broker(&mut load_data, "A", 95.0, &[("X", 50.0), ("Y", 45.0)]);
        add_broker(&mut load_data, "B", 20.0, &[("Z", 20.0)]);

        let result = SheddingStrategy::Overload.find_bundles_for_unloading(&load_data, &conf());

        assert_eq!(result, BTreeMap::from([("X".to_string(), "A".to_string())]));
    }

    #[test]
    fn single_broker_sheds_nothing() {
        let mut load_data = LoadData::new(NOW);
        add_broker(&mut load_data, "A", 99.0, &[("X", 50.0), ("Y", 49.0)]);

        let result = SheddingStrategy::Overload.find_bundles_for_unloading(&load_data, &conf());
        assert!(result.is_empty());
    }

    #[test]
    fn disabled_brokers_do_not_count_as_available() {
        let mut load_data = LoadData::new(NOW);
        add_broker(&mut load_data, "A", 99.0, &[("X", 50.0), ("Y", 49.0)]);
        add_broker(&mut load_data, "B", 10.0, &[]);
        if let Some(broker) = load_data.brokers.get_mut("B") {
            broker.status = BrokerStatus::Disabled;
        }

        let result = SheddingStrategy::Overload.find_bundles_for_unloading(&load_data, &conf());
        assert!(result.is_empty());
    }

    #[test]
    fn bundle_in_cooldown_is_never_shed() {
        let mut load_data = LoadData::new(NOW);
        add_broker(&mut load_data, "A", 95.0, &[("X", 50.0), ("Y", 45.0)]);
        add_broker(&mut load_data, "B", 20.0, &[]);
        load_data
            .ownership
            .insert("X".to_string(), BundleOwnership::assigned("A", NOW - 10_000));

        let result = SheddingStrategy::Overload.find_bundles_for_unloading(&load_data, &conf());

        assert!(!result.contains_key("X"));
        assert_eq!(result, BTreeMap::from([("Y".to_string(), "A".to_string())]));
    }

    #[test]
    fn broker_keeps_its_last_bundle() {
        let mut load_data = LoadData::new(NOW);
        add_broker(&mut load_data, "A", 95.0, &[("X", 95.0)]);
        add_broker(&mut load_data, "B", 20.0, &[]);

        let result = SheddingStrategy::Overload.find_bundles_for_unloading(&load_data, &conf());
        assert!(result.is_empty());
    }

    #[test]
    fn unreachable_target_skips_the_broker() {
        let mut load_data = LoadData::new(NOW);
        // only Y is out of cooldown, and it doesn't relieve A enough
        add_broker(&mut load_data, "A", 95.0, &[("X", 80.0), ("Y", 15.0)]);
        add_broker(&mut load_data, "B", 20.0, &[]);
        load_data
            .ownership
            .insert("X".to_string(), BundleOwnership::assigned("A", NOW));

        let result = SheddingStrategy::Overload.find_bundles_for_unloading(&load_data, &conf());
        assert!(result.is_empty());
    }

    #[test]
    fn bundles_owned_elsewhere_are_not_candidates() {
        let mut load_data = LoadData::new(NOW);
        add_broker(&mut load_data, "A", 95.0, &[("X", 50.0), ("Y", 45.0)]);
        add_broker(&mut load_data, "B", 20.0, &[]);
        // X already moved away, A's report is one cycle behind
        load_data
            .ownership
            .insert("X".to_string(), BundleOwnership::unassigned(NOW - 3_600_000));

        let result = SheddingStrategy::Overload.find_bundles_for_unloading(&load_data, &conf());
        assert!(!result.contains_key("X"));
    }

    #[test]
    fn shed_brokers_end_below_target_without_over_shedding() {
        let mut load_data = LoadData::new(NOW);
        add_broker(
            &mut load_data,
            "A",
            98.0,
            &[("a1", 20.0), ("a2", 18.0), ("a3", 20.0), ("a4", 20.0), ("a5", 20.0)],
        );
        add_broker(
            &mut load_data,
            "B",
            90.0,
            &[("b1", 10.0), ("b2", 10.0), ("b3", 10.0), ("b4", 60.0)],
        );
        add_broker(&mut load_data, "C", 10.0, &[("c1", 10.0)]);

        let conf = conf();
        let result = SheddingStrategy::Overload.find_bundles_for_unloading(&load_data, &conf);
        let target = conf.broker_overload_threshold_percentage - conf.shedding_margin_percentage;

        for broker_id in ["A", "B"] {
            let projected = projected_load(&load_data, broker_id, &result);
            assert!(projected < target, "{} projected at {}", broker_id, projected);

            // dropping the lightest selected bundle would leave the broker at or above target
            let broker = &load_data.brokers[broker_id];
            let lightest = result
                .iter()
                .filter(|(_, owner)| owner.as_str() == broker_id)
                .map(|(bundle, _)| broker.max_resource_usage() * broker.bundle_share(bundle))
                .fold(f64::INFINITY, f64::min);
            assert!(projected + lightest >= target);
        }
        assert!(!result.values().any(|owner| owner == "C"));
        // equal loads are taken in bundle id order
        assert_eq!(
            result.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["a1", "a3", "b4"]
        );
        assert_eq!(result.get("b4").map(String::as_str), Some("B"));
    }

    #[test]
    fn threshold_strategy_is_relative_to_the_average() {
        let mut load_data = LoadData::new(NOW);
        add_broker(&mut load_data, "A", 70.0, &[("X", 40.0), ("Y", 30.0)]);
        add_broker(&mut load_data, "B", 20.0, &[("Z", 20.0)]);
        add_broker(&mut load_data, "C", 30.0, &[("W", 30.0)]);

        // avg 40, A is above 40 + 10 and goes under 40 + 10 - 10
        let result = SheddingStrategy::Threshold.find_bundles_for_unloading(&load_data, &conf());
        assert_eq!(result, BTreeMap::from([("X".to_string(), "A".to_string())]));

        // nobody is above 80% with the absolute strategy
        let result = SheddingStrategy::Overload.find_bundles_for_unloading(&load_data, &conf());
        assert!(result.is_empty());
    }

    #[test]
    fn disabled_shedding_returns_nothing() {
        let mut load_data = LoadData::new(NOW);
        add_broker(&mut load_data, "A", 95.0, &[("X", 50.0), ("Y", 45.0)]);
        add_broker(&mut load_data, "B", 20.0, &[]);

        let conf = LoadBalancerConfig {
            load_shedding_enabled: false,
            ..conf()
        };
        assert!(SheddingStrategy::Overload
            .find_bundles_for_unloading(&load_data, &conf)
            .is_empty());
    }
}

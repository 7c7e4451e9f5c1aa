use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

use super::LoadBalancerConfig;
use crate::load_data::{BrokerStatus, LoadData};

/// Placement policy for the bundles that need a new owner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerSelector {
    /// Lowest aggregate load, ties by broker id.
    #[default]
    LeastLoaded,
    /// Fewest owned bundles, then lowest load, then broker id.
    FewestBundles,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerCandidate {
    pub broker_id: String,
    pub status: BrokerStatus,
    /// projected load in percent, including the placements made this cycle
    pub load: f64,
    /// projected number of owned bundles
    pub bundles: usize,
}

// Rankings hold the projected state of every broker during one cycle.
// Each placement is pre-allocated on the chosen broker so a burst of
// placements spreads across the cluster instead of piling on one broker.
#[derive(Debug, Clone, Default)]
pub struct BrokerRankings {
    candidates: BTreeMap<String, BrokerCandidate>,
}

impl BrokerRankings {
    pub fn from_load_data(load_data: &LoadData) -> Self {
        let mut owned: BTreeMap<&str, usize> = BTreeMap::new();
        for ownership in load_data.ownership.values() {
            if let Some(owner) = ownership.owner.as_deref() {
                *owned.entry(owner).or_default() += 1;
            }
        }

        let candidates = load_data
            .brokers
            .values()
            .map(|broker| {
                let candidate = BrokerCandidate {
                    broker_id: broker.broker_id.clone(),
                    status: broker.status,
                    load: broker.max_resource_usage(),
                    bundles: owned.get(broker.broker_id.as_str()).copied().unwrap_or(0),
                };
                (broker.broker_id.clone(), candidate)
            })
            .collect();

        BrokerRankings { candidates }
    }

    pub fn get(&self, broker_id: &str) -> Option<&BrokerCandidate> {
        self.candidates.get(broker_id)
    }

    /// Average load carried by one bundle across the available brokers,
    /// used when nothing better is known about a bundle.
    pub fn average_bundle_load(&self) -> f64 {
        let (load, bundles) = self
            .candidates
            .values()
            .filter(|c| c.status == BrokerStatus::Active)
            .fold((0.0, 0usize), |(load, bundles), c| (load + c.load, bundles + c.bundles));
        if bundles == 0 {
            0.0
        } else {
            load / bundles as f64
        }
    }

    /// Records a placement on the broker: one more bundle, `estimated_load` more load.
    pub fn allocate(&mut self, broker_id: &str, estimated_load: f64) {
        if let Some(candidate) = self.candidates.get_mut(broker_id) {
            candidate.load += estimated_load.max(0.0);
            candidate.bundles += 1;
        }
    }

    /// Records the departure of a bundle from the broker.
    pub fn release(&mut self, broker_id: &str, estimated_load: f64) {
        if let Some(candidate) = self.candidates.get_mut(broker_id) {
            candidate.load = (candidate.load - estimated_load.max(0.0)).max(0.0);
            candidate.bundles = candidate.bundles.saturating_sub(1);
        }
    }

    /// (broker_id, load) sorted from the least loaded.
    pub fn rankings(&self) -> Vec<(String, f64)> {
        let mut rankings: Vec<(String, f64)> = self
            .candidates
            .values()
            .map(|c| (c.broker_id.clone(), c.load))
            .collect();
        rankings.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        rankings
    }
}

impl BrokerSelector {
    /// Picks the owner for a bundle, `None` when no broker is eligible.
    ///
    /// Eligible brokers are active, below the overload threshold, below the bundle
    /// limit and not in `exclude`.
    pub fn select(
        &self,
        rankings: &BrokerRankings,
        exclude: &BTreeSet<String>,
        conf: &LoadBalancerConfig,
    ) -> Option<String> {
        let eligible = rankings.candidates.values().filter(|c| {
            let ok = c.status == BrokerStatus::Active
                && c.load < conf.broker_overload_threshold_percentage
                && (conf.max_bundles_per_broker == 0 || c.bundles < conf.max_bundles_per_broker)
                && !exclude.contains(&c.broker_id);
            if !ok {
                trace!(broker_id = %c.broker_id, status = %c.status, load = c.load, "broker not eligible");
            }
            ok
        });

        // candidates iterate in broker id order, min_by keeps the first of equal elements
        let selected = match self {
            BrokerSelector::LeastLoaded => eligible.min_by(|a, b| a.load.total_cmp(&b.load)),
            BrokerSelector::FewestBundles => eligible.min_by(|a, b| {
                a.bundles
                    .cmp(&b.bundles)
                    .then_with(|| a.load.total_cmp(&b.load))
            }),
        };

        selected.map(|c| c.broker_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_data::{BundleOwnership, LocalBrokerData, ResourceUsage};

    fn load_data(brokers: &[(&str, f64, BrokerStatus, usize)]) -> LoadData {
        let mut load_data = LoadData::new(0);
        for (broker_id, load, status, bundles) in brokers {
            let mut broker = LocalBrokerData::new(broker_id);
            broker.cpu = ResourceUsage::new(*load, 100.0);
            broker.status = *status;
            for i in 0..*bundles {
                let bundle = format!("{}-ns/0x{:02X}-0x{:02X}", broker_id, i, i);
                broker.bundles.insert(bundle.clone());
                load_data
                    .ownership
                    .insert(bundle, BundleOwnership::assigned(broker_id, 0));
            }
            load_data.brokers.insert(broker_id.to_string(), broker);
        }
        load_data
    }

    fn select(selector: BrokerSelector, load_data: &LoadData, conf: &LoadBalancerConfig) -> Option<String> {
        selector.select(
            &BrokerRankings::from_load_data(load_data),
            &BTreeSet::new(),
            conf,
        )
    }

    #[test]
    fn least_loaded_wins() {
        let data = load_data(&[
            ("broker-a", 50.0, BrokerStatus::Active, 1),
            ("broker-b", 20.0, BrokerStatus::Active, 5),
            ("broker-c", 30.0, BrokerStatus::Active, 0),
        ]);
        let conf = LoadBalancerConfig::default();

        assert_eq!(
            select(BrokerSelector::LeastLoaded, &data, &conf).as_deref(),
            Some("broker-b")
        );
        assert_eq!(
            select(BrokerSelector::FewestBundles, &data, &conf).as_deref(),
            Some("broker-c")
        );
    }

    #[test]
    fn ties_are_broken_by_broker_id() {
        let data = load_data(&[
            ("broker-c", 20.0, BrokerStatus::Active, 1),
            ("broker-a", 20.0, BrokerStatus::Active, 1),
            ("broker-b", 20.0, BrokerStatus::Active, 1),
        ]);
        let conf = LoadBalancerConfig::default();

        for selector in [BrokerSelector::LeastLoaded, BrokerSelector::FewestBundles] {
            assert_eq!(select(selector, &data, &conf).as_deref(), Some("broker-a"));
        }
    }

    #[test]
    fn disabled_and_draining_brokers_are_never_selected() {
        let data = load_data(&[
            ("broker-a", 5.0, BrokerStatus::Disabled, 0),
            ("broker-b", 1.0, BrokerStatus::Draining, 0),
            ("broker-c", 60.0, BrokerStatus::Active, 3),
        ]);
        let conf = LoadBalancerConfig::default();

        for selector in [BrokerSelector::LeastLoaded, BrokerSelector::FewestBundles] {
            assert_eq!(select(selector, &data, &conf).as_deref(), Some("broker-c"));
        }
    }

    #[test]
    fn brokers_at_capacity_are_excluded() {
        let data = load_data(&[
            ("broker-a", 90.0, BrokerStatus::Active, 0),
            ("broker-b", 10.0, BrokerStatus::Active, 2),
        ]);
        let conf = LoadBalancerConfig {
            max_bundles_per_broker: 2,
            ..Default::default()
        };

        assert_eq!(select(BrokerSelector::LeastLoaded, &data, &conf), None);
    }

    #[test]
    fn no_eligible_broker_is_not_an_error() {
        let conf = LoadBalancerConfig::default();
        assert_eq!(select(BrokerSelector::LeastLoaded, &LoadData::new(0), &conf), None);
    }

    #[test]
    fn excluded_broker_is_skipped() {
        let data = load_data(&[
            ("broker-a", 10.0, BrokerStatus::Active, 0),
            ("broker-b", 20.0, BrokerStatus::Active, 0),
        ]);
        let rankings = BrokerRankings::from_load_data(&data);
        let exclude = BTreeSet::from(["broker-a".to_string()]);

        let selected =
            BrokerSelector::LeastLoaded.select(&rankings, &exclude, &LoadBalancerConfig::default());
        assert_eq!(selected.as_deref(), Some("broker-b"));
    }

    #[test]
    fn pre_allocation_spreads_a_burst() {
        let data = load_data(&[
            ("broker-a", 10.0, BrokerStatus::Active, 1),
            ("broker-b", 12.0, BrokerStatus::Active, 1),
        ]);
        let conf = LoadBalancerConfig::default();
        let mut rankings = BrokerRankings::from_load_data(&data);
        let none = BTreeSet::new();

        let mut placed = Vec::new();
        for _ in 0..4 {
            let broker = BrokerSelector::LeastLoaded
                .select(&rankings, &none, &conf)
                .unwrap();
            rankings.allocate(&broker, 5.0);
            placed.push(broker);
        }

        assert_eq!(placed, vec!["broker-a", "broker-b", "broker-a", "broker-b"]);
        assert_eq!(rankings.get("broker-a").unwrap().bundles, 3);
        assert_eq!(rankings.rankings()[0].0, "broker-a");
    }

    #[test]
    fn average_bundle_load_over_active_brokers() {
        let data = load_data(&[
            ("broker-a", 30.0, BrokerStatus::Active, 3),
            ("broker-b", 10.0, BrokerStatus::Active, 1),
            ("broker-c", 90.0, BrokerStatus::Disabled, 1),
        ]);
        let rankings = BrokerRankings::from_load_data(&data);
        assert_eq!(rankings.average_bundle_load(), 10.0);
    }
}

use serde::{Deserialize, Serialize};

use super::{BrokerSelector, SheddingStrategy, SplitStrategy};
use crate::errors::{LoadManagerError, Result};

/// Thresholds and switches of the load balancer.
///
/// The manager clones it at the top of every cycle, a reload through
/// `LoadManager::update_config` takes effect on the next cycle.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LoadBalancerConfig {
    // bundle split triggers
    pub auto_bundle_split_enabled: bool,
    pub split_strategy: SplitStrategy,
    pub max_topics_per_bundle: u64,
    pub max_sessions_per_bundle: u64,
    /// msg/s, in + out
    pub max_msg_rate_per_bundle: f64,
    /// MB/s, in + out
    pub max_bandwidth_per_bundle_mbytes: f64,
    pub max_bundles_per_namespace: usize,
    pub default_bundles_per_namespace: u32,
    /// bundle data older than this is not trusted for a split decision, at least
    /// `report_update_max_interval_seconds`
    pub bundle_data_stale_seconds: u64,

    // load shedding triggers
    pub load_shedding_enabled: bool,
    pub shedding_strategy: SheddingStrategy,
    pub broker_overload_threshold_percentage: f64,
    /// how far below the threshold a shed broker is brought
    pub shedding_margin_percentage: f64,
    /// a bundle placed more recently than this is never shed
    pub shedding_cooldown_seconds: u64,
    pub min_brokers_for_shedding: usize,
    /// threshold strategy only, offset over the cluster average load
    pub threshold_shedder_offset_percentage: f64,

    // placement
    pub broker_selector: BrokerSelector,
    /// 0 means unlimited
    pub max_bundles_per_broker: usize,
    pub unassigned_alert_seconds: u64,

    // broker data publication
    pub report_update_threshold_percentage: f64,
    pub report_update_max_interval_seconds: u64,
    pub short_term_samples: u32,
    pub long_term_samples: u32,

    // control loop
    pub cycle_interval_seconds: u64,
    pub store_retry_attempts: u32,
    pub store_retry_backoff_ms: u64,
    pub broker_lease_ttl_seconds: i64,
    pub leader_lease_ttl_seconds: i64,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            auto_bundle_split_enabled: true,
            split_strategy: SplitStrategy::default(),
            max_topics_per_bundle: 1000,
            max_sessions_per_bundle: 1000,
            max_msg_rate_per_bundle: 30000.0,
            max_bandwidth_per_bundle_mbytes: 100.0,
            max_bundles_per_namespace: 128,
            default_bundles_per_namespace: 1,
            bundle_data_stale_seconds: 900,

            load_shedding_enabled: true,
            shedding_strategy: SheddingStrategy::default(),
            broker_overload_threshold_percentage: 85.0,
            shedding_margin_percentage: 10.0,
            shedding_cooldown_seconds: 60,
            min_brokers_for_shedding: 2,
            threshold_shedder_offset_percentage: 10.0,

            broker_selector: BrokerSelector::default(),
            max_bundles_per_broker: 0,
            unassigned_alert_seconds: 300,

            report_update_threshold_percentage: 10.0,
            report_update_max_interval_seconds: 900,
            short_term_samples: 10,
            long_term_samples: 1000,

            cycle_interval_seconds: 60,
            store_retry_attempts: 3,
            store_retry_backoff_ms: 100,
            broker_lease_ttl_seconds: 32,
            leader_lease_ttl_seconds: 16,
        }
    }
}

impl LoadBalancerConfig {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("max_msg_rate_per_bundle", self.max_msg_rate_per_bundle),
            (
                "max_bandwidth_per_bundle_mbytes",
                self.max_bandwidth_per_bundle_mbytes,
            ),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(config_error(format!("{} must be positive, got {}", name, value)));
            }
        }

        let percentages = [
            (
                "broker_overload_threshold_percentage",
                self.broker_overload_threshold_percentage,
            ),
            ("shedding_margin_percentage", self.shedding_margin_percentage),
            (
                "threshold_shedder_offset_percentage",
                self.threshold_shedder_offset_percentage,
            ),
            (
                "report_update_threshold_percentage",
                self.report_update_threshold_percentage,
            ),
        ];
        for (name, value) in percentages {
            if !(0.0..=100.0).contains(&value) {
                return Err(config_error(format!(
                    "{} must be within [0, 100], got {}",
                    name, value
                )));
            }
        }

        if self.shedding_margin_percentage >= self.broker_overload_threshold_percentage {
            return Err(config_error(format!(
                "shedding_margin_percentage ({}) must be below broker_overload_threshold_percentage ({})",
                self.shedding_margin_percentage, self.broker_overload_threshold_percentage
            )));
        }

        let non_zero = [
            ("max_topics_per_bundle", self.max_topics_per_bundle),
            ("max_sessions_per_bundle", self.max_sessions_per_bundle),
            ("cycle_interval_seconds", self.cycle_interval_seconds),
            ("short_term_samples", self.short_term_samples as u64),
            ("long_term_samples", self.long_term_samples as u64),
            ("store_retry_attempts", self.store_retry_attempts as u64),
            (
                "default_bundles_per_namespace",
                self.default_bundles_per_namespace as u64,
            ),
            ("min_brokers_for_shedding", self.min_brokers_for_shedding as u64),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(config_error(format!("{} must be greater than 0", name)));
            }
        }

        if self.default_bundles_per_namespace as usize > self.max_bundles_per_namespace {
            return Err(config_error(format!(
                "default_bundles_per_namespace ({}) exceeds max_bundles_per_namespace ({})",
                self.default_bundles_per_namespace, self.max_bundles_per_namespace
            )));
        }

        // a quiet broker publishes once per max interval, its bundles must not go stale before
        if self.bundle_data_stale_seconds < self.report_update_max_interval_seconds {
            return Err(config_error(format!(
                "bundle_data_stale_seconds ({}) must not be below report_update_max_interval_seconds ({})",
                self.bundle_data_stale_seconds, self.report_update_max_interval_seconds
            )));
        }

        if self.broker_lease_ttl_seconds <= 0 || self.leader_lease_ttl_seconds <= 0 {
            return Err(config_error("lease TTLs must be positive".to_string()));
        }

        Ok(())
    }
}

fn config_error(reason: String) -> LoadManagerError {
    LoadManagerError::Config(reason)
}

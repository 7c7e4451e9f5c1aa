//! Load balancing control plane of a Danube cluster.
//!
//! Every broker runs a [`LoadManager`]: it publishes the load of the broker to the
//! metadata store and, on the broker elected leader, splits the hot bundles, sheds
//! bundles from the overloaded brokers and places the bundles without owner.

pub mod broker_metrics;
pub mod errors;
pub mod load_data;
pub mod load_manager;
mod resources;
pub mod service_configuration;
mod utils;

pub use errors::{LoadManagerError, Result};
pub use load_manager::{
    BrokerSelector, BrokerStatsSource, CycleSummary, LoadBalancerConfig, LoadBalancingMetric,
    LoadManager, LoadManagerState, Role, SheddingStrategy, SplitStrategy, StaticStatsSource,
    SystemResourceUsage,
};

/// Random broker id, used when the configuration doesn't name one.
pub fn generate_broker_id() -> String {
    format!("broker-{}", utils::get_random_id())
}

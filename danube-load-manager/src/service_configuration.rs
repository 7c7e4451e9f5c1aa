use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::load_manager::LoadBalancerConfig;

/// configuration settings loaded from the config file
#[derive(Debug, Serialize, Deserialize)]
pub struct LoadConfiguration {
    /// Danube cluster name
    pub cluster_name: String,
    /// Broker identity and exporter settings
    pub broker: BrokerConfig,
    /// Metadata store configuration, the in-memory store is used if missing
    #[serde(default)]
    pub meta_store: Option<MetaStoreConfig>,
    /// Namespaces created on boot if they don't exist yet
    #[serde(default)]
    pub bootstrap_namespaces: Vec<String>,
    /// Load balancer thresholds, defaults for the missing fields
    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Unique id of the broker in the cluster, a random one if missing
    pub broker_id: Option<String>,
    /// Hostname or IP address for the broker services
    pub host: String,
    /// Prometheus metrics exporter port (optional)
    pub prometheus_port: Option<u16>,
    /// Load published by a standalone load manager, in percent. A broker embedding the
    /// load manager feeds its measured usage instead.
    #[serde(default)]
    pub declared_load_percentage: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MetaStoreConfig {
    /// Hostname or IP address of the metadata store (etcd)
    pub host: String,
    pub port: u16,
}

/// configuration settings for the load manager service
#[derive(Debug)]
pub struct ServiceConfiguration {
    pub cluster_name: String,
    pub broker_id: Option<String>,
    /// Prometheus exporter address
    pub prom_exporter: Option<SocketAddr>,
    /// Metadata Persistent Store (etcd) address, None for the in-memory store
    pub meta_store_addr: Option<String>,
    pub bootstrap_namespaces: Vec<String>,
    pub declared_load_percentage: Option<f64>,
    pub load_balancer: LoadBalancerConfig,
}

impl TryFrom<LoadConfiguration> for ServiceConfiguration {
    type Error = anyhow::Error;

    fn try_from(config: LoadConfiguration) -> Result<Self> {
        let prom_exporter = match config.broker.prometheus_port {
            Some(port) => Some(
                format!("{}:{}", config.broker.host, port)
                    .parse()
                    .context("Failed to create prom_exporter")?,
            ),
            None => None,
        };

        let meta_store_addr = config
            .meta_store
            .map(|store| format!("{}:{}", store.host, store.port));

        if let Some(load) = config.broker.declared_load_percentage {
            if !(0.0..=100.0).contains(&load) {
                return Err(anyhow::anyhow!(
                    "declared_load_percentage must be within [0, 100], got {}",
                    load
                ));
            }
        }

        config
            .load_balancer
            .validate()
            .context("Invalid load_balancer section")?;

        Ok(ServiceConfiguration {
            cluster_name: config.cluster_name,
            broker_id: config.broker.broker_id,
            prom_exporter,
            meta_store_addr,
            bootstrap_namespaces: config.bootstrap_namespaces,
            declared_load_percentage: config.broker.declared_load_percentage,
            load_balancer: config.load_balancer,
        })
    }
}

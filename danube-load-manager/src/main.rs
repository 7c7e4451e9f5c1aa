use std::{fs::read_to_string, net::SocketAddr, path::Path, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use danube_load_manager::{
    broker_metrics::init_metrics,
    generate_broker_id,
    service_configuration::{LoadConfiguration, ServiceConfiguration},
    LoadManager, StaticStatsSource,
};
use danube_metadata_store::{EtcdStore, MemoryStore, MetadataStorage};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config_file: String,

    /// Broker id, overrides the config file
    #[arg(short, long)]
    broker_id: Option<String>,

    /// Metadata store address, overrides the config file
    #[arg(short, long)]
    meta_store_addr: Option<String>,

    /// Prometheus Exporter http address, overrides the config file
    #[arg(short, long)]
    prom_exporter: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // install global collector configured based on RUST_LOG env var.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    // Load the configuration from the specified YAML file
    let config_content = read_to_string(Path::new(&args.config_file))
        .with_context(|| format!("Failed to read config file {}", args.config_file))?;
    let load_config: LoadConfiguration = serde_yaml::from_str(&config_content)?;
    let mut service_config: ServiceConfiguration = load_config.try_into()?;

    if let Some(broker_id) = args.broker_id {
        service_config.broker_id = Some(broker_id);
    }
    if let Some(meta_store_addr) = args.meta_store_addr {
        service_config.meta_store_addr = Some(meta_store_addr);
    }
    if let Some(prom_exporter) = args.prom_exporter {
        let prom_address: SocketAddr = prom_exporter.parse().context(format!(
            "Failed to parse into Socket address: {}",
            prom_exporter
        ))?;
        service_config.prom_exporter = Some(prom_address);
    }

    init_metrics(service_config.prom_exporter).context("Failed to install metrics exporter")?;

    let metadata_store = match service_config.meta_store_addr.clone() {
        Some(addr) => {
            info!("Initializing ETCD as metadata persistent store at {}", addr);
            MetadataStorage::Etcd(EtcdStore::new(addr).await?)
        }
        None => {
            warn!("No metadata store configured, using the in-memory store (single broker only)");
            MetadataStorage::InMemory(MemoryStore::new().await?)
        }
    };

    let broker_id = service_config
        .broker_id
        .clone()
        .unwrap_or_else(generate_broker_id);

    // a broker embedding the load manager pushes its measured usage in the stats source,
    // standalone there is only the declared load and no bundle traffic
    let stats_source = StaticStatsSource::new();
    match service_config.declared_load_percentage {
        Some(load) => {
            info!("Standalone load manager, publishing a declared load of {}%", load);
            stats_source.set_load(load);
        }
        None => warn!(
            "Standalone load manager without declared_load_percentage, the broker publishes 0% load"
        ),
    }
    let stats_source = Arc::new(stats_source);

    let load_manager = LoadManager::new(
        &broker_id,
        metadata_store,
        stats_source,
        service_config.load_balancer.clone(),
    );

    info!(
        cluster = %service_config.cluster_name,
        broker_id = %broker_id,
        "Start the Load Manager"
    );
    load_manager.start().await?;

    for namespace in &service_config.bootstrap_namespaces {
        if load_manager.create_namespace(namespace).await? {
            info!("Namespace {} created", namespace);
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for the shutdown signal")?;

    info!("Shutting down the Load Manager");
    load_manager.stop().await?;

    Ok(())
}

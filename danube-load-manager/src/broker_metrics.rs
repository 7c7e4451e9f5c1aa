use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use tracing::info;

pub(crate) struct Metric {
    pub name: &'static str,
    description: &'static str,
}

pub(crate) const COUNTERS: [Metric; 8] = [
    LB_CYCLES_TOTAL,
    LB_CYCLE_FAILURES_TOTAL,
    LB_BUNDLES_SPLIT_TOTAL,
    LB_BUNDLE_SPLITS_SKIPPED_TOTAL,
    LB_BUNDLES_SHED_TOTAL,
    LB_BUNDLES_ASSIGNED_TOTAL,
    LB_BUNDLES_RECLAIMED_TOTAL,
    LB_BROKER_DATA_WRITES_TOTAL,
];
pub(crate) const GAUGES: [Metric; 5] = [
    LB_BROKER_LOAD,
    LB_BROKER_BUNDLES,
    LB_UNASSIGNED_BUNDLES,
    LB_UNASSIGNED_BUNDLES_STUCK,
    LB_IS_LEADER,
];
pub(crate) const HISTOGRAMS: [Metric; 1] = [LB_CYCLE_DURATION];

// CYCLE Metrics --------------------------

pub(crate) const LB_CYCLES_TOTAL: Metric = Metric {
    name: "lb_cycles_total",
    description: "Total number of load balancing cycles run by this broker",
};

pub(crate) const LB_CYCLE_FAILURES_TOTAL: Metric = Metric {
    name: "lb_cycle_failures_total",
    description: "Cycles that ended with an error, their decisions were skipped",
};

pub(crate) const LB_CYCLE_DURATION: Metric = Metric {
    name: "lb_cycle_duration_seconds",
    description: "Duration of a load balancing cycle (seconds)",
};

pub(crate) const LB_IS_LEADER: Metric = Metric {
    name: "lb_is_leader",
    description: "1 if this broker takes the load balancing decisions",
};

// BUNDLE Metrics --------------------------

pub(crate) const LB_BUNDLES_SPLIT_TOTAL: Metric = Metric {
    name: "lb_bundles_split_total",
    description: "Total bundles split in two",
};

pub(crate) const LB_BUNDLE_SPLITS_SKIPPED_TOTAL: Metric = Metric {
    name: "lb_bundle_splits_skipped_total",
    description: "Bundles over the split thresholds that could not be split",
};

pub(crate) const LB_BUNDLES_SHED_TOTAL: Metric = Metric {
    name: "lb_bundles_shed_total",
    description: "Total bundles unloaded from overloaded brokers",
};

pub(crate) const LB_BUNDLES_ASSIGNED_TOTAL: Metric = Metric {
    name: "lb_bundles_assigned_total",
    description: "Total bundles placed on a new owner",
};

pub(crate) const LB_BUNDLES_RECLAIMED_TOTAL: Metric = Metric {
    name: "lb_bundles_reclaimed_total",
    description: "Bundles taken back from owners that left the cluster",
};

pub(crate) const LB_UNASSIGNED_BUNDLES: Metric = Metric {
    name: "lb_unassigned_bundles",
    description: "Bundles left without owner at the end of the last cycle",
};

pub(crate) const LB_UNASSIGNED_BUNDLES_STUCK: Metric = Metric {
    name: "lb_unassigned_bundles_stuck",
    description: "Bundles without owner for longer than the alert threshold",
};

// BROKER Metrics --------------------------

pub(crate) const LB_BROKER_LOAD: Metric = Metric {
    name: "lb_broker_load_percentage",
    description: "Aggregate load of the broker, the most used resource (%)",
};

pub(crate) const LB_BROKER_BUNDLES: Metric = Metric {
    name: "lb_broker_bundles",
    description: "Number of bundles owned by the broker",
};

pub(crate) const LB_BROKER_DATA_WRITES_TOTAL: Metric = Metric {
    name: "lb_broker_data_writes_total",
    description: "Broker data publications to the metadata store",
};

/// Installs the Prometheus exporter if an address is given and describes all the metrics.
pub fn init_metrics(prom_addr: Option<std::net::SocketAddr>) -> Result<(), BuildError> {
    info!("initializing metrics exporter");

    if let Some(addr) = prom_addr {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
    }

    for name in COUNTERS {
        register_counter(name)
    }

    for name in GAUGES {
        register_gauge(name)
    }

    for name in HISTOGRAMS {
        register_histogram(name)
    }

    Ok(())
}

/// Registers a counter with the given name.
fn register_counter(metric: Metric) {
    metrics::describe_counter!(metric.name, metric.description);
    let _counter = metrics::counter!(metric.name);
}

/// Registers a gauge with the given name.
fn register_gauge(metric: Metric) {
    metrics::describe_gauge!(metric.name, metric.description);
    let _gauge = metrics::gauge!(metric.name);
}

/// Registers a histogram with the given name.
fn register_histogram(metric: Metric) {
    metrics::describe_histogram!(metric.name, metric.description);
    let _histogram = metrics::histogram!(metric.name);
}

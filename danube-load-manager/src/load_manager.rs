mod balancing_metrics;
mod broker_selector;
mod bundle_split;
mod config;
mod leader_election;
mod load_shedding;
mod stats_source;

pub use balancing_metrics::{CycleSummary, LoadBalancingMetric};
pub use broker_selector::{BrokerCandidate, BrokerRankings, BrokerSelector};
pub use bundle_split::{BundleSplitStrategy, SplitStrategy};
pub use config::LoadBalancerConfig;
pub use leader_election::{LeaderElection, LeaderElectionState};
pub use load_shedding::{LoadSheddingStrategy, SheddingStrategy};
pub use stats_source::{BrokerStatsSource, StaticStatsSource, SystemResourceUsage};

use danube_metadata_store::{MetadataStorage, MetadataStore};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::{
    errors::{LoadManagerError, Result},
    load_data::{
        BrokerStatus, BundleData, BundleOwnership, KeyRange, LoadData, LocalBrokerData,
        NamespaceBundle, NamespaceBundles,
    },
    resources::{Resources, LEADER_ELECTION_PATH},
    utils::{now_ms, retry_with_backoff},
};
use balancing_metrics::LoadBalancingStats;

/// Role of a running load manager, decided by the leader election.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Leader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadManagerState {
    Stopped,
    Starting,
    Running(Role),
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Stopped,
    Starting,
    Running,
    Stopping,
}

// Load Manager runs on every broker of the cluster.
//
// Every broker publishes its own load each cycle. The one broker holding the leadership
// also reads the whole cluster from the metadata store and takes the decisions: split the
// hot bundles, shed bundles from overloaded brokers and place the bundles without owner.
// The decisions only exist as ownership and topology records in the store, each broker
// learns what it serves by reading them.
#[derive(Clone)]
pub struct LoadManager {
    broker_id: String,
    store: MetadataStorage,
    resources: Resources,
    election: LeaderElection,
    stats_source: Arc<dyn BrokerStatsSource>,
    config: Arc<Mutex<LoadBalancerConfig>>,
    lifecycle: Arc<Mutex<Lifecycle>>,
    // the data of this broker, refreshed every cycle
    local_data: Arc<Mutex<LocalBrokerData>>,
    // what the store holds for this broker, None forces the next publication
    last_published: Arc<Mutex<Option<LocalBrokerData>>>,
    broker_lease: Arc<Mutex<Option<i64>>>,
    // last snapshot taken as the leader
    load_data: Arc<Mutex<Option<LoadData>>>,
    stats: Arc<Mutex<LoadBalancingStats>>,
    disabled: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    // one cycle at a time, whoever triggers it
    cycle_lock: Arc<Mutex<()>>,
    shutdown: Arc<watch::Sender<bool>>,
    control_loop: Arc<Mutex<Option<JoinHandle<()>>>>,
    background_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl fmt::Debug for LoadManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadManager")
            .field("broker_id", &self.broker_id)
            .field("leader", &self.election.is_leader())
            .finish()
    }
}

impl LoadManager {
    pub fn new(
        broker_id: &str,
        store: MetadataStorage,
        stats_source: Arc<dyn BrokerStatsSource>,
        config: LoadBalancerConfig,
    ) -> Self {
        let election = LeaderElection::new(
            store.clone(),
            LEADER_ELECTION_PATH,
            broker_id,
            config.leader_lease_ttl_seconds,
        );
        let (shutdown, _) = watch::channel(false);

        LoadManager {
            broker_id: broker_id.to_owned(),
            resources: Resources::new(store.clone()),
            store,
            election,
            stats_source,
            config: Arc::new(Mutex::new(config)),
            lifecycle: Arc::new(Mutex::new(Lifecycle::Stopped)),
            local_data: Arc::new(Mutex::new(LocalBrokerData::new(broker_id))),
            last_published: Arc::new(Mutex::new(None)),
            broker_lease: Arc::new(Mutex::new(None)),
            load_data: Arc::new(Mutex::new(None)),
            stats: Arc::new(Mutex::new(LoadBalancingStats::default())),
            disabled: Arc::new(AtomicBool::new(false)),
            stopping: Arc::new(AtomicBool::new(false)),
            cycle_lock: Arc::new(Mutex::new(())),
            shutdown: Arc::new(shutdown),
            control_loop: Arc::new(Mutex::new(None)),
            background_tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn broker_id(&self) -> &str {
        &self.broker_id
    }

    pub async fn state(&self) -> LoadManagerState {
        match *self.lifecycle.lock().await {
            Lifecycle::Stopped => LoadManagerState::Stopped,
            Lifecycle::Starting => LoadManagerState::Starting,
            Lifecycle::Stopping => LoadManagerState::Stopping,
            Lifecycle::Running if self.election.is_leader() => {
                LoadManagerState::Running(Role::Leader)
            }
            Lifecycle::Running => LoadManagerState::Running(Role::Follower),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    /// Notified when this broker gains or loses the leadership.
    pub fn subscribe_leadership(&self) -> watch::Receiver<LeaderElectionState> {
        self.election.subscribe()
    }

    pub async fn config(&self) -> LoadBalancerConfig {
        self.config.lock().await.clone()
    }

    /// Replaces the configuration, the running cycle keeps the one it started with.
    pub async fn update_config(&self, config: LoadBalancerConfig) -> Result<()> {
        config.validate()?;
        info!(broker_id = %self.broker_id, "load balancer configuration updated");
        *self.config.lock().await = config;
        Ok(())
    }

    /// Registers the broker, joins the leader election and starts the control loop.
    pub async fn start(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock().await;
            if *lifecycle != Lifecycle::Stopped {
                return Err(invalid_state("start", *lifecycle));
            }
            *lifecycle = Lifecycle::Starting;
        }
        info!(broker_id = %self.broker_id, "starting load manager");

        match self.bootstrap().await {
            Ok(()) => {
                *self.lifecycle.lock().await = Lifecycle::Running;
                info!(
                    broker_id = %self.broker_id,
                    leader = self.election.is_leader(),
                    "load manager running"
                );
                Ok(())
            }
            Err(err) => {
                error!(broker_id = %self.broker_id, "load manager failed to start: {}", err);
                self.abort_background_tasks().await;
                self.deregister().await;
                self.election.resign().await;
                *self.lifecycle.lock().await = Lifecycle::Stopped;
                Err(err)
            }
        }
    }

    async fn bootstrap(&self) -> Result<()> {
        let conf = self.config.lock().await.clone();
        conf.validate()?;

        self.stopping.store(false, Ordering::SeqCst);
        self.disabled.store(false, Ordering::SeqCst);
        self.shutdown.send_replace(false);
        self.election.set_eligible(true);

        self.update_local_broker_data_with(&conf).await?;
        self.write_broker_data_with(&conf, true).await?;
        self.election.check_leader().await;

        let mut tasks = self.background_tasks.lock().await;

        let election = self.election.clone();
        let leader_check = Duration::from_secs((conf.leader_lease_ttl_seconds as u64 / 2).max(1));
        tasks.push(tokio::spawn(async move {
            election.start(tokio::time::interval(leader_check)).await;
        }));

        let manager = self.clone();
        let lease_refresh = Duration::from_secs((conf.broker_lease_ttl_seconds as u64 / 3).max(1));
        tasks.push(tokio::spawn(async move {
            manager.keep_broker_lease_alive(lease_refresh).await;
        }));

        let manager = self.clone();
        let shutdown = self.shutdown.subscribe();
        let cycle_interval = Duration::from_secs(conf.cycle_interval_seconds);
        *self.control_loop.lock().await = Some(tokio::spawn(async move {
            manager.run_control_loop(cycle_interval, shutdown).await;
        }));

        Ok(())
    }

    /// Stops the control loop, removes the broker from the cluster view and gives up
    /// the leadership. A cycle in flight finishes its current write and aborts.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock().await;
            if *lifecycle != Lifecycle::Running {
                return Err(invalid_state("stop", *lifecycle));
            }
            *lifecycle = Lifecycle::Stopping;
        }
        info!(broker_id = %self.broker_id, "stopping load manager");

        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.send_replace(true);

        let control_loop = self.control_loop.lock().await.take();
        if let Some(handle) = control_loop {
            if let Err(err) = handle.await {
                warn!("control loop ended abnormally: {}", err);
            }
        }
        self.abort_background_tasks().await;

        // a cycle triggered from outside the loop may still be running
        let _cycle = self.cycle_lock.lock().await;

        self.deregister().await;
        self.election.resign().await;
        *self.load_data.lock().await = None;

        *self.lifecycle.lock().await = Lifecycle::Stopped;
        info!(broker_id = %self.broker_id, "load manager stopped");
        Ok(())
    }

    /// Takes the broker out of placement: it publishes the Disabled status, leaves the
    /// leader election and aborts the leader cycle in flight. It keeps serving the
    /// bundles it owns.
    pub async fn disable_broker(&self) -> Result<()> {
        self.ensure_running("disable_broker").await?;
        if self.disabled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(broker_id = %self.broker_id, "disabling broker");

        self.election.set_eligible(false);
        self.local_data.lock().await.status = BrokerStatus::Disabled;
        self.write_broker_data(true).await?;
        self.election.check_leader().await;
        Ok(())
    }

    async fn abort_background_tasks(&self) {
        for task in self.background_tasks.lock().await.drain(..) {
            task.abort();
        }
        if let Some(handle) = self.control_loop.lock().await.take() {
            handle.abort();
        }
    }

    async fn deregister(&self) {
        if let Err(err) = self.resources.brokers.delete_broker_data(&self.broker_id).await {
            warn!(broker_id = %self.broker_id, "unable to delete the broker data: {}", err);
        }
        if let Some(lease_id) = self.broker_lease.lock().await.take() {
            if let Err(err) = self.store.revoke_lease(lease_id).await {
                warn!(lease_id, "unable to revoke the broker lease: {}", err);
            }
        }
        *self.last_published.lock().await = None;
    }

    async fn run_control_loop(&self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        // the broker data was just published by start, the first cycle waits a full period
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    match self.run_cycle().await {
                        Ok(summary) => trace!(broker_id = %self.broker_id, ?summary, "cycle completed"),
                        Err(LoadManagerError::Aborted(reason)) => {
                            info!(broker_id = %self.broker_id, "cycle aborted: {}", reason)
                        }
                        Err(err) => error!(broker_id = %self.broker_id, "cycle failed: {}", err),
                    }
                }
            }
        }
        debug!(broker_id = %self.broker_id, "control loop exited");
    }

    async fn keep_broker_lease_alive(&self, period: Duration) {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let lease = *self.broker_lease.lock().await;
            let Some(lease_id) = lease else {
                continue;
            };
            if let Err(err) = self.store.keep_lease_alive(lease_id, "Broker Register").await {
                warn!(
                    broker_id = %self.broker_id,
                    lease_id,
                    "broker lease lost, registering again on the next cycle: {}",
                    err
                );
                *self.broker_lease.lock().await = None;
                *self.last_published.lock().await = None;
            }
        }
    }

    /// Runs one cycle: publish the local data, then the leader decisions if this broker
    /// is the leader. The leadership is read once, at the start of the cycle.
    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        let _cycle = self.cycle_lock.lock().await;
        self.ensure_running("run_cycle").await?;

        let started = Instant::now();
        let conf = self.config.lock().await.clone();
        let is_leader = self.election.is_leader();

        let result = self.cycle(&conf, is_leader).await;

        let mut stats = self.stats.lock().await;
        match result {
            Ok(summary) => {
                stats.record_cycle(summary, started.elapsed());
                debug!(
                    broker_id = %self.broker_id,
                    leader = is_leader,
                    split = summary.bundles_split,
                    shed = summary.bundles_shed,
                    reclaimed = summary.bundles_reclaimed,
                    assigned = summary.bundles_assigned,
                    unassigned = summary.bundles_unassigned,
                    "load balancing cycle done"
                );
                Ok(summary)
            }
            Err(err) => {
                stats.record_failure();
                Err(err)
            }
        }
    }

    async fn cycle(&self, conf: &LoadBalancerConfig, is_leader: bool) -> Result<CycleSummary> {
        let mut summary = CycleSummary {
            leader: is_leader,
            ..Default::default()
        };

        self.update_local_broker_data_with(conf).await?;
        summary.broker_data_written = self.write_broker_data_with(conf, false).await?;

        if is_leader {
            self.leader_cycle(conf, &mut summary).await?;
        }
        Ok(summary)
    }

    async fn leader_cycle(&self, conf: &LoadBalancerConfig, summary: &mut CycleSummary) -> Result<()> {
        let (mut load_data, _) = self.snapshot(conf).await?;
        self.prune_inactive_bundles(conf, &mut load_data).await?;

        self.split_bundles(conf, &load_data, summary).await?;

        // splits are visible to the shedding pass
        let (mut load_data, stored_bundles) = self.snapshot(conf).await?;
        self.prune_inactive_bundles(conf, &mut load_data).await?;
        self.reclaim_orphaned_bundles(conf, &mut load_data, summary).await?;

        let mut rankings = BrokerRankings::from_load_data(&load_data);
        self.shed_bundles(conf, &load_data, &mut rankings, summary).await?;
        self.assign_bundles(conf, &load_data, &mut rankings, summary).await?;
        summary.bundle_data_written =
            self.write_changed_bundle_data(conf, &load_data, &stored_bundles).await?;

        self.record_snapshot(load_data).await;
        Ok(())
    }

    // The snapshot with the broker bundles aligned on the ownership records and one more
    // sample of the broker reports in the bundle data, along with the bundle data as read
    // from the store.
    async fn snapshot(
        &self,
        conf: &LoadBalancerConfig,
    ) -> Result<(LoadData, BTreeMap<String, BundleData>)> {
        let mut load_data = self.read_load_data_with(conf).await.inspect_err(|err| {
            warn!("no consistent snapshot, leader decisions skipped this cycle: {}", err)
        })?;
        let stored_bundles = load_data.bundles.clone();
        load_data.align_broker_bundles();
        load_data.update_bundle_data(conf.short_term_samples, conf.long_term_samples);
        Ok((load_data, stored_bundles))
    }

    async fn record_snapshot(&self, load_data: LoadData) {
        self.stats.lock().await.record_snapshot(&load_data);
        *self.load_data.lock().await = Some(load_data);
    }

    fn check_abort(&self) -> Result<()> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(LoadManagerError::Aborted("load manager is stopping".to_string()));
        }
        if self.disabled.load(Ordering::SeqCst) {
            return Err(LoadManagerError::Aborted("broker has been disabled".to_string()));
        }
        Ok(())
    }

    async fn ensure_running(&self, operation: &'static str) -> Result<()> {
        let lifecycle = *self.lifecycle.lock().await;
        if lifecycle != Lifecycle::Running {
            return Err(invalid_state(operation, lifecycle));
        }
        Ok(())
    }

    async fn ensure_leader(&self, operation: &'static str) -> Result<()> {
        self.ensure_running(operation).await?;
        if !self.election.is_leader() {
            return Err(LoadManagerError::InvalidState {
                operation,
                state: "follower".to_string(),
            });
        }
        Ok(())
    }

    // ---------------------------------------------------------------------------------
    // broker data
    // ---------------------------------------------------------------------------------

    /// Samples the stats source and refreshes the data of this broker.
    ///
    /// The bundles of the broker are the ones the ownership records give it, the stats
    /// reported for any other bundle are dropped.
    pub async fn update_local_broker_data(&self) -> Result<LocalBrokerData> {
        let conf = self.config.lock().await.clone();
        self.update_local_broker_data_with(&conf).await
    }

    async fn update_local_broker_data_with(
        &self,
        conf: &LoadBalancerConfig,
    ) -> Result<LocalBrokerData> {
        let bundles = &self.resources.bundles;
        let ownership = retry_with_backoff(
            "read bundle ownership",
            conf.store_retry_attempts,
            conf.store_retry_backoff_ms,
            move || async move { bundles.get_all_ownership().await },
        )
        .await?;

        let owned: BTreeSet<String> = ownership
            .into_iter()
            .filter(|(_, ownership)| ownership.is_owned_by(&self.broker_id))
            .map(|(bundle, _)| bundle)
            .collect();
        let usage = self.stats_source.system_resource_usage();
        let bundle_stats = self.stats_source.bundle_stats();

        let mut local = self.local_data.lock().await;
        local.bundles = owned;
        local.cpu = usage.cpu;
        local.memory = usage.memory;
        local.bandwidth_in = usage.bandwidth_in;
        local.bandwidth_out = usage.bandwidth_out;
        local.update_bundle_stats(bundle_stats);
        local.status = if self.disabled.load(Ordering::SeqCst) {
            BrokerStatus::Disabled
        } else {
            BrokerStatus::Active
        };
        local.last_update_ms = now_ms();

        trace!(
            broker_id = %self.broker_id,
            bundles = local.bundles.len(),
            load = local.max_resource_usage(),
            "local broker data updated"
        );
        Ok(local.clone())
    }

    /// Publishes the local data under the broker lease. Without `force` the write is
    /// skipped while nothing changed significantly, returns whether it was written.
    pub async fn write_broker_data(&self, force: bool) -> Result<bool> {
        let conf = self.config.lock().await.clone();
        self.write_broker_data_with(&conf, force).await
    }

    async fn write_broker_data_with(&self, conf: &LoadBalancerConfig, force: bool) -> Result<bool> {
        let local = self.local_data.lock().await.clone();
        let mut last_published = self.last_published.lock().await;

        if !force && !needs_update(&local, last_published.as_ref(), conf) {
            trace!(broker_id = %self.broker_id, "broker data unchanged, not published");
            return Ok(false);
        }

        let lease_id = self.broker_lease_id(conf).await?;
        let brokers = &self.resources.brokers;
        let data = &local;
        retry_with_backoff(
            "write broker data",
            conf.store_retry_attempts,
            conf.store_retry_backoff_ms,
            move || async move { brokers.put_broker_data(data, lease_id).await },
        )
        .await?;

        debug!(
            broker_id = %self.broker_id,
            status = %local.status,
            load = local.max_resource_usage(),
            "broker data published"
        );
        *last_published = Some(local);
        Ok(true)
    }

    async fn broker_lease_id(&self, conf: &LoadBalancerConfig) -> Result<i64> {
        let mut lease = self.broker_lease.lock().await;
        if let Some(lease_id) = *lease {
            return Ok(lease_id);
        }

        let store = &self.store;
        let ttl = conf.broker_lease_ttl_seconds;
        let lease_id = retry_with_backoff(
            "create broker lease",
            conf.store_retry_attempts,
            conf.store_retry_backoff_ms,
            move || async move { Ok(store.create_lease(ttl).await?) },
        )
        .await?;

        info!(broker_id = %self.broker_id, lease_id, "broker registered with a new lease");
        *lease = Some(lease_id);
        Ok(lease_id)
    }

    pub async fn get_broker_local_data(&self, broker_id: &str) -> Result<Option<LocalBrokerData>> {
        self.resources.brokers.get_broker_data(broker_id).await
    }

    /// Brokers currently registered and accepting bundles.
    pub async fn get_available_brokers(&self) -> Result<Vec<String>> {
        let conf = self.config.lock().await.clone();
        let brokers = &self.resources.brokers;
        let registered = retry_with_backoff(
            "read brokers",
            conf.store_retry_attempts,
            conf.store_retry_backoff_ms,
            move || async move { brokers.get_all_brokers().await },
        )
        .await?;

        Ok(registered
            .into_values()
            .filter(LocalBrokerData::is_available)
            .map(|broker| broker.broker_id)
            .collect())
    }

    /// Current owner of the bundle, `None` while it waits for placement or if unknown.
    pub async fn get_bundle_owner(&self, bundle: &str) -> Result<Option<String>> {
        let ownership = self.resources.bundles.get_ownership(bundle).await?;
        Ok(ownership.and_then(|ownership| ownership.owner))
    }

    pub async fn get_namespace_bundles(&self, namespace: &str) -> Result<Option<NamespaceBundles>> {
        self.resources.namespaces.get_namespace_bundles(namespace).await
    }

    // ---------------------------------------------------------------------------------
    // cluster snapshot
    // ---------------------------------------------------------------------------------

    /// Reads the brokers, bundle data, ownership and topology from the store.
    pub async fn read_load_data(&self) -> Result<LoadData> {
        let conf = self.config.lock().await.clone();
        self.read_load_data_with(&conf).await
    }

    async fn read_load_data_with(&self, conf: &LoadBalancerConfig) -> Result<LoadData> {
        let resources = &self.resources;
        retry_with_backoff(
            "read load data",
            conf.store_retry_attempts,
            conf.store_retry_backoff_ms,
            move || async move {
                let mut load_data = LoadData::new(now_ms());
                load_data.brokers = resources.brokers.get_all_brokers().await?;
                load_data.bundles = resources.bundles.get_all_bundle_data().await?;
                load_data.ownership = resources.bundles.get_all_ownership().await?;
                load_data.namespaces = resources.namespaces.get_all_namespaces().await?;
                Ok(load_data)
            },
        )
        .await
    }

    // Drops the records of bundles that are no longer active in their namespace, left
    // behind by a split interrupted after the topology swap.
    async fn prune_inactive_bundles(
        &self,
        conf: &LoadBalancerConfig,
        load_data: &mut LoadData,
    ) -> Result<()> {
        let inactive: Vec<String> = load_data
            .ownership
            .keys()
            .chain(load_data.bundles.keys())
            .filter(|bundle| !is_active_bundle(&load_data.namespaces, bundle))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        for bundle in inactive {
            self.check_abort()?;
            info!(bundle = %bundle, "removing the records of an inactive bundle");
            if let Err(err) = self.delete_bundle_records(conf, &bundle).await {
                warn!(bundle = %bundle, "unable to remove inactive bundle records: {}", err);
                continue;
            }
            load_data.ownership.remove(&bundle);
            load_data.bundles.remove(&bundle);
            for broker in load_data.brokers.values_mut() {
                broker.bundles.remove(&bundle);
                broker.last_stats.remove(&bundle);
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------------------
    // namespaces
    // ---------------------------------------------------------------------------------

    /// Creates the namespace over the full hash range with the configured number of
    /// bundles, all of them unassigned. Returns false if the namespace already exists.
    pub async fn create_namespace(&self, namespace: &str) -> Result<bool> {
        let bundles = self.config.lock().await.default_bundles_per_namespace;
        self.create_namespace_bundles(NamespaceBundles::new(namespace, KeyRange::full(), bundles))
            .await
    }

    pub async fn create_namespace_bundles(&self, topology: NamespaceBundles) -> Result<bool> {
        topology.validate()?;
        if topology.namespace.is_empty() {
            return Err(LoadManagerError::InvalidBundle(
                "namespace name can't be empty".to_string(),
            ));
        }

        if !self.resources.namespaces.create_namespace_bundles(&topology).await? {
            debug!(namespace = %topology.namespace, "namespace already exists");
            return Ok(false);
        }

        let since_ms = now_ms();
        for bundle in topology.bundles() {
            self.resources
                .bundles
                .set_ownership(&bundle.id(), &BundleOwnership::unassigned(since_ms))
                .await?;
        }
        info!(
            namespace = %topology.namespace,
            bundles = topology.bundles.len(),
            "namespace created, bundles waiting for placement"
        );
        Ok(true)
    }

    // ---------------------------------------------------------------------------------
    // bundle split
    // ---------------------------------------------------------------------------------

    /// Splits the bundles over the thresholds, returns the ids of the split ones.
    pub async fn check_namespace_bundle_split(&self) -> Result<BTreeSet<String>> {
        let _cycle = self.cycle_lock.lock().await;
        self.ensure_leader("check_namespace_bundle_split").await?;
        let conf = self.config.lock().await.clone();

        let (mut load_data, _) = self.snapshot(&conf).await?;
        self.prune_inactive_bundles(&conf, &mut load_data).await?;
        let mut summary = CycleSummary::default();
        self.split_bundles(&conf, &load_data, &mut summary).await
    }

    async fn split_bundles(
        &self,
        conf: &LoadBalancerConfig,
        load_data: &LoadData,
        summary: &mut CycleSummary,
    ) -> Result<BTreeSet<String>> {
        let candidates = conf.split_strategy.find_bundles_to_split(load_data, conf);
        let mut namespaces = load_data.namespaces.clone();
        let mut split = BTreeSet::new();

        for bundle in candidates {
            self.check_abort()?;
            match self.split_bundle(conf, load_data, &mut namespaces, &bundle).await {
                Ok(true) => {
                    summary.bundles_split += 1;
                    split.insert(bundle);
                }
                Ok(false) => summary.splits_skipped += 1,
                Err(err @ LoadManagerError::Aborted(_)) => return Err(err),
                Err(err) => {
                    error!(bundle = %bundle, "bundle split failed: {}", err);
                    summary.splits_skipped += 1;
                }
            }
        }
        Ok(split)
    }

    // Ok(false) when the bundle can't be split, the reason is logged.
    async fn split_bundle(
        &self,
        conf: &LoadBalancerConfig,
        load_data: &LoadData,
        namespaces: &mut BTreeMap<String, NamespaceBundles>,
        bundle_id: &str,
    ) -> Result<bool> {
        let Some(data) = load_data.bundles.get(bundle_id) else {
            return Ok(false);
        };
        if data.topics <= 1 {
            info!(bundle = %bundle_id, "bundle over the thresholds with a single topic, not split");
            return Ok(false);
        }
        let bundle: NamespaceBundle = match bundle_id.parse() {
            Ok(bundle) => bundle,
            Err(err) => {
                warn!(bundle = %bundle_id, "not split: {}", err);
                return Ok(false);
            }
        };
        let Some(topology) = namespaces.get(&bundle.namespace) else {
            warn!(bundle = %bundle_id, "not split, unknown namespace");
            return Ok(false);
        };
        if topology.bundles.len() >= conf.max_bundles_per_namespace {
            info!(
                bundle = %bundle_id,
                max_bundles = conf.max_bundles_per_namespace,
                "not split, namespace at its maximum number of bundles"
            );
            return Ok(false);
        }

        let mut new_topology = topology.clone();
        let (low, high) = match new_topology.replace_with_children(&bundle) {
            Ok(children) => children,
            Err(err) => {
                info!(bundle = %bundle_id, "not split: {}", err);
                return Ok(false);
            }
        };

        // the children stay where the parent was, a split is not a move
        let ownership = load_data
            .ownership
            .get(bundle_id)
            .cloned()
            .unwrap_or_else(|| BundleOwnership::unassigned(now_ms()));
        let child_data = data.split_half(bundle_id, now_ms());
        let children = [low.id(), high.id()];

        if let Err(err) = self
            .write_split(conf, &children, &ownership, &child_data, &new_topology)
            .await
        {
            for child in &children {
                if let Err(err) = self.delete_bundle_records(conf, child).await {
                    warn!(bundle = %child, "unable to roll back the split child: {}", err);
                }
            }
            return Err(err);
        }

        // the parent records are leftovers from here on, pruned by a later cycle if this fails
        if let Err(err) = self.delete_bundle_records(conf, bundle_id).await {
            warn!(bundle = %bundle_id, "unable to remove the split parent records: {}", err);
        }

        if ownership.is_owned_by(&self.broker_id) {
            let mut local = self.local_data.lock().await;
            local.bundles.remove(bundle_id);
            local.bundles.extend(children.iter().cloned());
        }

        info!(
            bundle = %bundle_id,
            low = %children[0],
            high = %children[1],
            owner = ownership.owner.as_deref().unwrap_or("unassigned"),
            "bundle split"
        );
        namespaces.insert(bundle.namespace, new_topology);
        Ok(true)
    }

    // The children records come first, the topology swap makes them active.
    async fn write_split(
        &self,
        conf: &LoadBalancerConfig,
        children: &[String; 2],
        ownership: &BundleOwnership,
        child_data: &BundleData,
        topology: &NamespaceBundles,
    ) -> Result<()> {
        for child in children {
            self.write_ownership(conf, child, ownership).await?;
        }
        for child in children {
            self.check_abort()?;
            let bundles = &self.resources.bundles;
            retry_with_backoff(
                "write bundle data",
                conf.store_retry_attempts,
                conf.store_retry_backoff_ms,
                move || async move { bundles.put_bundle_data(child, child_data).await },
            )
            .await?;
        }

        self.check_abort()?;
        let namespaces = &self.resources.namespaces;
        retry_with_backoff(
            "write namespace topology",
            conf.store_retry_attempts,
            conf.store_retry_backoff_ms,
            move || async move { namespaces.put_namespace_bundles(topology).await },
        )
        .await
    }

    async fn delete_bundle_records(&self, conf: &LoadBalancerConfig, bundle: &str) -> Result<()> {
        let bundles = &self.resources.bundles;
        retry_with_backoff(
            "delete bundle records",
            conf.store_retry_attempts,
            conf.store_retry_backoff_ms,
            move || async move {
                bundles.delete_ownership(bundle).await?;
                bundles.delete_bundle_data(bundle).await
            },
        )
        .await
    }

    // ---------------------------------------------------------------------------------
    // load shedding and placement
    // ---------------------------------------------------------------------------------

    /// Unloads bundles from the overloaded brokers and places them elsewhere.
    ///
    /// Returns bundle -> new owner, `None` for the bundles left unassigned.
    pub async fn do_load_shedding(&self) -> Result<BTreeMap<String, Option<String>>> {
        let _cycle = self.cycle_lock.lock().await;
        self.ensure_leader("do_load_shedding").await?;
        let conf = self.config.lock().await.clone();

        let (load_data, _) = self.snapshot(&conf).await?;
        let mut rankings = BrokerRankings::from_load_data(&load_data);
        let mut summary = CycleSummary::default();
        self.shed_bundles(&conf, &load_data, &mut rankings, &mut summary)
            .await
    }

    /// Places every bundle waiting without owner, along with the ones whose owner left
    /// the cluster.
    ///
    /// Returns bundle -> new owner, `None` for the bundles that found no eligible broker.
    pub async fn assign_unassigned_bundles(&self) -> Result<BTreeMap<String, Option<String>>> {
        let _cycle = self.cycle_lock.lock().await;
        self.ensure_leader("assign_unassigned_bundles").await?;
        let conf = self.config.lock().await.clone();

        let (mut load_data, _) = self.snapshot(&conf).await?;
        let mut summary = CycleSummary::default();
        self.reclaim_orphaned_bundles(&conf, &mut load_data, &mut summary)
            .await?;
        let mut rankings = BrokerRankings::from_load_data(&load_data);
        self.assign_bundles(&conf, &load_data, &mut rankings, &mut summary)
            .await
    }

    async fn shed_bundles(
        &self,
        conf: &LoadBalancerConfig,
        load_data: &LoadData,
        rankings: &mut BrokerRankings,
        summary: &mut CycleSummary,
    ) -> Result<BTreeMap<String, Option<String>>> {
        let to_unload = conf
            .shedding_strategy
            .find_bundles_for_unloading(load_data, conf);
        let mut moves = BTreeMap::new();

        for (bundle, source) in to_unload {
            let estimated_load = load_data
                .brokers
                .get(&source)
                .map(|broker| broker.max_resource_usage() * broker.bundle_share(&bundle))
                .unwrap_or_default();

            match self
                .write_ownership(conf, &bundle, &BundleOwnership::unassigned(now_ms()))
                .await
            {
                Ok(()) => {}
                Err(err @ LoadManagerError::Aborted(_)) => return Err(err),
                Err(err) => {
                    warn!(bundle = %bundle, broker_id = %source, "unable to unload, bundle stays: {}", err);
                    continue;
                }
            }
            summary.bundles_shed += 1;
            rankings.release(&source, estimated_load);
            info!(bundle = %bundle, broker_id = %source, estimated_load, "bundle unloaded");

            let exclude = BTreeSet::from([source]);
            let owner = self
                .place_bundle(conf, &bundle, estimated_load, rankings, &exclude, summary)
                .await?;
            moves.insert(bundle, owner);
        }
        Ok(moves)
    }

    // A broker that stopped or lost its lease is gone from the brokers, the bundles it owned
    // go back to unassigned and are placed with the others.
    async fn reclaim_orphaned_bundles(
        &self,
        conf: &LoadBalancerConfig,
        load_data: &mut LoadData,
        summary: &mut CycleSummary,
    ) -> Result<()> {
        let orphaned: Vec<(String, String)> = load_data
            .ownership
            .iter()
            .filter_map(|(bundle, ownership)| {
                let owner = ownership.owner.as_ref()?;
                (!load_data.brokers.contains_key(owner)).then(|| (bundle.clone(), owner.clone()))
            })
            .collect();

        for (bundle, owner) in orphaned {
            let unassigned = BundleOwnership::unassigned(now_ms());
            match self.write_ownership(conf, &bundle, &unassigned).await {
                Ok(()) => {}
                Err(err @ LoadManagerError::Aborted(_)) => return Err(err),
                Err(err) => {
                    warn!(bundle = %bundle, broker_id = %owner, "unable to reclaim the bundle: {}", err);
                    continue;
                }
            }
            info!(bundle = %bundle, broker_id = %owner, "owner left the cluster, bundle reclaimed");
            summary.bundles_reclaimed += 1;
            load_data.ownership.insert(bundle, unassigned);
        }
        Ok(())
    }

    async fn assign_bundles(
        &self,
        conf: &LoadBalancerConfig,
        load_data: &LoadData,
        rankings: &mut BrokerRankings,
        summary: &mut CycleSummary,
    ) -> Result<BTreeMap<String, Option<String>>> {
        let alert_ms = conf.unassigned_alert_seconds.saturating_mul(1000);
        let none = BTreeSet::new();
        let mut placements = BTreeMap::new();

        for (bundle, ownership) in load_data.unassigned_bundles() {
            let estimated_load = rankings.average_bundle_load();
            let owner = self
                .place_bundle(conf, bundle, estimated_load, rankings, &none, summary)
                .await?;

            let waiting_ms = now_ms().saturating_sub(ownership.since_ms);
            if owner.is_none() && waiting_ms >= alert_ms {
                summary.unassigned_stuck += 1;
                warn!(bundle = %bundle, waiting_ms, "bundle without owner for too long");
            }
            placements.insert(bundle.to_owned(), owner);
        }
        Ok(placements)
    }

    // Selects the new owner and records it. A bundle with no eligible broker, or whose
    // ownership write fails, stays unassigned for the next cycle.
    async fn place_bundle(
        &self,
        conf: &LoadBalancerConfig,
        bundle: &str,
        estimated_load: f64,
        rankings: &mut BrokerRankings,
        exclude: &BTreeSet<String>,
        summary: &mut CycleSummary,
    ) -> Result<Option<String>> {
        let Some(target) = conf.broker_selector.select(rankings, exclude, conf) else {
            warn!(bundle = %bundle, "no eligible broker, bundle left unassigned");
            summary.bundles_unassigned += 1;
            return Ok(None);
        };

        match self
            .write_ownership(conf, bundle, &BundleOwnership::assigned(&target, now_ms()))
            .await
        {
            Ok(()) => {
                rankings.allocate(&target, estimated_load);
                summary.bundles_assigned += 1;
                info!(bundle = %bundle, broker_id = %target, "bundle assigned");
                Ok(Some(target))
            }
            Err(err @ LoadManagerError::Aborted(_)) => Err(err),
            Err(err) => {
                warn!(bundle = %bundle, broker_id = %target, "unable to assign, bundle stays unassigned: {}", err);
                summary.bundles_unassigned += 1;
                Ok(None)
            }
        }
    }

    async fn write_ownership(
        &self,
        conf: &LoadBalancerConfig,
        bundle: &str,
        ownership: &BundleOwnership,
    ) -> Result<()> {
        self.check_abort()?;
        let bundles = &self.resources.bundles;
        retry_with_backoff(
            "write bundle ownership",
            conf.store_retry_attempts,
            conf.store_retry_backoff_ms,
            move || async move { bundles.set_ownership(bundle, ownership).await },
        )
        .await
    }

    /// Owner proposed for a bundle, from the last leader snapshot or a fresh read.
    /// Nothing is written, `None` when no broker is eligible.
    pub async fn select_broker_for_assignment(&self, bundle: &str) -> Option<String> {
        let conf = self.config.lock().await.clone();
        let cached = self.load_data.lock().await.clone();
        let load_data = match cached {
            Some(load_data) => load_data,
            None => match self.read_load_data_with(&conf).await {
                Ok(load_data) => load_data,
                Err(err) => {
                    warn!(bundle = %bundle, "unable to read the cluster load: {}", err);
                    return None;
                }
            },
        };

        let rankings = BrokerRankings::from_load_data(&load_data);
        let selected = conf.broker_selector.select(&rankings, &BTreeSet::new(), &conf);
        debug!(bundle = %bundle, selected = ?selected, "broker selected for assignment");
        selected
    }

    // ---------------------------------------------------------------------------------
    // bundle data
    // ---------------------------------------------------------------------------------

    /// Persists the bundle data refreshed from the last broker reports, returns the number
    /// of records written.
    pub async fn write_bundle_data(&self) -> Result<u64> {
        let _cycle = self.cycle_lock.lock().await;
        self.ensure_leader("write_bundle_data").await?;
        let conf = self.config.lock().await.clone();

        let (load_data, stored_bundles) = self.snapshot(&conf).await?;
        self.write_changed_bundle_data(&conf, &load_data, &stored_bundles)
            .await
    }

    async fn write_changed_bundle_data(
        &self,
        conf: &LoadBalancerConfig,
        load_data: &LoadData,
        stored_bundles: &BTreeMap<String, BundleData>,
    ) -> Result<u64> {
        let mut written = 0;
        for (bundle, data) in &load_data.bundles {
            if stored_bundles.get(bundle) == Some(data) {
                continue;
            }
            // records of a bundle merged away or removed in this cycle are not recreated
            if !load_data.ownership.contains_key(bundle) {
                continue;
            }

            self.check_abort()?;
            let bundles = &self.resources.bundles;
            let result = retry_with_backoff(
                "write bundle data",
                conf.store_retry_attempts,
                conf.store_retry_backoff_ms,
                move || async move { bundles.put_bundle_data(bundle, data).await },
            )
            .await;
            match result {
                Ok(()) => written += 1,
                Err(err) => warn!(bundle = %bundle, "unable to write bundle data: {}", err),
            }
        }
        Ok(written)
    }

    // ---------------------------------------------------------------------------------
    // reporting
    // ---------------------------------------------------------------------------------

    pub async fn get_load_balancing_metrics(&self) -> Vec<LoadBalancingMetric> {
        self.stats
            .lock()
            .await
            .to_metrics(&self.broker_id, self.election.is_leader())
    }

    pub async fn last_cycle(&self) -> CycleSummary {
        self.stats.lock().await.last_cycle()
    }
}

fn invalid_state(operation: &'static str, lifecycle: Lifecycle) -> LoadManagerError {
    LoadManagerError::InvalidState {
        operation,
        state: format!("{:?}", lifecycle),
    }
}

// Bundles of a namespace without topology are kept, they may be written by an older node.
fn is_active_bundle(namespaces: &BTreeMap<String, NamespaceBundles>, bundle: &str) -> bool {
    let Ok(parsed) = bundle.parse::<NamespaceBundle>() else {
        return true;
    };
    match namespaces.get(&parsed.namespace) {
        Some(topology) => topology.contains(&parsed),
        None => true,
    }
}

// Noise filter for the broker data publication.
fn needs_update(
    local: &LocalBrokerData,
    last_published: Option<&LocalBrokerData>,
    conf: &LoadBalancerConfig,
) -> bool {
    let Some(last) = last_published else {
        return true;
    };
    if local.status != last.status || local.bundles != last.bundles {
        return true;
    }

    let max_interval_ms = conf.report_update_max_interval_seconds.saturating_mul(1000);
    if local.last_update_ms.saturating_sub(last.last_update_ms) >= max_interval_ms {
        return true;
    }

    local.max_change_percentage(last) >= conf.report_update_threshold_percentage
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_data::ResourceUsage;
    use danube_metadata_store::MemoryStore;

    fn published(load: f64, last_update_ms: u64) -> LocalBrokerData {
        let mut data = LocalBrokerData::new("broker-a");
        data.cpu = ResourceUsage::new(load, 100.0);
        data.last_update_ms = last_update_ms;
        data
    }

    #[test]
    fn small_changes_are_not_published() {
        let conf = LoadBalancerConfig::default();
        let last = published(50.0, 1_000);

        assert!(needs_update(&published(50.0, 2_000), None, &conf));
        assert!(!needs_update(&published(52.0, 2_000), Some(&last), &conf));
        assert!(needs_update(&published(70.0, 2_000), Some(&last), &conf));
    }

    #[test]
    fn status_and_bundle_changes_are_always_published() {
        let conf = LoadBalancerConfig::default();
        let last = published(50.0, 1_000);

        let mut disabled = published(50.0, 2_000);
        disabled.status = BrokerStatus::Disabled;
        assert!(needs_update(&disabled, Some(&last), &conf));

        let mut with_bundle = published(50.0, 2_000);
        with_bundle.bundles.insert("ns1/0x00-0xFF".to_string());
        assert!(needs_update(&with_bundle, Some(&last), &conf));
    }

    #[test]
    fn publication_is_refreshed_after_the_max_interval() {
        let conf = LoadBalancerConfig {
            report_update_max_interval_seconds: 10,
            ..Default::default()
        };
        let last = published(50.0, 1_000);
        assert!(!needs_update(&published(50.0, 10_999), Some(&last), &conf));
        assert!(needs_update(&published(50.0, 11_000), Some(&last), &conf));
    }

    #[test]
    fn bundles_of_unknown_namespaces_are_kept() {
        let mut namespaces = BTreeMap::new();
        let mut topology = NamespaceBundles::new("ns1", KeyRange::new(0, 0xFF).unwrap(), 1);
        let parent = topology.bundles().next().unwrap();
        topology.replace_with_children(&parent).unwrap();
        namespaces.insert("ns1".to_string(), topology);

        assert!(is_active_bundle(&namespaces, "ns1/0x00-0x7F"));
        assert!(!is_active_bundle(&namespaces, "ns1/0x00-0xFF"));
        assert!(is_active_bundle(&namespaces, "ns2/0x00-0xFF"));
    }

    async fn manager(conf: LoadBalancerConfig) -> LoadManager {
        let store = MetadataStorage::InMemory(MemoryStore::new().await.unwrap());
        LoadManager::new("broker-a", store, Arc::new(StaticStatsSource::new()), conf)
    }

    #[tokio::test]
    async fn writes_are_refused_once_stopping_or_disabled() {
        let manager = manager(LoadBalancerConfig::default()).await;
        let conf = manager.config().await;
        let ownership = BundleOwnership::assigned("broker-a", 0);

        manager.write_ownership(&conf, "ns1/0x00-0xFF", &ownership).await.unwrap();

        manager.disabled.store(true, Ordering::SeqCst);
        let err = manager
            .write_ownership(&conf, "ns1/0x00-0xFF", &ownership)
            .await
            .unwrap_err();
        assert!(matches!(err, LoadManagerError::Aborted(_)));

        manager.disabled.store(false, Ordering::SeqCst);
        manager.stopping.store(true, Ordering::SeqCst);
        assert!(matches!(
            manager.check_abort(),
            Err(LoadManagerError::Aborted(_))
        ));
    }

    #[tokio::test]
    async fn lifecycle_transitions() {
        let manager = manager(LoadBalancerConfig {
            cycle_interval_seconds: 3600,
            ..Default::default()
        })
        .await;
        assert_eq!(manager.state().await, LoadManagerState::Stopped);
        assert!(matches!(
            manager.run_cycle().await,
            Err(LoadManagerError::InvalidState { .. })
        ));

        manager.start().await.unwrap();
        assert_eq!(manager.state().await, LoadManagerState::Running(Role::Leader));
        assert!(matches!(
            manager.start().await,
            Err(LoadManagerError::InvalidState { .. })
        ));

        manager.stop().await.unwrap();
        assert_eq!(manager.state().await, LoadManagerState::Stopped);
        assert!(matches!(
            manager.stop().await,
            Err(LoadManagerError::InvalidState { .. })
        ));

        // a stopped manager can be started again
        manager.start().await.unwrap();
        assert!(manager.is_leader());
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_config_fails_the_start() {
        let manager = manager(LoadBalancerConfig {
            shedding_margin_percentage: 90.0,
            ..Default::default()
        })
        .await;

        assert!(matches!(
            manager.start().await,
            Err(LoadManagerError::Config(_))
        ));
        assert_eq!(manager.state().await, LoadManagerState::Stopped);
    }
}

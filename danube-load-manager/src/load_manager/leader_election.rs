use danube_metadata_store::{MetaOptions, MetadataStorage, MetadataStore, WatchEvent, WatchStream};
use futures::StreamExt;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::time::Interval;
use tracing::{debug, info, warn};

use crate::errors::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderElectionState {
    NoLeader,
    Leading,
    Following,
}

// Leader Election decides which broker runs the load balancing decisions.
//
// The leader key is created only if absent and bound to a lease, so at most one broker
// holds it and it disappears with the leader. Every broker keeps checking the key and
// publishes its own state on a watch channel, the load manager reads it once per cycle.
#[derive(Debug, Clone)]
pub struct LeaderElection {
    path: String,
    broker_id: String,
    store: MetadataStorage,
    ttl: i64,
    lease_id: Arc<Mutex<Option<i64>>>,
    // a disabled broker stops competing for the leadership
    eligible: Arc<AtomicBool>,
    state: Arc<watch::Sender<LeaderElectionState>>,
}

impl LeaderElection {
    pub fn new(store: MetadataStorage, path: &str, broker_id: &str, ttl: i64) -> Self {
        let (state, _) = watch::channel(LeaderElectionState::NoLeader);
        Self {
            path: path.to_owned(),
            broker_id: broker_id.to_owned(),
            store,
            ttl,
            lease_id: Arc::new(Mutex::new(None)),
            eligible: Arc::new(AtomicBool::new(true)),
            state: Arc::new(state),
        }
    }

    /// Runs the election until the task is aborted, checking the leader key on every tick
    /// and as soon as the key changes.
    pub async fn start(&self, mut leader_check_interval: Interval) {
        let mut events = self.watch_leader_key().await;
        loop {
            tokio::select! {
                _ = leader_check_interval.tick() => {}
                event = events.next() => match event {
                    Some(Ok(WatchEvent::Delete { .. })) => {
                        debug!(broker_id = %self.broker_id, "leader key removed, running election");
                    }
                    Some(_) => {}
                    None => {
                        warn!("leader key watch ended, falling back to periodic checks");
                        events = WatchStream::new(futures::stream::pending());
                    }
                },
            }
            self.check_leader().await;
        }
    }

    pub fn get_state(&self) -> LeaderElectionState {
        *self.state.borrow()
    }

    pub fn is_leader(&self) -> bool {
        self.get_state() == LeaderElectionState::Leading
    }

    /// Notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<LeaderElectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, new_state: LeaderElectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state != new_state {
                *state = new_state;
                true
            } else {
                false
            }
        });
        if changed {
            info!(broker_id = %self.broker_id, state = ?new_state, "leadership state changed");
        }
    }

    async fn watch_leader_key(&self) -> WatchStream {
        match self.store.watch(&self.path).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!("unable to watch the leader key, periodic checks only: {}", err);
                WatchStream::new(futures::stream::pending())
            }
        }
    }

    pub fn set_eligible(&self, eligible: bool) {
        self.eligible.store(eligible, Ordering::SeqCst);
    }

    pub async fn check_leader(&self) {
        if !self.eligible.load(Ordering::SeqCst) {
            self.drop_lease().await;
            self.set_state(LeaderElectionState::Following);
            return;
        }

        let result = match self.store.get(&self.path, MetaOptions::None).await {
            Ok(None) => self.elect().await,
            Ok(Some(value)) if value.as_str() == Some(self.broker_id.as_str()) => {
                self.keep_alive().await
            }
            Ok(Some(_)) => {
                self.drop_lease().await;
                self.set_state(LeaderElectionState::Following);
                Ok(())
            }
            Err(err) => Err(err.into()),
        };

        if let Err(err) = result {
            warn!(broker_id = %self.broker_id, "leader check failed: {}", err);
            self.drop_lease().await;
            self.set_state(LeaderElectionState::NoLeader);
        }
    }

    async fn elect(&self) -> Result<()> {
        debug!(broker_id = %self.broker_id, "attempting to become the leader");

        let lease_id = {
            let mut lease = self.lease_id.lock().await;
            match *lease {
                Some(lease_id) => lease_id,
                None => {
                    let lease_id = self.store.create_lease(self.ttl).await?;
                    *lease = Some(lease_id);
                    lease_id
                }
            }
        };

        let payload = Value::String(self.broker_id.clone());
        if self
            .store
            .create_if_absent(&self.path, payload, Some(lease_id))
            .await?
        {
            self.set_state(LeaderElectionState::Leading);
        } else {
            self.drop_lease().await;
            self.set_state(LeaderElectionState::Following);
        }
        Ok(())
    }

    async fn keep_alive(&self) -> Result<()> {
        let lease = *self.lease_id.lock().await;
        match lease {
            Some(lease_id) => {
                self.store
                    .keep_lease_alive(lease_id, "Leader Election")
                    .await?;
                self.set_state(LeaderElectionState::Leading);
            }
            // the key carries our id but the lease is not ours anymore (restart), wait for it to expire
            None => self.set_state(LeaderElectionState::Following),
        }
        Ok(())
    }

    async fn drop_lease(&self) {
        if let Some(lease_id) = self.lease_id.lock().await.take() {
            if let Err(err) = self.store.revoke_lease(lease_id).await {
                debug!("unable to revoke lease {}: {}", lease_id, err);
            }
        }
    }

    /// Gives up the leadership, the leader key goes away with the lease.
    pub async fn resign(&self) {
        if self.is_leader() {
            info!(broker_id = %self.broker_id, "resigning leadership");
        }
        self.drop_lease().await;
        self.set_state(LeaderElectionState::NoLeader);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use danube_metadata_store::MemoryStore;

    const PATH: &str = "/loadbalance/leader/current";

    async fn store() -> MetadataStorage {
        MetadataStorage::InMemory(MemoryStore::new().await.unwrap())
    }

    #[tokio::test]
    async fn first_broker_becomes_leader() {
        let store = store().await;
        let first = LeaderElection::new(store.clone(), PATH, "broker-a", 10);
        let second = LeaderElection::new(store.clone(), PATH, "broker-b", 10);

        first.check_leader().await;
        second.check_leader().await;

        assert_eq!(first.get_state(), LeaderElectionState::Leading);
        assert_eq!(second.get_state(), LeaderElectionState::Following);

        // still the leader on the next check
        first.check_leader().await;
        assert!(first.is_leader());
    }

    #[tokio::test]
    async fn leadership_moves_after_resign() {
        let store = store().await;
        let first = LeaderElection::new(store.clone(), PATH, "broker-a", 10);
        let second = LeaderElection::new(store.clone(), PATH, "broker-b", 10);
        let mut notifications = second.subscribe();

        first.check_leader().await;
        second.check_leader().await;
        first.resign().await;

        assert_eq!(first.get_state(), LeaderElectionState::NoLeader);
        assert!(store.get(PATH, MetaOptions::None).await.unwrap().is_none());

        second.check_leader().await;
        assert!(second.is_leader());
        assert!(notifications.has_changed().unwrap());
        assert_eq!(*notifications.borrow_and_update(), LeaderElectionState::Leading);
    }

    #[tokio::test]
    async fn lost_lease_drops_leadership() {
        let store = store().await;
        let election = LeaderElection::new(store.clone(), PATH, "broker-a", 10);
        election.check_leader().await;
        assert!(election.is_leader());

        // the lease expired behind our back
        let lease_id = election.lease_id.lock().await.unwrap();
        store.revoke_lease(lease_id).await.unwrap();
        store
            .put(PATH, Value::String("broker-a".to_string()), MetaOptions::None)
            .await
            .unwrap();

        election.check_leader().await;
        assert_eq!(election.get_state(), LeaderElectionState::NoLeader);
    }

    #[tokio::test]
    async fn ineligible_broker_gives_up_and_stays_out() {
        let store = store().await;
        let first = LeaderElection::new(store.clone(), PATH, "broker-a", 10);
        let second = LeaderElection::new(store.clone(), PATH, "broker-b", 10);

        first.check_leader().await;
        assert!(first.is_leader());

        first.set_eligible(false);
        first.check_leader().await;
        assert_eq!(first.get_state(), LeaderElectionState::Following);

        second.check_leader().await;
        assert!(second.is_leader());

        first.check_leader().await;
        assert!(!first.is_leader());
    }
}

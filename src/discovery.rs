//! Registry-driven node membership.
//!
//! A service registry (etcd, Consul, ...) publishes `(address, weight)`
//! registrations that are kept alive by periodic renewals and removed on
//! explicit deregistration. [`Discovery`] applies those events to a
//! [`WeightedSelector`] and expires nodes whose lease was not renewed
//! within the configured TTL. Nodes already in the selector when discovery
//! starts are static: they have no lease, registry events may change their
//! weight, and they are never expired or deregistered.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::Result;
use crate::balancer::WeightedSelector;
use crate::node::Endpoint;

/// Default lease lifetime of a registered node.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(5);

/// Default interval between lease expiry sweeps.
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(1);

/// A membership change published by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A node joined with the given weight.
    Register { address: String, weight: i64 },
    /// A node renewed its lease; the weight may have changed.
    Renew { address: String, weight: i64 },
    /// A node left.
    Deregister { address: String },
}

/// Applies registry events to one selector and tracks leases.
#[derive(Debug, Clone)]
pub struct Discovery {
    selector: WeightedSelector,
    lease_ttl: Duration,
    static_nodes: Arc<HashSet<String>>,
    leases: Arc<Mutex<HashMap<String, Instant>>>,
}

impl Discovery {
    /// Every node already present in `selector` is treated as static.
    pub fn new(selector: WeightedSelector, lease_ttl: Duration) -> Self {
        let static_nodes = selector
            .snapshot()
            .iter()
            .map(|node| node.endpoint().address().to_owned())
            .collect();
        Self {
            selector,
            lease_ttl,
            static_nodes: Arc::new(static_nodes),
            leases: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn selector(&self) -> &WeightedSelector {
        &self.selector
    }

    /// Applies one event. Registrations with an invalid address or a
    /// non-positive weight are rejected and leave the set untouched.
    pub fn apply(&self, event: DiscoveryEvent) -> Result<()> {
        self.apply_at(event, Instant::now())
    }

    fn apply_at(&self, event: DiscoveryEvent, now: Instant) -> Result<()> {
        match event {
            DiscoveryEvent::Register { address, weight }
            | DiscoveryEvent::Renew { address, weight } => {
                let endpoint = Endpoint::new(&address, weight)?;
                let mut leases = self.leases();
                let added = self.selector.upsert(endpoint);
                if self.is_static(&address) {
                    debug!(node = %address, weight, "static node announced by registry");
                    return Ok(());
                }
                leases.insert(address.clone(), now);
                if added {
                    info!(node = %address, weight, "node registered");
                } else {
                    debug!(node = %address, weight, "node lease renewed");
                }
            }
            DiscoveryEvent::Deregister { address } => {
                if self.is_static(&address) {
                    debug!(node = %address, "ignoring deregistration of static node");
                    return Ok(());
                }
                let mut leases = self.leases();
                leases.remove(&address);
                if self.selector.remove(&address) {
                    info!(node = %address, "node deregistered");
                }
            }
        }
        Ok(())
    }

    /// Removes every node whose lease is older than the TTL as of `now`,
    /// returning their addresses.
    pub fn expire(&self, now: Instant) -> Vec<String> {
        let mut leases = self.leases();
        let expired: Vec<String> = leases
            .iter()
            .filter(|(_, renewed)| now.saturating_duration_since(**renewed) >= self.lease_ttl)
            .map(|(address, _)| address.clone())
            .collect();

        for address in &expired {
            leases.remove(address);
            if self.selector.remove(address) {
                warn!(node = %address, ttl = ?self.lease_ttl, "node lease expired");
            }
        }
        expired
    }

    /// Whether `address` came from static configuration.
    pub fn is_static(&self, address: &str) -> bool {
        self.static_nodes.contains(address)
    }

    /// Number of nodes currently holding a lease.
    pub fn leased(&self) -> usize {
        self.leases().len()
    }

    /// Spawns a task applying events from a registry watch until the
    /// sending side is dropped.
    pub fn spawn_watch(self, mut events: mpsc::Receiver<DiscoveryEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Err(e) = self.apply(event) {
                    warn!(error = %e, "ignoring invalid discovery event");
                }
            }
            info!("discovery watch closed");
        })
    }

    /// Spawns a task expiring lapsed leases every `interval`.
    pub fn spawn_reaper(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let expired = self.expire(Instant::now());
                if !expired.is_empty() {
                    info!(
                        expired = expired.len(),
                        remaining = self.selector.len(),
                        "lease sweep completed"
                    );
                }
            }
        })
    }

    fn leases(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

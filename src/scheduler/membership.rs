use std::{collections::HashMap, net::IpAddr, sync::Arc};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use data_model::{BackendDescriptor, BackendId, MembershipDelta, MembershipEntry, NetworkAddress};
use metrics::scheduler_stats;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::{backend_config::BackendConfig, registry::BackendRegistry};

/// Feed of membership deltas for the scheduler.
#[async_trait]
pub trait MembershipSource: Send {
    /// Waits for the next delta. Returns `None` once the feed is closed.
    async fn next_delta(&mut self) -> Option<MembershipDelta>;

    /// Announces the local backend on the feed.
    async fn register(&mut self, entry: MembershipEntry) -> Result<()>;
}

/// A fixed set of backends, delivered as a single full snapshot.
pub struct StaticMembership {
    delta: Option<MembershipDelta>,
}

impl StaticMembership {
    pub fn new(backends: Vec<(BackendId, BackendDescriptor)>) -> Result<Self> {
        let entries = backends
            .iter()
            .map(|(id, descriptor)| MembershipEntry::from_descriptor(id.clone(), descriptor))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            delta: Some(MembershipDelta::full(entries)),
        })
    }
}

#[async_trait]
impl MembershipSource for StaticMembership {
    async fn next_delta(&mut self) -> Option<MembershipDelta> {
        self.delta.take()
    }

    async fn register(&mut self, entry: MembershipEntry) -> Result<()> {
        debug!(
            backend_id = entry.backend_id.get(),
            "static membership, not registering local backend"
        );
        Ok(())
    }
}

/// Deltas pushed by another task, for example the internal HTTP endpoint.
pub struct ChannelMembership {
    deltas: mpsc::Receiver<MembershipDelta>,
    registrations: mpsc::Sender<MembershipEntry>,
}

/// The other end of a `ChannelMembership`.
pub struct MembershipFeed {
    pub deltas: mpsc::Sender<MembershipDelta>,
    pub registrations: mpsc::Receiver<MembershipEntry>,
}

impl ChannelMembership {
    pub fn new(capacity: usize) -> (Self, MembershipFeed) {
        let (deltas_tx, deltas_rx) = mpsc::channel(capacity);
        let (registrations_tx, registrations_rx) = mpsc::channel(capacity);
        (
            Self {
                deltas: deltas_rx,
                registrations: registrations_tx,
            },
            MembershipFeed {
                deltas: deltas_tx,
                registrations: registrations_rx,
            },
        )
    }
}

#[async_trait]
impl MembershipSource for ChannelMembership {
    async fn next_delta(&mut self) -> Option<MembershipDelta> {
        self.deltas.recv().await
    }

    async fn register(&mut self, entry: MembershipEntry) -> Result<()> {
        self.registrations
            .send(entry)
            .await
            .map_err(|e| anyhow!("membership feed is closed: {}", e))
    }
}

/// Resolves `address` to an IP, preferring IPv4.
pub async fn resolve_address(address: &NetworkAddress) -> Result<IpAddr> {
    let addrs: Vec<IpAddr> = tokio::net::lookup_host((address.hostname.as_str(), address.port))
        .await?
        .map(|addr| addr.ip())
        .collect();
    addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| anyhow!("unable to resolve {}", address))
}

/// Applies membership deltas to the backend registry. There must be a single
/// updater per registry, since it owns the view of the current membership.
pub struct MembershipUpdater {
    registry: Arc<BackendRegistry>,
    local_backend_id: BackendId,
    local_backend: BackendDescriptor,
    current_membership: HashMap<BackendId, BackendDescriptor>,
    metrics: Arc<scheduler_stats::Metrics>,
}

impl MembershipUpdater {
    pub fn new(
        registry: Arc<BackendRegistry>,
        local_backend_id: BackendId,
        local_backend: BackendDescriptor,
        metrics: Arc<scheduler_stats::Metrics>,
    ) -> Self {
        Self {
            registry,
            local_backend_id,
            local_backend,
            current_membership: HashMap::new(),
            metrics,
        }
    }

    pub fn current_membership(&self) -> &HashMap<BackendId, BackendDescriptor> {
        &self.current_membership
    }

    /// Applies `delta` and publishes the resulting snapshot. Returns the
    /// entry to announce on the feed when the local backend is missing from
    /// the membership.
    pub fn update_membership(&mut self, delta: &MembershipDelta) -> Option<MembershipEntry> {
        if delta.is_delta && delta.is_empty() {
            return None;
        }

        let mut backend_config = if delta.is_delta {
            (*self.registry.get()).clone()
        } else {
            self.current_membership.clear();
            BackendConfig::new()
        };

        for entry in &delta.entries {
            let descriptor = match entry.decode() {
                Ok(descriptor) => descriptor,
                Err(err) => {
                    warn!(
                        backend_id = entry.backend_id.get(),
                        "ignoring malformed membership entry: {:?}", err
                    );
                    continue;
                }
            };
            if descriptor.ip_address.is_unspecified() {
                warn!(
                    backend_id = entry.backend_id.get(),
                    address = %descriptor.address,
                    "ignoring membership entry without a usable IP address"
                );
                continue;
            }
            if entry.backend_id == self.local_backend_id
                && descriptor.address != self.local_backend.address
            {
                warn!(
                    backend_id = entry.backend_id.get(),
                    address = %descriptor.address,
                    "duplicate registration of the local backend id from another address"
                );
                continue;
            }

            // An update for a known member replaces its previous descriptor.
            if let Some(previous) = self.current_membership.get(&entry.backend_id) {
                if previous.is_executor {
                    backend_config.remove_backend(previous);
                }
            }
            if descriptor.is_executor {
                backend_config.add_backend(descriptor.clone());
            }
            self.current_membership
                .insert(entry.backend_id.clone(), descriptor);
        }

        for backend_id in &delta.deletions {
            if let Some(descriptor) = self.current_membership.remove(backend_id) {
                if descriptor.is_executor {
                    backend_config.remove_backend(&descriptor);
                }
            }
        }

        let num_backends = backend_config.num_backends();
        self.registry.set(Arc::new(backend_config));
        self.metrics
            .set_num_backends(self.current_membership.len() as u64);
        self.metrics.membership_updates.add(1, &[]);
        info!(
            num_members = self.current_membership.len(),
            num_backends,
            is_delta = delta.is_delta,
            "applied membership update"
        );

        if self.current_membership.contains_key(&self.local_backend_id) {
            return None;
        }
        match MembershipEntry::from_descriptor(self.local_backend_id.clone(), &self.local_backend)
        {
            Ok(entry) => Some(entry),
            Err(err) => {
                error!("failed to encode local backend descriptor: {:?}", err);
                None
            }
        }
    }

    /// Applies deltas from `source` until the feed closes or shutdown is
    /// signalled.
    pub async fn run(mut self, mut source: Box<dyn MembershipSource>, mut shutdown_rx: watch::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("membership updater shutting down");
                    return;
                }
                delta = source.next_delta() => {
                    let Some(delta) = delta else {
                        info!("membership feed closed");
                        return;
                    };
                    if let Some(registration) = self.update_membership(&delta) {
                        info!(
                            backend_id = self.local_backend_id.get(),
                            address = %self.local_backend.address,
                            "registering local backend"
                        );
                        if let Err(err) = source.register(registration).await {
                            error!("failed to register local backend: {:?}", err);
                        }
                    }
                }
            }
        }
    }
}

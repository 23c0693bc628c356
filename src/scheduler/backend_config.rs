use std::net::IpAddr;

use data_model::{BackendDescriptor, NetworkAddress};
use im::OrdMap;

/// Backends running on a single host, in the order they joined.
pub type BackendList = Vec<BackendDescriptor>;

/// Snapshot of the executors a query can be scheduled on, grouped by host IP.
///
/// Clones share structure, so a writer can copy the current snapshot, modify
/// the copy and publish it without disturbing readers of the old one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendConfig {
    backend_map: OrdMap<IpAddr, BackendList>,
    backend_ip_map: OrdMap<String, IpAddr>,
}

impl BackendConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_backends(backends: impl IntoIterator<Item = BackendDescriptor>) -> Self {
        let mut config = Self::new();
        for backend in backends {
            config.add_backend(backend);
        }
        config
    }

    /// Adds a backend. A backend already registered under the same address is
    /// replaced in place.
    pub fn add_backend(&mut self, backend: BackendDescriptor) {
        self.backend_ip_map
            .insert(backend.address.hostname.clone(), backend.ip_address);
        match self.backend_map.get_mut(&backend.ip_address) {
            Some(backends) => match backends.iter_mut().find(|b| b.address == backend.address) {
                Some(existing) => *existing = backend,
                None => backends.push(backend),
            },
            None => {
                self.backend_map.insert(backend.ip_address, vec![backend]);
            }
        }
    }

    /// Removes a backend. Hostnames stay resolvable while other backends on
    /// the same host remain. Once the host is empty, every hostname that
    /// resolved to it is dropped.
    pub fn remove_backend(&mut self, backend: &BackendDescriptor) {
        let Some(backends) = self.backend_map.get_mut(&backend.ip_address) else {
            return;
        };
        backends.retain(|b| b.address != backend.address);
        if backends.is_empty() {
            self.backend_map.remove(&backend.ip_address);
            let stale: Vec<String> = self
                .backend_ip_map
                .iter()
                .filter(|(_, ip)| **ip == backend.ip_address)
                .map(|(hostname, _)| hostname.clone())
                .collect();
            for hostname in stale {
                self.backend_ip_map.remove(&hostname);
            }
        }
    }

    /// Resolves a hostname to the IP of a host that still runs backends.
    pub fn look_up_backend_ip(&self, hostname: &str) -> Option<IpAddr> {
        self.backend_ip_map
            .get(hostname)
            .copied()
            .filter(|ip| self.backend_map.contains_key(ip))
    }

    pub fn backend_list_for_host(&self, ip: &IpAddr) -> Option<&BackendList> {
        self.backend_map.get(ip)
    }

    pub fn backend_hosts(&self) -> impl Iterator<Item = &IpAddr> {
        self.backend_map.keys()
    }

    pub fn backends(&self) -> impl Iterator<Item = &BackendDescriptor> {
        self.backend_map.values().flat_map(|backends| backends.iter())
    }

    pub fn backend_addresses(&self) -> Vec<NetworkAddress> {
        self.backends().map(|b| b.address.clone()).collect()
    }

    pub fn num_backends(&self) -> usize {
        self.backend_map.values().map(|backends| backends.len()).sum()
    }

    pub fn num_backend_hosts(&self) -> usize {
        self.backend_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backend_map.is_empty()
    }
}

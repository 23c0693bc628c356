use std::{cmp::Ordering, collections::HashMap, net::IpAddr};

use data_model::{
    BackendDescriptor,
    FragmentScanRangeAssignment,
    PlanNodeId,
    ScanRange,
    ScanRangeParams,
};
use metrics::scheduler_stats;
use priority_queue::PriorityQueue;
use rand::{seq::SliceRandom, Rng};
use tracing::debug;

use super::backend_config::BackendConfig;

/// Heap key of a backend host: bytes assigned so far, then its random rank.
/// The ordering is reversed so that the max-heap `PriorityQueue` yields the
/// host with the fewest assigned bytes and the lowest rank first.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AssignmentKey {
    pub assigned_bytes: i64,
    pub random_rank: usize,
}

impl Ord for AssignmentKey {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.assigned_bytes, other.random_rank).cmp(&(self.assigned_bytes, self.random_rank))
    }
}

impl PartialOrd for AssignmentKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of backend hosts that can also be addressed by IP to read or
/// increase a host's assigned bytes.
#[derive(Debug, Default)]
pub struct AddressableAssignmentHeap {
    heap: PriorityQueue<IpAddr, AssignmentKey>,
}

impl AddressableAssignmentHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `assigned_bytes` to the host, inserting it with `random_rank` if
    /// it is not in the heap yet. The rank of an existing host never changes.
    pub fn insert_or_update(&mut self, ip: IpAddr, assigned_bytes: i64, random_rank: usize) {
        let key = match self.heap.get_priority(&ip) {
            Some(existing) => AssignmentKey {
                assigned_bytes: existing.assigned_bytes.saturating_add(assigned_bytes),
                random_rank: existing.random_rank,
            },
            None => AssignmentKey {
                assigned_bytes,
                random_rank,
            },
        };
        if self.heap.change_priority(&ip, key).is_none() {
            self.heap.push(ip, key);
        }
    }

    pub fn assigned_bytes(&self, ip: &IpAddr) -> Option<i64> {
        self.heap.get_priority(ip).map(|key| key.assigned_bytes)
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.heap.get(ip).is_some()
    }

    /// The host with the fewest assigned bytes, ties broken by rank.
    pub fn top(&self) -> Option<IpAddr> {
        self.heap.peek().map(|(ip, _)| *ip)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Bytes assigned during one plan node's placement, split by how they will
/// be read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssignmentByteCounters {
    pub remote_bytes: i64,
    pub local_bytes: i64,
    pub cached_bytes: i64,
}

/// How the chosen backend reaches the data of a scan range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaSelection {
    pub volume_id: i32,
    pub is_cached: bool,
    pub is_remote: bool,
}

impl ReplicaSelection {
    pub fn remote() -> Self {
        Self {
            volume_id: -1,
            is_cached: false,
            is_remote: true,
        }
    }
}

/// Mutable state for placing the scan ranges of a single plan node.
///
/// Every context draws its own permutation of the backend hosts from the
/// caller's generator: the position of a host in the permutation is its rank,
/// and hosts that have not received any work yet are handed out in
/// permutation order for remote reads.
pub struct AssignmentCtx<'a> {
    backend_config: &'a BackendConfig,
    assignment_heap: AddressableAssignmentHeap,
    random_backend_rank: HashMap<IpAddr, usize>,
    first_unused_backend_idx: usize,
    random_backend_order: Vec<IpAddr>,
    next_backend_per_host: HashMap<IpAddr, usize>,
    assignment_byte_counters: AssignmentByteCounters,
    metrics: &'a scheduler_stats::Metrics,
}

impl<'a> AssignmentCtx<'a> {
    pub fn new<R: Rng + ?Sized>(
        backend_config: &'a BackendConfig,
        rng: &mut R,
        metrics: &'a scheduler_stats::Metrics,
    ) -> Self {
        let mut random_backend_order: Vec<IpAddr> =
            backend_config.backend_hosts().copied().collect();
        random_backend_order.shuffle(rng);
        let random_backend_rank = random_backend_order
            .iter()
            .enumerate()
            .map(|(rank, ip)| (*ip, rank))
            .collect();

        Self {
            backend_config,
            assignment_heap: AddressableAssignmentHeap::new(),
            random_backend_rank,
            first_unused_backend_idx: 0,
            random_backend_order,
            next_backend_per_host: HashMap::new(),
            assignment_byte_counters: AssignmentByteCounters::default(),
            metrics,
        }
    }

    pub fn byte_counters(&self) -> AssignmentByteCounters {
        self.assignment_byte_counters
    }

    /// Among `data_locations` picks the host with the fewest assigned bytes.
    /// Exact ties go to the lower rank when `break_ties_by_rank` is set and to
    /// the earlier entry otherwise.
    pub fn select_local_backend_host(
        &self,
        data_locations: &[IpAddr],
        break_ties_by_rank: bool,
    ) -> Option<IpAddr> {
        let (first, rest) = data_locations.split_first()?;
        let mut candidate = *first;
        let mut candidate_bytes = self.assignment_heap.assigned_bytes(first).unwrap_or(0);
        for ip in rest {
            let bytes = self.assignment_heap.assigned_bytes(ip).unwrap_or(0);
            let is_new_min = bytes < candidate_bytes
                || (break_ties_by_rank
                    && bytes == candidate_bytes
                    && self.backend_rank(ip) < self.backend_rank(&candidate));
            if is_new_min {
                candidate = *ip;
                candidate_bytes = bytes;
            }
        }
        Some(candidate)
    }

    /// Picks a host for a remote read. Hosts that have not been assigned any
    /// work yet come first, in permutation order; after that the least loaded
    /// host wins.
    pub fn select_remote_backend_host(&mut self) -> Option<IpAddr> {
        while self.first_unused_backend_idx < self.random_backend_order.len() {
            let ip = self.random_backend_order[self.first_unused_backend_idx];
            self.first_unused_backend_idx += 1;
            if !self.assignment_heap.contains(&ip) {
                return Some(ip);
            }
        }
        self.assignment_heap.top()
    }

    /// Round-robins over the backend processes running on `ip`.
    pub fn select_backend_on_host(&mut self, ip: &IpAddr) -> Option<BackendDescriptor> {
        let backend_config = self.backend_config;
        let backends = backend_config.backend_list_for_host(ip)?;
        if backends.len() == 1 {
            return backends.first().cloned();
        }
        let cursor = self.next_backend_per_host.entry(*ip).or_insert(0);
        if *cursor >= backends.len() {
            *cursor = 0;
        }
        let backend = backends.get(*cursor).cloned();
        *cursor = (*cursor + 1) % backends.len();
        backend
    }

    /// Charges the scan range to `backend` and appends it to the backend's
    /// list for `node_id` in `assignment`.
    pub fn record_scan_range_assignment(
        &mut self,
        backend: &BackendDescriptor,
        node_id: PlanNodeId,
        scan_range: &ScanRange,
        selection: ReplicaSelection,
        assignment: &mut FragmentScanRangeAssignment,
    ) {
        let bytes = scan_range.assignment_bytes();
        let rank = self.backend_rank(&backend.ip_address);
        self.assignment_heap
            .insert_or_update(backend.ip_address, bytes, rank);

        let counters = &mut self.assignment_byte_counters;
        if selection.is_remote {
            counters.remote_bytes = counters.remote_bytes.saturating_add(bytes);
        } else {
            counters.local_bytes = counters.local_bytes.saturating_add(bytes);
            if selection.is_cached {
                counters.cached_bytes = counters.cached_bytes.saturating_add(bytes);
            }
        }
        self.metrics.record_assignment(!selection.is_remote);

        assignment
            .entry(backend.address.clone())
            .or_default()
            .entry(node_id)
            .or_default()
            .push(ScanRangeParams {
                scan_range: scan_range.clone(),
                volume_id: selection.volume_id,
                is_cached: selection.is_cached,
                is_remote: selection.is_remote,
            });
    }

    pub fn log_assignment(&self, node_id: PlanNodeId, assignment: &FragmentScanRangeAssignment) {
        if !tracing::enabled!(tracing::Level::DEBUG) {
            return;
        }
        for (address, per_node) in assignment {
            if let Some(ranges) = per_node.get(&node_id) {
                let bytes = ranges
                    .iter()
                    .fold(0i64, |sum, r| sum.saturating_add(r.scan_range.assignment_bytes()));
                debug!(
                    node_id,
                    backend = %address,
                    num_scan_ranges = ranges.len(),
                    bytes,
                    "scan range assignment"
                );
            }
        }
        let counters = self.assignment_byte_counters;
        debug!(
            node_id,
            local_bytes = counters.local_bytes,
            cached_bytes = counters.cached_bytes,
            remote_bytes = counters.remote_bytes,
            num_backends = assignment.len(),
            "scan range assignment totals"
        );
    }

    fn backend_rank(&self, ip: &IpAddr) -> usize {
        self.random_backend_rank
            .get(ip)
            .copied()
            .unwrap_or(usize::MAX)
    }
}

use std::net::IpAddr;

use data_model::{
    FragmentScanRangeAssignment,
    NetworkAddress,
    PlanNode,
    PlanNodeId,
    QueryOptions,
    ReplicaPreference,
    ScanRange,
    ScanRangeLocationList,
};
use metrics::scheduler_stats;
use rand::Rng;
use tracing::trace;

use super::{
    assignment::{AssignmentByteCounters, AssignmentCtx, ReplicaSelection},
    backend_config::BackendConfig,
    error::SchedulerError,
};

/// Inputs for placing the scan ranges of one scan node.
pub struct ScanNodePlacement<'a> {
    pub node_id: PlanNodeId,
    pub locations: &'a [ScanRangeLocationList],
    pub host_list: &'a [NetworkAddress],
    /// Preference hint attached to the plan node. Overrides the query option.
    pub node_replica_preference: Option<ReplicaPreference>,
    pub node_random_replica: bool,
    pub query_options: &'a QueryOptions,
}

impl<'a> ScanNodePlacement<'a> {
    pub fn new(
        node: &PlanNode,
        locations: &'a [ScanRangeLocationList],
        host_list: &'a [NetworkAddress],
        query_options: &'a QueryOptions,
    ) -> Self {
        Self {
            node_id: node.node_id,
            locations,
            host_list,
            node_replica_preference: node.replica_preference,
            node_random_replica: node.random_replica,
            query_options,
        }
    }

    /// The closest tier a replica may count as. Replicas closer than this
    /// are treated as if they were at this distance.
    pub fn base_distance(&self) -> ReplicaPreference {
        let base = self
            .node_replica_preference
            .unwrap_or(self.query_options.replica_preference);
        if self.query_options.disable_cached_reads {
            base.max(ReplicaPreference::DiskLocal)
        } else {
            base
        }
    }

    pub fn random_replica(&self) -> bool {
        self.query_options.schedule_random_replica || self.node_random_replica
    }

    fn validate(&self) -> Result<(), SchedulerError> {
        for (scan_range_idx, list) in self.locations.iter().enumerate() {
            if list.locations.is_empty() {
                return Err(SchedulerError::EmptyReplicaList {
                    node_id: self.node_id,
                    scan_range_idx,
                });
            }
            if let Some(location) = list
                .locations
                .iter()
                .find(|location| location.host_idx >= self.host_list.len())
            {
                return Err(SchedulerError::InvalidHostIndex {
                    node_id: self.node_id,
                    scan_range_idx,
                    host_idx: location.host_idx,
                    num_hosts: self.host_list.len(),
                });
            }
            if let ScanRange::HdfsFileSplit(split) = &list.scan_range {
                if split.offset < 0 || split.length < 0 {
                    return Err(SchedulerError::InvalidScanRange {
                        node_id: self.node_id,
                        scan_range_idx,
                        reason: format!(
                            "split of {} has offset {} and length {}",
                            split.file_name, split.offset, split.length
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Maps a replica's host to the IP of a live backend on it, if any. Hosts
/// given as literal IPs match a backend with that IP.
fn resolve_replica_host(backend_config: &BackendConfig, host: &NetworkAddress) -> Option<IpAddr> {
    backend_config
        .look_up_backend_ip(&host.hostname)
        .or_else(|| {
            host.hostname
                .parse::<IpAddr>()
                .ok()
                .filter(|ip| backend_config.backend_list_for_host(ip).is_some())
        })
}

/// Describes how a backend on `chosen_ip` reads the scan range: locally from
/// a co-located replica or remotely.
fn replica_selection(
    backend_config: &BackendConfig,
    placement: &ScanNodePlacement<'_>,
    list: &ScanRangeLocationList,
    chosen_ip: IpAddr,
) -> ReplicaSelection {
    let base_distance = placement.base_distance();
    list.locations
        .iter()
        .find(|location| {
            resolve_replica_host(backend_config, &placement.host_list[location.host_idx])
                == Some(chosen_ip)
        })
        .map(|location| ReplicaSelection {
            volume_id: location.volume_id,
            is_cached: location.is_cached && base_distance == ReplicaPreference::CacheLocal,
            is_remote: false,
        })
        .unwrap_or_else(ReplicaSelection::remote)
}

/// Places every scan range of a scan node on a backend of `backend_config`
/// and appends the result to `assignment`.
///
/// Ranges with a replica on a live backend are placed first, on the least
/// loaded backend among those at the closest tier. The remaining ranges are
/// placed afterwards so that remote reads land on the backends left least
/// loaded by the local pass.
#[tracing::instrument(skip_all, fields(node_id = placement.node_id))]
pub fn compute_scan_range_assignment<R: Rng + ?Sized>(
    backend_config: &BackendConfig,
    placement: &ScanNodePlacement<'_>,
    rng: &mut R,
    metrics: &scheduler_stats::Metrics,
    assignment: &mut FragmentScanRangeAssignment,
) -> Result<AssignmentByteCounters, SchedulerError> {
    placement.validate()?;
    if placement.locations.is_empty() {
        return Ok(AssignmentByteCounters::default());
    }
    if backend_config.is_empty() {
        return Err(SchedulerError::NoBackends);
    }

    let base_distance = placement.base_distance();
    let random_replica = placement.random_replica();
    let mut ctx = AssignmentCtx::new(backend_config, rng, metrics);
    let mut remote_scan_ranges = Vec::new();

    for list in placement.locations {
        let mut min_distance = ReplicaPreference::Remote;
        let mut candidates: Vec<IpAddr> = Vec::new();
        if base_distance < ReplicaPreference::Remote {
            for location in &list.locations {
                let host = &placement.host_list[location.host_idx];
                let Some(ip) = resolve_replica_host(backend_config, host) else {
                    continue;
                };
                let distance = if location.is_cached {
                    ReplicaPreference::CacheLocal
                } else {
                    ReplicaPreference::DiskLocal
                }
                .max(base_distance);
                if distance < min_distance {
                    min_distance = distance;
                    candidates.clear();
                }
                if distance == min_distance {
                    candidates.push(ip);
                }
            }
        }

        if candidates.is_empty() {
            remote_scan_ranges.push(list);
            continue;
        }

        let break_ties_by_rank = random_replica || min_distance == ReplicaPreference::CacheLocal;
        let ip = ctx
            .select_local_backend_host(&candidates, break_ties_by_rank)
            .ok_or(SchedulerError::NoBackends)?;
        let backend = ctx
            .select_backend_on_host(&ip)
            .ok_or(SchedulerError::NoBackends)?;
        let selection = replica_selection(backend_config, placement, list, ip);
        trace!(
            node_id = placement.node_id,
            backend = %backend.address,
            tier = %min_distance,
            "assigned local scan range"
        );
        ctx.record_scan_range_assignment(
            &backend,
            placement.node_id,
            &list.scan_range,
            selection,
            assignment,
        );
    }

    for list in remote_scan_ranges {
        let ip = ctx
            .select_remote_backend_host()
            .ok_or(SchedulerError::NoBackends)?;
        let backend = ctx
            .select_backend_on_host(&ip)
            .ok_or(SchedulerError::NoBackends)?;
        let selection = replica_selection(backend_config, placement, list, ip);
        trace!(
            node_id = placement.node_id,
            backend = %backend.address,
            "assigned remote scan range"
        );
        ctx.record_scan_range_assignment(
            &backend,
            placement.node_id,
            &list.scan_range,
            selection,
            assignment,
        );
    }

    ctx.log_assignment(placement.node_id, assignment);
    Ok(ctx.byte_counters())
}

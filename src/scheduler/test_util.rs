//! Cluster, schema and plan models for exercising the scheduler.
//!
//! A test builds a `Cluster` of hosts, a `Schema` of tables whose blocks are
//! replicated on those hosts, and a `Plan` scanning some of the tables. A
//! `SchedulerWrapper` then schedules the plan and collects the scan range
//! assignments into an `AssignmentResult`, which answers questions like "how
//! many bytes were read from cache on host 3".
//!
//! Files map 1:1 to blocks and scan ranges, and every host runs at most one
//! backend. Tests that need several backends on a host build their requests
//! by hand.

use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
    sync::Arc,
};

use data_model::{
    test_objects::tests::{mock_hostname, mock_ip, mock_plan_node, TEST_BACKEND_PORT},
    BackendDescriptorBuilder,
    BackendId,
    DataStreamSink,
    FragmentScanRangeAssignment,
    HdfsFileSplit,
    MembershipDelta,
    MembershipEntry,
    NetworkAddress,
    PartitionType,
    Plan as PlanTree,
    PlanExecInfo,
    PlanFragment,
    PlanFragmentBuilder,
    PlanNodeType,
    QueryExecRequest,
    QueryExecRequestBuilder,
    QueryOptions,
    QuerySchedule,
    ReplicaPreference,
    ScanRange,
    ScanRangeLocation,
    ScanRangeLocationList,
    UniqueId,
};
use metrics::scheduler_stats;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use super::{error::SchedulerError, membership::MembershipUpdater, Scheduler};
use crate::config::SchedulerConfig;

pub const DATANODE_PORT: u16 = 2000;
pub const DEFAULT_BLOCK_SIZE: i64 = 1 << 20;

const SCAN_NODE_ID: i32 = 0;
const EXCHANGE_NODE_ID: i32 = 1;

/// Where the replicas of generated blocks may be placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaPlacement {
    /// Any host with a datanode.
    Random,
    /// Only hosts that run both a datanode and a backend.
    LocalOnly,
    /// Only hosts that run a datanode but no backend.
    RemoteOnly,
}

#[derive(Debug, Clone)]
pub struct Host {
    pub name: String,
    pub ip: IpAddr,
    pub be_port: Option<u16>,
    pub dn_port: Option<u16>,
    pub is_coordinator: bool,
    pub is_executor: bool,
}

impl Host {
    pub fn backend_id(&self) -> BackendId {
        BackendId::new(self.ip.to_string())
    }

    pub fn backend_address(&self) -> NetworkAddress {
        NetworkAddress::new(self.name.clone(), self.be_port.unwrap_or(TEST_BACKEND_PORT))
    }
}

#[derive(Debug, Default)]
pub struct Cluster {
    hosts: Vec<Host>,
    backend_host_idxs: Vec<usize>,
    datanode_host_idxs: Vec<usize>,
    datanode_with_backend_host_idxs: Vec<usize>,
    datanode_only_host_idxs: Vec<usize>,
}

impl Cluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a host with a generated unique hostname and IP and returns its
    /// index.
    pub fn add_host(&mut self, has_backend: bool, has_datanode: bool, is_executor: bool) -> usize {
        let host_idx = self.hosts.len();
        self.hosts.push(Host {
            name: mock_hostname(host_idx),
            ip: mock_ip(host_idx),
            be_port: has_backend.then_some(TEST_BACKEND_PORT),
            dn_port: has_datanode.then_some(DATANODE_PORT),
            is_coordinator: true,
            is_executor,
        });
        if has_backend {
            self.backend_host_idxs.push(host_idx);
        }
        if has_datanode {
            self.datanode_host_idxs.push(host_idx);
            if has_backend {
                self.datanode_with_backend_host_idxs.push(host_idx);
            } else {
                self.datanode_only_host_idxs.push(host_idx);
            }
        }
        host_idx
    }

    pub fn add_hosts(&mut self, num_hosts: usize, has_backend: bool, has_datanode: bool) {
        for _ in 0..num_hosts {
            self.add_host(has_backend, has_datanode, true);
        }
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn num_hosts(&self) -> usize {
        self.hosts.len()
    }

    pub fn backend_host_idxs(&self) -> &[usize] {
        &self.backend_host_idxs
    }

    pub fn datanode_host_idxs(&self) -> &[usize] {
        &self.datanode_host_idxs
    }

    pub fn datanode_only_host_idxs(&self) -> &[usize] {
        &self.datanode_only_host_idxs
    }

    fn candidate_hosts(&self, placement: ReplicaPlacement) -> &[usize] {
        match placement {
            ReplicaPlacement::Random => &self.datanode_host_idxs,
            ReplicaPlacement::LocalOnly => &self.datanode_with_backend_host_idxs,
            ReplicaPlacement::RemoteOnly => &self.datanode_only_host_idxs,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Block {
    pub length: i64,
    pub replica_host_idxs: Vec<usize>,
    pub replica_host_idx_is_cached: Vec<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct Table {
    pub blocks: Vec<Block>,
}

pub struct Schema<'a> {
    cluster: &'a Cluster,
    tables: HashMap<String, Table>,
    rng: StdRng,
}

impl<'a> Schema<'a> {
    pub fn new(cluster: &'a Cluster) -> Self {
        Self {
            cluster,
            tables: HashMap::new(),
            rng: StdRng::seed_from_u64(0),
        }
    }

    pub fn cluster(&self) -> &'a Cluster {
        self.cluster
    }

    /// A table with one block. Both replica lists refer to cluster hosts and
    /// must be disjoint. Non-cached replicas are listed first.
    pub fn add_single_block_table(
        &mut self,
        table_name: &str,
        non_cached_replica_host_idxs: &[usize],
        cached_replica_host_idxs: &[usize],
    ) {
        let mut block = Block {
            length: DEFAULT_BLOCK_SIZE,
            replica_host_idxs: Vec::new(),
            replica_host_idx_is_cached: Vec::new(),
        };
        for host_idx in non_cached_replica_host_idxs {
            block.replica_host_idxs.push(*host_idx);
            block.replica_host_idx_is_cached.push(false);
        }
        for host_idx in cached_replica_host_idxs {
            assert!(!non_cached_replica_host_idxs.contains(host_idx));
            block.replica_host_idxs.push(*host_idx);
            block.replica_host_idx_is_cached.push(true);
        }
        self.tables.insert(
            table_name.to_string(),
            Table {
                blocks: vec![block],
            },
        );
    }

    /// A table of `num_blocks` blocks, each with `num_replicas` replicas on
    /// hosts drawn according to `replica_placement`. The first
    /// `num_cached_replicas` replicas of every block are cached.
    pub fn add_multi_block_table(
        &mut self,
        table_name: &str,
        num_blocks: usize,
        replica_placement: ReplicaPlacement,
        num_replicas: usize,
        num_cached_replicas: usize,
    ) {
        assert!(num_cached_replicas <= num_replicas);
        let candidates = self.cluster.candidate_hosts(replica_placement).to_vec();
        assert!(
            num_replicas <= candidates.len(),
            "not enough hosts for {} replicas",
            num_replicas
        );

        let mut table = Table::default();
        for _ in 0..num_blocks {
            let mut hosts = candidates.clone();
            hosts.shuffle(&mut self.rng);
            hosts.truncate(num_replicas);
            table.blocks.push(Block {
                length: DEFAULT_BLOCK_SIZE,
                replica_host_idx_is_cached: (0..num_replicas)
                    .map(|i| i < num_cached_replicas)
                    .collect(),
                replica_host_idxs: hosts,
            });
        }
        self.tables.insert(table_name.to_string(), table);
    }

    pub fn table(&self, table_name: &str) -> &Table {
        self.tables
            .get(table_name)
            .unwrap_or_else(|| panic!("unknown table {}", table_name))
    }
}

/// A single scan over one or more tables.
pub struct Plan<'a> {
    schema: &'a Schema<'a>,
    query_options: QueryOptions,
    referenced_datanodes: Vec<NetworkAddress>,
    host_idx_to_datanode_idx: HashMap<usize, usize>,
    scan_range_locations: Vec<ScanRangeLocationList>,
}

impl<'a> Plan<'a> {
    pub fn new(schema: &'a Schema<'a>) -> Self {
        Self {
            schema,
            query_options: QueryOptions::default(),
            referenced_datanodes: Vec::new(),
            host_idx_to_datanode_idx: HashMap::new(),
            scan_range_locations: Vec::new(),
        }
    }

    pub fn cluster(&self) -> &'a Cluster {
        self.schema.cluster()
    }

    pub fn query_options(&self) -> &QueryOptions {
        &self.query_options
    }

    pub fn set_replica_preference(&mut self, preference: ReplicaPreference) {
        self.query_options.replica_preference = preference;
    }

    pub fn set_random_replica(&mut self, random_replica: bool) {
        self.query_options.schedule_random_replica = random_replica;
    }

    pub fn set_disable_cached_reads(&mut self, disable_cached_reads: bool) {
        self.query_options.disable_cached_reads = disable_cached_reads;
    }

    pub fn set_mt_dop(&mut self, mt_dop: i32) {
        self.query_options.mt_dop = mt_dop;
    }

    pub fn referenced_datanodes(&self) -> &[NetworkAddress] {
        &self.referenced_datanodes
    }

    pub fn scan_range_locations(&self) -> &[ScanRangeLocationList] {
        &self.scan_range_locations
    }

    /// Adds one scan range per block of the table. May be called repeatedly
    /// for the same table.
    pub fn add_table_scan(&mut self, table_name: &str) {
        let table = self.schema.table(table_name);
        for (block_idx, block) in table.blocks.iter().enumerate() {
            let scan_range = ScanRange::HdfsFileSplit(HdfsFileSplit {
                file_name: format!("{}_block_{}", table_name, block_idx),
                offset: 0,
                length: block.length,
                partition_id: 0,
                file_length: block.length,
            });
            let locations = block
                .replica_host_idxs
                .iter()
                .zip(&block.replica_host_idx_is_cached)
                .map(|(host_idx, is_cached)| ScanRangeLocation {
                    host_idx: self.find_or_insert_datanode_idx(*host_idx),
                    volume_id: 0,
                    is_cached: *is_cached,
                })
                .collect();
            self.scan_range_locations.push(ScanRangeLocationList {
                scan_range,
                locations,
            });
        }
    }

    fn find_or_insert_datanode_idx(&mut self, cluster_host_idx: usize) -> usize {
        if let Some(idx) = self.host_idx_to_datanode_idx.get(&cluster_host_idx) {
            return *idx;
        }
        let host = &self.cluster().hosts()[cluster_host_idx];
        let dn_port = host.dn_port.unwrap_or(DATANODE_PORT);
        let idx = self.referenced_datanodes.len();
        self.referenced_datanodes
            .push(NetworkAddress::new(host.name.clone(), dn_port));
        self.host_idx_to_datanode_idx.insert(cluster_host_idx, idx);
        idx
    }

    /// Wraps the scan into a request. The scan runs in its own partitioned
    /// fragment feeding the coordinator, or inside the coordinator fragment
    /// when `exec_at_coord` is set.
    fn exec_request(&self, exec_at_coord: bool) -> (QueryExecRequest, usize) {
        let scan_node = mock_plan_node(SCAN_NODE_ID, PlanNodeType::HdfsScanNode, 0);
        let (fragments, scan_fragment_idx) = if exec_at_coord {
            (vec![fragment(0, PlanTree { nodes: vec![scan_node] }, PartitionType::Unpartitioned, None)], 0)
        } else {
            let exchange = mock_plan_node(EXCHANGE_NODE_ID, PlanNodeType::ExchangeNode, 0);
            (
                vec![
                    fragment(0, PlanTree { nodes: vec![exchange] }, PartitionType::Unpartitioned, None),
                    fragment(
                        1,
                        PlanTree { nodes: vec![scan_node] },
                        PartitionType::Random,
                        Some(EXCHANGE_NODE_ID),
                    ),
                ],
                1,
            )
        };
        let request = QueryExecRequestBuilder::default()
            .query_id(Some(UniqueId::new(1, 1 << 32)))
            .plan_exec_info(vec![PlanExecInfo {
                fragments,
                per_node_scan_ranges: [(SCAN_NODE_ID, self.scan_range_locations.clone())]
                    .into_iter()
                    .collect(),
            }])
            .host_list(self.referenced_datanodes.clone())
            .query_options(Some(self.query_options.clone()))
            .build()
            .unwrap();
        (request, scan_fragment_idx)
    }
}

pub fn fragment(
    idx: usize,
    plan: PlanTree,
    partition: PartitionType,
    dest_node_id: Option<i32>,
) -> PlanFragment {
    PlanFragmentBuilder::default()
        .idx(idx)
        .display_name(format!("F{:02}", idx))
        .plan(plan)
        .partition(partition)
        .output_sink(dest_node_id.map(|dest_node_id| DataStreamSink {
            dest_node_id,
            output_partition: PartitionType::Unpartitioned,
        }))
        .build()
        .unwrap()
}

pub struct AssignmentInfo<'r> {
    pub addr: &'r NetworkAddress,
    pub hdfs_file_split: &'r HdfsFileSplit,
    pub is_cached: bool,
    pub is_remote: bool,
}

/// Scan range assignments of consecutive scheduler runs.
pub struct AssignmentResult<'a> {
    plan: &'a Plan<'a>,
    assignments: Vec<FragmentScanRangeAssignment>,
}

impl<'a> AssignmentResult<'a> {
    pub fn new(plan: &'a Plan<'a>) -> Self {
        Self {
            plan,
            assignments: Vec::new(),
        }
    }

    pub fn num_total_assignments(&self) -> usize {
        self.count_assignments_if(|_| true)
    }

    pub fn num_total_assigned_bytes(&self) -> i64 {
        self.count_assigned_bytes_if(|_| true)
    }

    pub fn num_total_assignments_on(&self, host_idx: usize) -> usize {
        self.count_assignments_if(self.is_host(host_idx))
    }

    pub fn num_total_assigned_bytes_on(&self, host_idx: usize) -> i64 {
        self.count_assigned_bytes_if(self.is_host(host_idx))
    }

    pub fn num_cached_assignments(&self) -> usize {
        self.count_assignments_if(|info| info.is_cached)
    }

    pub fn num_cached_assigned_bytes(&self) -> i64 {
        self.count_assigned_bytes_if(|info| info.is_cached)
    }

    pub fn num_cached_assigned_bytes_on(&self, host_idx: usize) -> i64 {
        let is_host = self.is_host(host_idx);
        self.count_assigned_bytes_if(|info| info.is_cached && is_host(info))
    }

    pub fn num_disk_assignments(&self) -> usize {
        self.count_assignments_if(|info| !info.is_cached && !info.is_remote)
    }

    pub fn num_disk_assigned_bytes(&self) -> i64 {
        self.count_assigned_bytes_if(|info| !info.is_cached && !info.is_remote)
    }

    pub fn num_disk_assigned_bytes_on(&self, host_idx: usize) -> i64 {
        let is_host = self.is_host(host_idx);
        self.count_assigned_bytes_if(|info| !info.is_cached && !info.is_remote && is_host(info))
    }

    pub fn num_remote_assignments(&self) -> usize {
        self.count_assignments_if(|info| info.is_remote)
    }

    pub fn num_remote_assigned_bytes(&self) -> i64 {
        self.count_assigned_bytes_if(|info| info.is_remote)
    }

    pub fn num_remote_assigned_bytes_on(&self, host_idx: usize) -> i64 {
        let is_host = self.is_host(host_idx);
        self.count_assigned_bytes_if(|info| info.is_remote && is_host(info))
    }

    /// Only backends with at least one assignment are considered, so the
    /// minimum is never 0.
    pub fn max_num_assignments_per_host(&self) -> usize {
        self.assignments_per_backend().values().copied().max().unwrap_or(0)
    }

    pub fn min_num_assignments_per_host(&self) -> usize {
        self.assignments_per_backend().values().copied().min().unwrap_or(0)
    }

    pub fn max_num_assigned_bytes_per_host(&self) -> i64 {
        self.assigned_bytes_per_backend().values().copied().max().unwrap_or(0)
    }

    pub fn min_num_assigned_bytes_per_host(&self) -> i64 {
        self.assigned_bytes_per_backend().values().copied().min().unwrap_or(0)
    }

    /// Number of scheduler runs stored in this result.
    pub fn num_assignments(&self) -> usize {
        self.assignments.len()
    }

    pub fn num_distinct_backends(&self) -> usize {
        let mut backends = HashSet::new();
        self.process_assignments(|info| {
            backends.insert(info.addr.clone());
        });
        backends.len()
    }

    pub fn assignment(&self, idx: usize) -> &FragmentScanRangeAssignment {
        &self.assignments[idx]
    }

    pub fn add_assignment(&mut self, assignment: FragmentScanRangeAssignment) {
        self.assignments.push(assignment);
    }

    pub fn reset(&mut self) {
        self.assignments.clear();
    }

    fn is_host(&self, host_idx: usize) -> impl Fn(&AssignmentInfo<'_>) -> bool + 'a {
        let hostname = self.plan.cluster().hosts()[host_idx].name.clone();
        move |info| info.addr.hostname == hostname
    }

    fn process_assignments(&self, mut cb: impl FnMut(&AssignmentInfo<'_>)) {
        for assignment in &self.assignments {
            for (addr, per_node) in assignment {
                for params_list in per_node.values() {
                    for params in params_list {
                        let ScanRange::HdfsFileSplit(hdfs_file_split) = &params.scan_range else {
                            continue;
                        };
                        cb(&AssignmentInfo {
                            addr,
                            hdfs_file_split,
                            is_cached: params.is_cached,
                            is_remote: params.is_remote,
                        });
                    }
                }
            }
        }
    }

    fn count_assignments_if(&self, filter: impl Fn(&AssignmentInfo<'_>) -> bool) -> usize {
        let mut count = 0;
        self.process_assignments(|info| {
            if filter(info) {
                count += 1;
            }
        });
        count
    }

    fn count_assigned_bytes_if(&self, filter: impl Fn(&AssignmentInfo<'_>) -> bool) -> i64 {
        let mut bytes = 0;
        self.process_assignments(|info| {
            if filter(info) {
                bytes += info.hdfs_file_split.length;
            }
        });
        bytes
    }

    fn assignments_per_backend(&self) -> HashMap<NetworkAddress, usize> {
        let mut counts = HashMap::new();
        self.process_assignments(|info| {
            *counts.entry(info.addr.clone()).or_insert(0) += 1;
        });
        counts
    }

    fn assigned_bytes_per_backend(&self) -> HashMap<NetworkAddress, i64> {
        let mut bytes = HashMap::new();
        self.process_assignments(|info| {
            *bytes.entry(info.addr.clone()).or_insert(0) += info.hdfs_file_split.length;
        });
        bytes
    }
}

/// Runs a scheduler for `plan`. The scheduler's local backend is the first
/// host of the cluster and its membership starts out as every host with a
/// backend.
pub struct SchedulerWrapper<'a> {
    plan: &'a Plan<'a>,
    scheduler: Scheduler,
    updater: MembershipUpdater,
}

impl<'a> SchedulerWrapper<'a> {
    pub const RANDOM_SEED: u64 = 7;

    pub fn new(plan: &'a Plan<'a>) -> Self {
        let (scheduler, updater) = Self::initialize_scheduler(plan);
        let mut wrapper = Self {
            plan,
            scheduler,
            updater,
        };
        wrapper.send_full_membership_map();
        wrapper
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn compute(&self, result: &mut AssignmentResult<'_>) -> Result<(), SchedulerError> {
        self.compute_with(false, result)
    }

    /// Schedules the plan and records the assignment of its scan node.
    pub fn compute_with(
        &self,
        exec_at_coord: bool,
        result: &mut AssignmentResult<'_>,
    ) -> Result<(), SchedulerError> {
        let schedule = self.schedule(exec_at_coord)?;
        let (_, scan_fragment_idx) = self.plan.exec_request(exec_at_coord);
        result.add_assignment(
            schedule.fragment_exec_params[scan_fragment_idx]
                .scan_range_assignment
                .clone(),
        );
        Ok(())
    }

    pub fn schedule(&self, exec_at_coord: bool) -> Result<QuerySchedule, SchedulerError> {
        let (request, _) = self.plan.exec_request(exec_at_coord);
        self.scheduler.schedule(&request)
    }

    /// Re-creates the scheduler from scratch.
    pub fn reset(&mut self) {
        let (scheduler, updater) = Self::initialize_scheduler(self.plan);
        self.scheduler = scheduler;
        self.updater = updater;
        self.send_full_membership_map();
    }

    pub fn add_backend(&mut self, host: &Host) {
        let delta = MembershipDelta::incremental(vec![Self::membership_entry(host)], vec![]);
        self.send_delta(&delta);
    }

    pub fn remove_backend(&mut self, host: &Host) {
        let delta = MembershipDelta::incremental(vec![], vec![host.backend_id()]);
        self.send_delta(&delta);
    }

    pub fn send_full_membership_map(&mut self) {
        let entries = self
            .plan
            .cluster()
            .hosts()
            .iter()
            .filter(|host| host.be_port.is_some())
            .map(Self::membership_entry)
            .collect();
        self.send_delta(&MembershipDelta::full(entries));
    }

    pub fn send_empty_update(&mut self) {
        self.send_delta(&MembershipDelta::incremental(vec![], vec![]));
    }

    fn send_delta(&mut self, delta: &MembershipDelta) {
        // The local backend's self-registration is not echoed back.
        let _ = self.updater.update_membership(delta);
    }

    fn initialize_scheduler(plan: &Plan<'_>) -> (Scheduler, MembershipUpdater) {
        let local_host = plan
            .cluster()
            .hosts()
            .first()
            .expect("the cluster needs at least one host");
        let local_backend = BackendDescriptorBuilder::default()
            .address(local_host.backend_address())
            .ip_address(local_host.ip)
            .is_executor(local_host.is_executor)
            .build()
            .unwrap();
        let config = SchedulerConfig {
            random_seed: Some(Self::RANDOM_SEED),
            default_query_options: QueryOptions::default(),
        };
        let scheduler = Scheduler::new(
            local_host.backend_id(),
            local_backend,
            &config,
            Arc::new(scheduler_stats::Metrics::new()),
        );
        let updater = scheduler.membership_updater();
        (scheduler, updater)
    }

    fn membership_entry(host: &Host) -> MembershipEntry {
        let descriptor = BackendDescriptorBuilder::default()
            .address(host.backend_address())
            .ip_address(host.ip)
            .is_coordinator(host.is_coordinator)
            .is_executor(host.is_executor)
            .build()
            .unwrap();
        MembershipEntry::from_descriptor(host.backend_id(), &descriptor).unwrap()
    }
}

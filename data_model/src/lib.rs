pub mod test_objects;

use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    net::IpAddr,
    str::FromStr,
};

use anyhow::{anyhow, Result};
use derive_builder::Builder;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use strum::{AsRefStr, EnumString};

pub type PlanNodeId = i32;
pub type FragmentIdx = usize;

/// Upper bound accepted for the `mt_dop` query option.
pub const MAX_MT_DOP: i32 = 64;

/// Weight charged to a backend for a single Kudu scan token. Kudu tokens
/// carry no byte length, so every token counts as the same fixed amount.
pub const KUDU_SCAN_TOKEN_WEIGHT: i64 = 1000;

/// Bottom 32 bits of `UniqueId::lo` hold the fragment instance index.
const INSTANCE_IDX_MASK: i64 = (1 << 32) - 1;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NetworkAddress {
    pub hostname: String,
    pub port: u16,
}

impl NetworkAddress {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }
}

impl Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

impl FromStr for NetworkAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (hostname, port) = s
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("address {} is not of the form host:port", s))?;
        if hostname.is_empty() {
            return Err(anyhow!("address {} has an empty hostname", s));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| anyhow!("address {} has an invalid port: {}", s, e))?;
        Ok(Self::new(hostname, port))
    }
}

// Addresses key JSON maps in schedules, so they travel as "host:port" strings.
impl Serialize for NetworkAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NetworkAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
pub struct UniqueId {
    pub hi: i64,
    pub lo: i64,
}

impl UniqueId {
    pub fn new(hi: i64, lo: i64) -> Self {
        Self { hi, lo }
    }

    /// Generates a random query id with the instance index bits cleared.
    pub fn new_query_id() -> Self {
        let (hi, lo) = uuid::Uuid::new_v4().as_u64_pair();
        Self {
            hi: hi as i64,
            lo: (lo as i64) & !INSTANCE_IDX_MASK,
        }
    }

    pub fn query_id(&self) -> Self {
        Self {
            hi: self.hi,
            lo: self.lo & !INSTANCE_IDX_MASK,
        }
    }

    pub fn instance_idx(&self) -> i32 {
        (self.lo & INSTANCE_IDX_MASK) as i32
    }

    pub fn with_instance_idx(&self, instance_idx: i32) -> Self {
        Self {
            hi: self.hi,
            lo: self.query_id().lo + instance_idx as i64,
        }
    }
}

impl Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}:{:x}", self.hi as u64, self.lo as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct BackendId(String);

impl Display for BackendId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl BackendId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BackendId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

fn default_true() -> bool {
    true
}

/// A member of the cluster as advertised on the membership topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Builder)]
#[builder(setter(into))]
pub struct BackendDescriptor {
    pub address: NetworkAddress,
    pub ip_address: IpAddr,
    #[serde(default = "default_true")]
    #[builder(default = "true")]
    pub is_coordinator: bool,
    #[serde(default = "default_true")]
    #[builder(default = "true")]
    pub is_executor: bool,
}

impl Display for BackendDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Backend(address: {}, ip: {}, coordinator: {}, executor: {})",
            self.address, self.ip_address, self.is_coordinator, self.is_executor
        )
    }
}

/// One entry on the membership topic. The value is kept as raw JSON so a
/// malformed descriptor only invalidates its own entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MembershipEntry {
    pub backend_id: BackendId,
    pub descriptor: serde_json::Value,
}

impl MembershipEntry {
    pub fn from_descriptor(backend_id: BackendId, descriptor: &BackendDescriptor) -> Result<Self> {
        Ok(Self {
            backend_id,
            descriptor: serde_json::to_value(descriptor)?,
        })
    }

    pub fn decode(&self) -> Result<BackendDescriptor> {
        let descriptor: BackendDescriptor = serde_json::from_value(self.descriptor.clone())?;
        Ok(descriptor)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MembershipDelta {
    #[serde(default)]
    pub entries: Vec<MembershipEntry>,
    #[serde(default)]
    pub deletions: Vec<BackendId>,
    /// False when the delta carries the full membership and replaces all
    /// previously known members.
    #[serde(default = "default_true")]
    pub is_delta: bool,
}

impl MembershipDelta {
    pub fn full(entries: Vec<MembershipEntry>) -> Self {
        Self {
            entries,
            deletions: Vec::new(),
            is_delta: false,
        }
    }

    pub fn incremental(entries: Vec<MembershipEntry>, deletions: Vec<BackendId>) -> Self {
        Self {
            entries,
            deletions,
            is_delta: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.deletions.is_empty()
    }
}

/// How far a replica is from the backend reading it. The declaration order
/// is the memory distance: cached copies are closest, remote reads farthest.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    AsRefStr,
    EnumString,
    strum::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum ReplicaPreference {
    #[default]
    CacheLocal,
    DiskLocal,
    Remote,
}

impl ReplicaPreference {
    fn parse_option(value: &str) -> Result<Self> {
        match value.trim() {
            "0" => Ok(Self::CacheLocal),
            "2" => Ok(Self::DiskLocal),
            "4" => Ok(Self::Remote),
            other => other
                .parse()
                .map_err(|_| anyhow!("unknown replica preference {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct QueryOptions {
    pub replica_preference: ReplicaPreference,
    pub disable_cached_reads: bool,
    pub schedule_random_replica: bool,
    pub mt_dop: i32,
}

fn parse_bool_option(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(anyhow!("expected a boolean, got {}", other)),
    }
}

impl QueryOptions {
    /// Applies a single option given in its textual `name=value` form.
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<()> {
        match name.trim().to_ascii_lowercase().as_str() {
            "replica_preference" => {
                self.replica_preference = ReplicaPreference::parse_option(value)?;
            }
            "disable_cached_reads" => self.disable_cached_reads = parse_bool_option(value)?,
            "schedule_random_replica" => self.schedule_random_replica = parse_bool_option(value)?,
            "mt_dop" => {
                self.mt_dop = value
                    .trim()
                    .parse::<i32>()
                    .map_err(|e| anyhow!("invalid mt_dop {}: {}", value, e))?;
            }
            other => return Err(anyhow!("unknown query option {}", other)),
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if !(0..=MAX_MT_DOP).contains(&self.mt_dop) {
            return Err(anyhow!(
                "mt_dop must be between 0 and {}, got {}",
                MAX_MT_DOP,
                self.mt_dop
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HdfsFileSplit {
    pub file_name: String,
    #[serde(default)]
    pub offset: i64,
    pub length: i64,
    #[serde(default)]
    pub partition_id: i64,
    #[serde(default)]
    pub file_length: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HbaseKeyRange {
    #[serde(default)]
    pub start_key: Option<String>,
    #[serde(default)]
    pub stop_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanRange {
    HdfsFileSplit(HdfsFileSplit),
    KuduScanToken(String),
    HbaseKeyRange(HbaseKeyRange),
}

impl ScanRange {
    /// Bytes charged to the backend that is assigned this range.
    pub fn assignment_bytes(&self) -> i64 {
        match self {
            ScanRange::HdfsFileSplit(split) => split.length,
            ScanRange::KuduScanToken(_) => KUDU_SCAN_TOKEN_WEIGHT,
            ScanRange::HbaseKeyRange(_) => 0,
        }
    }

    /// Weight used when spreading a backend's ranges over its instances.
    pub fn instance_weight(&self) -> i64 {
        match self {
            ScanRange::HdfsFileSplit(split) => split.length,
            _ => 1,
        }
    }
}

fn default_volume_id() -> i32 {
    -1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanRangeLocation {
    /// Index into the request's `host_list`.
    pub host_idx: usize,
    #[serde(default = "default_volume_id")]
    pub volume_id: i32,
    #[serde(default)]
    pub is_cached: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanRangeLocationList {
    pub scan_range: ScanRange,
    pub locations: Vec<ScanRangeLocation>,
}

/// A scan range as handed to the backend that executes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanRangeParams {
    pub scan_range: ScanRange,
    pub volume_id: i32,
    pub is_cached: bool,
    pub is_remote: bool,
}

pub type PerNodeScanRanges = BTreeMap<PlanNodeId, Vec<ScanRangeParams>>;
pub type FragmentScanRangeAssignment = BTreeMap<NetworkAddress, PerNodeScanRanges>;

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, AsRefStr, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PlanNodeType {
    HdfsScanNode,
    HbaseScanNode,
    DataSourceNode,
    KuduScanNode,
    ExchangeNode,
    UnionNode,
    AggregationNode,
    HashJoinNode,
    NestedLoopJoinNode,
    SortNode,
    SelectNode,
    AnalyticEvalNode,
    EmptySetNode,
    SubplanNode,
    UnnestNode,
    SingularRowSrcNode,
}

impl PlanNodeType {
    pub const SCAN_NODE_TYPES: [PlanNodeType; 4] = [
        PlanNodeType::HdfsScanNode,
        PlanNodeType::HbaseScanNode,
        PlanNodeType::DataSourceNode,
        PlanNodeType::KuduScanNode,
    ];

    pub fn is_scan(&self) -> bool {
        Self::SCAN_NODE_TYPES.contains(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanNode {
    pub node_id: PlanNodeId,
    pub node_type: PlanNodeType,
    #[serde(default)]
    pub num_children: usize,
    /// Planner hint overriding the query-wide replica preference.
    #[serde(default)]
    pub replica_preference: Option<ReplicaPreference>,
    /// Planner hint asking for random tie-breaking among replicas.
    #[serde(default)]
    pub random_replica: bool,
}

/// Plan nodes of a fragment, flattened in pre-order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Plan {
    pub nodes: Vec<PlanNode>,
}

impl Plan {
    pub fn find_nodes(&self, types: &[PlanNodeType]) -> Vec<PlanNodeId> {
        self.nodes
            .iter()
            .filter(|node| types.contains(&node.node_type))
            .map(|node| node.node_id)
            .collect()
    }

    pub fn contains_node(&self, node_type: PlanNodeType) -> bool {
        self.nodes.iter().any(|node| node.node_type == node_type)
    }

    /// Returns the leftmost leaf if it is one of `types`.
    pub fn leftmost_node(&self, types: &[PlanNodeType]) -> Option<PlanNodeId> {
        self.nodes
            .iter()
            .find(|node| node.num_children == 0)
            .filter(|node| types.contains(&node.node_type))
            .map(|node| node.node_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PartitionType {
    Unpartitioned,
    Random,
    HashPartitioned,
    RangePartitioned,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataStreamSink {
    pub dest_node_id: PlanNodeId,
    pub output_partition: PartitionType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Builder)]
#[builder(setter(into))]
pub struct PlanFragment {
    pub idx: FragmentIdx,
    #[serde(default)]
    #[builder(default)]
    pub display_name: String,
    pub plan: Plan,
    pub partition: PartitionType,
    #[serde(default)]
    #[builder(default)]
    pub output_sink: Option<DataStreamSink>,
}

impl PlanFragment {
    pub fn is_unpartitioned(&self) -> bool {
        self.partition == PartitionType::Unpartitioned
    }
}

/// A tree of fragments rooted at `fragments[0]`, plus the scan ranges of all
/// scan nodes in it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PlanExecInfo {
    pub fragments: Vec<PlanFragment>,
    #[serde(default)]
    pub per_node_scan_ranges: BTreeMap<PlanNodeId, Vec<ScanRangeLocationList>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StmtType {
    #[default]
    Query,
    Dml,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Builder)]
#[builder(setter(into))]
pub struct QueryExecRequest {
    #[serde(default)]
    #[builder(default)]
    pub query_id: Option<UniqueId>,
    #[serde(default)]
    #[builder(default)]
    pub stmt_type: StmtType,
    pub plan_exec_info: Vec<PlanExecInfo>,
    /// Hosts referenced by `ScanRangeLocation::host_idx`.
    #[serde(default)]
    #[builder(default)]
    pub host_list: Vec<NetworkAddress>,
    /// Falls back to the server's defaults when absent.
    #[serde(default)]
    #[builder(default)]
    pub query_options: Option<QueryOptions>,
    #[serde(default)]
    #[builder(default)]
    pub query_option_overrides: BTreeMap<String, String>,
}

impl QueryExecRequest {
    pub fn fragments(&self) -> impl Iterator<Item = &PlanFragment> {
        self.plan_exec_info
            .iter()
            .flat_map(|info| info.fragments.iter())
    }

    pub fn num_scan_ranges(&self) -> usize {
        self.plan_exec_info
            .iter()
            .flat_map(|info| info.per_node_scan_ranges.values())
            .map(|ranges| ranges.len())
            .sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanFragmentDestination {
    pub fragment_instance_id: UniqueId,
    pub server: NetworkAddress,
}

/// Execution parameters of one fragment instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FInstanceExecParams {
    pub instance_id: UniqueId,
    pub host: NetworkAddress,
    pub per_fragment_instance_idx: usize,
    pub fragment_idx: FragmentIdx,
    pub per_node_scan_ranges: PerNodeScanRanges,
    /// Index of this instance among all senders of its destination exchange.
    pub sender_id: Option<i32>,
}

impl FInstanceExecParams {
    pub fn num_scan_ranges(&self) -> usize {
        self.per_node_scan_ranges.values().map(|r| r.len()).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FragmentExecParams {
    pub fragment_idx: FragmentIdx,
    pub display_name: String,
    pub is_coord_fragment: bool,
    pub input_fragments: Vec<FragmentIdx>,
    pub scan_range_assignment: FragmentScanRangeAssignment,
    pub instance_exec_params: Vec<FInstanceExecParams>,
    pub destinations: Vec<PlanFragmentDestination>,
    pub per_exch_num_senders: BTreeMap<PlanNodeId, i32>,
}

impl FragmentExecParams {
    pub fn new(fragment: &PlanFragment, is_coord_fragment: bool) -> Self {
        Self {
            fragment_idx: fragment.idx,
            display_name: fragment.display_name.clone(),
            is_coord_fragment,
            input_fragments: Vec::new(),
            scan_range_assignment: BTreeMap::new(),
            instance_exec_params: Vec::new(),
            destinations: Vec::new(),
            per_exch_num_senders: BTreeMap::new(),
        }
    }

    pub fn hosts(&self) -> Vec<NetworkAddress> {
        let mut hosts: Vec<NetworkAddress> = Vec::new();
        for instance in &self.instance_exec_params {
            if !hosts.contains(&instance.host) {
                hosts.push(instance.host.clone());
            }
        }
        hosts
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct FragmentInstanceRef {
    pub fragment_idx: FragmentIdx,
    pub instance_idx: usize,
}

/// Everything a single backend runs for a query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BackendExecParams {
    pub instances: Vec<FragmentInstanceRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuerySchedule {
    pub query_id: UniqueId,
    pub coord_address: NetworkAddress,
    pub query_options: QueryOptions,
    pub fragment_exec_params: Vec<FragmentExecParams>,
    pub per_backend_exec_params: BTreeMap<NetworkAddress, BackendExecParams>,
    pub num_scan_ranges: usize,
}

impl QuerySchedule {
    pub fn num_fragment_instances(&self) -> usize {
        self.fragment_exec_params
            .iter()
            .map(|params| params.instance_exec_params.len())
            .sum()
    }

    pub fn instance(&self, instance_ref: &FragmentInstanceRef) -> Option<&FInstanceExecParams> {
        self.fragment_exec_params
            .get(instance_ref.fragment_idx)
            .and_then(|params| params.instance_exec_params.get(instance_ref.instance_idx))
    }
}

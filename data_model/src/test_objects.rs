pub mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use crate::{
        BackendDescriptor,
        BackendDescriptorBuilder,
        DataStreamSink,
        HdfsFileSplit,
        NetworkAddress,
        PartitionType,
        Plan,
        PlanFragment,
        PlanFragmentBuilder,
        PlanNode,
        PlanNodeId,
        PlanNodeType,
        ScanRange,
        ScanRangeLocation,
        ScanRangeLocationList,
    };

    pub const TEST_BACKEND_PORT: u16 = 1000;
    pub const TEST_COORDINATOR_HOSTNAME: &str = "coordinator";

    pub fn mock_hostname(host_idx: usize) -> String {
        format!("host_{}", host_idx)
    }

    /// Host `i` gets the IP 10.0.x.y derived from `i`, so distinct hosts never
    /// collide.
    pub fn mock_ip(host_idx: usize) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(
            10,
            0,
            ((host_idx >> 8) & 0xff) as u8,
            (host_idx & 0xff) as u8,
        ))
    }

    pub fn mock_backend(host_idx: usize, port: u16) -> BackendDescriptor {
        BackendDescriptorBuilder::default()
            .address(NetworkAddress::new(mock_hostname(host_idx), port))
            .ip_address(mock_ip(host_idx))
            .build()
            .unwrap()
    }

    pub fn mock_coordinator_only(ip: IpAddr) -> BackendDescriptor {
        BackendDescriptorBuilder::default()
            .address(NetworkAddress::new(TEST_COORDINATOR_HOSTNAME, TEST_BACKEND_PORT))
            .ip_address(ip)
            .is_executor(false)
            .build()
            .unwrap()
    }

    pub fn mock_hdfs_split(file_name: &str, length: i64) -> ScanRange {
        ScanRange::HdfsFileSplit(HdfsFileSplit {
            file_name: file_name.to_string(),
            offset: 0,
            length,
            partition_id: 0,
            file_length: length,
        })
    }

    pub fn mock_scan_range_locations(
        scan_range: ScanRange,
        replicas: &[(usize, bool)],
    ) -> ScanRangeLocationList {
        ScanRangeLocationList {
            scan_range,
            locations: replicas
                .iter()
                .map(|(host_idx, is_cached)| ScanRangeLocation {
                    host_idx: *host_idx,
                    volume_id: 0,
                    is_cached: *is_cached,
                })
                .collect(),
        }
    }

    pub fn mock_plan_node(node_id: PlanNodeId, node_type: PlanNodeType, num_children: usize) -> PlanNode {
        PlanNode {
            node_id,
            node_type,
            num_children,
            replica_preference: None,
            random_replica: false,
        }
    }

    /// A partitioned fragment holding a single HDFS scan that streams into
    /// `dest_node_id`.
    pub fn mock_scan_fragment(
        idx: usize,
        scan_node_id: PlanNodeId,
        dest_node_id: PlanNodeId,
    ) -> PlanFragment {
        PlanFragmentBuilder::default()
            .idx(idx)
            .display_name(format!("F{:02}", idx))
            .plan(Plan {
                nodes: vec![mock_plan_node(scan_node_id, PlanNodeType::HdfsScanNode, 0)],
            })
            .partition(PartitionType::Random)
            .output_sink(Some(DataStreamSink {
                dest_node_id,
                output_partition: PartitionType::Unpartitioned,
            }))
            .build()
            .unwrap()
    }

    /// An unpartitioned root fragment whose only node is an exchange.
    pub fn mock_coord_fragment(idx: usize, exchange_node_id: PlanNodeId) -> PlanFragment {
        PlanFragmentBuilder::default()
            .idx(idx)
            .display_name(format!("F{:02}", idx))
            .plan(Plan {
                nodes: vec![mock_plan_node(exchange_node_id, PlanNodeType::ExchangeNode, 0)],
            })
            .partition(PartitionType::Unpartitioned)
            .build()
            .unwrap()
    }
}

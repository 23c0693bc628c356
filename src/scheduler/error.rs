use data_model::{FragmentIdx, PlanNodeId};

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SchedulerError {
    #[error("cannot schedule query: no backends are configured")]
    NoBackends,

    #[error(
        "scan range {} of plan node {} has no replica locations",
        scan_range_idx,
        node_id
    )]
    EmptyReplicaList {
        node_id: PlanNodeId,
        scan_range_idx: usize,
    },

    #[error(
        "scan range {} of plan node {} references host index {} outside the host list of size {}",
        scan_range_idx,
        node_id,
        host_idx,
        num_hosts
    )]
    InvalidHostIndex {
        node_id: PlanNodeId,
        scan_range_idx: usize,
        host_idx: usize,
        num_hosts: usize,
    },

    #[error(
        "scan range {} of plan node {} is invalid: {}",
        scan_range_idx,
        node_id,
        reason
    )]
    InvalidScanRange {
        node_id: PlanNodeId,
        scan_range_idx: usize,
        reason: String,
    },

    #[error("plan node {} is not part of any fragment", node_id)]
    UnknownPlanNode { node_id: PlanNodeId },

    #[error("invalid fragment {}: {}", fragment_idx, reason)]
    InvalidFragment {
        fragment_idx: FragmentIdx,
        reason: String,
    },

    #[error("invalid value {} for query option {}: {}", value, name, reason)]
    InvalidQueryOption {
        name: String,
        value: String,
        reason: String,
    },

    #[error("fragment {} has no instances", fragment_idx)]
    NoInstances { fragment_idx: FragmentIdx },

    #[error(
        "schedule covers {} scan ranges but the request has {}",
        assigned,
        expected
    )]
    IncompleteAssignment { expected: usize, assigned: usize },
}

impl SchedulerError {
    /// True when the error was caused by the request rather than by the
    /// state of the cluster.
    pub fn is_invalid_request(&self) -> bool {
        matches!(
            self,
            SchedulerError::EmptyReplicaList { .. }
                | SchedulerError::InvalidHostIndex { .. }
                | SchedulerError::InvalidScanRange { .. }
                | SchedulerError::UnknownPlanNode { .. }
                | SchedulerError::InvalidFragment { .. }
                | SchedulerError::InvalidQueryOption { .. }
        )
    }

    pub fn invalid_fragment(fragment_idx: FragmentIdx, reason: impl Into<String>) -> Self {
        SchedulerError::InvalidFragment {
            fragment_idx,
            reason: reason.into(),
        }
    }
}

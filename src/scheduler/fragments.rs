use std::collections::BTreeSet;

use data_model::{
    FInstanceExecParams,
    FragmentIdx,
    NetworkAddress,
    PerNodeScanRanges,
    PlanFragmentDestination,
    PlanNodeId,
    PlanNodeType,
    QueryExecRequest,
};
use tracing::debug;

use super::{error::SchedulerError, query_schedule::ScheduleState};

fn new_instance(
    state: &mut ScheduleState,
    fragment_idx: FragmentIdx,
    host: NetworkAddress,
    per_fragment_instance_idx: usize,
) -> FInstanceExecParams {
    FInstanceExecParams {
        instance_id: state.next_instance_id(),
        host,
        per_fragment_instance_idx,
        fragment_idx,
        per_node_scan_ranges: PerNodeScanRanges::new(),
        sender_id: None,
    }
}

/// Creates the instances of every fragment and wires each fragment's output
/// to the instances of the fragment it streams into.
pub fn compute_fragment_exec_params(
    request: &QueryExecRequest,
    state: &mut ScheduleState,
) -> Result<(), SchedulerError> {
    for plan_exec_info in &request.plan_exec_info {
        let Some(root) = plan_exec_info.fragments.first() else {
            continue;
        };
        compute_fragment_instances(request, state, root.idx)?;

        for src_fragment in &plan_exec_info.fragments {
            let Some(sink) = &src_fragment.output_sink else {
                continue;
            };
            let dest_idx = state.fragment_idx_for_node(sink.dest_node_id)?;
            route_fragment_output(state, src_fragment.idx, dest_idx, sink.dest_node_id);
        }
    }
    Ok(())
}

/// Points every instance of `src_idx` at all instances of `dest_idx`.
/// Senders into the same exchange are numbered consecutively across all
/// fragments feeding it.
fn route_fragment_output(
    state: &mut ScheduleState,
    src_idx: FragmentIdx,
    dest_idx: FragmentIdx,
    exchange_id: PlanNodeId,
) {
    let destinations: Vec<PlanFragmentDestination> = state
        .fragment_params(dest_idx)
        .instance_exec_params
        .iter()
        .map(|instance| PlanFragmentDestination {
            fragment_instance_id: instance.instance_id,
            server: instance.host.clone(),
        })
        .collect();
    let num_senders = state.fragment_params(src_idx).instance_exec_params.len() as i32;

    let sender_id_base = {
        let num_exchange_senders = state
            .fragment_params_mut(dest_idx)
            .per_exch_num_senders
            .entry(exchange_id)
            .or_insert(0);
        let base = *num_exchange_senders;
        *num_exchange_senders += num_senders;
        base
    };

    let src_params = state.fragment_params_mut(src_idx);
    src_params.destinations = destinations;
    for (i, instance) in src_params.instance_exec_params.iter_mut().enumerate() {
        instance.sender_id = Some(sender_id_base + i as i32);
    }
}

/// Computes instances bottom-up: the inputs of a fragment get their
/// instances before the fragment itself.
fn compute_fragment_instances(
    request: &QueryExecRequest,
    state: &mut ScheduleState,
    fragment_idx: FragmentIdx,
) -> Result<(), SchedulerError> {
    let input_fragments = state.fragment_params(fragment_idx).input_fragments.clone();
    for input_idx in input_fragments {
        compute_fragment_instances(request, state, input_idx)?;
    }

    let fragment = state.fragment(request, fragment_idx);
    if fragment.is_unpartitioned() {
        create_coordinator_instance(state, fragment_idx);
    } else if fragment.plan.contains_node(PlanNodeType::UnionNode) {
        create_union_instances(request, state, fragment_idx);
    } else if let Some(leftmost_scan_id) =
        fragment.plan.leftmost_node(&PlanNodeType::SCAN_NODE_TYPES)
    {
        create_scan_instances(state, fragment_idx, leftmost_scan_id);
    } else {
        create_collocated_instances(state, fragment_idx)?;
    }

    let params = state.fragment_params(fragment_idx);
    debug!(
        fragment_idx,
        fragment = %params.display_name,
        num_instances = params.instance_exec_params.len(),
        "created fragment instances"
    );
    Ok(())
}

/// A single instance on the coordinator that reads every scan range of the
/// fragment.
fn create_coordinator_instance(state: &mut ScheduleState, fragment_idx: FragmentIdx) {
    let coord = state.coord_address().clone();
    let is_coord_fragment = state.fragment_params(fragment_idx).is_coord_fragment;
    let mut instance = if is_coord_fragment {
        FInstanceExecParams {
            instance_id: state.query_id(),
            host: coord,
            per_fragment_instance_idx: 0,
            fragment_idx,
            per_node_scan_ranges: PerNodeScanRanges::new(),
            sender_id: None,
        }
    } else {
        new_instance(state, fragment_idx, coord, 0)
    };

    let params = state.fragment_params_mut(fragment_idx);
    for per_node in params.scan_range_assignment.values() {
        for (node_id, ranges) in per_node {
            instance
                .per_node_scan_ranges
                .entry(*node_id)
                .or_default()
                .extend(ranges.iter().cloned());
        }
    }
    params.instance_exec_params.push(instance);
}

/// One instance per host that either reads scan ranges for the fragment or
/// runs an instance of one of its inputs.
fn create_union_instances(
    request: &QueryExecRequest,
    state: &mut ScheduleState,
    fragment_idx: FragmentIdx,
) {
    let params = state.fragment_params(fragment_idx);
    let mut hosts: BTreeSet<NetworkAddress> =
        params.scan_range_assignment.keys().cloned().collect();
    for input_idx in &params.input_fragments {
        for instance in &state.fragment_params(*input_idx).instance_exec_params {
            hosts.insert(instance.host.clone());
        }
    }
    if hosts.is_empty() {
        debug!(
            fragment_idx,
            num_nodes = state.fragment(request, fragment_idx).plan.nodes.len(),
            "union fragment has no inputs, running it on the coordinator"
        );
        hosts.insert(state.coord_address().clone());
    }

    for (per_fragment_idx, host) in hosts.into_iter().enumerate() {
        let mut instance = new_instance(state, fragment_idx, host, per_fragment_idx);
        let params = state.fragment_params_mut(fragment_idx);
        if let Some(per_node) = params.scan_range_assignment.get(&instance.host) {
            instance.per_node_scan_ranges = per_node.clone();
        }
        params.instance_exec_params.push(instance);
    }
}

/// Splits each host's ranges of the leftmost scan over up to `mt_dop`
/// instances on that host, balancing the weight of the ranges per instance.
/// Without any scan ranges the fragment runs once on the coordinator.
fn create_scan_instances(
    state: &mut ScheduleState,
    fragment_idx: FragmentIdx,
    leftmost_scan_id: PlanNodeId,
) {
    let max_num_instances = state.query_options().mt_dop.max(1) as usize;
    let assignment = state
        .fragment_params(fragment_idx)
        .scan_range_assignment
        .clone();

    if assignment.is_empty() {
        let coord = state.coord_address().clone();
        let instance = new_instance(state, fragment_idx, coord, 0);
        state
            .fragment_params_mut(fragment_idx)
            .instance_exec_params
            .push(instance);
        return;
    }

    for (host, per_node) in &assignment {
        let params_list = per_node
            .get(&leftmost_scan_id)
            .map(|ranges| ranges.as_slice())
            .unwrap_or_default();
        let num_instances = max_num_instances.min(params_list.len()).max(1);
        let total_weight = params_list
            .iter()
            .fold(0i64, |sum, params| sum.saturating_add(params.scan_range.instance_weight()));
        let avg_weight_per_instance = total_weight as f64 / num_instances as f64;

        let mut total_assigned_weight = 0i64;
        let mut params_idx = 0;
        for i in 0..num_instances {
            let per_fragment_idx = state
                .fragment_params(fragment_idx)
                .instance_exec_params
                .len();
            let mut instance = new_instance(state, fragment_idx, host.clone(), per_fragment_idx);
            let threshold = (avg_weight_per_instance * (i + 1) as f64) as i64;
            while params_idx < params_list.len() {
                let params = &params_list[params_idx];
                instance
                    .per_node_scan_ranges
                    .entry(leftmost_scan_id)
                    .or_default()
                    .push(params.clone());
                total_assigned_weight =
                    total_assigned_weight.saturating_add(params.scan_range.instance_weight());
                params_idx += 1;
                if total_assigned_weight >= threshold && i != num_instances - 1 {
                    break;
                }
            }
            // Ranges of the other scans in the fragment go to the host's
            // first instance.
            if i == 0 {
                for (node_id, ranges) in per_node {
                    if *node_id != leftmost_scan_id {
                        instance
                            .per_node_scan_ranges
                            .insert(*node_id, ranges.clone());
                    }
                }
            }
            state
                .fragment_params_mut(fragment_idx)
                .instance_exec_params
                .push(instance);
        }
    }
}

/// Runs one instance next to each instance of the fragment's first input, so
/// that e.g. a merge aggregation runs where its input is produced.
fn create_collocated_instances(
    state: &mut ScheduleState,
    fragment_idx: FragmentIdx,
) -> Result<(), SchedulerError> {
    let params = state.fragment_params(fragment_idx);
    let input_idx = *params.input_fragments.first().ok_or_else(|| {
        SchedulerError::invalid_fragment(
            fragment_idx,
            "partitioned fragment has neither a scan nor an input fragment",
        )
    })?;
    let hosts: Vec<NetworkAddress> = state
        .fragment_params(input_idx)
        .instance_exec_params
        .iter()
        .map(|instance| instance.host.clone())
        .collect();

    for (per_fragment_idx, host) in hosts.into_iter().enumerate() {
        let instance = new_instance(state, fragment_idx, host, per_fragment_idx);
        state
            .fragment_params_mut(fragment_idx)
            .instance_exec_params
            .push(instance);
    }

    // Scan ranges of a scan that is not the leftmost leaf go to the first
    // instance on their host.
    let assignment = state
        .fragment_params(fragment_idx)
        .scan_range_assignment
        .clone();
    for (host, per_node) in assignment {
        let per_fragment_idx = state
            .fragment_params(fragment_idx)
            .instance_exec_params
            .len();
        let existing = state
            .fragment_params(fragment_idx)
            .instance_exec_params
            .iter()
            .position(|instance| instance.host == host);
        let instance_idx = match existing {
            Some(idx) => idx,
            None => {
                let instance = new_instance(state, fragment_idx, host, per_fragment_idx);
                state
                    .fragment_params_mut(fragment_idx)
                    .instance_exec_params
                    .push(instance);
                per_fragment_idx
            }
        };
        let instance =
            &mut state.fragment_params_mut(fragment_idx).instance_exec_params[instance_idx];
        for (node_id, ranges) in per_node {
            instance
                .per_node_scan_ranges
                .entry(node_id)
                .or_default()
                .extend(ranges);
        }
    }
    Ok(())
}

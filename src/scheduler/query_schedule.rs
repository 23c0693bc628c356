use std::collections::{BTreeMap, HashMap};

use data_model::{
    BackendExecParams,
    FragmentExecParams,
    FragmentIdx,
    FragmentInstanceRef,
    NetworkAddress,
    PlanFragment,
    PlanNode,
    PlanNodeId,
    QueryExecRequest,
    QueryOptions,
    QuerySchedule,
    UniqueId,
};

use super::error::SchedulerError;

/// Schedule under construction for one query.
///
/// Fragments are looked up in the request by their global index, which must
/// match their position across all plans of the request. Every fragment
/// streams into a fragment with a smaller index, so the fragments of a plan
/// form a tree rooted at its first fragment.
#[derive(Debug)]
pub struct ScheduleState {
    query_id: UniqueId,
    coord_address: NetworkAddress,
    query_options: QueryOptions,
    fragment_exec_params: Vec<FragmentExecParams>,
    fragment_positions: Vec<(usize, usize)>,
    plan_node_to_fragment_idx: HashMap<PlanNodeId, FragmentIdx>,
    plan_node_to_plan_node_idx: HashMap<PlanNodeId, usize>,
    next_instance_idx: i32,
    num_scan_ranges: usize,
}

impl ScheduleState {
    pub fn new(
        request: &QueryExecRequest,
        query_options: QueryOptions,
        coord_address: NetworkAddress,
    ) -> Result<Self, SchedulerError> {
        let query_id = request
            .query_id
            .map(|id| id.query_id())
            .unwrap_or_else(UniqueId::new_query_id);

        let mut fragment_exec_params = Vec::new();
        let mut fragment_positions = Vec::new();
        let mut plan_node_to_fragment_idx = HashMap::new();
        let mut plan_node_to_plan_node_idx = HashMap::new();

        for (plan_idx, plan_exec_info) in request.plan_exec_info.iter().enumerate() {
            for (position, fragment) in plan_exec_info.fragments.iter().enumerate() {
                if fragment.idx != fragment_exec_params.len() {
                    return Err(SchedulerError::invalid_fragment(
                        fragment.idx,
                        format!("expected fragment index {}", fragment_exec_params.len()),
                    ));
                }
                let is_coord_fragment = fragment.idx == 0 && fragment.is_unpartitioned();
                fragment_exec_params.push(FragmentExecParams::new(fragment, is_coord_fragment));
                fragment_positions.push((plan_idx, position));

                for (node_idx, node) in fragment.plan.nodes.iter().enumerate() {
                    if plan_node_to_fragment_idx
                        .insert(node.node_id, fragment.idx)
                        .is_some()
                    {
                        return Err(SchedulerError::invalid_fragment(
                            fragment.idx,
                            format!("plan node {} appears more than once", node.node_id),
                        ));
                    }
                    plan_node_to_plan_node_idx.insert(node.node_id, node_idx);
                }
            }
        }
        if fragment_exec_params.is_empty() {
            return Err(SchedulerError::invalid_fragment(0, "request has no fragments"));
        }

        let mut state = Self {
            query_id,
            coord_address,
            query_options,
            fragment_exec_params,
            fragment_positions,
            plan_node_to_fragment_idx,
            plan_node_to_plan_node_idx,
            next_instance_idx: 0,
            num_scan_ranges: request.num_scan_ranges(),
        };
        state.link_input_fragments(request)?;
        Ok(state)
    }

    fn link_input_fragments(&mut self, request: &QueryExecRequest) -> Result<(), SchedulerError> {
        for fragment in request.fragments() {
            let Some(sink) = &fragment.output_sink else {
                continue;
            };
            let dest_idx = self.fragment_idx_for_node(sink.dest_node_id)?;
            if dest_idx >= fragment.idx {
                return Err(SchedulerError::invalid_fragment(
                    fragment.idx,
                    format!("output streams into later fragment {}", dest_idx),
                ));
            }
            let (src_plan, _) = self.fragment_positions[fragment.idx];
            let (dest_plan, _) = self.fragment_positions[dest_idx];
            if src_plan != dest_plan {
                return Err(SchedulerError::invalid_fragment(
                    fragment.idx,
                    format!("output streams into fragment {} of another plan", dest_idx),
                ));
            }
            self.fragment_exec_params[dest_idx]
                .input_fragments
                .push(fragment.idx);
        }
        Ok(())
    }

    pub fn query_id(&self) -> UniqueId {
        self.query_id
    }

    pub fn coord_address(&self) -> &NetworkAddress {
        &self.coord_address
    }

    pub fn query_options(&self) -> &QueryOptions {
        &self.query_options
    }

    /// Instance ids count up from the query id. The query id itself is
    /// reserved for the coordinator fragment's instance.
    pub fn next_instance_id(&mut self) -> UniqueId {
        self.next_instance_idx += 1;
        self.query_id.with_instance_idx(self.next_instance_idx)
    }

    pub fn fragment<'r>(&self, request: &'r QueryExecRequest, idx: FragmentIdx) -> &'r PlanFragment {
        let (plan_idx, position) = self.fragment_positions[idx];
        &request.plan_exec_info[plan_idx].fragments[position]
    }

    pub fn fragment_idx_for_node(&self, node_id: PlanNodeId) -> Result<FragmentIdx, SchedulerError> {
        self.plan_node_to_fragment_idx
            .get(&node_id)
            .copied()
            .ok_or(SchedulerError::UnknownPlanNode { node_id })
    }

    pub fn containing_fragment<'r>(
        &self,
        request: &'r QueryExecRequest,
        node_id: PlanNodeId,
    ) -> Result<&'r PlanFragment, SchedulerError> {
        let idx = self.fragment_idx_for_node(node_id)?;
        Ok(self.fragment(request, idx))
    }

    pub fn node<'r>(
        &self,
        request: &'r QueryExecRequest,
        node_id: PlanNodeId,
    ) -> Result<&'r PlanNode, SchedulerError> {
        let fragment = self.containing_fragment(request, node_id)?;
        let node_idx = self
            .plan_node_to_plan_node_idx
            .get(&node_id)
            .copied()
            .ok_or(SchedulerError::UnknownPlanNode { node_id })?;
        fragment
            .plan
            .nodes
            .get(node_idx)
            .ok_or(SchedulerError::UnknownPlanNode { node_id })
    }

    pub fn fragment_params(&self, idx: FragmentIdx) -> &FragmentExecParams {
        &self.fragment_exec_params[idx]
    }

    pub fn fragment_params_mut(&mut self, idx: FragmentIdx) -> &mut FragmentExecParams {
        &mut self.fragment_exec_params[idx]
    }

    /// Checks that every fragment got instances and that every scan range of
    /// the request ended up on exactly one instance.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        let mut assigned = 0;
        for params in &self.fragment_exec_params {
            if params.instance_exec_params.is_empty() {
                return Err(SchedulerError::NoInstances {
                    fragment_idx: params.fragment_idx,
                });
            }
            assigned += params
                .instance_exec_params
                .iter()
                .map(|instance| instance.num_scan_ranges())
                .sum::<usize>();
        }
        if assigned != self.num_scan_ranges {
            return Err(SchedulerError::IncompleteAssignment {
                expected: self.num_scan_ranges,
                assigned,
            });
        }
        Ok(())
    }

    pub fn into_schedule(self) -> QuerySchedule {
        let mut per_backend_exec_params: BTreeMap<NetworkAddress, BackendExecParams> =
            BTreeMap::new();
        for params in &self.fragment_exec_params {
            for (instance_idx, instance) in params.instance_exec_params.iter().enumerate() {
                per_backend_exec_params
                    .entry(instance.host.clone())
                    .or_default()
                    .instances
                    .push(FragmentInstanceRef {
                        fragment_idx: params.fragment_idx,
                        instance_idx,
                    });
            }
        }

        QuerySchedule {
            query_id: self.query_id,
            coord_address: self.coord_address,
            query_options: self.query_options,
            fragment_exec_params: self.fragment_exec_params,
            per_backend_exec_params,
            num_scan_ranges: self.num_scan_ranges,
        }
    }
}

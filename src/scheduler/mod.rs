pub mod assignment;
pub mod backend_config;
pub mod error;
pub mod fragments;
pub mod membership;
pub mod placement;
pub mod query_schedule;
pub mod registry;

#[cfg(test)]
pub mod test_util;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use data_model::{BackendDescriptor, BackendId, QueryExecRequest, QueryOptions, QuerySchedule};
use metrics::{scheduler_stats, Timer};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{info, info_span};

use self::{
    backend_config::BackendConfig,
    error::SchedulerError,
    fragments::compute_fragment_exec_params,
    membership::MembershipUpdater,
    placement::{compute_scan_range_assignment, ScanNodePlacement},
    query_schedule::ScheduleState,
    registry::BackendRegistry,
};
use crate::config::SchedulerConfig;

/// Seed used for plan nodes that do not ask for random replica selection
/// when the server is not configured with a seed.
const DEFAULT_RANDOM_SEED: u64 = 0;

/// Assigns the scan ranges of queries to backends and turns the result into
/// per-instance execution parameters.
pub struct Scheduler {
    registry: Arc<BackendRegistry>,
    coord_only_backend_config: BackendConfig,
    local_backend_id: BackendId,
    local_backend: BackendDescriptor,
    metrics: Arc<scheduler_stats::Metrics>,
    random_seed: Option<u64>,
    default_query_options: QueryOptions,
    num_schedule_calls: AtomicU64,
}

impl Scheduler {
    pub fn new(
        local_backend_id: BackendId,
        local_backend: BackendDescriptor,
        config: &SchedulerConfig,
        metrics: Arc<scheduler_stats::Metrics>,
    ) -> Self {
        info!(
            backend_id = local_backend_id.get(),
            address = %local_backend.address,
            ip = %local_backend.ip_address,
            "scheduler using local backend"
        );
        let coord_only_backend_config = BackendConfig::from_backends(vec![local_backend.clone()]);
        metrics.set_initialized();

        Self {
            registry: Arc::new(BackendRegistry::default()),
            coord_only_backend_config,
            local_backend_id,
            local_backend,
            metrics,
            random_seed: config.random_seed,
            default_query_options: config.default_query_options.clone(),
            num_schedule_calls: AtomicU64::new(0),
        }
    }

    pub fn backend_config(&self) -> Arc<BackendConfig> {
        self.registry.get()
    }

    pub fn metrics(&self) -> &scheduler_stats::Metrics {
        &self.metrics
    }

    /// Creates the updater that feeds membership changes into this
    /// scheduler. Only one updater may be running per scheduler.
    pub fn membership_updater(&self) -> MembershipUpdater {
        MembershipUpdater::new(
            self.registry.clone(),
            self.local_backend_id.clone(),
            self.local_backend.clone(),
            self.metrics.clone(),
        )
    }

    /// Builds the schedule of a query against the current membership
    /// snapshot. Either every scan range of the request is placed or an
    /// error is returned.
    pub fn schedule(&self, request: &QueryExecRequest) -> Result<QuerySchedule, SchedulerError> {
        let _timer = Timer::start(&self.metrics.schedule_latency);
        let query_options = self.resolve_query_options(request)?;
        let mut state =
            ScheduleState::new(request, query_options, self.local_backend.address.clone())?;

        let span = info_span!("schedule", query_id = %state.query_id());
        let _enter = span.enter();

        self.compute_scan_range_assignment(request, &mut state)?;
        compute_fragment_exec_params(request, &mut state)?;
        state.validate()?;

        let schedule = state.into_schedule();
        info!(
            num_fragments = schedule.fragment_exec_params.len(),
            num_fragment_instances = schedule.num_fragment_instances(),
            num_backends = schedule.per_backend_exec_params.len(),
            num_scan_ranges = schedule.num_scan_ranges,
            "query scheduled"
        );
        Ok(schedule)
    }

    fn resolve_query_options(
        &self,
        request: &QueryExecRequest,
    ) -> Result<QueryOptions, SchedulerError> {
        let mut query_options = request
            .query_options
            .clone()
            .unwrap_or_else(|| self.default_query_options.clone());
        query_options
            .validate()
            .map_err(|e| SchedulerError::InvalidQueryOption {
                name: "mt_dop".to_string(),
                value: query_options.mt_dop.to_string(),
                reason: e.to_string(),
            })?;
        for (name, value) in &request.query_option_overrides {
            query_options
                .set_option(name, value)
                .map_err(|e| SchedulerError::InvalidQueryOption {
                    name: name.clone(),
                    value: value.clone(),
                    reason: e.to_string(),
                })?;
        }
        Ok(query_options)
    }

    /// Places the scan ranges of every scan node. Nodes in unpartitioned
    /// fragments run on the coordinator, so their ranges are placed against
    /// a snapshot holding only the local backend.
    fn compute_scan_range_assignment(
        &self,
        request: &QueryExecRequest,
        state: &mut ScheduleState,
    ) -> Result<(), SchedulerError> {
        let backend_config = self.registry.get();
        let query_options = state.query_options().clone();
        // A seeded scheduler still draws a different permutation for random
        // replica selection on every call, in a reproducible sequence.
        let call_idx = self.num_schedule_calls.fetch_add(1, Ordering::Relaxed);
        let mut call_rng = match self.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(call_idx)),
            None => StdRng::from_os_rng(),
        };

        for plan_exec_info in &request.plan_exec_info {
            for (node_id, locations) in &plan_exec_info.per_node_scan_ranges {
                let fragment = state.containing_fragment(request, *node_id)?;
                let node = state.node(request, *node_id)?;
                if !node.node_type.is_scan() {
                    return Err(SchedulerError::invalid_fragment(
                        fragment.idx,
                        format!("scan ranges given for non-scan node {}", node_id),
                    ));
                }
                let exec_at_coord = fragment.is_unpartitioned();
                let config = if exec_at_coord {
                    &self.coord_only_backend_config
                } else {
                    backend_config.as_ref()
                };

                let placement =
                    ScanNodePlacement::new(node, locations, &request.host_list, &query_options);
                // Plan nodes that break ties by list order get the same
                // permutation on every call, which keeps their schedule stable.
                let mut node_rng = if placement.random_replica() {
                    StdRng::seed_from_u64(call_rng.random())
                } else {
                    StdRng::seed_from_u64(self.random_seed.unwrap_or(DEFAULT_RANDOM_SEED))
                };
                let assignment = &mut state.fragment_params_mut(fragment.idx).scan_range_assignment;
                compute_scan_range_assignment(
                    config,
                    &placement,
                    &mut node_rng,
                    &self.metrics,
                    assignment,
                )?;
            }
        }
        Ok(())
    }
}

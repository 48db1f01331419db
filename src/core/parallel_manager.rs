//! Parallel region coordination.
//!
//! Unlike loops, every iteration of a parallel region is schedulable at
//! once; instances only wait on their own in-iteration dependencies. The
//! manager tracks which iterations have finished, folds their results
//! into an index-ordered aggregate, and reports the region's phase to the
//! coordinator handler.

use std::collections::HashSet;

use serde_json::Value;

use crate::core::block_ref::{BlockRef, SubflowKind};
use crate::core::context::{DistributionItems, ExecutionContext, ParallelState};
use crate::core::subflow;
use crate::expression::{self, EvaluatedCollection};
use crate::resolver::Resolver;
use crate::workflow::schema::{ParallelDescriptor, ParallelType, SerializedWorkflow};

/// Upper bound on fan-out width. Wider distributions are truncated.
pub const MAX_PARALLEL_BRANCHES: usize = 20;

/// Where a parallel region stands after a scheduling pass.
#[derive(Debug, Clone, PartialEq)]
pub enum ParallelPhase {
    /// Distribution did not evaluate; the region cannot start.
    Unavailable,
    /// Some iterations are still running.
    Waiting { completed: usize, total: usize },
    /// Every iteration finished; results are in iteration-index order.
    Complete { results: Vec<Value> },
    /// An instance failed with no error route inside the region.
    Failed { iteration: usize, error: String },
}

pub struct ParallelManager<'a> {
    workflow: &'a SerializedWorkflow,
    descriptor: &'a ParallelDescriptor,
}

impl<'a> ParallelManager<'a> {
    pub fn new(workflow: &'a SerializedWorkflow, descriptor: &'a ParallelDescriptor) -> Self {
        Self {
            workflow,
            descriptor,
        }
    }

    fn seeds(&self) -> Vec<String> {
        subflow::start_targets(self.workflow, &self.descriptor.id, &self.descriptor.nodes)
    }

    /// Bind fan-out state on first activation. Returns `false` when a
    /// collection distribution cannot be evaluated yet; the region then
    /// stays inactive without failing the run.
    pub fn ensure_initialized(&self, resolver: &Resolver, ctx: &ExecutionContext) -> bool {
        if ctx.has_parallel_state(&self.descriptor.id) {
            return true;
        }
        let (count, items) = match self.descriptor.parallel_type {
            ParallelType::Count => {
                let count = self.descriptor.count.unwrap_or(1);
                (count, DistributionItems::None)
            }
            ParallelType::Collection => {
                let scope = BlockRef::real(&self.descriptor.id);
                let resolve =
                    |name: &str| resolver.lookup_reference(name, ctx, &scope).ok();
                match expression::evaluate_collection(&self.descriptor.distribution, &resolve) {
                    Some(EvaluatedCollection::List(items)) => {
                        (items.len(), DistributionItems::List(items))
                    }
                    Some(EvaluatedCollection::Keyed(entries)) => {
                        (entries.len(), DistributionItems::Keyed(entries))
                    }
                    None => return false,
                }
            }
        };
        let capped = count.min(MAX_PARALLEL_BRANCHES);
        if capped < count {
            tracing::warn!(
                parallel_id = %self.descriptor.id,
                requested = count,
                capped,
                "parallel fan-out truncated"
            );
        }
        tracing::debug!(
            parallel_id = %self.descriptor.id,
            branches = capped,
            "parallel activated"
        );
        ctx.init_parallel(
            &self.descriptor.id,
            ParallelState::new(capped, items, self.descriptor.parallel_type),
        );
        true
    }

    /// Fold finished iterations into the aggregate and report the
    /// region's phase. Idempotent: each iteration is folded once.
    pub fn poll(&self, ctx: &ExecutionContext) -> ParallelPhase {
        let id = &self.descriptor.id;
        let Some(state) = ctx.parallel_state(id) else {
            return ParallelPhase::Unavailable;
        };
        let seeds = self.seeds();

        for iteration in 0..state.parallel_count {
            if let Some(error) = subflow::first_unrouted_error(
                self.workflow,
                &self.descriptor.nodes,
                SubflowKind::Parallel,
                id,
                iteration,
                ctx,
            ) {
                return ParallelPhase::Failed { iteration, error };
            }
        }

        for iteration in 0..state.parallel_count {
            if state.execution_results.contains_key(&iteration) {
                continue;
            }
            if subflow::iteration_complete(
                self.workflow,
                &self.descriptor.nodes,
                &seeds,
                SubflowKind::Parallel,
                id,
                iteration,
                ctx,
            ) {
                let result = subflow::iteration_result(
                    &self.descriptor.nodes,
                    SubflowKind::Parallel,
                    id,
                    iteration,
                    ctx,
                );
                ctx.with_parallel_state(id, |s| {
                    if s.execution_results.insert(iteration, result).is_none() {
                        s.completed_executions += 1;
                        s.active_iterations.remove(&iteration);
                    }
                });
            }
        }

        let Some(state) = ctx.parallel_state(id) else {
            return ParallelPhase::Unavailable;
        };
        if state.completed_executions >= state.parallel_count {
            let results = (0..state.parallel_count)
                .map(|i| {
                    state
                        .execution_results
                        .get(&i)
                        .cloned()
                        .unwrap_or(Value::Null)
                })
                .collect();
            ParallelPhase::Complete { results }
        } else {
            ParallelPhase::Waiting {
                completed: state.completed_executions,
                total: state.parallel_count,
            }
        }
    }

    /// Runnable instances across every live iteration, iteration-major in
    /// body order: still reachable, unexecuted, and with every in-region
    /// upstream instance already executed.
    pub fn schedulable_instances(&self, ctx: &ExecutionContext) -> Vec<BlockRef> {
        let id = &self.descriptor.id;
        let Some(state) = ctx.parallel_state(id) else {
            return Vec::new();
        };
        let seeds = self.seeds();
        let members: HashSet<&str> =
            self.descriptor.nodes.iter().map(String::as_str).collect();
        let mut instances = Vec::new();
        for iteration in 0..state.parallel_count {
            if state.execution_results.contains_key(&iteration) {
                continue;
            }
            let reachable: HashSet<String> = subflow::reachable_at_iteration(
                self.workflow,
                &self.descriptor.nodes,
                &seeds,
                SubflowKind::Parallel,
                id,
                iteration,
                ctx,
            );
            for node in &self.descriptor.nodes {
                if !reachable.contains(node.as_str()) {
                    continue;
                }
                if !subflow::upstream_satisfied(
                    self.workflow,
                    &members,
                    &reachable,
                    node,
                    SubflowKind::Parallel,
                    id,
                    iteration,
                    ctx,
                ) {
                    continue;
                }
                let instance =
                    BlockRef::virtual_instance(node, SubflowKind::Parallel, id, iteration);
                if !ctx.is_executed(&instance) {
                    instances.push(instance);
                }
            }
        }
        instances
    }
}

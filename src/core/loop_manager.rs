//! Loop region coordination.
//!
//! A loop block never runs its body directly. The executor re-invokes it
//! every scheduling pass; [`LoopManager`] turns the recorded instance
//! state into a phase: still iterating, complete with aggregated results,
//! failed, or not yet startable.
//!
//! Iterations are sequential. Only the current iteration's instances are
//! ever schedulable, and the manager advances to the next iteration once
//! every expected instance of the current one has executed.

use std::collections::HashSet;

use serde_json::{json, Value};

use crate::core::block_ref::{BlockRef, SubflowKind};
use crate::core::context::{ExecutionContext, LoopState};
use crate::core::subflow;
use crate::expression::{self, EvaluatedCollection};
use crate::resolver::Resolver;
use crate::workflow::schema::{LoopDescriptor, LoopType, SerializedWorkflow};

/// Where a loop region stands after a scheduling pass.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopPhase {
    /// forEach collection did not evaluate; the region cannot start.
    Unavailable,
    /// The current iteration still has expected instances to run.
    Iterating { iteration: usize },
    /// Every iteration finished; results are in iteration order.
    Complete { results: Vec<Value> },
    /// An instance failed with no error route inside the region.
    Failed { iteration: usize, error: String },
}

pub struct LoopManager<'a> {
    workflow: &'a SerializedWorkflow,
    descriptor: &'a LoopDescriptor,
}

impl<'a> LoopManager<'a> {
    pub fn new(workflow: &'a SerializedWorkflow, descriptor: &'a LoopDescriptor) -> Self {
        Self {
            workflow,
            descriptor,
        }
    }

    fn seeds(&self) -> Vec<String> {
        subflow::start_targets(self.workflow, &self.descriptor.id, &self.descriptor.nodes)
    }

    /// Bind iteration state on first activation. Returns `false` when a
    /// forEach collection cannot be evaluated yet; the region then stays
    /// inactive without failing the run.
    pub fn ensure_initialized(&self, resolver: &Resolver, ctx: &ExecutionContext) -> bool {
        if ctx.has_loop_state(&self.descriptor.id) {
            return true;
        }
        let state = match self.descriptor.loop_type {
            LoopType::For => LoopState::new(self.descriptor.iterations, None),
            LoopType::ForEach => {
                let scope = BlockRef::real(&self.descriptor.id);
                let resolve =
                    |name: &str| resolver.lookup_reference(name, ctx, &scope).ok();
                match expression::evaluate_collection(&self.descriptor.for_each_items, &resolve)
                {
                    Some(EvaluatedCollection::List(items)) => {
                        LoopState::new(items.len(), Some(items))
                    }
                    Some(EvaluatedCollection::Keyed(entries)) => {
                        let items: Vec<Value> = entries
                            .into_iter()
                            .map(|(key, value)| json!([key, value]))
                            .collect();
                        LoopState::new(items.len(), Some(items))
                    }
                    None => return false,
                }
            }
        };
        tracing::debug!(
            loop_id = %self.descriptor.id,
            iterations = state.total_iterations,
            "loop activated"
        );
        ctx.init_loop(&self.descriptor.id, state);
        true
    }

    /// Advance past finished iterations and report the region's phase.
    /// Idempotent: a finished iteration is folded into the results once.
    pub fn poll(&self, ctx: &ExecutionContext) -> LoopPhase {
        let id = &self.descriptor.id;
        let seeds = self.seeds();
        loop {
            let Some(state) = ctx.loop_state(id) else {
                return LoopPhase::Unavailable;
            };
            if state.current_iteration >= state.total_iterations {
                return LoopPhase::Complete {
                    results: state.results,
                };
            }
            let iteration = state.current_iteration;
            if let Some(error) = subflow::first_unrouted_error(
                self.workflow,
                &self.descriptor.nodes,
                SubflowKind::Loop,
                id,
                iteration,
                ctx,
            ) {
                return LoopPhase::Failed { iteration, error };
            }
            if !subflow::iteration_complete(
                self.workflow,
                &self.descriptor.nodes,
                &seeds,
                SubflowKind::Loop,
                id,
                iteration,
                ctx,
            ) {
                return LoopPhase::Iterating { iteration };
            }
            let result = subflow::iteration_result(
                &self.descriptor.nodes,
                SubflowKind::Loop,
                id,
                iteration,
                ctx,
            );
            ctx.with_loop_state(id, |s| {
                if s.current_iteration == iteration {
                    s.results.push(result);
                    s.current_iteration += 1;
                }
            });
        }
    }

    /// Runnable instances of the current iteration, in body order: still
    /// reachable, unexecuted, and with every in-region upstream instance
    /// already executed.
    pub fn schedulable_instances(&self, ctx: &ExecutionContext) -> Vec<BlockRef> {
        let id = &self.descriptor.id;
        let Some(state) = ctx.loop_state(id) else {
            return Vec::new();
        };
        if state.current_iteration >= state.total_iterations {
            return Vec::new();
        }
        let iteration = state.current_iteration;
        let members: HashSet<&str> =
            self.descriptor.nodes.iter().map(String::as_str).collect();
        let reachable = subflow::reachable_at_iteration(
            self.workflow,
            &self.descriptor.nodes,
            &self.seeds(),
            SubflowKind::Loop,
            id,
            iteration,
            ctx,
        );
        self.descriptor
            .nodes
            .iter()
            .filter(|node| reachable.contains(node.as_str()))
            .filter(|node| {
                subflow::upstream_satisfied(
                    self.workflow,
                    &members,
                    &reachable,
                    node,
                    SubflowKind::Loop,
                    id,
                    iteration,
                    ctx,
                )
            })
            .map(|node| BlockRef::virtual_instance(node, SubflowKind::Loop, id, iteration))
            .filter(|instance| !ctx.is_executed(instance))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loop_workflow(descriptor: Value) -> SerializedWorkflow {
        SerializedWorkflow::from_json(
            &serde_json::to_string(&json!({
                "version": "1.0",
                "blocks": [
                    {"id": "loop1", "metadata": {"id": "loop", "name": "Loop"}},
                    {"id": "body", "metadata": {"id": "function", "name": "Body"}}
                ],
                "connections": [
                    {"source": "loop1", "target": "body", "sourceHandle": "loop-start-source"}
                ],
                "loops": {"loop1": descriptor}
            }))
            .unwrap(),
        )
        .unwrap()
    }

    fn run_iteration(ctx: &ExecutionContext, iteration: usize, output: Value) {
        ctx.record_output(
            &BlockRef::virtual_instance("body", SubflowKind::Loop, "loop1", iteration),
            output,
            1,
        );
    }

    #[test]
    fn test_for_loop_advances_sequentially() {
        let workflow = loop_workflow(json!({
            "id": "loop1", "nodes": ["body"], "iterations": 2
        }));
        let descriptor = &workflow.loops["loop1"];
        let manager = LoopManager::new(&workflow, descriptor);
        let ctx = ExecutionContext::new("wf");
        let resolver = Resolver::new(&workflow);

        assert!(manager.ensure_initialized(&resolver, &ctx));
        assert_eq!(manager.poll(&ctx), LoopPhase::Iterating { iteration: 0 });

        run_iteration(&ctx, 0, json!({"n": 0}));
        assert_eq!(manager.poll(&ctx), LoopPhase::Iterating { iteration: 1 });

        run_iteration(&ctx, 1, json!({"n": 1}));
        assert_eq!(
            manager.poll(&ctx),
            LoopPhase::Complete {
                results: vec![json!({"n": 0}), json!({"n": 1})]
            }
        );
    }

    #[test]
    fn test_for_each_binds_items() {
        let workflow = loop_workflow(json!({
            "id": "loop1", "nodes": ["body"], "loopType": "forEach",
            "forEachItems": [1, 2, 3, 4, 5]
        }));
        let descriptor = &workflow.loops["loop1"];
        let manager = LoopManager::new(&workflow, descriptor);
        let ctx = ExecutionContext::new("wf");
        let resolver = Resolver::new(&workflow);

        assert!(manager.ensure_initialized(&resolver, &ctx));
        let state = ctx.loop_state("loop1").unwrap();
        assert_eq!(state.total_iterations, 5);
        assert_eq!(state.items.unwrap().len(), 5);
    }

    #[test]
    fn test_for_each_keyed_object_binds_entries() {
        let workflow = loop_workflow(json!({
            "id": "loop1", "nodes": ["body"], "loopType": "forEach",
            "forEachItems": {"a": 1, "b": 2}
        }));
        let descriptor = &workflow.loops["loop1"];
        let manager = LoopManager::new(&workflow, descriptor);
        let ctx = ExecutionContext::new("wf");
        let resolver = Resolver::new(&workflow);

        assert!(manager.ensure_initialized(&resolver, &ctx));
        let items = ctx.loop_state("loop1").unwrap().items.unwrap();
        assert!(items.contains(&json!(["a", 1])));
        assert!(items.contains(&json!(["b", 2])));
    }

    #[test]
    fn test_unevaluable_for_each_stays_unavailable() {
        let workflow = loop_workflow(json!({
            "id": "loop1", "nodes": ["body"], "loopType": "forEach",
            "forEachItems": "definitely not a collection"
        }));
        let descriptor = &workflow.loops["loop1"];
        let manager = LoopManager::new(&workflow, descriptor);
        let ctx = ExecutionContext::new("wf");
        let resolver = Resolver::new(&workflow);

        assert!(!manager.ensure_initialized(&resolver, &ctx));
        assert_eq!(manager.poll(&ctx), LoopPhase::Unavailable);
    }

    #[test]
    fn test_empty_collection_completes_immediately() {
        let workflow = loop_workflow(json!({
            "id": "loop1", "nodes": ["body"], "loopType": "forEach",
            "forEachItems": []
        }));
        let descriptor = &workflow.loops["loop1"];
        let manager = LoopManager::new(&workflow, descriptor);
        let ctx = ExecutionContext::new("wf");
        let resolver = Resolver::new(&workflow);

        assert!(manager.ensure_initialized(&resolver, &ctx));
        assert_eq!(manager.poll(&ctx), LoopPhase::Complete { results: vec![] });
    }

    #[test]
    fn test_unrouted_failure_fails_the_region() {
        let workflow = loop_workflow(json!({
            "id": "loop1", "nodes": ["body"], "iterations": 3
        }));
        let descriptor = &workflow.loops["loop1"];
        let manager = LoopManager::new(&workflow, descriptor);
        let ctx = ExecutionContext::new("wf");
        let resolver = Resolver::new(&workflow);

        manager.ensure_initialized(&resolver, &ctx);
        run_iteration(&ctx, 0, json!({"error": "iteration exploded"}));
        assert_eq!(
            manager.poll(&ctx),
            LoopPhase::Failed {
                iteration: 0,
                error: "iteration exploded".to_string()
            }
        );
    }

    #[test]
    fn test_only_current_iteration_is_schedulable() {
        let workflow = loop_workflow(json!({
            "id": "loop1", "nodes": ["body"], "iterations": 3
        }));
        let descriptor = &workflow.loops["loop1"];
        let manager = LoopManager::new(&workflow, descriptor);
        let ctx = ExecutionContext::new("wf");
        let resolver = Resolver::new(&workflow);

        manager.ensure_initialized(&resolver, &ctx);
        let instances = manager.schedulable_instances(&ctx);
        assert_eq!(
            instances,
            vec![BlockRef::virtual_instance(
                "body",
                SubflowKind::Loop,
                "loop1",
                0
            )]
        );

        run_iteration(&ctx, 0, json!({"ok": true}));
        manager.poll(&ctx);
        let instances = manager.schedulable_instances(&ctx);
        assert_eq!(instances[0].iteration(), Some(1));
    }

    #[test]
    fn test_chained_body_schedules_in_dependency_order() {
        let workflow = SerializedWorkflow::from_json(
            &serde_json::to_string(&json!({
                "version": "1.0",
                "blocks": [
                    {"id": "loop1", "metadata": {"id": "loop", "name": "Loop"}},
                    {"id": "first", "metadata": {"id": "function", "name": "First"}},
                    {"id": "second", "metadata": {"id": "function", "name": "Second"}}
                ],
                "connections": [
                    {"source": "loop1", "target": "first", "sourceHandle": "loop-start-source"},
                    {"source": "first", "target": "second"}
                ],
                "loops": {
                    "loop1": {"id": "loop1", "nodes": ["first", "second"], "iterations": 1}
                }
            }))
            .unwrap(),
        )
        .unwrap();
        let descriptor = &workflow.loops["loop1"];
        let manager = LoopManager::new(&workflow, descriptor);
        let ctx = ExecutionContext::new("wf");
        let resolver = Resolver::new(&workflow);

        manager.ensure_initialized(&resolver, &ctx);
        let instances = manager.schedulable_instances(&ctx);
        assert_eq!(
            instances,
            vec![BlockRef::virtual_instance(
                "first",
                SubflowKind::Loop,
                "loop1",
                0
            )]
        );

        ctx.record_output(
            &BlockRef::virtual_instance("first", SubflowKind::Loop, "loop1", 0),
            json!({"ok": true}),
            1,
        );
        let instances = manager.schedulable_instances(&ctx);
        assert_eq!(
            instances,
            vec![BlockRef::virtual_instance(
                "second",
                SubflowKind::Loop,
                "loop1",
                0
            )]
        );
    }
}

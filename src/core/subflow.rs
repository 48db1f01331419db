//! Shared machinery for loop and parallel regions.
//!
//! Body blocks of a region never execute under their real ids. Each
//! iteration runs them as virtual instances keyed by
//! [`BlockRef::Virtual`], so the executed set only ever grows and two
//! iterations of the same node never collide.
//!
//! The helpers here answer the three questions both region kinds share:
//! which instances an iteration is expected to run, whether an iteration
//! has finished, and whether it failed without an error route.

use std::collections::{HashSet, VecDeque};

use serde_json::Value;

use crate::core::block_ref::{BlockRef, SubflowKind};
use crate::core::context::ExecutionContext;
use crate::error::extract_error_message;
use crate::workflow::schema::{BlockKind, ConnectionHandle, SerializedWorkflow};

/// Targets of the coordinator's start-handle edges that belong to the
/// region body. These seed each iteration.
pub fn start_targets(
    workflow: &SerializedWorkflow,
    coordinator_id: &str,
    nodes: &[String],
) -> Vec<String> {
    workflow
        .outgoing(coordinator_id)
        .filter(|c| c.source_handle.is_subflow_start())
        .filter(|c| nodes.iter().any(|n| *n == c.target))
        .map(|c| c.target.clone())
        .collect()
}

/// Body nodes expected to run in iteration `iteration`, given the
/// decisions and failures recorded so far.
///
/// Walks region-internal edges from the start targets. Branch targets of
/// an unexecuted router/condition instance are not yet expected; error
/// targets become expected only once their source instance failed, and a
/// failed instance stops feeding its plain edges.
pub fn reachable_at_iteration(
    workflow: &SerializedWorkflow,
    nodes: &[String],
    seeds: &[String],
    kind: SubflowKind,
    region_id: &str,
    iteration: usize,
    ctx: &ExecutionContext,
) -> HashSet<String> {
    let members: HashSet<&str> = nodes.iter().map(String::as_str).collect();
    let mut reachable: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = seeds
        .iter()
        .filter(|s| members.contains(s.as_str()))
        .cloned()
        .collect();

    while let Some(node) = queue.pop_front() {
        if !reachable.insert(node.clone()) {
            continue;
        }
        let instance = BlockRef::virtual_instance(&node, kind, region_id, iteration);
        let executed = ctx.is_executed(&instance);
        let errored = executed && ctx.output_has_error(&instance);
        let node_kind = workflow
            .block(&node)
            .map(|b| b.kind())
            .unwrap_or(BlockKind::Unknown);

        for conn in workflow.outgoing(&node) {
            if !members.contains(conn.target.as_str()) {
                continue;
            }
            let follow = match conn.source_handle {
                ConnectionHandle::Error => errored,
                ConnectionHandle::ConditionTrue => {
                    node_kind == BlockKind::Condition
                        && ctx.condition_decision(&instance) == Some(true)
                }
                ConnectionHandle::ConditionFalse => {
                    node_kind == BlockKind::Condition
                        && ctx.condition_decision(&instance) == Some(false)
                }
                _ => {
                    if node_kind == BlockKind::Router {
                        ctx.router_decision(&instance).as_deref() == Some(conn.target.as_str())
                    } else {
                        !errored
                    }
                }
            };
            if follow {
                queue.push_back(conn.target.clone());
            }
        }
    }
    reachable
}

/// Whether every in-region edge into `node` that can still fire this
/// iteration has an executed source instance. Edges from members outside
/// the reachable set belong to pruned branches and never block; which
/// handles fire is already encoded in the reachable set itself.
pub fn upstream_satisfied(
    workflow: &SerializedWorkflow,
    members: &HashSet<&str>,
    reachable: &HashSet<String>,
    node: &str,
    kind: SubflowKind,
    region_id: &str,
    iteration: usize,
    ctx: &ExecutionContext,
) -> bool {
    workflow.incoming(node).all(|conn| {
        !members.contains(conn.source.as_str())
            || !reachable.contains(conn.source.as_str())
            || ctx.is_executed(&BlockRef::virtual_instance(
                &conn.source,
                kind,
                region_id,
                iteration,
            ))
    })
}

/// Whether every expected instance of `iteration` has executed.
pub fn iteration_complete(
    workflow: &SerializedWorkflow,
    nodes: &[String],
    seeds: &[String],
    kind: SubflowKind,
    region_id: &str,
    iteration: usize,
    ctx: &ExecutionContext,
) -> bool {
    reachable_at_iteration(workflow, nodes, seeds, kind, region_id, iteration, ctx)
        .iter()
        .all(|node| {
            ctx.is_executed(&BlockRef::virtual_instance(node, kind, region_id, iteration))
        })
}

/// First failed instance of `iteration` with no error route inside the
/// region, in body-declaration order. Such a failure fails the region.
pub fn first_unrouted_error(
    workflow: &SerializedWorkflow,
    nodes: &[String],
    kind: SubflowKind,
    region_id: &str,
    iteration: usize,
    ctx: &ExecutionContext,
) -> Option<String> {
    let members: HashSet<&str> = nodes.iter().map(String::as_str).collect();
    for node in nodes {
        let instance = BlockRef::virtual_instance(node, kind, region_id, iteration);
        if !ctx.is_executed(&instance) || !ctx.output_has_error(&instance) {
            continue;
        }
        let routed = workflow.outgoing(node).any(|c| {
            c.source_handle.is_error() && members.contains(c.target.as_str())
        });
        if !routed {
            let output = ctx.block_output(&instance).unwrap_or(Value::Null);
            return Some(extract_error_message(&output));
        }
    }
    None
}

/// The iteration's contribution to the aggregated result: the output of
/// the last body node (in declaration order) that executed.
pub fn iteration_result(
    nodes: &[String],
    kind: SubflowKind,
    region_id: &str,
    iteration: usize,
    ctx: &ExecutionContext,
) -> Value {
    nodes
        .iter()
        .rev()
        .map(|node| BlockRef::virtual_instance(node, kind, region_id, iteration))
        .find(|instance| ctx.is_executed(instance))
        .and_then(|instance| ctx.block_output(&instance))
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn region_workflow() -> SerializedWorkflow {
        SerializedWorkflow::from_json(
            &serde_json::to_string(&json!({
                "version": "1.0",
                "blocks": [
                    {"id": "loop1", "metadata": {"id": "loop", "name": "Loop"}},
                    {"id": "fetch", "metadata": {"id": "api", "name": "Fetch"}},
                    {"id": "shape", "metadata": {"id": "function", "name": "Shape"}},
                    {"id": "rescue", "metadata": {"id": "function", "name": "Rescue"}}
                ],
                "connections": [
                    {"source": "loop1", "target": "fetch", "sourceHandle": "loop-start-source"},
                    {"source": "fetch", "target": "shape"},
                    {"source": "fetch", "target": "rescue", "sourceHandle": "error"}
                ],
                "loops": {
                    "loop1": {
                        "id": "loop1",
                        "nodes": ["fetch", "shape", "rescue"],
                        "iterations": 2
                    }
                }
            }))
            .unwrap(),
        )
        .unwrap()
    }

    fn nodes() -> Vec<String> {
        vec!["fetch".into(), "shape".into(), "rescue".into()]
    }

    #[test]
    fn test_start_targets_filter_to_body() {
        let workflow = region_workflow();
        assert_eq!(
            start_targets(&workflow, "loop1", &nodes()),
            vec!["fetch".to_string()]
        );
    }

    #[test]
    fn test_reachability_follows_plain_edges_only_before_failure() {
        let workflow = region_workflow();
        let ctx = ExecutionContext::new("wf");
        let reachable = reachable_at_iteration(
            &workflow,
            &nodes(),
            &["fetch".to_string()],
            SubflowKind::Loop,
            "loop1",
            0,
            &ctx,
        );
        assert!(reachable.contains("fetch"));
        assert!(reachable.contains("shape"));
        assert!(!reachable.contains("rescue"));
    }

    #[test]
    fn test_failure_swaps_plain_targets_for_error_targets() {
        let workflow = region_workflow();
        let ctx = ExecutionContext::new("wf");
        let fetch = BlockRef::virtual_instance("fetch", SubflowKind::Loop, "loop1", 0);
        ctx.record_output(&fetch, json!({"error": "boom"}), 5);

        let reachable = reachable_at_iteration(
            &workflow,
            &nodes(),
            &["fetch".to_string()],
            SubflowKind::Loop,
            "loop1",
            0,
            &ctx,
        );
        assert!(reachable.contains("rescue"));
        assert!(!reachable.contains("shape"));
    }

    #[test]
    fn test_iteration_complete_tracks_expected_set() {
        let workflow = region_workflow();
        let ctx = ExecutionContext::new("wf");
        let seeds = vec!["fetch".to_string()];
        assert!(!iteration_complete(
            &workflow,
            &nodes(),
            &seeds,
            SubflowKind::Loop,
            "loop1",
            0,
            &ctx
        ));

        ctx.record_output(
            &BlockRef::virtual_instance("fetch", SubflowKind::Loop, "loop1", 0),
            json!({"data": 1}),
            1,
        );
        assert!(!iteration_complete(
            &workflow,
            &nodes(),
            &seeds,
            SubflowKind::Loop,
            "loop1",
            0,
            &ctx
        ));

        ctx.record_output(
            &BlockRef::virtual_instance("shape", SubflowKind::Loop, "loop1", 0),
            json!({"data": 2}),
            1,
        );
        assert!(iteration_complete(
            &workflow,
            &nodes(),
            &seeds,
            SubflowKind::Loop,
            "loop1",
            0,
            &ctx
        ));
    }

    #[test]
    fn test_routed_error_is_not_unrouted() {
        let workflow = region_workflow();
        let ctx = ExecutionContext::new("wf");
        // fetch has an error edge to rescue, so its failure is routed.
        ctx.record_output(
            &BlockRef::virtual_instance("fetch", SubflowKind::Loop, "loop1", 0),
            json!({"error": "boom"}),
            1,
        );
        assert_eq!(
            first_unrouted_error(&workflow, &nodes(), SubflowKind::Loop, "loop1", 0, &ctx),
            None
        );

        // shape has no error edge, so its failure fails the region.
        ctx.record_output(
            &BlockRef::virtual_instance("shape", SubflowKind::Loop, "loop1", 0),
            json!({"error": "shape broke"}),
            1,
        );
        assert_eq!(
            first_unrouted_error(&workflow, &nodes(), SubflowKind::Loop, "loop1", 0, &ctx)
                .as_deref(),
            Some("shape broke")
        );
    }

    #[test]
    fn test_iteration_result_takes_last_executed_body_node() {
        let ctx = ExecutionContext::new("wf");
        ctx.record_output(
            &BlockRef::virtual_instance("fetch", SubflowKind::Loop, "loop1", 0),
            json!({"data": 1}),
            1,
        );
        ctx.record_output(
            &BlockRef::virtual_instance("shape", SubflowKind::Loop, "loop1", 0),
            json!({"shaped": true}),
            1,
        );
        assert_eq!(
            iteration_result(&nodes(), SubflowKind::Loop, "loop1", 0, &ctx),
            json!({"shaped": true})
        );
    }
}

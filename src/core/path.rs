//! Active execution path maintenance.
//!
//! A block only becomes schedulable once some completed upstream block
//! activates it. Plain blocks activate all their plain targets; routers
//! and conditions activate only the chosen branch, which is what keeps
//! unchosen branches from ever executing. Failures activate error
//! targets instead, and loop/parallel coordinators activate their end
//! targets when the region aggregates.

use crate::core::block_ref::BlockRef;
use crate::core::context::ExecutionContext;
use crate::workflow::schema::{BlockKind, ConnectionHandle, SerializedWorkflow};

pub struct PathTracker<'a> {
    workflow: &'a SerializedWorkflow,
}

impl<'a> PathTracker<'a> {
    pub fn new(workflow: &'a SerializedWorkflow) -> Self {
        Self { workflow }
    }

    /// Activate downstream targets after `block_id` completes without
    /// error. Subflow start/end targets are not touched here: bodies run
    /// as virtual instances and end targets wait for aggregation.
    pub fn activate_on_success(&self, block_id: &str, ctx: &ExecutionContext) {
        let Some(block) = self.workflow.block(block_id) else {
            return;
        };
        match block.kind() {
            BlockKind::Router => {
                let chosen = ctx.router_decision(&BlockRef::real(block_id));
                for conn in self.workflow.outgoing(block_id) {
                    if conn.source_handle == ConnectionHandle::Source
                        && chosen.as_deref() == Some(conn.target.as_str())
                    {
                        ctx.add_to_path(&conn.target);
                    }
                }
            }
            BlockKind::Condition => {
                let Some(decision) = ctx.condition_decision(&BlockRef::real(block_id)) else {
                    return;
                };
                let wanted = if decision {
                    ConnectionHandle::ConditionTrue
                } else {
                    ConnectionHandle::ConditionFalse
                };
                for conn in self.workflow.outgoing(block_id) {
                    if conn.source_handle == wanted {
                        ctx.add_to_path(&conn.target);
                    }
                }
            }
            BlockKind::Loop | BlockKind::Parallel => {}
            _ => {
                for conn in self.workflow.outgoing(block_id) {
                    if conn.source_handle == ConnectionHandle::Source {
                        ctx.add_to_path(&conn.target);
                    }
                }
            }
        }
    }

    /// Activate error targets after `block_id` fails. Returns whether the
    /// block had any error route; without one the failure is final.
    pub fn activate_on_failure(&self, block_id: &str, ctx: &ExecutionContext) -> bool {
        let mut routed = false;
        for conn in self.workflow.outgoing(block_id) {
            if conn.source_handle.is_error() {
                ctx.add_to_path(&conn.target);
                routed = true;
            }
        }
        routed
    }

    /// Activate the after-region targets of a completed coordinator.
    pub fn activate_subflow_end(&self, block_id: &str, ctx: &ExecutionContext) {
        for conn in self.workflow.outgoing(block_id) {
            if conn.source_handle.is_subflow_end() {
                ctx.add_to_path(&conn.target);
            }
        }
    }
}

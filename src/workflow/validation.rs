//! Construction-time workflow validation.
//!
//! Runs once when an [`Executor`](crate::executor::Executor) is built, so a
//! malformed graph never reaches the scheduling loop. The first violated
//! invariant is reported; callers get an error message naming the offending
//! block or connection.

use crate::error::WorkflowError;
use crate::workflow::schema::SerializedWorkflow;

/// Validate the structural invariants of a serialized workflow.
///
/// Invariants:
/// - exactly one enabled entry block (starter, trigger kind, or
///   trigger-mode block),
/// - the entry block has no incoming connections and at least one outgoing
///   connection,
/// - every connection's source and target reference an existing block,
/// - every loop/parallel descriptor references existing body blocks.
pub fn validate_workflow(workflow: &SerializedWorkflow) -> Result<(), WorkflowError> {
    let entries: Vec<_> = workflow
        .blocks
        .iter()
        .filter(|b| b.enabled && b.is_entry())
        .collect();

    let entry = match entries.as_slice() {
        [] => {
            return Err(WorkflowError::InvalidWorkflow(
                "no enabled starter or trigger block found".to_string(),
            ))
        }
        [single] => *single,
        multiple => {
            let ids: Vec<&str> = multiple.iter().map(|b| b.id.as_str()).collect();
            return Err(WorkflowError::InvalidWorkflow(format!(
                "multiple enabled entry blocks found: {}",
                ids.join(", ")
            )));
        }
    };

    if workflow.incoming(&entry.id).next().is_some() {
        return Err(WorkflowError::InvalidWorkflow(format!(
            "entry block '{}' must not have incoming connections",
            entry.id
        )));
    }

    if workflow.outgoing(&entry.id).next().is_none() {
        return Err(WorkflowError::InvalidWorkflow(format!(
            "entry block '{}' has no outgoing connections",
            entry.id
        )));
    }

    for connection in &workflow.connections {
        if workflow.block(&connection.source).is_none() {
            return Err(WorkflowError::InvalidWorkflow(format!(
                "connection references unknown source block '{}'",
                connection.source
            )));
        }
        if workflow.block(&connection.target).is_none() {
            return Err(WorkflowError::InvalidWorkflow(format!(
                "connection references unknown target block '{}'",
                connection.target
            )));
        }
    }

    for (loop_id, descriptor) in &workflow.loops {
        for node in &descriptor.nodes {
            if workflow.block(node).is_none() {
                return Err(WorkflowError::InvalidWorkflow(format!(
                    "loop '{}' references unknown body block '{}'",
                    loop_id, node
                )));
            }
        }
    }

    for (parallel_id, descriptor) in &workflow.parallels {
        for node in &descriptor.nodes {
            if workflow.block(node).is_none() {
                return Err(WorkflowError::InvalidWorkflow(format!(
                    "parallel '{}' references unknown body block '{}'",
                    parallel_id, node
                )));
            }
        }
    }

    Ok(())
}

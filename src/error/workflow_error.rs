//! Run-level error types.

use thiserror::Error;

/// Run-level errors
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),
    #[error("Block not found: {0}")]
    BlockNotFound(String),
    #[error("Max steps exceeded: {0}")]
    MaxStepsExceeded(u32),
    #[error("Execution timeout")]
    ExecutionTimeout,
    #[error("Execution cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BlockError;

    #[test]
    fn test_workflow_error_display() {
        assert_eq!(
            WorkflowError::InvalidWorkflow("no starter block".into()).to_string(),
            "Invalid workflow: no starter block"
        );
        assert_eq!(
            WorkflowError::BlockNotFound("b1".into()).to_string(),
            "Block not found: b1"
        );
        assert_eq!(
            WorkflowError::MaxStepsExceeded(500).to_string(),
            "Max steps exceeded: 500"
        );
        assert_eq!(
            WorkflowError::ExecutionTimeout.to_string(),
            "Execution timeout"
        );
        assert_eq!(WorkflowError::Cancelled.to_string(), "Execution cancelled");
    }

    #[test]
    fn test_block_error_display() {
        assert_eq!(
            BlockError::Resolution("<missing.output>".into()).to_string(),
            "Reference not found: <missing.output>"
        );
        assert_eq!(
            BlockError::Provider {
                status: 502,
                message: "bad gateway".into()
            }
            .to_string(),
            "Provider error (502): bad gateway"
        );
        assert_eq!(
            BlockError::Timeout(30).to_string(),
            "Timeout: block execution exceeded 30s"
        );
    }
}

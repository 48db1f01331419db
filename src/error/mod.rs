//! Error types for the workflow execution engine.
//!
//! - [`BlockError`]: errors raised while resolving inputs for or executing a single block.
//! - [`WorkflowError`]: top-level errors for workflow validation and run orchestration.

pub mod block_error;
pub mod workflow_error;

pub use block_error::BlockError;
pub use workflow_error::WorkflowError;

/// Convenience alias for run-level results.
pub type WorkflowResult<T> = Result<T, WorkflowError>;
/// Convenience alias for block-level results.
pub type BlockResult<T> = Result<T, BlockError>;

/// Normalize an error payload recorded in a block output down to a single
/// human-readable string.
///
/// Provider responses and routed error outputs carry errors as arbitrary
/// JSON (`"..."`, `{"message": ...}`, `{"error": ...}`, sometimes nested,
/// sometimes degenerate). The top-level `ExecutionResult.error` must always
/// be a plain string, so this function is total: any shape, including
/// `null` and empty strings, maps to something readable.
pub fn extract_error_message(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() || trimmed == "undefined (undefined)" {
                "Unknown error".to_string()
            } else {
                s.clone()
            }
        }
        serde_json::Value::Object(map) => {
            if let Some(inner) = map.get("message").or_else(|| map.get("error")) {
                extract_error_message(inner)
            } else {
                serde_json::to_string(value).unwrap_or_else(|_| "Unknown error".to_string())
            }
        }
        serde_json::Value::Null => "Unknown error".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_plain_string() {
        assert_eq!(extract_error_message(&json!("boom")), "boom");
    }

    #[test]
    fn test_extract_nested_message() {
        assert_eq!(
            extract_error_message(&json!({"message": "inner failure"})),
            "inner failure"
        );
        assert_eq!(
            extract_error_message(&json!({"message": {"message": "deep"}})),
            "deep"
        );
    }

    #[test]
    fn test_extract_error_key() {
        assert_eq!(
            extract_error_message(&json!({"error": "request failed"})),
            "request failed"
        );
    }

    #[test]
    fn test_extract_degenerate_shapes() {
        assert_eq!(extract_error_message(&json!(null)), "Unknown error");
        assert_eq!(extract_error_message(&json!("")), "Unknown error");
        assert_eq!(
            extract_error_message(&json!({"message": "undefined (undefined)"})),
            "Unknown error"
        );
    }

    #[test]
    fn test_extract_object_without_message() {
        let msg = extract_error_message(&json!({"code": 500}));
        assert!(msg.contains("500"));
    }

    #[test]
    fn test_extract_number() {
        assert_eq!(extract_error_message(&json!(42)), "42");
    }
}

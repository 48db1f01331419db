//! Condition block handler.
//!
//! Evaluates to a single boolean and records it as the block's decision;
//! path tracking then activates the `condition-true` or `condition-false`
//! branch. Two param forms are accepted: a structured `conditions` array
//! of `{left, operator, right}` clauses joined by `logicalOperator`, or a
//! restricted `expression` string.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::context::ExecutionContext;
use crate::error::BlockError;
use crate::expression;
use crate::handlers::{BlockHandler, ExecutionScope};
use crate::workflow::schema::{BlockKind, SerializedBlock};

/// Comparison applied between two resolved values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ComparisonOperator {
    #[serde(alias = "==", alias = "eq")]
    Equals,
    #[serde(alias = "!=", alias = "ne")]
    NotEquals,
    #[serde(alias = ">", alias = "gt")]
    GreaterThan,
    #[serde(alias = "<", alias = "lt")]
    LessThan,
    #[serde(alias = ">=", alias = "gte")]
    GreaterOrEqual,
    #[serde(alias = "<=", alias = "lte")]
    LessOrEqual,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Empty,
    NotEmpty,
    In,
    NotIn,
    Null,
    NotNull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOperator {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConditionClause {
    #[serde(default)]
    pub left: Value,
    pub operator: ComparisonOperator,
    #[serde(default)]
    pub right: Value,
}

fn display(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn string_vec(v: &Value) -> Vec<String> {
    match v {
        Value::Array(arr) => arr.iter().map(display).collect(),
        Value::String(s) => vec![s.clone()],
        _ => vec![],
    }
}

fn is_empty(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(arr) => arr.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

impl ComparisonOperator {
    pub fn evaluate(&self, left: &Value, right: &Value) -> bool {
        match self {
            ComparisonOperator::Equals => match (as_f64(left), as_f64(right)) {
                (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
                _ => display(left) == display(right),
            },
            ComparisonOperator::NotEquals => {
                !ComparisonOperator::Equals.evaluate(left, right)
            }
            ComparisonOperator::GreaterThan => match (as_f64(left), as_f64(right)) {
                (Some(a), Some(b)) => a > b,
                _ => false,
            },
            ComparisonOperator::LessThan => match (as_f64(left), as_f64(right)) {
                (Some(a), Some(b)) => a < b,
                _ => false,
            },
            ComparisonOperator::GreaterOrEqual => match (as_f64(left), as_f64(right)) {
                (Some(a), Some(b)) => a >= b,
                _ => false,
            },
            ComparisonOperator::LessOrEqual => match (as_f64(left), as_f64(right)) {
                (Some(a), Some(b)) => a <= b,
                _ => false,
            },
            ComparisonOperator::Contains => match left {
                Value::String(s) => s.contains(&display(right)),
                Value::Array(arr) => {
                    let wanted = display(right);
                    arr.iter().any(|item| display(item) == wanted)
                }
                _ => false,
            },
            ComparisonOperator::NotContains => {
                !ComparisonOperator::Contains.evaluate(left, right)
            }
            ComparisonOperator::StartsWith => display(left).starts_with(&display(right)),
            ComparisonOperator::EndsWith => display(left).ends_with(&display(right)),
            ComparisonOperator::Empty => is_empty(left),
            ComparisonOperator::NotEmpty => !is_empty(left),
            ComparisonOperator::In => string_vec(right).contains(&display(left)),
            ComparisonOperator::NotIn => !string_vec(right).contains(&display(left)),
            ComparisonOperator::Null => left.is_null(),
            ComparisonOperator::NotNull => !left.is_null(),
        }
    }
}

pub struct ConditionHandler;

#[async_trait]
impl BlockHandler for ConditionHandler {
    fn kinds(&self) -> &'static [BlockKind] {
        &[BlockKind::Condition]
    }

    async fn execute(
        &self,
        _block: &SerializedBlock,
        inputs: &Value,
        ctx: &ExecutionContext,
        scope: &ExecutionScope<'_>,
    ) -> Result<Value, BlockError> {
        let decision = if let Some(raw) = inputs.get("conditions") {
            let clauses: Vec<ConditionClause> =
                serde_json::from_value(raw.clone()).map_err(|e| {
                    BlockError::InvalidParams(format!("malformed `conditions`: {e}"))
                })?;
            let joiner: LogicalOperator = inputs
                .get("logicalOperator")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| {
                    BlockError::InvalidParams(format!("malformed `logicalOperator`: {e}"))
                })?
                .unwrap_or_default();
            match joiner {
                LogicalOperator::And => clauses
                    .iter()
                    .all(|c| c.operator.evaluate(&c.left, &c.right)),
                LogicalOperator::Or => clauses
                    .iter()
                    .any(|c| c.operator.evaluate(&c.left, &c.right)),
            }
        } else if let Some(expr) = inputs.get("expression").and_then(Value::as_str) {
            expression::evaluate_bool(expr)?
        } else {
            return Err(BlockError::InvalidParams(
                "condition block requires a `conditions` array or an `expression` param"
                    .to_string(),
            ));
        };

        ctx.set_condition_decision(scope.block_ref, decision);
        tracing::debug!(block = %scope.block_ref, decision, "condition evaluated");
        Ok(json!({"result": decision}))
    }
}

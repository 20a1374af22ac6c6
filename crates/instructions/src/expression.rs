//! JEXL evaluation shared by `condition` and `calculation`.
//!
//! Expressions see the node's scope under plain identifiers (`context`,
//! `jobs`, `system`) since JEXL identifiers cannot start with `$`.
//! Placeholders in the expression text have already been substituted by
//! the engine's resolver.

use serde_json::{json, Value};

use crate::ExecutionContext;

/// Evaluate `expression` against the node's scope.
///
/// The evaluator is built per call and dropped before returning, so it is
/// never held across an await point.
pub fn evaluate(expression: &str, ctx: &ExecutionContext) -> Result<Value, String> {
    let evaluator = jexl_eval::Evaluator::new();
    let context = json!({
        "context": ctx.scope.get("$context").cloned().unwrap_or(Value::Null),
        "jobs": ctx.scope.get("$jobsMapByNodeId").cloned().unwrap_or(Value::Null),
        "system": ctx.scope.get("$system").cloned().unwrap_or(Value::Null),
    });

    evaluator
        .eval_in_context(expression, &context)
        .map_err(|e| format!("cannot evaluate `{expression}`: {e}"))
}

/// JavaScript-like truthiness.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

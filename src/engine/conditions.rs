//! Condition evaluation.
//!
//! Conditions gate whether a matched trigger actually fires. Evaluation is
//! a pure function of (condition, payload): no connectors, no storage, no
//! clock. A referenced field that is absent from the payload makes that
//! single condition false rather than erroring, since events from external
//! services routinely omit fields, and a missing field must never take
//! down the pipeline. The one exception is `exists`, whose whole purpose
//! is to test absence.

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// A condition tree: composite AND/OR nodes or a single comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    /// Every child must hold.
    All { all: Vec<Condition> },
    /// At least one child must hold.
    Any { any: Vec<Condition> },
    /// A single field comparison.
    Leaf(Comparison),
}

/// One field comparison: `(field, operator, expected value)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comparison {
    /// Dot-separated path into the event payload. Array elements are
    /// addressed by numeric segments (`items.0.amount`).
    pub field: String,
    #[serde(default)]
    pub operator: Operator,
    #[serde(default)]
    pub value: Option<Value>,
}

/// Supported comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    #[default]
    #[serde(alias = "eq")]
    Equals,
    #[serde(alias = "ne")]
    NotEquals,
    /// Substring on strings, membership on arrays.
    Contains,
    /// Payload value is a member of the expected array.
    In,
    /// Regex match on string payload values.
    Matches,
    #[serde(alias = "gt")]
    GreaterThan,
    #[serde(alias = "lt")]
    LessThan,
    /// Presence test; `value: false` asserts absence.
    Exists,
}

/// Evaluate a condition tree against an event payload.
///
/// `None` (no conditions configured) always evaluates true.
pub fn evaluate(condition: Option<&Condition>, payload: &Value) -> bool {
    match condition {
        None => true,
        Some(c) => eval_node(c, payload),
    }
}

fn eval_node(condition: &Condition, payload: &Value) -> bool {
    match condition {
        Condition::All { all } => all.iter().all(|c| eval_node(c, payload)),
        Condition::Any { any } => any.iter().any(|c| eval_node(c, payload)),
        Condition::Leaf(cmp) => eval_leaf(cmp, payload),
    }
}

fn eval_leaf(cmp: &Comparison, payload: &Value) -> bool {
    let actual = resolve_field(&cmp.field, payload);
    let expected = cmp.value.as_ref();

    // `exists` is the only operator defined over absent fields.
    if let Operator::Exists = cmp.operator {
        let want_present = expected.and_then(Value::as_bool).unwrap_or(true);
        return actual.is_some() == want_present;
    }

    let Some(actual) = actual else {
        debug!(field = %cmp.field, "condition field absent from payload");
        return false;
    };
    let Some(expected) = expected else {
        return false;
    };

    match cmp.operator {
        Operator::Equals => actual == expected,
        Operator::NotEquals => actual != expected,
        Operator::Contains => match actual {
            Value::String(s) => expected
                .as_str()
                .map(|needle| s.contains(needle))
                .unwrap_or(false),
            Value::Array(items) => items.contains(expected),
            _ => false,
        },
        Operator::In => expected
            .as_array()
            .map(|items| items.contains(actual))
            .unwrap_or(false),
        Operator::Matches => match (actual.as_str(), expected.as_str()) {
            (Some(haystack), Some(pattern)) => Regex::new(pattern)
                .map(|re| re.is_match(haystack))
                .unwrap_or(false),
            _ => false,
        },
        Operator::GreaterThan => match (as_number(actual), as_number(expected)) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        },
        Operator::LessThan => match (as_number(actual), as_number(expected)) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        },
        Operator::Exists => unreachable!("handled above"),
    }
}

/// Numeric coercion for ordering comparisons: JSON numbers and numeric
/// strings compare; everything else makes the comparison false.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Resolve a dot-separated field path in nested objects and arrays.
fn resolve_field<'a>(path: &str, payload: &'a Value) -> Option<&'a Value> {
    let mut current = payload;
    for part in path.split('.') {
        match current {
            Value::Object(map) => current = map.get(part)?,
            Value::Array(items) => {
                let idx: usize = part.parse().ok()?;
                current = items.get(idx)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

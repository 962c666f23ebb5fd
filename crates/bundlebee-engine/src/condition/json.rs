//! Evaluation of [`AwaitCondition`]s against a fetched resource.
use serde_json::Value;
use snafu::{OptionExt, Snafu};

use crate::manifest::{AwaitCondition, JsonPointerOperator};

const STATUS_CONDITIONS_POINTER: &str = "/status/conditions";

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum EvaluationError {
    #[snafu(display("no value at JSON pointer {pointer:?}"))]
    PointerNotFound { pointer: String },

    #[snafu(display("no expected value for {operator} at {pointer:?}"))]
    MissingExpectedValue {
        pointer: String,
        operator: JsonPointerOperator,
    },
}

/// Tests `condition` against a resource body.
///
/// An unresolvable pointer is an error, callers decide whether it means "not ready yet" or, for
/// [`JsonPointerOperator::Missing`], "satisfied".
pub fn evaluate(condition: &AwaitCondition, body: &Value) -> Result<bool, EvaluationError> {
    match condition {
        AwaitCondition::JsonPointer {
            pointer,
            operator_type,
            value,
        } => {
            let actual = body
                .pointer(pointer)
                .map(stringify)
                .context(PointerNotFoundSnafu { pointer })?;
            compare(*operator_type, value.as_deref(), &actual, pointer)
        }
        AwaitCondition::StatusCondition {
            condition_type,
            value,
        } => {
            let conditions = body
                .pointer(STATUS_CONDITIONS_POINTER)
                .and_then(Value::as_array)
                .context(PointerNotFoundSnafu {
                    pointer: STATUS_CONDITIONS_POINTER,
                })?;
            Ok(conditions.iter().any(|entry| {
                entry.get("type").and_then(Value::as_str) == Some(condition_type.as_str())
                    && entry.get("status").map(stringify).as_deref() == value.as_deref()
            }))
        }
    }
}

/// Strings are taken verbatim, anything else as its JSON text.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(value) => value.clone(),
        other => other.to_string(),
    }
}

fn compare(
    operator: JsonPointerOperator,
    expected: Option<&str>,
    actual: &str,
    pointer: &str,
) -> Result<bool, EvaluationError> {
    let require_expected = || {
        expected.context(MissingExpectedValueSnafu { pointer, operator })
    };

    Ok(match operator {
        JsonPointerOperator::Exists => true,
        JsonPointerOperator::Missing => false,
        JsonPointerOperator::Equals => expected == Some(actual),
        JsonPointerOperator::NotEquals => expected != Some(actual),
        JsonPointerOperator::EqualsIgnoreCase => require_expected()?.eq_ignore_ascii_case(actual),
        JsonPointerOperator::NotEqualsIgnoreCase => {
            !require_expected()?.eq_ignore_ascii_case(actual)
        }
        JsonPointerOperator::Contains => actual.contains(require_expected()?),
    })
}

//! Phase engines run through [crate::project::ProjectOperation::run].

pub mod compute;
pub mod scan;
pub mod validate;
pub mod zarr;

use serde_json::Value;

/// Whether a detail value should replace an existing one.
///
/// Null, false, zero and empty values are not.
pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

//! Normalization of engine output into plain JSON trees.
//!
//! Engines hand back nested product types (segments, transcription info,
//! word timestamps). Before a result can be persisted it must be a pure
//! tree of scalars, arrays and string-keyed maps. `to_plain` performs that
//! conversion by type-driven recursion through serde: struct fields become
//! map entries, sequences stay sequences (tuples included), scalars pass
//! through untouched.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::WhisperdError;
use crate::Result;

/// Recursively convert any serializable value into a plain JSON tree.
///
/// Non-finite floats collapse to `null` rather than failing; runtimes emit
/// `-inf` log probabilities on silent segments.
///
/// # Errors
///
/// Fails when the value cannot be represented as JSON at all (e.g. a map
/// with non-string keys).
///
/// # Examples
///
/// ```rust
/// use serde::Serialize;
/// use whisperd::core::engine::to_plain;
///
/// #[derive(Serialize)]
/// struct Segment {
///     id: u32,
///     span: (f64, f64),
///     text: String,
/// }
///
/// let plain = to_plain(&Segment { id: 0, span: (0.0, 2.1), text: "hi".into() }).unwrap();
/// assert_eq!(plain["span"][1], 2.1);
/// ```
pub fn to_plain<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|e| WhisperdError::store(format!("result normalization failed: {}", e)))
}

/// Convert a list of serializable records into plain JSON objects.
pub fn records_to_plain<T: Serialize>(records: &[T]) -> Result<Vec<Value>> {
    records.iter().map(to_plain).collect()
}

/// Coerce a JSON value into a string-keyed map, treating anything else as
/// an empty info object. OpenAI-style engines return no info at all.
pub fn as_info_map(value: Option<Value>) -> Map<String, Value> {
    match value {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

//! Dot-path access into JSON values
//!
//! Metadata addresses record fields, payload slices and parameter sources
//! with dot-separated paths (`"customer.address.city"`). Everything that
//! slices a payload or reads a record field goes through this module so the
//! path dialect stays in one place.
//!
//! Array elements are addressed by numeric segments (`"rows.0.id"`).

use serde_json::{Map, Value};

/// Resolve `path` against `value`, returning a reference to the target.
///
/// An empty path resolves to `value` itself. Returns `None` as soon as a
/// segment is missing or the current value is not indexable.
pub fn resolve<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Resolve `path` and clone the target value.
pub fn resolve_cloned(value: &Value, path: &str) -> Option<Value> {
    resolve(value, path).cloned()
}

/// Assign `new` at `path` inside `target`, creating intermediate objects
/// for missing segments. Non-object intermediates are replaced.
pub fn assign(target: &mut Value, path: &str, new: Value) {
    if path.is_empty() {
        *target = new;
        return;
    }
    let segments: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut current = target;
    for segment in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        current = match current {
            Value::Object(map) => map
                .entry((*segment).to_string())
                .or_insert_with(|| Value::Object(Map::new())),
            _ => return,
        };
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(map) = current {
        map.insert((*last).to_string(), new);
    }
}

/// Render a JSON value as a key fragment.
///
/// Strings render without quotes so `{id: "a"}` and `{id: 7}` produce `a`
/// and `7`, not `"a"`. Missing/null values render empty.
pub fn key_fragment(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Concatenate the resolved unique-key field values of `record` with `_`.
///
/// This string is the record's stable identity for reconciliation and
/// flat-source selection equality.
pub fn unique_key_value(fields: &[crate::descriptor::UniqueKeyField], record: &Value) -> String {
    fields
        .iter()
        .map(|f| key_fragment(resolve(record, &f.field)))
        .collect::<Vec<_>>()
        .join("_")
}

/// Split a `"prefix.rest"` location into the leading segment and the
/// remaining path. A location without a dot yields an empty rest.
pub fn split_location(location: &str) -> (&str, &str) {
    match location.split_once('.') {
        Some((head, rest)) => (head, rest),
        None => (location, ""),
    }
}

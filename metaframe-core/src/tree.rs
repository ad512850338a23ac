//! Node-path addressing for self-referencing tree sources
//!
//! A tree source stores its records as a forest: a root list whose nodes
//! carry their children under the declared `selfReference` field. Nodes
//! are addressed by an index path from the root list (`[0, 2]` = third
//! child of the first root), never by pointer identity, so paths stay
//! valid across snapshot clones and structural merges are explicit.

use serde_json::Value;

/// Children of `node` under `child_field`, if present and a list.
pub fn children<'a>(node: &'a Value, child_field: &str) -> Option<&'a Vec<Value>> {
    node.get(child_field)?.as_array()
}

/// Resolve a node path against a forest.
pub fn node_at_path<'a>(roots: &'a [Value], child_field: &str, path: &[usize]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut node = roots.get(*first)?;
    for index in rest {
        node = children(node, child_field)?.get(*index)?;
    }
    Some(node)
}

/// Resolve a node path against a forest, mutably.
pub fn node_at_path_mut<'a>(
    roots: &'a mut [Value],
    child_field: &str,
    path: &[usize],
) -> Option<&'a mut Value> {
    let (first, rest) = path.split_first()?;
    let mut node = roots.get_mut(*first)?;
    for index in rest {
        node = node
            .get_mut(child_field)?
            .as_array_mut()?
            .get_mut(*index)?;
    }
    Some(node)
}

/// Merge `record`'s fields into the node at `path`, preserving the node's
/// existing child list when the incoming record does not carry one.
/// Returns false when the path no longer resolves.
pub fn merge_at_path(
    roots: &mut [Value],
    child_field: &str,
    path: &[usize],
    record: &Value,
) -> bool {
    match node_at_path_mut(roots, child_field, path) {
        Some(node) => {
            merge_record(node, record, child_field);
            true
        }
        None => false,
    }
}

/// Depth-first walk over the forest, visiting `(path, node)` pairs.
pub fn walk<'a>(
    roots: &'a [Value],
    child_field: &str,
    mut visit: impl FnMut(&[usize], &'a Value),
) {
    fn recurse<'a>(
        nodes: &'a [Value],
        child_field: &str,
        prefix: &mut Vec<usize>,
        visit: &mut impl FnMut(&[usize], &'a Value),
    ) {
        for (i, node) in nodes.iter().enumerate() {
            prefix.push(i);
            visit(prefix, node);
            if let Some(kids) = children(node, child_field) {
                recurse(kids, child_field, prefix, visit);
            }
            prefix.pop();
        }
    }
    let mut prefix = Vec::new();
    recurse(roots, child_field, &mut prefix, &mut visit);
}

/// Find the path of the first node whose unique-key value equals `target`.
pub fn find_path_by_key(
    roots: &[Value],
    child_field: &str,
    unique_key: &[crate::descriptor::UniqueKeyField],
    target: &str,
) -> Option<Vec<usize>> {
    let mut found = None;
    walk(roots, child_field, |path, node| {
        if found.is_none() && crate::path::unique_key_value(unique_key, node) == target {
            found = Some(path.to_vec());
        }
    });
    found
}

fn merge_record(node: &mut Value, record: &Value, child_field: &str) {
    match (node.as_object_mut(), record.as_object()) {
        (Some(target), Some(incoming)) => {
            for (k, v) in incoming {
                if k == child_field && !v.is_array() {
                    continue;
                }
                target.insert(k.clone(), v.clone());
            }
        }
        _ => *node = record.clone(),
    }
}

//! Dependency propagation
//!
//! When a source's current record changes (selection set or cleared), the
//! new field values are pushed into every other source that declares a
//! `dataSource`-scoped parameter rooted at the changed source. This is a
//! push model: changes fan out eagerly to all dependents, and each push
//! raises the dependent's fetch flag unconditionally. The dependent's own
//! controller then decides whether all of its declared parameters are
//! resolved before actually fetching; an unresolved dependent goes
//! inactive instead.
//!
//! A source with several eager parents may receive redundant pushes; each
//! push is idempotent with respect to the final parameter map, so that is
//! noise, not corruption.

use serde_json::Value;

use tracing::debug;

use crate::cell::{CellKey, CellKind, CellStore, CellValue};
use crate::descriptor::{ParamScope, WindowMetadata};
use crate::path;

/// Push `record`'s fields into every source depending on
/// `changed_source`. `None` removes the dependent parameters, so
/// dependents become inactive rather than fetching against stale values.
pub fn push(
    cells: &CellStore,
    metadata: &WindowMetadata,
    window_id: &str,
    changed_source: &str,
    record: Option<&Value>,
) {
    for descriptor in &metadata.data_sources {
        if descriptor.id == changed_source {
            continue;
        }
        let updates: Vec<(&str, &str)> = descriptor
            .parameters
            .iter()
            .filter(|p| p.scope == ParamScope::DataSource)
            .filter_map(|p| {
                let (head, rest) = path::split_location(&p.location);
                (head == changed_source).then_some((p.name.as_str(), rest))
            })
            .collect();
        if updates.is_empty() {
            continue;
        }
        debug!(
            window = %window_id,
            from = %changed_source,
            to = %descriptor.id,
            parameters = updates.len(),
            "propagating record change"
        );
        let input_key = CellKey::source(CellKind::Input, window_id, &descriptor.id);
        cells.update(&input_key, |v| {
            if let CellValue::Input(input) = v {
                for (name, field_path) in &updates {
                    match record.and_then(|r| path::resolve_cloned(r, field_path)) {
                        Some(value) => {
                            input.parameters.insert((*name).to_string(), value);
                        }
                        None => {
                            input.parameters.remove(*name);
                        }
                    }
                }
                input.fetch = true;
            }
        });
    }
}

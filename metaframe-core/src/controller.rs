//! Data-source controller
//!
//! The fetch/refresh/reconciliation/selection engine operating over one
//! [`DataSourceContext`]'s cells. UI-facing operations mutate input and
//! selection cells; the engine-facing half plans fetches out of the input
//! flags and applies connector outcomes back into the cells.
//!
//! Fetch lifecycle: raising `input.fetch` (or `input.refresh`) wakes the
//! engine, which asks the controller for a [`FetchPlan`]. A `Full` plan
//! replaces the collection and re-applies the previous selection by unique
//! key; a `Refresh` plan reloads only the currently selected record
//! through a unique-key-derived filter and merges it back in place,
//! leaving unrelated rows and the current page untouched.
//!
//! Every plan carries a per-source generation. An outcome whose generation
//! is no longer current is discarded by the engine, so a superseded fetch
//! can never clobber the state of a newer one.

use std::rc::Rc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::cell::{CellKey, CellKind, CollectionInfo, SelectedNode, SelectedRow, SelectionState};
use crate::connector::FetchQuery;
use crate::context::{DataSourceContext, HandlerCall};
use crate::descriptor::{ParamScope, SelectionMode};
use crate::path;
use crate::propagate;
use crate::tree;

/// What the engine should do for a source whose input flags were raised.
#[derive(Clone, Debug, PartialEq)]
pub enum FetchPlan {
    /// No flags set; nothing to do.
    Idle,
    /// Declared parameters are unresolved; the source was marked inactive
    /// and must not fetch.
    Inactive,
    /// Mirror source; records come from the upstream selection, no
    /// connector call.
    Mirror,
    /// Replace the collection.
    Full { query: FetchQuery },
    /// Reload the selected record in place.
    Refresh {
        query: FetchQuery,
        target: RefreshTarget,
    },
}

/// Where a refreshed record is merged back.
#[derive(Clone, Debug, PartialEq)]
pub enum RefreshTarget {
    Row { row_index: usize, key: String },
    Node { path: Vec<usize> },
}

/// The controller API bound to one data-source context. Cheap to
/// construct; all state lives in the cells.
pub struct DataSourceController {
    ctx: Rc<DataSourceContext>,
}

impl DataSourceController {
    pub fn new(ctx: Rc<DataSourceContext>) -> Self {
        Self { ctx }
    }

    pub fn ctx(&self) -> &Rc<DataSourceContext> {
        &self.ctx
    }

    // ------------------------------------------------------------------
    // UI-facing operations
    // ------------------------------------------------------------------

    /// Merge `filter` into the live filter and raise the fetch flag.
    pub fn fetch_collection(&self, filter: Option<Map<String, Value>>) {
        self.ctx.update_input(|input| {
            if let Some(filter) = filter {
                input.filter.extend(filter);
            }
            input.fetch = true;
        });
    }

    /// Same merge semantics as [`Self::fetch_collection`].
    pub fn set_filter(&self, filter: Map<String, Value>) {
        self.fetch_collection(Some(filter));
    }

    pub fn set_page(&self, page: u32) {
        self.ctx.update_input(|input| {
            input.page = page;
            input.fetch = true;
        });
    }

    /// Reload the currently selected record in place.
    pub fn refresh_selection(&self) {
        self.ctx.update_input(|input| {
            input.refresh = true;
        });
    }

    /// Single-mode selection by row index. `None` (or an out-of-range
    /// index) clears. The selected record is copied into the form and the
    /// change is pushed to dependent sources; clearing pushes the absence
    /// so dependents go inactive rather than stale.
    pub fn set_selection(&self, row_index: Option<usize>) {
        if !matches!(self.ctx.selection(), SelectionState::Single(_)) {
            return;
        }
        let collection = self.ctx.collection();
        let row = row_index.and_then(|i| {
            collection.get(i).map(|record| SelectedRow {
                record: record.clone(),
                row_index: i,
            })
        });
        let record = row.as_ref().map(|r| r.record.clone());
        self.ctx.set_selection_state(SelectionState::Single(row));
        self.apply_selected_record(record);
    }

    /// Tree-mode selection by node path. Selecting the already-selected
    /// path clears.
    pub fn toggle_node(&self, node_path: &[usize]) {
        let Some(child_field) = self.ctx.descriptor.self_reference.clone() else {
            return;
        };
        match self.ctx.selection() {
            SelectionState::Tree(current) => {
                if current.as_ref().is_some_and(|n| n.node_path == node_path) {
                    self.ctx.set_selection_state(SelectionState::Tree(None));
                    self.apply_selected_record(None);
                    return;
                }
                let collection = self.ctx.collection();
                let Some(record) =
                    tree::node_at_path(&collection, &child_field, node_path).cloned()
                else {
                    return;
                };
                self.ctx
                    .set_selection_state(SelectionState::Tree(Some(SelectedNode {
                        record: record.clone(),
                        node_path: node_path.to_vec(),
                    })));
                self.apply_selected_record(Some(record));
            }
            SelectionState::TreeMulti(mut nodes) => {
                if let Some(i) = nodes.iter().position(|n| n.node_path == node_path) {
                    nodes.remove(i);
                } else {
                    let collection = self.ctx.collection();
                    let Some(record) =
                        tree::node_at_path(&collection, &child_field, node_path).cloned()
                    else {
                        return;
                    };
                    nodes.push(SelectedNode {
                        record,
                        node_path: node_path.to_vec(),
                    });
                }
                self.ctx.set_selection_state(SelectionState::TreeMulti(nodes));
            }
            _ => {}
        }
    }

    /// Toggle a row in or out of the selection. Single mode treats this as
    /// select/clear.
    pub fn toggle_selection(&self, row_index: usize) {
        match self.ctx.selection() {
            SelectionState::Single(current) => {
                if current.is_some_and(|row| row.row_index == row_index) {
                    self.set_selection(None);
                } else {
                    self.set_selection(Some(row_index));
                }
            }
            SelectionState::Multi(mut records) => {
                let collection = self.ctx.collection();
                let Some(record) = collection.get(row_index) else {
                    return;
                };
                let key = self.unique_key_value(record);
                if let Some(i) = records.iter().position(|r| self.unique_key_value(r) == key) {
                    records.remove(i);
                } else {
                    records.push(record.clone());
                }
                self.ctx.set_selection_state(SelectionState::Multi(records));
            }
            _ => {}
        }
    }

    /// Multi mode: select every record in the current collection.
    pub fn set_all_selection(&self) {
        match self.ctx.selection() {
            SelectionState::Multi(_) => {
                let collection = self.ctx.collection();
                self.ctx.set_selection_state(SelectionState::Multi(collection));
            }
            SelectionState::TreeMulti(_) => {
                let Some(child_field) = self.ctx.descriptor.self_reference.clone() else {
                    return;
                };
                let collection = self.ctx.collection();
                let mut nodes = Vec::new();
                tree::walk(&collection, &child_field, |path, node| {
                    nodes.push(SelectedNode {
                        record: node.clone(),
                        node_path: path.to_vec(),
                    });
                });
                self.ctx.set_selection_state(SelectionState::TreeMulti(nodes));
            }
            _ => {}
        }
    }

    /// Clear the selection in any mode.
    pub fn reset_selection(&self) {
        match self.ctx.selection() {
            SelectionState::Single(Some(_)) => self.set_selection(None),
            SelectionState::Multi(records) if !records.is_empty() => {
                self.ctx.set_selection_state(SelectionState::Multi(Vec::new()));
            }
            SelectionState::Tree(Some(_)) => {
                self.ctx.set_selection_state(SelectionState::Tree(None));
                self.apply_selected_record(None);
            }
            SelectionState::TreeMulti(nodes) if !nodes.is_empty() => {
                self.ctx
                    .set_selection_state(SelectionState::TreeMulti(Vec::new()));
            }
            _ => {}
        }
    }

    pub fn is_selected(&self, row_index: usize) -> bool {
        let collection = self.ctx.collection();
        let Some(record) = collection.get(row_index) else {
            return false;
        };
        let key = self.unique_key_value(record);
        match self.ctx.selection() {
            SelectionState::Single(Some(row)) => self.unique_key_value(&row.record) == key,
            SelectionState::Multi(records) => {
                records.iter().any(|r| self.unique_key_value(r) == key)
            }
            _ => false,
        }
    }

    /// Tree identity is structural: the node path, not the unique key.
    pub fn is_node_selected(&self, node_path: &[usize]) -> bool {
        match self.ctx.selection() {
            SelectionState::Tree(Some(node)) => node.node_path == node_path,
            SelectionState::TreeMulti(nodes) => nodes.iter().any(|n| n.node_path == node_path),
            _ => false,
        }
    }

    /// The record's stable identity: unique-key field values joined with
    /// `_`.
    pub fn unique_key_value(&self, record: &Value) -> String {
        path::unique_key_value(&self.ctx.descriptor.unique_key, record)
    }

    pub fn selected_record(&self) -> Option<Value> {
        self.ctx.selection().selected().cloned()
    }

    // ------------------------------------------------------------------
    // Engine-facing: planning
    // ------------------------------------------------------------------

    /// Consume the input flags and decide what the engine should do.
    /// Raises `control.loading` for plans that hit the connector and
    /// resolves the inactive state either way.
    pub fn plan_fetch(&self) -> FetchPlan {
        let input = self.ctx.input();
        if !input.fetch && !input.refresh {
            return FetchPlan::Idle;
        }
        let refresh = input.refresh;
        self.ctx.update_input(|i| {
            i.fetch = false;
            i.refresh = false;
        });

        if self.ctx.descriptor.is_mirror() {
            return FetchPlan::Mirror;
        }

        let Some(parameters) = self.resolve_parameters() else {
            debug!(
                window = %self.ctx.window_id,
                source = %self.ctx.descriptor.id,
                "parameters unresolved; source inactive"
            );
            self.ctx.update_control(|c| c.inactive = true);
            return FetchPlan::Inactive;
        };
        self.ctx.update_control(|c| c.inactive = false);

        if refresh {
            match self.plan_refresh(&input.refresh_filter, parameters) {
                Some(plan) => plan,
                None => FetchPlan::Idle,
            }
        } else {
            let mut filter = self.ctx.descriptor.filter_set.clone();
            filter.extend(input.filter.clone());
            self.begin_loading();
            FetchPlan::Full {
                query: FetchQuery {
                    filter,
                    page: input.page.max(1),
                    page_size: self.ctx.descriptor.paging.as_ref().map(|p| p.page_size),
                    parameters,
                    query: input.query,
                    headers: input.headers,
                    path: input.path,
                },
            }
        }
    }

    fn plan_refresh(
        &self,
        refresh_filter: &Map<String, Value>,
        parameters: Map<String, Value>,
    ) -> Option<FetchPlan> {
        let (record, target) = match self.ctx.selection() {
            SelectionState::Single(Some(row)) => {
                let key = self.unique_key_value(&row.record);
                (
                    row.record,
                    RefreshTarget::Row {
                        row_index: row.row_index,
                        key,
                    },
                )
            }
            SelectionState::Tree(Some(node)) => (
                node.record,
                RefreshTarget::Node {
                    path: node.node_path,
                },
            ),
            _ => return None,
        };
        let mut filter = refresh_filter.clone();
        for field in &self.ctx.descriptor.unique_key {
            let name = field.parameter.clone().unwrap_or_else(|| field.field.clone());
            let value = path::resolve_cloned(&record, &field.field).unwrap_or(Value::Null);
            filter.insert(name, value);
        }
        self.begin_loading();
        Some(FetchPlan::Refresh {
            query: FetchQuery {
                filter,
                page: 1,
                page_size: None,
                parameters,
                ..FetchQuery::default()
            },
            target,
        })
    }

    fn begin_loading(&self) {
        self.ctx.update_control(|c| {
            c.loading = true;
            c.error = None;
        });
    }

    /// Resolve every declared parameter. `None` means at least one name
    /// has no value yet; the caller marks the source inactive.
    fn resolve_parameters(&self) -> Option<Map<String, Value>> {
        let pushed = self.ctx.input().parameters;
        let mut resolved = Map::new();
        for decl in &self.ctx.descriptor.parameters {
            let value = match decl.scope {
                // Pushed by the propagator or seeded at window open.
                ParamScope::DataSource | ParamScope::Metadata | ParamScope::FilterSet => {
                    pushed.get(&decl.name).cloned()?
                }
                ParamScope::Form => {
                    let form = self.default_source_cell(CellKind::Form);
                    path::resolve_cloned(&self.ctx.cells.form(&form), &decl.location)?
                }
                ParamScope::Selection => {
                    let selection = self.default_source_cell(CellKind::Selection);
                    let state = self.ctx.cells.selection(&selection);
                    path::resolve_cloned(state.selected()?, &decl.location)?
                }
                // Meaningless without a table UI; resolves as an explicit
                // null rather than leaving the source inactive forever.
                ParamScope::TableSetting => Value::Null,
            };
            resolved.insert(decl.name.clone(), value);
        }
        // Pushed values not covered by a declaration still ride along.
        for (name, value) in pushed {
            resolved.entry(name).or_insert(value);
        }
        Some(resolved)
    }

    fn default_source_cell(&self, kind: CellKind) -> CellKey {
        let default_ref = self.ctx.metadata.default_ref().unwrap_or("");
        CellKey::source(kind, &self.ctx.window_id, default_ref)
    }

    // ------------------------------------------------------------------
    // Engine-facing: applying outcomes
    // ------------------------------------------------------------------

    /// Apply a successful full fetch: replace collection, info and
    /// metrics, then re-apply the previous selection by unique key.
    pub fn apply_full(&self, payload: Value) {
        let previous = self.ctx.selection();
        let (records, info, metrics) = self.extract(payload);
        debug!(
            window = %self.ctx.window_id,
            source = %self.ctx.descriptor.id,
            records = records.len(),
            "collection replaced"
        );
        self.ctx.set_collection(records.clone());
        self.ctx.set_collection_info(info);
        if let Some(metrics) = metrics {
            self.ctx.set_metrics(metrics);
        }
        self.reconcile_selection(previous, &records);
        self.finish_loading(None);
    }

    /// Apply a successful refresh-in-place: merge the single returned
    /// record back at the target row/node.
    pub fn apply_refresh(&self, target: &RefreshTarget, payload: Value) {
        let (records, _, _) = self.extract(payload);
        let Some(record) = records.into_iter().next() else {
            self.finish_loading(None);
            return;
        };
        match target {
            RefreshTarget::Row { row_index, key } => {
                let mut collection = self.ctx.collection();
                // The snapshot may have shifted; fall back to a key scan.
                let index = collection
                    .get(*row_index)
                    .filter(|r| self.unique_key_value(r) == *key)
                    .map(|_| *row_index)
                    .or_else(|| {
                        collection
                            .iter()
                            .position(|r| self.unique_key_value(r) == *key)
                    });
                if let Some(index) = index {
                    merge_object(&mut collection[index], &record);
                    let merged = collection[index].clone();
                    self.ctx.set_collection(collection);
                    if let SelectionState::Single(Some(row)) = self.ctx.selection() {
                        if row.row_index == index {
                            self.ctx
                                .set_selection_state(SelectionState::Single(Some(SelectedRow {
                                    record: merged.clone(),
                                    row_index: index,
                                })));
                            self.apply_selected_record(Some(merged));
                        }
                    }
                }
            }
            RefreshTarget::Node { path: node_path } => {
                if let Some(child_field) = self.ctx.descriptor.self_reference.clone() {
                    let mut collection = self.ctx.collection();
                    if tree::merge_at_path(&mut collection, &child_field, node_path, &record) {
                        let merged = tree::node_at_path(&collection, &child_field, node_path)
                            .cloned();
                        self.ctx.set_collection(collection);
                        if let (Some(merged), SelectionState::Tree(Some(node))) =
                            (merged, self.ctx.selection())
                        {
                            if node.node_path == *node_path {
                                self.ctx.set_selection_state(SelectionState::Tree(Some(
                                    SelectedNode {
                                        record: merged.clone(),
                                        node_path: node_path.clone(),
                                    },
                                )));
                                self.apply_selected_record(Some(merged));
                            }
                        }
                    }
                }
            }
        }
        self.finish_loading(None);
    }

    /// Connector failure: recovered locally into `control.error`, the
    /// collection is cleared and the error never propagates further.
    pub fn apply_failure(&self, message: String) {
        warn!(
            window = %self.ctx.window_id,
            source = %self.ctx.descriptor.id,
            error = %message,
            "fetch failed"
        );
        self.ctx.set_collection(Vec::new());
        self.reconcile_selection(self.ctx.selection(), &[]);
        self.finish_loading(Some(message));
    }

    // Errors were cleared at fetch start; completion only writes one on
    // failure so an `on_fetch` error recorded during extraction survives.
    fn finish_loading(&self, error: Option<String>) {
        self.ctx.update_control(|c| {
            c.loading = false;
            if error.is_some() {
                c.error = error;
            }
        });
    }

    /// Mirror source: records come from the upstream source's current
    /// selection, no connector involved.
    pub fn sync_mirror(&self) {
        let Some(upstream) = self.ctx.descriptor.data_source_ref.clone() else {
            return;
        };
        let key = CellKey::source(CellKind::Selection, &self.ctx.window_id, &upstream);
        let records = self.ctx.cells.selection(&key).records();
        let previous = self.ctx.selection();
        self.ctx.set_collection_info(CollectionInfo {
            page_count: 1,
            total_count: records.len() as u64,
        });
        self.ctx.set_collection(records.clone());
        self.reconcile_selection(previous, &records);
    }

    /// Slice the raw payload through the declared selectors and run the
    /// bound `on_fetch` transform. The transform is only consulted when
    /// the extracted list is non-empty.
    fn extract(&self, payload: Value) -> (Vec<Value>, CollectionInfo, Option<Value>) {
        let selectors = &self.ctx.descriptor.selectors;
        let data = match &selectors.data {
            Some(p) => path::resolve_cloned(&payload, p),
            None => Some(payload.clone()),
        };
        let mut records = match data {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(other) => {
                debug!(
                    source = %self.ctx.descriptor.id,
                    "data selector did not yield a list; got {}",
                    kind_name(&other)
                );
                Vec::new()
            }
        };
        if !records.is_empty() {
            if let Some(on_fetch) = &self.ctx.on_fetch {
                let args = Value::Array(records.clone());
                let call = HandlerCall {
                    ctx: &self.ctx,
                    args: &args,
                    parameters: &Map::new(),
                };
                match on_fetch(&call) {
                    Ok(Value::Array(transformed)) => records = transformed,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(source = %self.ctx.descriptor.id, error = %e, "onFetch failed");
                        self.ctx.update_control(|c| c.error = Some(e.to_string()));
                    }
                }
            }
        }

        let info = selectors
            .data_info
            .as_deref()
            .and_then(|p| path::resolve(&payload, p))
            .map(|v| CollectionInfo {
                page_count: v.get("pageCount").and_then(Value::as_u64).unwrap_or(1),
                total_count: v
                    .get("totalCount")
                    .and_then(Value::as_u64)
                    .unwrap_or(records.len() as u64),
            })
            .unwrap_or(CollectionInfo {
                page_count: 1,
                total_count: records.len() as u64,
            });

        let metrics = selectors
            .metrics
            .as_deref()
            .and_then(|p| path::resolve_cloned(&payload, p));

        (records, info, metrics)
    }

    /// Re-apply a previous selection against a fresh collection snapshot.
    /// Flat identity is the unique key; tree identity is re-discovered by
    /// key and re-addressed by the new node path.
    fn reconcile_selection(&self, previous: SelectionState, records: &[Value]) {
        match previous {
            SelectionState::Single(Some(row)) => {
                let key = self.unique_key_value(&row.record);
                match records.iter().position(|r| self.unique_key_value(r) == key) {
                    Some(index) => {
                        let record = records[index].clone();
                        self.ctx
                            .set_selection_state(SelectionState::Single(Some(SelectedRow {
                                record: record.clone(),
                                row_index: index,
                            })));
                        self.apply_selected_record(Some(record));
                    }
                    None => {
                        self.ctx.set_selection_state(SelectionState::Single(None));
                        self.apply_selected_record(None);
                    }
                }
            }
            SelectionState::Multi(selected) => {
                let retained: Vec<Value> = selected
                    .iter()
                    .filter_map(|old| {
                        let key = self.unique_key_value(old);
                        records
                            .iter()
                            .find(|r| self.unique_key_value(r) == key)
                            .cloned()
                    })
                    .collect();
                self.ctx.set_selection_state(SelectionState::Multi(retained));
            }
            SelectionState::Tree(Some(node)) => {
                let Some(child_field) = self.ctx.descriptor.self_reference.clone() else {
                    return;
                };
                let key = self.unique_key_value(&node.record);
                match tree::find_path_by_key(
                    records,
                    &child_field,
                    &self.ctx.descriptor.unique_key,
                    &key,
                ) {
                    Some(node_path) => {
                        let record = tree::node_at_path(records, &child_field, &node_path)
                            .cloned()
                            .unwrap_or(node.record);
                        self.ctx
                            .set_selection_state(SelectionState::Tree(Some(SelectedNode {
                                record: record.clone(),
                                node_path,
                            })));
                        self.apply_selected_record(Some(record));
                    }
                    None => {
                        self.ctx.set_selection_state(SelectionState::Tree(None));
                        self.apply_selected_record(None);
                    }
                }
            }
            SelectionState::TreeMulti(nodes) => {
                let Some(child_field) = self.ctx.descriptor.self_reference.clone() else {
                    return;
                };
                let retained: Vec<SelectedNode> = nodes
                    .iter()
                    .filter_map(|old| {
                        let key = self.unique_key_value(&old.record);
                        tree::find_path_by_key(
                            records,
                            &child_field,
                            &self.ctx.descriptor.unique_key,
                            &key,
                        )
                        .and_then(|node_path| {
                            tree::node_at_path(records, &child_field, &node_path).map(|r| {
                                SelectedNode {
                                    record: r.clone(),
                                    node_path,
                                }
                            })
                        })
                    })
                    .collect();
                self.ctx
                    .set_selection_state(SelectionState::TreeMulti(retained));
            }
            SelectionState::Single(None)
            | SelectionState::Tree(None)
            | SelectionState::Unselectable => {}
        }
    }

    /// Copy the selected record into the form and fan the change out to
    /// dependent sources. `None` pushes the absence of every dependent
    /// parameter.
    fn apply_selected_record(&self, record: Option<Value>) {
        match &record {
            Some(r) => self.ctx.set_form(r.clone()),
            None => self.ctx.set_form(Value::Object(Map::new())),
        }
        if self.ctx.descriptor.selection_mode == SelectionMode::Single {
            propagate::push(
                &self.ctx.cells,
                &self.ctx.metadata,
                &self.ctx.window_id,
                &self.ctx.descriptor.id,
                record.as_ref(),
            );
        }
    }
}

fn merge_object(target: &mut Value, incoming: &Value) {
    match (target.as_object_mut(), incoming.as_object()) {
        (Some(t), Some(i)) => {
            for (k, v) in i {
                t.insert(k.clone(), v.clone());
            }
        }
        _ => *target = incoming.clone(),
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellStore;
    use crate::context::{Services, WindowContext};
    use crate::descriptor::WindowMetadata;
    use serde_json::json;

    fn window_with(metadata: Value) -> WindowContext {
        let metadata: WindowMetadata = serde_json::from_value(metadata).expect("metadata parses");
        let services = Services::new(CellStore::new());
        let cells = services.windows.cells().clone();
        WindowContext::new("w1", metadata, cells, services)
    }

    fn flat_window() -> WindowContext {
        window_with(json!({
            "dataSources": [{
                "id": "customers",
                "selectionMode": "single",
                "uniqueKey": [{"field": "id", "parameter": "customerId"}],
                "selectors": {"data": "rows", "dataInfo": "info", "metrics": "totals"},
                "paging": {"pageSize": 10}
            }, {
                "id": "orders",
                "selectionMode": "multi",
                "uniqueKey": [{"field": "id"}],
                "parameters": [
                    {"name": "customerId", "location": "customers.id", "in": "dataSource"}
                ]
            }]
        }))
    }

    fn controller(window: &WindowContext, source: &str) -> DataSourceController {
        DataSourceController::new(window.context(source).expect("declared source"))
    }

    fn payload() -> Value {
        json!({
            "rows": [
                {"id": 1, "name": "Ada"},
                {"id": 2, "name": "Grace"},
                {"id": 3, "name": "Edsger"}
            ],
            "info": {"pageCount": 4, "totalCount": 31},
            "totals": {"active": 17}
        })
    }

    #[test]
    fn test_fetch_collection_merges_filter_and_raises_flag() {
        let window = flat_window();
        let c = controller(&window, "customers");

        c.set_filter(json!({"name": "a"}).as_object().cloned().expect("object"));
        c.fetch_collection(Some(json!({"city": "Graz"}).as_object().cloned().expect("object")));

        let input = c.ctx().input();
        assert!(input.fetch);
        assert_eq!(input.filter.get("name"), Some(&json!("a")));
        assert_eq!(input.filter.get("city"), Some(&json!("Graz")));
    }

    #[test]
    fn test_plan_full_fetch_builds_query_and_clears_flags() {
        let window = flat_window();
        let c = controller(&window, "customers");
        c.fetch_collection(None);

        let plan = c.plan_fetch();
        match plan {
            FetchPlan::Full { query } => {
                assert_eq!(query.page, 1);
                assert_eq!(query.page_size, Some(10));
            }
            other => panic!("expected full plan, got {other:?}"),
        }
        assert!(c.ctx().control().loading);
        assert!(!c.ctx().input().fetch);
        assert_eq!(c.plan_fetch(), FetchPlan::Idle);
    }

    #[test]
    fn test_unresolved_parameters_mark_inactive() {
        let window = flat_window();
        let c = controller(&window, "orders");
        c.fetch_collection(None);

        assert_eq!(c.plan_fetch(), FetchPlan::Inactive);
        let control = c.ctx().control();
        assert!(control.inactive);
        assert!(!control.loading);
    }

    #[test]
    fn test_pushed_parameter_resolves_and_clears_inactive() {
        let window = flat_window();
        let c = controller(&window, "orders");
        c.ctx().update_input(|i| {
            i.parameters.insert("customerId".into(), json!(7));
            i.fetch = true;
        });

        match c.plan_fetch() {
            FetchPlan::Full { query } => {
                assert_eq!(query.parameters.get("customerId"), Some(&json!(7)));
            }
            other => panic!("expected full plan, got {other:?}"),
        }
        assert!(!c.ctx().control().inactive);
    }

    #[test]
    fn test_apply_full_extracts_by_selectors() {
        let window = flat_window();
        let c = controller(&window, "customers");
        c.apply_full(payload());

        assert_eq!(c.ctx().collection().len(), 3);
        let info = c.ctx().collection_info();
        assert_eq!(info.page_count, 4);
        assert_eq!(info.total_count, 31);
        assert_eq!(c.ctx().metrics(), json!({"active": 17}));
        assert!(!c.ctx().control().loading);
    }

    #[test]
    fn test_selection_copies_form_and_survives_reorder() {
        let window = flat_window();
        let c = controller(&window, "customers");
        c.apply_full(payload());

        c.set_selection(Some(1));
        assert_eq!(c.ctx().form(), json!({"id": 2, "name": "Grace"}));
        assert!(c.is_selected(1));

        // Refreshed collection has the same record at a different index.
        c.apply_full(json!({
            "rows": [
                {"id": 2, "name": "Grace H."},
                {"id": 1, "name": "Ada"}
            ]
        }));
        match c.ctx().selection() {
            SelectionState::Single(Some(row)) => {
                assert_eq!(row.row_index, 0);
                assert_eq!(row.record, json!({"id": 2, "name": "Grace H."}));
            }
            other => panic!("selection lost: {other:?}"),
        }
        assert_eq!(c.ctx().form(), json!({"id": 2, "name": "Grace H."}));
    }

    #[test]
    fn test_selection_cleared_when_record_disappears() {
        let window = flat_window();
        let c = controller(&window, "customers");
        c.apply_full(payload());
        c.set_selection(Some(0));

        c.apply_full(json!({"rows": [{"id": 9, "name": "Barbara"}]}));
        assert_eq!(c.ctx().selection(), SelectionState::Single(None));
        assert_eq!(c.ctx().form(), json!({}));
    }

    #[test]
    fn test_selection_fans_out_to_dependents() {
        let window = flat_window();
        let c = controller(&window, "customers");
        c.apply_full(payload());
        c.set_selection(Some(0));

        let orders = window.context("orders").expect("declared source");
        let input = orders.input();
        assert_eq!(input.parameters.get("customerId"), Some(&json!(1)));
        assert!(input.fetch);

        c.set_selection(None);
        let input = orders.input();
        assert!(!input.parameters.contains_key("customerId"));
    }

    #[test]
    fn test_multi_toggle_and_reset() {
        let window = flat_window();
        let c = controller(&window, "orders");
        c.ctx().set_collection(vec![json!({"id": 1}), json!({"id": 2})]);

        c.toggle_selection(0);
        c.toggle_selection(1);
        assert!(c.is_selected(0));
        assert!(c.is_selected(1));

        c.toggle_selection(0);
        assert!(!c.is_selected(0));

        c.set_all_selection();
        assert_eq!(c.ctx().selection().records().len(), 2);
        c.reset_selection();
        assert!(c.ctx().selection().is_empty());
    }

    #[test]
    fn test_refresh_plan_derives_unique_key_filter() {
        let window = flat_window();
        let c = controller(&window, "customers");
        c.apply_full(payload());
        c.set_selection(Some(2));

        c.refresh_selection();
        match c.plan_fetch() {
            FetchPlan::Refresh { query, target } => {
                assert_eq!(query.filter.get("customerId"), Some(&json!(3)));
                assert_eq!(
                    target,
                    RefreshTarget::Row {
                        row_index: 2,
                        key: "3".into()
                    }
                );
            }
            other => panic!("expected refresh plan, got {other:?}"),
        }
    }

    #[test]
    fn test_refresh_without_selection_is_idle() {
        let window = flat_window();
        let c = controller(&window, "customers");
        c.apply_full(payload());
        c.refresh_selection();
        assert_eq!(c.plan_fetch(), FetchPlan::Idle);
    }

    #[test]
    fn test_apply_refresh_merges_in_place() {
        let window = flat_window();
        let c = controller(&window, "customers");
        c.apply_full(payload());
        c.set_selection(Some(1));

        c.apply_refresh(
            &RefreshTarget::Row {
                row_index: 1,
                key: "2".into(),
            },
            json!({"rows": [{"id": 2, "name": "Grace", "status": "active"}]}),
        );

        let collection = c.ctx().collection();
        assert_eq!(collection.len(), 3);
        assert_eq!(collection[1].get("status"), Some(&json!("active")));
        // Unrelated rows untouched.
        assert_eq!(collection[0], json!({"id": 1, "name": "Ada"}));
        assert_eq!(
            c.ctx().form().get("status"),
            Some(&json!("active"))
        );
    }

    #[test]
    fn test_apply_failure_stores_error_and_clears() {
        let window = flat_window();
        let c = controller(&window, "customers");
        c.apply_full(payload());
        c.set_selection(Some(0));

        c.apply_failure("request failed with status 500: oops".into());
        assert!(c.ctx().collection().is_empty());
        let control = c.ctx().control();
        assert!(!control.loading);
        assert_eq!(
            control.error.as_deref(),
            Some("request failed with status 500: oops")
        );
        assert_eq!(c.ctx().selection(), SelectionState::Single(None));
    }

    #[test]
    fn test_on_fetch_transform_skipped_for_empty_list() {
        let window = window_with(json!({
            "namespace": "crm",
            "actions": ["tag"],
            "dataSources": [{
                "id": "customers",
                "selectionMode": "single",
                "uniqueKey": [{"field": "id"}],
                "onFetch": "crm.tag"
            }]
        }));
        window.services().registry.register("crm.tag", |call| {
            let Value::Array(records) = call.args else {
                return Ok(call.args.clone());
            };
            Ok(Value::Array(
                records
                    .iter()
                    .map(|r| {
                        let mut r = r.clone();
                        crate::path::assign(&mut r, "tagged", json!(true));
                        r
                    })
                    .collect(),
            ))
        });
        window.init().expect("bootstrap");
        let c = controller(&window, "customers");

        c.apply_full(json!([{"id": 1}]));
        assert_eq!(c.ctx().collection()[0].get("tagged"), Some(&json!(true)));

        // Empty result list bypasses the transform entirely.
        c.apply_full(json!([]));
        assert!(c.ctx().collection().is_empty());
        assert!(c.ctx().control().error.is_none());
    }

    mod tree_sources {
        use super::*;

        fn tree_window() -> WindowContext {
            window_with(json!({
                "dataSources": [{
                    "id": "folders",
                    "selectionMode": "single",
                    "selfReference": "children",
                    "uniqueKey": [{"field": "id", "parameter": "nodeId"}]
                }]
            }))
        }

        fn forest() -> Value {
            json!([
                {"id": 1, "children": [{"id": 2, "children": []}]}
            ])
        }

        #[test]
        fn test_toggle_node_selects_by_path() {
            let window = tree_window();
            let c = controller(&window, "folders");
            c.apply_full(forest());

            c.toggle_node(&[0, 0]);
            match c.ctx().selection() {
                SelectionState::Tree(Some(node)) => {
                    assert_eq!(node.node_path, vec![0, 0]);
                    assert_eq!(node.record, json!({"id": 2, "children": []}));
                }
                other => panic!("expected tree selection, got {other:?}"),
            }
            assert_eq!(c.ctx().form(), json!({"id": 2, "children": []}));
            assert!(c.is_node_selected(&[0, 0]));

            // Toggling the same path clears.
            c.toggle_node(&[0, 0]);
            assert_eq!(c.ctx().selection(), SelectionState::Tree(None));
        }

        #[test]
        fn test_tree_refresh_uses_node_key_filter() {
            let window = tree_window();
            let c = controller(&window, "folders");
            c.apply_full(forest());
            c.toggle_node(&[0, 0]);

            c.refresh_selection();
            match c.plan_fetch() {
                FetchPlan::Refresh { query, target } => {
                    assert_eq!(query.filter.get("nodeId"), Some(&json!(2)));
                    assert_eq!(target, RefreshTarget::Node { path: vec![0, 0] });
                }
                other => panic!("expected refresh plan, got {other:?}"),
            }

            c.apply_refresh(
                &RefreshTarget::Node { path: vec![0, 0] },
                json!([{"id": 2, "label": "inbox"}]),
            );
            let collection = c.ctx().collection();
            assert_eq!(
                tree::node_at_path(&collection, "children", &[0, 0])
                    .and_then(|n| n.get("label")),
                Some(&json!("inbox"))
            );
        }

        #[test]
        fn test_tree_selection_reconciles_to_new_path() {
            let window = tree_window();
            let c = controller(&window, "folders");
            c.apply_full(forest());
            c.toggle_node(&[0, 0]);

            // The node moved to the root level.
            c.apply_full(json!([
                {"id": 2, "children": []},
                {"id": 1, "children": []}
            ]));
            match c.ctx().selection() {
                SelectionState::Tree(Some(node)) => {
                    assert_eq!(node.node_path, vec![0]);
                }
                other => panic!("expected tree selection, got {other:?}"),
            }
        }
    }

    mod mirror_sources {
        use super::*;

        fn mirror_window() -> WindowContext {
            window_with(json!({
                "dataSources": [{
                    "id": "customers",
                    "selectionMode": "multi",
                    "uniqueKey": [{"field": "id"}]
                }, {
                    "id": "basket",
                    "selectionMode": "single",
                    "uniqueKey": [{"field": "id"}],
                    "dataSourceRef": "customers"
                }]
            }))
        }

        #[test]
        fn test_mirror_reflects_upstream_selection() {
            let window = mirror_window();
            let upstream = controller(&window, "customers");
            upstream
                .ctx()
                .set_collection(vec![json!({"id": 1}), json!({"id": 2})]);
            upstream.toggle_selection(0);
            upstream.toggle_selection(1);

            let mirror = controller(&window, "basket");
            mirror.sync_mirror();
            assert_eq!(mirror.ctx().collection().len(), 2);
            assert_eq!(mirror.ctx().collection_info().total_count, 2);

            upstream.toggle_selection(0);
            mirror.sync_mirror();
            assert_eq!(mirror.ctx().collection(), vec![json!({"id": 2})]);
        }

        #[test]
        fn test_mirror_plan_short_circuits() {
            let window = mirror_window();
            let mirror = controller(&window, "basket");
            mirror.fetch_collection(None);
            assert_eq!(mirror.plan_fetch(), FetchPlan::Mirror);
        }
    }
}

//! Window and dialog lifecycle
//!
//! Tracks the set of open windows, their z-order and docking state, and
//! the pending "await result" resolvers of dialogs/windows opened with
//! `await_result`. Committing a dialog resolves its pending resolver and
//! maps declared outbound parameters from the payload back into the
//! caller's cells.
//!
//! Window identity is deterministic: the window key alone, or
//! `key_<hash(parameters)>` when parameters are present, so re-opening the
//! same logical window with the same parameters restores the existing one
//! instead of stacking a duplicate.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::cell::{CellKey, CellKind, CellStore, CellValue, SelectedRow, SelectionState};
use crate::descriptor::{HandoffParameter, StoreTarget, parse_cell_target};

/// Live state of one open window. Serializes in the camelCase shape the
/// command bridge reports.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowState {
    pub window_id: String,
    pub window_key: String,
    pub window_title: String,
    pub parent_key: Option<String>,
    pub in_tab: bool,
    pub is_modal: bool,
    pub is_minimized: bool,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub z_index: u32,
    pub parameters: Value,
}

/// Creation request for [`WindowManager::add_window`].
#[derive(Clone, Debug, Default)]
pub struct WindowSpec {
    pub key: String,
    pub title: String,
    pub parent_key: Option<String>,
    pub data: Value,
    pub in_tab: bool,
    pub is_modal: bool,
    /// Parameters that contribute to the window identity hash.
    pub parameters: Value,
    pub size: Option<(u32, u32)>,
}

/// Options accepted by `open_dialog`/`open_window` beyond the positional
/// args.
#[derive(Clone, Debug, Default)]
pub struct OpenOptions {
    pub await_result: bool,
    pub parameters: Vec<HandoffParameter>,
    pub modal: bool,
    pub size: Option<(u32, u32)>,
}

/// Receiver half of an awaited open. Resolves with the commit payload, or
/// `None` when the dialog/window closed without committing.
pub struct PendingResult {
    rx: oneshot::Receiver<Value>,
}

impl PendingResult {
    pub async fn wait(self) -> Option<Value> {
        self.rx.await.ok()
    }
}

struct ResolverEntry {
    tx: oneshot::Sender<Value>,
    params: Vec<HandoffParameter>,
    caller_window: String,
    /// Selection cell consulted when commit carries no explicit payload.
    fallback_selection: Option<CellKey>,
}

#[derive(Default)]
struct Inner {
    windows: Vec<WindowState>,
    resolvers: HashMap<String, ResolverEntry>,
    next_z: u32,
}

/// Cheap cloneable handle to the window/dialog lifecycle state.
#[derive(Clone)]
pub struct WindowManager {
    cells: CellStore,
    inner: Rc<RefCell<Inner>>,
}

impl WindowManager {
    pub fn new(cells: CellStore) -> Self {
        Self {
            cells,
            inner: Rc::new(RefCell::new(Inner::default())),
        }
    }

    pub fn cells(&self) -> &CellStore {
        &self.cells
    }

    /// Deterministic window id for a key + parameter blob.
    pub fn window_id_for(key: &str, parameters: &Value) -> String {
        if parameters.is_null() {
            return key.to_string();
        }
        let canonical = parameters.to_string();
        let digest = Sha256::digest(canonical.as_bytes());
        let mut suffix = String::with_capacity(8);
        for byte in &digest[..4] {
            suffix.push_str(&format!("{byte:02x}"));
        }
        format!("{key}_{suffix}")
    }

    /// Create a window, or restore the existing one with the same id.
    /// Returns the window id either way.
    pub fn add_window(&self, spec: WindowSpec) -> String {
        let window_id = Self::window_id_for(&spec.key, &spec.parameters);
        let mut inner = self.inner.borrow_mut();
        if let Some(existing) = inner
            .windows
            .iter_mut()
            .find(|w| w.window_id == window_id)
        {
            existing.is_minimized = false;
            let floating = !existing.in_tab;
            if floating {
                inner.next_z += 1;
                let z = inner.next_z;
                if let Some(w) = inner.windows.iter_mut().find(|w| w.window_id == window_id) {
                    w.z_index = z;
                }
            }
            debug!(window = %window_id, "window restored");
            return window_id;
        }

        let z_index = if spec.in_tab {
            0
        } else {
            inner.next_z += 1;
            inner.next_z
        };
        let cascade = (inner.windows.len() % 10) as i32 * 24;
        let (width, height) = spec.size.unwrap_or((960, 640));
        inner.windows.push(WindowState {
            window_id: window_id.clone(),
            window_key: spec.key,
            window_title: spec.title,
            parent_key: spec.parent_key,
            in_tab: spec.in_tab,
            is_modal: spec.is_modal,
            is_minimized: false,
            x: cascade,
            y: cascade,
            width,
            height,
            z_index,
            parameters: spec.parameters,
        });
        info!(window = %window_id, "window opened");
        window_id
    }

    pub fn window(&self, window_id: &str) -> Option<WindowState> {
        self.inner
            .borrow()
            .windows
            .iter()
            .find(|w| w.window_id == window_id)
            .cloned()
    }

    pub fn list(&self) -> Vec<WindowState> {
        self.inner.borrow().windows.clone()
    }

    /// Bring a floating window to the front.
    pub fn focus(&self, window_id: &str) {
        let mut inner = self.inner.borrow_mut();
        inner.next_z += 1;
        let z = inner.next_z;
        if let Some(w) = inner
            .windows
            .iter_mut()
            .find(|w| w.window_id == window_id && !w.in_tab)
        {
            w.z_index = z;
        }
    }

    pub fn set_minimized(&self, window_id: &str, minimized: bool) {
        let mut inner = self.inner.borrow_mut();
        if let Some(w) = inner.windows.iter_mut().find(|w| w.window_id == window_id) {
            w.is_minimized = minimized;
        }
    }

    /// Dock into (or float out of) the tab strip.
    pub fn set_docked(&self, window_id: &str, in_tab: bool) {
        let mut inner = self.inner.borrow_mut();
        let z = if in_tab {
            0
        } else {
            inner.next_z += 1;
            inner.next_z
        };
        if let Some(w) = inner.windows.iter_mut().find(|w| w.window_id == window_id) {
            w.in_tab = in_tab;
            w.z_index = z;
        }
    }

    pub fn move_window(&self, window_id: &str, x: i32, y: i32) {
        let mut inner = self.inner.borrow_mut();
        if let Some(w) = inner.windows.iter_mut().find(|w| w.window_id == window_id) {
            w.x = x;
            w.y = y;
        }
    }

    /// Close a window: drop its state, its pending resolvers and every
    /// cell it owned.
    pub fn remove_window(&self, window_id: &str) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.windows.retain(|w| w.window_id != window_id);
            inner.resolvers.retain(|key, _| {
                key != window_id && !key.starts_with(&format!("{window_id}/"))
            });
        }
        self.cells.purge_window(window_id);
        info!(window = %window_id, "window closed");
    }

    /// Open a dialog owned by `window_id`. Returns the pending result when
    /// `await_result` is set.
    ///
    /// `fallback_selection` names the selection cell consulted when the
    /// dialog is later committed with no explicit payload.
    pub fn open_dialog(
        &self,
        window_id: &str,
        dialog_id: &str,
        args: Value,
        props: Value,
        fallback_selection: Option<CellKey>,
        options: OpenOptions,
    ) -> Option<PendingResult> {
        let dialog_key = CellKey::dialog(window_id, dialog_id);
        self.cells.update(&dialog_key, |v| {
            if let CellValue::Dialog(state) = v {
                state.open = true;
                state.args = args.clone();
                state.props = props.clone();
            }
        });
        debug!(window = %window_id, dialog = %dialog_id, awaited = options.await_result, "dialog opened");
        if !options.await_result {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.inner.borrow_mut().resolvers.insert(
            dialog_key.owner.clone(),
            ResolverEntry {
                tx,
                params: options.parameters,
                caller_window: window_id.to_string(),
                fallback_selection,
            },
        );
        Some(PendingResult { rx })
    }

    /// Close a dialog without resolving anything. A pending resolver is
    /// dropped, which surfaces as `None` to the awaiting caller.
    pub fn close_dialog(&self, window_id: &str, dialog_id: &str) {
        let dialog_key = CellKey::dialog(window_id, dialog_id);
        self.inner.borrow_mut().resolvers.remove(&dialog_key.owner);
        self.cells.update(&dialog_key, |v| {
            if let CellValue::Dialog(state) = v {
                state.open = false;
            }
        });
    }

    /// Commit a dialog: close it, resolve the pending resolver with the
    /// payload (falling back to the dialog's own current selection) and
    /// map outbound parameters into the caller's cells.
    ///
    /// Commit with no pending resolver closes silently; that is the
    /// documented no-op, not an error.
    pub fn commit_dialog(&self, window_id: &str, dialog_id: &str, payload: Option<Value>) {
        let dialog_key = CellKey::dialog(window_id, dialog_id);
        self.cells.update(&dialog_key, |v| {
            if let CellValue::Dialog(state) = v {
                state.open = false;
            }
        });
        self.resolve(&dialog_key.owner, payload);
    }

    /// Register an awaited open for a whole window. The resolver is keyed
    /// by the opened window's id; `commit_window` resolves it.
    pub fn await_window_result(
        &self,
        opened_window_id: &str,
        caller_window: &str,
        params: Vec<HandoffParameter>,
        fallback_selection: Option<CellKey>,
    ) -> PendingResult {
        let (tx, rx) = oneshot::channel();
        self.inner.borrow_mut().resolvers.insert(
            opened_window_id.to_string(),
            ResolverEntry {
                tx,
                params,
                caller_window: caller_window.to_string(),
                fallback_selection,
            },
        );
        PendingResult { rx }
    }

    /// Commit an awaited window and close it.
    pub fn commit_window(&self, window_id: &str, payload: Option<Value>) {
        self.resolve(window_id, payload);
        self.remove_window(window_id);
    }

    fn resolve(&self, resolver_key: &str, payload: Option<Value>) {
        let Some(entry) = self.inner.borrow_mut().resolvers.remove(resolver_key) else {
            debug!(key = %resolver_key, "commit without pending resolver; closing silently");
            return;
        };
        let payload = payload
            .or_else(|| {
                entry
                    .fallback_selection
                    .as_ref()
                    .and_then(|key| self.selection_payload(key))
            })
            .unwrap_or_else(|| Value::Object(Map::new()));

        for param in entry.params.iter().filter(|p| p.is_outbound()) {
            let value = crate::path::resolve_cloned(&payload, param.payload_path())
                .unwrap_or(Value::Null);
            let Some(target) = param.to.as_deref() else {
                continue;
            };
            match parse_cell_target(target) {
                Some((source_ref, store)) => {
                    self.write_target(&entry.caller_window, source_ref, store, &param.name, value);
                }
                None => {
                    debug!(target = %target, "ignoring malformed outbound target");
                }
            }
        }
        // Receiver may be gone; a dropped caller is not an error.
        let _ = entry.tx.send(payload);
    }

    /// "Commit with nothing selected" degrades to an empty payload.
    fn selection_payload(&self, key: &CellKey) -> Option<Value> {
        match self.cells.peek(key) {
            CellValue::Selection(SelectionState::Single(Some(row))) => Some(row.record),
            CellValue::Selection(SelectionState::Tree(Some(node))) => Some(node.record),
            CellValue::Selection(SelectionState::Multi(records)) if !records.is_empty() => {
                Some(Value::Array(records))
            }
            CellValue::Selection(SelectionState::TreeMulti(nodes)) if !nodes.is_empty() => {
                Some(Value::Array(nodes.into_iter().map(|n| n.record).collect()))
            }
            _ => None,
        }
    }

    fn write_target(
        &self,
        caller_window: &str,
        source_ref: &str,
        store: StoreTarget,
        name: &str,
        value: Value,
    ) {
        let key = |kind| CellKey::source(kind, caller_window, source_ref);
        match store {
            StoreTarget::Form => self.cells.update(&key(CellKind::Form), |v| {
                if let CellValue::Form(form) = v {
                    crate::path::assign(form, name, value.clone());
                }
            }),
            StoreTarget::Metrics => self.cells.update(&key(CellKind::Metrics), |v| {
                if let CellValue::Metrics(metrics) = v {
                    crate::path::assign(metrics, name, value.clone());
                }
            }),
            StoreTarget::Selection => {
                let collection_key = key(CellKind::Collection);
                let row_index = match self.cells.peek(&collection_key) {
                    CellValue::Collection(records) => {
                        records.iter().position(|r| *r == value).unwrap_or(0)
                    }
                    _ => 0,
                };
                self.cells.set(
                    &key(CellKind::Selection),
                    CellValue::Selection(SelectionState::Single(Some(SelectedRow {
                        record: value.clone(),
                        row_index,
                    }))),
                );
            }
            StoreTarget::Filter
            | StoreTarget::InputQuery
            | StoreTarget::InputHeaders
            | StoreTarget::InputBody
            | StoreTarget::InputPath => self.cells.update(&key(CellKind::Input), |v| {
                if let CellValue::Input(input) = v {
                    match store {
                        StoreTarget::Filter => {
                            input.filter.insert(name.to_string(), value.clone());
                        }
                        StoreTarget::InputQuery => {
                            input.query.insert(name.to_string(), value.clone());
                        }
                        StoreTarget::InputHeaders => {
                            input.headers.insert(name.to_string(), value.clone());
                        }
                        StoreTarget::InputBody => input.body = value.clone(),
                        StoreTarget::InputPath => {
                            input.path.insert(name.to_string(), value.clone());
                        }
                        _ => {}
                    }
                }
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> WindowManager {
        WindowManager::new(CellStore::new())
    }

    fn spec(key: &str) -> WindowSpec {
        WindowSpec {
            key: key.into(),
            title: key.into(),
            parameters: Value::Null,
            ..WindowSpec::default()
        }
    }

    #[test]
    fn test_window_id_deterministic() {
        assert_eq!(WindowManager::window_id_for("orders", &Value::Null), "orders");
        let a = WindowManager::window_id_for("orders", &json!({"id": 7}));
        let b = WindowManager::window_id_for("orders", &json!({"id": 7}));
        let c = WindowManager::window_id_for("orders", &json!({"id": 8}));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("orders_"));
    }

    #[test]
    fn test_reopen_restores_and_refocuses() {
        let wm = manager();
        let id = wm.add_window(spec("orders"));
        wm.set_minimized(&id, true);
        let first_z = wm.window(&id).expect("open").z_index;

        let again = wm.add_window(spec("orders"));
        assert_eq!(again, id);
        let state = wm.window(&id).expect("open");
        assert!(!state.is_minimized);
        assert!(state.z_index > first_z);
        assert_eq!(wm.list().len(), 1);
    }

    #[test]
    fn test_floating_focus_bumps_z() {
        let wm = manager();
        let a = wm.add_window(spec("a"));
        let b = wm.add_window(spec("b"));
        assert!(wm.window(&b).expect("open").z_index > wm.window(&a).expect("open").z_index);

        wm.focus(&a);
        assert!(wm.window(&a).expect("open").z_index > wm.window(&b).expect("open").z_index);
    }

    #[test]
    fn test_docked_windows_have_no_z() {
        let wm = manager();
        let id = wm.add_window(WindowSpec {
            in_tab: true,
            ..spec("tabbed")
        });
        assert_eq!(wm.window(&id).expect("open").z_index, 0);

        wm.set_docked(&id, false);
        assert!(wm.window(&id).expect("open").z_index > 0);
        wm.set_docked(&id, true);
        assert_eq!(wm.window(&id).expect("open").z_index, 0);
    }

    #[test]
    fn test_remove_window_purges_cells() {
        let wm = manager();
        let id = wm.add_window(spec("orders"));
        let form_key = CellKey::source(CellKind::Form, &id, "items");
        wm.cells().set(&form_key, CellValue::Form(json!({"x": 1})));
        assert_eq!(wm.cells().len(), 1);

        wm.remove_window(&id);
        assert!(wm.window(&id).is_none());
        assert!(wm.cells().is_empty());
    }

    #[tokio::test]
    async fn test_commit_resolves_awaited_dialog() {
        let wm = manager();
        let pending = wm
            .open_dialog(
                "w1",
                "pick",
                json!({"hint": "choose"}),
                Value::Null,
                None,
                OpenOptions {
                    await_result: true,
                    ..OpenOptions::default()
                },
            )
            .expect("awaited open returns a pending result");
        assert!(wm.cells().dialog(&CellKey::dialog("w1", "pick")).open);

        wm.commit_dialog("w1", "pick", Some(json!({"email": "a@b.com"})));
        assert!(!wm.cells().dialog(&CellKey::dialog("w1", "pick")).open);
        assert_eq!(pending.wait().await, Some(json!({"email": "a@b.com"})));
    }

    #[tokio::test]
    async fn test_outbound_parameter_maps_into_caller_form() {
        let wm = manager();
        let params: Vec<HandoffParameter> = serde_json::from_value(json!([
            {"name": "email", "direction": "out", "to": "caller:form"}
        ]))
        .expect("params parse");
        let pending = wm
            .open_dialog(
                "w1",
                "pick",
                Value::Null,
                Value::Null,
                None,
                OpenOptions {
                    await_result: true,
                    parameters: params,
                    ..OpenOptions::default()
                },
            )
            .expect("pending");

        wm.commit_dialog("w1", "pick", Some(json!({"email": "a@b.com"})));
        assert_eq!(pending.wait().await, Some(json!({"email": "a@b.com"})));

        let form = wm
            .cells()
            .form(&CellKey::source(CellKind::Form, "w1", "caller"));
        assert_eq!(form, json!({"email": "a@b.com"}));
    }

    #[tokio::test]
    async fn test_commit_falls_back_to_selection() {
        let wm = manager();
        let selection_key = CellKey::source(CellKind::Selection, "w1", "contacts");
        wm.cells().set(
            &selection_key,
            CellValue::Selection(SelectionState::Single(Some(SelectedRow {
                record: json!({"id": 3, "email": "c@d.com"}),
                row_index: 2,
            }))),
        );

        let pending = wm
            .open_dialog(
                "w1",
                "pick",
                Value::Null,
                Value::Null,
                Some(selection_key),
                OpenOptions {
                    await_result: true,
                    ..OpenOptions::default()
                },
            )
            .expect("pending");

        wm.commit_dialog("w1", "pick", None);
        assert_eq!(
            pending.wait().await,
            Some(json!({"id": 3, "email": "c@d.com"}))
        );
    }

    #[tokio::test]
    async fn test_commit_with_nothing_selected_degrades_to_empty() {
        let wm = manager();
        let selection_key = CellKey::source(CellKind::Selection, "w1", "contacts");
        let pending = wm
            .open_dialog(
                "w1",
                "pick",
                Value::Null,
                Value::Null,
                Some(selection_key),
                OpenOptions {
                    await_result: true,
                    ..OpenOptions::default()
                },
            )
            .expect("pending");

        wm.commit_dialog("w1", "pick", None);
        assert_eq!(pending.wait().await, Some(json!({})));
    }

    #[test]
    fn test_commit_without_resolver_is_silent_close() {
        let wm = manager();
        wm.open_dialog(
            "w1",
            "pick",
            Value::Null,
            Value::Null,
            None,
            OpenOptions::default(),
        );
        // No resolver was registered; this must not panic or error.
        wm.commit_dialog("w1", "pick", Some(json!({"x": 1})));
        assert!(!wm.cells().dialog(&CellKey::dialog("w1", "pick")).open);
    }

    #[tokio::test]
    async fn test_close_drops_resolver() {
        let wm = manager();
        let pending = wm
            .open_dialog(
                "w1",
                "pick",
                Value::Null,
                Value::Null,
                None,
                OpenOptions {
                    await_result: true,
                    ..OpenOptions::default()
                },
            )
            .expect("pending");
        wm.close_dialog("w1", "pick");
        assert_eq!(pending.wait().await, None);
    }
}

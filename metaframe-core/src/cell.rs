//! Reactive cell store
//!
//! Every piece of per-window runtime state lives in a *cell*: a typed,
//! mutable container addressed by `(kind, owner)` where the owner is
//! `"<windowId>/<dataSourceRef>"` for source-scoped cells or the bare
//! window id for window-scoped ones. Cells are created lazily on first
//! access and memoized; the same key always resolves to the same cell.
//!
//! Reactivity is synchronous and effect-based: a registered effect tracks
//! the cells it reads while running, and re-runs whenever one of those
//! cells is written with a *different* value. Writes that leave the value
//! unchanged notify nobody.
//!
//! The store is a cheap cloneable handle. The engine is single-threaded
//! and cooperative; there is no locking, only `Rc<RefCell<_>>`.
//!
//! # Example
//!
//! ```ignore
//! let cells = CellStore::new();
//! let key = CellKey::source(CellKind::Control, "w1", "orders");
//!
//! cells.effect(None, move |store| {
//!     let control = store.control(&key);
//!     tracing::debug!(loading = control.loading, "control changed");
//! });
//!
//! cells.update(&key, |v| {
//!     if let CellValue::Control(c) = v {
//!         c.loading = true; // effect re-runs synchronously
//!     }
//! });
//! ```
//!
//! Lifecycle: cells grow without bound until [`CellStore::purge_window`]
//! removes everything a closed window owned, effects included.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use serde_json::{Map, Value};
use tracing::warn;

use crate::descriptor::EventBinding;

/// The kind half of a cell address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CellKind {
    Input,
    Control,
    Form,
    Selection,
    Collection,
    CollectionInfo,
    Metrics,
    FormStatus,
    Message,
    Dialog,
}

/// Composite cell address: kind + owner string.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CellKey {
    pub kind: CellKind,
    pub owner: String,
}

impl CellKey {
    /// Key for a source-scoped cell (`"<windowId>/<sourceRef>"`).
    pub fn source(kind: CellKind, window_id: &str, source_ref: &str) -> Self {
        Self {
            kind,
            owner: format!("{window_id}/{source_ref}"),
        }
    }

    /// Key for a window-scoped cell.
    pub fn window(kind: CellKind, window_id: &str) -> Self {
        Self {
            kind,
            owner: window_id.to_string(),
        }
    }

    /// Key for a dialog cell (`"<windowId>/Dialog/<dialogId>"`).
    pub fn dialog(window_id: &str, dialog_id: &str) -> Self {
        Self {
            kind: CellKind::Dialog,
            owner: format!("{window_id}/Dialog/{dialog_id}"),
        }
    }

    fn owned_by(&self, window_id: &str) -> bool {
        self.owner == window_id
            || self
                .owner
                .strip_prefix(window_id)
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

/// Fetch/refresh intent plus the request-shaping state of one source.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InputState {
    pub fetch: bool,
    pub refresh: bool,
    pub page: u32,
    pub filter: Map<String, Value>,
    pub parameters: Map<String, Value>,
    pub refresh_filter: Map<String, Value>,
    pub query: Map<String, Value>,
    pub headers: Map<String, Value>,
    pub body: Value,
    pub path: Map<String, Value>,
}

/// Loading/error/inactive flags of one source.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ControlState {
    pub loading: bool,
    pub error: Option<String>,
    /// Set while the source has unresolved declared parameters; an
    /// inactive source never issues fetches.
    pub inactive: bool,
}

/// Paging info extracted from a payload.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CollectionInfo {
    pub page_count: u64,
    pub total_count: u64,
}

/// Dirty flag plus a monotonic version for the form cell.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FormStatus {
    pub dirty: bool,
    pub version: u64,
}

/// A flat selected row.
#[derive(Clone, Debug, PartialEq)]
pub struct SelectedRow {
    pub record: Value,
    pub row_index: usize,
}

/// A selected tree node, addressed by its index path from the root list.
#[derive(Clone, Debug, PartialEq)]
pub struct SelectedNode {
    pub record: Value,
    pub node_path: Vec<usize>,
}

/// Selection state, one variant per selection mode.
#[derive(Clone, Debug, PartialEq)]
pub enum SelectionState {
    /// `selectionMode = none`.
    Unselectable,
    Single(Option<SelectedRow>),
    Multi(Vec<Value>),
    Tree(Option<SelectedNode>),
    TreeMulti(Vec<SelectedNode>),
}

impl SelectionState {
    /// The selected record of a single/tree selection, if any.
    pub fn selected(&self) -> Option<&Value> {
        match self {
            Self::Single(Some(row)) => Some(&row.record),
            Self::Tree(Some(node)) => Some(&node.record),
            _ => None,
        }
    }

    /// All selected records, across modes.
    pub fn records(&self) -> Vec<Value> {
        match self {
            Self::Unselectable => Vec::new(),
            Self::Single(row) => row.iter().map(|r| r.record.clone()).collect(),
            Self::Multi(records) => records.clone(),
            Self::Tree(node) => node.iter().map(|n| n.record.clone()).collect(),
            Self::TreeMulti(nodes) => nodes.iter().map(|n| n.record.clone()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Unselectable => true,
            Self::Single(row) => row.is_none(),
            Self::Multi(records) => records.is_empty(),
            Self::Tree(node) => node.is_none(),
            Self::TreeMulti(nodes) => nodes.is_empty(),
        }
    }
}

/// A deferred execution parked in the window message queue.
#[derive(Clone, Debug, PartialEq)]
pub struct QueuedMessage {
    pub binding: EventBinding,
    pub data_source_ref: String,
    pub args: Value,
}

/// Open state and arguments of one dialog.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DialogState {
    pub open: bool,
    pub args: Value,
    pub props: Value,
}

/// The value held by one cell. Closed union over every cell kind.
#[derive(Clone, Debug, PartialEq)]
pub enum CellValue {
    Input(InputState),
    Control(ControlState),
    Form(Value),
    Selection(SelectionState),
    Collection(Vec<Value>),
    CollectionInfo(CollectionInfo),
    Metrics(Value),
    FormStatus(FormStatus),
    Message(Vec<QueuedMessage>),
    Dialog(DialogState),
}

impl CellValue {
    /// The value a cell of `kind` starts with when lazily created.
    pub fn initial(kind: CellKind) -> Self {
        match kind {
            CellKind::Input => Self::Input(InputState::default()),
            CellKind::Control => Self::Control(ControlState::default()),
            CellKind::Form => Self::Form(Value::Object(Map::new())),
            CellKind::Selection => Self::Selection(SelectionState::Unselectable),
            CellKind::Collection => Self::Collection(Vec::new()),
            CellKind::CollectionInfo => Self::CollectionInfo(CollectionInfo::default()),
            CellKind::Metrics => Self::Metrics(Value::Object(Map::new())),
            CellKind::FormStatus => Self::FormStatus(FormStatus::default()),
            CellKind::Message => Self::Message(Vec::new()),
            CellKind::Dialog => Self::Dialog(DialogState::default()),
        }
    }
}

/// Identifier of a registered effect.
pub type EffectId = usize;

struct EffectEntry {
    run: Rc<dyn Fn(&CellStore)>,
    /// Window id the effect is torn down with, if window-scoped.
    owner: Option<String>,
}

#[derive(Default)]
struct Inner {
    cells: HashMap<CellKey, CellValue>,
    /// Cell → effects that read it on their last run.
    readers: HashMap<CellKey, HashSet<EffectId>>,
    /// Effect → cells it read on its last run.
    reads: HashMap<EffectId, HashSet<CellKey>>,
    effects: HashMap<EffectId, EffectEntry>,
    next_effect: EffectId,
    /// Effect currently executing; reads during its run subscribe it.
    active: Option<EffectId>,
    dirty: VecDeque<EffectId>,
    queued: HashSet<EffectId>,
    draining: bool,
}

/// Cheap cloneable handle to the window-scoped reactive state store.
#[derive(Clone, Default)]
pub struct CellStore {
    inner: Rc<RefCell<Inner>>,
}

/// Effect re-runs processed per drain before the store assumes a cycle.
const DRAIN_LIMIT: usize = 10_000;

impl CellStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a cell, creating it if absent. Subscribes the running effect,
    /// if any.
    pub fn get(&self, key: &CellKey) -> CellValue {
        let mut inner = self.inner.borrow_mut();
        if let Some(id) = inner.active {
            inner.readers.entry(key.clone()).or_default().insert(id);
            inner.reads.entry(id).or_default().insert(key.clone());
        }
        inner
            .cells
            .entry(key.clone())
            .or_insert_with(|| CellValue::initial(key.kind))
            .clone()
    }

    /// Read a cell without subscribing, creating it if absent.
    pub fn peek(&self, key: &CellKey) -> CellValue {
        self.inner
            .borrow_mut()
            .cells
            .entry(key.clone())
            .or_insert_with(|| CellValue::initial(key.kind))
            .clone()
    }

    /// Write a cell. Readers are notified only when the value actually
    /// changed; notified effects re-run synchronously before this returns
    /// (unless a notification drain is already in progress higher up the
    /// stack, in which case they run before *that* drain returns).
    pub fn set(&self, key: &CellKey, value: CellValue) {
        let start_drain = {
            let mut inner = self.inner.borrow_mut();
            let slot = inner
                .cells
                .entry(key.clone())
                .or_insert_with(|| CellValue::initial(key.kind));
            if *slot == value {
                return;
            }
            *slot = value;
            let ids: Vec<EffectId> = inner
                .readers
                .get(key)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default();
            for id in ids {
                if inner.queued.insert(id) {
                    inner.dirty.push_back(id);
                }
            }
            if inner.draining {
                false
            } else {
                inner.draining = true;
                true
            }
        };
        if start_drain {
            self.drain();
        }
    }

    /// Read-modify-write. Notification follows the same changed-value rule
    /// as [`CellStore::set`].
    pub fn update(&self, key: &CellKey, f: impl FnOnce(&mut CellValue)) {
        let mut value = self.peek(key);
        f(&mut value);
        self.set(key, value);
    }

    /// Register an effect and run it once to establish its subscriptions.
    ///
    /// `owner` ties the effect to a window: it is dropped when that window
    /// is purged.
    pub fn effect(&self, owner: Option<&str>, f: impl Fn(&CellStore) + 'static) -> EffectId {
        let id = {
            let mut inner = self.inner.borrow_mut();
            let id = inner.next_effect;
            inner.next_effect += 1;
            inner.effects.insert(
                id,
                EffectEntry {
                    run: Rc::new(f),
                    owner: owner.map(str::to_string),
                },
            );
            id
        };
        self.run_effect(id);
        id
    }

    /// Drop an effect and its subscriptions.
    pub fn remove_effect(&self, id: EffectId) {
        let mut inner = self.inner.borrow_mut();
        inner.effects.remove(&id);
        inner.queued.remove(&id);
        if let Some(keys) = inner.reads.remove(&id) {
            for key in keys {
                if let Some(readers) = inner.readers.get_mut(&key) {
                    readers.remove(&id);
                }
            }
        }
    }

    /// Purge every cell and effect owned by `window_id`. Called on window
    /// close; there is no other garbage collection.
    pub fn purge_window(&self, window_id: &str) {
        let effect_ids: Vec<EffectId> = {
            let inner = self.inner.borrow();
            inner
                .effects
                .iter()
                .filter(|(_, e)| e.owner.as_deref() == Some(window_id))
                .map(|(id, _)| *id)
                .collect()
        };
        for id in effect_ids {
            self.remove_effect(id);
        }
        let mut inner = self.inner.borrow_mut();
        let doomed: Vec<CellKey> = inner
            .cells
            .keys()
            .filter(|k| k.owned_by(window_id))
            .cloned()
            .collect();
        for key in doomed {
            inner.cells.remove(&key);
            inner.readers.remove(&key);
        }
    }

    /// Number of live cells, for diagnostics.
    pub fn len(&self) -> usize {
        self.inner.borrow().cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().cells.is_empty()
    }

    fn drain(&self) {
        let mut processed = 0usize;
        loop {
            let next = {
                let mut inner = self.inner.borrow_mut();
                match inner.dirty.pop_front() {
                    Some(id) => {
                        inner.queued.remove(&id);
                        Some(id)
                    }
                    None => {
                        inner.draining = false;
                        None
                    }
                }
            };
            let Some(id) = next else {
                return;
            };
            processed += 1;
            if processed > DRAIN_LIMIT {
                warn!("effect drain exceeded {DRAIN_LIMIT} re-runs; breaking cycle");
                let mut inner = self.inner.borrow_mut();
                inner.dirty.clear();
                inner.queued.clear();
                inner.draining = false;
                return;
            }
            self.run_effect(id);
        }
    }

    fn run_effect(&self, id: EffectId) {
        let (run, previous_active) = {
            let mut inner = self.inner.borrow_mut();
            let Some(entry) = inner.effects.get(&id) else {
                return;
            };
            let run = Rc::clone(&entry.run);
            // Re-tracking: old edges are dropped so the new run records a
            // fresh read set.
            if let Some(keys) = inner.reads.remove(&id) {
                for key in keys {
                    if let Some(readers) = inner.readers.get_mut(&key) {
                        readers.remove(&id);
                    }
                }
            }
            let previous = inner.active.replace(id);
            (run, previous)
        };
        run(self);
        self.inner.borrow_mut().active = previous_active;
    }
}

// Typed accessors. A kind mismatch cannot happen through the public key
// constructors; the fallback keeps them total anyway.
impl CellStore {
    pub fn input(&self, key: &CellKey) -> InputState {
        match self.get(key) {
            CellValue::Input(v) => v,
            _ => InputState::default(),
        }
    }

    pub fn control(&self, key: &CellKey) -> ControlState {
        match self.get(key) {
            CellValue::Control(v) => v,
            _ => ControlState::default(),
        }
    }

    pub fn form(&self, key: &CellKey) -> Value {
        match self.get(key) {
            CellValue::Form(v) => v,
            _ => Value::Object(Map::new()),
        }
    }

    pub fn selection(&self, key: &CellKey) -> SelectionState {
        match self.get(key) {
            CellValue::Selection(v) => v,
            _ => SelectionState::Unselectable,
        }
    }

    pub fn collection(&self, key: &CellKey) -> Vec<Value> {
        match self.get(key) {
            CellValue::Collection(v) => v,
            _ => Vec::new(),
        }
    }

    pub fn collection_info(&self, key: &CellKey) -> CollectionInfo {
        match self.get(key) {
            CellValue::CollectionInfo(v) => v,
            _ => CollectionInfo::default(),
        }
    }

    pub fn metrics(&self, key: &CellKey) -> Value {
        match self.get(key) {
            CellValue::Metrics(v) => v,
            _ => Value::Object(Map::new()),
        }
    }

    pub fn form_status(&self, key: &CellKey) -> FormStatus {
        match self.get(key) {
            CellValue::FormStatus(v) => v,
            _ => FormStatus::default(),
        }
    }

    pub fn messages(&self, key: &CellKey) -> Vec<QueuedMessage> {
        match self.get(key) {
            CellValue::Message(v) => v,
            _ => Vec::new(),
        }
    }

    pub fn dialog(&self, key: &CellKey) -> DialogState {
        match self.get(key) {
            CellValue::Dialog(v) => v,
            _ => DialogState::default(),
        }
    }
}

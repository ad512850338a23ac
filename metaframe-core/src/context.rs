//! Context factory and handler registry
//!
//! A [`WindowContext`] is the runtime bundle built for one open window:
//! its metadata, its cells, its resolved action table and a memoized
//! [`DataSourceContext`] per data-source reference. A `DataSourceContext`
//! in turn bundles the cells, connector and identity of one source; it is
//! what the controller, the propagator and user handlers operate on.
//!
//! Handlers are registered ahead of time in a [`HandlerRegistry`] under
//! dotted names (`"crm.saveCustomer"`, `"date.parseISO"`). Window metadata
//! declares which action names it expects under its namespace; resolution
//! happens once at window bootstrap and a miss is fatal to the bootstrap.
//! This replaces runtime compilation of action code with a typed lookup.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use crate::cell::{
    CellKey, CellKind, CellStore, CellValue, CollectionInfo, ControlState, DialogState,
    FormStatus, InputState, SelectionState,
};
use crate::connector::Connector;
use crate::descriptor::{DataSourceDescriptor, DialogDescriptor, SelectionMode, WindowMetadata};
use crate::error::EngineError;
use crate::window::WindowManager;

/// Everything a handler invocation can see: the source context it runs
/// against, the declared args and the resolved scoped parameters.
pub struct HandlerCall<'a> {
    pub ctx: &'a DataSourceContext,
    pub args: &'a Value,
    pub parameters: &'a Map<String, Value>,
}

/// A registered handler implementation.
pub type HandlerFn = Rc<dyn Fn(&HandlerCall<'_>) -> Result<Value, EngineError>>;

/// Process-scoped table of named handler implementations.
///
/// Dotted names give namespace structure (`"date.format"`); lookup is a
/// flat map access, and a miss can enumerate the sibling names under the
/// same prefix for diagnostics.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    inner: Rc<RefCell<HashMap<String, HandlerFn>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        path: impl Into<String>,
        handler: impl Fn(&HandlerCall<'_>) -> Result<Value, EngineError> + 'static,
    ) {
        self.inner
            .borrow_mut()
            .insert(path.into(), Rc::new(handler));
    }

    pub fn lookup(&self, path: &str) -> Option<HandlerFn> {
        self.inner.borrow().get(path).cloned()
    }

    /// All registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.borrow().keys().cloned().collect();
        names.sort();
        names
    }

    /// Registered names sharing `path`'s namespace prefix; every name when
    /// the prefix matches nothing.
    pub fn siblings(&self, path: &str) -> Vec<String> {
        let prefix = match path.rsplit_once('.') {
            Some((ns, _)) => format!("{ns}."),
            None => String::new(),
        };
        let mut siblings: Vec<String> = self
            .inner
            .borrow()
            .keys()
            .filter(|name| name.starts_with(&prefix))
            .cloned()
            .collect();
        if siblings.is_empty() {
            siblings = self.names();
        } else {
            siblings.sort();
        }
        siblings
    }
}

/// Builds the connector bound to one source's service config.
pub type ConnectorFactory = Rc<dyn Fn(&DataSourceDescriptor) -> Arc<dyn Connector>>;

/// Process-scoped collaborators injected into every window context.
#[derive(Clone)]
pub struct Services {
    pub registry: HandlerRegistry,
    pub connectors: ConnectorFactory,
    pub windows: WindowManager,
}

impl Services {
    /// Services with an empty registry (plus the built-in `date` library)
    /// and a connector factory that rejects every request. Callers swap in
    /// a real factory before opening windows that fetch.
    pub fn new(cells: CellStore) -> Self {
        let registry = HandlerRegistry::new();
        crate::date::register(&registry);
        Self {
            registry,
            connectors: Rc::new(|_| Arc::new(crate::connector::NullConnector)),
            windows: WindowManager::new(cells),
        }
    }

    pub fn with_connectors(mut self, connectors: ConnectorFactory) -> Self {
        self.connectors = connectors;
        self
    }
}

/// The runtime bundle of one open window.
pub struct WindowContext {
    window_id: String,
    metadata: Rc<WindowMetadata>,
    cells: CellStore,
    services: Services,
    actions: RefCell<HashMap<String, HandlerFn>>,
    contexts: RefCell<HashMap<String, Rc<DataSourceContext>>>,
    dialogs: RefCell<HashMap<String, Rc<DialogContext>>>,
}

impl WindowContext {
    pub fn new(
        window_id: impl Into<String>,
        metadata: WindowMetadata,
        cells: CellStore,
        services: Services,
    ) -> Self {
        Self {
            window_id: window_id.into(),
            metadata: Rc::new(metadata),
            cells,
            services,
            actions: RefCell::new(HashMap::new()),
            contexts: RefCell::new(HashMap::new()),
            dialogs: RefCell::new(HashMap::new()),
        }
    }

    /// Resolve the metadata's declared action bundle into the local lookup
    /// table. A declared action missing from the registry is fatal here,
    /// before anything ran against the window.
    pub fn init(&self) -> Result<(), EngineError> {
        let namespace = &self.metadata.namespace;
        let mut actions = self.actions.borrow_mut();
        for name in &self.metadata.actions {
            let full = format!("{namespace}.{name}");
            let handler =
                self.services
                    .registry
                    .lookup(&full)
                    .ok_or_else(|| EngineError::UnknownAction {
                        namespace: namespace.clone(),
                        name: name.clone(),
                    })?;
            actions.insert(name.clone(), Rc::clone(&handler));
            actions.insert(full, handler);
        }
        debug!(window = %self.window_id, actions = actions.len(), "window actions resolved");
        Ok(())
    }

    pub fn window_id(&self) -> &str {
        &self.window_id
    }

    pub fn metadata(&self) -> &Rc<WindowMetadata> {
        &self.metadata
    }

    pub fn cells(&self) -> &CellStore {
        &self.cells
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// The context for `data_source_ref`, built on first request and
    /// memoized per reference.
    pub fn context(&self, data_source_ref: &str) -> Result<Rc<DataSourceContext>, EngineError> {
        if let Some(existing) = self.contexts.borrow().get(data_source_ref) {
            return Ok(Rc::clone(existing));
        }
        let descriptor = self
            .metadata
            .data_source(data_source_ref)
            .cloned()
            .ok_or_else(|| EngineError::DataSourceNotFound(data_source_ref.to_string()))?;
        let on_fetch = match &descriptor.on_fetch {
            Some(path) => Some(self.lookup_handler(path)?),
            None => None,
        };
        let connector = (self.services.connectors)(&descriptor);
        let ctx = Rc::new(DataSourceContext {
            window_id: self.window_id.clone(),
            metadata: Rc::clone(&self.metadata),
            descriptor,
            cells: self.cells.clone(),
            connector,
            on_fetch,
        });
        ctx.ensure_cells();
        self.contexts
            .borrow_mut()
            .insert(data_source_ref.to_string(), Rc::clone(&ctx));
        Ok(ctx)
    }

    /// The context for the window's default source.
    pub fn default_context(&self) -> Result<Rc<DataSourceContext>, EngineError> {
        let default_ref = self
            .metadata
            .default_ref()
            .ok_or_else(|| EngineError::DataSourceNotFound("<default>".to_string()))?
            .to_string();
        self.context(&default_ref)
    }

    /// Dialog wrapper around the dialog's backing source context, cached
    /// per dialog id.
    pub fn dialog_context(&self, dialog_id: &str) -> Result<Rc<DialogContext>, EngineError> {
        if let Some(existing) = self.dialogs.borrow().get(dialog_id) {
            return Ok(Rc::clone(existing));
        }
        let descriptor = self
            .metadata
            .dialog(dialog_id)
            .cloned()
            .ok_or_else(|| EngineError::DialogNotFound(dialog_id.to_string()))?;
        let ctx = self.context(&descriptor.data_source_ref)?;
        let dialog = Rc::new(DialogContext {
            ctx,
            descriptor,
            window_id: self.window_id.clone(),
            cells: self.cells.clone(),
            windows: self.services.windows.clone(),
        });
        self.dialogs
            .borrow_mut()
            .insert(dialog_id.to_string(), Rc::clone(&dialog));
        Ok(dialog)
    }

    /// Resolve a dotted action path: window-local actions first, then the
    /// global registry. A miss reports the sibling keys that are
    /// available.
    pub fn lookup_handler(&self, path: &str) -> Result<HandlerFn, EngineError> {
        if let Some(local) = self.actions.borrow().get(path) {
            return Ok(Rc::clone(local));
        }
        if let Some(global) = self.services.registry.lookup(path) {
            return Ok(global);
        }
        let mut available: Vec<String> = self.actions.borrow().keys().cloned().collect();
        available.extend(self.services.registry.siblings(path));
        available.sort();
        available.dedup();
        Err(EngineError::HandlerNotFound {
            path: path.to_string(),
            available,
        })
    }
}

/// The runtime bundle of one (window, data source) pair.
pub struct DataSourceContext {
    pub window_id: String,
    pub metadata: Rc<WindowMetadata>,
    pub descriptor: DataSourceDescriptor,
    pub cells: CellStore,
    pub connector: Arc<dyn Connector>,
    pub on_fetch: Option<HandlerFn>,
}

impl DataSourceContext {
    pub fn source_id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn key(&self, kind: CellKind) -> CellKey {
        CellKey::source(kind, &self.window_id, &self.descriptor.id)
    }

    /// Seed the selection cell with the variant matching the declared
    /// selection mode. Idempotent: an already-seeded variant is kept.
    fn ensure_cells(&self) {
        let wanted = match (self.descriptor.is_tree(), self.descriptor.selection_mode) {
            (_, SelectionMode::None) => SelectionState::Unselectable,
            (false, SelectionMode::Single) => SelectionState::Single(None),
            (false, SelectionMode::Multi) => SelectionState::Multi(Vec::new()),
            (true, SelectionMode::Single) => SelectionState::Tree(None),
            (true, SelectionMode::Multi) => SelectionState::TreeMulti(Vec::new()),
        };
        let key = self.key(CellKind::Selection);
        if matches!(self.cells.peek(&key), CellValue::Selection(SelectionState::Unselectable))
            && wanted != SelectionState::Unselectable
        {
            self.cells.set(&key, CellValue::Selection(wanted));
        }
    }

    pub fn input(&self) -> InputState {
        self.cells.input(&self.key(CellKind::Input))
    }

    pub fn update_input(&self, f: impl FnOnce(&mut InputState)) {
        self.cells.update(&self.key(CellKind::Input), |v| {
            if let CellValue::Input(input) = v {
                f(input);
            }
        });
    }

    pub fn control(&self) -> ControlState {
        self.cells.control(&self.key(CellKind::Control))
    }

    pub fn update_control(&self, f: impl FnOnce(&mut ControlState)) {
        self.cells.update(&self.key(CellKind::Control), |v| {
            if let CellValue::Control(control) = v {
                f(control);
            }
        });
    }

    pub fn form(&self) -> Value {
        self.cells.form(&self.key(CellKind::Form))
    }

    pub fn set_form(&self, form: Value) {
        self.cells.set(&self.key(CellKind::Form), CellValue::Form(form));
        self.cells.update(&self.key(CellKind::FormStatus), |v| {
            if let CellValue::FormStatus(status) = v {
                status.dirty = false;
                status.version += 1;
            }
        });
    }

    /// Write one form field, marking the form dirty.
    pub fn set_form_value(&self, field: &str, value: Value) {
        self.cells.update(&self.key(CellKind::Form), |v| {
            if let CellValue::Form(form) = v {
                crate::path::assign(form, field, value);
            }
        });
        self.cells.update(&self.key(CellKind::FormStatus), |v| {
            if let CellValue::FormStatus(status) = v {
                status.dirty = true;
                status.version += 1;
            }
        });
    }

    pub fn selection(&self) -> SelectionState {
        self.cells.selection(&self.key(CellKind::Selection))
    }

    pub fn set_selection_state(&self, selection: SelectionState) {
        self.cells
            .set(&self.key(CellKind::Selection), CellValue::Selection(selection));
    }

    pub fn collection(&self) -> Vec<Value> {
        self.cells.collection(&self.key(CellKind::Collection))
    }

    pub fn set_collection(&self, records: Vec<Value>) {
        self.cells
            .set(&self.key(CellKind::Collection), CellValue::Collection(records));
    }

    pub fn collection_info(&self) -> CollectionInfo {
        self.cells
            .collection_info(&self.key(CellKind::CollectionInfo))
    }

    pub fn set_collection_info(&self, info: CollectionInfo) {
        self.cells.set(
            &self.key(CellKind::CollectionInfo),
            CellValue::CollectionInfo(info),
        );
    }

    pub fn metrics(&self) -> Value {
        self.cells.metrics(&self.key(CellKind::Metrics))
    }

    pub fn set_metrics(&self, metrics: Value) {
        self.cells
            .set(&self.key(CellKind::Metrics), CellValue::Metrics(metrics));
    }

    pub fn form_status(&self) -> FormStatus {
        self.cells.form_status(&self.key(CellKind::FormStatus))
    }
}

/// Dialog wrapper: the backing source context plus dialog-specific
/// handlers (`is_open`, `caller_args`, `close`, `commit`).
pub struct DialogContext {
    pub ctx: Rc<DataSourceContext>,
    pub descriptor: DialogDescriptor,
    window_id: String,
    cells: CellStore,
    windows: WindowManager,
}

impl DialogContext {
    fn dialog_key(&self) -> CellKey {
        CellKey::dialog(&self.window_id, &self.descriptor.id)
    }

    pub fn state(&self) -> DialogState {
        self.cells.dialog(&self.dialog_key())
    }

    pub fn is_open(&self) -> bool {
        self.state().open
    }

    /// The args the opener passed when the dialog was opened.
    pub fn caller_args(&self) -> Value {
        self.state().args
    }

    pub fn close(&self) {
        self.windows.close_dialog(&self.window_id, &self.descriptor.id);
    }

    /// Commit the dialog. With no explicit payload, the dialog's own
    /// current selection is handed back.
    pub fn commit(&self, payload: Option<Value>) {
        self.windows
            .commit_dialog(&self.window_id, &self.descriptor.id, payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn services() -> Services {
        Services::new(CellStore::new())
    }

    fn metadata() -> WindowMetadata {
        serde_json::from_value(json!({
            "namespace": "crm",
            "actions": ["save"],
            "dataSources": [
                {"id": "customers", "selectionMode": "single", "uniqueKey": [{"field": "id"}]},
                {"id": "orders", "selectionMode": "multi"}
            ],
            "dialogs": [{"id": "pick", "dataSourceRef": "orders"}]
        }))
        .expect("metadata parses")
    }

    fn window(services: &Services) -> WindowContext {
        let cells = services.windows.cells().clone();
        WindowContext::new("w1", metadata(), cells, services.clone())
    }

    #[test]
    fn test_init_fails_on_unregistered_action() {
        let services = services();
        let ctx = window(&services);
        let err = ctx.init().expect_err("save is not registered");
        assert!(matches!(err, EngineError::UnknownAction { namespace, name }
            if namespace == "crm" && name == "save"));
    }

    #[test]
    fn test_init_resolves_declared_actions() {
        let services = services();
        services.registry.register("crm.save", |_| Ok(Value::Null));
        let ctx = window(&services);
        ctx.init().expect("bootstrap succeeds");

        // Both the bare and the namespaced name resolve locally.
        assert!(ctx.lookup_handler("save").is_ok());
        assert!(ctx.lookup_handler("crm.save").is_ok());
    }

    #[test]
    fn test_lookup_miss_reports_siblings() {
        let services = services();
        services.registry.register("crm.save", |_| Ok(Value::Null));
        services.registry.register("crm.load", |_| Ok(Value::Null));
        let ctx = window(&services);

        let err = ctx.lookup_handler("crm.sava").err().expect("typo");
        match err {
            EngineError::HandlerNotFound { path, available } => {
                assert_eq!(path, "crm.sava");
                assert!(available.contains(&"crm.save".to_string()));
                assert!(available.contains(&"crm.load".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_context_is_memoized_per_ref() {
        let services = services();
        let ctx = window(&services);
        let a = ctx.context("customers").expect("declared source");
        let b = ctx.context("customers").expect("declared source");
        assert!(Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_context_unknown_ref() {
        let services = services();
        let ctx = window(&services);
        assert!(matches!(
            ctx.context("nope"),
            Err(EngineError::DataSourceNotFound(_))
        ));
    }

    #[test]
    fn test_selection_cell_seeded_by_mode() {
        let services = services();
        let ctx = window(&services);
        let customers = ctx.context("customers").expect("declared source");
        assert_eq!(customers.selection(), SelectionState::Single(None));

        let orders = ctx.context("orders").expect("declared source");
        assert_eq!(orders.selection(), SelectionState::Multi(Vec::new()));
    }

    #[test]
    fn test_form_value_marks_dirty() {
        let services = services();
        let ctx = window(&services);
        let customers = ctx.context("customers").expect("declared source");

        customers.set_form_value("name", json!("Ada"));
        assert_eq!(customers.form(), json!({"name": "Ada"}));
        let status = customers.form_status();
        assert!(status.dirty);
        assert_eq!(status.version, 1);

        // A whole-form replace resets dirty.
        customers.set_form(json!({"name": "Grace"}));
        let status = customers.form_status();
        assert!(!status.dirty);
        assert_eq!(status.version, 2);
    }

    #[test]
    fn test_dialog_context_cached() {
        let services = services();
        let ctx = window(&services);
        let a = ctx.dialog_context("pick").expect("declared dialog");
        let b = ctx.dialog_context("pick").expect("declared dialog");
        assert!(Rc::ptr_eq(&a, &b));
        assert!(!a.is_open());
    }
}

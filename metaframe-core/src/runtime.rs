//! Engine runtime
//!
//! [`Engine`] owns the cell store, the window manager and the per-window
//! contexts, and drives the cooperative fetch loop. The engine itself is
//! single-threaded; only connector I/O leaves the thread.
//!
//! Fetch flow, two-phase:
//! 1. Something raises a source's `input.fetch`/`input.refresh`. A
//!    per-source effect enqueues a [`FetchJob`].
//! 2. [`Engine::pump`] turns each job into a [`FetchPlan`]; plans that hit
//!    the connector are spawned as tokio tasks which report a
//!    [`FetchOutcome`] back over an unbounded channel.
//! 3. [`Engine::run_until_idle`] awaits outcomes, applies them through the
//!    controller (discarding superseded generations), re-pumps whatever
//!    that propagated, and drains the deferred-execution message queues,
//!    until no work is left anywhere.
//!
//! # Example
//!
//! ```ignore
//! let mut engine = Engine::new();
//! engine.registry().register("crm.save", |call| { /* ... */ Ok(Value::Null) });
//! let window_id = engine.open_window(metadata, WindowSpec {
//!     key: "customers".into(),
//!     ..WindowSpec::default()
//! })?;
//! engine.controller(&window_id, "customers")?.fetch_collection(None);
//! engine.run_until_idle().await;
//! ```

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cell::{CellKey, CellKind, CellStore, CellValue};
use crate::connector::{ConnectorError, FetchQuery};
use crate::context::{ConnectorFactory, DataSourceContext, HandlerRegistry, Services, WindowContext};
use crate::controller::{DataSourceController, FetchPlan, RefreshTarget};
use crate::descriptor::{HandoffParameter, ParamScope, WindowMetadata};
use crate::error::EngineError;
use crate::execution;
use crate::window::{OpenOptions, PendingResult, WindowManager, WindowSpec};

/// A source whose input flags were raised and that the engine still has
/// to look at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchJob {
    pub window_id: String,
    pub source_id: String,
}

enum FetchKind {
    Full,
    Refresh(RefreshTarget),
}

struct FetchOutcome {
    window_id: String,
    source_id: String,
    generation: u64,
    kind: FetchKind,
    result: Result<Value, ConnectorError>,
}

/// Resolves a window key to its metadata blob; consulted once, lazily,
/// when a window is first opened by key.
pub type MetadataProvider = Rc<dyn Fn(&str) -> Option<WindowMetadata>>;

/// The data-source orchestration engine.
pub struct Engine {
    cells: CellStore,
    services: Services,
    contexts: HashMap<String, Rc<WindowContext>>,
    jobs: Rc<RefCell<VecDeque<FetchJob>>>,
    outcome_tx: mpsc::UnboundedSender<FetchOutcome>,
    outcome_rx: mpsc::UnboundedReceiver<FetchOutcome>,
    generations: HashMap<(String, String), u64>,
    in_flight: usize,
    metadata_provider: Option<MetadataProvider>,
}

impl Engine {
    pub fn new() -> Self {
        let cells = CellStore::new();
        let services = Services::new(cells.clone());
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        Self {
            cells,
            services,
            contexts: HashMap::new(),
            jobs: Rc::new(RefCell::new(VecDeque::new())),
            outcome_tx,
            outcome_rx,
            generations: HashMap::new(),
            in_flight: 0,
            metadata_provider: None,
        }
    }

    pub fn registry(&self) -> HandlerRegistry {
        self.services.registry.clone()
    }

    pub fn windows(&self) -> &WindowManager {
        &self.services.windows
    }

    pub fn cells(&self) -> &CellStore {
        &self.cells
    }

    pub fn set_connector_factory(&mut self, connectors: ConnectorFactory) {
        self.services.connectors = connectors;
    }

    pub fn set_metadata_provider(&mut self, provider: MetadataProvider) {
        self.metadata_provider = Some(provider);
    }

    /// Open (or restore) a window from an explicit metadata blob.
    pub fn open_window(
        &mut self,
        metadata: WindowMetadata,
        spec: WindowSpec,
    ) -> Result<String, EngineError> {
        let window_id = self.services.windows.add_window(spec);
        if self.contexts.contains_key(&window_id) {
            return Ok(window_id);
        }
        let window = Rc::new(WindowContext::new(
            window_id.as_str(),
            metadata,
            self.cells.clone(),
            self.services.clone(),
        ));
        window.init()?;
        self.seed_parameters(&window)?;
        self.wire_sources(&window)?;
        self.contexts.insert(window_id.clone(), window);
        Ok(window_id)
    }

    /// Open a window by key, fetching its metadata through the configured
    /// provider.
    pub fn open_window_by_key(&mut self, spec: WindowSpec) -> Result<String, EngineError> {
        let provider = self
            .metadata_provider
            .clone()
            .ok_or_else(|| EngineError::MetadataUnavailable(spec.key.clone()))?;
        let metadata = provider(&spec.key)
            .ok_or_else(|| EngineError::MetadataUnavailable(spec.key.clone()))?;
        self.open_window(metadata, spec)
    }

    /// Open a window whose commit is awaited by `caller_window`.
    pub fn open_window_awaited(
        &mut self,
        metadata: WindowMetadata,
        spec: WindowSpec,
        caller_window: &str,
        parameters: Vec<HandoffParameter>,
    ) -> Result<(String, PendingResult), EngineError> {
        let window_id = self.open_window(metadata, spec)?;
        let fallback = self
            .window_context(&window_id)?
            .default_context()
            .ok()
            .map(|ctx| ctx.key(CellKind::Selection));
        let pending = self.services.windows.await_window_result(
            &window_id,
            caller_window,
            parameters,
            fallback,
        );
        Ok((window_id, pending))
    }

    pub fn close_window(&mut self, window_id: &str) {
        self.contexts.remove(window_id);
        self.generations.retain(|(w, _), _| w != window_id);
        self.jobs.borrow_mut().retain(|j| j.window_id != window_id);
        self.services.windows.remove_window(window_id);
    }

    /// Resolve an awaited window with `payload` and close it.
    pub fn commit_window(&mut self, window_id: &str, payload: Option<Value>) {
        self.contexts.remove(window_id);
        self.generations.retain(|(w, _), _| w != window_id);
        self.services.windows.commit_window(window_id, payload);
    }

    pub fn window_context(&self, window_id: &str) -> Result<Rc<WindowContext>, EngineError> {
        self.contexts
            .get(window_id)
            .cloned()
            .ok_or_else(|| EngineError::WindowNotFound(window_id.to_string()))
    }

    pub fn controller(
        &self,
        window_id: &str,
        data_source_ref: &str,
    ) -> Result<DataSourceController, EngineError> {
        let ctx = self.window_context(window_id)?.context(data_source_ref)?;
        Ok(DataSourceController::new(ctx))
    }

    /// Open a dialog; the pending result is returned when `await_result`
    /// is set. Commit falls back to the dialog's backing selection.
    pub fn open_dialog(
        &self,
        window_id: &str,
        dialog_id: &str,
        args: Value,
        options: OpenOptions,
    ) -> Result<Option<PendingResult>, EngineError> {
        let window = self.window_context(window_id)?;
        let dialog = window.dialog_context(dialog_id)?;
        let fallback = Some(dialog.ctx.key(CellKind::Selection));
        Ok(self.services.windows.open_dialog(
            window_id,
            dialog_id,
            args,
            Value::Null,
            fallback,
            options,
        ))
    }

    /// Run every execution bound to `event`, in declaration order. An
    /// uncaught chain error stops the remaining executions and
    /// propagates.
    pub fn trigger_event(
        &self,
        window_id: &str,
        event: &str,
        args: &Value,
    ) -> Result<Option<Value>, EngineError> {
        let window = self.window_context(window_id)?;
        let mut last = None;
        for execution in execution::executions_for(&window, event) {
            last = execution.execute(args)?;
        }
        Ok(last)
    }

    /// Drive fetches, outcomes and deferred executions until no work is
    /// left anywhere.
    pub async fn run_until_idle(&mut self) {
        loop {
            loop {
                self.pump();
                if self.drain_messages() == 0 && self.jobs.borrow().is_empty() {
                    break;
                }
            }
            if self.in_flight == 0 {
                break;
            }
            if let Some(outcome) = self.outcome_rx.recv().await {
                self.apply_outcome(outcome);
                while let Ok(outcome) = self.outcome_rx.try_recv() {
                    self.apply_outcome(outcome);
                }
            }
        }
    }

    /// Turn queued fetch jobs into plans; spawn connector calls, run
    /// mirror syncs inline.
    pub fn pump(&mut self) {
        loop {
            let job = self.jobs.borrow_mut().pop_front();
            let Some(job) = job else {
                break;
            };
            let Some(window) = self.contexts.get(&job.window_id) else {
                continue;
            };
            let Ok(ctx) = window.context(&job.source_id) else {
                continue;
            };
            let controller = DataSourceController::new(Rc::clone(&ctx));
            match controller.plan_fetch() {
                FetchPlan::Idle | FetchPlan::Inactive => {}
                FetchPlan::Mirror => controller.sync_mirror(),
                FetchPlan::Full { query } => self.spawn_fetch(&ctx, FetchKind::Full, query),
                FetchPlan::Refresh { query, target } => {
                    self.spawn_fetch(&ctx, FetchKind::Refresh(target), query)
                }
            }
        }
    }

    fn spawn_fetch(&mut self, ctx: &Rc<DataSourceContext>, kind: FetchKind, query: FetchQuery) {
        let key = (ctx.window_id.clone(), ctx.descriptor.id.clone());
        let generation = {
            let slot = self.generations.entry(key).or_insert(0);
            *slot += 1;
            *slot
        };
        debug!(
            window = %ctx.window_id,
            source = %ctx.descriptor.id,
            generation,
            "fetch spawned"
        );
        let connector = Arc::clone(&ctx.connector);
        let tx = self.outcome_tx.clone();
        let window_id = ctx.window_id.clone();
        let source_id = ctx.descriptor.id.clone();
        self.in_flight += 1;
        tokio::spawn(async move {
            let result = connector.get(&query).await;
            // Receiver gone means the engine is shutting down.
            let _ = tx.send(FetchOutcome {
                window_id,
                source_id,
                generation,
                kind,
                result,
            });
        });
    }

    fn apply_outcome(&mut self, outcome: FetchOutcome) {
        self.in_flight = self.in_flight.saturating_sub(1);
        let key = (outcome.window_id.clone(), outcome.source_id.clone());
        if self.generations.get(&key).copied() != Some(outcome.generation) {
            debug!(
                window = %outcome.window_id,
                source = %outcome.source_id,
                generation = outcome.generation,
                "discarding superseded fetch result"
            );
            return;
        }
        let Some(window) = self.contexts.get(&outcome.window_id) else {
            return;
        };
        let Ok(ctx) = window.context(&outcome.source_id) else {
            return;
        };
        let controller = DataSourceController::new(ctx);
        match (outcome.kind, outcome.result) {
            (FetchKind::Full, Ok(payload)) => controller.apply_full(payload),
            (FetchKind::Refresh(target), Ok(payload)) => controller.apply_refresh(&target, payload),
            (_, Err(e)) => controller.apply_failure(e.to_string()),
        }
    }

    /// Drain every window's deferred-execution queue. Returns how many
    /// executions ran.
    fn drain_messages(&mut self) -> usize {
        let mut drained = 0;
        let windows: Vec<Rc<WindowContext>> = self.contexts.values().cloned().collect();
        for window in windows {
            let key = CellKey::window(CellKind::Message, window.window_id());
            let queue = self.cells.messages(&key);
            if queue.is_empty() {
                continue;
            }
            // Cleared before running so handlers can re-defer.
            self.cells.set(&key, CellValue::Message(Vec::new()));
            for message in queue {
                drained += 1;
                let execution = execution::from_queued(&window, &message);
                if let Err(e) = execution.run_now(&message.args) {
                    warn!(
                        window = %window.window_id(),
                        handler = %message.binding.handler,
                        error = %e,
                        "deferred execution failed"
                    );
                }
            }
        }
        drained
    }

    fn seed_parameters(&self, window: &Rc<WindowContext>) -> Result<(), EngineError> {
        let window_params = self
            .services
            .windows
            .window(window.window_id())
            .map(|w| w.parameters)
            .unwrap_or(Value::Null);
        for descriptor in &window.metadata().data_sources {
            let input_key = CellKey::source(CellKind::Input, window.window_id(), &descriptor.id);
            let filter_set = Value::Object(descriptor.filter_set.clone());
            let seeds: Vec<(String, Value)> = descriptor
                .parameters
                .iter()
                .filter_map(|decl| {
                    let value = match decl.scope {
                        ParamScope::Metadata => {
                            crate::path::resolve_cloned(&window_params, &decl.location)
                        }
                        ParamScope::FilterSet => {
                            crate::path::resolve_cloned(&filter_set, &decl.location)
                        }
                        _ => None,
                    }?;
                    Some((decl.name.clone(), value))
                })
                .collect();
            if seeds.is_empty() {
                continue;
            }
            self.cells.update(&input_key, |v| {
                if let CellValue::Input(input) = v {
                    for (name, value) in &seeds {
                        input.parameters.insert(name.clone(), value.clone());
                    }
                }
            });
        }
        Ok(())
    }

    /// Create each source's context and its reactive wiring: the input
    /// effect that turns raised flags into fetch jobs, and the mirror
    /// effect that keeps mirror sources in sync with their upstream
    /// selection.
    fn wire_sources(&self, window: &Rc<WindowContext>) -> Result<(), EngineError> {
        let window_id = window.window_id().to_string();
        for descriptor in &window.metadata().data_sources {
            let ctx = window.context(&descriptor.id)?;
            let input_key = ctx.key(CellKind::Input);
            let jobs = Rc::clone(&self.jobs);
            let job = FetchJob {
                window_id: window_id.clone(),
                source_id: descriptor.id.clone(),
            };
            self.cells.effect(Some(window_id.as_str()), move |store| {
                if let CellValue::Input(input) = store.get(&input_key) {
                    if input.fetch || input.refresh {
                        jobs.borrow_mut().push_back(job.clone());
                    }
                }
            });

            if descriptor.is_mirror() {
                let mirror_ctx = Rc::clone(&ctx);
                self.cells.effect(Some(window_id.as_str()), move |_| {
                    DataSourceController::new(Rc::clone(&mirror_ctx)).sync_mirror();
                });
            } else {
                // Initial load: every source attempts one fetch at window
                // open; sources with unresolved dependencies come out of
                // it marked inactive instead of fetching.
                ctx.update_input(|input| input.fetch = true);
            }
        }
        Ok(())
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

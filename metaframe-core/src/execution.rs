//! Event execution chains
//!
//! A declared event binding compiles into an [`Execution`]: an ordered
//! `init → handler → onSuccess/onError → onDone` chain running against
//! one data-source context. Multiple executions can be bound to a single
//! event name; they run in declaration order and each receives the same
//! arguments.
//!
//! Chain rules:
//! - `init` returning a falsy value aborts the chain; `handler` and
//!   `onSuccess` never run, but `onDone` still runs with no result.
//! - an error from `init` or `handler` is routed to `onError` when one is
//!   declared, else it propagates to the caller, after `onDone` ran.
//! - `onDone` always runs exactly once, success or failure, and receives
//!   `{result, error}`.
//!
//! Deferred executions (`async` in metadata) do not run synchronously at
//! all: they are appended to the window's message queue and drained by the
//! engine on its next pump.

use std::rc::Rc;

use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::cell::{CellKey, CellKind, CellValue, QueuedMessage};
use crate::context::{HandlerCall, HandlerFn, WindowContext};
use crate::descriptor::{EventBinding, ParamScope};
use crate::error::EngineError;
use crate::path;

/// One configured handler-chain instance.
pub struct Execution {
    pub binding: EventBinding,
    pub data_source_ref: String,
    window: Rc<WindowContext>,
}

/// The executions bound to `event`, in declaration order.
pub fn executions_for(window: &Rc<WindowContext>, event: &str) -> Vec<Execution> {
    let Some(default_ref) = window.metadata().default_ref().map(str::to_string) else {
        return Vec::new();
    };
    window
        .metadata()
        .events
        .get(event)
        .map(|bindings| {
            bindings
                .iter()
                .map(|binding| Execution {
                    data_source_ref: binding
                        .data_source_ref
                        .clone()
                        .unwrap_or_else(|| default_ref.clone()),
                    binding: binding.clone(),
                    window: Rc::clone(window),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Rebuild a parked execution from its queued message.
pub fn from_queued(window: &Rc<WindowContext>, message: &QueuedMessage) -> Execution {
    Execution {
        binding: message.binding.clone(),
        data_source_ref: message.data_source_ref.clone(),
        window: Rc::clone(window),
    }
}

impl Execution {
    /// Run the chain, or park it in the window message queue when the
    /// binding is deferred.
    pub fn execute(&self, args: &Value) -> Result<Option<Value>, EngineError> {
        if self.binding.deferred {
            let key = CellKey::window(CellKind::Message, self.window.window_id());
            let queued = QueuedMessage {
                binding: self.binding.clone(),
                data_source_ref: self.data_source_ref.clone(),
                args: self.merged_args(args),
            };
            debug!(
                window = %self.window.window_id(),
                handler = %self.binding.handler,
                "execution deferred to message queue"
            );
            self.window.cells().update(&key, |v| {
                if let CellValue::Message(queue) = v {
                    queue.push(queued.clone());
                }
            });
            return Ok(None);
        }
        self.run_now(args)
    }

    /// Run the chain synchronously regardless of the deferred flag. The
    /// engine uses this to drain the message queue.
    pub fn run_now(&self, args: &Value) -> Result<Option<Value>, EngineError> {
        let ctx = self.window.context(&self.data_source_ref)?;

        // Lookup failures are fatal to the operation, not chain errors:
        // resolve every declared path up front.
        let init = self.resolve(&self.binding.init)?;
        let handler = self.window.lookup_handler(&self.binding.handler)?;
        let on_success = self.resolve(&self.binding.on_success)?;
        let on_error = self.resolve(&self.binding.on_error)?;
        let on_done = self.resolve(&self.binding.on_done)?;

        let args = self.merged_args(args);
        let parameters = self.resolve_parameters(&ctx);
        let invoke = |handler: &HandlerFn, args: &Value| {
            handler(&HandlerCall {
                ctx: &ctx,
                args,
                parameters: &parameters,
            })
        };

        let mut result: Option<Value> = None;
        let mut error: Option<EngineError> = None;

        let proceed = match &init {
            Some(init) => match invoke(init, &args) {
                Ok(value) => truthy(&value),
                Err(e) => {
                    error = Some(e);
                    false
                }
            },
            None => true,
        };

        if proceed && error.is_none() {
            match invoke(&handler, &args) {
                Ok(value) => {
                    if let Some(on_success) = &on_success {
                        // Chained: the handler result feeds onSuccess.
                        match invoke(on_success, &value) {
                            Ok(chained) => result = Some(chained),
                            Err(e) => error = Some(e),
                        }
                    } else {
                        result = Some(value);
                    }
                }
                Err(e) => error = Some(e),
            }
        }

        if error.is_some() {
            if let Some(on_error) = &on_error {
                let message = error
                    .take()
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                if let Err(e) = invoke(on_error, &Value::String(message)) {
                    warn!(handler = %self.binding.handler, error = %e, "onError itself failed");
                }
            }
        }

        if let Some(on_done) = &on_done {
            let summary = json!({
                "result": result.clone().unwrap_or(Value::Null),
                "error": error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
            });
            if let Err(e) = invoke(on_done, &summary) {
                warn!(handler = %self.binding.handler, error = %e, "onDone failed");
            }
        }

        match error {
            Some(e) => Err(e),
            None => Ok(result),
        }
    }

    fn resolve(&self, declared: &Option<String>) -> Result<Option<HandlerFn>, EngineError> {
        declared
            .as_deref()
            .map(|p| self.window.lookup_handler(p))
            .transpose()
    }

    /// Declared args merged under runtime args; runtime fields win.
    fn merged_args(&self, runtime: &Value) -> Value {
        match (&self.binding.args, runtime) {
            (Value::Object(declared), Value::Object(given)) => {
                let mut merged = declared.clone();
                merged.extend(given.clone());
                Value::Object(merged)
            }
            (declared, Value::Null) => declared.clone(),
            (_, given) => given.clone(),
        }
    }

    /// Resolve the binding's declared parameters through their scopes.
    /// One resolver per scope variant; unresolvable entries are skipped.
    fn resolve_parameters(&self, ctx: &crate::context::DataSourceContext) -> Map<String, Value> {
        let mut resolved = Map::new();
        for decl in &self.binding.parameters {
            let value = match decl.scope {
                ParamScope::DataSource => {
                    let (head, rest) = path::split_location(&decl.location);
                    let key = CellKey::source(CellKind::Selection, ctx.window_id.as_str(), head);
                    let selection = self.window.cells().selection(&key);
                    selection
                        .selected()
                        .and_then(|record| path::resolve_cloned(record, rest))
                }
                ParamScope::Form => path::resolve_cloned(&ctx.form(), &decl.location),
                ParamScope::Selection => ctx
                    .selection()
                    .selected()
                    .and_then(|record| path::resolve_cloned(record, &decl.location)),
                ParamScope::FilterSet => path::resolve_cloned(
                    &Value::Object(ctx.descriptor.filter_set.clone()),
                    &decl.location,
                ),
                ParamScope::Metadata => self
                    .window
                    .services()
                    .windows
                    .window(self.window.window_id())
                    .and_then(|w| path::resolve_cloned(&w.parameters, &decl.location)),
                ParamScope::TableSetting => None,
            };
            if let Some(value) = value {
                resolved.insert(decl.name.clone(), value);
            }
        }
        resolved
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => false,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellStore;
    use crate::context::Services;
    use crate::descriptor::WindowMetadata;
    use std::cell::RefCell;

    fn window_with(metadata: Value, setup: impl FnOnce(&Services)) -> Rc<WindowContext> {
        let metadata: WindowMetadata = serde_json::from_value(metadata).expect("metadata parses");
        let services = Services::new(CellStore::new());
        setup(&services);
        let cells = services.windows.cells().clone();
        let window = Rc::new(WindowContext::new("w1", metadata, cells, services));
        window.init().expect("bootstrap");
        window
    }

    fn trace() -> Rc<RefCell<Vec<String>>> {
        Rc::new(RefCell::new(Vec::new()))
    }

    fn record(trace: &Rc<RefCell<Vec<String>>>, label: &str) -> impl Fn(&HandlerCall<'_>) -> Result<Value, EngineError> {
        let trace = Rc::clone(trace);
        let label = label.to_string();
        move |call| {
            trace
                .borrow_mut()
                .push(format!("{label}:{}", call.args));
            Ok(json!(format!("{label}-result")))
        }
    }

    fn base_metadata(binding: Value) -> Value {
        json!({
            "dataSources": [{"id": "main", "selectionMode": "single", "uniqueKey": [{"field": "id"}]}],
            "events": {"onGo": [binding]}
        })
    }

    #[test]
    fn test_full_chain_order() {
        let seen = trace();
        let window = window_with(
            base_metadata(json!({
                "init": "t.init", "handler": "t.handler",
                "onSuccess": "t.success", "onDone": "t.done"
            })),
            |services| {
                services.registry.register("t.init", {
                    let seen = Rc::clone(&seen);
                    move |_| {
                        seen.borrow_mut().push("init".into());
                        Ok(json!(true))
                    }
                });
                services.registry.register("t.handler", record(&seen, "handler"));
                services.registry.register("t.success", record(&seen, "success"));
                services.registry.register("t.done", record(&seen, "done"));
            },
        );

        let executions = executions_for(&window, "onGo");
        assert_eq!(executions.len(), 1);
        let result = executions[0].execute(&json!({"n": 1})).expect("chain runs");
        assert_eq!(result, Some(json!("success-result")));

        let seen = seen.borrow();
        assert_eq!(seen[0], "init");
        assert!(seen[1].starts_with("handler:"));
        // onSuccess is chained off the handler result.
        assert_eq!(seen[2], "success:\"handler-result\"");
        assert!(seen[3].starts_with("done:"));
    }

    #[test]
    fn test_falsy_init_skips_handler_but_runs_done_once() {
        let seen = trace();
        let window = window_with(
            base_metadata(json!({
                "init": "t.init", "handler": "t.handler",
                "onSuccess": "t.success", "onDone": "t.done"
            })),
            |services| {
                services.registry.register("t.init", |_| Ok(json!(false)));
                services.registry.register("t.handler", record(&seen, "handler"));
                services.registry.register("t.success", record(&seen, "success"));
                services.registry.register("t.done", record(&seen, "done"));
            },
        );

        let result = executions_for(&window, "onGo")[0]
            .execute(&Value::Null)
            .expect("aborted chain is not an error");
        assert_eq!(result, None);

        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], "done:{\"error\":\"\",\"result\":null}");
    }

    #[test]
    fn test_handler_error_recovered_by_on_error() {
        let seen = trace();
        let window = window_with(
            base_metadata(json!({
                "handler": "t.boom", "onError": "t.rescue", "onDone": "t.done"
            })),
            |services| {
                services
                    .registry
                    .register("t.boom", |_| Err(EngineError::handler("t.boom", "nope")));
                services.registry.register("t.rescue", record(&seen, "rescue"));
                services.registry.register("t.done", record(&seen, "done"));
            },
        );

        let result = executions_for(&window, "onGo")[0]
            .execute(&Value::Null)
            .expect("onError recovers the chain");
        assert_eq!(result, None);

        let seen = seen.borrow();
        assert!(seen[0].starts_with("rescue:"));
        assert!(seen[0].contains("nope"));
        assert!(seen[1].starts_with("done:"));
    }

    #[test]
    fn test_uncaught_error_propagates_after_done() {
        let seen = trace();
        let window = window_with(
            base_metadata(json!({"handler": "t.boom", "onDone": "t.done"})),
            |services| {
                services
                    .registry
                    .register("t.boom", |_| Err(EngineError::handler("t.boom", "nope")));
                services.registry.register("t.done", record(&seen, "done"));
            },
        );

        let err = executions_for(&window, "onGo")[0]
            .execute(&Value::Null)
            .expect_err("no onError declared");
        assert!(err.to_string().contains("nope"));
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn test_unknown_handler_path_is_fatal() {
        let window = window_with(
            base_metadata(json!({"handler": "t.missing"})),
            |_| {},
        );
        let err = executions_for(&window, "onGo")[0]
            .execute(&Value::Null)
            .expect_err("unresolved path");
        assert!(matches!(err, EngineError::HandlerNotFound { .. }));
    }

    #[test]
    fn test_deferred_execution_parks_in_message_queue() {
        let seen = trace();
        let window = window_with(
            base_metadata(json!({"handler": "t.handler", "async": true, "args": {"base": 1}})),
            |services| {
                services.registry.register("t.handler", record(&seen, "handler"));
            },
        );

        let result = executions_for(&window, "onGo")[0]
            .execute(&json!({"extra": 2}))
            .expect("deferral is not an error");
        assert_eq!(result, None);
        assert!(seen.borrow().is_empty());

        let key = CellKey::window(CellKind::Message, "w1");
        let queue = window.cells().messages(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].args, json!({"base": 1, "extra": 2}));

        // Draining runs the same chain out of band.
        let execution = from_queued(&window, &queue[0]);
        execution.run_now(&queue[0].args).expect("drained chain runs");
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn test_multiple_executions_run_in_declaration_order() {
        let seen = trace();
        let window = window_with(
            json!({
                "dataSources": [{"id": "main"}],
                "events": {"onGo": [
                    {"handler": "t.first"},
                    {"handler": "t.second"}
                ]}
            }),
            |services| {
                services.registry.register("t.first", record(&seen, "first"));
                services.registry.register("t.second", record(&seen, "second"));
            },
        );

        for execution in executions_for(&window, "onGo") {
            execution.execute(&json!({"n": 7})).expect("runs");
        }
        let seen = seen.borrow();
        assert!(seen[0].starts_with("first:"));
        assert!(seen[1].starts_with("second:"));
        // Later executions receive the same arguments as earlier ones.
        assert_eq!(seen[0].split(':').nth(1), seen[1].split(':').nth(1));
    }

    #[test]
    fn test_scoped_parameter_resolution() {
        let captured = Rc::new(RefCell::new(Map::new()));
        let window = window_with(
            json!({
                "dataSources": [
                    {"id": "main", "selectionMode": "single", "uniqueKey": [{"field": "id"}],
                     "filterSet": {"status": "open"}},
                    {"id": "side", "selectionMode": "single", "uniqueKey": [{"field": "id"}]}
                ],
                "events": {"onGo": [{
                    "handler": "t.capture",
                    "parameters": [
                        {"name": "fromForm", "location": "name", "in": "form"},
                        {"name": "fromSelection", "location": "id", "in": "selection"},
                        {"name": "fromFilterSet", "location": "status", "in": "filterSet"},
                        {"name": "fromSibling", "location": "side.id", "in": "dataSource"},
                        {"name": "missing", "location": "nope", "in": "form"}
                    ]
                }]}
            }),
            |services| {
                let captured = Rc::clone(&captured);
                services.registry.register("t.capture", move |call| {
                    *captured.borrow_mut() = call.parameters.clone();
                    Ok(Value::Null)
                });
            },
        );

        let main = window.context("main").expect("declared");
        main.set_collection(vec![json!({"id": 5, "name": "Ada"})]);
        crate::controller::DataSourceController::new(Rc::clone(&main)).set_selection(Some(0));

        let side = window.context("side").expect("declared");
        side.set_collection(vec![json!({"id": 42})]);
        crate::controller::DataSourceController::new(side).set_selection(Some(0));

        executions_for(&window, "onGo")[0]
            .execute(&Value::Null)
            .expect("runs");

        let captured = captured.borrow();
        assert_eq!(captured.get("fromForm"), Some(&json!("Ada")));
        assert_eq!(captured.get("fromSelection"), Some(&json!(5)));
        assert_eq!(captured.get("fromFilterSet"), Some(&json!("open")));
        assert_eq!(captured.get("fromSibling"), Some(&json!(42)));
        assert!(!captured.contains_key("missing"));
    }
}

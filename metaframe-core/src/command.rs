//! Remote command surface
//!
//! A stable, introspectable dispatch table over the engine: every command
//! is implemented purely in terms of the cell-store, controller and
//! lifecycle APIs, so an external JSON-RPC bridge can drive the engine
//! without reaching into it. [`specs`] enumerates the surface
//! (name → params) for discovery.

use serde_json::{Value, json};

use crate::error::EngineError;
use crate::runtime::Engine;

/// Description of one bridge command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: &'static str,
    pub summary: &'static str,
    pub params: &'static [&'static str],
}

const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "ui.window.open",
        summary: "Open (or restore) a window by metadata key",
        params: &["key", "title", "inTab", "parameters"],
    },
    CommandSpec {
        name: "ui.window.close",
        summary: "Close a window and purge its state",
        params: &["windowId"],
    },
    CommandSpec {
        name: "ui.window.list",
        summary: "List open windows",
        params: &[],
    },
    CommandSpec {
        name: "ui.control.setValue",
        summary: "Write one form field of a data source",
        params: &["windowId", "dataSourceRef", "field", "value"],
    },
    CommandSpec {
        name: "ui.table.selectRow",
        summary: "Select a row by index, or clear with null",
        params: &["windowId", "dataSourceRef", "rowIndex"],
    },
    CommandSpec {
        name: "ui.filter.set",
        summary: "Merge into a source's filter and refetch",
        params: &["windowId", "dataSourceRef", "filter"],
    },
    CommandSpec {
        name: "ui.dialog.commit",
        summary: "Commit a dialog, resolving its awaited result",
        params: &["windowId", "dialogId", "payload"],
    },
];

/// The full command surface, for discovery/introspection.
pub fn specs() -> &'static [CommandSpec] {
    COMMANDS
}

/// Dispatch one bridge command against the engine.
pub fn dispatch(engine: &mut Engine, name: &str, params: &Value) -> Result<Value, EngineError> {
    match name {
        "ui.window.open" => {
            let key = require_str(params, "key", name)?;
            let window_id = engine.open_window_by_key(crate::window::WindowSpec {
                key: key.to_string(),
                title: params
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or(key)
                    .to_string(),
                in_tab: params
                    .get("inTab")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                parameters: params.get("parameters").cloned().unwrap_or(Value::Null),
                ..crate::window::WindowSpec::default()
            })?;
            Ok(json!({ "windowId": window_id }))
        }
        "ui.window.close" => {
            let window_id = require_str(params, "windowId", name)?.to_string();
            engine.window_context(&window_id)?;
            engine.close_window(&window_id);
            Ok(json!({ "closed": true }))
        }
        "ui.window.list" => {
            let windows = engine.windows().list();
            serde_json::to_value(windows)
                .map_err(|e| EngineError::invalid_params(name, e.to_string()))
        }
        "ui.control.setValue" => {
            let ctx = source_context(engine, params, name)?;
            let field = require_str(params, "field", name)?;
            let value = params.get("value").cloned().unwrap_or(Value::Null);
            ctx.set_form_value(field, value);
            Ok(json!({ "form": ctx.form() }))
        }
        "ui.table.selectRow" => {
            let window_id = require_str(params, "windowId", name)?;
            let source_ref = require_str(params, "dataSourceRef", name)?;
            let controller = engine.controller(window_id, source_ref)?;
            let row_index = match params.get("rowIndex") {
                None | Some(Value::Null) => None,
                Some(value) => Some(value.as_u64().ok_or_else(|| {
                    EngineError::invalid_params(name, "rowIndex must be a non-negative integer")
                })? as usize),
            };
            controller.set_selection(row_index);
            Ok(json!({ "selected": controller.selected_record() }))
        }
        "ui.filter.set" => {
            let window_id = require_str(params, "windowId", name)?;
            let source_ref = require_str(params, "dataSourceRef", name)?;
            let filter = match params.get("filter") {
                Some(Value::Object(map)) => map.clone(),
                _ => {
                    return Err(EngineError::invalid_params(name, "missing object `filter`"));
                }
            };
            engine.controller(window_id, source_ref)?.set_filter(filter);
            Ok(json!({ "fetching": true }))
        }
        "ui.dialog.commit" => {
            let window_id = require_str(params, "windowId", name)?;
            let dialog_id = require_str(params, "dialogId", name)?;
            engine.window_context(window_id)?;
            engine
                .windows()
                .commit_dialog(window_id, dialog_id, params.get("payload").cloned());
            Ok(json!({ "committed": true }))
        }
        other => Err(EngineError::UnknownCommand(other.to_string())),
    }
}

fn require_str<'a>(params: &'a Value, key: &str, command: &str) -> Result<&'a str, EngineError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::invalid_params(command, format!("missing string `{key}`")))
}

fn source_context(
    engine: &Engine,
    params: &Value,
    command: &str,
) -> Result<std::rc::Rc<crate::context::DataSourceContext>, EngineError> {
    let window_id = require_str(params, "windowId", command)?;
    let source_ref = require_str(params, "dataSourceRef", command)?;
    engine.window_context(window_id)?.context(source_ref)
}

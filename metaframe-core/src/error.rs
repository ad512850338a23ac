//! Engine error taxonomy
//!
//! Errors fall into two classes with different propagation rules:
//!
//! - **Fatal to the triggering operation**: handler lookup failures, action
//!   registration gaps, malformed command params. These propagate to the
//!   caller as [`EngineError`].
//! - **Recovered locally**: connector failures inside a fetch are stored in
//!   the source's `control.error` cell and never thrown past the controller
//!   boundary. An unresolved dependency is modeled as state (`inactive`),
//!   not as an error at all.

use thiserror::Error;

/// Errors surfaced by the engine to callers.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A dotted action path could not be resolved. The message enumerates
    /// the sibling keys that *are* registered under the nearest prefix so
    /// that a typo in metadata is diagnosable from the error alone.
    #[error("handler not found: {path:?} (available: {available:?})")]
    HandlerNotFound {
        path: String,
        available: Vec<String>,
    },

    /// A window's metadata declared an action that was never registered
    /// under its namespace. Raised during window bootstrap.
    #[error("action {name:?} is not registered under namespace {namespace:?}")]
    UnknownAction { namespace: String, name: String },

    #[error("window not found: {0:?}")]
    WindowNotFound(String),

    /// The metadata provider knows no blob for the requested window key.
    #[error("no metadata available for window key {0:?}")]
    MetadataUnavailable(String),

    #[error("data source not found: {0:?}")]
    DataSourceNotFound(String),

    #[error("dialog not found: {0:?}")]
    DialogNotFound(String),

    /// A `"dataSourceRef:store"` target string did not name a known store.
    #[error("invalid cell target: {0:?}")]
    InvalidTarget(String),

    #[error("unknown command: {0:?}")]
    UnknownCommand(String),

    #[error("invalid params for {command:?}: {message}")]
    InvalidParams { command: String, message: String },

    /// A user-registered handler returned an error. Carries the metadata
    /// name the handler was bound under.
    #[error("handler {name:?} failed: {message}")]
    Handler { name: String, message: String },

    #[error(transparent)]
    Connector(#[from] crate::connector::ConnectorError),
}

impl EngineError {
    /// Shorthand for a handler-raised failure.
    pub fn handler(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a command params validation failure.
    pub fn invalid_params(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidParams {
            command: command.into(),
            message: message.into(),
        }
    }
}

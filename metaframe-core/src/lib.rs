//! Core engine for metaframe
//!
//! A metadata-driven UI runtime binds declarative window/data-source
//! descriptors to live data at run time. This crate is the reactive
//! orchestration engine behind that: it keeps per-window state in a
//! lazily-created, memoized cell store, fetches and reconciles remote
//! records with race-safety and stable selection, pushes a parent
//! source's selection into dependent sources, and manages window/dialog
//! lifecycles including awaited commits with structured parameter
//! hand-back.
//!
//! # Core Concepts
//!
//! - **Cell**: a subscribable mutable container, addressed `(kind, owner)`
//! - **DataSource**: a named, independently fetchable/selectable record
//!   collection bound to one window
//! - **Context**: the runtime bundle of cells + connector + handlers for
//!   one (window, data source) pair
//! - **Controller**: fetch/refresh/selection operations over one context
//! - **Execution**: one configured `init → handler → onSuccess/onError →
//!   onDone` chain
//! - **Engine**: the cooperative runtime driving fetches, propagation and
//!   deferred executions
//!
//! # Basic Example
//!
//! ```ignore
//! use metaframe_core::prelude::*;
//! use serde_json::json;
//!
//! let mut engine = Engine::new();
//! engine.registry().register("crm.save", |call| {
//!     // call.ctx is the data-source context, call.args the event args
//!     Ok(json!({"saved": true}))
//! });
//!
//! let metadata: WindowMetadata = serde_json::from_value(json!({
//!     "namespace": "crm",
//!     "actions": ["save"],
//!     "dataSources": [{
//!         "id": "customers",
//!         "selectionMode": "single",
//!         "uniqueKey": [{"field": "id"}],
//!         "selectors": {"data": "rows"}
//!     }]
//! }))?;
//!
//! let window_id = engine.open_window(metadata, WindowSpec {
//!     key: "customers".into(),
//!     ..WindowSpec::default()
//! })?;
//! engine.run_until_idle().await;
//!
//! engine.controller(&window_id, "customers")?.set_selection(Some(0));
//! ```
//!
//! # Async model
//!
//! The engine is single-threaded and cooperative. Only connector I/O
//! leaves the thread, as spawned tokio tasks that report back over a
//! channel; [`Engine::run_until_idle`] drains outcomes, propagation and
//! deferred executions until nothing is left. There are no locks; cells
//! are owned by their key and written only on the engine thread.

pub mod cell;
pub mod command;
pub mod connector;
pub mod context;
pub mod controller;
pub mod date;
pub mod descriptor;
pub mod error;
pub mod execution;
pub mod path;
pub mod propagate;
pub mod runtime;
pub mod testing;
pub mod tree;
pub mod window;

// Cell store exports
pub use cell::{
    CellKey, CellKind, CellStore, CellValue, CollectionInfo, ControlState, DialogState,
    FormStatus, InputState, QueuedMessage, SelectedNode, SelectedRow, SelectionState,
};

// Descriptor exports
pub use descriptor::{
    DataSourceDescriptor, DialogDescriptor, EventBinding, HandoffParameter, ParamDirection,
    ParamScope, ParameterDecl, Paging, SelectionMode, Selectors, ServiceConfig, UniqueKeyField,
    WindowMetadata,
};

// Context exports
pub use context::{
    ConnectorFactory, DataSourceContext, DialogContext, HandlerCall, HandlerFn, HandlerRegistry,
    Services, WindowContext,
};

// Controller exports
pub use controller::{DataSourceController, FetchPlan, RefreshTarget};

// Connector exports
pub use connector::{Connector, ConnectorError, FetchQuery, NullConnector};
#[cfg(feature = "http")]
pub use connector::HttpConnector;

// Lifecycle exports
pub use window::{OpenOptions, PendingResult, WindowManager, WindowSpec, WindowState};

// Execution exports
pub use execution::{Execution, executions_for};

// Runtime exports
pub use runtime::{Engine, FetchJob, MetadataProvider};

// Command bridge exports
pub use command::{CommandSpec, dispatch as dispatch_command, specs as command_specs};

// Error exports
pub use error::EngineError;

// Testing exports
pub use testing::{Harness, HarnessBuilder, StaticConnector};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cell::{
        CellKey, CellKind, CellStore, CellValue, ControlState, InputState, SelectionState,
    };
    pub use crate::connector::{Connector, ConnectorError, FetchQuery};
    pub use crate::context::{
        DataSourceContext, HandlerCall, HandlerRegistry, Services, WindowContext,
    };
    pub use crate::controller::DataSourceController;
    pub use crate::descriptor::{
        DataSourceDescriptor, HandoffParameter, SelectionMode, WindowMetadata,
    };
    pub use crate::error::EngineError;
    pub use crate::runtime::Engine;
    pub use crate::window::{OpenOptions, WindowManager, WindowSpec};
}

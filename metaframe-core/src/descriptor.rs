//! Static metadata descriptors
//!
//! These types are the deserialized form of the declarative metadata blob a
//! window is built from: data sources, dialogs, event bindings and the
//! action namespace. They describe *what* a window contains; all behavior
//! lives in the controller, propagator and lifecycle manager.
//!
//! Everything here derives `Deserialize` with camelCase field names so real
//! metadata JSON parses without a translation layer.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// How a data source tracks selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMode {
    Single,
    Multi,
    #[default]
    None,
}

/// One component of a source's unique key.
///
/// `field` is a dot-path into a record; `parameter` optionally names the
/// filter parameter the field maps to when building a refresh filter
/// (defaults to the field path itself).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UniqueKeyField {
    pub field: String,
    pub parameter: Option<String>,
}

/// Where an inbound parameter value is looked up.
///
/// Closed set: every variant has exactly one resolver, exhaustively
/// matched, instead of the stringly-typed scope dispatch this replaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParamScope {
    /// Another data source's current record: `location` is
    /// `"<sourceId>.<field path>"`.
    DataSource,
    /// The window's default source form.
    Form,
    /// The window's default source selection.
    Selection,
    /// The declaring source's static filter set.
    FilterSet,
    /// The window's own parameter blob.
    Metadata,
    /// Per-table UI settings. Carried for metadata compatibility; resolves
    /// to nothing in a headless engine.
    TableSetting,
}

/// A declared inbound parameter slot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterDecl {
    pub name: String,
    #[serde(default)]
    pub location: String,
    #[serde(rename = "in")]
    pub scope: ParamScope,
}

/// Dot-paths slicing a raw connector payload into records, paging info and
/// aggregate metrics. Absent paths mean "the payload itself" for `data`
/// and "not provided" for the others.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Selectors {
    pub data: Option<String>,
    pub data_info: Option<String>,
    pub metrics: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Paging {
    pub page_size: u32,
}

impl Default for Paging {
    fn default() -> Self {
        Self { page_size: 50 }
    }
}

/// Service binding for a source's connector.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfig {
    pub path: String,
}

/// Static descriptor of one named, per-window data source.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DataSourceDescriptor {
    pub id: String,
    pub selection_mode: SelectionMode,
    pub unique_key: Vec<UniqueKeyField>,
    /// Name of the child-list field. Present ⇒ the source is hierarchical
    /// and selection identity is a node path, not a unique key.
    pub self_reference: Option<String>,
    pub parameters: Vec<ParameterDecl>,
    pub selectors: Selectors,
    pub paging: Option<Paging>,
    /// Static filter defaults merged under live filter values.
    pub filter_set: Map<String, Value>,
    /// Upstream source this one mirrors. Set ⇒ records come from the
    /// upstream selection instead of the connector.
    pub data_source_ref: Option<String>,
    pub service: ServiceConfig,
    /// Action path invoked with freshly extracted records before they are
    /// stored. Only called when the extracted list is non-empty.
    pub on_fetch: Option<String>,
}

impl DataSourceDescriptor {
    /// Whether this source is a tree (`selfReference` declared).
    pub fn is_tree(&self) -> bool {
        self.self_reference.is_some()
    }

    /// Whether this source mirrors another source's selection.
    pub fn is_mirror(&self) -> bool {
        self.data_source_ref.is_some()
    }
}

/// One declared event execution: `init → handler → onSuccess/onError →
/// onDone`, optionally deferred through the window message queue.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventBinding {
    /// Source the execution runs against; the window default when absent.
    pub data_source_ref: Option<String>,
    pub init: Option<String>,
    pub handler: String,
    pub on_success: Option<String>,
    pub on_error: Option<String>,
    pub on_done: Option<String>,
    /// Deferred executions are appended to the window's message queue and
    /// drained out of band instead of running synchronously.
    #[serde(rename = "async")]
    pub deferred: bool,
    pub args: Value,
    pub parameters: Vec<ParameterDecl>,
}

/// Declared dialog: its backing data source and the action paths it can
/// invoke.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DialogDescriptor {
    pub id: String,
    pub data_source_ref: String,
    pub actions: Vec<String>,
}

/// The full metadata blob one window is built from.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WindowMetadata {
    pub namespace: String,
    pub window_title: String,
    pub default_data_source: Option<String>,
    pub data_sources: Vec<DataSourceDescriptor>,
    pub dialogs: Vec<DialogDescriptor>,
    /// Event name → ordered executions bound to it.
    pub events: HashMap<String, Vec<EventBinding>>,
    /// Action names the window expects to find registered under its
    /// namespace.
    pub actions: Vec<String>,
}

impl WindowMetadata {
    pub fn data_source(&self, id: &str) -> Option<&DataSourceDescriptor> {
        self.data_sources.iter().find(|d| d.id == id)
    }

    pub fn dialog(&self, id: &str) -> Option<&DialogDescriptor> {
        self.dialogs.iter().find(|d| d.id == id)
    }

    /// The ref a bare context request resolves to: the declared default,
    /// else the first declared source.
    pub fn default_ref(&self) -> Option<&str> {
        self.default_data_source
            .as_deref()
            .or_else(|| self.data_sources.first().map(|d| d.id.as_str()))
    }
}

/// Direction of a dialog/window hand-off parameter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamDirection {
    #[default]
    In,
    Out,
}

/// A parameter handed between a caller and an opened dialog/window.
///
/// Outbound parameters (`direction = out`, or `from` ending in `:output`)
/// are resolved from the commit payload by dot-path and written back into
/// the caller's cell named by `to` (`"dataSourceRef:store"`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HandoffParameter {
    pub name: String,
    pub direction: ParamDirection,
    pub from: Option<String>,
    pub to: Option<String>,
}

impl HandoffParameter {
    /// Whether this parameter flows from the opened dialog/window back to
    /// the caller on commit.
    pub fn is_outbound(&self) -> bool {
        self.direction == ParamDirection::Out
            || self
                .from
                .as_deref()
                .is_some_and(|f| f.ends_with(":output"))
    }

    /// The payload dot-path this parameter reads from: `from` with any
    /// `:output` suffix stripped, else the parameter name.
    pub fn payload_path(&self) -> &str {
        match self.from.as_deref() {
            Some(from) => from.strip_suffix(":output").unwrap_or(from),
            None => &self.name,
        }
    }
}

/// The cell store half of a `"dataSourceRef:store"` target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreTarget {
    Form,
    Filter,
    Selection,
    Metrics,
    InputQuery,
    InputHeaders,
    InputBody,
    InputPath,
}

impl StoreTarget {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "form" => Self::Form,
            "filter" => Self::Filter,
            "selection" => Self::Selection,
            "metrics" => Self::Metrics,
            "input.query" => Self::InputQuery,
            "input.headers" => Self::InputHeaders,
            "input.body" => Self::InputBody,
            "input.path" => Self::InputPath,
            _ => return None,
        })
    }
}

/// Split a `"dataSourceRef:store"` target string.
pub fn parse_cell_target(target: &str) -> Option<(&str, StoreTarget)> {
    let (source_ref, store) = target.split_once(':')?;
    Some((source_ref, StoreTarget::parse(store)?))
}

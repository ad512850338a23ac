//! Test utilities for metaframe engines
//!
//! - [`StaticConnector`]: a deterministic in-memory connector with canned
//!   payloads, payload sequences or a custom responder closure.
//! - [`Harness`]: builds an engine + one open window from a metadata JSON
//!   blob and pumps it to idle, so scenario tests read like the UI flows
//!   they describe.
//!
//! # Example
//!
//! ```ignore
//! let mut harness = Harness::builder(json!({
//!     "dataSources": [{"id": "rows", "selectionMode": "single",
//!                      "uniqueKey": [{"field": "id"}]}]
//! }))
//! .connector("rows", StaticConnector::with_payload(json!([{"id": 1}])))
//! .open();
//!
//! harness.run().await;
//! assert_eq!(harness.source("rows").collection().len(), 1);
//! ```
//!
//! Harness construction panics on malformed metadata; these are test
//! helpers and a loud failure beats a silent misconfiguration.

use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::connector::{Connector, ConnectorError, FetchQuery};
use crate::context::{DataSourceContext, HandlerRegistry};
use crate::controller::DataSourceController;
use crate::descriptor::WindowMetadata;
use crate::runtime::Engine;
use crate::window::WindowSpec;

type Responder = Box<dyn Fn(&FetchQuery) -> Result<Value, ConnectorError> + Send + Sync>;

/// Deterministic in-memory connector.
pub struct StaticConnector {
    responder: Responder,
}

impl StaticConnector {
    /// Every GET resolves with a clone of `payload`.
    pub fn with_payload(payload: Value) -> Self {
        Self::with_responder(move |_| Ok(payload.clone()))
    }

    /// GETs consume `payloads` in order; the last one repeats once the
    /// sequence is exhausted.
    ///
    /// # Panics
    ///
    /// Panics when `payloads` is empty.
    pub fn with_sequence(payloads: Vec<Value>) -> Self {
        assert!(!payloads.is_empty(), "sequence needs at least one payload");
        let queue = Mutex::new(VecDeque::from(payloads));
        Self::with_responder(move |_| {
            let mut queue = queue.lock().expect("sequence lock poisoned");
            if queue.len() > 1 {
                Ok(queue.pop_front().expect("checked non-empty"))
            } else {
                Ok(queue.front().cloned().expect("checked non-empty"))
            }
        })
    }

    /// Full control: inspect the query, answer or reject.
    pub fn with_responder(
        responder: impl Fn(&FetchQuery) -> Result<Value, ConnectorError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Box::new(responder),
        }
    }

    /// Every GET rejects with the given status.
    pub fn failing(status: u16, message: &str) -> Self {
        let message = message.to_string();
        Self::with_responder(move |_| {
            Err(ConnectorError::Status {
                status,
                message: message.clone(),
            })
        })
    }
}

#[async_trait]
impl Connector for StaticConnector {
    async fn get(&self, query: &FetchQuery) -> Result<Value, ConnectorError> {
        (self.responder)(query)
    }
}

/// An engine with one open window, ready for scenario assertions.
pub struct Harness {
    pub engine: Engine,
    pub window_id: String,
}

impl Harness {
    pub fn builder(metadata: Value) -> HarnessBuilder {
        HarnessBuilder {
            metadata,
            connectors: HashMap::new(),
            setup: Vec::new(),
            window_key: "test".to_string(),
            parameters: Value::Null,
        }
    }

    /// Pump the engine until fetches, propagation and deferred
    /// executions are all drained.
    pub async fn run(&mut self) {
        self.engine.run_until_idle().await;
    }

    /// The controller for one source of the harness window.
    ///
    /// # Panics
    ///
    /// Panics when the source is not declared in the metadata.
    pub fn controller(&self, source: &str) -> DataSourceController {
        self.engine
            .controller(&self.window_id, source)
            .expect("source declared in harness metadata")
    }

    /// The context for one source of the harness window.
    ///
    /// # Panics
    ///
    /// Panics when the source is not declared in the metadata.
    pub fn source(&self, source: &str) -> Rc<DataSourceContext> {
        self.engine
            .window_context(&self.window_id)
            .expect("harness window is open")
            .context(source)
            .expect("source declared in harness metadata")
    }
}

/// Builder for [`Harness`].
pub struct HarnessBuilder {
    metadata: Value,
    connectors: HashMap<String, Arc<dyn Connector>>,
    setup: Vec<Box<dyn FnOnce(&HandlerRegistry)>>,
    window_key: String,
    parameters: Value,
}

impl HarnessBuilder {
    /// Bind a connector to one source id.
    pub fn connector(mut self, source: &str, connector: StaticConnector) -> Self {
        self.connectors.insert(source.to_string(), Arc::new(connector));
        self
    }

    /// Register handlers before the window opens.
    pub fn registry(mut self, setup: impl FnOnce(&HandlerRegistry) + 'static) -> Self {
        self.setup.push(Box::new(setup));
        self
    }

    /// Window parameters (contribute to the window id and to
    /// metadata-scoped parameter resolution).
    pub fn parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Build the engine and open the window.
    ///
    /// # Panics
    ///
    /// Panics when the metadata does not parse or the window bootstrap
    /// fails; harness misconfiguration should fail the test loudly.
    pub fn open(self) -> Harness {
        let metadata: WindowMetadata =
            serde_json::from_value(self.metadata).expect("harness metadata parses");
        let mut engine = Engine::new();
        for setup in self.setup {
            setup(&engine.registry());
        }
        let connectors = self.connectors;
        engine.set_connector_factory(Rc::new(move |descriptor| {
            connectors
                .get(&descriptor.id)
                .cloned()
                .unwrap_or_else(|| Arc::new(crate::connector::NullConnector))
        }));
        let window_id = engine
            .open_window(
                metadata,
                WindowSpec {
                    key: self.window_key.clone(),
                    title: self.window_key,
                    parameters: self.parameters,
                    ..WindowSpec::default()
                },
            )
            .expect("harness window opens");
        Harness { engine, window_id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_harness_loads_initial_collection() {
        let mut harness = Harness::builder(json!({
            "dataSources": [{
                "id": "rows",
                "selectionMode": "single",
                "uniqueKey": [{"field": "id"}]
            }]
        }))
        .connector(
            "rows",
            StaticConnector::with_payload(json!([{"id": 1}, {"id": 2}])),
        )
        .open();

        harness.run().await;
        assert_eq!(harness.source("rows").collection().len(), 2);
    }

    #[tokio::test]
    async fn test_sequence_connector_repeats_last() {
        let connector = StaticConnector::with_sequence(vec![json!([1]), json!([2])]);
        let query = FetchQuery::default();
        assert_eq!(connector.get(&query).await, Ok(json!([1])));
        assert_eq!(connector.get(&query).await, Ok(json!([2])));
        assert_eq!(connector.get(&query).await, Ok(json!([2])));
    }

    #[tokio::test]
    async fn test_responder_sees_the_query() {
        let connector = StaticConnector::with_responder(|query| {
            Ok(json!({"echo": query.filter.get("q").cloned().unwrap_or(Value::Null)}))
        });
        let mut query = FetchQuery::default();
        query.filter.insert("q".into(), json!("abc"));
        assert_eq!(
            connector.get(&query).await,
            Ok(json!({"echo": "abc"}))
        );
    }
}

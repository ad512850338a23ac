//! Connector contract
//!
//! The engine never talks to a transport directly; every remote operation
//! goes through a [`Connector`] bound to one data source. The controller
//! only cares about the functional contract: `get` resolves to an
//! arbitrary JSON payload (sliced later by the source's selectors), the
//! mutating verbs take a body, and every non-2xx outcome rejects with a
//! human-readable status string.
//!
//! Connector calls run on spawned tokio tasks, so implementations must be
//! `Send + Sync`. The deterministic in-memory connector used by tests
//! lives in [`crate::testing`].

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

/// Failure at the transport boundary. Stored in `control.error`, never
/// propagated past the controller.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConnectorError {
    #[error("request failed with status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("operation not supported by this connector: {0}")]
    Unsupported(&'static str),
}

/// Everything a source contributes to a GET: live filter, page, resolved
/// inbound parameters and the request-shaping input sections.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FetchQuery {
    pub filter: Map<String, Value>,
    pub page: u32,
    pub page_size: Option<u32>,
    pub parameters: Map<String, Value>,
    pub query: Map<String, Value>,
    pub headers: Map<String, Value>,
    pub path: Map<String, Value>,
}

/// External service abstraction used by the controller.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn get(&self, query: &FetchQuery) -> Result<Value, ConnectorError>;

    async fn post(&self, _body: &Value) -> Result<Value, ConnectorError> {
        Err(ConnectorError::Unsupported("post"))
    }

    async fn put(&self, _body: &Value) -> Result<Value, ConnectorError> {
        Err(ConnectorError::Unsupported("put"))
    }

    async fn patch(&self, _body: &Value) -> Result<Value, ConnectorError> {
        Err(ConnectorError::Unsupported("patch"))
    }

    async fn delete(&self, _id: &str) -> Result<Value, ConnectorError> {
        Err(ConnectorError::Unsupported("delete"))
    }
}

/// Connector that rejects everything. Default binding for sources whose
/// service config names no backing. Mirror sources never call it.
pub struct NullConnector;

#[async_trait]
impl Connector for NullConnector {
    async fn get(&self, _query: &FetchQuery) -> Result<Value, ConnectorError> {
        Err(ConnectorError::Unsupported("get"))
    }
}

#[cfg(feature = "http")]
pub use http::HttpConnector;

#[cfg(feature = "http")]
mod http {
    use super::{Connector, ConnectorError, FetchQuery};
    use async_trait::async_trait;
    use serde_json::Value;
    use tracing::debug;

    /// reqwest-backed connector. Filter, parameters and the input query
    /// section become URL query pairs; `page`/`pageSize` ride along when
    /// paging is configured.
    pub struct HttpConnector {
        client: reqwest::Client,
        base_url: String,
        path: String,
    }

    impl HttpConnector {
        pub fn new(base_url: impl Into<String>, path: impl Into<String>) -> Self {
            Self {
                client: reqwest::Client::new(),
                base_url: base_url.into(),
                path: path.into(),
            }
        }

        fn url(&self) -> String {
            format!(
                "{}/{}",
                self.base_url.trim_end_matches('/'),
                self.path.trim_start_matches('/')
            )
        }

        fn query_pairs(query: &FetchQuery) -> Vec<(String, String)> {
            let mut pairs = Vec::new();
            for section in [&query.filter, &query.parameters, &query.query] {
                for (k, v) in section.iter() {
                    pairs.push((k.clone(), scalar(v)));
                }
            }
            if let Some(page_size) = query.page_size {
                pairs.push(("page".into(), query.page.to_string()));
                pairs.push(("pageSize".into(), page_size.to_string()));
            }
            pairs
        }

        async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, ConnectorError> {
            let response = request
                .send()
                .await
                .map_err(|e| ConnectorError::Transport(e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(ConnectorError::Status {
                    status: status.as_u16(),
                    message: status
                        .canonical_reason()
                        .unwrap_or("request rejected")
                        .to_string(),
                });
            }
            response
                .json()
                .await
                .map_err(|e| ConnectorError::Transport(e.to_string()))
        }
    }

    fn scalar(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    #[async_trait]
    impl Connector for HttpConnector {
        async fn get(&self, query: &FetchQuery) -> Result<Value, ConnectorError> {
            let url = self.url();
            debug!(url = %url, page = query.page, "connector GET");
            let mut request = self.client.get(&url).query(&Self::query_pairs(query));
            for (k, v) in query.headers.iter() {
                request = request.header(k, scalar(v));
            }
            self.send(request).await
        }

        async fn post(&self, body: &Value) -> Result<Value, ConnectorError> {
            self.send(self.client.post(self.url()).json(body)).await
        }

        async fn put(&self, body: &Value) -> Result<Value, ConnectorError> {
            self.send(self.client.put(self.url()).json(body)).await
        }

        async fn patch(&self, body: &Value) -> Result<Value, ConnectorError> {
            self.send(self.client.patch(self.url()).json(body)).await
        }

        async fn delete(&self, id: &str) -> Result<Value, ConnectorError> {
            let url = format!("{}/{}", self.url(), id);
            self.send(self.client.delete(url)).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_null_connector_rejects() {
        let connector = NullConnector;
        let err = connector
            .get(&FetchQuery::default())
            .await
            .expect_err("null connector rejects");
        assert_eq!(err, ConnectorError::Unsupported("get"));
    }

    #[tokio::test]
    async fn test_default_verbs_reject() {
        let connector = NullConnector;
        assert!(connector.post(&Value::Null).await.is_err());
        assert!(connector.delete("7").await.is_err());
    }

    #[test]
    fn test_status_error_is_readable() {
        let err = ConnectorError::Status {
            status: 404,
            message: "Not Found".into(),
        };
        assert_eq!(err.to_string(), "request failed with status 404: Not Found");
    }
}

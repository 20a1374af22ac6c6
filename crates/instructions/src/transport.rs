//! Outbound transport collaborator used by the `request` instruction.
//!
//! The instruction only sees the [`Transport`] trait. The deadline is
//! enforced here, at the transport boundary: a call that outlives its
//! timeout is dropped and reported as [`TransportError::Timeout`].

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// A fully resolved outbound call.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    /// Sent as a JSON body when present.
    pub body: Option<Value>,
    /// `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

/// What came back, whatever the status code.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    /// JSON when the body parses as JSON, otherwise the raw text; `null`
    /// for an empty body.
    pub body: Value,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    /// The deadline passed before a complete response arrived.
    #[error("timeout of {}ms exceeded", .0.as_millis())]
    Timeout(Duration),

    /// Connection, TLS or protocol failure.
    #[error("{0}")]
    Network(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError>;
}

/// Decode a response body: JSON if it parses, text otherwise.
pub fn decode_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

// ---------------------------------------------------------------------------
// reqwest
// ---------------------------------------------------------------------------

/// [`Transport`] over a shared `reqwest::Client`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self { client: Client::new() }
    }

    /// Use a preconfigured client (proxies, TLS roots, pool limits).
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn classify(err: reqwest::Error, timeout: Option<Duration>) -> TransportError {
        match timeout {
            Some(limit) if err.is_timeout() => TransportError::Timeout(limit),
            _ => TransportError::Network(err.to_string()),
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError> {
        debug!(method = %request.method, url = %request.url, "sending outbound request");

        let timeout = request.timeout;
        let mut builder = self.client.request(request.method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(limit) = timeout {
            builder = builder.timeout(limit);
        }

        let response = builder.send().await.map_err(|e| Self::classify(e, timeout))?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(|e| Self::classify(e, timeout))?;

        Ok(TransportResponse { status, body: decode_body(&bytes) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    fn get(url: String) -> OutboundRequest {
        OutboundRequest {
            method: Method::GET,
            url,
            headers: BTreeMap::new(),
            body: None,
            timeout: None,
        }
    }

    #[test]
    fn bodies_decode_as_json_or_text() {
        assert_eq!(decode_body(br#"{"a":1}"#), json!({ "a": 1 }));
        assert_eq!(decode_body(b"plain"), json!("plain"));
        assert_eq!(decode_body(b""), Value::Null);
    }

    #[tokio::test]
    async fn returns_status_and_json_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/data")
            .match_header("x-token", "abc")
            .match_body(mockito::Matcher::Json(json!({ "title": "t1\n\nline 2" })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":{"title":"t1\n\nline 2"}}"#)
            .create_async()
            .await;

        let mut request = get(format!("{}/data", server.url()));
        request.method = Method::POST;
        request.headers.insert("x-token".into(), "abc".into());
        request.body = Some(json!({ "title": "t1\n\nline 2" }));

        let response = ReqwestTransport::new().send(request).await.unwrap();
        mock.assert_async().await;
        assert!(response.is_success());
        assert_eq!(response.body["data"]["title"], "t1\n\nline 2");
    }

    #[tokio::test]
    async fn error_statuses_are_responses_not_errors() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/400")
            .with_status(400)
            .with_body("Bad Request")
            .create_async()
            .await;

        let response = ReqwestTransport::new()
            .send(get(format!("{}/api/400", server.url())))
            .await
            .unwrap();
        assert_eq!(response.status, 400);
        assert!(!response.is_success());
        assert_eq!(response.body, json!("Bad Request"));
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        // Accepts connections and never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hold = tokio::spawn(async move {
            let mut open = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                open.push(socket);
            }
        });

        let mut request = get(format!("http://{addr}/timeout"));
        request.timeout = Some(Duration::from_millis(250));

        let err = ReqwestTransport::new().send(request).await.unwrap_err();
        assert_eq!(err, TransportError::Timeout(Duration::from_millis(250)));
        assert_eq!(err.to_string(), "timeout of 250ms exceeded");
        hold.abort();
    }

    #[tokio::test]
    async fn refused_connection_is_a_network_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = ReqwestTransport::new()
            .send(get(format!("http://{addr}/")))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Network(_)));
    }
}

//! `request`: outbound HTTP call settled asynchronously.
//!
//! Failure results keep a stable shape so downstream nodes can branch on
//! them:
//!
//! | condition        | `code`              | `status` |
//! |------------------|---------------------|----------|
//! | deadline passed  | `ECONNABORTED`      | `null`   |
//! | transport error  | `ENETWORK`          | `null`   |
//! | 4xx response     | `ERR_BAD_REQUEST`   | numeric  |
//! | other non-2xx    | `ERR_BAD_RESPONSE`  | numeric  |
//!
//! With `ignoreFail` the same object is recorded on a *resolved* job.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::transport::{OutboundRequest, Transport, TransportError, TransportResponse};
use crate::{Completion, ExecutionContext, Instruction, NodeError, Outcome};

pub const TIMEOUT_CODE: &str = "ECONNABORTED";
pub const NETWORK_CODE: &str = "ENETWORK";
pub const CLIENT_STATUS_CODE: &str = "ERR_BAD_REQUEST";
pub const SERVER_STATUS_CODE: &str = "ERR_BAD_RESPONSE";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestConfig {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, Value>,
    /// JSON body.
    #[serde(default)]
    pub data: Option<Value>,
    /// Milliseconds; `0` or absent means no deadline.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub ignore_fail: bool,
}

fn default_method() -> String {
    "POST".to_string()
}

impl RequestConfig {
    fn into_request(self) -> Result<(OutboundRequest, bool), NodeError> {
        let method = Method::from_bytes(self.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| NodeError::invalid_config("request", e))?;

        let headers = self
            .headers
            .into_iter()
            .map(|(name, value)| {
                let value = match value {
                    Value::String(s) => s,
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                (name, value)
            })
            .collect();

        let request = OutboundRequest {
            method,
            url: self.url,
            headers,
            body: self.data,
            timeout: self.timeout.filter(|ms| *ms > 0).map(Duration::from_millis),
        };
        Ok((request, self.ignore_fail))
    }
}

pub struct RequestInstruction {
    transport: Arc<dyn Transport>,
}

impl RequestInstruction {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Instruction for RequestInstruction {
    async fn run(&self, config: Value, ctx: &ExecutionContext) -> Result<Outcome, NodeError> {
        let config: RequestConfig =
            serde_json::from_value(config).map_err(|e| NodeError::invalid_config("request", e))?;
        let (request, ignore_fail) = config.into_request()?;

        info!(
            execution_id = %ctx.execution_id,
            node_id = %ctx.node_id,
            method = %request.method,
            url = %request.url,
            "issuing request"
        );

        let transport = Arc::clone(&self.transport);
        Ok(Outcome::pending(async move {
            settle(transport.send(request).await, ignore_fail)
        }))
    }
}

/// Map a transport outcome onto a job settlement.
pub fn settle(outcome: Result<TransportResponse, TransportError>, ignore_fail: bool) -> Completion {
    let failure = match outcome {
        Ok(response) if response.is_success() => return Completion::resolved(response.body),
        Ok(response) => {
            let code = if (400..500).contains(&response.status) {
                CLIENT_STATUS_CODE
            } else {
                SERVER_STATUS_CODE
            };
            json!({
                "code": code,
                "name": "ResponseStatusError",
                "message": format!("request failed with status code {}", response.status),
                "status": response.status,
                "data": response.body,
            })
        }
        Err(err @ TransportError::Timeout(_)) => json!({
            "code": TIMEOUT_CODE,
            "name": "TransportTimeoutError",
            "message": err.to_string(),
            "status": null,
        }),
        Err(err @ TransportError::Network(_)) => json!({
            "code": NETWORK_CODE,
            "name": "TransportNetworkError",
            "message": err.to_string(),
            "status": null,
        }),
    };

    warn!(code = %failure["code"], ignore_fail, "request failed");
    if ignore_fail {
        Completion::resolved(failure)
    } else {
        Completion::failed(failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Replays one canned outcome and records what it was asked to send.
    struct CannedTransport {
        outcome: Result<TransportResponse, TransportError>,
        sent: Mutex<Vec<OutboundRequest>>,
    }

    #[async_trait]
    impl Transport for CannedTransport {
        async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError> {
            self.sent.lock().unwrap().push(request);
            self.outcome.clone()
        }
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            workflow_id: uuid::Uuid::new_v4(),
            execution_id: uuid::Uuid::new_v4(),
            node_id: "req".into(),
            scope: json!({}),
        }
    }

    async fn run_with(
        outcome: Result<TransportResponse, TransportError>,
        config: Value,
    ) -> (Completion, Vec<OutboundRequest>) {
        let transport = Arc::new(CannedTransport { outcome, sent: Mutex::new(Vec::new()) });
        let instruction = RequestInstruction::new(transport.clone());
        let completion = match instruction.run(config, &ctx()).await.unwrap() {
            Outcome::Pending(task) => task.await,
            Outcome::Settled(_) => panic!("request must settle asynchronously"),
        };
        let sent = transport.sent.lock().unwrap().clone();
        (completion, sent)
    }

    #[tokio::test]
    async fn success_resolves_with_the_body() {
        let ok = Ok(TransportResponse { status: 200, body: json!({ "data": { "title": "t1" } }) });
        let (completion, sent) =
            run_with(ok, json!({ "url": "http://svc/data", "method": "get" })).await;

        assert_eq!(completion, Completion::resolved(json!({ "data": { "title": "t1" } })));
        assert_eq!(sent[0].method, Method::GET);
        assert_eq!(sent[0].timeout, None);
    }

    #[tokio::test]
    async fn method_defaults_to_post_and_zero_timeout_means_none() {
        let ok = Ok(TransportResponse { status: 204, body: Value::Null });
        let (_, sent) = run_with(
            ok,
            json!({ "url": "http://svc", "timeout": 0, "headers": { "x-n": 5 }, "data": { "a": 1 } }),
        )
        .await;
        assert_eq!(sent[0].method, Method::POST);
        assert_eq!(sent[0].timeout, None);
        assert_eq!(sent[0].headers["x-n"], "5");
        assert_eq!(sent[0].body, Some(json!({ "a": 1 })));
    }

    #[tokio::test]
    async fn timeout_fails_with_a_timeout_code() {
        let timeout = Err(TransportError::Timeout(Duration::from_millis(250)));
        let (completion, sent) =
            run_with(timeout, json!({ "url": "http://svc/timeout", "method": "GET", "timeout": 250 }))
                .await;

        assert_eq!(sent[0].timeout, Some(Duration::from_millis(250)));
        assert!(completion.is_failed());
        assert_eq!(
            completion.result(),
            &json!({
                "code": "ECONNABORTED",
                "name": "TransportTimeoutError",
                "message": "timeout of 250ms exceeded",
                "status": null,
            })
        );
    }

    #[tokio::test]
    async fn ignore_fail_resolves_but_keeps_the_evidence() {
        let timeout = Err(TransportError::Timeout(Duration::from_millis(250)));
        let (completion, _) = run_with(
            timeout,
            json!({ "url": "http://svc/timeout", "timeout": 250, "ignoreFail": true }),
        )
        .await;

        assert!(!completion.is_failed());
        assert_eq!(completion.result()["code"], TIMEOUT_CODE);
        assert_eq!(completion.result()["message"], "timeout of 250ms exceeded");
    }

    #[tokio::test]
    async fn error_status_carries_status_and_body() {
        let bad = Ok(TransportResponse { status: 400, body: json!("Bad Request") });
        let (completion, _) = run_with(bad.clone(), json!({ "url": "http://svc/api/400" })).await;
        assert!(completion.is_failed());
        assert_eq!(completion.result()["status"], 400);
        assert_eq!(completion.result()["code"], CLIENT_STATUS_CODE);
        assert_eq!(completion.result()["data"], "Bad Request");

        let (completion, _) =
            run_with(bad, json!({ "url": "http://svc/api/400", "ignoreFail": true })).await;
        assert!(!completion.is_failed());
        assert_eq!(completion.result()["status"], 400);
    }

    #[test]
    fn server_errors_and_network_errors_have_their_own_codes() {
        let completion = settle(Ok(TransportResponse { status: 503, body: Value::Null }), false);
        assert_eq!(completion.result()["code"], SERVER_STATUS_CODE);

        let completion = settle(Err(TransportError::Network("connection refused".into())), false);
        assert_eq!(completion.result()["code"], NETWORK_CODE);
        assert_eq!(completion.result()["message"], "connection refused");
    }

    #[tokio::test]
    async fn malformed_config_is_fatal() {
        let instruction = RequestInstruction::new(Arc::new(CannedTransport {
            outcome: Err(TransportError::Network("unused".into())),
            sent: Mutex::new(Vec::new()),
        }));
        let err = instruction.run(json!({ "method": "GET" }), &ctx()).await.unwrap_err();
        assert!(matches!(err, NodeError::Fatal(msg) if msg.contains("invalid request config")));

        let err = instruction
            .run(json!({ "url": "http://svc", "method": "NOT A VERB" }), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Fatal(_)));
    }
}

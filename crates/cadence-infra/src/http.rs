//! HTTP channel and tool clients.
//!
//! Both POST JSON and carry the step's idempotency key in an
//! `Idempotency-Key` header, so a provider can drop the duplicate when a
//! step is retried after a crash between the side effect and the commit.

use std::time::Duration;

use cadence_core::flow::outbound::{
    ChannelClient, OutboundError, OutboundMessage, ToolCall, ToolInvoker,
};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(concat!("cadence/", env!("CARGO_PKG_VERSION")))
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_default()
}

/// 4xx means the provider refused this request for good; anything else is a
/// transport problem.
fn classify_status(status: StatusCode, body: &str) -> OutboundError {
    let detail = format!("HTTP {status}: {}", body.chars().take(200).collect::<String>());
    if status.is_client_error() {
        OutboundError::Rejected(detail)
    } else {
        OutboundError::Transport(detail)
    }
}

async fn post_json<B: Serialize + Sync>(
    http: &reqwest::Client,
    url: &str,
    idempotency_key: &str,
    body: &B,
) -> Result<reqwest::Response, OutboundError> {
    let response = http
        .post(url)
        .header(IDEMPOTENCY_HEADER, idempotency_key)
        .json(body)
        .send()
        .await
        .map_err(|e| OutboundError::Transport(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    Err(classify_status(status, &text))
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// Sends outbound messages to a channel provider webhook.
pub struct HttpChannel {
    url: String,
    http: reqwest::Client,
}

impl HttpChannel {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            http: build_client(),
        }
    }
}

impl ChannelClient for HttpChannel {
    async fn send(&self, message: &OutboundMessage) -> Result<(), OutboundError> {
        post_json(&self.http, &self.url, &message.idempotency_key, message).await?;
        tracing::debug!(
            subject_id = %message.subject_id,
            idempotency_key = %message.idempotency_key,
            "outbound message sent"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ToolRequest<'a> {
    subject_id: &'a str,
    arguments: &'a Value,
}

/// Invokes tools at `{base_url}/tools/{name}`; the JSON response is the result.
pub struct HttpTools {
    base_url: String,
    http: reqwest::Client,
}

impl HttpTools {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: build_client(),
        }
    }

    fn tool_url(&self, tool: &str) -> String {
        format!("{}/tools/{tool}", self.base_url)
    }
}

impl ToolInvoker for HttpTools {
    async fn invoke(&self, call: &ToolCall) -> Result<Value, OutboundError> {
        let request = ToolRequest {
            subject_id: &call.subject_id,
            arguments: &call.arguments,
        };
        let response = post_json(
            &self.http,
            &self.tool_url(&call.tool),
            &call.idempotency_key,
            &request,
        )
        .await?;

        response
            .json()
            .await
            .map_err(|e| OutboundError::Transport(format!("invalid tool response: {e}")))
    }
}

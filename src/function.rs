//! Serverless-function adapter: one invocation event in, SSE frames out.
//!
//! The event carries the caller's headers and the chat request body (either
//! as JSON or as a JSON-encoded string). Frames are written to any async
//! writer as they are produced.

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::chat::{ChatRequest, PageAgent};
use crate::server::{authorize, presented_key, AuthConfig};
use crate::stream::StreamEvent;

/// Events buffered before the agent waits for the writer.
const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FunctionEvent {
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

impl FunctionEvent {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    fn chat_request(&self) -> Result<ChatRequest> {
        match &self.body {
            Value::String(raw) => {
                serde_json::from_str(raw).context("Request body is not a valid chat request")
            }
            other => serde_json::from_value(other.clone())
                .context("Request body is not a valid chat request"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionOutcome {
    Streamed,
    Unauthorized,
    BadRequest(String),
}

/// Handle one event, writing the event stream to `out`.
///
/// Authorization and body parsing happen before anything is written, so a
/// rejected event leaves `out` untouched.
pub async fn handle_event<W>(
    agent: &PageAgent,
    auth: &AuthConfig,
    event: FunctionEvent,
    out: &mut W,
) -> Result<FunctionOutcome>
where
    W: AsyncWrite + Unpin,
{
    let key = presented_key(event.header("authorization"), event.header("x-api-key"));
    if authorize(key.as_deref(), auth).is_err() {
        tracing::warn!("Rejected unauthorized function invocation");
        return Ok(FunctionOutcome::Unauthorized);
    }

    let request = match event.chat_request() {
        Ok(request) => request,
        Err(e) => return Ok(FunctionOutcome::BadRequest(format!("{:#}", e))),
    };

    let (tx, rx) = flume::bounded::<StreamEvent>(EVENT_BUFFER);
    let writer = async move {
        while let Ok(event) = rx.recv_async().await {
            out.write_all(event.to_sse_frame().as_bytes())
                .await
                .context("Failed to write event frame")?;
            out.flush().await.context("Failed to flush event frame")?;
        }
        Ok::<_, anyhow::Error>(())
    };
    let ((), written) = tokio::join!(agent.run(request, tx), writer);
    written?;
    Ok(FunctionOutcome::Streamed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::llm_client::{CompletionProvider, CompletionRequest, CompletionStream};
    use crate::tools::ToolRegistry;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    struct GreetingProvider;

    struct GreetingStream {
        sent: bool,
    }

    #[async_trait]
    impl CompletionStream for GreetingStream {
        async fn next_chunk(&mut self) -> Result<Option<Value>> {
            if self.sent {
                return Ok(None);
            }
            self.sent = true;
            Ok(Some(json!({"choices": [{"delta": {"content": "Hello"}, "finish_reason": "stop"}]})))
        }
    }

    #[async_trait]
    impl CompletionProvider for GreetingProvider {
        async fn open(&self, _request: &CompletionRequest) -> Result<Box<dyn CompletionStream>> {
            Ok(Box::new(GreetingStream { sent: false }))
        }
    }

    async fn agent() -> PageAgent {
        let registry = Arc::new(ToolRegistry::with_builtin_tools().await);
        PageAgent::new(AgentConfig::default(), Arc::new(GreetingProvider), registry)
    }

    fn event(headers: &[(&str, &str)], body: Value) -> FunctionEvent {
        FunctionEvent {
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body,
        }
    }

    fn frames(out: &[u8]) -> Vec<Value> {
        String::from_utf8(out.to_vec())
            .unwrap()
            .split("\n\n")
            .filter(|frame| !frame.is_empty())
            .map(|frame| serde_json::from_str(frame.strip_prefix("data: ").unwrap()).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn streams_frames_for_string_body() {
        let body = json!({"messageId": "m-9", "messages": []}).to_string();
        let mut out = Vec::new();
        let outcome = handle_event(
            &agent().await,
            &AuthConfig::disabled(),
            event(&[], Value::String(body)),
            &mut out,
        )
        .await
        .unwrap();
        assert_eq!(outcome, FunctionOutcome::Streamed);

        let frames = frames(&out);
        assert_eq!(frames.first().unwrap(), &json!({"type": "start", "messageId": "m-9"}));
        assert_eq!(frames.last().unwrap(), &json!({"type": "finish"}));
        assert!(frames.iter().any(|f| f["type"] == "text-delta" && f["delta"] == "Hello"));
    }

    #[tokio::test]
    async fn rejects_missing_key_before_writing() {
        let auth = AuthConfig::required("secret");

        let mut out = Vec::new();
        let outcome = handle_event(&agent().await, &auth, event(&[], json!({})), &mut out)
            .await
            .unwrap();
        assert_eq!(outcome, FunctionOutcome::Unauthorized);
        assert!(out.is_empty());

        let outcome = handle_event(
            &agent().await,
            &auth,
            event(&[("X-Api-Key", "secret")], json!({"messages": []})),
            &mut out,
        )
        .await
        .unwrap();
        assert_eq!(outcome, FunctionOutcome::Streamed);
        assert!(!out.is_empty());
    }

    #[tokio::test]
    async fn malformed_body_is_a_bad_request() {
        let mut out = Vec::new();
        let outcome = handle_event(
            &agent().await,
            &AuthConfig::disabled(),
            event(&[], Value::String("{not json".to_string())),
            &mut out,
        )
        .await
        .unwrap();
        assert!(matches!(outcome, FunctionOutcome::BadRequest(_)));
        assert!(out.is_empty());
    }
}

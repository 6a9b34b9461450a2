//! Streaming chat-completion client (OpenAI wire format, function calling).
//!
//! The round loop only sees the [`CompletionProvider`] / [`CompletionStream`]
//! pair, so it can be driven by a scripted upstream in tests.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;

use crate::config::AgentConfig;
use crate::http_client::build_http_client;
use crate::tools::ToolDef;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDef>,
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn open(&self, request: &CompletionRequest) -> Result<Box<dyn CompletionStream>>;
}

/// One upstream completion, yielded as parsed `data:` payloads.
#[async_trait]
pub trait CompletionStream: Send {
    /// `Ok(None)` once the upstream finished.
    async fn next_chunk(&mut self) -> Result<Option<Value>>;
}

#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        Ok(Self {
            api_url: config.llm_api_url.trim_end_matches('/').to_string(),
            api_key: config.llm_api_key.clone(),
            model: config.llm_model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            client: build_http_client(Some(Duration::from_secs(15)))?,
        })
    }

    fn request_body(&self, request: &CompletionRequest) -> Result<Value> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": request.messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "stream": true,
        });
        if !request.tools.is_empty() {
            body["tools"] = serde_json::to_value(&request.tools)?;
        }
        Ok(body)
    }
}

#[async_trait]
impl CompletionProvider for LlmClient {
    async fn open(&self, request: &CompletionRequest) -> Result<Box<dyn CompletionStream>> {
        let url = format!("{}/chat/completions", self.api_url);
        let body = self.request_body(request)?;

        let mut req = self.client.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req
            .send()
            .await
            .context("Failed to send streaming LLM request")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("Streaming LLM API error {}: {}", status, body);
        }

        tracing::debug!(
            "Opened completion stream ({} messages, {} tools)",
            request.messages.len(),
            request.tools.len()
        );
        Ok(Box::new(SseChunkStream {
            response,
            line_buffer: Vec::new(),
            pending: VecDeque::new(),
            done: false,
        }))
    }
}

struct SseChunkStream {
    response: reqwest::Response,
    line_buffer: Vec<u8>,
    pending: VecDeque<Value>,
    done: bool,
}

#[async_trait]
impl CompletionStream for SseChunkStream {
    async fn next_chunk(&mut self) -> Result<Option<Value>> {
        loop {
            if let Some(chunk) = self.pending.pop_front() {
                return Ok(Some(chunk));
            }
            if self.done {
                return Ok(None);
            }

            match self
                .response
                .chunk()
                .await
                .context("Failed reading streaming chunk")?
            {
                Some(bytes) => {
                    self.line_buffer.extend_from_slice(&bytes);
                    self.done = drain_lines(&mut self.line_buffer, &mut self.pending)?;
                }
                None => {
                    // Last line may lack its newline.
                    self.line_buffer.push(b'\n');
                    drain_lines(&mut self.line_buffer, &mut self.pending)?;
                    self.done = true;
                }
            }
        }
    }
}

/// Move every complete `data:` line out of `buffer` into `out`.
/// Returns true once `[DONE]` was seen.
fn drain_lines(buffer: &mut Vec<u8>, out: &mut VecDeque<Value>) -> Result<bool> {
    while let Some(newline_idx) = buffer.iter().position(|b| *b == b'\n') {
        let raw: Vec<u8> = buffer.drain(..=newline_idx).collect();
        let line = String::from_utf8_lossy(&raw);
        let line = line.trim();

        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if !line.starts_with("data:") {
            continue;
        }

        let payload = line[5..].trim();
        if payload == "[DONE]" {
            buffer.clear();
            return Ok(true);
        }

        let chunk: Value = match serde_json::from_str(payload) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!("Skipping unparseable stream payload ({}): {}", e, payload);
                continue;
            }
        };
        if let Some(error) = chunk.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            anyhow::bail!("Upstream stream error: {}", message);
        }
        out.push_back(chunk);
    }
    Ok(false)
}

//! Chat requests from the editor and the multi-round agent loop behind them.
//!
//! One request produces one event stream. A round opens an upstream
//! completion, feeds its chunks through the [`StreamSession`], and runs any
//! catalog tools the model called. If the page was not built yet, their
//! results go back to the model and the next round starts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::catalog::ComponentCatalog;
use crate::config::AgentConfig;
use crate::llm_client::{CompletionProvider, CompletionRequest, Message};
use crate::ops::DocumentIndex;
use crate::stream::session::{CompletedCall, StreamSession};
use crate::stream::StreamEvent;
use crate::tools::page::UPDATE_PAGE;
use crate::tools::{ClientToolSpec, ToolCallResult, ToolContext, ToolRegistry};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub messages: Vec<UiMessage>,
    #[serde(default)]
    pub tools: HashMap<String, ClientToolSpec>,
    #[serde(default)]
    pub page_data: Option<Value>,
    #[serde(default)]
    pub config: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UiMessage {
    pub role: String,
    #[serde(default)]
    pub parts: Vec<Value>,
}

impl UiMessage {
    /// Concatenated text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Build memories of earlier `updatePage` results, oldest first, at most `limit`.
pub fn recent_build_memories(messages: &[UiMessage], limit: usize) -> Vec<Value> {
    let part_type = format!("tool-{}", UPDATE_PAGE);
    let mut memories: Vec<Value> = messages
        .iter()
        .filter(|message| message.role == "assistant")
        .flat_map(|message| message.parts.iter())
        .filter(|part| part.get("type").and_then(Value::as_str) == Some(part_type.as_str()))
        .filter_map(|part| part.pointer("/output/memory").cloned())
        .filter(Value::is_object)
        .collect();
    let skip = memories.len().saturating_sub(limit);
    memories.drain(..skip);
    memories
}

/// Prompt for the first round: instructions, context, catalog, page, memory,
/// then the conversation itself.
pub fn build_messages(
    config: &AgentConfig,
    request: &ChatRequest,
    catalog: &ComponentCatalog,
) -> Vec<Message> {
    let mut messages = vec![Message::system(config.system_prompt.clone())];

    if let Some(context) = request.context.as_deref().map(str::trim) {
        if !context.is_empty() {
            messages.push(Message::system(format!("Project context:\n{}", context)));
        }
    }

    if !catalog.is_empty() {
        let listing: Vec<String> = catalog
            .names()
            .map(|name| format!("- {}", catalog.summary(name)))
            .collect();
        messages.push(Message::system(format!(
            "Available components:\n{}",
            listing.join("\n")
        )));
    }

    let page = request
        .page_data
        .clone()
        .unwrap_or_else(|| json!({ "content": [] }));
    messages.push(Message::system(format!("Current page:\n{}", page)));

    for memory in recent_build_memories(&request.messages, config.memory_history_limit) {
        messages.push(Message::system(format!("Earlier page change:\n{}", memory)));
    }

    for message in &request.messages {
        let text = message.text();
        if text.trim().is_empty() {
            continue;
        }
        match message.role.as_str() {
            "user" => messages.push(Message::user(text)),
            "assistant" => messages.push(Message::assistant(text)),
            other => tracing::debug!("Skipping message with role '{}'", other),
        }
    }
    messages
}

/// System message handing catalog results to the next round.
fn follow_up_message(results: &[ToolCallResult]) -> Message {
    let mut text = String::from("Tool results:\n");
    for result in results {
        text.push_str(&format!("{}: {}\n", result.name, result.output.to_llm_string()));
    }
    text.push_str(&format!(
        "Now call {} to apply the change to the page.",
        UPDATE_PAGE
    ));
    Message::system(text)
}

enum RoundEnd {
    /// Only catalog tools ran; carry their results into another round.
    Continue(Vec<ToolCallResult>, String),
    Done,
    Closed,
    Failed(String),
}

pub struct PageAgent {
    config: AgentConfig,
    provider: Arc<dyn CompletionProvider>,
    registry: Arc<ToolRegistry>,
    idle_timeout: Duration,
}

impl PageAgent {
    pub fn new(
        config: AgentConfig,
        provider: Arc<dyn CompletionProvider>,
        registry: Arc<ToolRegistry>,
    ) -> Self {
        let idle_timeout = config.upstream_timeout();
        Self {
            config,
            provider,
            registry,
            idle_timeout,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Drive one request to completion, writing every event to `tx`.
    ///
    /// Ends with `finish`, or with a single `error` event when the upstream
    /// fails. Returns early without further events once the receiver is gone.
    pub async fn run(&self, request: ChatRequest, tx: flume::Sender<StreamEvent>) {
        let ctx = ToolContext {
            document: Arc::new(DocumentIndex::from_page_data(request.page_data.as_ref())),
            catalog: Arc::new(ComponentCatalog::from_config(request.config.as_ref())),
        };
        let message_id = request
            .message_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        tracing::info!(
            "Chat request {} (chat {:?}): {} message(s), {} component(s) on page",
            message_id,
            request.chat_id,
            request.messages.len(),
            ctx.document.len()
        );

        let mut session = StreamSession::new(
            message_id,
            self.registry.descriptors().await,
            ctx.document.clone(),
            ctx.catalog.clone(),
        );
        let tools = self.registry.tool_definitions(&request.tools).await;
        let mut messages = build_messages(&self.config, &request, &ctx.catalog);

        if !forward(&tx, vec![session.start()]).await {
            return;
        }

        let max_rounds = self.config.max_tool_rounds.max(1);
        for round in 1..=max_rounds {
            let completion = CompletionRequest {
                messages: messages.clone(),
                tools: tools.clone(),
            };
            match self.run_round(&mut session, &completion, &ctx, &tx).await {
                RoundEnd::Continue(results, text) => {
                    if round == max_rounds {
                        tracing::warn!("Stopping after {} round(s) without a page build", round);
                        break;
                    }
                    if !text.trim().is_empty() {
                        messages.push(Message::assistant(text));
                    }
                    messages.push(follow_up_message(&results));
                }
                RoundEnd::Done => break,
                RoundEnd::Closed => {
                    tracing::info!("Client went away; stopping stream");
                    return;
                }
                RoundEnd::Failed(error) => {
                    tracing::warn!("Chat stream failed: {}", error);
                    let _ = tx.send_async(StreamEvent::error(error)).await;
                    return;
                }
            }
        }

        let _ = tx.send_async(StreamEvent::Finish).await;
    }

    async fn run_round(
        &self,
        session: &mut StreamSession,
        completion: &CompletionRequest,
        ctx: &ToolContext,
        tx: &flume::Sender<StreamEvent>,
    ) -> RoundEnd {
        if !forward(tx, vec![session.begin_round()]).await {
            return RoundEnd::Closed;
        }

        let mut results = Vec::new();
        let mut built = false;
        let mut text = String::new();
        let mut failure = None;

        match self.provider.open(completion).await {
            Ok(mut stream) => loop {
                let progress = match tokio::time::timeout(self.idle_timeout, stream.next_chunk()).await {
                    Ok(Ok(Some(chunk))) => session.on_chunk(&chunk),
                    Ok(Ok(None)) => break,
                    Ok(Err(e)) => {
                        failure = Some(format!("{:#}", e));
                        break;
                    }
                    Err(_) => {
                        failure = Some(format!(
                            "Upstream stream idle for more than {}s",
                            self.idle_timeout.as_secs_f32()
                        ));
                        break;
                    }
                };
                collect_text(&progress.events, &mut text);
                if !forward(tx, progress.events).await {
                    return RoundEnd::Closed;
                }
                match self.settle(progress.completed, ctx, tx, &mut results).await {
                    Some(build) => built |= build,
                    None => return RoundEnd::Closed,
                }
            },
            Err(e) => failure = Some(format!("{:#}", e)),
        }

        // Calls cut off by the end (or failure) of the stream are still completed.
        let progress = session.finish_round();
        collect_text(&progress.events, &mut text);
        if !forward(tx, progress.events).await {
            return RoundEnd::Closed;
        }
        match self.settle(progress.completed, ctx, tx, &mut results).await {
            Some(build) => built |= build,
            None => return RoundEnd::Closed,
        }
        if !forward(tx, vec![StreamEvent::FinishStep]).await {
            return RoundEnd::Closed;
        }

        if let Some(error) = failure {
            return RoundEnd::Failed(error);
        }
        if built || results.is_empty() {
            RoundEnd::Done
        } else {
            RoundEnd::Continue(results, text)
        }
    }

    /// Run pending tools and forward their output. Returns whether a build
    /// call was among `completed`, or `None` if the client went away.
    async fn settle(
        &self,
        completed: Vec<CompletedCall>,
        ctx: &ToolContext,
        tx: &flume::Sender<StreamEvent>,
        results: &mut Vec<ToolCallResult>,
    ) -> Option<bool> {
        let mut built = false;
        for call in completed {
            let call = match call {
                CompletedCall::Build(_) => {
                    built = true;
                    continue;
                }
                CompletedCall::Pending(call) => call,
            };
            let result = self.registry.execute_call(&call, ctx).await;
            let label = match self.registry.get(&call.name).await {
                Some(tool) => tool.done_label(&result.output),
                None => format!("Unknown tool: {}", call.name),
            };
            tracing::debug!("Tool {} ({}) finished: {}", call.name, call.id, label);
            if !forward(tx, StreamSession::tool_finished(&result, label)).await {
                return None;
            }
            results.push(result);
        }
        Some(built)
    }
}

fn collect_text(events: &[StreamEvent], text: &mut String) {
    for event in events {
        if let StreamEvent::TextDelta { delta, .. } = event {
            text.push_str(delta);
        }
    }
}

/// Send in order; false once the receiving side is gone.
async fn forward(tx: &flume::Sender<StreamEvent>, events: Vec<StreamEvent>) -> bool {
    for event in events {
        if tx.send_async(event).await.is_err() {
            return false;
        }
    }
    true
}

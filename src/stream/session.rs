//! Per-request streaming session.
//!
//! Consumes chat-completion chunks (the parsed `data:` payloads of the
//! upstream stream), reconstructs tool calls by their upstream `index`, and
//! turns them into client events. Everything here is synchronous: the async
//! driver in `chat` pulls chunks, feeds them in, and forwards the events.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};

use super::emitter::IncrementalOpEmitter;
use super::events::{StreamEvent, ToolStatus};
use crate::catalog::ComponentCatalog;
use crate::ops::memory::summarize;
use crate::ops::{BuildOperation, DocumentIndex};
use crate::partial_json::{parse_partial, parse_settled};
use crate::tools::page::finished_status;
use crate::tools::{ToolCall, ToolCallResult, ToolCategory, ToolDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    NotStarted,
    Started,
    StreamingArgs,
    Completed,
}

#[derive(Debug, Clone)]
pub struct ToolCallState {
    pub id: String,
    pub name: String,
    pub args_text: String,
    pub phase: CallPhase,
    forwarded_len: usize,
    last_description: Option<String>,
    description_sent: bool,
    loading_sent: bool,
}

impl ToolCallState {
    fn new() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            args_text: String::new(),
            phase: CallPhase::NotStarted,
            forwarded_len: 0,
            last_description: None,
            description_sent: false,
            loading_sent: false,
        }
    }
}

/// A tool call whose arguments are complete.
#[derive(Debug, Clone)]
pub enum CompletedCall {
    /// Build call: its events, output included, are already out.
    Build(ToolCall),
    /// Any other tool: still has to be executed.
    Pending(ToolCall),
}

/// Events plus any calls completed by one input.
#[derive(Debug, Default)]
pub struct Progress {
    pub events: Vec<StreamEvent>,
    pub completed: Vec<CompletedCall>,
}

impl Progress {
    fn extend(&mut self, other: Progress) {
        self.events.extend(other.events);
        self.completed.extend(other.completed);
    }
}

pub struct StreamSession {
    message_id: String,
    tools: HashMap<String, ToolDescriptor>,
    emitter: IncrementalOpEmitter,
    calls: Vec<ToolCallState>,
    round: usize,
    text_id: Option<String>,
}

impl StreamSession {
    pub fn new(
        message_id: impl Into<String>,
        tools: Vec<ToolDescriptor>,
        document: Arc<DocumentIndex>,
        catalog: Arc<ComponentCatalog>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            tools: tools.into_iter().map(|d| (d.name.clone(), d)).collect(),
            emitter: IncrementalOpEmitter::new(document, catalog),
            calls: Vec::new(),
            round: 0,
            text_id: None,
        }
    }

    pub fn start(&self) -> StreamEvent {
        StreamEvent::Start {
            message_id: self.message_id.clone(),
        }
    }

    pub fn begin_round(&mut self) -> StreamEvent {
        self.round += 1;
        self.calls.clear();
        self.text_id = None;
        StreamEvent::StartStep
    }

    pub fn calls(&self) -> &[ToolCallState] {
        &self.calls
    }

    fn is_build_tool(&self, name: &str) -> bool {
        self.tools
            .get(name)
            .is_some_and(|d| d.category == ToolCategory::Build)
    }

    fn loading_label(&self, name: &str) -> String {
        self.tools
            .get(name)
            .map(|d| d.loading_label.clone())
            .unwrap_or_else(|| format!("Running {}…", name))
    }

    /// Feed one parsed chunk of the upstream stream.
    pub fn on_chunk(&mut self, chunk: &Value) -> Progress {
        let mut progress = Progress::default();
        let Some(choice) = chunk["choices"].as_array().and_then(|arr| arr.first()) else {
            return progress;
        };

        if let Some(text) = choice["delta"]["content"].as_str() {
            if !text.is_empty() {
                self.on_text(text, &mut progress.events);
            }
        }

        if let Some(tc_deltas) = choice["delta"]["tool_calls"].as_array() {
            for tc_delta in tc_deltas {
                let idx = tc_delta
                    .get("index")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(self.calls.len() as u64) as usize;
                self.on_tool_delta(idx, tc_delta, &mut progress.events);
            }
        }

        if choice["finish_reason"].is_string() {
            progress.extend(self.complete_pending());
        }
        progress
    }

    /// Upstream ended (or failed): finalize whatever was captured. The
    /// caller closes the step once pending tools have run.
    pub fn finish_round(&mut self) -> Progress {
        let mut progress = self.complete_pending();
        if let Some(id) = self.text_id.take() {
            progress.events.push(StreamEvent::TextEnd { id });
        }
        progress
    }

    /// Events closing a tool call that ran through the registry.
    pub fn tool_finished(result: &ToolCallResult, label: String) -> Vec<StreamEvent> {
        vec![
            StreamEvent::tool_status(&result.id, ToolStatus::done(label)),
            StreamEvent::ToolOutputAvailable {
                tool_call_id: result.id.clone(),
                output: result.output.to_client_value(),
            },
        ]
    }

    fn on_text(&mut self, text: &str, events: &mut Vec<StreamEvent>) {
        let id = match &self.text_id {
            Some(id) => id.clone(),
            None => {
                let id = format!("{}-text-{}", self.message_id, self.round);
                events.push(StreamEvent::TextStart { id: id.clone() });
                self.text_id = Some(id.clone());
                id
            }
        };
        events.push(StreamEvent::TextDelta {
            id,
            delta: text.to_string(),
        });
    }

    fn on_tool_delta(&mut self, idx: usize, tc_delta: &Value, events: &mut Vec<StreamEvent>) {
        while self.calls.len() <= idx {
            self.calls.push(ToolCallState::new());
        }
        let round = self.round;
        let call = &mut self.calls[idx];
        if call.phase == CallPhase::Completed {
            tracing::debug!("Ignoring delta for completed tool call #{}", idx);
            return;
        }

        if let Some(id) = tc_delta.get("id").and_then(|v| v.as_str()) {
            if call.id.is_empty() {
                call.id = id.to_string();
            }
        }
        if let Some(name_part) = tc_delta
            .get("function")
            .and_then(|f| f.get("name"))
            .and_then(|v| v.as_str())
        {
            if call.phase == CallPhase::NotStarted {
                call.name.push_str(name_part);
            }
        }
        if let Some(args_part) = tc_delta
            .get("function")
            .and_then(|f| f.get("arguments"))
            .and_then(|v| v.as_str())
        {
            call.args_text.push_str(args_part);
        }

        if call.phase == CallPhase::NotStarted {
            if call.name.is_empty() {
                return;
            }
            if call.id.is_empty() {
                call.id = format!("call_{}_{}", round, idx);
            }
            call.phase = CallPhase::Started;
            events.push(StreamEvent::ToolInputStart {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
            });
        }

        let id = call.id.clone();
        let name = call.name.clone();
        let build = self.is_build_tool(&name);
        if !build && !self.calls[idx].loading_sent {
            self.calls[idx].loading_sent = true;
            events.push(StreamEvent::tool_status(
                &id,
                ToolStatus::loading(self.loading_label(&name)),
            ));
        }

        // Text buffered before the name arrived goes out with the first delta.
        let call = &mut self.calls[idx];
        call.phase = CallPhase::StreamingArgs;
        if call.args_text.len() == call.forwarded_len {
            return;
        }
        events.push(StreamEvent::ToolInputDelta {
            tool_call_id: id,
            input_text_delta: call.args_text[call.forwarded_len..].to_string(),
        });
        call.forwarded_len = call.args_text.len();

        if build {
            self.on_build_args(idx, events);
        }
    }

    fn on_build_args(&mut self, idx: usize, events: &mut Vec<StreamEvent>) {
        let loading_label = self.loading_label(&self.calls[idx].name);
        let call = &mut self.calls[idx];
        let id = call.id.clone();

        let partial = parse_partial(&call.args_text);
        let description = partial
            .as_ref()
            .and_then(|v| v.get("description"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if !call.description_sent
            && !description.is_empty()
            && call.last_description.as_deref() == Some(description.as_str())
        {
            call.description_sent = true;
            events.push(StreamEvent::ToolInputAvailable {
                tool_call_id: id.clone(),
                tool_name: call.name.clone(),
                input: json!({ "description": description }),
            });
        }
        call.last_description = Some(description.clone());

        let settled = parse_settled(&call.args_text);
        let Some(build) = settled
            .as_ref()
            .and_then(|v| v.get("build"))
            .and_then(Value::as_array)
        else {
            return;
        };
        if build.is_empty() {
            return;
        }
        if !call.loading_sent {
            call.loading_sent = true;
            events.push(StreamEvent::tool_status(&id, ToolStatus::loading(loading_label)));
        }

        let reset_confirmed = settled
            .as_ref()
            .and_then(|v| v.get("resetConfirmed"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let emitted = self
            .emitter
            .process_partial_build_array(build, &id, &description);
        warn_unconfirmed_reset(&emitted, reset_confirmed);
        events.extend(emitted);
    }

    fn complete_pending(&mut self) -> Progress {
        let mut progress = Progress::default();
        for idx in 0..self.calls.len() {
            let call = &self.calls[idx];
            if call.phase == CallPhase::Completed {
                continue;
            }
            if call.name.is_empty() {
                tracing::debug!("Discarding nameless tool call #{}", idx);
                self.calls[idx].phase = CallPhase::Completed;
                continue;
            }
            progress.extend(self.complete_call(idx));
        }
        progress
    }

    fn complete_call(&mut self, idx: usize) -> Progress {
        let mut progress = Progress::default();
        let call = &mut self.calls[idx];
        call.phase = CallPhase::Completed;

        let text = if call.args_text.trim().is_empty() {
            "{}"
        } else {
            call.args_text.as_str()
        };
        let arguments = match serde_json::from_str::<Value>(text) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(
                    "Tool call '{}' finished with unparseable arguments: {}",
                    call.name,
                    e
                );
                Value::String(call.args_text.clone())
            }
        };
        let tool_call = ToolCall {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments,
        };

        if !self.is_build_tool(&tool_call.name) {
            progress.events.push(StreamEvent::ToolInputAvailable {
                tool_call_id: tool_call.id.clone(),
                tool_name: tool_call.name.clone(),
                input: tool_call.arguments.clone(),
            });
            progress.completed.push(CompletedCall::Pending(tool_call));
            return progress;
        }

        let description = tool_call
            .arguments
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let description_sent = self.calls[idx].description_sent;
        if !description_sent {
            self.calls[idx].description_sent = true;
            progress.events.push(StreamEvent::ToolInputAvailable {
                tool_call_id: tool_call.id.clone(),
                tool_name: tool_call.name.clone(),
                input: json!({ "description": description }),
            });
        }

        if let Some(build) = tool_call.arguments.get("build").and_then(Value::as_array) {
            let reset_confirmed = tool_call
                .arguments
                .get("resetConfirmed")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let emitted = self.emitter.flush(build, &tool_call.id, &description);
            warn_unconfirmed_reset(&emitted, reset_confirmed);
            progress.events.extend(emitted);
        }

        let applied = self.emitter.emitted(&tool_call.id).to_vec();
        let memory = summarize(&applied, &description);
        tracing::info!(
            "Build call {} finished: {} op(s) emitted",
            tool_call.id,
            applied.len()
        );
        progress.events.push(StreamEvent::tool_status(
            &tool_call.id,
            finished_status(&memory),
        ));
        progress.events.push(StreamEvent::ToolOutputAvailable {
            tool_call_id: tool_call.id.clone(),
            output: json!({
                "status": finished_status(&memory),
                "memory": memory,
            }),
        });
        progress.completed.push(CompletedCall::Build(tool_call));
        progress
    }
}

fn warn_unconfirmed_reset(events: &[StreamEvent], reset_confirmed: bool) {
    if reset_confirmed {
        return;
    }
    let reset = events.iter().any(|event| {
        matches!(
            event,
            StreamEvent::DataBuildOp {
                data: BuildOperation::Reset,
                ..
            }
        )
    });
    if reset {
        tracing::warn!("Emitting reset without resetConfirmed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::ROOT_ZONE;
    use crate::tools::catalog::GET_COMPONENT_DEFINITIONS;
    use crate::tools::page::UPDATE_PAGE;

    fn descriptors() -> Vec<ToolDescriptor> {
        vec![
            ToolDescriptor {
                name: UPDATE_PAGE.to_string(),
                category: ToolCategory::Build,
                loading_label: "Updating page…".to_string(),
            },
            ToolDescriptor {
                name: GET_COMPONENT_DEFINITIONS.to_string(),
                category: ToolCategory::Catalog,
                loading_label: "Loading component definitions…".to_string(),
            },
        ]
    }

    fn session() -> StreamSession {
        let document = DocumentIndex::from_page_data(Some(&json!({
            "content": [{"type": "Heading", "props": {"id": "h1", "title": "Hello"}}]
        })));
        let mut session = StreamSession::new(
            "msg-1",
            descriptors(),
            Arc::new(document),
            Arc::new(ComponentCatalog::default()),
        );
        session.begin_round();
        session
    }

    fn tool_chunk(index: u64, id: Option<&str>, name: Option<&str>, args: &str) -> Value {
        let mut function = json!({ "arguments": args });
        if let Some(name) = name {
            function["name"] = json!(name);
        }
        let mut delta = json!({ "index": index, "function": function });
        if let Some(id) = id {
            delta["id"] = json!(id);
            delta["type"] = json!("function");
        }
        json!({"choices": [{"delta": {"tool_calls": [delta]}, "finish_reason": null}]})
    }

    fn finish_chunk() -> Value {
        json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]})
    }

    /// Stream `args` for one call in small fragments, then finish it.
    fn stream_call(session: &mut StreamSession, id: &str, name: &str, args: &str) -> Progress {
        let mut progress = session.on_chunk(&tool_chunk(0, Some(id), Some(name), ""));
        let chars: Vec<char> = args.chars().collect();
        for piece in chars.chunks(7) {
            let piece: String = piece.iter().collect();
            progress.extend(session.on_chunk(&tool_chunk(0, None, None, &piece)));
        }
        progress.extend(session.on_chunk(&finish_chunk()));
        progress
    }

    fn build_ops(events: &[StreamEvent]) -> Vec<BuildOperation> {
        events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::DataBuildOp { data, .. } => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn build_call_streams_ops_and_finishes_with_memory() {
        let mut session = session();
        let args = json!({
            "description": "Add a hero",
            "build": [{
                "op": "add", "type": "Hero", "id": "hero-1", "index": 0,
                "zone": ROOT_ZONE, "props": {"title": "Hi"}
            }]
        })
        .to_string();
        let progress = stream_call(&mut session, "call_a", UPDATE_PAGE, &args);
        let events = &progress.events;

        assert_eq!(
            events[0],
            StreamEvent::ToolInputStart {
                tool_call_id: "call_a".to_string(),
                tool_name: UPDATE_PAGE.to_string(),
            }
        );

        let forwarded: String = events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::ToolInputDelta { input_text_delta, .. } => {
                    Some(input_text_delta.as_str())
                }
                _ => None,
            })
            .collect();
        assert_eq!(forwarded, args);

        let inputs: Vec<&Value> = events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::ToolInputAvailable { input, .. } => Some(input),
                _ => None,
            })
            .collect();
        assert_eq!(inputs, vec![&json!({"description": "Add a hero"})]);

        let loading = events
            .iter()
            .filter(|event| {
                matches!(event, StreamEvent::DataToolStatus { data, .. } if data.status.loading)
            })
            .count();
        assert_eq!(loading, 1);

        let ops = build_ops(events);
        assert_eq!(ops.len(), 2);
        assert!(matches!(&ops[0], BuildOperation::Add { id, props, .. } if id == "hero-1" && props.is_empty()));
        assert_eq!(
            ops[1],
            BuildOperation::Update {
                id: "hero-1".to_string(),
                props: json!({"title": "Hi"}).as_object().unwrap().clone(),
            }
        );

        let Some(StreamEvent::ToolOutputAvailable { tool_call_id, output }) = events.last() else {
            panic!("expected tool output last");
        };
        assert_eq!(tool_call_id, "call_a");
        assert_eq!(output["memory"]["created"][0]["id"], "hero-1");
        assert_eq!(output["memory"]["appliedOpsCount"], 2);
        assert_eq!(output["status"]["loading"], false);
        assert!(output.get("build").is_none());

        assert_eq!(progress.completed.len(), 1);
        let CompletedCall::Build(call) = &progress.completed[0] else {
            panic!("expected build call");
        };
        assert_eq!(call.arguments["description"], "Add a hero");
    }

    #[test]
    fn catalog_call_is_handed_back_for_execution() {
        let mut session = session();
        let progress = stream_call(
            &mut session,
            "call_d",
            GET_COMPONENT_DEFINITIONS,
            r#"{"query":"Button, Heading"}"#,
        );
        let events = &progress.events;
        assert!(matches!(events[0], StreamEvent::ToolInputStart { .. }));
        assert_eq!(
            events[1],
            StreamEvent::tool_status(
                "call_d",
                ToolStatus::loading("Loading component definitions…")
            )
        );
        assert!(build_ops(events).is_empty());
        assert!(matches!(
            events.last(),
            Some(StreamEvent::ToolInputAvailable { input, .. }) if input["query"] == "Button, Heading"
        ));

        assert_eq!(progress.completed.len(), 1);
        let CompletedCall::Pending(call) = &progress.completed[0] else {
            panic!("expected pending call");
        };
        assert_eq!(call.name, GET_COMPONENT_DEFINITIONS);
    }

    #[test]
    fn text_is_framed_per_round() {
        let mut session = session();
        let mut events = Vec::new();
        for text in ["Sure", ", on it."] {
            let chunk = json!({"choices": [{"delta": {"content": text}, "finish_reason": null}]});
            events.extend(session.on_chunk(&chunk).events);
        }
        events.extend(session.finish_round().events);
        assert_eq!(
            events,
            vec![
                StreamEvent::TextStart { id: "msg-1-text-1".to_string() },
                StreamEvent::TextDelta { id: "msg-1-text-1".to_string(), delta: "Sure".to_string() },
                StreamEvent::TextDelta { id: "msg-1-text-1".to_string(), delta: ", on it.".to_string() },
                StreamEvent::TextEnd { id: "msg-1-text-1".to_string() },
            ]
        );
    }

    #[test]
    fn truncated_call_is_finalized_with_what_was_captured() {
        let mut session = session();
        session.on_chunk(&tool_chunk(0, Some("call_t"), Some(UPDATE_PAGE), ""));
        let progress = session.on_chunk(&tool_chunk(
            0,
            None,
            None,
            r#"{"description":"Remove it","build":[{"op":"delete","id":"h1"}"#,
        ));
        assert_eq!(
            build_ops(&progress.events),
            vec![BuildOperation::Delete { id: "h1".to_string() }]
        );

        let progress = session.finish_round();
        assert_eq!(progress.completed.len(), 1);
        let CompletedCall::Build(call) = &progress.completed[0] else {
            panic!("expected build call");
        };
        assert!(call.arguments.is_string());
        let Some(StreamEvent::ToolOutputAvailable { tool_call_id, output }) = progress.events.last()
        else {
            panic!("expected tool output last");
        };
        assert_eq!(tool_call_id, "call_t");
        assert_eq!(output["memory"]["deleted"], json!(["h1"]));
        assert_eq!(session.calls()[0].phase, CallPhase::Completed);
    }

    #[test]
    fn arguments_before_name_are_forwarded_on_start() {
        let mut session = session();
        let early = session.on_chunk(&tool_chunk(0, None, None, r#"{"query""#));
        assert!(early.events.is_empty());

        let progress = session.on_chunk(&tool_chunk(0, None, Some(GET_COMPONENT_DEFINITIONS), ":\"Hero\"}"));
        assert_eq!(
            progress.events[0],
            StreamEvent::ToolInputStart {
                tool_call_id: "call_1_0".to_string(),
                tool_name: GET_COMPONENT_DEFINITIONS.to_string(),
            }
        );
        assert_eq!(
            progress.events.last(),
            Some(&StreamEvent::ToolInputDelta {
                tool_call_id: "call_1_0".to_string(),
                input_text_delta: r#"{"query":"Hero"}"#.to_string(),
            })
        );
    }

    #[test]
    fn deltas_after_completion_are_ignored() {
        let mut session = session();
        stream_call(&mut session, "call_d", GET_COMPONENT_DEFINITIONS, r#"{"query":"Hero"}"#);
        let late = session.on_chunk(&tool_chunk(0, None, None, "garbage"));
        assert!(late.events.is_empty());
        assert!(session.finish_round().completed.is_empty());
    }
}

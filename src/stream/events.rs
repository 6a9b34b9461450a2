//! Events written to the client as `data: <json>\n\n` frames.
//!
//! The shapes follow the UI message stream the editor consumes; the `type`
//! tag is kebab-case and payload fields are camelCase.

use serde::Serialize;
use serde_json::Value;

use crate::ops::BuildOperation;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolStatus {
    pub loading: bool,
    pub label: String,
}

impl ToolStatus {
    pub fn loading(label: impl Into<String>) -> Self {
        Self {
            loading: true,
            label: label.into(),
        }
    }

    pub fn done(label: impl Into<String>) -> Self {
        Self {
            loading: false,
            label: label.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolStatusData {
    pub tool_call_id: String,
    pub status: ToolStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    #[serde(rename_all = "camelCase")]
    Start { message_id: String },
    StartStep,
    FinishStep,
    Finish,
    TextStart { id: String },
    TextDelta { id: String, delta: String },
    TextEnd { id: String },
    #[serde(rename_all = "camelCase")]
    ToolInputStart {
        tool_call_id: String,
        tool_name: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolInputDelta {
        tool_call_id: String,
        input_text_delta: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolInputAvailable {
        tool_call_id: String,
        tool_name: String,
        input: Value,
    },
    DataBuildOp {
        transient: bool,
        data: BuildOperation,
    },
    DataToolStatus { id: String, data: ToolStatusData },
    #[serde(rename_all = "camelCase")]
    ToolOutputAvailable { tool_call_id: String, output: Value },
    #[serde(rename_all = "camelCase")]
    Error { error_text: String },
}

impl StreamEvent {
    pub fn build_op(op: BuildOperation) -> Self {
        StreamEvent::DataBuildOp {
            transient: true,
            data: op,
        }
    }

    /// Status updates for one tool call share an id so the client replaces them in place.
    pub fn tool_status(tool_call_id: &str, status: ToolStatus) -> Self {
        StreamEvent::DataToolStatus {
            id: format!("status-{}", tool_call_id),
            data: ToolStatusData {
                tool_call_id: tool_call_id.to_string(),
                status,
            },
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        StreamEvent::Error {
            error_text: text.into(),
        }
    }

    /// Render as one server-sent-event frame.
    pub fn to_sse_frame(&self) -> String {
        format!("data: {}\n\n", self.to_json())
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::warn!("Failed to serialize stream event: {}", e);
            r#"{"type":"error","errorText":"event serialization failed"}"#.to_string()
        })
    }
}

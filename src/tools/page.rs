//! The `updatePage` build tool.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Tool, ToolCategory, ToolContext, ToolOutput};
use crate::ops::memory::{summarize, BuildMemory};
use crate::ops::normalize::normalize;
use crate::ops::BuildOperation;
use crate::stream::events::ToolStatus;

pub const UPDATE_PAGE: &str = "updatePage";

pub struct UpdatePageTool;

impl UpdatePageTool {
    pub fn new() -> Self {
        Self
    }
}

/// Status attached to a finished page update.
pub fn finished_status(memory: &BuildMemory) -> ToolStatus {
    ToolStatus::done(memory.human_summary.clone())
}

/// Full tool result: `{build, status, memory}`.
pub fn page_update_output(build: &[BuildOperation], memory: &BuildMemory) -> Value {
    json!({
        "build": build,
        "status": finished_status(memory),
        "memory": memory,
    })
}

/// Validate a complete `build` array: invalid elements are dropped and only
/// the first `reset` survives.
pub fn validated_batch(raw: &[Value], reset_confirmed: bool) -> Vec<BuildOperation> {
    let mut saw_reset = false;
    raw.iter()
        .filter_map(|element| {
            let op = BuildOperation::from_value(element);
            if op.is_none() {
                tracing::debug!("Dropping invalid build element: {}", element);
            }
            op
        })
        .filter(|op| {
            if *op != BuildOperation::Reset {
                return true;
            }
            if saw_reset {
                return false;
            }
            if !reset_confirmed {
                tracing::warn!("Build contains reset without resetConfirmed");
            }
            saw_reset = true;
            true
        })
        .collect()
}

#[async_trait]
impl Tool for UpdatePageTool {
    fn name(&self) -> &str {
        UPDATE_PAGE
    }

    fn description(&self) -> &str {
        "Apply build operations to the page. Add components first, then update their props. \
         Only use reset when the user explicitly asked to start over and set resetConfirmed."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "description": {
                    "type": "string",
                    "description": "Short description of the change, in the user's language"
                },
                "resetConfirmed": {
                    "type": "boolean",
                    "description": "True only if the user confirmed clearing the whole page"
                },
                "build": {
                    "type": "array",
                    "description": "Operations applied in order",
                    "items": {
                        "type": "object",
                        "properties": {
                            "op": {
                                "type": "string",
                                "enum": ["reset", "updateRoot", "add", "update", "move", "delete"]
                            },
                            "type": {"type": "string", "description": "Component type (add)"},
                            "id": {"type": "string", "description": "Component id"},
                            "props": {"type": "object"},
                            "index": {"type": "integer", "minimum": 0},
                            "zone": {
                                "type": "string",
                                "description": "<parentId>:<slot>, root is \"root:default-zone\""
                            }
                        },
                        "required": ["op"]
                    }
                }
            },
            "required": ["description", "build"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let description = params
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let reset_confirmed = params
            .get("resetConfirmed")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let Some(raw) = params.get("build").and_then(Value::as_array) else {
            return Ok(ToolOutput::Error(
                "Missing required 'build' array".to_string(),
            ));
        };

        let batch = validated_batch(raw, reset_confirmed);
        let build = normalize(&batch, description, &ctx.document, &ctx.catalog);
        let memory = summarize(&build, description);
        Ok(ToolOutput::Json(page_update_output(&build, &memory)))
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Build
    }

    fn loading_label(&self) -> String {
        "Updating page…".to_string()
    }

    fn done_label(&self, output: &ToolOutput) -> String {
        match output {
            ToolOutput::Json(value) => value
                .pointer("/memory/humanSummary")
                .and_then(Value::as_str)
                .unwrap_or("Page updated")
                .to_string(),
            ToolOutput::Error(e) => format!("Page update failed: {}", e),
        }
    }
}

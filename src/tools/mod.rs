//! Tools the page-building agent can call.
//!
//! Two kinds exist:
//! - **Catalog** tools are read-only lookups (`getComponentDefinitions`,
//!   `getSectionExamples`). They run once their arguments are complete.
//! - **Build** tools (`updatePage`) mutate the page. While streaming, their
//!   operations are emitted incrementally by the session; `execute` is the
//!   non-streaming path over a complete batch.
//!
//! Each tool declares a JSON Schema for its parameters. The registry turns them
//! into OpenAI-format function definitions, letting the client override
//! descriptions and schemas per request.

pub mod catalog;
pub mod page;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::catalog::ComponentCatalog;
use crate::ops::DocumentIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolCategory {
    /// Read-only lookups that feed a later build round
    Catalog,
    /// Streams build operations into the page
    Build,
}

/// The result of executing a tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ToolOutput {
    Json(Value),
    Error(String),
}

impl ToolOutput {
    /// Convert to a string representation suitable for feeding back to the LLM
    pub fn to_llm_string(&self) -> String {
        match self {
            ToolOutput::Json(v) => serde_json::to_string(v).unwrap_or_else(|_| v.to_string()),
            ToolOutput::Error(e) => format!("[ERROR] {}", e),
        }
    }

    /// Value sent to the client in `tool-output-available`.
    pub fn to_client_value(&self) -> Value {
        match self {
            ToolOutput::Json(v) => v.clone(),
            ToolOutput::Error(e) => serde_json::json!({ "error": e }),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutput::Json(_))
    }
}

/// Per-request snapshot tools read from. Never mutated.
#[derive(Clone, Default)]
pub struct ToolContext {
    pub document: Arc<DocumentIndex>,
    pub catalog: Arc<ComponentCatalog>,
}

#[async_trait]
pub trait Tool: Send + Sync {
    /// Name used in function-calling (e.g. "updatePage")
    fn name(&self) -> &str;

    /// Human-readable description shown to the LLM
    fn description(&self) -> &str;

    /// JSON Schema describing the tool's parameters.
    fn parameters_schema(&self) -> Value;

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput>;

    fn category(&self) -> ToolCategory {
        ToolCategory::Catalog
    }

    /// Label of the status shown while the tool runs.
    fn loading_label(&self) -> String {
        format!("Running {}…", self.name())
    }

    /// Label of the status shown once the tool has produced `output`.
    fn done_label(&self, output: &ToolOutput) -> String {
        match output {
            ToolOutput::Json(_) => format!("{} finished", self.name()),
            ToolOutput::Error(e) => format!("{} failed: {}", self.name(), e),
        }
    }
}

/// OpenAI-format function definition for LLM function-calling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// OpenAI-format tool definition (wraps FunctionDef)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDef,
}

/// Tool description as sent by the editor with each request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientToolSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Option<Value>,
    #[serde(default)]
    pub output_schema: Option<Value>,
}

/// A completed tool call, arguments fully parsed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Result of a tool call, ready to feed back to the LLM
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub id: String,
    pub name: String,
    pub output: ToolOutput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDescriptor {
    pub name: String,
    pub category: ToolCategory,
    pub loading_label: String,
}

/// Registry of tools available to the agent, shared by all requests.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with the page-builder tools installed.
    pub async fn with_builtin_tools() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(page::UpdatePageTool::new())).await;
        registry
            .register(Arc::new(catalog::GetComponentDefinitionsTool::new()))
            .await;
        registry
            .register(Arc::new(catalog::GetSectionExamplesTool::new()))
            .await;
        registry
    }

    /// Register a tool. Overwrites any existing tool with the same name.
    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        tracing::info!(
            "Registered tool: {} (category: {:?})",
            name,
            tool.category()
        );
        self.tools.write().await.insert(name, tool);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    /// Snapshot of what the streaming session needs to know per tool.
    pub async fn descriptors(&self) -> Vec<ToolDescriptor> {
        let tools = self.tools.read().await;
        let mut descriptors: Vec<ToolDescriptor> = tools
            .values()
            .map(|tool| ToolDescriptor {
                name: tool.name().to_string(),
                category: tool.category(),
                loading_label: tool.loading_label(),
            })
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// OpenAI-format definitions, sorted by name.
    ///
    /// A client spec with the same name replaces the description and/or the
    /// parameter schema. Client specs for tools this backend cannot run are ignored.
    pub async fn tool_definitions(
        &self,
        client_specs: &HashMap<String, ClientToolSpec>,
    ) -> Vec<ToolDef> {
        let tools = self.tools.read().await;
        for name in client_specs.keys() {
            if !tools.contains_key(name) {
                tracing::warn!("Ignoring client tool '{}': no handler registered", name);
            }
        }

        let mut defs: Vec<ToolDef> = tools
            .values()
            .map(|tool| {
                let spec = client_specs.get(tool.name());
                ToolDef {
                    tool_type: "function".to_string(),
                    function: FunctionDef {
                        name: tool.name().to_string(),
                        description: spec
                            .and_then(|s| s.description.clone())
                            .unwrap_or_else(|| tool.description().to_string()),
                        parameters: spec
                            .and_then(|s| s.input_schema.clone())
                            .unwrap_or_else(|| tool.parameters_schema()),
                    },
                }
            })
            .collect();
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    pub async fn execute_call(&self, call: &ToolCall, ctx: &ToolContext) -> ToolCallResult {
        let tool = match self.get(&call.name).await {
            Some(t) => t,
            None => {
                return ToolCallResult {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    output: ToolOutput::Error(format!("Unknown tool: {}", call.name)),
                };
            }
        };

        let output = match tool.execute(call.arguments.clone(), ctx).await {
            Ok(output) => output,
            Err(e) => ToolOutput::Error(format!("Tool execution failed: {}", e)),
        };
        ToolCallResult {
            id: call.id.clone(),
            name: call.name.clone(),
            output,
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

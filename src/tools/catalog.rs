//! Read-only catalog tools the agent calls before building.
//!
//! - `getComponentDefinitions`: field definitions and defaults of named components.
//! - `getSectionExamples`: default props and a one-line summary per component.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Tool, ToolContext, ToolOutput};

pub const GET_COMPONENT_DEFINITIONS: &str = "getComponentDefinitions";
pub const GET_SECTION_EXAMPLES: &str = "getSectionExamples";

fn query_schema(description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "query": {
                "type": "string",
                "description": description
            }
        },
        "required": ["query"]
    })
}

fn query_param(params: &Value) -> Option<&str> {
    params
        .get("query")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|q| !q.is_empty())
}

/// "Loaded 2 component definition(s), 1 missing"
fn loaded_label(output: &ToolOutput, noun: &str) -> String {
    match output {
        ToolOutput::Json(value) => {
            let count = |key: &str| value.get(key).and_then(Value::as_array).map_or(0, Vec::len);
            let missing = count("missing");
            let mut label = format!("Loaded {} {}(s)", count("found"), noun);
            if missing > 0 {
                label.push_str(&format!(", {} missing", missing));
            }
            label
        }
        ToolOutput::Error(e) => format!("Could not load {}s: {}", noun, e),
    }
}

pub struct GetComponentDefinitionsTool;

impl GetComponentDefinitionsTool {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Tool for GetComponentDefinitionsTool {
    fn name(&self) -> &str {
        GET_COMPONENT_DEFINITIONS
    }

    fn description(&self) -> &str {
        "Fetch field definitions and default props for components by name before using them in updatePage."
    }

    fn parameters_schema(&self) -> Value {
        query_schema("Comma-separated component names, e.g. \"Heading, Button\"")
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let Some(query) = query_param(&params) else {
            return Ok(ToolOutput::Error(
                "Missing required 'query' parameter".to_string(),
            ));
        };
        Ok(ToolOutput::Json(ctx.catalog.definitions_for(query)))
    }

    fn loading_label(&self) -> String {
        "Loading component definitions…".to_string()
    }

    fn done_label(&self, output: &ToolOutput) -> String {
        loaded_label(output, "component definition")
    }
}

pub struct GetSectionExamplesTool;

impl GetSectionExamplesTool {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Tool for GetSectionExamplesTool {
    fn name(&self) -> &str {
        GET_SECTION_EXAMPLES
    }

    fn description(&self) -> &str {
        "Fetch example default props and a short summary for section components by name."
    }

    fn parameters_schema(&self) -> Value {
        query_schema("Comma-separated section component names, e.g. \"Hero, Footer\"")
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let Some(query) = query_param(&params) else {
            return Ok(ToolOutput::Error(
                "Missing required 'query' parameter".to_string(),
            ));
        };
        Ok(ToolOutput::Json(ctx.catalog.section_examples_for(query)))
    }

    fn loading_label(&self) -> String {
        "Loading section examples…".to_string()
    }

    fn done_label(&self, output: &ToolOutput) -> String {
        loaded_label(output, "section example")
    }
}

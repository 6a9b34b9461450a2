use std::sync::Arc;

use anyhow::{Context, Result};
use puck_agent::chat::PageAgent;
use puck_agent::config::AgentConfig;
use puck_agent::function::{handle_event, FunctionEvent, FunctionOutcome};
use puck_agent::llm_client::LlmClient;
use puck_agent::server::load_auth_config;
use puck_agent::tools::ToolRegistry;
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // stdout carries the event stream; logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,puck_agent=debug")),
        )
        .init();

    let config = AgentConfig::load();
    let auth = load_auth_config()?;
    let client = LlmClient::new(&config).context("failed to create LLM client")?;

    let rt = tokio::runtime::Runtime::new().context("failed to start function runtime")?;
    let outcome = rt.block_on(async move {
        let mut raw = String::new();
        tokio::io::stdin()
            .read_to_string(&mut raw)
            .await
            .context("Failed to read invocation event from stdin")?;
        let event: FunctionEvent =
            serde_json::from_str(&raw).context("Invocation event is not valid JSON")?;

        let registry = Arc::new(ToolRegistry::with_builtin_tools().await);
        let agent = PageAgent::new(config, Arc::new(client), registry);
        let mut stdout = tokio::io::stdout();
        handle_event(&agent, &auth, event, &mut stdout).await
    })?;

    match outcome {
        FunctionOutcome::Streamed => Ok(()),
        FunctionOutcome::Unauthorized => anyhow::bail!("Unauthorized"),
        FunctionOutcome::BadRequest(reason) => anyhow::bail!("Bad request: {}", reason),
    }
}

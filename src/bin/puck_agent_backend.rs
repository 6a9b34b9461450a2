use std::sync::Arc;

use anyhow::{Context, Result};
use puck_agent::chat::PageAgent;
use puck_agent::config::AgentConfig;
use puck_agent::llm_client::LlmClient;
use puck_agent::server::serve_backend;
use puck_agent::tools::ToolRegistry;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,puck_agent=debug")),
        )
        .init();

    let config = AgentConfig::load();
    let client = LlmClient::new(&config).context("failed to create LLM client")?;

    tracing::info!(
        "Starting page agent backend (model {}; set PUCK_AGENT_API_KEY + optional PUCK_AGENT_BIND; auth mode via PUCK_AGENT_AUTH_MODE)",
        config.llm_model
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(async move {
        let registry = Arc::new(ToolRegistry::with_builtin_tools().await);
        let agent = Arc::new(PageAgent::new(config, Arc::new(client), registry));
        serve_backend(agent).await
    })
}

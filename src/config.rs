use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Completion rounds per request; the loop ends early once the page is built.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
    /// Longest silence tolerated between two upstream chunks.
    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,
    /// Build memories from earlier turns repeated to the model.
    #[serde(default = "default_memory_history_limit")]
    pub memory_history_limit: usize,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_llm_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_max_tool_rounds() -> usize {
    3
}

fn default_upstream_timeout_secs() -> u64 {
    90
}

fn default_memory_history_limit() -> usize {
    2
}

fn default_system_prompt() -> String {
    "You edit a page built from components. Change the page only by calling updatePage \
     with a short description and a build array of operations: reset, updateRoot, add, \
     update, move, delete. Use component ids from the current page. Create a component \
     with add (type, id, index, zone) before updating its props. Zones are \
     \"<parentId>:<slot>\"; the page root is \"root:default-zone\". If you are unsure \
     which fields a component has, call getComponentDefinitions or getSectionExamples \
     first. Only use reset when the user explicitly asks to start over, and then set \
     resetConfirmed to true. Reply in the user's language."
        .to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            max_tool_rounds: default_max_tool_rounds(),
            upstream_timeout_secs: default_upstream_timeout_secs(),
            memory_history_limit: default_memory_history_limit(),
            system_prompt: default_system_prompt(),
        }
    }
}

impl AgentConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("puck_agent.toml")
    }

    /// Load puck_agent.toml (next to the executable), then apply env overrides.
    pub fn load() -> Self {
        let path = Self::config_path();
        let mut config = if path.exists() {
            match Self::load_from(&path) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    config
                }
                Err(e) => {
                    tracing::error!("{:#}", e);
                    Self::default()
                }
            }
        } else {
            tracing::info!("No config file at {:?}, using defaults + env vars", path);
            Self::default()
        };
        config.apply_overrides(|key| env::var(key).ok());
        config
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        toml::from_str(&contents).with_context(|| format!("Failed to parse {:?}", path))
    }

    /// Apply overrides looked up by environment variable name. Values that do
    /// not parse are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("LLM_API_URL") {
            self.llm_api_url = url;
        }

        if let Some(model) = lookup("LLM_MODEL") {
            self.llm_model = model;
        }

        if let Some(key) = lookup("LLM_API_KEY") {
            if !key.trim().is_empty() {
                self.llm_api_key = Some(key);
            }
        }

        override_parsed(&lookup, "LLM_TEMPERATURE", &mut self.temperature);
        override_parsed(&lookup, "LLM_MAX_TOKENS", &mut self.max_tokens);
        override_parsed(&lookup, "PUCK_AGENT_MAX_TOOL_ROUNDS", &mut self.max_tool_rounds);
        override_parsed(
            &lookup,
            "PUCK_AGENT_UPSTREAM_TIMEOUT_SECS",
            &mut self.upstream_timeout_secs,
        );
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs.max(1))
    }
}

fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!("Ignoring {}={:?}: not a valid value", key, raw),
    }
}

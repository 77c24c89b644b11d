//! Configuration management for analyst-chat

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable that gates per-run telemetry records
pub const TELEMETRY_ENV: &str = "ANALYST_CHAT_TELEMETRY";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub server: ServerConfig,
    pub agent: AgentConfig,
    pub memory: MemoryConfig,
    pub storage: StorageConfig,
    pub tools: ToolsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider used for every model reference (gemini, scripted)
    pub provider: String,
    /// Model used for general responses, memory classification and management
    pub model: String,
    /// Model used for session summarization
    pub summary_model: String,
    pub max_tokens: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "gemini".to_string(),
            model: "gemini-2.0-flash".to_string(),
            summary_model: "gemini-2.5-pro".to_string(),
            max_tokens: 8192,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub launch_browser: bool,
    pub reload: bool,
    pub log_level: String,
    /// Directory served at /static when reload is on (embedded assets otherwise)
    pub static_dir: String,
    /// Chat sessions without activity for this long are closed
    pub session_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            launch_browser: true,
            reload: true,
            log_level: "debug".to_string(),
            static_dir: "static".to_string(),
            session_idle_timeout_secs: 30 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub description: String,
    pub instructions: Vec<String>,
    pub markdown: bool,
    pub add_datetime_to_instructions: bool,
    pub add_history_to_messages: bool,
    pub num_history_responses: usize,
    pub max_iterations: usize,
    pub show_tool_calls: bool,
    pub telemetry: bool,
    pub user_id: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            description: "You are an expert data analyst using SQL over local data.".to_string(),
            instructions: default_instructions(),
            markdown: true,
            add_datetime_to_instructions: true,
            add_history_to_messages: true,
            num_history_responses: 15,
            max_iterations: 10,
            show_tool_calls: true,
            telemetry: false,
            user_id: None,
        }
    }
}

fn default_instructions() -> Vec<String> {
    [
        "You are a multipurpose chat assistant.",
        "You have access to local files, a SQL database and the internet.",
        "If asked about local files, use your file tools to list ONLY .csv or .json files. Never list other files.",
        "You can use the SQL tools to take data from any source, create a table and describe it for context on the data.",
        "Use your SQL tools to analyze and answer questions.",
        "Pay attention to columns with special characters or spaces since they will need to be quoted when accessing.",
        "You can then use SQL to answer questions.",
        "You can also search the internet with DuckDuckGo.",
        "Never send any local files to the internet/search, or to the AI model directly.",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub db_file: String,
    pub create_user_memories: bool,
    pub create_session_summary: bool,
    pub update_user_memories_after_run: bool,
    pub update_session_summary_after_run: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            db_file: "tmp/agent_memory.db".to_string(),
            create_user_memories: true,
            create_session_summary: true,
            update_user_memories_after_run: true,
            update_session_summary_after_run: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_file: String,
    pub table_name: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_file: "tmp/agent_storage.db".to_string(),
            table_name: "chat_agent".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub save_files: bool,
    pub read_files: bool,
    pub list_files: bool,
    pub web_search_results: usize,
    pub tool_timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            save_files: true,
            read_files: true,
            list_files: true,
            web_search_results: 5,
            tool_timeout_secs: 60,
        }
    }
}

impl Config {
    /// Load configuration from default location or create default
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "analyst-chat") {
            let config_dir = proj_dirs.config_dir();
            std::fs::create_dir_all(config_dir)?;
            Ok(config_dir.join("config.toml"))
        } else {
            Ok(PathBuf::from("config.toml"))
        }
    }
}

/// Whether per-run telemetry may be emitted.
///
/// The process disables this at startup; a config flag alone cannot turn it on.
pub fn telemetry_enabled(config_flag: bool) -> bool {
    if !config_flag {
        return false;
    }
    match std::env::var(TELEMETRY_ENV) {
        Ok(value) => !matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "false" | "0" | "no" | "off" | ""
        ),
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_agent_settings() {
        let config = Config::default();
        assert_eq!(config.agent.num_history_responses, 15);
        assert_eq!(config.storage.table_name, "chat_agent");
        assert_eq!(config.storage.db_file, "tmp/agent_storage.db");
        assert_eq!(config.memory.db_file, "tmp/agent_memory.db");
        assert!(config.memory.update_session_summary_after_run);
        assert!(config.server.launch_browser);
        assert!(config.server.reload);
        assert_ne!(config.llm.model, config.llm.summary_model);
    }

    #[test]
    fn test_instructions_forbid_sending_files() {
        let config = Config::default();
        assert!(config
            .agent
            .instructions
            .iter()
            .any(|i| i.starts_with("Never send any local files")));
        assert!(config
            .agent
            .instructions
            .iter()
            .any(|i| i.contains(".csv or .json")));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 9100

            [llm]
            provider = "scripted"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.session_idle_timeout_secs, 1800);
        assert_eq!(config.llm.provider, "scripted");
        assert_eq!(config.llm.model, "gemini-2.0-flash");
        assert_eq!(config.agent.num_history_responses, 15);
    }

    #[test]
    fn test_telemetry_off_when_config_flag_off() {
        assert!(!telemetry_enabled(false));
    }
}

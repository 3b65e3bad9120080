//! Runtime configuration (`cowork-runtime.yaml`).
//!
//! ```yaml
//! model:
//!   base_url: ${COWORK_MODEL_URL:-http://localhost:11434/v1}
//!   model_name: qwen2.5:7b-instruct
//! agent:
//!   max_iterations: 10
//! context:
//!   token_threshold: 24000
//! servers:
//!   web:
//!     command: python3
//!     args: ["-m", "web_tools"]
//!     cwd: ~/tools
//! logging:
//!   filter: cowork_runtime=debug
//! ```
//!
//! `${VAR}` and `${VAR:-default}` are substituted before parsing. Every
//! section and field has a default, so an empty file is a valid config.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::Deserialize;
use thiserror::Error;

use crate::agent_core::{AgentSettings, ContextSettings, ToolRegistry};
use crate::inference::config::ModelConfig;
use crate::logging::LoggingConfig;
use crate::mcp_client::ServerConfig;

/// File name searched for by [`find_config_path`].
pub const CONFIG_FILE_NAME: &str = "cowork-runtime.yaml";

/// Points directly at a config file, overriding the upward search.
pub const CONFIG_ENV_VAR: &str = "COWORK_RUNTIME_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("could not find cowork-runtime.yaml in {start} or any parent")]
    NotFound { start: String },
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub model: ModelConfig,
    pub agent: AgentSettings,
    pub context: ContextSettings,
    /// Keyed by provider name.
    pub servers: BTreeMap<String, ServerConfig>,
    pub logging: LoggingConfig,
}

impl RuntimeConfig {
    /// Parse YAML text (after env interpolation).
    pub fn from_yaml_str(raw: &str) -> Result<Self, serde_yaml::Error> {
        let interpolated = interpolate_env_vars(raw);
        if interpolated.trim().is_empty() {
            return Ok(Self::default());
        }
        let mut config: RuntimeConfig = serde_yaml::from_str(&interpolated)?;
        config.normalize();
        Ok(config)
    }

    fn normalize(&mut self) {
        for (name, server) in self.servers.iter_mut() {
            server.name = name.clone();
            server.cwd = server.cwd.as_deref().map(expand_tilde);
        }
        self.logging.directory = self.logging.directory.as_deref().map(expand_tilde);
    }

    /// Server configs with their names filled in, sorted by name.
    pub fn server_configs(&self) -> Vec<ServerConfig> {
        self.servers.values().cloned().collect()
    }

    /// Register every configured server with `registry` (without connecting).
    pub fn register_servers(&self, registry: &mut ToolRegistry) {
        for server in self.server_configs() {
            registry.register_external(server);
        }
    }
}

/// Load and parse a config file.
pub fn load_config(path: &Path) -> Result<RuntimeConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let config = RuntimeConfig::from_yaml_str(&raw).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    tracing::debug!(
        path = %path.display(),
        servers = config.servers.len(),
        model = %config.model.model_name,
        "runtime config loaded"
    );
    Ok(config)
}

/// Locate the config file.
///
/// `COWORK_RUNTIME_CONFIG` wins when it names an existing file; otherwise
/// `start` and its ancestors are searched for `cowork-runtime.yaml`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, ConfigError> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&explicit));
        if candidate.is_file() {
            return Ok(candidate);
        }
        tracing::warn!(
            path = %candidate.display(),
            env = CONFIG_ENV_VAR,
            "config override does not name a file, searching upward"
        );
    }

    start
        .ancestors()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| ConfigError::NotFound {
            start: start.display().to_string(),
        })
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("valid regex")
    })
}

/// Replace `${VAR}` (empty when unset) and `${VAR:-default}`.
fn interpolate_env_vars(input: &str) -> String {
    env_var_pattern()
        .replace_all(input, |caps: &Captures| {
            match (std::env::var(&caps[1]), caps.get(2)) {
                (Ok(value), _) => value,
                (Err(_), Some(default)) => expand_tilde(default.as_str()),
                (Err(_), None) => String::new(),
            }
        })
        .into_owned()
}

/// Expand a leading `~` to the home directory.
fn expand_tilde(path: &str) -> String {
    match (path.strip_prefix('~'), dirs::home_dir()) {
        (Some(rest), Some(home)) if rest.is_empty() || rest.starts_with('/') => {
            format!("{}{rest}", home.display())
        }
        _ => path.to_string(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_file_is_default() {
        let config = RuntimeConfig::from_yaml_str("").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.agent.max_iterations, 10);
        assert_eq!(config.context.recent_keep_count, 20);
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
model:
  base_url: http://gpu-box:8080/v1
  model_name: llama3
agent:
  max_iterations: 4
context:
  token_threshold: 8000
servers:
  web:
    command: python3
    args: ["-m", "web_tools"]
    call_timeout_secs: 10
  docs:
    command: node
logging:
  filter: debug
  json: true
"#;
        let config = RuntimeConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.model.model_name, "llama3");
        assert_eq!(config.model.max_tokens, 2048);
        assert_eq!(config.agent.max_iterations, 4);
        assert_eq!(config.agent.max_tool_result_chars, 6000);
        assert_eq!(config.context.token_threshold, 8000);
        assert!(config.logging.json);

        let servers = config.server_configs();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].name, "docs");
        assert_eq!(servers[1].name, "web");
        assert_eq!(servers[1].call_timeout_secs, 10);
        assert_eq!(servers[1].handshake_timeout_secs, 30);
    }

    #[test]
    fn test_interpolation_with_default() {
        std::env::remove_var("__COWORK_TEST_UNSET__");
        assert_eq!(
            interpolate_env_vars("url: ${__COWORK_TEST_UNSET__:-http://localhost:1234/v1}"),
            "url: http://localhost:1234/v1"
        );
        assert_eq!(interpolate_env_vars("x${__COWORK_TEST_UNSET__}y"), "xy");
    }

    #[test]
    fn test_interpolation_with_value() {
        std::env::set_var("__COWORK_TEST_MODEL__", "mistral");
        let config =
            RuntimeConfig::from_yaml_str("model:\n  model_name: ${__COWORK_TEST_MODEL__:-llama3}\n")
                .unwrap();
        assert_eq!(config.model.model_name, "mistral");
        std::env::remove_var("__COWORK_TEST_MODEL__");
    }

    #[test]
    fn test_plain_dollar_is_untouched() {
        assert_eq!(interpolate_env_vars("costs $5 and ${ not a var"), "costs $5 and ${ not a var");
    }

    #[test]
    fn test_tilde_expansion() {
        let expanded = expand_tilde("~/tools");
        assert!(!expanded.starts_with('~'));
        assert!(expanded.ends_with("/tools"));
        assert_eq!(expand_tilde("~user/x"), "~user/x");
        assert_eq!(expand_tilde("/abs"), "/abs");
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "servers:\n  fs:\n    command: fs-tools\n    cwd: ~/data").unwrap();

        let config = load_config(&path).unwrap();
        let server = &config.servers["fs"];
        assert_eq!(server.name, "fs");
        assert!(!server.cwd.as_deref().unwrap().starts_with('~'));
    }

    #[test]
    fn test_load_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yaml");
        assert!(matches!(load_config(&missing), Err(ConfigError::Read { .. })));

        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "agent: 5\n").unwrap();
        assert!(matches!(load_config(&bad), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_find_config_path_walks_upward() {
        std::env::remove_var(CONFIG_ENV_VAR);
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "").unwrap();

        let found = find_config_path(&nested).unwrap();
        assert_eq!(found, dir.path().join(CONFIG_FILE_NAME));
    }

    #[test]
    fn test_register_servers_defers_connection() {
        let config =
            RuntimeConfig::from_yaml_str("servers:\n  web:\n    command: /nonexistent/web\n").unwrap();
        let mut registry = ToolRegistry::new();
        config.register_servers(&mut registry);
        assert!(registry.is_empty());
        assert!(registry.connected_servers().is_empty());
    }
}

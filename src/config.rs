//! Configuration management
//!
//! Precedence, lowest to highest: built-in defaults, an optional TOML file,
//! then environment variables. The orchestration core never reads this type;
//! it receives the plain values produced by the helper methods below.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::agent::AgentConfig;
use crate::pipeline::PipelineLimits;
use crate::router::KeywordModelSelector;
use crate::sandbox::ValidatorConfig;
use crate::workflows::GenerationSettings;

/// Environment variable naming an optional TOML config file
pub const CONFIG_ENV: &str = "CODEFORGE_CONFIG";

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Ollama base URL
    pub ollama_url: String,
    /// Model for the balanced tier and the default primary
    pub primary_model: String,
    /// Second entry of every model chain
    pub fallback_model: String,
    /// Model for the fast tier; empty means `primary_model`
    pub fast_model: String,
    /// Model for the deep tier; empty means `primary_model`
    pub deep_model: String,
    pub temperature: f32,

    /// Root every file path is resolved against
    pub workspace_root: String,

    /// Maximum node executions per pipeline run
    pub step_limit: usize,
    /// Improvement retries after the first attempt
    pub max_retries: u32,
    pub validation_timeout_secs: u64,
    /// When false validation is limited to the static delimiter check
    pub run_validation_commands: bool,
    /// Write validated improvements to disk
    pub auto_write: bool,

    /// Agent iterations before the loop stops with a partial answer
    pub max_iterations: usize,
    /// Agent history budget in tokens
    pub history_tokens: usize,

    pub retrieval_limit: usize,
    pub retrieval_min_score: f32,
    /// "hashing" (local, offline) or "ollama"
    pub embedder: String,

    /// Bounded event channel size for streaming runs
    pub channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ollama_url: "http://localhost:11434".to_string(),
            primary_model: "qwen2.5-coder:7b".to_string(),
            fallback_model: "llama3.2:3b".to_string(),
            fast_model: String::new(),
            deep_model: String::new(),
            temperature: 0.2,
            workspace_root: ".".to_string(),
            step_limit: 32,
            max_retries: 3,
            validation_timeout_secs: 30,
            run_validation_commands: true,
            auto_write: false,
            max_iterations: 8,
            history_tokens: 6_000,
            retrieval_limit: 5,
            retrieval_min_score: 0.25,
            embedder: "hashing".to_string(),
            channel_capacity: 64,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_into<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid value for {}: '{}'", key, value))
}

impl EngineConfig {
    /// Load defaults, then `path` (or `$CODEFORGE_CONFIG`), then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from));

        let mut config = match file {
            Some(file) => Self::from_file(&file)?,
            None => Self::default(),
        };
        config.apply_env_from(|key| std::env::var(key).ok())?;
        config.expand_paths()?;

        info!(
            "Config: ollama={}, models=[{}, {}], workspace={}",
            config.ollama_url, config.primary_model, config.fallback_model, config.workspace_root
        );
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        debug!("Loaded config file {}", path.display());
        Ok(config)
    }

    /// Overlay `CODEFORGE_*` and `OLLAMA_URL` values from `lookup`
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("OLLAMA_URL") {
            self.ollama_url = v;
        }
        if let Some(v) = lookup("CODEFORGE_OLLAMA_URL") {
            self.ollama_url = v;
        }
        if let Some(v) = lookup("CODEFORGE_PRIMARY_MODEL") {
            self.primary_model = v;
        }
        if let Some(v) = lookup("CODEFORGE_FALLBACK_MODEL") {
            self.fallback_model = v;
        }
        if let Some(v) = lookup("CODEFORGE_FAST_MODEL") {
            self.fast_model = v;
        }
        if let Some(v) = lookup("CODEFORGE_DEEP_MODEL") {
            self.deep_model = v;
        }
        if let Some(v) = lookup("CODEFORGE_WORKSPACE") {
            self.workspace_root = v;
        }
        if let Some(v) = lookup("CODEFORGE_EMBEDDER") {
            self.embedder = v;
        }

        if let Some(v) = lookup("CODEFORGE_TEMPERATURE") {
            self.temperature = parse_into("CODEFORGE_TEMPERATURE", &v)?;
        }
        if let Some(v) = lookup("CODEFORGE_STEP_LIMIT") {
            self.step_limit = parse_into("CODEFORGE_STEP_LIMIT", &v)?;
        }
        if let Some(v) = lookup("CODEFORGE_MAX_RETRIES") {
            self.max_retries = parse_into("CODEFORGE_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("CODEFORGE_VALIDATION_TIMEOUT") {
            self.validation_timeout_secs = parse_into("CODEFORGE_VALIDATION_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("CODEFORGE_MAX_ITERATIONS") {
            self.max_iterations = parse_into("CODEFORGE_MAX_ITERATIONS", &v)?;
        }
        if let Some(v) = lookup("CODEFORGE_HISTORY_TOKENS") {
            self.history_tokens = parse_into("CODEFORGE_HISTORY_TOKENS", &v)?;
        }
        if let Some(v) = lookup("CODEFORGE_RETRIEVAL_LIMIT") {
            self.retrieval_limit = parse_into("CODEFORGE_RETRIEVAL_LIMIT", &v)?;
        }
        if let Some(v) = lookup("CODEFORGE_RETRIEVAL_MIN_SCORE") {
            self.retrieval_min_score = parse_into("CODEFORGE_RETRIEVAL_MIN_SCORE", &v)?;
        }
        if let Some(v) = lookup("CODEFORGE_CHANNEL_CAPACITY") {
            self.channel_capacity = parse_into("CODEFORGE_CHANNEL_CAPACITY", &v)?;
        }

        if let Some(v) = lookup("CODEFORGE_AUTO_WRITE") {
            self.auto_write = parse_bool(&v).unwrap_or(self.auto_write);
        }
        if let Some(v) = lookup("CODEFORGE_RUN_VALIDATION") {
            self.run_validation_commands = parse_bool(&v).unwrap_or(self.run_validation_commands);
        }

        Ok(())
    }

    /// Expand `~` and `$VAR` in the workspace root
    fn expand_paths(&mut self) -> Result<()> {
        let expanded = shellexpand::full(&self.workspace_root)
            .with_context(|| format!("Failed to expand workspace path '{}'", self.workspace_root))?;
        self.workspace_root = expanded.into_owned();
        Ok(())
    }

    pub fn workspace_path(&self) -> PathBuf {
        PathBuf::from(&self.workspace_root)
    }

    pub fn pipeline_limits(&self) -> PipelineLimits {
        PipelineLimits {
            step_limit: self.step_limit,
            channel_capacity: self.channel_capacity,
        }
    }

    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            max_iterations: self.max_iterations,
            history_tokens: self.history_tokens,
            retrieval_limit: self.retrieval_limit,
            retrieval_min_score: self.retrieval_min_score,
            channel_capacity: self.channel_capacity,
            ..Default::default()
        }
    }

    pub fn validator_config(&self) -> ValidatorConfig {
        ValidatorConfig {
            timeout: Duration::from_secs(self.validation_timeout_secs),
            run_commands: self.run_validation_commands,
            ..Default::default()
        }
    }

    pub fn generation_settings(&self) -> GenerationSettings {
        GenerationSettings {
            temperature: self.temperature,
            retrieval_limit: self.retrieval_limit,
            retrieval_min_score: self.retrieval_min_score,
        }
    }

    pub fn selector(&self) -> KeywordModelSelector {
        let or_primary = |m: &str| {
            if m.trim().is_empty() {
                self.primary_model.clone()
            } else {
                m.to_string()
            }
        };
        KeywordModelSelector::new(
            &or_primary(&self.fast_model),
            &self.primary_model,
            &or_primary(&self.deep_model),
            &self.fallback_model,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::ModelTier;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_file_then_env_precedence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("codeforge.toml");
        std::fs::write(
            &path,
            "primary_model = \"from-file\"\nmax_retries = 5\nauto_write = true\n",
        )
        .unwrap();

        let mut config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.primary_model, "from-file");
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.step_limit, 32);

        let env: HashMap<&str, &str> = [
            ("CODEFORGE_MAX_RETRIES", "1"),
            ("OLLAMA_URL", "http://gpu-box:11434"),
            ("CODEFORGE_AUTO_WRITE", "no"),
        ]
        .into_iter()
        .collect();
        config
            .apply_env_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.primary_model, "from-file");
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.ollama_url, "http://gpu-box:11434");
        assert!(!config.auto_write);
    }

    #[test]
    fn test_bad_number_is_an_error() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_env_from(|k| (k == "CODEFORGE_STEP_LIMIT").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("CODEFORGE_STEP_LIMIT"));
    }

    #[test]
    fn test_derived_values() {
        let config = EngineConfig {
            deep_model: "big".into(),
            max_iterations: 3,
            validation_timeout_secs: 7,
            ..Default::default()
        };

        let selector = config.selector();
        assert_eq!(selector.model_for(ModelTier::Deep), "big");
        assert_eq!(selector.model_for(ModelTier::Fast), config.primary_model);
        assert_eq!(config.agent_config().max_iterations, 3);
        assert_eq!(config.validator_config().timeout, Duration::from_secs(7));
        assert_eq!(config.pipeline_limits().step_limit, 32);
    }

    #[test]
    fn test_workspace_tilde_expanded() {
        let mut config = EngineConfig {
            workspace_root: "~/projects".into(),
            ..Default::default()
        };
        config.expand_paths().unwrap();
        assert!(!config.workspace_root.starts_with('~'));
        assert!(config.workspace_root.ends_with("projects"));
    }
}

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::PipelineError;
use crate::util::SecretString;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub github: GitHubConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// "openai", "openai-compatible", "anthropic" or "gemini"
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>, // For OpenAI-compatible APIs

    /// Optional: Override max_tokens for completions.
    /// If not specified, uses provider-specific defaults.
    #[serde(default)]
    pub max_tokens: Option<u32>,

    /// HTTP timeout for one backend request
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,

    /// Extra fields merged into OpenAI-compatible request bodies
    #[serde(default)]
    pub extra_body: HashMap<String, serde_json::Value>,
}

impl LlmConfig {
    /// Get max_tokens value, using provider-specific default if not specified
    pub fn get_max_tokens(&self) -> u32 {
        if let Some(tokens) = self.max_tokens {
            return tokens;
        }

        match self.provider.as_str() {
            "anthropic" => 8192,
            "openai" => 16384,
            "openai-compatible" => 16384,
            "gemini" => 8192,
            _ => 4096,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            base_url: None,
            max_tokens: None,
            timeout_secs: default_request_timeout(),
            extra_body: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Model whose token encoding drives every budget computation
    #[serde(default = "default_encoding_model")]
    pub encoding_model: String,

    /// Total model context the chunk budget is carved from
    #[serde(default = "default_context_tokens")]
    pub context_tokens: usize,

    /// Allowance kept free for the instruction template
    #[serde(default = "default_reserved_prompt_tokens")]
    pub reserved_prompt_tokens: usize,

    /// Concurrent backend calls within one stage (1 = sequential)
    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,

    /// Ceiling on a single backend invocation, including retries inside the client
    #[serde(default = "default_chunk_timeout")]
    pub chunk_timeout_secs: u64,

    /// Upper bound on requirement-text chunks; Stage 3 calls = code chunks x this
    #[serde(default = "default_max_requirement_chunks")]
    pub max_requirement_chunks: usize,

    #[serde(default)]
    pub prompts: PromptsConfig,
}

impl PipelineConfig {
    /// Token budget per chunk: total context minus the reserved prompt allowance.
    pub fn safe_budget(&self) -> Result<usize, PipelineError> {
        match self.context_tokens.checked_sub(self.reserved_prompt_tokens) {
            Some(budget) if budget > 0 => Ok(budget),
            _ => Err(PipelineError::config(format!(
                "chunk budget must be positive (context_tokens={}, reserved_prompt_tokens={})",
                self.context_tokens, self.reserved_prompt_tokens
            ))),
        }
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            encoding_model: default_encoding_model(),
            context_tokens: default_context_tokens(),
            reserved_prompt_tokens: default_reserved_prompt_tokens(),
            max_concurrency: default_concurrency(),
            chunk_timeout_secs: default_chunk_timeout(),
            max_requirement_chunks: default_max_requirement_chunks(),
            prompts: PromptsConfig::default(),
        }
    }
}

/// Extra instructions appended to each stage's template.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PromptsConfig {
    #[serde(default)]
    pub stack_custom: Option<String>,
    #[serde(default)]
    pub units_custom: Option<String>,
    #[serde(default)]
    pub cases_custom: Option<String>,
    #[serde(default)]
    pub code_custom: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_python")]
    pub python: String,
    #[serde(default = "default_npm")]
    pub npm: String,
    #[serde(default = "default_npx")]
    pub npx: String,

    /// Create a virtualenv / install jest before running (default: true)
    #[serde(default = "default_true")]
    pub setup_env: bool,

    #[serde(default = "default_install_timeout")]
    pub install_timeout_secs: u64,

    /// Timeout for one runner invocation in seconds (default: 300)
    #[serde(default = "default_test_timeout")]
    pub test_timeout_secs: u64,
}

impl RunnerConfig {
    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            python: default_python(),
            npm: default_npm(),
            npx: default_npx(),
            setup_env: true,
            install_timeout_secs: default_install_timeout(),
            test_timeout_secs: default_test_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    #[serde(default = "default_github_api")]
    pub api_url: String,
    #[serde(default = "default_github_graphql")]
    pub graphql_url: String,
    #[serde(default = "default_github_token_env")]
    pub token_env: String,

    /// GitHub App id; when set together with `private_key_path`, installation
    /// tokens are minted instead of reading `token_env`.
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,

    #[serde(default = "default_author_email")]
    pub author_email: String,
}

impl GitHubConfig {
    pub fn uses_app_auth(&self) -> bool {
        self.app_id.is_some() && self.private_key_path.is_some()
    }

    /// Personal/installation token from the configured environment variable
    pub fn token(&self) -> Result<SecretString> {
        env::var(&self.token_env)
            .map(SecretString::from)
            .map_err(|_| anyhow::anyhow!("GitHub token not found in environment variable: {}", self.token_env))
    }
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_url: default_github_api(),
            graphql_url: default_github_graphql(),
            token_env: default_github_token_env(),
            app_id: None,
            private_key_path: None,
            author_email: default_author_email(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Env var holding the shared secret for X-Hub-Signature-256 checks
    #[serde(default)]
    pub secret_env: Option<String>,

    /// Clone the pushed commit and execute the generated tests
    #[serde(default = "default_true")]
    pub run_tests: bool,

    /// Directory receiving one JSON report per processed push
    #[serde(default)]
    pub report_dir: Option<PathBuf>,
}

impl WebhookConfig {
    pub fn secret(&self) -> Result<Option<SecretString>> {
        match &self.secret_env {
            Some(var) => env::var(var)
                .map(|s| Some(SecretString::from(s)))
                .with_context(|| format!("Webhook secret not found in environment variable: {}", var)),
            None => Ok(None),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            secret_env: None,
            run_tests: true,
            report_dir: None,
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini-2024-07-18".to_string()
}

fn default_api_key_env() -> Option<String> {
    Some("OPENAI_API_KEY".to_string())
}

fn default_request_timeout() -> u64 {
    120
}

fn default_encoding_model() -> String {
    "gpt-3.5-turbo".to_string()
}

fn default_context_tokens() -> usize {
    16000
}

fn default_reserved_prompt_tokens() -> usize {
    1000
}

fn default_concurrency() -> usize {
    1
}

fn default_chunk_timeout() -> u64 {
    180
}

fn default_max_requirement_chunks() -> usize {
    8
}

fn default_python() -> String {
    "python3".to_string()
}

fn default_npm() -> String {
    "npm".to_string()
}

fn default_npx() -> String {
    "npx".to_string()
}

fn default_install_timeout() -> u64 {
    600
}

fn default_test_timeout() -> u64 {
    300
}

fn default_github_api() -> String {
    "https://api.github.com".to_string()
}

fn default_github_graphql() -> String {
    "https://api.github.com/graphql".to_string()
}

fn default_github_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

fn default_author_email() -> String {
    "repotest@users.noreply.github.com".to_string()
}

fn default_bind() -> String {
    "0.0.0.0:5000".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load config from repo root or user config directory
    pub fn load() -> Result<Self> {
        Self::load_with_path(None)
    }

    /// Load configuration from a specific path, or use default search paths
    pub fn load_with_path(path: Option<String>) -> Result<Self> {
        if let Some(config_path) = path {
            debug!("Loading config from explicit path: {}", config_path);
            return Self::load_from_path(&config_path)
                .with_context(|| format!("Failed to load config from {}", config_path));
        }

        if let Ok(config) = Self::load_from_path("repotest.toml") {
            debug!("Loaded config from ./repotest.toml");
            return Ok(config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let config_path = config_dir.join("repotest").join("config.toml");
            if let Ok(config) = Self::load_from_path(&config_path) {
                debug!("Loaded config from {:?}", config_path);
                return Ok(config);
            }
        }

        debug!("Using default config");
        Ok(Self::default())
    }

    fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Get API key from environment variable specified in config
    pub fn get_api_key(&self) -> Result<String> {
        match &self.llm.api_key_env {
            Some(env_var) => {
                // "none" means no API key needed (e.g., Ollama)
                if env_var.to_lowercase() == "none" {
                    return Ok(String::new());
                }

                // Local models don't need keys, gateways do
                if self.llm.provider == "openai-compatible" {
                    return Ok(env::var(env_var).unwrap_or_default());
                }

                env::var(env_var).map_err(|_| {
                    anyhow::anyhow!("API key not found in environment variable: {}", env_var)
                })
            }
            None => Ok(String::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.llm.provider, "openai");
        assert_eq!(config.llm.api_key_env, Some("OPENAI_API_KEY".to_string()));
        assert_eq!(config.pipeline.encoding_model, "gpt-3.5-turbo");
        assert_eq!(config.pipeline.max_concurrency, 1);
        assert_eq!(config.webhook.bind, "0.0.0.0:5000");
    }

    #[test]
    fn test_safe_budget_subtracts_reserved_allowance() {
        let pipeline = PipelineConfig::default();
        assert_eq!(pipeline.safe_budget().unwrap(), 15000);
    }

    #[test]
    fn test_safe_budget_zero_is_configuration_error() {
        let pipeline = PipelineConfig {
            context_tokens: 1000,
            reserved_prompt_tokens: 1000,
            ..PipelineConfig::default()
        };
        let err = pipeline.safe_budget().unwrap_err();
        assert!(err.is_configuration());

        let pipeline = PipelineConfig {
            context_tokens: 10,
            reserved_prompt_tokens: 1000,
            ..PipelineConfig::default()
        };
        assert!(pipeline.safe_budget().is_err());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [llm]
            provider = "anthropic"
            model = "claude-sonnet-4-20250514"

            [pipeline]
            max_concurrency = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.llm.provider, "anthropic");
        assert_eq!(config.llm.timeout_secs, 120);
        assert_eq!(config.pipeline.max_concurrency, 4);
        assert_eq!(config.pipeline.context_tokens, 16000);
        assert_eq!(config.runner.python, "python3");
        assert!(config.runner.setup_env);
    }

    #[test]
    fn test_max_tokens_provider_defaults() {
        let mut llm = LlmConfig::default();
        assert_eq!(llm.get_max_tokens(), 16384);

        llm.provider = "anthropic".to_string();
        assert_eq!(llm.get_max_tokens(), 8192);

        llm.max_tokens = Some(2000);
        assert_eq!(llm.get_max_tokens(), 2000);
    }

    #[test]
    fn test_github_app_auth_requires_both_fields() {
        let mut gh = GitHubConfig::default();
        assert!(!gh.uses_app_auth());
        gh.app_id = Some("1234".to_string());
        assert!(!gh.uses_app_auth());
        gh.private_key_path = Some(PathBuf::from("/tmp/key.pem"));
        assert!(gh.uses_app_auth());
    }
}

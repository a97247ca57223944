//! Configuration loading from conductor.toml.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use runtime::model::{CallPolicy, ModelClient};
use runtime::providers::{AnthropicAuth, AnthropicModel, MockModel};
use runtime::tools::{RegistryError, ToolRegistry};
use runtime::{Agent, CompositeAgent, LeafAgent};
use serde::Deserialize;
use storage::ScoreWeights;
use telemetry::logging::LogFormat;

/// Environment variable consulted when the file carries no credential.
pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// Top-level configuration.
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub model_call: ModelCallConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// The agent tree.
    #[serde(default = "default_pipeline")]
    pub pipeline: PipelineNode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Anthropic,
    /// Offline deterministic answers, no credentials needed.
    Mock,
}

/// Backend provider configuration.
#[derive(Debug, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub provider: Provider,

    /// Default model for leaves that don't name one.
    #[serde(default = "default_model")]
    pub model: String,

    /// Standard Anthropic API key (sk-ant-api01-...).
    /// Mutually exclusive with oauth_token.
    pub api_key: Option<String>,

    /// OAuth bearer token.
    /// Mutually exclusive with api_key.
    pub oauth_token: Option<String>,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            model: default_model(),
            api_key: None,
            oauth_token: None,
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

/// Timeout and retry for every model call.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ModelCallConfig {
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for ModelCallConfig {
    fn default() -> Self {
        let policy = CallPolicy::default();
        Self {
            timeout_secs: policy.timeout.as_secs(),
            max_attempts: policy.max_attempts,
            backoff_ms: policy.backoff.as_millis() as u64,
        }
    }
}

impl ModelCallConfig {
    pub fn policy(&self) -> CallPolicy {
        CallPolicy {
            timeout: Duration::from_secs(self.timeout_secs),
            max_attempts: self.max_attempts,
            backoff: Duration::from_millis(self.backoff_ms),
            ..CallPolicy::default()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// SQLite memory file.
    pub path: PathBuf,
    /// Token budget for the digest threaded into each run. Zero disables it.
    pub token_budget: usize,
    pub recency_weight: f64,
    pub tag_weight: f64,
    /// Tags that rank a record higher in the digest. Empty means the app
    /// name and the root agent's name.
    pub focus_tags: Vec<String>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        let weights = ScoreWeights::default();
        Self {
            path: PathBuf::from("conductor-memory.db"),
            token_budget: 1000,
            recency_weight: weights.recency,
            tag_weight: weights.tags,
            focus_tags: Vec::new(),
        }
    }
}

impl MemoryConfig {
    pub fn weights(&self) -> ScoreWeights {
        ScoreWeights {
            recency: self.recency_weight,
            tags: self.tag_weight,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Default filter directive; `RUST_LOG` overrides it.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            level: "warn".to_string(),
        }
    }
}

/// One node of the agent tree. A node with children is composite.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineNode {
    pub name: String,
    pub output_slot: String,
    pub model: Option<String>,
    #[serde(default)]
    pub instruction: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub children: Vec<PipelineNode>,
}

impl PipelineNode {
    fn leaf(name: &str, output_slot: &str, instruction: &str, tools: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            output_slot: output_slot.to_string(),
            model: None,
            instruction: instruction.to_string(),
            tools: tools.iter().map(|t| t.to_string()).collect(),
            children: Vec::new(),
        }
    }

    /// Build the agent tree, resolving tool names against `tools`.
    pub fn build(
        &self,
        client: &Arc<dyn ModelClient>,
        tools: &ToolRegistry,
        policy: &CallPolicy,
    ) -> Result<Agent, ConfigError> {
        if self.children.is_empty() {
            let mut leaf = LeafAgent::builder(&self.name, &self.output_slot, Arc::clone(client))
                .instruction(&self.instruction)
                .tools(tools.select(&self.tools)?)
                .policy(*policy);
            if let Some(model) = &self.model {
                leaf = leaf.model_id(model);
            }
            return Ok(leaf.build().into());
        }

        if !self.tools.is_empty() {
            return Err(ConfigError::Pipeline(format!(
                "composite agent '{}' cannot declare tools",
                self.name
            )));
        }
        let children = self
            .children
            .iter()
            .map(|child| child.build(client, tools, policy))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CompositeAgent::new(&self.name, &self.output_slot, children).into())
    }
}

/// Classifier, analyst and strategist under one profiler.
fn default_pipeline() -> PipelineNode {
    PipelineNode {
        name: "profiler".to_string(),
        output_slot: "recommendation".to_string(),
        model: None,
        instruction: String::new(),
        tools: Vec::new(),
        children: vec![
            PipelineNode::leaf(
                "classifier",
                "classification",
                "Read the exam papers named in the request and classify every question. \
                 Answer with a JSON array of objects with `question`, `topic` and `bloom_level`.",
                &["read_document"],
            ),
            PipelineNode::leaf(
                "analyst",
                "analysis",
                "Compute frequency statistics over the classified questions in the context \
                 and report the most important shifts as a JSON object.",
                &["analyze_statistics", "compare_documents"],
            ),
            PipelineNode::leaf(
                "strategist",
                "plan",
                "Turn the analysis in the context into a study plan. \
                 Answer with a JSON array of concrete actions, most important first.",
                &[],
            ),
        ],
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            model_call: ModelCallConfig::default(),
            memory: MemoryConfig::default(),
            logging: LoggingConfig::default(),
            pipeline: default_pipeline(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from TOML string.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Build the authentication from config, falling back to `ANTHROPIC_API_KEY`.
    pub fn auth(&self) -> Result<AnthropicAuth, ConfigError> {
        self.auth_with(std::env::var(API_KEY_ENV).ok())
    }

    /// Requires exactly one of api_key or oauth_token; `env_key` counts only
    /// when neither is set.
    fn auth_with(&self, env_key: Option<String>) -> Result<AnthropicAuth, ConfigError> {
        match (&self.backend.api_key, &self.backend.oauth_token) {
            (Some(key), None) => Ok(AnthropicAuth::ApiKey(key.clone())),
            (None, Some(token)) => Ok(AnthropicAuth::OauthToken(token.clone())),
            (Some(_), Some(_)) => Err(ConfigError::AmbiguousAuth),
            (None, None) => env_key
                .filter(|key| !key.trim().is_empty())
                .map(AnthropicAuth::ApiKey)
                .ok_or(ConfigError::MissingAuth),
        }
    }

    /// The model capability every leaf shares.
    pub fn client(&self) -> Result<Arc<dyn ModelClient>, ConfigError> {
        match self.backend.provider {
            Provider::Mock => Ok(Arc::new(MockModel::new())),
            Provider::Anthropic => {
                let model = AnthropicModel::builder(self.auth()?, &self.backend.model)
                    .max_tokens(self.backend.max_tokens)
                    .build();
                Ok(Arc::new(model))
            }
        }
    }

    /// The configured agent tree, wired to `client` and the built-in tools.
    pub fn agent(&self, client: &Arc<dyn ModelClient>) -> Result<Agent, ConfigError> {
        let tools = runtime::tools::builtin::registry()?;
        self.pipeline
            .build(client, &tools, &self.model_call.policy())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error(
        "authentication not configured: set backend.api_key, backend.oauth_token or {API_KEY_ENV}"
    )]
    MissingAuth,

    #[error(
        "ambiguous authentication: set either backend.api_key OR backend.oauth_token, not both"
    )]
    AmbiguousAuth,

    #[error("invalid pipeline: {0}")]
    Pipeline(String),

    #[error(transparent)]
    Tools(#[from] RegistryError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock_client() -> Arc<dyn ModelClient> {
        Arc::new(MockModel::new())
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.backend.provider, Provider::Anthropic);
        assert_eq!(config.model_call.max_attempts, 3);
        assert_eq!(config.memory.token_budget, 1000);
        assert_eq!(config.logging.format, LogFormat::Pretty);

        let names: Vec<&str> = config
            .pipeline
            .children
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, vec!["classifier", "analyst", "strategist"]);
    }

    #[test]
    fn default_pipeline_builds_and_validates() {
        let config = Config::default();
        let agent = config.agent(&mock_client()).unwrap();
        agent.validate().unwrap();
        assert_eq!(agent.name(), "profiler");
        let Agent::Leaf(analyst) = &agent.children()[1] else {
            panic!("analyst should be a leaf");
        };
        assert_eq!(
            analyst.tools().names(),
            vec!["analyze_statistics", "compare_documents"]
        );
    }

    #[test]
    fn parse_full_config() {
        let config = Config::parse(
            r#"
            [backend]
            provider = "mock"
            model = "claude-haiku"
            max_tokens = 1024

            [model_call]
            timeout_secs = 5
            max_attempts = 2
            backoff_ms = 100

            [memory]
            path = "/tmp/mem.db"
            token_budget = 250
            tag_weight = 2.0
            focus_tags = ["physics"]

            [logging]
            format = "json"
            level = "debug"

            [pipeline]
            name = "root"
            output_slot = "answer"

            [[pipeline.children]]
            name = "reader"
            output_slot = "document"
            tools = ["read_document"]

            [[pipeline.children]]
            name = "writer"
            output_slot = "summary"
            model = "claude-opus"
            instruction = "Summarize."
            "#,
        )
        .unwrap();

        assert_eq!(config.backend.provider, Provider::Mock);
        assert_eq!(config.backend.max_tokens, 1024);
        let policy = config.model_call.policy();
        assert_eq!(policy.timeout, Duration::from_secs(5));
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.backoff, Duration::from_millis(100));
        assert_eq!(config.memory.path, PathBuf::from("/tmp/mem.db"));
        assert_eq!(config.memory.weights().tags, 2.0);
        assert_eq!(config.memory.weights().recency, 1.0);
        assert_eq!(config.memory.focus_tags, vec!["physics"]);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.pipeline.children[1].model.as_deref(), Some("claude-opus"));

        let agent = config.agent(&config.client().unwrap()).unwrap();
        assert_eq!(agent.children().len(), 2);
    }

    #[test]
    fn unknown_tool_is_rejected() {
        let config = Config::parse(
            r#"
            [pipeline]
            name = "solo"
            output_slot = "out"
            tools = ["visualize_trends"]
            "#,
        )
        .unwrap();
        let err = config.agent(&mock_client()).unwrap_err();
        assert!(matches!(err, ConfigError::Tools(RegistryError::Unknown(_))));
    }

    #[test]
    fn composite_with_tools_is_rejected() {
        let mut config = Config::default();
        config.pipeline.tools = vec!["read_document".into()];
        assert!(matches!(
            config.agent(&mock_client()),
            Err(ConfigError::Pipeline(_))
        ));
    }

    #[test]
    fn auth_requires_exactly_one_credential() {
        let mut config = Config::default();
        assert!(matches!(config.auth_with(None), Err(ConfigError::MissingAuth)));
        assert!(matches!(
            config.auth_with(Some("sk-env".into())),
            Ok(AnthropicAuth::ApiKey(key)) if key == "sk-env"
        ));

        config.backend.oauth_token = Some("oat".into());
        assert!(matches!(
            config.auth_with(Some("sk-env".into())),
            Ok(AnthropicAuth::OauthToken(token)) if token == "oat"
        ));

        config.backend.api_key = Some("sk-file".into());
        assert!(matches!(config.auth_with(None), Err(ConfigError::AmbiguousAuth)));
    }

    #[test]
    fn mock_provider_needs_no_credentials() {
        let mut config = Config::default();
        config.backend.provider = Provider::Mock;
        assert_eq!(config.client().unwrap().name(), "mock");
    }

    #[test]
    fn unknown_provider_is_a_parse_error() {
        let err = Config::parse("[backend]\nprovider = \"openai\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}

use crate::llm::provider::DEFAULT_AZURE_API_VERSION;
use crate::llm::{LlmSettings, Provider};
use crate::pipeline::{NormalizerOptions, ToolSurfacing};
use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of environment overrides, e.g. `PORTFOLIO_SERVER__PORT=9000`.
pub const ENV_PREFIX: &str = "PORTFOLIO";

/// Config files picked up from the working directory when none is given.
const CWD_CONFIG_FILES: &[&str] = &["config.yaml", "config.toml"];

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Host to bind
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Overall request deadline in seconds (0 disables)
    #[arg(long, env = "REQUEST_TIMEOUT_SECS")]
    pub request_timeout_secs: Option<u64>,

    /// Path to the portfolio document snapshot
    #[arg(long, env = "DOCUMENTS_PATH")]
    pub documents_path: Option<String>,

    /// Emit tool invocations to the client
    #[arg(long, env = "SURFACE_TOOL_CALLS")]
    pub surface_tool_calls: Option<bool>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub retrieval: RetrievalConfig,
    pub agent: AgentConfig,
    pub stream: StreamConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    /// Allowed CORS origins; `*` allows any.
    pub cors_origins: Vec<String>,
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    /// The request deadline, or `None` when disabled.
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    pub k: usize,
    pub documents_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    pub temperature: f32,
    #[serde(default)]
    pub system_prompt_path: Option<PathBuf>,
    pub max_tool_iterations: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamConfig {
    pub surface_tool_calls: bool,
    pub repair_urls: bool,
}

impl StreamConfig {
    pub fn normalizer_options(&self) -> NormalizerOptions {
        NormalizerOptions {
            surfacing: if self.surface_tool_calls {
                ToolSurfacing::Client
            } else {
                ToolSurfacing::LogOnly
            },
            repair_urls: self.repair_urls,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;

        // 1. Defaults
        let mut builder = Config::builder()
            .set_default("server.port", 8000)?
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.cors_origins", vec!["*"])?
            .set_default("server.request_timeout_secs", 120)?
            .set_default("retrieval.k", 5)?
            .set_default("retrieval.documents_path", "data/portfolio.json")?
            .set_default("agent.temperature", 0.7)?
            .set_default("agent.max_tool_iterations", 10)?
            .set_default("stream.surface_tool_calls", false)?
            .set_default("stream.repair_urls", true)?;

        // 2. Config file: explicit path is required to exist, cwd fallbacks are optional
        if let Some(path) = &cli.config {
            builder = builder.add_source(File::with_name(path).required(true));
        } else if let Some(path) = CWD_CONFIG_FILES.iter().map(Path::new).find(|p| p.exists()) {
            builder = builder.add_source(File::from(path).required(false));
        }

        // 3. PORTFOLIO_-prefixed environment, e.g. PORTFOLIO_RETRIEVAL__K=3
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("server.cors_origins")
                .try_parsing(true),
        );

        // 4. CLI flags (and their plain env aliases) win
        if let Some(host) = cli.host {
            builder = builder.set_override("server.host", host)?;
        }
        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", port)?;
        }
        if let Some(secs) = cli.request_timeout_secs {
            builder = builder.set_override("server.request_timeout_secs", secs)?;
        }
        if let Some(path) = cli.documents_path {
            builder = builder.set_override("retrieval.documents_path", path)?;
        }
        if let Some(surface) = cli.surface_tool_calls {
            builder = builder.set_override("stream.surface_tool_calls", surface)?;
        }

        let cfg: Self = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), config::ConfigError> {
        if self.retrieval.k == 0 {
            return Err(config::ConfigError::Message(
                "retrieval.k must be at least 1".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.agent.temperature) {
            return Err(config::ConfigError::Message(format!(
                "agent.temperature must be within 0.0..=2.0, got {}",
                self.agent.temperature
            )));
        }
        Ok(())
    }
}

/// Missing or invalid LLM environment.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("Missing required env var: {0}")]
    Missing(&'static str),
    #[error("{0} cannot be empty")]
    Empty(&'static str),
}

fn required_env(key: &'static str) -> Result<String, SettingsError> {
    let value = std::env::var(key).map_err(|_| SettingsError::Missing(key))?;
    if value.trim().is_empty() {
        return Err(SettingsError::Empty(key));
    }
    Ok(value)
}

pub fn load_llm_settings() -> Result<LlmSettings, SettingsError> {
    let base_url = required_env("LLM_BASE_URL")?;
    let model = required_env("LLM_MODEL")?;

    let api_key = std::env::var("LLM_API_KEY")
        .ok()
        .filter(|s| !s.trim().is_empty());

    // Auto-detect provider from base URL
    let mut provider = Provider::detect_from_url(&base_url);

    let deployment_name = std::env::var("AZURE_DEPLOYMENT_NAME").ok();
    let api_version = std::env::var("AZURE_API_VERSION").ok();

    if let Provider::AzureOpenAI { .. } = &provider
        && let Some(deployment) = &deployment_name
    {
        provider = Provider::AzureOpenAI {
            deployment_name: deployment.clone(),
            api_version: api_version
                .clone()
                .unwrap_or_else(|| DEFAULT_AZURE_API_VERSION.to_string()),
        };
    }

    Ok(LlmSettings {
        base_url,
        api_key,
        model,
        provider,
        deployment_name,
        api_version,
    })
}

use crate::cli::{BulkCmCommand, Cli, Command, LayoutArg, MeasCommand};
use crate::error::{ConfigError, ConfigResult as Result};
use crate::flatten::ElementFilter;
use crate::pipeline::PipelineOptions;
use crate::router::OutputFormat;
use crate::tables::{CounterLayout, NaturalKeyOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "TELCO_XML_";

/// Trait for abstracting environment variable access
pub trait EnvProvider {
    fn get(&self, key: &str) -> Option<String>;
}

/// System environment variable provider for production use
pub struct SystemEnvProvider;

impl EnvProvider for SystemEnvProvider {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub flatten: FlattenConfig,
    pub pipeline: PipelineConfig,
    pub output: OutputConfig,
    pub counters: CountersConfig,
}

/// Element filtering for BulkCM flattening
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct FlattenConfig {
    pub include_elements: Vec<String>,
    /// `*` excludes everything not included
    pub exclude_elements: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Items buffered between scanner and writer
    pub channel_capacity: usize,
    pub recursive: bool,
    /// Overall run deadline
    pub deadline_seconds: Option<u64>,
    /// Longest wait of one consumer pull
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory that receives the sinks
    pub location: PathBuf,
    pub format: OutputFormat,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LayoutName {
    #[default]
    Plain,
    NaturalKey,
}

impl From<LayoutArg> for LayoutName {
    fn from(layout: LayoutArg) -> Self {
        match layout {
            LayoutArg::Plain => LayoutName::Plain,
            LayoutArg::NaturalKey => LayoutName::NaturalKey,
        }
    }
}

/// Counter table layout and its DN options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct CountersConfig {
    pub layout: LayoutName,
    pub nedn_ignore_before: Option<String>,
    pub ldn_ignore_before: Option<String>,
    pub node_key: Option<String>,
    pub partition_by_node: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 12,
            recursive: false,
            deadline_seconds: None,
            poll_interval_ms: 50,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            location: PathBuf::from("."),
            format: OutputFormat::Csv,
        }
    }
}

impl Config {
    pub fn element_filter(&self) -> ElementFilter {
        ElementFilter::new(&self.flatten.include_elements, &self.flatten.exclude_elements)
    }

    pub fn pipeline_options(&self, pattern: impl Into<String>) -> PipelineOptions {
        PipelineOptions {
            pattern: pattern.into(),
            recursive: self.pipeline.recursive,
            channel_capacity: self.pipeline.channel_capacity,
            poll_interval: Duration::from_millis(self.pipeline.poll_interval_ms),
            deadline: self.pipeline.deadline_seconds.map(Duration::from_secs),
        }
    }

    pub fn counter_layout(&self) -> CounterLayout {
        match self.counters.layout {
            LayoutName::Plain => CounterLayout::Plain,
            LayoutName::NaturalKey => CounterLayout::NaturalKey(NaturalKeyOptions {
                nedn_ignore_before: self.counters.nedn_ignore_before.clone(),
                ldn_ignore_before: self.counters.ldn_ignore_before.clone(),
                node_key: self.counters.node_key.clone(),
                partition_by_node: self.counters.partition_by_node,
            }),
        }
    }
}

fn env_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn env_parse<T: std::str::FromStr>(env: &impl EnvProvider, name: &str) -> Result<Option<T>> {
    let key = format!("{}{}", ENV_PREFIX, name);
    match env.get(&key) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Environment(format!("Invalid {} value: {}", key, value))),
        None => Ok(None),
    }
}

/// Configuration manager for loading and merging configurations
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration with precedence: file -> environment -> CLI
    pub async fn load_config(cli: &Cli) -> Result<Config> {
        let mut config = match &cli.config {
            Some(config_path) => Self::load_from_file(config_path).await?,
            None => Self::find_config_file().await?.unwrap_or_default(),
        };

        config = Self::apply_environment_overrides(config)?;
        config = Self::merge_with_cli(config, cli);
        Self::validate_config(&config)?;

        Ok(config)
    }

    /// Load configuration from a file (TOML or JSON)
    ///
    /// Sections and keys missing from the file keep their defaults.
    pub async fn load_from_file(path: &Path) -> Result<Config> {
        let content = tokio::fs::read_to_string(path).await?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Ok(toml::from_str(&content)?),
            Some("json") => Ok(serde_json::from_str(&content)?),
            Some(ext) => Err(ConfigError::UnsupportedFormat(ext.to_string())),
            None => {
                if let Ok(config) = toml::from_str::<Config>(&content) {
                    Ok(config)
                } else {
                    Ok(serde_json::from_str(&content)?)
                }
            }
        }
    }

    /// Find configuration file in standard locations
    pub async fn find_config_file() -> Result<Option<Config>> {
        let config_names = [
            "telco-xml-tables.toml",
            "telco-xml-tables.json",
            ".telco-xml-tables.toml",
            ".telco-xml-tables.json",
        ];

        for name in &config_names {
            let path = PathBuf::from(name);
            if path.exists() {
                return Ok(Some(Self::load_from_file(&path).await?));
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let app_config_dir = config_dir.join("telco-xml-tables");
            for name in &config_names {
                let path = app_config_dir.join(name);
                if path.exists() {
                    return Ok(Some(Self::load_from_file(&path).await?));
                }
            }
        }

        Ok(None)
    }

    /// Apply environment variable overrides using the system environment
    pub fn apply_environment_overrides(config: Config) -> Result<Config> {
        Self::apply_environment_overrides_with(&SystemEnvProvider, config)
    }

    /// Apply `TELCO_XML_*` overrides with a custom environment provider
    pub fn apply_environment_overrides_with(
        env: &impl EnvProvider,
        mut config: Config,
    ) -> Result<Config> {
        if let Some(include) = env.get("TELCO_XML_INCLUDE") {
            config.flatten.include_elements = env_list(&include);
        }
        if let Some(exclude) = env.get("TELCO_XML_EXCLUDE") {
            config.flatten.exclude_elements = env_list(&exclude);
        }

        if let Some(capacity) = env_parse(env, "CHANNEL_CAPACITY")? {
            config.pipeline.channel_capacity = capacity;
        }
        if let Some(recursive) = env_parse(env, "RECURSIVE")? {
            config.pipeline.recursive = recursive;
        }
        if let Some(deadline) = env_parse(env, "DEADLINE")? {
            config.pipeline.deadline_seconds = Some(deadline);
        }
        if let Some(poll) = env_parse(env, "POLL_INTERVAL_MS")? {
            config.pipeline.poll_interval_ms = poll;
        }

        if let Some(location) = env.get("TELCO_XML_OUTPUT") {
            config.output.location = PathBuf::from(location);
        }
        if let Some(format) = env.get("TELCO_XML_FORMAT") {
            config.output.format = match format.to_lowercase().as_str() {
                "csv" => OutputFormat::Csv,
                "parquet" => OutputFormat::Parquet,
                _ => {
                    return Err(ConfigError::Environment(format!(
                        "Invalid TELCO_XML_FORMAT value: {}",
                        format
                    )));
                }
            };
        }

        if let Some(layout) = env.get("TELCO_XML_LAYOUT") {
            config.counters.layout = match layout.to_lowercase().as_str() {
                "plain" => LayoutName::Plain,
                "natural-key" => LayoutName::NaturalKey,
                _ => {
                    return Err(ConfigError::Environment(format!(
                        "Invalid TELCO_XML_LAYOUT value: {}",
                        layout
                    )));
                }
            };
        }
        if let Some(node_key) = env.get("TELCO_XML_NODE_KEY") {
            config.counters.node_key = Some(node_key);
        }

        Ok(config)
    }

    /// Merge CLI arguments with configuration (CLI takes precedence)
    pub fn merge_with_cli(mut config: Config, cli: &Cli) -> Config {
        match &cli.command {
            Command::Bulkcm {
                command: BulkCmCommand::Parse(args),
            } => {
                if let Some(output) = &args.output {
                    config.output.location = output.clone();
                }
                if !args.include.is_empty() {
                    config.flatten.include_elements = args.include.clone();
                }
                if !args.exclude.is_empty() {
                    config.flatten.exclude_elements = args.exclude.clone();
                }
            }
            Command::Bulkcm {
                command: BulkCmCommand::Probe { .. },
            } => {}
            Command::Meas {
                command: MeasCommand::Parse(args),
            } => {
                if let Some(output) = &args.output {
                    config.output.location = output.clone();
                }
                if args.recursive {
                    config.pipeline.recursive = true;
                }
                if let Some(format) = args.format {
                    config.output.format = format.into();
                }
                if let Some(layout) = args.layout {
                    config.counters.layout = layout.into();
                }
                if args.nedn_ignore_before.is_some() {
                    config.counters.nedn_ignore_before = args.nedn_ignore_before.clone();
                }
                if args.ldn_ignore_before.is_some() {
                    config.counters.ldn_ignore_before = args.ldn_ignore_before.clone();
                }
                if args.node_key.is_some() {
                    config.counters.node_key = args.node_key.clone();
                }
                if args.partition_by_node {
                    config.counters.partition_by_node = true;
                }
                if let Some(capacity) = args.channel_capacity {
                    config.pipeline.channel_capacity = capacity;
                }
                if let Some(deadline) = args.deadline {
                    config.pipeline.deadline_seconds = Some(deadline);
                }
            }
        }

        config
    }

    /// Validate configuration values
    pub fn validate_config(config: &Config) -> Result<()> {
        if config.pipeline.channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "Channel capacity must be greater than 0".to_string(),
            ));
        }

        if config.pipeline.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "Poll interval must be greater than 0".to_string(),
            ));
        }

        if config.pipeline.deadline_seconds == Some(0) {
            return Err(ConfigError::Validation(
                "Deadline must be greater than 0".to_string(),
            ));
        }

        for name in config
            .flatten
            .include_elements
            .iter()
            .chain(&config.flatten.exclude_elements)
        {
            if name.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "Element names cannot be empty".to_string(),
                ));
            }
        }

        if config.counters.partition_by_node && config.counters.node_key.is_none() {
            return Err(ConfigError::Validation(
                "partition_by_node requires a node_key".to_string(),
            ));
        }

        Ok(())
    }
}

use std::path::{Path, PathBuf};

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::GatewayConfig;

/// Prefix of environment overrides, e.g. `GATEHOUSE__DISPATCH__BUFFER_SIZE`.
pub const ENV_PREFIX: &str = "GATEHOUSE";
const ENV_SEPARATOR: &str = "__";

/// Values given on the command line; they win over every other layer.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub listen_addr: Option<String>,
    pub worker_threads: Option<usize>,
    pub log_level: Option<String>,
    pub discovery_path: Option<String>,
}

/// Determine file format based on extension
pub fn file_format(path: &Path) -> FileFormat {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Yaml, // Default to YAML
    }
}

/// Layered loader: defaults, then an optional file, then environment, then
/// command-line overrides.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    env: Option<config::Map<String, String>>,
    overrides: ConfigOverrides,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Reads environment overrides from `vars` instead of the process
    /// environment.
    pub fn with_env_source(mut self, vars: config::Map<String, String>) -> Self {
        self.env = Some(vars);
        self
    }

    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn load(&self) -> Result<GatewayConfig> {
        let defaults = Config::try_from(&GatewayConfig::default())
            .wrap_err("Failed to serialize default configuration")?;
        let mut builder = Config::builder().add_source(defaults);

        if let Some(path) = &self.file {
            let name = path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", path.display()))?;
            builder = builder.add_source(File::new(name, file_format(path)).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true)
                .source(self.env.clone()),
        );

        let overrides = &self.overrides;
        builder = builder
            .set_override_option("listen_addr", overrides.listen_addr.clone())?
            .set_override_option(
                "dispatch.worker_threads",
                overrides
                    .worker_threads
                    .map(|n| i64::try_from(n).unwrap_or(i64::MAX)),
            )?
            .set_override_option("log.level", overrides.log_level.clone())?
            .set_override_option("discovery.path", overrides.discovery_path.clone())?;

        let origin = self
            .file
            .as_deref()
            .map_or_else(|| "defaults".to_string(), |p| p.display().to_string());
        let settings = builder
            .build()
            .with_context(|| format!("Failed to build config from {origin}"))?;
        settings
            .try_deserialize()
            .with_context(|| format!("Failed to deserialize config from {origin}"))
    }
}

/// Load configuration from an optional file plus environment and overrides
pub fn load_config(path: Option<&str>, overrides: ConfigOverrides) -> Result<GatewayConfig> {
    let mut loader = ConfigLoader::new().with_overrides(overrides);
    if let Some(path) = path {
        loader = loader.with_file(path);
    }
    loader.load()
}

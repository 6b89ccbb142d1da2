//! Layered configuration
//!
//! Loads, in order, with later layers overriding earlier ones key by key:
//! 1. Default values
//! 2. User-level config: ~/.stagegraph/stagegraph.toml
//! 3. Project-level config: ./.stagegraph/stagegraph.toml
//! 4. The file passed with `--config`
//!
//! Missing user and project files are skipped; a missing `--config` file is an error.

use serde::{Deserialize, Serialize};
use stagegraph_content::{CollaboratorsConfig, ContentConfig};
use stagegraph_core::EngineConfig;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::error::{CliError, Result};

const CONFIG_DIR: &str = ".stagegraph";
const CONFIG_FILE: &str = "stagegraph.toml";

/// Where checkpoints live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointBackend {
    /// Process memory; gone when the command exits
    Memory,
    /// One JSON file per workflow
    #[default]
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub backend: CheckpointBackend,
    /// Directory for the file backend
    pub path: PathBuf,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            backend: CheckpointBackend::File,
            path: PathBuf::from(CONFIG_DIR).join("checkpoints"),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset: "info", "stagegraph_core=debug", ...
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

/// Complete `stagegraph.toml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    /// `loop_key = ceiling` overrides
    pub loops: HashMap<String, u32>,
    pub checkpoint: CheckpointConfig,
    pub logging: LoggingConfig,
    pub collaborators: CollaboratorsConfig,
    pub content: ContentConfig,
}

impl AppConfig {
    /// Parse one TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| CliError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Engine section with the `[loops]` overrides folded in
    pub fn engine_config(&self) -> EngineConfig {
        let mut engine = self.engine.clone();
        engine
            .loops
            .extend(self.loops.iter().map(|(k, v)| (k.clone(), *v)));
        engine
    }

    pub fn validate(&self) -> Result<()> {
        self.engine_config().validate()?;
        self.content.validate()?;
        self.collaborators.validate()?;
        Ok(())
    }
}

/// Recursively overlay `layer` onto `base`; tables merge, everything else is replaced
fn merge_values(base: &mut toml::Value, layer: toml::Value) {
    match (base, layer) {
        (toml::Value::Table(base), toml::Value::Table(layer)) => {
            for (key, value) in layer {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, layer) => *base = layer,
    }
}

/// Finds and merges the configuration layers
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    user_config_path: Option<PathBuf>,
    project_config_path: PathBuf,
    explicit_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Loader for the standard locations
    pub fn new() -> Self {
        let user = dirs::home_dir().map(|home| home.join(CONFIG_DIR).join(CONFIG_FILE));
        let project = std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(CONFIG_DIR)
            .join(CONFIG_FILE);
        Self::with_paths(user, project)
    }

    /// Loader with explicit user and project locations
    pub fn with_paths(user: Option<PathBuf>, project: PathBuf) -> Self {
        Self {
            user_config_path: user,
            project_config_path: project,
            explicit_path: None,
        }
    }

    /// Add the `--config` layer
    pub fn with_explicit(mut self, path: Option<PathBuf>) -> Self {
        self.explicit_path = path;
        self
    }

    pub fn user_config_path(&self) -> Option<&Path> {
        self.user_config_path.as_deref()
    }

    pub fn project_config_path(&self) -> &Path {
        &self.project_config_path
    }

    /// Merge every layer over the defaults and validate the result
    pub async fn load(&self) -> Result<AppConfig> {
        let mut merged = toml::Value::try_from(AppConfig::default())
            .map_err(|e| CliError::Config(format!("Failed to encode defaults: {}", e)))?;

        let optional = self
            .user_config_path
            .iter()
            .chain(std::iter::once(&self.project_config_path));
        for path in optional {
            match Self::read_layer(path).await? {
                Some(layer) => {
                    debug!(path = %path.display(), "Loaded config layer");
                    merge_values(&mut merged, layer);
                }
                None => debug!(path = %path.display(), "Config layer not found, skipped"),
            }
        }

        if let Some(path) = &self.explicit_path {
            let layer = Self::read_layer(path).await?.ok_or_else(|| {
                CliError::Config(format!("Config file not found: {}", path.display()))
            })?;
            debug!(path = %path.display(), "Loaded explicit config");
            merge_values(&mut merged, layer);
        }

        let config: AppConfig = merged
            .try_into()
            .map_err(|e| CliError::Config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    async fn read_layer(path: &Path) -> Result<Option<toml::Value>> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(None);
        }
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| CliError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let value = toml::from_str::<toml::Value>(&content).map_err(|e| {
            CliError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        Ok(Some(value))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagegraph_core::RetentionPolicy;
    use tempfile::TempDir;

    fn loader(dir: &TempDir) -> ConfigLoader {
        ConfigLoader::with_paths(
            Some(dir.path().join("user.toml")),
            dir.path().join("project.toml"),
        )
    }

    #[test]
    fn test_default_paths() {
        let loader = ConfigLoader::new();
        assert!(loader.project_config_path().ends_with(".stagegraph/stagegraph.toml"));
        if let Some(user) = loader.user_config_path() {
            assert!(user.ends_with(".stagegraph/stagegraph.toml"));
        }
    }

    #[tokio::test]
    async fn test_defaults_without_files() {
        let dir = TempDir::new().unwrap();
        let config = loader(&dir).load().await.unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.checkpoint.backend, CheckpointBackend::File);
        assert_eq!(config.logging.format, LogFormat::Compact);
    }

    #[tokio::test]
    async fn test_layers_override_key_by_key() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("user.toml"),
            "[engine]\nmax_steps = 50\nretention = \"clear_on_success\"\n[logging]\nlevel = \"debug\"\n",
        )
        .await
        .unwrap();
        fs::write(
            dir.path().join("project.toml"),
            "[engine]\nmax_steps = 80\n[loops]\nword_count = 4\n",
        )
        .await
        .unwrap();

        let config = loader(&dir).load().await.unwrap();
        assert_eq!(config.engine.max_steps, Some(80));
        // user value survives a project file that does not mention it
        assert_eq!(config.engine.retention, RetentionPolicy::ClearOnSuccess);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.engine_config().loops.get("word_count"), Some(&4));
    }

    #[tokio::test]
    async fn test_explicit_file_wins_and_must_exist() {
        let dir = TempDir::new().unwrap();
        let explicit = dir.path().join("run.toml");
        fs::write(&explicit, "[content]\nwords_per_page = 250\n[checkpoint]\nbackend = \"memory\"\n")
            .await
            .unwrap();

        let config = loader(&dir)
            .with_explicit(Some(explicit))
            .load()
            .await
            .unwrap();
        assert_eq!(config.content.words_per_page, 250);
        assert_eq!(config.checkpoint.backend, CheckpointBackend::Memory);

        let missing = loader(&dir)
            .with_explicit(Some(dir.path().join("absent.toml")))
            .load()
            .await;
        assert!(matches!(missing, Err(CliError::Config(_))));
    }

    #[tokio::test]
    async fn test_invalid_values_are_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("project.toml"), "[loops]\nhumanization = 0\n")
            .await
            .unwrap();
        assert!(loader(&dir).load().await.is_err());

        fs::write(dir.path().join("project.toml"), "[collaborators.writer]\nretries = 9\n")
            .await
            .unwrap();
        assert!(loader(&dir).load().await.is_err());
    }

    #[test]
    fn test_merge_values_replaces_scalars() {
        let mut base: toml::Value = toml::from_str("a = 1\n[t]\nx = 1\ny = 2\n").unwrap();
        let layer: toml::Value = toml::from_str("a = 3\n[t]\ny = 5\n").unwrap();
        merge_values(&mut base, layer);
        assert_eq!(base["a"].as_integer(), Some(3));
        assert_eq!(base["t"]["x"].as_integer(), Some(1));
        assert_eq!(base["t"]["y"].as_integer(), Some(5));
    }
}

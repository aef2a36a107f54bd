//! `kbase.toml` loading.
//!
//! Every section is optional; a missing file yields the defaults, so a fresh
//! checkout runs keyword search with no configuration at all.

use anyhow::Context;
use kbase_search::{EmbeddingConfig, ExpansionConfig, QueueConfig, SearchConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
pub struct KbaseConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub expansion: ExpansionConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for KbaseConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            search: SearchConfig::default(),
            queue: QueueConfig::default(),
            embedding: EmbeddingConfig::default(),
            expansion: ExpansionConfig::default(),
        }
    }
}

impl KbaseConfig {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.search.validate()?;
        Ok(config)
    }

    /// Read `path`, falling back to defaults when it does not exist.
    ///
    /// A relative `data_dir` is resolved against the config file's directory.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("Failed to read config file '{}'", path.display())));
            }
        };
        let mut config = Self::parse(&text)
            .with_context(|| format!("Invalid config file '{}'", path.display()))?;

        if config.data_dir.is_relative() {
            if let Some(base) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                config.data_dir = base.join(&config.data_dir);
            }
        }
        Ok(config)
    }
}

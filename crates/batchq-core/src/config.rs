//! Configuration loader.
//!
//! Layers, lowest precedence first:
//! 1. `QueueOptions::default()`
//! 2. a config file (TOML / JSON / YAML, by extension) or an inline TOML string
//! 3. environment variables with a prefix (`BATCHQ_CONCURRENCY`, `BATCHQ_RETRY_ATTEMPTS`,
//!    `BATCHQ_RETRY_DELAY_MS`, `BATCHQ_MAX_RETRY_DELAY_MS`)
//!
//! The merged result is validated before it is returned.

use std::path::Path;

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use tracing::debug;

use crate::error::Result;
use crate::queue::QueueOptions;

pub const DEFAULT_ENV_PREFIX: &str = "BATCHQ";

/// Builds [`QueueOptions`] from layered sources.
///
/// ```ignore
/// let options = OptionsLoader::new()
///     .file("batchq.toml")
///     .env_prefix("BATCHQ")
///     .load()?;
/// ```
pub struct OptionsLoader {
    builder: ConfigBuilder<DefaultState>,
}

impl OptionsLoader {
    pub fn new() -> Self {
        Self {
            builder: Config::builder(),
        }
    }

    /// Add a config file; the format is picked from its extension.
    pub fn file(mut self, path: impl AsRef<Path>) -> Self {
        self.builder = self.builder.add_source(File::from(path.as_ref()));
        self
    }

    /// Add an inline TOML document.
    pub fn toml_str(mut self, content: &str) -> Self {
        self.builder = self
            .builder
            .add_source(File::from_str(content, FileFormat::Toml));
        self
    }

    /// Read `<PREFIX>_<FIELD>` environment variables.
    pub fn env_prefix(mut self, prefix: &str) -> Self {
        self.builder = self
            .builder
            .add_source(Environment::with_prefix(prefix).try_parsing(true));
        self
    }

    pub fn load(self) -> Result<QueueOptions> {
        let options: QueueOptions = self.builder.build()?.try_deserialize()?;
        options.validate()?;
        debug!(?options, "queue options loaded");
        Ok(options)
    }
}

impl Default for OptionsLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Optional file plus `BATCHQ_*` environment overrides.
pub fn load_options(file: Option<&Path>) -> Result<QueueOptions> {
    let mut loader = OptionsLoader::new();
    if let Some(path) = file {
        loader = loader.file(path);
    }
    loader.env_prefix(DEFAULT_ENV_PREFIX).load()
}

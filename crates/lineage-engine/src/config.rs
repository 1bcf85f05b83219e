use std::path::{Path, PathBuf};
use std::time::Duration;

use lineage_guard::GuardConfig;
use lineage_merge::MergeStrategy;
use lineage_store::FileStoreConfig;
use lineage_types::StateSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Engine configuration.
///
/// Every section is optional in TOML; missing fields take their defaults.
///
/// ```toml
/// default_timeout_ms = 5000
///
/// [guard]
/// max_steps_per_line = 50
/// step_limits = { retry = 3 }
///
/// [merge]
/// allow_unrelated = false
/// default_strategy = "three_way"
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub guard: GuardConfig,
    pub merge: MergeConfig,
    /// Deadline applied to operations whose context sets none.
    pub default_timeout_ms: u64,
    /// When set, every stored state is normalized against this schema.
    pub schema: Option<StateSchema>,
    /// Settings for the file-backed store opened by the CLI.
    pub storage: FileStoreConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            guard: GuardConfig::default(),
            merge: MergeConfig::default(),
            default_timeout_ms: 30_000,
            schema: None,
            storage: FileStoreConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.guard
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.default_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "default_timeout_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn with_guard(mut self, guard: GuardConfig) -> Self {
        self.guard = guard;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_schema(mut self, schema: StateSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn allowing_unrelated_merges(mut self) -> Self {
        self.merge.allow_unrelated = true;
        self
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Permit merging a line that is not a direct child of the target.
    pub allow_unrelated: bool,
    /// Strategy used when a request names none.
    pub default_strategy: MergeStrategy,
}

//! Engine configuration loaded from `~/.colloquy/config.toml`.
//!
//! ```toml
//! [compaction]
//! auto = true
//! threshold = 0.6
//! output_reserve = 32000
//! retained_rounds = 0
//! summary_language = "${COLLOQUY_SUMMARY_LANGUAGE}"
//!
//! [context]
//! keep_tool_call_rounds = 2
//! max_message_count = 0        # 0 = unlimited
//! preserve_last_user_turn = true
//!
//! [scheduler]
//! debounce_ms = 500
//!
//! [models."my-local-model"]
//! context_window = 32768
//! tool_use = false
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use colloquy_context::{
    ContextOptions, DEFAULT_KEEP_TOOL_CALL_ROUNDS, DEFAULT_OUTPUT_RESERVE,
    DEFAULT_SUMMARY_LANGUAGE, DEFAULT_THRESHOLD_RATIO, ModelInfo, ModelRegistry, OverflowPolicy,
};
use colloquy_types::SessionSettings;
use serde::Deserialize;
use thiserror::Error;

use crate::scheduler::DEFAULT_DEBOUNCE;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub compaction: CompactionConfig,
    pub context: ContextConfig,
    pub scheduler: SchedulerConfig,
    /// Exact-match overrides for the built-in model catalog.
    pub models: HashMap<String, ModelInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Global default for auto-compaction; sessions may override it.
    pub auto: bool,
    /// Fraction of the available window that may fill before compacting.
    pub threshold: f64,
    /// Tokens reserved for the model's reply.
    pub output_reserve: u32,
    /// Most recent rounds kept out of the summarized span.
    pub retained_rounds: usize,
    pub summary_language: String,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            auto: true,
            threshold: DEFAULT_THRESHOLD_RATIO,
            output_reserve: DEFAULT_OUTPUT_RESERVE,
            retained_rounds: 0,
            summary_language: DEFAULT_SUMMARY_LANGUAGE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub keep_tool_call_rounds: i32,
    /// `0` means unlimited.
    pub max_message_count: usize,
    pub preserve_last_user_turn: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            keep_tool_call_rounds: DEFAULT_KEEP_TOOL_CALL_ROUNDS,
            max_message_count: 0,
            preserve_last_user_turn: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub debounce_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE.as_millis() as u64,
        }
    }
}

pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        let Some(end_rel) = rest[start + 2..].find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let var = &rest[start + 2..start + 2 + end_rel];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &rest[start + 2 + end_rel + 1..];
    }

    out.push_str(rest);
    out
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".colloquy").join("config.toml"))
}

impl EngineConfig {
    /// Loads the default config file. A missing file (or home directory)
    /// yields the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file; using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|source| {
            tracing::warn!(path = %path.display(), "Failed to read config: {source}");
            ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }
        })?;

        Self::parse(&content).map_err(|source| {
            tracing::warn!(path = %path.display(), "Failed to parse config: {source}");
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        let mut config: Self = toml::from_str(content)?;
        config.compaction.summary_language =
            expand_env_vars(&config.compaction.summary_language);
        if config.compaction.summary_language.trim().is_empty() {
            config.compaction.summary_language = DEFAULT_SUMMARY_LANGUAGE.to_string();
        }
        Ok(config)
    }

    #[must_use]
    pub fn overflow_policy(&self) -> OverflowPolicy {
        OverflowPolicy::new(self.compaction.output_reserve, self.compaction.threshold)
    }

    #[must_use]
    pub fn context_options(&self) -> ContextOptions {
        ContextOptions {
            keep_tool_call_rounds: self.context.keep_tool_call_rounds,
            max_message_count: (self.context.max_message_count > 0)
                .then_some(self.context.max_message_count),
            preserve_last_user_turn: self.context.preserve_last_user_turn,
        }
    }

    /// Session override first, then the global default.
    #[must_use]
    pub fn auto_compaction_enabled(&self, settings: &SessionSettings) -> bool {
        settings.auto_compaction.unwrap_or(self.compaction.auto)
    }

    #[must_use]
    pub fn session_overflow_policy(&self, settings: &SessionSettings) -> OverflowPolicy {
        let policy = self.overflow_policy();
        match settings.compaction_threshold {
            Some(ratio) => policy.with_threshold_ratio(ratio),
            None => policy,
        }
    }

    #[must_use]
    pub fn session_context_options(&self, settings: &SessionSettings) -> ContextOptions {
        let mut options = self.context_options();
        if let Some(rounds) = settings.keep_tool_call_rounds {
            options.keep_tool_call_rounds = rounds;
        }
        if let Some(max) = settings.max_context_message_count {
            options.max_message_count = (max > 0).then_some(max);
        }
        options
    }

    #[must_use]
    pub fn summary_language<'a>(&'a self, settings: &'a SessionSettings) -> &'a str {
        settings
            .summary_language
            .as_deref()
            .filter(|language| !language.trim().is_empty())
            .unwrap_or(&self.compaction.summary_language)
    }

    #[must_use]
    pub fn model_registry(&self) -> ModelRegistry {
        ModelRegistry::with_overrides(self.models.clone())
    }

    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.scheduler.debounce_ms)
    }
}

//! Model metadata and registry.
//!
//! This module provides [`ModelInfo`] for the context window and capabilities
//! of a model, the [`ModelCatalog`] lookup seam consumed by overflow detection,
//! and [`ModelRegistry`], a prefix-matching implementation with exact-match
//! overrides.
//!
//! Unknown models resolve to `None`. Nothing downstream ever guesses a window.

use std::collections::HashMap;

use serde::Deserialize;

/// Context window and capabilities of one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ModelInfo {
    /// Maximum context window in tokens.
    pub context_window: u32,
    /// Whether the model can call tools (used to read large attachments
    /// through retrieval instead of inlining them).
    #[serde(default, rename = "tool_use")]
    pub supports_tool_use: bool,
}

impl ModelInfo {
    #[must_use]
    pub const fn new(context_window: u32, supports_tool_use: bool) -> Self {
        Self {
            context_window,
            supports_tool_use,
        }
    }
}

/// Model-metadata collaborator.
pub trait ModelCatalog: Send + Sync {
    /// Context window for `model_id`, or `None` when the model is unknown.
    fn context_window_for(&self, model_id: &str) -> Option<u32>;

    fn supports_tool_use(&self, _model_id: &str) -> bool {
        false
    }
}

/// Where model metadata came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelInfoSource {
    /// Exact match from an override.
    Override,
    /// Matched a known prefix (the matched prefix).
    Prefix(&'static str),
}

/// Known model prefixes and their metadata.
///
/// Ordered by specificity (more specific prefixes first) to ensure
/// correct matching when multiple prefixes could match.
const KNOWN_MODELS: &[(&str, ModelInfo)] = &[
    // Anthropic
    ("claude-opus-4", ModelInfo::new(200_000, true)),
    ("claude-sonnet-4", ModelInfo::new(200_000, true)),
    ("claude-3-7-sonnet", ModelInfo::new(200_000, true)),
    ("claude-3-5-haiku", ModelInfo::new(200_000, true)),
    // OpenAI
    ("gpt-4o-mini", ModelInfo::new(128_000, true)),
    ("gpt-4o", ModelInfo::new(128_000, true)),
    ("gpt-4.1", ModelInfo::new(1_047_576, true)),
    ("gpt-5", ModelInfo::new(400_000, true)),
    ("o4-mini", ModelInfo::new(200_000, true)),
    ("o3", ModelInfo::new(200_000, true)),
    // Google
    ("gemini-2.5-pro", ModelInfo::new(1_048_576, true)),
    ("gemini-2.5-flash", ModelInfo::new(1_048_576, true)),
    // DeepSeek
    ("deepseek-reasoner", ModelInfo::new(128_000, false)),
    ("deepseek-chat", ModelInfo::new(128_000, true)),
];

/// Registry of known model metadata with support for custom overrides.
///
/// Lookup order:
/// 1. Exact match in overrides
/// 2. Prefix match against known models
/// 3. `None`
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    overrides: HashMap<String, ModelInfo>,
}

impl ModelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            overrides: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_overrides(overrides: HashMap<String, ModelInfo>) -> Self {
        Self { overrides }
    }

    #[must_use]
    pub fn get(&self, model: &str) -> Option<(ModelInfo, ModelInfoSource)> {
        if let Some(info) = self.overrides.get(model) {
            return Some((*info, ModelInfoSource::Override));
        }

        KNOWN_MODELS
            .iter()
            .find(|(prefix, _)| model.starts_with(prefix))
            .map(|(prefix, info)| (*info, ModelInfoSource::Prefix(*prefix)))
    }

    /// Overrides take precedence over prefix matching for exact matches.
    pub fn set_override(&mut self, model: impl Into<String>, info: ModelInfo) {
        self.overrides.insert(model.into(), info);
    }

    pub fn remove_override(&mut self, model: &str) -> Option<ModelInfo> {
        self.overrides.remove(model)
    }
}

impl ModelCatalog for ModelRegistry {
    fn context_window_for(&self, model_id: &str) -> Option<u32> {
        let window = self
            .get(model_id)
            .map(|(info, _)| info.context_window)
            .filter(|window| *window > 0);
        if window.is_none() {
            tracing::debug!(model_id, "Unknown model; context window undetermined");
        }
        window
    }

    fn supports_tool_use(&self, model_id: &str) -> bool {
        self.get(model_id)
            .is_some_and(|(info, _)| info.supports_tool_use)
    }
}

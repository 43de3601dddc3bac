//! Request context and budget measurement for a session.

use std::sync::Arc;

use colloquy_context::{
    AttachmentSource, EstimateOptions, ModelCatalog, NoAttachmentSource, TokenCacheTarget,
    TokenCacheUpdate, TokenCounter, TokenizerProfile, apply_token_cache_updates, build_context,
};
use colloquy_types::{Message, Session, SessionId};

use crate::config::EngineConfig;
use crate::queue::SessionQueue;

/// Attachment contents available to the estimator.
pub type SharedAttachmentSource = Arc<dyn AttachmentSource + Send + Sync>;

/// Token budget of a session's current request context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextUsage {
    pub tokens: u32,
    /// `None` when the model's context window is unknown.
    pub threshold_tokens: Option<u32>,
    pub context_window: Option<u32>,
    pub is_overflow: bool,
}

impl ContextUsage {
    /// Tokens left before the compaction threshold.
    #[must_use]
    pub fn remaining(&self) -> Option<u32> {
        self.threshold_tokens
            .map(|threshold| threshold.saturating_sub(self.tokens))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Measurement {
    pub usage: ContextUsage,
    /// Counts computed while measuring that are not cached on the session yet.
    pub updates: Vec<TokenCacheUpdate>,
}

/// Builds request contexts and measures them against a model's window.
#[derive(Clone)]
pub struct ContextMeter {
    config: Arc<EngineConfig>,
    models: Arc<dyn ModelCatalog>,
    attachments: SharedAttachmentSource,
    counter: TokenCounter,
}

impl ContextMeter {
    pub fn new(config: Arc<EngineConfig>, models: Arc<dyn ModelCatalog>) -> Self {
        Self {
            config,
            models,
            attachments: Arc::new(NoAttachmentSource),
            counter: TokenCounter::new(),
        }
    }

    #[must_use]
    pub fn with_attachments(mut self, attachments: SharedAttachmentSource) -> Self {
        self.attachments = attachments;
        self
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn counter(&self) -> TokenCounter {
        self.counter
    }

    #[must_use]
    pub fn estimate_options(&self, model_id: &str) -> EstimateOptions {
        EstimateOptions {
            profile: TokenizerProfile::for_model(model_id),
            supports_tool_use: self.models.supports_tool_use(model_id),
        }
    }

    /// Messages to send to the model for `session`.
    #[must_use]
    pub fn request_context(&self, session: &Session) -> Vec<Message> {
        let options = self.config.session_context_options(&session.settings);
        build_context(&session.messages, &session.compaction_points, &options)
    }

    /// Measures the request context of `session` for `model_id`.
    ///
    /// Message counts are only offered for caching when the measured copy
    /// carries the same content as the stored message; copies pruned of
    /// tool calls are counted but never cached.
    #[must_use]
    pub fn measure(&self, session: &Session, model_id: &str) -> Measurement {
        let context = self.request_context(session);
        let mut estimate = self.counter.estimate_conversation(
            &context,
            self.estimate_options(model_id),
            self.attachments.as_ref(),
        );
        estimate
            .updates
            .retain(|update| matches_stored(update, session, &context));

        let context_window = self.models.context_window_for(model_id);
        let check = self
            .config
            .session_overflow_policy(&session.settings)
            .check(estimate.total, context_window);

        Measurement {
            usage: ContextUsage {
                tokens: estimate.total,
                threshold_tokens: check.threshold_tokens,
                context_window,
                is_overflow: check.is_overflow,
            },
            updates: estimate.updates,
        }
    }

    /// Sum of message and attachment costs for `messages`.
    #[must_use]
    pub fn estimate_tokens(&self, messages: &[Message], model_id: &str) -> u32 {
        self.counter
            .estimate_conversation(
                messages,
                self.estimate_options(model_id),
                self.attachments.as_ref(),
            )
            .total
    }
}

fn matches_stored(update: &TokenCacheUpdate, session: &Session, context: &[Message]) -> bool {
    let TokenCacheTarget::Message(id) = &update.target else {
        return true;
    };
    let measured = context.iter().find(|message| &message.id == id);
    match (measured, session.find_message(id)) {
        (Some(measured), Some(stored)) => measured.content_parts() == stored.content_parts(),
        _ => false,
    }
}

/// Writes freshly computed token counts back through the queue.
///
/// The cache is an optimization: failures are logged and otherwise ignored.
pub(crate) async fn store_token_cache(
    queue: &SessionQueue,
    session_id: &SessionId,
    updates: Vec<TokenCacheUpdate>,
) {
    if updates.is_empty() {
        return;
    }
    let result = queue
        .update(session_id, |session| {
            let applied = apply_token_cache_updates(&mut session.messages, &updates);
            tracing::trace!(session_id = %session.id, applied, "Refreshed token cache");
        })
        .await;
    if let Err(err) = result {
        tracing::debug!(session_id = %session_id, error = %err, "Failed to store token cache");
    }
}

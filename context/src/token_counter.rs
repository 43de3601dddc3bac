//! Heuristic token estimation.
//!
//! Counts are **estimates**, not provider-exact tokenization:
//!
//! - **Default profile**: `o200k_base` BPE from tiktoken, a reasonable
//!   approximation for most current model families. Falls back to byte length
//!   if the encoder cannot be loaded.
//! - **DeepSeek profile**: the provider's published linear heuristic. CJK
//!   characters weigh ~0.6 tokens, ASCII ~0.3.
//!
//! Per-message framing overhead (`TOKENS_PER_MESSAGE`, plus one token for a
//! `name`) is added on top of content.
//!
//! Counting never mutates its input. Cache misses are reported as
//! [`TokenCacheUpdate`]s so the caller can persist them through the session
//! update queue.

use std::sync::OnceLock;

use tiktoken_rs::{CoreBPE, o200k_base};
use unicode_script::{Script, UnicodeScript};

use colloquy_types::{Attachment, ContentPart, Message, MessageId};

/// Fixed role-framing overhead per message.
pub const TOKENS_PER_MESSAGE: u32 = 3;
/// Extra overhead when a message carries a `name`.
pub const TOKENS_PER_NAME: u32 = 1;
/// Attachments longer than this are read through retrieval tools when the
/// model supports them, so only their preview is charged.
pub const PREVIEW_LINE_THRESHOLD: u32 = 500;

/// The tiktoken encoder is expensive to initialize (loads vocabulary data),
/// so we create it once and reuse it across all `TokenCounter` instances.
static ENCODER: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn get_encoder() -> Option<&'static CoreBPE> {
    ENCODER.get_or_init(|| o200k_base().ok()).as_ref()
}

/// Named token-estimation heuristic associated with a model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TokenizerProfile {
    #[default]
    Default,
    DeepSeek,
}

impl TokenizerProfile {
    #[must_use]
    pub fn for_model(model_id: &str) -> Self {
        if model_id.to_ascii_lowercase().contains("deepseek") {
            TokenizerProfile::DeepSeek
        } else {
            TokenizerProfile::Default
        }
    }

    /// Key of the full-content count in a `TokenCountMap`.
    #[must_use]
    pub const fn cache_key(self) -> &'static str {
        match self {
            TokenizerProfile::Default => "default",
            TokenizerProfile::DeepSeek => "deepseek",
        }
    }

    /// Key of the cheap preview count in a `TokenCountMap`.
    #[must_use]
    pub const fn preview_key(self) -> &'static str {
        match self {
            TokenizerProfile::Default => "default_preview",
            TokenizerProfile::DeepSeek => "deepseek_preview",
        }
    }
}

/// Supplies preprocessed attachment text for attachments whose count is not
/// cached yet.
pub trait AttachmentSource {
    fn load_text(&self, storage_key: &str) -> Option<String>;
}

/// Source for callers that never compute attachment counts on the fly.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAttachmentSource;

impl AttachmentSource for NoAttachmentSource {
    fn load_text(&self, _storage_key: &str) -> Option<String> {
        None
    }
}

impl<S: std::hash::BuildHasher> AttachmentSource
    for std::collections::HashMap<String, String, S>
{
    fn load_text(&self, storage_key: &str) -> Option<String> {
        self.get(storage_key).cloned()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EstimateOptions {
    pub profile: TokenizerProfile,
    /// Whether the consuming model can read large attachments through tools.
    pub supports_tool_use: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenCacheTarget {
    Message(MessageId),
    File {
        message_id: MessageId,
        file_id: String,
    },
    Link {
        message_id: MessageId,
        link_id: String,
    },
}

/// A freshly computed count that should be written back to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenCacheUpdate {
    pub target: TokenCacheTarget,
    pub profile: TokenizerProfile,
    pub count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationEstimate {
    pub total: u32,
    pub updates: Vec<TokenCacheUpdate>,
}

/// Thread-safe approximate token counter.
///
/// Uses a singleton `o200k_base` encoder instance for the default profile.
#[derive(Clone, Copy)]
pub struct TokenCounter {
    encoder: Option<&'static CoreBPE>,
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCounter")
            .field("encoder", &self.encoder.as_ref().map(|_| "<CoreBPE>"))
            .finish()
    }
}

impl TokenCounter {
    #[must_use]
    pub fn new() -> Self {
        let encoder = get_encoder();
        if encoder.is_none() {
            tracing::error!(
                "Failed to initialize tiktoken o200k_base encoder. Falling back to byte-length estimates."
            );
        }

        Self { encoder }
    }

    /// Estimates the tokens in a string under `profile`.
    #[must_use]
    pub fn count_str(&self, text: &str, profile: TokenizerProfile) -> u32 {
        match profile {
            TokenizerProfile::Default => {
                let len = match self.encoder {
                    Some(encoder) => encoder.encode_ordinary(text).len(),
                    None => text.len(),
                };
                u32::try_from(len).unwrap_or(u32::MAX)
            }
            TokenizerProfile::DeepSeek => count_linear(text),
        }
    }

    /// Uncached cost of a message: framing overhead plus countable parts.
    ///
    /// Image, reasoning and info parts are not replayed as text and only
    /// contribute the framing overhead.
    #[must_use]
    pub fn count_message(&self, message: &Message, profile: TokenizerProfile) -> u32 {
        let mut total = TOKENS_PER_MESSAGE;
        if message.name.is_some() {
            total += TOKENS_PER_NAME;
        }

        for part in message.content_parts() {
            let part_tokens = match part {
                ContentPart::Text { text } => self.count_str(text, profile),
                ContentPart::ToolCall {
                    tool_name,
                    args,
                    result,
                    ..
                } => {
                    let args_tokens = self.count_json(args, profile);
                    let result_tokens = result
                        .as_ref()
                        .map_or(0, |value| self.count_json(value, profile));
                    self.count_str(tool_name, profile) + args_tokens + result_tokens
                }
                ContentPart::Image { .. }
                | ContentPart::Reasoning { .. }
                | ContentPart::Info { .. } => 0,
            };
            total = total.saturating_add(part_tokens);
        }

        total
    }

    /// Message cost, read from the message's cache when present.
    ///
    /// Returns the count and whether it had to be computed.
    #[must_use]
    pub fn message_tokens(&self, message: &Message, profile: TokenizerProfile) -> (u32, bool) {
        match message.token_count_map().get(profile.cache_key()) {
            Some(cached) => (cached, false),
            None => (self.count_message(message, profile), true),
        }
    }

    /// Attachment cost under `options`.
    ///
    /// Large attachments (known line count above [`PREVIEW_LINE_THRESHOLD`])
    /// charge the cached preview cost when the model supports tool use.
    /// Without a preview, or without a known line count, the full cost is
    /// charged. Returns the count and whether the full-content count had to
    /// be computed from the attachment text.
    #[must_use]
    pub fn attachment_tokens(
        &self,
        attachment: &dyn Attachment,
        options: EstimateOptions,
        source: &dyn AttachmentSource,
    ) -> (u32, bool) {
        let profile = options.profile;
        let counts = attachment.token_count_map();

        let is_large = attachment
            .line_count()
            .is_some_and(|lines| lines > PREVIEW_LINE_THRESHOLD);
        if is_large
            && options.supports_tool_use
            && let Some(preview) = counts.get(profile.preview_key())
        {
            return (preview, false);
        }

        if let Some(full) = counts.get(profile.cache_key()) {
            return (full, false);
        }

        let Some(text) = attachment
            .storage_key()
            .and_then(|key| source.load_text(key))
        else {
            tracing::debug!(
                attachment_id = attachment.attachment_id(),
                "No cached count or content for attachment; charging zero"
            );
            return (0, false);
        };

        (self.count_str(&text, profile), true)
    }

    /// Sums message and attachment costs for a whole conversation.
    #[must_use]
    pub fn estimate_conversation(
        &self,
        messages: &[Message],
        options: EstimateOptions,
        source: &dyn AttachmentSource,
    ) -> ConversationEstimate {
        let profile = options.profile;
        let mut estimate = ConversationEstimate::default();

        for message in messages {
            let (tokens, computed) = self.message_tokens(message, profile);
            if computed {
                estimate.updates.push(TokenCacheUpdate {
                    target: TokenCacheTarget::Message(message.id.clone()),
                    profile,
                    count: tokens,
                });
            }
            estimate.total = estimate.total.saturating_add(tokens);

            for file in &message.files {
                let (tokens, computed) = self.attachment_tokens(file, options, source);
                if computed {
                    estimate.updates.push(TokenCacheUpdate {
                        target: TokenCacheTarget::File {
                            message_id: message.id.clone(),
                            file_id: file.id.clone(),
                        },
                        profile,
                        count: tokens,
                    });
                }
                estimate.total = estimate.total.saturating_add(tokens);
            }

            for link in &message.links {
                let (tokens, computed) = self.attachment_tokens(link, options, source);
                if computed {
                    estimate.updates.push(TokenCacheUpdate {
                        target: TokenCacheTarget::Link {
                            message_id: message.id.clone(),
                            link_id: link.id.clone(),
                        },
                        profile,
                        count: tokens,
                    });
                }
                estimate.total = estimate.total.saturating_add(tokens);
            }
        }

        estimate
    }

    fn count_json(&self, value: &serde_json::Value, profile: TokenizerProfile) -> u32 {
        match value {
            serde_json::Value::Null => 0,
            serde_json::Value::String(s) => self.count_str(s, profile),
            other => match serde_json::to_string(other) {
                Ok(s) => self.count_str(&s, profile),
                Err(_) => 0,
            },
        }
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes computed counts back into the messages they belong to.
///
/// Updates whose target no longer exists are skipped; returns how many were
/// applied.
pub fn apply_token_cache_updates(messages: &mut [Message], updates: &[TokenCacheUpdate]) -> usize {
    let mut applied = 0;
    for update in updates {
        let key = update.profile.cache_key();
        let is_default = update.profile == TokenizerProfile::Default;
        let hit = match &update.target {
            TokenCacheTarget::Message(id) => messages
                .iter_mut()
                .find(|m| &m.id == id)
                .map(|m| m.cache_token_count(key, update.count, is_default)),
            TokenCacheTarget::File {
                message_id,
                file_id,
            } => messages
                .iter_mut()
                .find(|m| &m.id == message_id)
                .and_then(|m| m.files.iter_mut().find(|f| &f.id == file_id))
                .map(|f| f.token_count_map.insert(key, update.count)),
            TokenCacheTarget::Link {
                message_id,
                link_id,
            } => messages
                .iter_mut()
                .find(|m| &m.id == message_id)
                .and_then(|m| m.links.iter_mut().find(|l| &l.id == link_id))
                .map(|l| l.token_count_map.insert(key, update.count)),
        };
        if hit.is_some() {
            applied += 1;
        }
    }
    applied
}

/// Linear heuristic: weights are kept in tenths of a token so the sum is
/// exact integer arithmetic.
fn count_linear(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    let tenths: u64 = text.chars().map(linear_weight_tenths).sum();
    u32::try_from(tenths.div_ceil(10)).unwrap_or(u32::MAX).max(1)
}

fn linear_weight_tenths(c: char) -> u64 {
    if c.is_ascii() {
        return 3;
    }
    match c.script() {
        Script::Latin
        | Script::Greek
        | Script::Cyrillic
        | Script::Armenian
        | Script::Hebrew
        | Script::Arabic => 3,
        // CJK scripts, plus symbols and emoji under Common/Inherited, are
        // charged at the heavier rate.
        _ => 6,
    }
}

//! Context budgeting for conversations.
//!
//! This crate provides:
//! - Token estimation with per-model tokenizer profiles and cached counts
//! - Model context windows and overflow detection
//! - Projection of a conversation onto its latest compaction point
//! - Fork branch maintenance
//! - Summarization prompt construction
//!
//! # Architecture
//!
//! ```text
//! messages ─► TokenCounter ─► OverflowPolicy ─► (compaction, in the engine)
//!     │
//!     └────► build_context: project ─► limit_message_count ─► clean_tool_calls
//! ```
//!
//! Everything here is synchronous and pure: inputs are borrowed, results are
//! returned as new values.

mod forks;
mod model_limits;
mod overflow;
mod summarization;
mod token_counter;
mod working_context;

pub use forks::{
    ForkDirection, ForkError, ForkState, cleanup_empty_fork_branches, create_fork, switch_fork,
};
pub use model_limits::{ModelCatalog, ModelInfo, ModelInfoSource, ModelRegistry};
pub use overflow::{
    DEFAULT_OUTPUT_RESERVE, DEFAULT_THRESHOLD_RATIO, OverflowCheck, OverflowPolicy,
    check_overflow, sanitize_ratio,
};
pub use summarization::{
    DEFAULT_SUMMARY_LANGUAGE, MAX_SUMMARY_TOKENS, MIN_SUMMARY_TOKENS, SummaryPrompt,
    SummaryRequest, build_summarization_prompt, summary_target_tokens,
};
pub use token_counter::{
    AttachmentSource, ConversationEstimate, EstimateOptions, NoAttachmentSource,
    PREVIEW_LINE_THRESHOLD, TOKENS_PER_MESSAGE, TOKENS_PER_NAME, TokenCacheTarget,
    TokenCacheUpdate, TokenCounter, TokenizerProfile, apply_token_cache_updates,
};
pub use working_context::{
    ContextOptions, DEFAULT_KEEP_TOOL_CALL_ROUNDS, Projection, build_context, clean_tool_calls,
    latest_compaction_point, limit_message_count, project,
};

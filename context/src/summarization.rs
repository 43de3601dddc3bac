//! Summarization prompt construction.
//!
//! The engine never talks to a model directly. It hands a [`SummaryRequest`]
//! to its text-generation collaborator, which may render it with
//! [`build_summarization_prompt`] or use its own prompt.

use std::fmt::Write;

use colloquy_types::{ContentPart, Message, Role};

pub const MIN_SUMMARY_TOKENS: u32 = 64;
pub const MAX_SUMMARY_TOKENS: u32 = 2048;
pub const DEFAULT_SUMMARY_LANGUAGE: &str = "English";

/// Summaries aim for roughly a quarter of the span they replace.
const SUMMARY_RATIO_DIVISOR: u32 = 4;

/// Everything a summarizer needs to replace a span of conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRequest {
    /// Messages to summarize, oldest first.
    pub messages: Vec<Message>,
    /// Body of the summary this one supersedes, if any.
    pub previous_summary: Option<String>,
    pub target_language: String,
    pub target_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryPrompt {
    pub system: String,
    pub transcript: String,
}

/// Target summary length for a span of `span_tokens`.
#[must_use]
pub fn summary_target_tokens(span_tokens: u32) -> u32 {
    (span_tokens / SUMMARY_RATIO_DIVISOR).clamp(MIN_SUMMARY_TOKENS, MAX_SUMMARY_TOKENS)
}

/// Builds the system instruction and the transcript for a summary request.
#[must_use]
pub fn build_summarization_prompt(request: &SummaryRequest) -> SummaryPrompt {
    let target_tokens = request
        .target_tokens
        .clamp(MIN_SUMMARY_TOKENS, MAX_SUMMARY_TOKENS);
    let language = if request.target_language.trim().is_empty() {
        DEFAULT_SUMMARY_LANGUAGE
    } else {
        request.target_language.trim()
    };

    let system = format!(
        r"You are a conversation summarizer. Your task is to create a concise summary of the following conversation so it can continue without the original messages.

REQUIREMENTS:
1. Preserve all key facts, decisions, and important context
2. Maintain the chronological flow of topics discussed
3. Keep the summary under approximately {target_tokens} tokens
4. Preserve code snippets, file paths, identifiers and numbers that are essential
5. Note any unresolved questions or pending actions
6. If a previous summary is provided, merge it into the new summary instead of repeating it verbatim
7. Write the summary in {language}

OUTPUT FORMAT:
Start directly with the content. Do not include a preamble such as 'This conversation...' or 'Summary:'."
    );

    let mut transcript = String::new();
    if let Some(previous) = request
        .previous_summary
        .as_deref()
        .filter(|s| !s.trim().is_empty())
    {
        let _ = write!(transcript, "[Previous summary]\n{previous}\n\n");
    }

    for (index, message) in request.messages.iter().enumerate() {
        render_message(&mut transcript, index, message);
    }

    SummaryPrompt { system, transcript }
}

fn render_message(out: &mut String, index: usize, message: &Message) {
    let role = match message.role {
        Role::System => "System",
        Role::User => "User",
        Role::Assistant => "Assistant",
    };

    let text = message.text_content();
    if !text.trim().is_empty() {
        let _ = write!(out, "[Message {index}] {role}: {text}\n\n");
    }

    for part in message.content_parts() {
        if let ContentPart::ToolCall {
            tool_name,
            args,
            result,
            ..
        } = part
        {
            let args = serde_json::to_string(args).unwrap_or_else(|_| "{}".to_string());
            let _ = write!(out, "[Message {index}] {role} (Tool Call: {tool_name}): {args}\n\n");
            if let Some(result) = result {
                let result = match result {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let _ = write!(out, "[Message {index}] Tool Result ({tool_name}): {result}\n\n");
            }
        }
    }

    for file in &message.files {
        let _ = write!(out, "[Message {index}] Attached file: {}\n\n", file.name);
    }
    for link in &message.links {
        let _ = write!(out, "[Message {index}] Attached link: {}\n\n", link.url);
    }
}

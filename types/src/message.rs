//! Core message domain model.
//!
//! A [`Message`] is an ordered list of typed [`ContentPart`]s plus metadata.
//! Constructors take the timestamp explicitly; callers own the clock.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::MessageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One typed piece of message content. Order within a message is significant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        storage_key: String,
    },
    Reasoning {
        text: String,
    },
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        #[serde(default)]
        args: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    Info {
        text: String,
    },
}

impl ContentPart {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    #[must_use]
    pub fn tool_call(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        args: Value,
        result: Option<Value>,
    ) -> Self {
        ContentPart::ToolCall {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            args,
            result,
        }
    }

    #[must_use]
    pub fn is_tool_call(&self) -> bool {
        matches!(self, ContentPart::ToolCall { .. })
    }
}

/// Memoized token counts keyed by tokenizer-profile key
/// (`"default"`, `"deepseek"`, `"default_preview"`, ...).
///
/// A missing key means "not yet computed for this profile".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenCountMap(BTreeMap<String, u32>);

impl TokenCountMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<u32> {
        self.0.get(key).copied()
    }

    pub fn insert(&mut self, key: impl Into<String>, count: u32) {
        self.0.insert(key.into(), count);
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<K: Into<String>> FromIterator<(K, u32)> for TokenCountMap {
    fn from_iter<I: IntoIterator<Item = (K, u32)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Common view over message attachments for token accounting.
pub trait Attachment {
    fn attachment_id(&self) -> &str;
    /// Key under which the preprocessed text content is stored, if any.
    fn storage_key(&self) -> Option<&str>;
    /// Number of lines in the preprocessed content; `None` when unknown.
    fn line_count(&self) -> Option<u32>;
    fn token_count_map(&self) -> &TokenCountMap;
    fn token_count_map_mut(&mut self) -> &mut TokenCountMap;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageFile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub file_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_length: Option<u64>,
    #[serde(default, skip_serializing_if = "TokenCountMap::is_empty")]
    pub token_count_map: TokenCountMap,
}

impl Attachment for MessageFile {
    fn attachment_id(&self) -> &str {
        &self.id
    }

    fn storage_key(&self) -> Option<&str> {
        self.storage_key.as_deref()
    }

    fn line_count(&self) -> Option<u32> {
        self.line_count
    }

    fn token_count_map(&self) -> &TokenCountMap {
        &self.token_count_map
    }

    fn token_count_map_mut(&mut self) -> &mut TokenCountMap {
        &mut self.token_count_map
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageLink {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_count: Option<u32>,
    #[serde(default, skip_serializing_if = "TokenCountMap::is_empty")]
    pub token_count_map: TokenCountMap,
}

impl Attachment for MessageLink {
    fn attachment_id(&self) -> &str {
        &self.id
    }

    fn storage_key(&self) -> Option<&str> {
        self.storage_key.as_deref()
    }

    fn line_count(&self) -> Option<u32> {
        self.line_count
    }

    fn token_count_map(&self) -> &TokenCountMap {
        &self.token_count_map
    }

    fn token_count_map_mut(&mut self) -> &mut TokenCountMap {
        &mut self.token_count_map
    }
}

/// A single conversation message.
///
/// Content parts and the message-level token cache are private: replacing the
/// content always invalidates the cache, so a stale count can never be read
/// back for edited content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    #[serde(default)]
    content_parts: Vec<ContentPart>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_summary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token_count: Option<u32>,
    #[serde(default, skip_serializing_if = "TokenCountMap::is_empty")]
    token_count_map: TokenCountMap,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<MessageFile>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<MessageLink>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub generating: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i32>,
}

impl Message {
    #[must_use]
    pub fn new(role: Role, content_parts: Vec<ContentPart>, timestamp: i64) -> Self {
        Self {
            id: MessageId::generate(),
            role,
            content_parts,
            timestamp,
            name: None,
            is_summary: false,
            token_count: None,
            token_count_map: TokenCountMap::new(),
            files: Vec::new(),
            links: Vec::new(),
            generating: false,
            error: None,
            error_code: None,
        }
    }

    #[must_use]
    pub fn text(role: Role, text: impl Into<String>, timestamp: i64) -> Self {
        Self::new(role, vec![ContentPart::text(text)], timestamp)
    }

    #[must_use]
    pub fn user(text: impl Into<String>, timestamp: i64) -> Self {
        Self::text(Role::User, text, timestamp)
    }

    #[must_use]
    pub fn assistant(text: impl Into<String>, timestamp: i64) -> Self {
        Self::text(Role::Assistant, text, timestamp)
    }

    /// A compaction summary message.
    #[must_use]
    pub fn summary(text: impl Into<String>, timestamp: i64) -> Self {
        let mut message = Self::text(Role::System, text, timestamp);
        message.is_summary = true;
        message
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<MessageId>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn content_parts(&self) -> &[ContentPart] {
        &self.content_parts
    }

    /// Replace the content; clears every cached token count.
    pub fn set_content_parts(&mut self, parts: Vec<ContentPart>) {
        self.content_parts = parts;
        self.invalidate_token_cache();
    }

    /// Append streamed text to the trailing text part (creating one if needed).
    pub fn append_text(&mut self, delta: &str) {
        match self.content_parts.last_mut() {
            Some(ContentPart::Text { text }) => text.push_str(delta),
            _ => self.content_parts.push(ContentPart::text(delta)),
        }
        self.invalidate_token_cache();
    }

    /// Concatenated text of all `Text` parts.
    #[must_use]
    pub fn text_content(&self) -> String {
        self.content_parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        self.content_parts.iter().any(ContentPart::is_tool_call)
    }

    /// Copy of this message with every tool-call part removed.
    #[must_use]
    pub fn without_tool_calls(&self) -> Self {
        let mut copy = self.clone();
        copy.content_parts.retain(|part| !part.is_tool_call());
        if copy.content_parts.len() != self.content_parts.len() {
            copy.invalidate_token_cache();
        }
        copy
    }

    #[must_use]
    pub fn token_count(&self) -> Option<u32> {
        self.token_count
    }

    #[must_use]
    pub fn token_count_map(&self) -> &TokenCountMap {
        &self.token_count_map
    }

    /// Record a computed count for `profile_key`. `is_default` also fills the
    /// legacy single-value `token_count` field.
    pub fn cache_token_count(&mut self, profile_key: &str, count: u32, is_default: bool) {
        self.token_count_map.insert(profile_key, count);
        if is_default {
            self.token_count = Some(count);
        }
    }

    fn invalidate_token_cache(&mut self) {
        self.token_count = None;
        self.token_count_map.clear();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ContentPart, Message, Role};

    #[test]
    fn content_part_serializes_with_kebab_tag() {
        let part = ContentPart::tool_call("c1", "search", json!({"q": "rust"}), None);
        let value = serde_json::to_value(&part).expect("serialize");
        assert_eq!(value["type"], "tool-call");
        assert_eq!(value["toolCallId"], "c1");
        assert_eq!(value["toolName"], "search");
    }

    #[test]
    fn message_round_trips_optional_fields() {
        let raw = json!({
            "id": "m1",
            "role": "assistant",
            "contentParts": [{"type": "text", "text": "hi"}],
            "timestamp": 5,
            "isSummary": true,
            "tokenCountMap": {"default": 7}
        });
        let message: Message = serde_json::from_value(raw).expect("deserialize");
        assert_eq!(message.role, Role::Assistant);
        assert!(message.is_summary);
        assert_eq!(message.token_count_map().get("default"), Some(7));
        assert!(message.files.is_empty());
    }

    #[test]
    fn editing_content_clears_token_cache() {
        let mut message = Message::user("hello", 0);
        message.cache_token_count("default", 4, true);
        assert_eq!(message.token_count(), Some(4));

        message.append_text(" world");

        assert_eq!(message.text_content(), "hello world");
        assert_eq!(message.token_count(), None);
        assert!(message.token_count_map().is_empty());
    }

    #[test]
    fn without_tool_calls_preserves_other_parts_in_order() {
        let message = Message::new(
            Role::Assistant,
            vec![
                ContentPart::Reasoning { text: "think".into() },
                ContentPart::tool_call("c1", "search", json!({}), Some(json!("ok"))),
                ContentPart::text("answer"),
            ],
            0,
        );

        let stripped = message.without_tool_calls();

        assert_eq!(
            stripped.content_parts(),
            &[
                ContentPart::Reasoning { text: "think".into() },
                ContentPart::text("answer"),
            ]
        );
        assert!(message.has_tool_calls());
    }
}

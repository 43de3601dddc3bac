//! Session, thread, compaction-point and fork-branch model.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, SessionId, ThreadId};
use crate::message::Message;

/// Marks a summary message that replaces every message up to and including
/// `boundary_message_id`.
///
/// Only the point with the greatest `created_at` is authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionPoint {
    pub summary_message_id: MessageId,
    pub boundary_message_id: MessageId,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkBranch {
    pub id: String,
    /// Stored continuation. Empty for the branch currently materialized inline.
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl ForkBranch {
    #[must_use]
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            id: MessageId::generate().to_string(),
            messages,
        }
    }
}

/// Alternate continuations after a forking message.
///
/// `position` indexes the active branch in `lists`; that branch's messages live
/// inline in the conversation after the fork point, every other branch is
/// held in `lists[i].messages`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageForkEntry {
    pub position: usize,
    pub lists: Vec<ForkBranch>,
    #[serde(default)]
    pub created_at: i64,
}

/// Fork entries keyed by the id of the forking message.
pub type ForkHash = BTreeMap<MessageId, MessageForkEntry>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionThread {
    pub id: ThreadId,
    pub name: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compaction_points: Vec<CompactionPoint>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    #[default]
    Chat,
    Picture,
}

/// Per-session overrides. `None` means "use the engine-wide default".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_compaction: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compaction_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_context_message_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_tool_call_rounds: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub session_type: SessionType,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub threads: Vec<SessionThread>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compaction_points: Vec<CompactionPoint>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub message_forks_hash: ForkHash,
    #[serde(default)]
    pub settings: SessionSettings,
}

impl Session {
    #[must_use]
    pub fn new(id: impl Into<SessionId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            session_type: SessionType::Chat,
            messages: Vec::new(),
            threads: Vec::new(),
            compaction_points: Vec::new(),
            message_forks_hash: ForkHash::new(),
            settings: SessionSettings::default(),
        }
    }

    #[must_use]
    pub fn message_index(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == id)
    }

    /// Finds a message in the main list or in any thread.
    #[must_use]
    pub fn find_message(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id).or_else(|| {
            self.threads
                .iter()
                .flat_map(|t| t.messages.iter())
                .find(|m| &m.id == id)
        })
    }

    pub fn find_message_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        if let Some(index) = self.message_index(id) {
            return self.messages.get_mut(index);
        }
        self.threads
            .iter_mut()
            .flat_map(|t| t.messages.iter_mut())
            .find(|m| &m.id == id)
    }

    #[must_use]
    pub fn thread(&self, id: &ThreadId) -> Option<&SessionThread> {
        self.threads.iter().find(|t| &t.id == id)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Session, SessionType};
    use crate::{Message, MessageId};

    #[test]
    fn session_deserializes_with_missing_optional_collections() {
        let session: Session =
            serde_json::from_value(json!({"id": "s1", "messages": []})).expect("deserialize");
        assert_eq!(session.session_type, SessionType::Chat);
        assert!(session.threads.is_empty());
        assert!(session.compaction_points.is_empty());
        assert!(session.message_forks_hash.is_empty());
    }

    #[test]
    fn find_message_searches_threads() {
        let mut session = Session::new("s1", "test");
        session.messages.push(Message::user("main", 1).with_id("a"));
        session.threads.push(super::SessionThread {
            id: "t1".into(),
            name: "old".into(),
            messages: vec![Message::user("archived", 0).with_id("x")],
            created_at: 0,
            compaction_points: Vec::new(),
        });

        assert!(session.find_message(&MessageId::new("a")).is_some());
        assert_eq!(
            session
                .find_message(&MessageId::new("x"))
                .map(Message::text_content),
            Some("archived".to_string())
        );
        assert!(session.find_message(&MessageId::new("nope")).is_none());
    }
}

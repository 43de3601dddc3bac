//! Working context projection.
//!
//! Derives the exact ordered list of messages sent to the model from the full
//! message log and its compaction points. The source list is never mutated;
//! every function here returns fresh copies.
//!
//! ```text
//! messages:  A  B  C  D  S          point { boundary: B, summary: S }
//! context:   S  C  D
//! ```

use colloquy_types::{CompactionPoint, Message, Role};

/// Complete rounds (newest first) that keep their tool-call parts.
pub const DEFAULT_KEEP_TOOL_CALL_ROUNDS: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextOptions {
    /// Negative values behave like 0.
    pub keep_tool_call_rounds: i32,
    /// Keep only the last N messages. `None` means unlimited.
    pub max_message_count: Option<usize>,
    /// Allow N+1 messages when the cut would separate an assistant reply from
    /// the user message that prompted it.
    pub preserve_last_user_turn: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            keep_tool_call_rounds: DEFAULT_KEEP_TOOL_CALL_ROUNDS,
            max_message_count: None,
            preserve_last_user_turn: true,
        }
    }
}

/// The compaction-aware view of a message log, before count limits and
/// tool-call pruning.
#[derive(Debug, Clone, Copy)]
pub struct Projection<'a> {
    /// The authoritative compaction point, if one applied.
    pub point: Option<&'a CompactionPoint>,
    /// Summary message of that point, if it still exists.
    pub summary: Option<&'a Message>,
    /// Messages after the boundary (or the whole log), summaries excluded.
    pub tail: &'a [Message],
}

impl<'a> Projection<'a> {
    /// Summary followed by the non-summary tail messages.
    pub fn messages(self) -> impl Iterator<Item = &'a Message> {
        self.summary
            .into_iter()
            .chain(self.tail.iter().filter(|m| !m.is_summary))
    }

    #[must_use]
    pub fn to_messages(&self) -> Vec<Message> {
        self.messages().cloned().collect()
    }

    /// Whether a compaction point applied.
    #[must_use]
    pub fn is_compacted(&self) -> bool {
        self.point.is_some()
    }
}

/// The point with the greatest `created_at`.
///
/// Ties resolve to the first point in storage order. That rule is
/// implementation-defined, kept only so repeated builds are stable.
#[must_use]
pub fn latest_compaction_point(points: &[CompactionPoint]) -> Option<&CompactionPoint> {
    points.iter().fold(None, |best, point| match best {
        Some(current) if current.created_at >= point.created_at => Some(current),
        _ => Some(point),
    })
}

/// Applies the latest compaction point to `messages`.
///
/// A boundary that no longer exists degrades to the uncompacted view.
#[must_use]
pub fn project<'a>(messages: &'a [Message], points: &'a [CompactionPoint]) -> Projection<'a> {
    let uncompacted = Projection {
        point: None,
        summary: None,
        tail: messages,
    };

    let Some(point) = latest_compaction_point(points) else {
        return uncompacted;
    };

    let Some(boundary) = messages
        .iter()
        .position(|m| m.id == point.boundary_message_id)
    else {
        tracing::debug!(
            boundary = %point.boundary_message_id,
            "Compaction boundary not found; using full context"
        );
        return uncompacted;
    };

    let summary = messages
        .iter()
        .find(|m| m.id == point.summary_message_id);

    Projection {
        point: Some(point),
        summary,
        tail: &messages[boundary + 1..],
    }
}

/// Builds the request context: compaction projection, message-count limit,
/// then tool-call pruning.
#[must_use]
pub fn build_context(
    messages: &[Message],
    points: &[CompactionPoint],
    options: &ContextOptions,
) -> Vec<Message> {
    let projected = project(messages, points).to_messages();

    let limited = match options.max_message_count {
        Some(max) => limit_message_count(projected, max, options.preserve_last_user_turn),
        None => projected,
    };

    clean_tool_calls(&limited, options.keep_tool_call_rounds)
}

/// Keeps the last `max` messages, or `max + 1` when `preserve_last_user_turn`
/// would otherwise start the window on an assistant reply.
#[must_use]
pub fn limit_message_count(
    mut messages: Vec<Message>,
    max: usize,
    preserve_last_user_turn: bool,
) -> Vec<Message> {
    if messages.len() <= max {
        return messages;
    }
    if max == 0 {
        return Vec::new();
    }

    let mut start = messages.len() - max;
    if preserve_last_user_turn
        && messages[start].role == Role::Assistant
        && messages[start - 1].role == Role::User
    {
        start -= 1;
    }
    messages.split_off(start)
}

/// Strips tool-call parts from every message older than the newest
/// `keep_rounds` complete rounds. Other part types are preserved.
///
/// A round is a user message followed (eventually) by an assistant message.
/// Applying this twice with the same `keep_rounds` is a no-op the second time.
#[must_use]
pub fn clean_tool_calls(messages: &[Message], keep_rounds: i32) -> Vec<Message> {
    let keep_rounds = usize::try_from(keep_rounds).unwrap_or(0);
    let cutoff = tool_call_cutoff(messages, keep_rounds);

    messages
        .iter()
        .enumerate()
        .map(|(index, message)| {
            if index < cutoff && message.has_tool_calls() {
                message.without_tool_calls()
            } else {
                message.clone()
            }
        })
        .collect()
}

/// Index of the first message whose tool calls are retained.
fn tool_call_cutoff(messages: &[Message], keep_rounds: usize) -> usize {
    if keep_rounds == 0 {
        return messages.len();
    }

    let mut rounds = 0;
    let mut seen_assistant = false;
    for (index, message) in messages.iter().enumerate().rev() {
        match message.role {
            Role::Assistant => seen_assistant = true,
            Role::User if seen_assistant => {
                rounds += 1;
                seen_assistant = false;
                if rounds == keep_rounds {
                    return index;
                }
            }
            Role::User | Role::System => {}
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use colloquy_types::{CompactionPoint, ContentPart, Message, MessageId, Role};
    use serde_json::json;

    use super::{
        ContextOptions, build_context, clean_tool_calls, latest_compaction_point,
        limit_message_count, project,
    };

    fn point(boundary: &str, summary: &str, created_at: i64) -> CompactionPoint {
        CompactionPoint {
            summary_message_id: MessageId::new(summary),
            boundary_message_id: MessageId::new(boundary),
            created_at,
        }
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    fn tool_turn(id: &str, role: Role) -> Message {
        Message::new(
            role,
            vec![
                ContentPart::text(format!("{id} text")),
                ContentPart::tool_call(format!("call-{id}"), "search", json!({"q": id}), None),
            ],
            0,
        )
        .with_id(id)
    }

    fn abcd() -> Vec<Message> {
        vec![
            Message::user("a", 1).with_id("A"),
            Message::assistant("b", 2).with_id("B"),
            Message::user("c", 3).with_id("C"),
            Message::assistant("d", 4).with_id("D"),
        ]
    }

    #[test]
    fn compaction_point_slices_after_boundary() {
        let mut messages = abcd();
        messages.push(Message::summary("summary", 5).with_id("S"));

        let context = build_context(&messages, &[point("B", "S", 1000)], &ContextOptions::default());

        assert_eq!(ids(&context), ["S", "C", "D"]);
    }

    #[test]
    fn latest_point_wins_regardless_of_order() {
        let mut messages = abcd();
        messages.push(Message::summary("old", 5).with_id("S1"));
        messages.push(Message::summary("new", 6).with_id("S2"));

        let older = point("A", "S1", 1000);
        let newer = point("C", "S2", 2000);

        for points in [
            vec![older.clone(), newer.clone()],
            vec![newer.clone(), older.clone()],
        ] {
            let context = build_context(&messages, &points, &ContextOptions::default());
            assert_eq!(ids(&context), ["S2", "D"]);
        }
    }

    #[test]
    fn tie_resolves_to_first_in_storage_order() {
        let points = [point("A", "S1", 1000), point("B", "S2", 1000)];
        let latest = latest_compaction_point(&points).expect("point");
        assert_eq!(latest.summary_message_id.as_str(), "S1");
    }

    #[test]
    fn missing_boundary_falls_back_to_full_context() {
        let mut messages = abcd();
        messages.push(Message::summary("summary", 5).with_id("S"));

        let context =
            build_context(&messages, &[point("gone", "S", 1000)], &ContextOptions::default());

        // Orphaned summaries are dropped from the uncompacted view.
        assert_eq!(ids(&context), ["A", "B", "C", "D"]);
        assert!(!project(&messages, &[point("gone", "S", 1000)]).is_compacted());
    }

    #[test]
    fn missing_summary_message_is_omitted() {
        let messages = abcd();
        let context = build_context(&messages, &[point("B", "S", 1000)], &ContextOptions::default());
        assert_eq!(ids(&context), ["C", "D"]);
    }

    #[test]
    fn no_points_drops_summary_messages() {
        let mut messages = abcd();
        messages.insert(2, Message::summary("stale", 2).with_id("S"));
        let context = build_context(&messages, &[], &ContextOptions::default());
        assert_eq!(ids(&context), ["A", "B", "C", "D"]);
    }

    #[test]
    fn build_context_does_not_mutate_source() {
        let messages = vec![
            tool_turn("U1", Role::User),
            tool_turn("A1", Role::Assistant),
        ];
        let before = messages.clone();
        let options = ContextOptions {
            keep_tool_call_rounds: 0,
            ..ContextOptions::default()
        };

        let context = build_context(&messages, &[], &options);

        assert_eq!(messages, before);
        assert!(context.iter().all(|m| !m.has_tool_calls()));
    }

    #[test]
    fn max_message_count_keeps_tail() {
        let context = build_context(
            &abcd(),
            &[],
            &ContextOptions {
                max_message_count: Some(2),
                preserve_last_user_turn: false,
                ..ContextOptions::default()
            },
        );
        assert_eq!(ids(&context), ["C", "D"]);
    }

    #[test]
    fn preserve_last_user_turn_allows_one_extra() {
        let kept = limit_message_count(abcd(), 3, true);
        // Window of 3 would start at B (assistant); include A.
        assert_eq!(ids(&kept), ["A", "B", "C", "D"]);

        let kept = limit_message_count(abcd(), 3, false);
        assert_eq!(ids(&kept), ["B", "C", "D"]);

        // Window starting on a user message needs no extension.
        let kept = limit_message_count(abcd(), 2, true);
        assert_eq!(ids(&kept), ["C", "D"]);
    }

    #[test]
    fn zero_max_message_count_is_empty() {
        assert!(limit_message_count(abcd(), 0, true).is_empty());
    }

    #[test]
    fn keeps_tool_calls_for_newest_rounds_only() {
        let messages = vec![
            tool_turn("U1", Role::User),
            tool_turn("A1", Role::Assistant),
            tool_turn("U2", Role::User),
            tool_turn("A2", Role::Assistant),
            tool_turn("U3", Role::User),
            tool_turn("A3", Role::Assistant),
        ];

        let cleaned = clean_tool_calls(&messages, 2);

        let with_tools: Vec<bool> = cleaned.iter().map(Message::has_tool_calls).collect();
        assert_eq!(with_tools, [false, false, true, true, true, true]);
        // Text parts survive pruning.
        assert_eq!(cleaned[0].text_content(), "U1 text");
    }

    #[test]
    fn incomplete_trailing_round_is_not_counted() {
        let messages = vec![
            tool_turn("U1", Role::User),
            tool_turn("A1", Role::Assistant),
            tool_turn("U2", Role::User),
        ];

        let cleaned = clean_tool_calls(&messages, 1);

        let with_tools: Vec<bool> = cleaned.iter().map(Message::has_tool_calls).collect();
        assert_eq!(with_tools, [true, true, true]);
    }

    #[test]
    fn zero_and_negative_rounds_strip_everything() {
        let messages = vec![
            tool_turn("U1", Role::User),
            tool_turn("A1", Role::Assistant),
        ];
        for keep in [0, -3] {
            let cleaned = clean_tool_calls(&messages, keep);
            assert!(cleaned.iter().all(|m| !m.has_tool_calls()), "keep={keep}");
        }
    }

    #[test]
    fn clean_tool_calls_is_idempotent() {
        let messages = vec![
            tool_turn("U1", Role::User),
            tool_turn("A1", Role::Assistant),
            tool_turn("A1b", Role::Assistant),
            tool_turn("U2", Role::User),
            tool_turn("A2", Role::Assistant),
        ];

        for keep in 0..4 {
            let once = clean_tool_calls(&messages, keep);
            let twice = clean_tool_calls(&once, keep);
            assert_eq!(once, twice, "keep={keep}");
        }
    }
}

//! Fork branch maintenance.
//!
//! A fork stores alternate continuations after a message. Exactly one branch
//! (at `position`) is materialized inline after the fork point; every other
//! branch is held in `lists[i].messages`. All operations here preserve that
//! invariant and return new values instead of mutating their inputs.

use colloquy_types::{ForkBranch, ForkHash, Message, MessageForkEntry, MessageId, SessionThread};
use thiserror::Error;

/// Live message list and fork metadata after a fork operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ForkState {
    pub messages: Vec<Message>,
    pub fork_hash: ForkHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkDirection {
    Next,
    Previous,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ForkError {
    #[error("fork point {0} is not in the message list")]
    MessageNotFound(MessageId),
    #[error("message {0} has no fork")]
    NoFork(MessageId),
}

/// Repairs fork entries whose active branch became empty after a deletion.
///
/// For each fork whose fork point is the last live message:
/// - the (empty) active branch is removed;
/// - with at most one branch left, the entry is dropped and the remaining
///   branch's stored messages are spliced in after the fork point;
/// - otherwise the nearest remaining branch becomes active and its stored
///   messages are materialized.
///
/// Fork points that end a thread only lose their empty active branch: thread
/// content is left alone and no stored branch is cleared. Such an entry is
/// dropped once none of its branches hold messages. Fork points found nowhere
/// are skipped.
#[must_use]
pub fn cleanup_empty_fork_branches(
    fork_hash: &ForkHash,
    messages: &[Message],
    threads: &[SessionThread],
) -> ForkState {
    let mut messages = messages.to_vec();
    let mut fork_hash = fork_hash.clone();
    let fork_ids: Vec<MessageId> = fork_hash.keys().cloned().collect();

    for fork_id in fork_ids {
        if let Some(index) = messages.iter().position(|m| m.id == fork_id) {
            if index + 1 == messages.len() {
                let spliced = drop_active_branch(&mut fork_hash, &fork_id);
                messages.extend(spliced);
            }
            continue;
        }

        let thread_tail = threads
            .iter()
            .find(|t| t.messages.iter().any(|m| m.id == fork_id))
            .map(|t| t.messages.last().is_some_and(|m| m.id == fork_id));
        match thread_tail {
            Some(true) => retire_thread_branch(&mut fork_hash, &fork_id),
            Some(false) => {}
            None => {
                tracing::debug!(fork = %fork_id, "Fork point not found; skipping cleanup");
            }
        }
    }

    ForkState {
        messages,
        fork_hash,
    }
}

/// Removes the active branch of `fork_id` and returns the messages that must
/// now be materialized after the fork point.
fn drop_active_branch(fork_hash: &mut ForkHash, fork_id: &MessageId) -> Vec<Message> {
    let Some(entry) = fork_hash.get_mut(fork_id) else {
        return Vec::new();
    };

    if entry.position < entry.lists.len() {
        entry.lists.remove(entry.position);
    }

    if entry.lists.len() <= 1 {
        return fork_hash
            .remove(fork_id)
            .and_then(|entry| entry.lists.into_iter().next())
            .map(|branch| branch.messages)
            .unwrap_or_default();
    }

    entry.position = entry.position.min(entry.lists.len() - 1);
    std::mem::take(&mut entry.lists[entry.position].messages)
}

/// Metadata-only variant of [`drop_active_branch`] for forks inside threads.
fn retire_thread_branch(fork_hash: &mut ForkHash, fork_id: &MessageId) {
    let Some(entry) = fork_hash.get_mut(fork_id) else {
        return;
    };

    let active_is_empty = entry
        .lists
        .get(entry.position)
        .is_some_and(|branch| branch.messages.is_empty());
    if active_is_empty {
        entry.lists.remove(entry.position);
    }

    if entry.lists.iter().all(|branch| branch.messages.is_empty()) {
        fork_hash.remove(fork_id);
        return;
    }
    entry.position = entry.position.min(entry.lists.len() - 1);
}

/// Stores the current continuation after `fork_id` as a branch and opens a
/// new, empty active branch. The returned live list ends at the fork point,
/// ready for a new generation to be appended.
///
/// Forking with no continuation is a no-op.
pub fn create_fork(
    fork_hash: &ForkHash,
    messages: &[Message],
    fork_id: &MessageId,
    now: i64,
) -> Result<ForkState, ForkError> {
    let index = messages
        .iter()
        .position(|m| &m.id == fork_id)
        .ok_or_else(|| ForkError::MessageNotFound(fork_id.clone()))?;

    let mut messages = messages.to_vec();
    let mut fork_hash = fork_hash.clone();

    let continuation = messages.split_off(index + 1);
    if continuation.is_empty() {
        return Ok(ForkState {
            messages,
            fork_hash,
        });
    }

    match fork_hash.get_mut(fork_id) {
        Some(entry) if !entry.lists.is_empty() => {
            let position = entry.position.min(entry.lists.len() - 1);
            entry.lists[position].messages = continuation;
            entry.lists.push(ForkBranch::new(Vec::new()));
            entry.position = entry.lists.len() - 1;
        }
        _ => {
            fork_hash.insert(
                fork_id.clone(),
                MessageForkEntry {
                    position: 1,
                    lists: vec![ForkBranch::new(continuation), ForkBranch::new(Vec::new())],
                    created_at: now,
                },
            );
        }
    }

    Ok(ForkState {
        messages,
        fork_hash,
    })
}

/// Stores the active continuation and materializes the neighbouring branch
/// (wrapping around at either end).
pub fn switch_fork(
    fork_hash: &ForkHash,
    messages: &[Message],
    fork_id: &MessageId,
    direction: ForkDirection,
) -> Result<ForkState, ForkError> {
    let index = messages
        .iter()
        .position(|m| &m.id == fork_id)
        .ok_or_else(|| ForkError::MessageNotFound(fork_id.clone()))?;

    let mut fork_hash = fork_hash.clone();
    let entry = fork_hash
        .get_mut(fork_id)
        .ok_or_else(|| ForkError::NoFork(fork_id.clone()))?;

    let mut messages = messages.to_vec();
    let count = entry.lists.len();
    if count < 2 {
        return Ok(ForkState {
            messages,
            fork_hash,
        });
    }

    let current = entry.position.min(count - 1);
    entry.lists[current].messages = messages.split_off(index + 1);

    let next = match direction {
        ForkDirection::Next => (current + 1) % count,
        ForkDirection::Previous => (current + count - 1) % count,
    };
    messages.append(&mut entry.lists[next].messages);
    entry.position = next;

    Ok(ForkState {
        messages,
        fork_hash,
    })
}

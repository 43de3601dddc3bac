//! End-to-end send path over the JSON file store.

use std::sync::Arc;

use colloquy_engine::colloquy_types::{Message, SessionId};
use colloquy_engine::{CompactionOutcome, CompactionStatus, EngineError, FileSessionStore};
use tempfile::tempdir;

use crate::common::{GatedSummarizer, LARGE_MODEL, TINY_MODEL, ids, overflowing_session, service};

#[tokio::test]
async fn overflowing_send_compacts_then_sends_summary_and_new_message() {
    let dir = tempdir().expect("tempdir");
    let summarizer = Arc::new(GatedSummarizer::replying("Alpha through delta happened."));
    let service = service(
        Arc::new(FileSessionStore::new(dir.path())),
        summarizer.clone(),
    );
    service
        .create_session(overflowing_session("chat-1"))
        .await
        .expect("create");
    let id = SessionId::new("chat-1");

    let prepared = service
        .prepare_send(&id, TINY_MODEL, Message::user("what next?", 10).with_id("E"))
        .await
        .expect("send");

    let CompactionOutcome::Compacted(point) = prepared.compaction else {
        panic!("expected compaction, got {:?}", prepared.compaction);
    };
    assert_eq!(point.boundary_message_id.as_str(), "D");
    assert_eq!(
        ids(&prepared.context),
        [point.summary_message_id.as_str(), "E"]
    );
    assert_eq!(
        prepared.context[0].text_content(),
        "Alpha through delta happened."
    );
    assert_eq!(ids(&summarizer.requests()[0].messages), ["A", "B", "C", "D"]);

    // A fresh store over the same directory sees the persisted compaction.
    let reopened = service_over(dir.path());
    let context = reopened.request_context(&id).await.expect("context");
    assert_eq!(ids(&context), [point.summary_message_id.as_str(), "E"]);
    let session = reopened.get_session(&id).await.expect("session");
    assert_eq!(session.compaction_points, vec![point]);
    // Nothing was deleted.
    assert_eq!(session.messages.len(), 6);
}

#[tokio::test]
async fn failed_compaction_blocks_the_send() {
    let dir = tempdir().expect("tempdir");
    let service = service(
        Arc::new(FileSessionStore::new(dir.path())),
        Arc::new(GatedSummarizer::failing("upstream overloaded")),
    );
    service
        .create_session(overflowing_session("chat-2"))
        .await
        .expect("create");
    let id = SessionId::new("chat-2");

    let err = service
        .prepare_send(&id, TINY_MODEL, Message::user("hello?", 10).with_id("E"))
        .await
        .expect_err("blocked");
    assert!(matches!(err, EngineError::Compaction(_)));

    let session = service.get_session(&id).await.expect("session");
    assert_eq!(ids(&session.messages), ["A", "B", "C", "D"]);
    assert!(session.compaction_points.is_empty());

    let state = service.compaction().state(&id);
    assert_eq!(state.status(), CompactionStatus::Failed);
    assert!(state.error().expect("error").contains("upstream overloaded"));
}

#[tokio::test]
async fn roomy_model_sends_without_compacting() {
    let dir = tempdir().expect("tempdir");
    let summarizer = Arc::new(GatedSummarizer::replying("unused"));
    let service = service(
        Arc::new(FileSessionStore::new(dir.path())),
        summarizer.clone(),
    );
    service
        .create_session(overflowing_session("chat-3"))
        .await
        .expect("create");
    let id = SessionId::new("chat-3");

    let prepared = service
        .prepare_send(&id, LARGE_MODEL, Message::user("more", 10).with_id("E"))
        .await
        .expect("send");
    assert_eq!(prepared.compaction, CompactionOutcome::NotNeeded);
    assert_eq!(ids(&prepared.context), ["A", "B", "C", "D", "E"]);
    assert!(summarizer.requests().is_empty());

    // The measurement cached token counts on disk.
    let session = service_over(dir.path()).get_session(&id).await.expect("session");
    assert!(
        session.messages[..4]
            .iter()
            .all(|m| m.token_count().is_some())
    );
}

fn service_over(dir: &std::path::Path) -> colloquy_engine::SessionService {
    service(
        Arc::new(FileSessionStore::new(dir)),
        Arc::new(GatedSummarizer::replying("unused")),
    )
}

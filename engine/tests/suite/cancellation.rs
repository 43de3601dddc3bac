//! Cancelling a compaction leaves persisted state byte-for-byte intact.

use std::sync::Arc;

use colloquy_engine::colloquy_types::SessionId;
use colloquy_engine::{CompactionError, CompactionState, FileSessionStore};
use tempfile::tempdir;
use tokio::sync::Notify;

use crate::common::{GatedSummarizer, TINY_MODEL, overflowing_session, service};

#[tokio::test]
async fn cancel_during_summarization_writes_nothing() {
    let dir = tempdir().expect("tempdir");
    let gate = Arc::new(Notify::new());
    let summarizer = Arc::new(GatedSummarizer::replying("never stored").gated(&gate));
    let started = Arc::clone(&summarizer.started);
    let service = Arc::new(service(
        Arc::new(FileSessionStore::new(dir.path())),
        summarizer,
    ));
    service
        .create_session(overflowing_session("cancel-me"))
        .await
        .expect("create");
    let id = SessionId::new("cancel-me");
    let path = dir.path().join("cancel-me.json");
    let before = std::fs::read(&path).expect("session file");

    let run = {
        let service = Arc::clone(&service);
        let id = id.clone();
        tokio::spawn(async move { service.compaction().compact_now(&id, TINY_MODEL).await })
    };
    started.notified().await;

    assert!(service.compaction().cancel(&id));
    let err = run.await.expect("join").expect_err("cancelled");
    assert!(matches!(err, CompactionError::Cancelled));

    // A late reply from the summarizer changes nothing.
    gate.notify_one();
    tokio::task::yield_now().await;

    assert_eq!(std::fs::read(&path).expect("session file"), before);
    assert_eq!(service.compaction().state(&id), CompactionState::Idle);
}

#[tokio::test]
async fn retry_after_dismiss_succeeds() {
    let dir = tempdir().expect("tempdir");
    let failing = service(
        Arc::new(FileSessionStore::new(dir.path())),
        Arc::new(GatedSummarizer::failing("timeout")),
    );
    failing
        .create_session(overflowing_session("retry"))
        .await
        .expect("create");
    let id = SessionId::new("retry");

    failing
        .compaction()
        .compact_now(&id, TINY_MODEL)
        .await
        .expect_err("first attempt fails");
    assert!(failing.compaction().dismiss(&id));

    let working = service(
        Arc::new(FileSessionStore::new(dir.path())),
        Arc::new(GatedSummarizer::replying("Recovered summary.")),
    );
    let point = working
        .compaction()
        .compact_now(&id, TINY_MODEL)
        .await
        .expect("retry");
    let session = working.get_session(&id).await.expect("session");
    assert_eq!(session.compaction_points, vec![point]);
}

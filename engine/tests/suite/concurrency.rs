//! Ordering guarantees of the session queue under concurrent callers.

use std::collections::BTreeSet;
use std::sync::Arc;

use colloquy_engine::colloquy_types::{Message, Session, SessionId};
use colloquy_engine::{CompactionOutcome, MemorySessionStore, Store};
use tokio::sync::Notify;

use crate::common::{GatedSummarizer, TINY_MODEL, ids, overflowing_session, service};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_appends_are_all_persisted() {
    const WRITERS: usize = 100;

    let store = Arc::new(MemorySessionStore::new());
    let service = Arc::new(service(
        store.clone() as Arc<dyn Store<SessionId, Session>>,
        Arc::new(GatedSummarizer::replying("unused")),
    ));
    service
        .create_session(Session::new("busy", "Busy"))
        .await
        .expect("create");
    let id = SessionId::new("busy");

    let tasks: Vec<_> = (0..WRITERS)
        .map(|n| {
            let service = Arc::clone(&service);
            let id = id.clone();
            tokio::spawn(async move {
                let message = Message::user(format!("message {n}"), 0).with_id(format!("m{n}"));
                service.append_message(&id, message).await
            })
        })
        .collect();
    for task in tasks {
        task.await.expect("join").expect("append");
    }

    let stored = store.snapshot(&id).expect("stored");
    assert_eq!(stored.messages.len(), WRITERS);
    let unique: BTreeSet<&str> = ids(&stored.messages).into_iter().collect();
    assert_eq!(unique.len(), WRITERS);
}

#[tokio::test]
async fn messages_appended_during_compaction_survive() {
    let gate = Arc::new(Notify::new());
    let summarizer = Arc::new(GatedSummarizer::replying("Earlier turns.").gated(&gate));
    let started = Arc::clone(&summarizer.started);
    let store = Arc::new(MemorySessionStore::new());
    let service = Arc::new(service(
        store.clone() as Arc<dyn Store<SessionId, Session>>,
        summarizer,
    ));
    service
        .create_session(overflowing_session("race"))
        .await
        .expect("create");
    let id = SessionId::new("race");

    let compaction = {
        let service = Arc::clone(&service);
        let id = id.clone();
        tokio::spawn(async move { service.compaction().compact_now(&id, TINY_MODEL).await })
    };
    started.notified().await;

    service
        .append_message(&id, Message::user("still here", 20).with_id("E"))
        .await
        .expect("append while summarizing");
    gate.notify_one();
    let point = compaction.await.expect("join").expect("compaction");

    let stored = store.snapshot(&id).expect("stored");
    assert_eq!(
        ids(&stored.messages),
        ["A", "B", "C", "D", "E", point.summary_message_id.as_str()]
    );
    let context = service.request_context(&id).await.expect("context");
    assert_eq!(ids(&context), [point.summary_message_id.as_str(), "E"]);
}

#[tokio::test]
async fn send_waits_for_running_compaction() {
    let gate = Arc::new(Notify::new());
    let summarizer = Arc::new(GatedSummarizer::replying("Earlier turns.").gated(&gate));
    let started = Arc::clone(&summarizer.started);
    let service = Arc::new(service(
        Arc::new(MemorySessionStore::new()),
        summarizer.clone(),
    ));
    service
        .create_session(overflowing_session("wait"))
        .await
        .expect("create");
    let id = SessionId::new("wait");

    let manual = {
        let service = Arc::clone(&service);
        let id = id.clone();
        tokio::spawn(async move { service.compaction().compact_now(&id, TINY_MODEL).await })
    };
    started.notified().await;

    let send = {
        let service = Arc::clone(&service);
        let id = id.clone();
        tokio::spawn(async move {
            service
                .prepare_send(&id, TINY_MODEL, Message::user("next", 30).with_id("E"))
                .await
        })
    };
    tokio::task::yield_now().await;
    assert!(!send.is_finished());

    gate.notify_one();
    let point = manual.await.expect("join").expect("manual compaction");
    let prepared = send.await.expect("join").expect("send");

    // The finished compaction already brought the context under budget.
    assert_eq!(prepared.compaction, CompactionOutcome::NotNeeded);
    assert_eq!(
        ids(&prepared.context),
        [point.summary_message_id.as_str(), "E"]
    );
    assert_eq!(summarizer.requests().len(), 1);
}

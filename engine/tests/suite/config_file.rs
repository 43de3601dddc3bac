//! Behavior driven by a config file on disk.

use std::sync::Arc;

use colloquy_engine::colloquy_types::{Message, SessionId};
use colloquy_engine::{
    CompactionOutcome, EngineConfig, FileSessionStore, MemorySessionStore, SessionService,
};
use tempfile::tempdir;

use crate::common::{GatedSummarizer, ids, overflowing_session};

#[tokio::test]
async fn disabled_auto_compaction_lets_overflowing_sends_through() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
        [compaction]
        auto = false

        [models."tiny-model"]
        context_window = 1000
        "#,
    )
    .expect("write config");

    let config = EngineConfig::load_from(&path).expect("config");
    let summarizer = Arc::new(GatedSummarizer::replying("unused"));
    let service = SessionService::open(
        config,
        Arc::new(MemorySessionStore::new()),
        summarizer.clone(),
    );
    service
        .create_session(overflowing_session("quiet"))
        .await
        .expect("create");
    let id = SessionId::new("quiet");

    let prepared = service
        .prepare_send(&id, "tiny-model", Message::user("go", 10).with_id("E"))
        .await
        .expect("send");
    assert_eq!(prepared.compaction, CompactionOutcome::NotNeeded);
    assert!(summarizer.requests().is_empty());

    let usage = service.context_usage(&id, "tiny-model").await.expect("usage");
    assert!(usage.is_overflow);
}

#[tokio::test]
async fn message_limit_from_config_trims_context() {
    let config = EngineConfig::parse(
        r"
        [context]
        max_message_count = 2
        preserve_last_user_turn = false
        ",
    )
    .expect("config");
    let dir = tempdir().expect("tempdir");
    let service = SessionService::open(
        config,
        Arc::new(FileSessionStore::new(dir.path())),
        Arc::new(GatedSummarizer::replying("unused")),
    );
    service
        .create_session(overflowing_session("short"))
        .await
        .expect("create");

    let context = service
        .request_context(&SessionId::new("short"))
        .await
        .expect("context");
    assert_eq!(ids(&context), ["C", "D"]);
}

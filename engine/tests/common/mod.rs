//! Shared test utilities and fixtures

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use colloquy_engine::colloquy_context::{ModelInfo, SummaryRequest};
use colloquy_engine::colloquy_types::{Message, Session, SessionId};
use colloquy_engine::{EngineConfig, SessionService, Store, SummarizeError, SummarizeFut, Summarizer};
use tokio::sync::{Notify, mpsc};

/// Threshold is 300 tokens with default compaction settings.
pub const TINY_MODEL: &str = "tiny-model";
pub const LARGE_MODEL: &str = "large-model";

/// Summarizer that answers with fixed text once its gate opens.
pub struct GatedSummarizer {
    reply: Result<String, String>,
    gate: Option<Arc<Notify>>,
    pub started: Arc<Notify>,
    requests: Mutex<Vec<SummaryRequest>>,
}

impl GatedSummarizer {
    pub fn replying(text: &str) -> Self {
        Self {
            reply: Ok(text.to_string()),
            gate: None,
            started: Arc::new(Notify::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            reply: Err(message.to_string()),
            ..Self::replying("")
        }
    }

    /// Blocks every call until `gate` is notified.
    pub fn gated(mut self, gate: &Arc<Notify>) -> Self {
        self.gate = Some(Arc::clone(gate));
        self
    }

    pub fn requests(&self) -> Vec<SummaryRequest> {
        self.requests.lock().expect("requests").clone()
    }
}

impl Summarizer for GatedSummarizer {
    fn summarize<'a>(
        &'a self,
        request: &'a SummaryRequest,
        deltas: mpsc::UnboundedSender<String>,
    ) -> SummarizeFut<'a> {
        Box::pin(async move {
            self.requests.lock().expect("requests").push(request.clone());
            self.started.notify_one();
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            match &self.reply {
                Ok(text) => {
                    let _ = deltas.send(text.clone());
                    Ok(text.clone())
                }
                Err(message) => Err(SummarizeError::Api(message.clone())),
            }
        })
    }
}

pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config
        .models
        .insert(TINY_MODEL.to_string(), ModelInfo::new(1_000, false));
    config
        .models
        .insert(LARGE_MODEL.to_string(), ModelInfo::new(128_000, false));
    config
}

pub fn service(
    store: Arc<dyn Store<SessionId, Session>>,
    summarizer: Arc<dyn Summarizer>,
) -> SessionService {
    SessionService::open(test_config(), store, summarizer)
}

pub fn long_text(word: &str) -> String {
    format!("{word} ").repeat(200)
}

/// Four alternating turns, enough to overflow [`TINY_MODEL`].
pub fn overflowing_session(id: &str) -> Session {
    let mut session = Session::new(id, "Overflowing chat");
    session.messages = vec![
        Message::user(long_text("alpha"), 1).with_id("A"),
        Message::assistant(long_text("bravo"), 2).with_id("B"),
        Message::user(long_text("charlie"), 3).with_id("C"),
        Message::assistant(long_text("delta"), 4).with_id("D"),
    ];
    session
}

pub fn ids(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|m| m.id.as_str()).collect()
}

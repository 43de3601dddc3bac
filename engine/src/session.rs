//! Session operations used by the chat UI.
//!
//! Every durable mutation goes through the [`SessionQueue`]. Streaming deltas
//! only touch the read cache until the generation finishes.

use std::sync::Arc;

use colloquy_context::{ForkDirection, ForkError, cleanup_empty_fork_branches, create_fork, switch_fork};
use colloquy_types::{ContentPart, Message, MessageId, Session, SessionId};
use thiserror::Error;

use crate::compaction::{CompactionError, CompactionOrchestrator, CompactionOutcome};
use crate::config::EngineConfig;
use crate::queue::{QueueError, SessionQueue};
use crate::scheduler::ScheduleOutcome;
use crate::store::{Store, StoreError};
use crate::summarizer::Summarizer;
use crate::usage::{ContextMeter, ContextUsage, Measurement, store_token_cache};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
    #[error("message {0} not found")]
    MessageNotFound(MessageId),
    #[error(transparent)]
    Fork(#[from] ForkError),
    #[error(transparent)]
    Compaction(#[from] CompactionError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    fn from_queue(err: QueueError<Self>, session_id: &SessionId) -> Self {
        match err {
            QueueError::Rejected(err) => err,
            QueueError::NotFound(_) => Self::SessionNotFound(session_id.clone()),
            QueueError::Store(err) => Self::Store(err),
        }
    }
}

/// Result of preparing a user turn for submission.
#[derive(Debug, Clone)]
pub struct PreparedSend {
    /// The session after the user message was appended.
    pub session: Session,
    /// Messages to send to the model.
    pub context: Vec<Message>,
    pub compaction: CompactionOutcome,
}

pub struct SessionService {
    queue: Arc<SessionQueue>,
    meter: ContextMeter,
    compaction: Arc<CompactionOrchestrator>,
}

impl SessionService {
    pub fn new(
        queue: Arc<SessionQueue>,
        meter: ContextMeter,
        compaction: Arc<CompactionOrchestrator>,
    ) -> Self {
        Self {
            queue,
            meter,
            compaction,
        }
    }

    /// Wires the queue, meter, and orchestrator from `config`.
    pub fn open(
        config: EngineConfig,
        store: Arc<dyn Store<SessionId, Session>>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        let models = Arc::new(config.model_registry());
        let meter = ContextMeter::new(Arc::new(config), models);
        let queue = Arc::new(SessionQueue::new(store));
        let compaction = Arc::new(CompactionOrchestrator::new(
            Arc::clone(&queue),
            meter.clone(),
            summarizer,
        ));
        Self::new(queue, meter, compaction)
    }

    #[must_use]
    pub fn compaction(&self) -> &Arc<CompactionOrchestrator> {
        &self.compaction
    }

    #[must_use]
    pub fn meter(&self) -> &ContextMeter {
        &self.meter
    }

    pub async fn create_session(&self, session: Session) -> Result<Session, EngineError> {
        let id = session.id.clone();
        let session = self.queue.insert(&id, session).await?;
        tracing::debug!(session_id = %id, "Created session");
        Ok(session)
    }

    pub async fn get_session(&self, session_id: &SessionId) -> Result<Session, EngineError> {
        self.queue
            .get(session_id)
            .await?
            .ok_or_else(|| EngineError::SessionNotFound(session_id.clone()))
    }

    pub async fn append_message(
        &self,
        session_id: &SessionId,
        message: Message,
    ) -> Result<Session, EngineError> {
        self.queue
            .update(session_id, |session| session.messages.push(message))
            .await
            .map_err(|err| EngineError::from_queue(err.widen(), session_id))
    }

    /// Compacts if the context overflows, then appends `message`.
    ///
    /// A failed compaction blocks the send and leaves the session untouched.
    pub async fn prepare_send(
        &self,
        session_id: &SessionId,
        model_id: &str,
        message: Message,
    ) -> Result<PreparedSend, EngineError> {
        let compaction = self
            .compaction
            .compact_before_send(session_id, model_id)
            .await?;
        let session = self.append_message(session_id, message).await?;
        let context = self.meter.request_context(&session);
        Ok(PreparedSend {
            session,
            context,
            compaction,
        })
    }

    /// Applies `edit` to a message in the main list or any thread.
    pub async fn update_message<F>(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
        edit: F,
    ) -> Result<Message, EngineError>
    where
        F: FnOnce(&mut Message),
    {
        let session = self.edit_message(session_id, message_id, edit).await?;
        stored_message(&session, message_id)
    }

    /// Appends streamed text to a generating message in the read cache only.
    ///
    /// Returns `None` when the session is not cached or the message is gone.
    pub fn append_stream_delta(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
        delta: &str,
    ) -> Option<Message> {
        let mut updated = None;
        self.queue.set_cached(session_id, |session| {
            if let Some(message) = session.find_message_mut(message_id) {
                message.append_text(delta);
                updated = Some(message.clone());
            }
        })?;
        updated
    }

    /// Persists the final content of a generated message.
    ///
    /// A successful reply in a session with a default model queues a
    /// debounced overflow check for that model.
    pub async fn finish_generation(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
        parts: Vec<ContentPart>,
        error: Option<String>,
    ) -> Result<Message, EngineError> {
        let failed = error.is_some();
        let session = self
            .edit_message(session_id, message_id, |message| {
                message.set_content_parts(parts);
                message.generating = false;
                message.error = error;
            })
            .await?;
        if !failed && let Some(model_id) = session.settings.model_id.as_deref() {
            self.schedule_compaction_check(session_id, model_id);
        }
        stored_message(&session, message_id)
    }

    /// Deletes a session: cancels its compaction work, then removes it from
    /// the store and the read cache.
    pub async fn delete_session(&self, session_id: &SessionId) -> Result<(), EngineError> {
        self.compaction.cancel(session_id);
        if !self.queue.remove(session_id).await? {
            return Err(EngineError::SessionNotFound(session_id.clone()));
        }
        tracing::info!(session_id = %session_id, "Deleted session");
        Ok(())
    }

    /// Stops background compaction work. Persisted sessions are unaffected.
    pub fn shutdown(&self) {
        self.compaction.shutdown();
    }

    /// Deletes a message, drops compaction points whose summary it was, and
    /// collapses fork branches left empty.
    pub async fn delete_message(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
    ) -> Result<Session, EngineError> {
        self.queue
            .set(session_id, |mut session: Session| {
                if !remove_message(&mut session, message_id) {
                    return Err(EngineError::MessageNotFound(message_id.clone()));
                }
                let cleaned = cleanup_empty_fork_branches(
                    &session.message_forks_hash,
                    &session.messages,
                    &session.threads,
                );
                session.messages = cleaned.messages;
                session.message_forks_hash = cleaned.fork_hash;
                Ok(session)
            })
            .await
            .map_err(|err| EngineError::from_queue(err, session_id))
    }

    /// Starts a new branch after `message_id`.
    pub async fn create_fork(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
    ) -> Result<Session, EngineError> {
        let now = chrono::Utc::now().timestamp_millis();
        self.queue
            .set(session_id, |mut session: Session| {
                let forked = create_fork(
                    &session.message_forks_hash,
                    &session.messages,
                    message_id,
                    now,
                )?;
                session.messages = forked.messages;
                session.message_forks_hash = forked.fork_hash;
                Ok(session)
            })
            .await
            .map_err(|err| EngineError::from_queue(err, session_id))
    }

    pub async fn switch_fork(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
        direction: ForkDirection,
    ) -> Result<Session, EngineError> {
        self.queue
            .set(session_id, |mut session: Session| {
                let switched = switch_fork(
                    &session.message_forks_hash,
                    &session.messages,
                    message_id,
                    direction,
                )?;
                session.messages = switched.messages;
                session.message_forks_hash = switched.fork_hash;
                Ok(session)
            })
            .await
            .map_err(|err| EngineError::from_queue(err, session_id))
    }

    pub async fn request_context(&self, session_id: &SessionId) -> Result<Vec<Message>, EngineError> {
        let session = self.get_session(session_id).await?;
        Ok(self.meter.request_context(&session))
    }

    /// Measures the request context and caches any newly computed counts.
    pub async fn context_usage(
        &self,
        session_id: &SessionId,
        model_id: &str,
    ) -> Result<ContextUsage, EngineError> {
        let session = self.get_session(session_id).await?;
        let Measurement { usage, updates } = self.meter.measure(&session, model_id);
        store_token_cache(&self.queue, session_id, updates).await;
        Ok(usage)
    }

    /// Queues a debounced overflow check, typically after a reply finishes.
    pub fn schedule_compaction_check(
        &self,
        session_id: &SessionId,
        model_id: &str,
    ) -> ScheduleOutcome {
        self.compaction
            .schedule_auto_compaction(session_id.clone(), model_id)
    }

    async fn edit_message<F>(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
        edit: F,
    ) -> Result<Session, EngineError>
    where
        F: FnOnce(&mut Message),
    {
        self.queue
            .set(session_id, |mut session: Session| {
                let message = session
                    .find_message_mut(message_id)
                    .ok_or_else(|| EngineError::MessageNotFound(message_id.clone()))?;
                edit(message);
                Ok(session)
            })
            .await
            .map_err(|err| EngineError::from_queue(err, session_id))
    }
}

fn stored_message(session: &Session, message_id: &MessageId) -> Result<Message, EngineError> {
    session
        .find_message(message_id)
        .cloned()
        .ok_or_else(|| EngineError::MessageNotFound(message_id.clone()))
}

fn remove_message(session: &mut Session, message_id: &MessageId) -> bool {
    if let Some(index) = session.message_index(message_id) {
        session.messages.remove(index);
        session
            .compaction_points
            .retain(|point| point.summary_message_id != *message_id);
        return true;
    }
    for thread in &mut session.threads {
        if let Some(index) = thread.messages.iter().position(|m| m.id == *message_id) {
            thread.messages.remove(index);
            thread
                .compaction_points
                .retain(|point| point.summary_message_id != *message_id);
            return true;
        }
    }
    false
}

//! Compaction orchestration.
//!
//! Replaces the oldest uncompacted span of a session with a generated summary
//! and records a new compaction point.
//!
//! ```text
//! Idle ──► Running ──► Idle            (succeeded, cancelled, nothing to do)
//!              └─────► Failed ──► Idle (dismissed, or Running on retry)
//! ```
//!
//! State transitions are published per session on a broadcast channel.
//! Subscribers only observe; commands go through the orchestrator's methods.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use colloquy_context::{SummaryRequest, project, summary_target_tokens};
use colloquy_types::{CompactionPoint, Message, MessageId, Role, Session, SessionId, SessionType};
use futures_util::future::{AbortHandle, AbortRegistration, Abortable};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::queue::{QueueError, SessionQueue};
use crate::scheduler::{ScheduleOutcome, TaskKey, TaskKind, TaskScheduler};
use crate::store::StoreError;
use crate::summarizer::{ErrorReporter, SummarizeError, Summarizer, TracingErrorReporter};
use crate::usage::{ContextMeter, Measurement, store_token_cache};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionStatus {
    Idle,
    Running,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CompactionState {
    #[default]
    Idle,
    Running {
        streaming_text: String,
    },
    /// Kept until dismissed or retried.
    Failed {
        error: String,
        streaming_text: String,
    },
}

impl CompactionState {
    #[must_use]
    pub fn status(&self) -> CompactionStatus {
        match self {
            Self::Idle => CompactionStatus::Idle,
            Self::Running { .. } => CompactionStatus::Running,
            Self::Failed { .. } => CompactionStatus::Failed,
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Failed { error, .. } => Some(error),
            Self::Idle | Self::Running { .. } => None,
        }
    }

    #[must_use]
    pub fn streaming_text(&self) -> &str {
        match self {
            Self::Idle => "",
            Self::Running { streaming_text } | Self::Failed { streaming_text, .. } => {
                streaming_text
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionEvent {
    pub session_id: SessionId,
    pub state: CompactionState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionTrigger {
    BeforeSend,
    Manual,
    Scheduled,
}

impl CompactionTrigger {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BeforeSend => "before_send",
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactionOutcome {
    NotNeeded,
    Compacted(CompactionPoint),
}

#[derive(Debug, Error)]
pub enum CompactionError {
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
    #[error("compaction is already running for session {0}")]
    AlreadyRunning(SessionId),
    #[error("nothing to compact")]
    NothingToCompact,
    #[error("compaction cancelled")]
    Cancelled,
    #[error("summary generation failed: {0}")]
    Summarize(#[from] SummarizeError),
    #[error("summarizer returned an empty summary")]
    EmptySummary,
    #[error("boundary message {0} no longer exists")]
    BoundaryMissing(MessageId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CompactionError {
    /// Expected failures are surfaced to the user but never reported.
    #[must_use]
    pub fn is_expected(&self) -> bool {
        match self {
            Self::Summarize(err) => err.is_expected(),
            Self::AlreadyRunning(_)
            | Self::NothingToCompact
            | Self::Cancelled
            | Self::BoundaryMissing(_) => true,
            Self::SessionNotFound(_) | Self::EmptySummary | Self::Store(_) => false,
        }
    }
}

/// The span a compaction will replace.
#[derive(Debug, Clone, PartialEq)]
struct CompactionPlan {
    /// Last summarized message; the new point's boundary.
    boundary: MessageId,
    span: Vec<Message>,
    previous_summary: Option<String>,
}

/// Everything after the current boundary except the newest `retained_rounds`
/// rounds.
fn plan_compaction(session: &Session, retained_rounds: usize) -> Option<CompactionPlan> {
    let projection = project(&session.messages, &session.compaction_points);
    let tail: Vec<&Message> = projection.tail.iter().filter(|m| !m.is_summary).collect();

    let span = &tail[..retained_start(&tail, retained_rounds)];
    let boundary = span.last()?.id.clone();

    Some(CompactionPlan {
        boundary,
        span: span.iter().map(|m| (*m).clone()).collect(),
        previous_summary: projection
            .summary
            .map(Message::text_content)
            .filter(|text| !text.trim().is_empty()),
    })
}

/// Index of the user message that opens the oldest retained round.
fn retained_start(tail: &[&Message], retained_rounds: usize) -> usize {
    if retained_rounds == 0 {
        return tail.len();
    }
    let mut seen = 0;
    for (index, message) in tail.iter().enumerate().rev() {
        if message.role == Role::User {
            seen += 1;
            if seen == retained_rounds {
                return index;
            }
        }
    }
    0
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Releases the per-session run slot. A run dropped mid-flight returns the
/// session to idle.
struct RunGuard<'a> {
    orchestrator: &'a CompactionOrchestrator,
    session_id: &'a SessionId,
    active: bool,
}

impl RunGuard<'_> {
    fn release(&mut self) {
        if self.active {
            self.active = false;
            lock(&self.orchestrator.runs).remove(self.session_id);
        }
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            self.release();
            self.orchestrator
                .set_state(self.session_id, CompactionState::Idle);
        }
    }
}

pub struct CompactionOrchestrator {
    queue: Arc<SessionQueue>,
    meter: ContextMeter,
    summarizer: Arc<dyn Summarizer>,
    reporter: Arc<dyn ErrorReporter>,
    scheduler: TaskScheduler,
    /// Non-idle states only.
    states: Mutex<HashMap<SessionId, CompactionState>>,
    runs: Mutex<HashMap<SessionId, AbortHandle>>,
    events: broadcast::Sender<CompactionEvent>,
}

impl CompactionOrchestrator {
    pub fn new(
        queue: Arc<SessionQueue>,
        meter: ContextMeter,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let scheduler = TaskScheduler::new(meter.config().debounce());
        Self {
            queue,
            meter,
            summarizer,
            reporter: Arc::new(TracingErrorReporter),
            scheduler,
            states: Mutex::new(HashMap::new()),
            runs: Mutex::new(HashMap::new()),
            events,
        }
    }

    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    #[must_use]
    pub fn with_scheduler(mut self, scheduler: TaskScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CompactionEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn state(&self, session_id: &SessionId) -> CompactionState {
        lock(&self.states)
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_running(&self, session_id: &SessionId) -> bool {
        lock(&self.runs).contains_key(session_id)
    }

    /// Runs before a user message is submitted.
    ///
    /// For chat sessions with auto-compaction enabled, compacts when the
    /// current request context overflows. An error means the send must not
    /// proceed. Waits for a compaction already in flight for the session.
    pub async fn compact_before_send(
        &self,
        session_id: &SessionId,
        model_id: &str,
    ) -> Result<CompactionOutcome, CompactionError> {
        loop {
            self.wait_until_idle(session_id).await;
            match self
                .check_and_compact(session_id, model_id, CompactionTrigger::BeforeSend)
                .await
            {
                Err(CompactionError::AlreadyRunning(_)) => {}
                other => return other,
            }
        }
    }

    /// Compacts regardless of overflow. Also used to retry a failed run.
    pub async fn compact_now(
        &self,
        session_id: &SessionId,
        model_id: &str,
    ) -> Result<CompactionPoint, CompactionError> {
        self.run(session_id, model_id, CompactionTrigger::Manual)
            .await
    }

    /// Debounced background overflow check. A check already running for the
    /// session drops this request; a pending one is replaced.
    pub fn schedule_auto_compaction(
        self: &Arc<Self>,
        session_id: SessionId,
        model_id: impl Into<String>,
    ) -> ScheduleOutcome {
        let this = Arc::clone(self);
        let model_id = model_id.into();
        let key = TaskKey::new(TaskKind::Compaction, session_id.clone());
        self.scheduler.schedule(key, move || async move {
            let result = this
                .check_and_compact(&session_id, &model_id, CompactionTrigger::Scheduled)
                .await;
            if let Err(err) = result {
                tracing::debug!(session_id = %session_id, error = %err, "Scheduled compaction did not complete");
            }
        })
    }

    /// Aborts the in-flight compaction and any pending scheduled check for the
    /// session. The session is left exactly as it was.
    pub fn cancel(&self, session_id: &SessionId) -> bool {
        let pending = self
            .scheduler
            .cancel(&TaskKey::new(TaskKind::Compaction, session_id.clone()));
        let running = lock(&self.runs).get(session_id).cloned();
        if let Some(handle) = &running {
            tracing::info!(session_id = %session_id, "Cancelling compaction");
            handle.abort();
        }
        pending || running.is_some()
    }

    /// Whether a scheduled check for the session is waiting out its debounce.
    #[must_use]
    pub fn is_check_pending(&self, session_id: &SessionId) -> bool {
        self.scheduler
            .is_pending(&TaskKey::new(TaskKind::Compaction, session_id.clone()))
    }

    /// Drops every pending scheduled check and aborts every in-flight run.
    /// Aborted runs finish as [`CompactionError::Cancelled`] without writing.
    pub fn shutdown(&self) {
        self.scheduler.cancel_all();
        let runs: Vec<AbortHandle> = lock(&self.runs).values().cloned().collect();
        for handle in &runs {
            handle.abort();
        }
        tracing::info!(aborted = runs.len(), "Compaction shut down");
    }

    /// Clears a failed state.
    pub fn dismiss(&self, session_id: &SessionId) -> bool {
        if self.state(session_id).status() != CompactionStatus::Failed {
            return false;
        }
        self.set_state(session_id, CompactionState::Idle);
        true
    }

    async fn wait_until_idle(&self, session_id: &SessionId) {
        let mut events = self.events.subscribe();
        while self.is_running(session_id) {
            if let Err(broadcast::error::RecvError::Closed) = events.recv().await {
                return;
            }
        }
    }

    async fn check_and_compact(
        &self,
        session_id: &SessionId,
        model_id: &str,
        trigger: CompactionTrigger,
    ) -> Result<CompactionOutcome, CompactionError> {
        let session = self
            .queue
            .get(session_id)
            .await?
            .ok_or_else(|| CompactionError::SessionNotFound(session_id.clone()))?;

        if session.session_type != SessionType::Chat
            || !self.meter.config().auto_compaction_enabled(&session.settings)
        {
            return Ok(CompactionOutcome::NotNeeded);
        }

        let Measurement { usage, updates } = self.meter.measure(&session, model_id);
        store_token_cache(&self.queue, session_id, updates).await;
        if !usage.is_overflow {
            return Ok(CompactionOutcome::NotNeeded);
        }

        tracing::info!(
            session_id = %session_id,
            tokens = usage.tokens,
            threshold = ?usage.threshold_tokens,
            "Context over budget; compacting"
        );

        match self.run(session_id, model_id, trigger).await {
            Ok(point) => Ok(CompactionOutcome::Compacted(point)),
            Err(CompactionError::NothingToCompact) => {
                tracing::warn!(session_id = %session_id, "Context over budget but nothing left to compact");
                Ok(CompactionOutcome::NotNeeded)
            }
            Err(err) => Err(err),
        }
    }

    async fn run(
        &self,
        session_id: &SessionId,
        model_id: &str,
        trigger: CompactionTrigger,
    ) -> Result<CompactionPoint, CompactionError> {
        let (abort, registration) = AbortHandle::new_pair();
        {
            let mut runs = lock(&self.runs);
            if runs.contains_key(session_id) {
                return Err(CompactionError::AlreadyRunning(session_id.clone()));
            }
            runs.insert(session_id.clone(), abort.clone());
        }
        let mut guard = RunGuard {
            orchestrator: self,
            session_id,
            active: true,
        };

        self.set_state(
            session_id,
            CompactionState::Running {
                streaming_text: String::new(),
            },
        );
        tracing::info!(session_id = %session_id, trigger = trigger.as_str(), "Compaction started");

        let result = self
            .execute(session_id, model_id, registration, &abort)
            .await;

        // Waiters re-check `runs` when the final state is published.
        guard.release();

        match &result {
            Ok(point) => {
                tracing::info!(
                    session_id = %session_id,
                    boundary = %point.boundary_message_id,
                    summary = %point.summary_message_id,
                    "Compaction succeeded"
                );
                self.set_state(session_id, CompactionState::Idle);
            }
            Err(CompactionError::Cancelled | CompactionError::NothingToCompact) => {
                self.set_state(session_id, CompactionState::Idle);
            }
            Err(err) => {
                if !err.is_expected() {
                    self.reporter.report(session_id, err);
                }
                tracing::warn!(session_id = %session_id, error = %err, "Compaction failed");
                let streaming_text = self.state(session_id).streaming_text().to_string();
                self.set_state(
                    session_id,
                    CompactionState::Failed {
                        error: err.to_string(),
                        streaming_text,
                    },
                );
            }
        }

        result
    }

    async fn execute(
        &self,
        session_id: &SessionId,
        model_id: &str,
        registration: AbortRegistration,
        abort: &AbortHandle,
    ) -> Result<CompactionPoint, CompactionError> {
        let session = self
            .queue
            .get(session_id)
            .await?
            .ok_or_else(|| CompactionError::SessionNotFound(session_id.clone()))?;

        let config = self.meter.config();
        let CompactionPlan {
            boundary,
            span,
            previous_summary,
        } = plan_compaction(&session, config.compaction.retained_rounds)
            .ok_or(CompactionError::NothingToCompact)?;

        let span_tokens = self.meter.estimate_tokens(&span, model_id);
        let request = SummaryRequest {
            messages: span,
            previous_summary,
            target_language: config.summary_language(&session.settings).to_string(),
            target_tokens: summary_target_tokens(span_tokens),
        };
        tracing::debug!(
            session_id = %session_id,
            span_messages = request.messages.len(),
            span_tokens,
            target_tokens = request.target_tokens,
            "Summarizing span"
        );

        let text = self.summarize(session_id, &request, registration).await?;

        if abort.is_aborted() {
            return Err(CompactionError::Cancelled);
        }

        self.write_summary(session_id, boundary, text, abort).await
    }

    async fn summarize(
        &self,
        session_id: &SessionId,
        request: &SummaryRequest,
        registration: AbortRegistration,
    ) -> Result<String, CompactionError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let summarize = Abortable::new(self.summarizer.summarize(request, tx), registration);
        tokio::pin!(summarize);

        let result = loop {
            tokio::select! {
                result = &mut summarize => break result,
                Some(delta) = rx.recv() => self.push_delta(session_id, &delta),
            }
        };
        while let Ok(delta) = rx.try_recv() {
            self.push_delta(session_id, &delta);
        }

        let text = result.map_err(|_| CompactionError::Cancelled)??;
        let text = text.trim();
        if text.is_empty() {
            return Err(CompactionError::EmptySummary);
        }
        Ok(text.to_string())
    }

    /// Appends the summary and its compaction point in one queued update,
    /// provided the run was not cancelled while waiting for its turn and the
    /// boundary still exists.
    async fn write_summary(
        &self,
        session_id: &SessionId,
        boundary: MessageId,
        text: String,
        abort: &AbortHandle,
    ) -> Result<CompactionPoint, CompactionError> {
        let now = chrono::Utc::now().timestamp_millis();
        let summary = Message::summary(text, now);
        let mut written = None;

        self.queue
            .set(session_id, |mut session: Session| {
                if abort.is_aborted() {
                    return Err(CompactionError::Cancelled);
                }
                if session.message_index(&boundary).is_none() {
                    return Err(CompactionError::BoundaryMissing(boundary.clone()));
                }
                // Strictly later than every existing point so it wins.
                let created_at = session
                    .compaction_points
                    .iter()
                    .map(|point| point.created_at)
                    .max()
                    .map_or(now, |latest| now.max(latest + 1));
                let point = CompactionPoint {
                    summary_message_id: summary.id.clone(),
                    boundary_message_id: boundary.clone(),
                    created_at,
                };
                session.messages.push(summary);
                session.compaction_points.push(point.clone());
                written = Some(point);
                Ok(session)
            })
            .await
            .map_err(|err| match err {
                QueueError::Rejected(err) => err,
                QueueError::NotFound(_) => CompactionError::SessionNotFound(session_id.clone()),
                QueueError::Store(err) => CompactionError::Store(err),
            })?;

        written.ok_or(CompactionError::BoundaryMissing(boundary))
    }

    fn push_delta(&self, session_id: &SessionId, delta: &str) {
        let state = {
            let mut states = lock(&self.states);
            let Some(CompactionState::Running { streaming_text }) = states.get_mut(session_id)
            else {
                return;
            };
            streaming_text.push_str(delta);
            CompactionState::Running {
                streaming_text: streaming_text.clone(),
            }
        };
        self.publish(session_id, state);
    }

    fn set_state(&self, session_id: &SessionId, state: CompactionState) {
        {
            let mut states = lock(&self.states);
            if state == CompactionState::Idle {
                states.remove(session_id);
            } else {
                states.insert(session_id.clone(), state.clone());
            }
        }
        self.publish(session_id, state);
    }

    fn publish(&self, session_id: &SessionId, state: CompactionState) {
        // No subscribers is fine.
        let _ = self.events.send(CompactionEvent {
            session_id: session_id.clone(),
            state,
        });
    }
}

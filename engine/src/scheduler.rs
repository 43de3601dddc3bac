//! Debounced, deduplicated background tasks keyed by operation and session.
//!
//! Two collections with a fixed lifecycle:
//! - `pending`: inserted on schedule, removed when the delay elapses (start)
//!   or when a newer request for the same key replaces it (cancel).
//! - `running`: inserted on start, removed when the task finishes.
//!
//! A request for a key that is running is dropped. A request for a key that
//! is pending replaces the pending one.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use colloquy_types::SessionId;
use futures_util::future::{AbortHandle, Abortable};

/// Default debounce before a scheduled task starts.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Compaction,
    NameGeneration,
}

impl TaskKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Compaction => "compaction",
            Self::NameGeneration => "name_generation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub kind: TaskKind,
    pub session_id: SessionId,
}

impl TaskKey {
    #[must_use]
    pub fn new(kind: TaskKind, session_id: SessionId) -> Self {
        Self { kind, session_id }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// No task was pending or running for the key.
    Scheduled,
    /// A pending task for the key was cancelled and replaced.
    Replaced,
    /// A task for the key is already running; the request was dropped.
    Dropped,
}

#[derive(Debug)]
struct PendingTask {
    generation: u64,
    abort: AbortHandle,
}

#[derive(Debug, Default)]
struct SchedulerState {
    pending: HashMap<TaskKey, PendingTask>,
    running: HashSet<TaskKey>,
    next_generation: u64,
}

/// Removes a key from `running` however the task ends.
struct RunningGuard {
    state: Arc<Mutex<SchedulerState>>,
    key: TaskKey,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        lock(&self.state).running.remove(&self.key);
    }
}

fn lock(state: &Mutex<SchedulerState>) -> std::sync::MutexGuard<'_, SchedulerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the pending and running task maps. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    debounce: Duration,
    state: Arc<Mutex<SchedulerState>>,
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}

impl TaskScheduler {
    #[must_use]
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            state: Arc::new(Mutex::new(SchedulerState::default())),
        }
    }

    #[must_use]
    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Schedules `task` to start after the debounce delay.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F, Fut>(&self, key: TaskKey, task: F) -> ScheduleOutcome
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (abort, registration) = AbortHandle::new_pair();
        let (generation, outcome) = {
            let mut state = lock(&self.state);
            if state.running.contains(&key) {
                tracing::debug!(
                    kind = key.kind.as_str(),
                    session_id = %key.session_id,
                    "Task already running; dropping request"
                );
                return ScheduleOutcome::Dropped;
            }

            state.next_generation += 1;
            let generation = state.next_generation;
            let replaced = state
                .pending
                .insert(key.clone(), PendingTask { generation, abort });
            let outcome = match replaced {
                Some(previous) => {
                    previous.abort.abort();
                    ScheduleOutcome::Replaced
                }
                None => ScheduleOutcome::Scheduled,
            };
            (generation, outcome)
        };

        let state = Arc::clone(&self.state);
        let delay = self.debounce;
        let run = async move {
            tokio::time::sleep(delay).await;

            let guard = {
                let mut locked = lock(&state);
                match locked.pending.get(&key) {
                    Some(pending) if pending.generation == generation => {
                        locked.pending.remove(&key);
                        locked.running.insert(key.clone());
                    }
                    _ => return,
                }
                RunningGuard {
                    state: Arc::clone(&state),
                    key,
                }
            };

            tracing::debug!(
                kind = guard.key.kind.as_str(),
                session_id = %guard.key.session_id,
                "Starting scheduled task"
            );
            task().await;
            drop(guard);
        };

        tokio::spawn(async move {
            let _ = Abortable::new(run, registration).await;
        });

        outcome
    }

    /// Cancels a pending task. Running tasks are never interrupted.
    pub fn cancel(&self, key: &TaskKey) -> bool {
        let removed = lock(&self.state).pending.remove(key);
        match removed {
            Some(pending) => {
                pending.abort.abort();
                true
            }
            None => false,
        }
    }

    /// Cancels every pending task.
    pub fn cancel_all(&self) {
        let drained: Vec<PendingTask> = lock(&self.state)
            .pending
            .drain()
            .map(|(_, pending)| pending)
            .collect();
        for pending in drained {
            pending.abort.abort();
        }
    }

    #[must_use]
    pub fn is_pending(&self, key: &TaskKey) -> bool {
        lock(&self.state).pending.contains_key(key)
    }

    #[must_use]
    pub fn is_running(&self, key: &TaskKey) -> bool {
        lock(&self.state).running.contains(key)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use colloquy_types::SessionId;
    use tokio::sync::oneshot;

    use super::{ScheduleOutcome, TaskKey, TaskKind, TaskScheduler};

    fn key(session: &str) -> TaskKey {
        TaskKey::new(TaskKind::Compaction, SessionId::new(session))
    }

    fn counting_task(
        counter: &Arc<AtomicUsize>,
        value: usize,
    ) -> impl FnOnce() -> std::future::Ready<()> + Send + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(value, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    async fn settle(scheduler: &TaskScheduler) {
        tokio::time::sleep(scheduler.debounce() + Duration::from_millis(1)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pending_request_is_replaced() {
        let scheduler = TaskScheduler::new(Duration::from_millis(100));
        let counter = Arc::new(AtomicUsize::new(0));

        assert_eq!(
            scheduler.schedule(key("s"), counting_task(&counter, 1)),
            ScheduleOutcome::Scheduled
        );
        assert_eq!(
            scheduler.schedule(key("s"), counting_task(&counter, 10)),
            ScheduleOutcome::Replaced
        );
        assert!(scheduler.is_pending(&key("s")));

        settle(&scheduler).await;

        // Only the replacement ran.
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert!(!scheduler.is_pending(&key("s")));
        assert!(!scheduler.is_running(&key("s")));
    }

    #[tokio::test(start_paused = true)]
    async fn request_while_running_is_dropped() {
        let scheduler = TaskScheduler::new(Duration::from_millis(50));
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (started_tx, started_rx) = oneshot::channel::<()>();

        scheduler.schedule(key("s"), move || async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
        });
        settle(&scheduler).await;
        started_rx.await.expect("task started");
        assert!(scheduler.is_running(&key("s")));

        let counter = Arc::new(AtomicUsize::new(0));
        assert_eq!(
            scheduler.schedule(key("s"), counting_task(&counter, 1)),
            ScheduleOutcome::Dropped
        );

        let _ = release_tx.send(());
        settle(&scheduler).await;
        assert!(!scheduler.is_running(&key("s")));
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        // Once finished, the key accepts new work.
        assert_eq!(
            scheduler.schedule(key("s"), counting_task(&counter, 1)),
            ScheduleOutcome::Scheduled
        );
        settle(&scheduler).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let scheduler = TaskScheduler::new(Duration::from_millis(10));
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.schedule(key("a"), counting_task(&counter, 1));
        scheduler.schedule(key("b"), counting_task(&counter, 1));
        scheduler.schedule(
            TaskKey::new(TaskKind::NameGeneration, SessionId::new("a")),
            counting_task(&counter, 1),
        );
        settle(&scheduler).await;

        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_removes_pending_task() {
        let scheduler = TaskScheduler::new(Duration::from_millis(10));
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.schedule(key("s"), counting_task(&counter, 1));
        assert!(scheduler.cancel(&key("s")));
        assert!(!scheduler.cancel(&key("s")));
        settle(&scheduler).await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}

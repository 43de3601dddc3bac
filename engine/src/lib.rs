//! Session engine for Colloquy: persistence, update ordering, and context
//! compaction.
//!
//! # Architecture
//!
//! ```text
//! SessionService ──► SessionQueue (per-session FIFO) ──► Store (memory / JSON files)
//!       │
//!       ├──► ContextMeter ──► colloquy-context (projection, estimation, overflow)
//!       │
//!       └──► CompactionOrchestrator ──► Summarizer
//!                  │
//!                  └──► TaskScheduler (debounced background checks)
//! ```
//!
//! Text generation and error tracking are collaborators supplied by the
//! caller through [`Summarizer`] and [`ErrorReporter`].

mod compaction;
mod config;
mod queue;
mod scheduler;
mod session;
mod store;
mod summarizer;
mod usage;

pub use compaction::{
    CompactionError, CompactionEvent, CompactionOrchestrator, CompactionOutcome,
    CompactionState, CompactionStatus, CompactionTrigger,
};
pub use config::{
    CompactionConfig, ConfigError, ContextConfig, EngineConfig, SchedulerConfig, config_path,
    expand_env_vars,
};
pub use queue::{QueueError, SessionQueue, UpdateQueue};
pub use scheduler::{DEFAULT_DEBOUNCE, ScheduleOutcome, TaskKey, TaskKind, TaskScheduler};
pub use session::{EngineError, PreparedSend, SessionService};
pub use store::{
    FileSessionStore, MemorySessionStore, MemoryStore, SessionStore, Store, StoreError, StoreFut,
};
pub use summarizer::{ErrorReporter, SummarizeError, SummarizeFut, Summarizer, TracingErrorReporter};
pub use usage::{ContextMeter, ContextUsage, Measurement, SharedAttachmentSource};

pub use colloquy_context;
pub use colloquy_types;
pub use colloquy_utils::Durability;

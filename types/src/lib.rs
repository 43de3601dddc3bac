//! Core conversation domain types for Colloquy.
//!
//! This crate contains pure domain types with no IO, no async, and minimal
//! dependencies. Everything here can be used from any layer of the engine.

mod ids;
mod message;
mod session;

pub use ids::{MessageId, SessionId, ThreadId};
pub use message::{
    Attachment, ContentPart, Message, MessageFile, MessageLink, Role, TokenCountMap,
};
pub use session::{
    CompactionPoint, ForkBranch, ForkHash, MessageForkEntry, Session, SessionSettings,
    SessionThread, SessionType,
};

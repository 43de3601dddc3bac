//! Shared infrastructure utilities for Colloquy.
//!
//! This crate provides cross-cutting utilities that don't belong in the
//! domain-pure `colloquy-types` crate:
//!
//! - **`atomic_write`**: crash-safe document persistence (temp + rename)

pub mod atomic_write;

pub use atomic_write::{Durability, Recovery, restore_interrupted, write_document};

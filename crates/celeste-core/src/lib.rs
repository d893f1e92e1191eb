//! Core types and error definitions for Celeste.
//!
//! This crate provides the foundational types shared across the Celeste
//! crates: the error enum, chat messages, tool calls and skill definitions.
//!
//! # Main types
//!
//! - [`CelesteError`]: Unified error enum for all Celeste subsystems.
//! - [`CelesteResult`]: Convenience alias for `Result<T, CelesteError>`.
//! - [`Role`]: Message role (system, user, assistant, tool).
//! - [`ChatMessage`]: A single message within a conversation.
//! - [`ToolCall`]: An LLM-initiated tool invocation request.
//! - [`SkillDefinition`]: A tool offered to the model.

/// Error type and result alias.
pub mod error;
/// Chat messages and role definitions.
pub mod message;
/// Tool calls and skill definitions.
pub mod tool;

pub use error::{CelesteError, CelesteResult};
pub use message::{ChatMessage, Role, SUMMARY_METADATA_KEY};
pub use tool::{SkillDefinition, ToolCall};

//! Lexforge Common Library
//!
//! Shared code for the Lexforge crates including:
//! - Configuration management
//! - Error types and handling
//! - Conversation types and the generation service client
//! - Database pool and repository for the legal reference store
//! - Metrics and observability helpers

pub mod config;
pub mod conversation;
pub mod db;
pub mod errors;
pub mod llm;
pub mod metrics;

// Re-export commonly used types
pub use config::AppConfig;
pub use conversation::{ConversationTurn, Role};
pub use db::{DbPool, Repository};
pub use errors::{AppError, Result};
pub use llm::Generator;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default language of the indexed content
pub const DEFAULT_LANGUAGE: &str = "en";

//! Lexforge answer pipeline
//!
//! Turns a conversation into a grounded, streamed answer:
//! - Query expansion into independent search queries
//! - Grounded context assembly from search and legislation results
//! - The streaming orchestrator and its event protocol

pub mod assembler;
pub mod events;
pub mod orchestrator;
pub mod prompts;
pub mod query_expander;

pub use events::{Citation, EventSink, NotificationLevel, StreamEvent};
pub use orchestrator::{ChatPipeline, PipelineSettings, PipelineStage, PreparedChat, RunOutcome, RunSummary};
pub use query_expander::{ExpandedQueries, QueryExpander, QuerySource};

//! Lexforge retrieval
//!
//! - Semantic search adapter for the hosted hybrid index
//! - Concurrent multi-query fan-out with per-leg failure isolation
//! - Identity-keyed deduplication of result batches
//! - Bounded breadth-first expansion of legislation cross-references

pub mod dedup;
pub mod legislation;
pub mod retrieval;

pub use dedup::{merge_batches, Identified, SeenSet};
pub use legislation::{
    hops_for_depth, ExpansionOutcome, ExpansionStatus, MockReferenceStore, ReferenceExpander,
    ReferenceStore, SecondaryResult, SectionNode, SqlReferenceStore,
};
pub use retrieval::{
    fan_out, AzureSearchClient, LegEvent, MockSearchBackend, PrimaryResult, SearchBackend,
    SearchOptions,
};

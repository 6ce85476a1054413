//! Streaming orchestrator
//!
//! Sequences one answer:
//!
//! `Init → QueryExpansion → Searching → (GraphExpansion) → ContextAssembly →
//! Generating → Done`
//!
//! Query expansion runs in `prepare`, before any event is emitted, so its
//! failure surfaces as an ordinary HTTP error. Everything after that streams:
//! search legs and the legislation lookup degrade instead of failing, and a
//! generation failure ends the stream with a single `error` event.

use crate::assembler;
use crate::events::{self, AnswerMetadata, Citation, EventSink, StreamEvent};
use crate::prompts;
use crate::query_expander::{QueryExpander, QuerySource};
use futures::StreamExt;
use lexforge_common::config::PipelineConfig;
use lexforge_common::conversation::{ConversationTurn, Role};
use lexforge_common::errors::Result;
use lexforge_common::llm::{ChatMessage, Generator, TextChunk, TextRequest, Usage};
use lexforge_common::metrics;
use lexforge_search::{
    fan_out, ExpansionStatus, LegEvent, PrimaryResult, ReferenceExpander, ReferenceStore,
    SearchBackend, SearchOptions, SecondaryResult, SeenSet,
};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

pub const PROCESSING_MESSAGE: &str = "Processing your request...";
pub const LEGISLATION_WARNING: &str = "Warning: Could not fetch related legislation";
pub const COMPLETED_MESSAGE: &str = "Request completed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Init,
    QueryExpansion,
    Searching,
    GraphExpansion,
    ContextAssembly,
    Generating,
    Done,
    Error,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Init => "init",
            PipelineStage::QueryExpansion => "query_expansion",
            PipelineStage::Searching => "searching",
            PipelineStage::GraphExpansion => "graph_expansion",
            PipelineStage::ContextAssembly => "context_assembly",
            PipelineStage::Generating => "generating",
            PipelineStage::Done => "done",
            PipelineStage::Error => "error",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a streamed run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Done,
    GenerationFailed,
    /// The client went away
    Cancelled,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Done => "done",
            RunOutcome::GenerationFailed => "error",
            RunOutcome::Cancelled => "cancelled",
        }
    }
}

/// Tunables taken from the `pipeline` config section
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_queries: usize,
    pub search_top: usize,
    pub expansion_fallback: bool,
    pub max_reference_hops: usize,
    pub reference_timeout: Duration,
    pub event_buffer: usize,
}

impl From<&PipelineConfig> for PipelineSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_queries: config.max_queries,
            search_top: config.search_top,
            expansion_fallback: config.expansion_fallback,
            max_reference_hops: config.reference_hop_cap(),
            reference_timeout: config.reference_timeout(),
            event_buffer: config.event_buffer,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

/// A request whose queries are known; ready to stream
#[derive(Debug, Clone)]
pub struct PreparedChat {
    pub message_id: String,
    pub turns: Vec<ConversationTurn>,
    pub queries: Vec<String>,
    pub query_source: QuerySource,
    pub search_depth: i64,
}

/// What happened during one run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    /// Stages entered, in order
    pub stages: Vec<PipelineStage>,
    pub primary_count: usize,
    pub secondary_count: usize,
    pub failed_legs: usize,
    pub expansion: ExpansionStatus,
    pub usage: Option<Usage>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn reached(&self, stage: PipelineStage) -> bool {
        self.stages.contains(&stage)
    }
}

struct Run {
    sink: EventSink,
    summary: RunSummary,
    started: Instant,
}

impl Run {
    fn enter(&mut self, stage: PipelineStage) {
        tracing::debug!(stage = %stage, elapsed_ms = self.started.elapsed().as_millis() as u64, "Pipeline stage");
        self.summary.stages.push(stage);
    }

    async fn emit(&self, event: StreamEvent) -> std::result::Result<(), events::Disconnected> {
        self.sink.emit(event).await
    }

    fn finish(mut self, outcome: RunOutcome) -> RunSummary {
        self.summary.outcome = outcome;
        self.summary.elapsed = self.started.elapsed();
        metrics::record_stream_outcome(outcome.as_str(), self.summary.elapsed.as_secs_f64());
        tracing::info!(
            outcome = outcome.as_str(),
            primary = self.summary.primary_count,
            secondary = self.summary.secondary_count,
            failed_legs = self.summary.failed_legs,
            expansion = self.summary.expansion.as_str(),
            elapsed_ms = self.summary.elapsed.as_millis() as u64,
            "Answer stream finished"
        );
        self.summary
    }
}

/// Answer pipeline; collaborators are injected as ports
pub struct ChatPipeline {
    expander: QueryExpander,
    search: Arc<dyn SearchBackend>,
    references: ReferenceExpander,
    generator: Arc<dyn Generator>,
    settings: PipelineSettings,
}

impl ChatPipeline {
    pub fn new(
        search: Arc<dyn SearchBackend>,
        references: Arc<dyn ReferenceStore>,
        generator: Arc<dyn Generator>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            expander: QueryExpander::new(
                generator.clone(),
                settings.max_queries,
                settings.expansion_fallback,
            ),
            search,
            references: ReferenceExpander::new(
                references,
                settings.reference_timeout,
                settings.max_reference_hops,
            ),
            generator,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Init → QueryExpansion. Fails before anything is streamed.
    pub async fn prepare(&self, turns: Vec<ConversationTurn>, search_depth: i64) -> Result<PreparedChat> {
        tracing::debug!(stage = %PipelineStage::QueryExpansion, turns = turns.len(), "Pipeline stage");

        let expanded = self.expander.expand(&turns).await.map_err(|error| {
            tracing::error!(stage = %PipelineStage::Error, error = %error, "Query expansion failed");
            error
        })?;

        Ok(PreparedChat {
            message_id: Uuid::new_v4().to_string(),
            turns,
            queries: expanded.queries,
            query_source: expanded.source,
            search_depth,
        })
    }

    /// Run the streamed part on a background task and hand back its events.
    /// Dropping the receiver cancels the run.
    pub fn spawn(self: &Arc<Self>, prepared: PreparedChat) -> mpsc::Receiver<StreamEvent> {
        let (sink, rx) = events::channel(self.settings.event_buffer);
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            pipeline.run(prepared, sink).await;
        });
        rx
    }

    /// Searching → GraphExpansion → ContextAssembly → Generating → Done
    pub async fn run(&self, prepared: PreparedChat, sink: EventSink) -> RunSummary {
        let mut run = Run {
            sink,
            summary: RunSummary {
                outcome: RunOutcome::Done,
                stages: vec![PipelineStage::Init, PipelineStage::QueryExpansion],
                primary_count: 0,
                secondary_count: 0,
                failed_legs: 0,
                expansion: ExpansionStatus::Skipped,
                usage: None,
                elapsed: Duration::ZERO,
            },
            started: Instant::now(),
        };

        match self.stream_answer(&prepared, &mut run).await {
            Ok(outcome) => run.finish(outcome),
            Err(events::Disconnected) => {
                tracing::info!(message_id = %prepared.message_id, "Client disconnected");
                run.finish(RunOutcome::Cancelled)
            }
        }
    }

    async fn stream_answer(
        &self,
        prepared: &PreparedChat,
        run: &mut Run,
    ) -> std::result::Result<RunOutcome, events::Disconnected> {
        let mut metadata = AnswerMetadata::new(&prepared.queries);

        run.emit(StreamEvent::Start {
            message_id: prepared.message_id.clone(),
        })
        .await?;
        run.emit(StreamEvent::info(PROCESSING_MESSAGE)).await?;
        run.emit(StreamEvent::Metadata(metadata.clone())).await?;

        run.enter(PipelineStage::Searching);
        let pages = self.search_pages(&prepared.queries, run).await?;

        let sections = self.expand_references(&pages, prepared.search_depth, run).await?;

        run.enter(PipelineStage::ContextAssembly);
        let sources = assembler::assemble(&pages, &sections);

        run.enter(PipelineStage::Generating);
        let request = TextRequest {
            system: prompts::ANSWER_SYSTEM.to_string(),
            messages: answer_messages(&prepared.turns, sources),
        };

        let outcome = self.relay_generation(&request, &prepared.message_id, run).await?;
        if outcome != RunOutcome::Done {
            return Ok(outcome);
        }

        metadata.usage = run.summary.usage;
        metadata.degraded = run.summary.failed_legs > 0 || run.summary.expansion.is_degraded();
        run.emit(StreamEvent::Metadata(metadata)).await?;
        run.emit(StreamEvent::info(COMPLETED_MESSAGE)).await?;
        run.emit(StreamEvent::Finish).await?;
        run.enter(PipelineStage::Done);

        Ok(RunOutcome::Done)
    }

    /// Fan out every query; cite each new page as it arrives
    async fn search_pages(
        &self,
        queries: &[String],
        run: &mut Run,
    ) -> std::result::Result<Vec<PrimaryResult>, events::Disconnected> {
        let options = SearchOptions::with_top(self.settings.search_top);
        let mut legs = fan_out(self.search.clone(), queries, options);
        let mut seen = SeenSet::new();
        let mut pages = Vec::new();

        while let Some(event) = legs.next().await {
            match event {
                LegEvent::Hit { result, .. } => {
                    if seen.admit(&result) {
                        run.emit(StreamEvent::Citation(Citation::Page(result.clone())))
                            .await?;
                        pages.push(result);
                    }
                }
                LegEvent::Failed { .. } => run.summary.failed_legs += 1,
            }
        }

        run.summary.primary_count = pages.len();
        Ok(pages)
    }

    /// Legislation referenced by the cited pages, best effort
    async fn expand_references(
        &self,
        pages: &[PrimaryResult],
        search_depth: i64,
        run: &mut Run,
    ) -> std::result::Result<Vec<SecondaryResult>, events::Disconnected> {
        let mut unique = HashSet::new();
        let nids: Vec<i64> = pages
            .iter()
            .map(|p| p.nid)
            .filter(|nid| unique.insert(*nid))
            .collect();

        if lexforge_search::hops_for_depth(search_depth) == 0 || nids.is_empty() {
            return Ok(Vec::new());
        }

        run.enter(PipelineStage::GraphExpansion);
        let outcome = self.references.expand(&nids, search_depth).await;
        run.summary.expansion = outcome.status;

        match outcome.status {
            ExpansionStatus::Completed => {
                run.emit(StreamEvent::info(format!(
                    "Legislation search completed in {}ms.",
                    outcome.elapsed.as_millis()
                )))
                .await?
            }
            ExpansionStatus::TimedOut | ExpansionStatus::Failed => {
                run.emit(StreamEvent::warning(LEGISLATION_WARNING)).await?
            }
            ExpansionStatus::Skipped => {}
        }

        for section in &outcome.sections {
            run.emit(StreamEvent::Citation(Citation::Section(section.clone())))
                .await?;
        }

        run.summary.secondary_count = outcome.sections.len();
        Ok(outcome.sections)
    }

    /// Relay generated text in arrival order until it ends, fails or the
    /// client goes away
    async fn relay_generation(
        &self,
        request: &TextRequest,
        message_id: &str,
        run: &mut Run,
    ) -> std::result::Result<RunOutcome, events::Disconnected> {
        let mut stream = match self.generator.stream_text(request).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(error = %error, "Answer generation failed to start");
                run.emit(StreamEvent::Error {
                    message: error.to_string(),
                })
                .await?;
                return Ok(RunOutcome::GenerationFailed);
            }
        };

        let text_id = format!("{}-text", message_id);
        let mut text_started = false;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = run.sink.closed() => return Err(events::Disconnected),
                chunk = stream.next() => chunk,
            };

            match chunk {
                Some(Ok(TextChunk::Delta(delta))) => {
                    if !text_started {
                        run.emit(StreamEvent::TextStart { id: text_id.clone() }).await?;
                        text_started = true;
                    }
                    run.emit(StreamEvent::TextDelta {
                        id: text_id.clone(),
                        delta,
                    })
                    .await?;
                }
                Some(Ok(TextChunk::Finish(usage))) => {
                    metrics::record_generation_usage(self.generator.model_name(), &usage);
                    run.summary.usage = Some(usage);
                }
                Some(Err(error)) => {
                    tracing::error!(error = %error, "Answer generation failed mid-stream");
                    run.emit(StreamEvent::Error {
                        message: error.to_string(),
                    })
                    .await?;
                    return Ok(RunOutcome::GenerationFailed);
                }
                None => break,
            }
        }

        if text_started {
            run.emit(StreamEvent::TextEnd { id: text_id }).await?;
        }
        Ok(RunOutcome::Done)
    }
}

/// Conversation turns followed by the grounding sources as a system message
fn answer_messages(turns: &[ConversationTurn], sources: String) -> Vec<ChatMessage> {
    turns
        .iter()
        .filter(|turn| !turn.is_blank())
        .map(|turn| ChatMessage::new(turn.role, turn.text()))
        .chain(std::iter::once(ChatMessage::new(Role::System, sources)))
        .collect()
}

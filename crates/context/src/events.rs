//! Stream events and their wire encoding
//!
//! Events are emitted in strict order through an `EventSink` and consumed
//! once. `to_chunk` renders each event as one UI-message-stream JSON chunk.

use lexforge_common::llm::Usage;
use lexforge_search::{PrimaryResult, SecondaryResult};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
}

/// A source backing the answer
#[derive(Debug, Clone, PartialEq)]
pub enum Citation {
    Page(PrimaryResult),
    Section(SecondaryResult),
}

impl Citation {
    pub fn source_id(&self) -> String {
        match self {
            Citation::Page(page) => page.source_id(),
            Citation::Section(section) => section.source_id(),
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Citation::Page(page) => &page.url,
            Citation::Section(section) => &section.url,
        }
    }
}

/// Metadata attached to the answer message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerMetadata {
    /// All queries joined by newline
    pub search_query: String,
    pub search_queries: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Some retrieval leg failed or timed out
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

impl AnswerMetadata {
    pub fn new(queries: &[String]) -> Self {
        Self {
            search_query: queries.join("\n"),
            search_queries: queries.to_vec(),
            usage: None,
            degraded: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Start { message_id: String },
    Notification { message: String, level: NotificationLevel },
    Metadata(AnswerMetadata),
    Citation(Citation),
    TextStart { id: String },
    TextDelta { id: String, delta: String },
    TextEnd { id: String },
    /// Generation failed mid-stream; nothing follows
    Error { message: String },
    /// The answer is complete
    Finish,
}

impl StreamEvent {
    pub fn info(message: impl Into<String>) -> Self {
        StreamEvent::Notification {
            message: message.into(),
            level: NotificationLevel::Info,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        StreamEvent::Notification {
            message: message.into(),
            level: NotificationLevel::Warning,
        }
    }

    /// Wire `type` of the chunk
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Start { .. } => "start",
            StreamEvent::Notification { .. } => "data-data",
            StreamEvent::Metadata(_) => "message-metadata",
            StreamEvent::Citation(_) => "source-url",
            StreamEvent::TextStart { .. } => "text-start",
            StreamEvent::TextDelta { .. } => "text-delta",
            StreamEvent::TextEnd { .. } => "text-end",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Finish => "finish",
        }
    }

    /// Render as a UI-message-stream chunk
    pub fn to_chunk(&self) -> Value {
        match self {
            StreamEvent::Start { message_id } => json!({
                "type": "start",
                "messageId": message_id,
            }),
            StreamEvent::Notification { message, level } => json!({
                "type": "data-data",
                "data": { "type": "notification", "message": message, "level": level },
                "transient": true,
            }),
            StreamEvent::Metadata(metadata) => json!({
                "type": "message-metadata",
                "messageMetadata": metadata,
            }),
            StreamEvent::Citation(Citation::Page(page)) => json!({
                "type": "source-url",
                "sourceId": page.source_id(),
                "url": page.url,
                "title": page.title,
                "providerMetadata": {
                    "custom": {
                        "score": page.score,
                        "rerankerScore": page.reranker_score,
                        "caption": page.caption,
                        "captionHighlights": page.caption_highlights,
                    }
                },
            }),
            StreamEvent::Citation(Citation::Section(section)) => json!({
                "type": "source-url",
                "sourceId": section.source_id(),
                "url": section.url,
                "title": section.citation_title(),
                "providerMetadata": {
                    "custom": {
                        "capTitle": section.cap_title,
                        "sectionHeading": section.section_heading,
                        "caption": section.section_heading,
                    }
                },
            }),
            StreamEvent::TextStart { id } => json!({ "type": "text-start", "id": id }),
            StreamEvent::TextDelta { id, delta } => json!({
                "type": "text-delta",
                "id": id,
                "delta": delta,
            }),
            StreamEvent::TextEnd { id } => json!({ "type": "text-end", "id": id }),
            StreamEvent::Error { message } => json!({ "type": "error", "errorText": message }),
            StreamEvent::Finish => json!({ "type": "finish" }),
        }
    }
}

/// The receiving side has gone away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnected;

/// Ordered, backpressured event channel to one client
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
}

/// Create a sink and its receiving end
pub fn channel(buffer: usize) -> (EventSink, mpsc::Receiver<StreamEvent>) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (EventSink { tx }, rx)
}

impl EventSink {
    pub async fn emit(&self, event: StreamEvent) -> Result<(), Disconnected> {
        self.tx.send(event).await.map_err(|_| Disconnected)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the receiver is dropped
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_chunk_is_transient() {
        let chunk = StreamEvent::warning("Warning: Could not fetch related legislation").to_chunk();
        assert_eq!(chunk["type"], "data-data");
        assert_eq!(chunk["data"]["type"], "notification");
        assert_eq!(chunk["data"]["level"], "warning");
        assert_eq!(chunk["transient"], true);
    }

    #[test]
    fn test_page_citation_chunk() {
        let page = PrimaryResult {
            nid: 42,
            chunk_no: 1,
            title: "Penalties".to_string(),
            url: "https://clic.org.hk/en/topics/ip/penalties".to_string(),
            score: Some(0.03),
            caption: "Offenders are liable".to_string(),
            ..Default::default()
        };
        let chunk = StreamEvent::Citation(Citation::Page(page)).to_chunk();
        assert_eq!(chunk["sourceId"], "clic-42-1");
        assert_eq!(chunk["providerMetadata"]["custom"]["score"], 0.03);
        assert!(chunk["providerMetadata"]["custom"]["rerankerScore"].is_null());
    }

    #[test]
    fn test_section_citation_chunk() {
        let section = SecondaryResult {
            cap_number: "528".to_string(),
            section_number: "118".to_string(),
            cap_title: "Copyright Ordinance".to_string(),
            section_heading: "Offences".to_string(),
            url: "https://www.elegislation.gov.hk/hk/cap528!en/s118".to_string(),
            ..Default::default()
        };
        let chunk = StreamEvent::Citation(Citation::Section(section)).to_chunk();
        assert_eq!(chunk["sourceId"], "cap-528-118-none");
        assert_eq!(chunk["title"], "Cap 528, 118: Copyright Ordinance");
        assert_eq!(chunk["providerMetadata"]["custom"]["caption"], "Offences");
    }

    #[test]
    fn test_metadata_chunk() {
        let queries = vec!["a".to_string(), "b".to_string()];
        let chunk = StreamEvent::Metadata(AnswerMetadata::new(&queries)).to_chunk();
        assert_eq!(chunk["messageMetadata"]["searchQuery"], "a\nb");
        assert!(chunk["messageMetadata"].get("usage").is_none());
        assert!(chunk["messageMetadata"].get("degraded").is_none());
    }

    #[tokio::test]
    async fn test_sink_reports_disconnect() {
        let (sink, rx) = channel(4);
        assert!(sink.emit(StreamEvent::Finish).await.is_ok());
        drop(rx);
        assert!(sink.is_closed());
        assert_eq!(sink.emit(StreamEvent::Finish).await, Err(Disconnected));
    }
}

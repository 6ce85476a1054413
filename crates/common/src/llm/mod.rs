//! Generation service abstraction
//!
//! Provides a unified interface over the hosted language model:
//! - Structured output constrained by a JSON schema (query expansion)
//! - Streaming text generation with a final usage summary (answers)

mod client;

pub use client::ChatCompletionsClient;

use crate::conversation::Role;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Message sent to the generation service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Structured-output request
#[derive(Debug, Clone)]
pub struct ObjectRequest {
    pub system: String,
    pub prompt: String,
    /// Schema name reported to the service
    pub schema_name: String,
    /// JSON schema the output must satisfy
    pub schema: serde_json::Value,
}

/// Streaming text request
#[derive(Debug, Clone, PartialEq)]
pub struct TextRequest {
    pub system: String,
    pub messages: Vec<ChatMessage>,
}

/// Token accounting reported when a generation finishes
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cached_input_tokens: u32,
    pub total_tokens: u32,
}

/// Item of a text generation stream
#[derive(Debug, Clone, PartialEq)]
pub enum TextChunk {
    Delta(String),
    Finish(Usage),
}

/// Ordered stream of generated text
pub type TextStream = BoxStream<'static, Result<TextChunk>>;

/// Trait for the hosted generation service
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate a JSON value conforming to the request schema
    async fn generate_object(&self, request: &ObjectRequest) -> Result<serde_json::Value>;

    /// Start a streaming generation; deltas arrive in generation order
    async fn stream_text(&self, request: &TextRequest) -> Result<TextStream>;

    /// Get the model name
    fn model_name(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum StreamBehaviour {
    Complete,
    FailToStart,
    FailMidway,
    Hang,
}

/// Mock generator for testing
pub struct MockGenerator {
    object: Option<serde_json::Value>,
    deltas: Vec<String>,
    usage: Usage,
    behaviour: StreamBehaviour,
    text_requests: Mutex<Vec<TextRequest>>,
}

impl MockGenerator {
    /// Expansion yields `queries`; answers stream `deltas`
    pub fn new(queries: &[&str], deltas: &[&str]) -> Self {
        Self {
            object: Some(serde_json::json!({ "queries": queries })),
            deltas: deltas.iter().map(|d| d.to_string()).collect(),
            usage: Usage {
                input_tokens: 1200,
                output_tokens: deltas.len() as u32,
                cached_input_tokens: 0,
                total_tokens: 1200 + deltas.len() as u32,
            },
            behaviour: StreamBehaviour::Complete,
            text_requests: Mutex::new(Vec::new()),
        }
    }

    /// Structured output returns this raw value instead
    pub fn with_object(mut self, object: serde_json::Value) -> Self {
        self.object = Some(object);
        self
    }

    /// Structured output fails with GenerationUnavailable
    pub fn with_failing_expansion(mut self) -> Self {
        self.object = None;
        self
    }

    /// Answer generation cannot start
    pub fn with_failing_stream(mut self) -> Self {
        self.behaviour = StreamBehaviour::FailToStart;
        self
    }

    /// Answer generation errors after the first delta
    pub fn with_broken_stream(mut self) -> Self {
        self.behaviour = StreamBehaviour::FailMidway;
        self
    }

    /// Answer generation never completes after the first delta
    pub fn with_hanging_stream(mut self) -> Self {
        self.behaviour = StreamBehaviour::Hang;
        self
    }

    /// Text requests received so far
    pub fn text_requests(&self) -> Vec<TextRequest> {
        self.text_requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

fn unavailable(message: &str) -> AppError {
    AppError::GenerationUnavailable {
        message: message.to_string(),
    }
}

#[async_trait]
impl Generator for MockGenerator {
    async fn generate_object(&self, _request: &ObjectRequest) -> Result<serde_json::Value> {
        self.object
            .clone()
            .ok_or_else(|| unavailable("mock expansion failure"))
    }

    async fn stream_text(&self, request: &TextRequest) -> Result<TextStream> {
        if let Ok(mut requests) = self.text_requests.lock() {
            requests.push(request.clone());
        }

        let first: Vec<Result<TextChunk>> = self
            .deltas
            .iter()
            .take(1)
            .map(|d| Ok(TextChunk::Delta(d.clone())))
            .collect();

        match self.behaviour {
            StreamBehaviour::FailToStart => Err(unavailable("mock stream failure")),
            StreamBehaviour::FailMidway => {
                let mut items = first;
                items.push(Err(unavailable("mock stream interrupted")));
                Ok(stream::iter(items).boxed())
            }
            StreamBehaviour::Hang => Ok(stream::iter(first).chain(stream::pending()).boxed()),
            StreamBehaviour::Complete => {
                let mut items: Vec<Result<TextChunk>> = self
                    .deltas
                    .iter()
                    .map(|d| Ok(TextChunk::Delta(d.clone())))
                    .collect();
                items.push(Ok(TextChunk::Finish(self.usage)));
                Ok(stream::iter(items).boxed())
            }
        }
    }

    fn model_name(&self) -> &str {
        "mock-generator"
    }
}

//! Chat-completions client for Azure OpenAI and OpenAI-compatible endpoints

use super::{ChatMessage, Generator, ObjectRequest, TextChunk, TextRequest, TextStream, Usage};
use crate::config::LlmConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

const MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
enum ApiAuth {
    /// `api-key` header (Azure)
    ApiKey(String),
    /// `Authorization: Bearer` header (OpenAI)
    Bearer(String),
}

/// Generation client speaking the chat-completions wire format
pub struct ChatCompletionsClient {
    client: reqwest::Client,
    url: String,
    auth: ApiAuth,
    model: String,
    temperature: f32,
    timeout: Duration,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
    refusal: Option<String>,
}

#[derive(Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    delta: Option<ChunkDelta>,
}

#[derive(Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u32,
}

impl From<WireUsage> for Usage {
    fn from(usage: WireUsage) -> Self {
        Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            cached_input_tokens: usage
                .prompt_tokens_details
                .map(|d| d.cached_tokens)
                .unwrap_or(0),
            total_tokens: usage.total_tokens,
        }
    }
}

fn unavailable(message: String) -> AppError {
    AppError::GenerationUnavailable { message }
}

impl ChatCompletionsClient {
    /// Create a client from the `llm` config section
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let base = config.api_base.trim_end_matches('/');
        let (url, auth) = match config.provider.as_str() {
            "azure" => (
                format!(
                    "{}/openai/deployments/{}/chat/completions?api-version={}",
                    base, config.model, config.api_version
                ),
                ApiAuth::ApiKey(config.api_key.clone()),
            ),
            "openai" => (
                format!("{}/chat/completions", base),
                ApiAuth::Bearer(config.api_key.clone()),
            ),
            other => {
                return Err(AppError::Configuration {
                    message: format!("unknown llm.provider '{}'", other),
                })
            }
        };

        // No overall timeout: answer streams may outlive any fixed budget.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            url,
            auth,
            model: config.model.clone(),
            temperature: config.temperature,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    fn body<'a>(
        &'a self,
        system: &'a str,
        messages: impl Iterator<Item = (&'a str, &'a str)>,
    ) -> CompletionRequest<'a> {
        let mut wire = vec![WireMessage {
            role: "system",
            content: system,
        }];
        wire.extend(messages.map(|(role, content)| WireMessage { role, content }));

        CompletionRequest {
            model: match self.auth {
                ApiAuth::Bearer(_) => Some(self.model.as_str()),
                ApiAuth::ApiKey(_) => None,
            },
            messages: wire,
            temperature: self.temperature,
            response_format: None,
            stream: false,
            stream_options: None,
        }
    }

    async fn post(&self, body: &CompletionRequest<'_>, timeout: Option<Duration>) -> Result<reqwest::Response> {
        let mut request = self.client.post(&self.url).json(body);
        request = match &self.auth {
            ApiAuth::ApiKey(key) => request.header("api-key", key),
            ApiAuth::Bearer(key) => request.bearer_auth(key),
        };
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|e| unavailable(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(unavailable(format!("API error {}: {}", status, body)));
        }

        Ok(response)
    }

    async fn object_once(&self, request: &ObjectRequest) -> Result<serde_json::Value> {
        let mut body = self.body(&request.system, std::iter::once(("user", request.prompt.as_str())));
        body.response_format = Some(serde_json::json!({
            "type": "json_schema",
            "json_schema": {
                "name": request.schema_name,
                "schema": request.schema,
                "strict": true,
            }
        }));

        let response: CompletionResponse = self
            .post(&body, Some(self.timeout))
            .await?
            .json()
            .await
            .map_err(|e| unavailable(format!("Failed to parse response: {}", e)))?;

        let message = response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| unavailable("Empty response".to_string()))?;

        if let Some(refusal) = message.refusal {
            return Err(unavailable(format!("Model refused: {}", refusal)));
        }

        let content = message
            .content
            .ok_or_else(|| unavailable("Response has no content".to_string()))?;

        serde_json::from_str(&content)
            .map_err(|e| unavailable(format!("Output is not valid JSON: {}", e)))
    }
}

#[async_trait]
impl Generator for ChatCompletionsClient {
    async fn generate_object(&self, request: &ObjectRequest) -> Result<serde_json::Value> {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = Duration::from_millis(100 * 2_u64.pow(attempt));
                tokio::time::sleep(delay).await;
            }

            match self.object_once(request).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries = MAX_RETRIES,
                        error = %e,
                        "Structured generation failed, retrying"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| unavailable("Unknown error after retries".to_string())))
    }

    async fn stream_text(&self, request: &TextRequest) -> Result<TextStream> {
        let mut body = self.body(
            &request.system,
            request
                .messages
                .iter()
                .map(|m: &ChatMessage| (m.role.as_str(), m.content.as_str())),
        );
        body.stream = true;
        body.stream_options = Some(StreamOptions { include_usage: true });

        let response = self.post(&body, None).await?;
        tracing::debug!(model = %self.model, "Generation stream opened");

        let state = ChunkReader::new(event_payloads(response.bytes_stream()));

        Ok(stream::unfold(state, ChunkReader::next_chunk).boxed())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Decode one streamed payload. `None` marks the end of the stream.
fn decode_chunk(payload: &str) -> Result<Option<Vec<TextChunk>>> {
    if payload == "[DONE]" {
        return Ok(None);
    }

    let chunk: CompletionChunk = serde_json::from_str(payload)
        .map_err(|e| unavailable(format!("Malformed stream chunk: {}", e)))?;

    let mut out: Vec<TextChunk> = chunk
        .choices
        .into_iter()
        .filter_map(|choice| choice.delta.and_then(|d| d.content))
        .filter(|text| !text.is_empty())
        .map(TextChunk::Delta)
        .collect();

    if let Some(usage) = chunk.usage {
        out.push(TextChunk::Finish(usage.into()));
    }

    Ok(Some(out))
}

/// `data:` payloads of an event-stream body; blank payloads are skipped
fn event_payloads<S, B, E>(body: S) -> BoxStream<'static, Result<String>>
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    body.eventsource()
        .filter_map(|event| async move {
            match event {
                Ok(event) if event.data.trim().is_empty() => None,
                Ok(event) => Some(Ok(event.data)),
                Err(e) => Some(Err(unavailable(format!("Stream interrupted: {}", e)))),
            }
        })
        .boxed()
}

struct ChunkReader {
    payloads: BoxStream<'static, Result<String>>,
    pending: VecDeque<TextChunk>,
    done: bool,
}

impl ChunkReader {
    fn new(payloads: BoxStream<'static, Result<String>>) -> Self {
        Self {
            payloads,
            pending: VecDeque::new(),
            done: false,
        }
    }

    async fn next_chunk(mut self) -> Option<(Result<TextChunk>, Self)> {
        loop {
            if let Some(chunk) = self.pending.pop_front() {
                return Some((Ok(chunk), self));
            }
            if self.done {
                return None;
            }

            let decoded = match self.payloads.next().await {
                Some(Ok(payload)) => decode_chunk(&payload),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            };

            match decoded {
                Ok(Some(chunks)) => self.pending.extend(chunks),
                Ok(None) => self.done = true,
                Err(e) => {
                    self.done = true;
                    return Some((Err(e), self));
                }
            }
        }
    }
}

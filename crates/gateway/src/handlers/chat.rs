//! Answer streaming handler
//!
//! Query expansion runs before the response starts, so its failure is an
//! ordinary JSON error. After that the answer streams as server-sent events,
//! one UI-message-stream chunk per frame, closed by a literal `[DONE]` frame
//! once the pipeline finishes.

use axum::{
    extract::{rejection::JsonRejection, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::stream::{self, Stream};
use serde::Deserialize;
use std::convert::Infallible;
use tokio::sync::mpsc;
use validator::Validate;

use crate::AppState;
use lexforge_common::{
    conversation::ConversationTurn,
    errors::{AppError, Result},
};
use lexforge_context::StreamEvent;

/// Header announcing the stream protocol to the chat client
pub const STREAM_PROTOCOL_HEADER: &str = "x-vercel-ai-ui-message-stream";

const DONE_FRAME: &str = "[DONE]";

/// Chat request
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[validate(length(min = 1, max = 200))]
    pub messages: Vec<ConversationTurn>,

    /// 0/1 search only, 2 one hop, 3 two hops, 4+ three hops
    #[serde(default = "default_search_depth")]
    pub search_depth: i64,
}

fn default_search_depth() -> i64 { 1 }

/// Map an unreadable body onto the error taxonomy
pub(crate) fn invalid_body(rejection: JsonRejection) -> AppError {
    AppError::InvalidFormat {
        message: rejection.body_text(),
    }
}

/// Stream an answer
pub async fn chat(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response> {
    let Json(request) = payload.map_err(invalid_body)?;

    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: Some("messages".to_string()),
    })?;

    let prepared = state
        .pipeline
        .prepare(request.messages, request.search_depth)
        .await?;

    tracing::info!(
        message_id = %prepared.message_id,
        queries = ?prepared.queries,
        search_depth = prepared.search_depth,
        "Streaming answer"
    );

    let events = state.pipeline.spawn(prepared);
    let sse = Sse::new(frames(events)).keep_alive(KeepAlive::default());

    Ok(([(STREAM_PROTOCOL_HEADER, "v1")], sse).into_response())
}

enum Frames {
    Open(mpsc::Receiver<StreamEvent>),
    Closing,
    Closed,
}

/// Pipeline events as SSE frames. Dropping the stream drops the receiver,
/// which cancels the pipeline run.
fn frames(events: mpsc::Receiver<StreamEvent>) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    stream::unfold(Frames::Open(events), |state| async move {
        match state {
            Frames::Open(mut events) => {
                let event = events.recv().await?;
                let next = if event == StreamEvent::Finish {
                    Frames::Closing
                } else {
                    Frames::Open(events)
                };
                Some((Ok(Event::default().data(event.to_chunk().to_string())), next))
            }
            Frames::Closing => Some((Ok(Event::default().data(DONE_FRAME)), Frames::Closed)),
            Frames::Closed => None,
        }
    })
}

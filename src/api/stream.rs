// =============================================================================
// SSE endpoint — /llm/ask_stream
// =============================================================================
//
// Frames agent events as `event: <name>\ndata: <json>\n\n`. Cancellation is
// the transport's: when the client disconnects, the generator is dropped.
// =============================================================================

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse,
    },
    Json,
};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;

use crate::app_state::AppState;
use crate::llm::agent::{ask_stream, AgentEvent};

#[derive(Deserialize)]
pub struct AskStreamQuery {
    question: Option<String>,
    #[serde(default = "default_horizon")]
    horizon: String,
    as_of: Option<String>,
}

fn default_horizon() -> String {
    "1w".to_string()
}

fn to_sse_event(ev: AgentEvent) -> Result<Event, Infallible> {
    let framed = Event::default()
        .event(ev.event)
        .json_data(&ev.data)
        .unwrap_or_else(|_| Event::default().event("error").data("serialization failed"));
    Ok(framed)
}

pub async fn ask_stream_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<AskStreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, Json<serde_json::Value>)>
{
    let question = q.question.unwrap_or_default();
    if question.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "detail": "question is required" })),
        ));
    }

    let events = ask_stream(state, question, q.horizon, q.as_of).map(to_sse_event);
    Ok(Sse::new(events))
}

// =============================================================================
// Streaming agent — decision-per-step loop over side-effect-free tools
// =============================================================================
//
// Each step streams model tokens through a small state machine:
//
//   Thinking ──"TOOL "──▶ ToolArgCapture(name) ──json parses──▶ execute, next step
//      │
//      └──"FINAL "──▶ Answering (tokens forwarded as answer_token)
//
// Tool-call markers are never surfaced as user-visible thinking tokens, a
// repeated identical call is suppressed with an internal nudge, and every
// user-originating string or tool-result serialization is PII-redacted
// before it reaches the transcript or the event stream.
// =============================================================================

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{Stream, StreamExt};
use serde_json::{json, Value};
use tracing::warn;

use crate::app_state::AppState;
use crate::registry::resolve_series_id;
use crate::snapshot::{compute_router, compute_snapshot};
use crate::store::Store;
use crate::types::AsOfMode;

use super::brief::generate_brief;
use super::docs;
use super::prompts::{build_agent_step_prompt, build_agent_system_prompt, tool_catalog_description};
use super::provider::LlmProvider;
use super::redact::redact_pii;

/// Step budget per question. Tool failures count against it.
const MAX_STEPS: usize = 4;
/// Keepalive cadence for long streams.
const PING_INTERVAL: Duration = Duration::from_secs(15);
/// Tool-result characters appended to the model transcript.
const TOOL_RESULT_LIMIT: usize = 800;

const FINAL_MARKER: &str = "FINAL ";
const TOOL_MARKER: &str = "TOOL ";

/// One server-sent event: `event:` name plus JSON `data:` payload.
#[derive(Debug, Clone)]
pub struct AgentEvent {
    pub event: &'static str,
    pub data: Value,
}

impl AgentEvent {
    fn new(event: &'static str, data: Value) -> Self {
        Self { event, data }
    }
}

/// Registry indicator ids plus registry and store series ids, injected into
/// the system prompt so the model can classify tokens without tool calls.
fn collect_known_ids(store: &Store) -> (Vec<String>, Vec<String>) {
    let mut indicator_ids: Vec<String> = Vec::new();
    let mut series_ids: Vec<String> = Vec::new();
    if let Ok(specs) = store.registry() {
        for spec in specs.iter() {
            indicator_ids.push(spec.indicator_id.clone());
            series_ids.extend(spec.series.iter().cloned());
        }
    }
    if let Ok(db_series) = store.list_series_ids() {
        series_ids.extend(db_series);
    }
    indicator_ids.sort();
    indicator_ids.dedup();
    series_ids.sort();
    series_ids.dedup();
    (indicator_ids, series_ids)
}

/// Cached brief markdown for agent context; errors degrade to empty.
async fn cached_brief(state: &AppState, horizon: &str, as_of: Option<&str>, k: usize) -> String {
    if let Some(md) = state.brief_cache.get(&(horizon.to_string(), k)) {
        return md;
    }
    match generate_brief(state, horizon, as_of, k).await {
        Ok(brief) => brief.markdown,
        Err(e) => {
            warn!(error = %e, "brief generation for agent context failed");
            state.brief_cache.set((horizon.to_string(), k), String::new());
            String::new()
        }
    }
}

// =============================================================================
// Tool execution — pure reads only
// =============================================================================

/// Execute one tool call. Failures come back as `{"error": ...}` values that
/// are returned to the model, never raised.
pub fn execute_tool(state: &AppState, name: &str, args: &Value) -> Value {
    let horizon = args
        .get("horizon")
        .and_then(|v| v.as_str())
        .unwrap_or("1w")
        .to_string();

    let result = match name {
        "get_snapshot" => {
            let k = args.get("k").and_then(|v| v.as_u64()).unwrap_or(12) as usize;
            compute_snapshot(&state.store, &horizon, k, false, None, AsOfMode::Fetched, false)
                .and_then(|s| Ok(serde_json::to_value(s)?))
        }
        "get_router" => {
            let k = args.get("k").and_then(|v| v.as_u64()).unwrap_or(12) as usize;
            compute_router(&state.store, &horizon, k).and_then(|r| Ok(serde_json::to_value(r)?))
        }
        "get_indicator_history" => {
            let Some(indicator_id) = args.get("indicator_id").and_then(|v| v.as_str()) else {
                return json!({ "error": "indicator_id is required" });
            };
            let days = args.get("days").and_then(|v| v.as_i64()).unwrap_or(90);
            let cache_key = (indicator_id.to_string(), horizon.clone(), days);
            if let Some(cached) = state.indicator_history_cache.get(&cache_key) {
                return cached;
            }
            let res = state
                .store
                .indicator_history(indicator_id, &horizon, days, chrono::Utc::now())
                .map(|rows| {
                    let start = rows.len().saturating_sub(20);
                    let items: Vec<Value> = rows[start..]
                        .iter()
                        .map(|r| {
                            json!({
                                "as_of": r.as_of,
                                "value_numeric": r.value_numeric,
                                "z20": r.z20,
                                "status": r.status,
                            })
                        })
                        .collect();
                    json!(items)
                });
            if let Ok(val) = &res {
                state.indicator_history_cache.set(cache_key, val.clone());
            }
            res
        }
        "get_series_history" => {
            let Some(series_id) = args.get("series_id").and_then(|v| v.as_str()) else {
                return json!({ "error": "series_id is required" });
            };
            let limit = args
                .get("limit")
                .and_then(|v| v.as_i64())
                .unwrap_or(20)
                .clamp(6, 60) as usize;
            state
                .store
                .latest_points(resolve_series_id(series_id), limit)
                .map(|points| {
                    let items: Vec<Value> = points
                        .iter()
                        .map(|p| {
                            json!({
                                "observation_date": p.observation_date,
                                "value_numeric": p.value_numeric,
                                "units": p.units,
                                "scale": p.scale,
                            })
                        })
                        .collect();
                    json!(items)
                })
        }
        "get_indicator_doc" => {
            let Some(id) = args.get("id").and_then(|v| v.as_str()) else {
                return json!({ "error": "id is required" });
            };
            return json!(docs::get_indicator_doc(Path::new(docs::DOCS_PATH), id));
        }
        "get_series_doc" => {
            let Some(id) = args.get("id").and_then(|v| v.as_str()) else {
                return json!({ "error": "id is required" });
            };
            return docs::get_series_doc(Path::new(docs::DOCS_PATH), id);
        }
        other => return json!({ "error": format!("unknown tool {other}") }),
    };

    match result {
        Ok(value) => value,
        Err(e) => json!({ "error": e.to_string() }),
    }
}

// =============================================================================
// The streaming loop
// =============================================================================

/// Answer `question` as an event stream. The generator is abandoned when the
/// transport drops, which is the cancellation story.
pub fn ask_stream(
    state: Arc<AppState>,
    question: String,
    horizon: String,
    as_of: Option<String>,
) -> impl Stream<Item = AgentEvent> {
    async_stream::stream! {
        // Primary context: the cached brief (computed on miss).
        let brief_md = cached_brief(&state, &horizon, as_of.as_deref(), 6).await;
        let cached_snapshot = state.snapshot_cache.get(&horizon);

        let (indicator_ids, series_ids) = collect_known_ids(&state.store);
        let known_ids_context = format!(
            "KnownIDs:\nindicators={}\nseries={}",
            indicator_ids.iter().take(200).cloned().collect::<Vec<_>>().join(","),
            series_ids.iter().take(400).cloned().collect::<Vec<_>>().join(","),
        );
        let system = build_agent_system_prompt(&known_ids_context, &tool_catalog_description());

        let mut messages: Vec<(String, String)> =
            vec![("system".to_string(), system)];
        messages.push((
            "user".to_string(),
            format!("Question: {}", redact_pii(&question)),
        ));
        if !brief_md.is_empty() {
            messages.push((
                "assistant".to_string(),
                format!(
                    "BriefContext (you MUST align with this; if conflict, prefer this):\n{brief_md}"
                ),
            ));
        }

        let mut start_payload = json!({ "horizon": horizon });
        if let Some(cached) = &cached_snapshot {
            start_payload["as_of"] = cached.get("as_of").cloned().unwrap_or(Value::Null);
            start_payload["regime"] = cached
                .get("snapshot")
                .and_then(|s| s.get("regime"))
                .cloned()
                .unwrap_or(Value::Null);
        }
        yield AgentEvent::new("start", start_payload);

        let mut tool_trace: Vec<Value> = Vec::new();
        let mut answer_text: Option<String> = None;

        'steps: for _ in 0..MAX_STEPS {
            let step_prompt = build_agent_step_prompt();
            let tail_start = messages.len().saturating_sub(6);
            let transcript: Vec<Value> = messages[tail_start..]
                .iter()
                .map(|(role, content)| json!({ "role": role, "content": content }))
                .collect();
            let model_input = format!(
                "{}\n{}",
                serde_json::to_string(&transcript).unwrap_or_default(),
                step_prompt
            );

            let mut tokens = match state.provider.stream(&model_input).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "provider stream failed");
                    answer_text = Some("Streaming failed while consulting the model.".to_string());
                    yield AgentEvent::new("error", json!({ "message": answer_text }));
                    break 'steps;
                }
            };

            let mut buffer = String::new();
            let mut detected_final = false;
            let mut detected_tool = false;
            let mut tool_name = String::new();
            let mut tool_json_buf = String::new();
            let mut last_ping = Instant::now();
            let mut advance_step = false;

            while let Some(token) = tokens.next().await {
                let token = match token {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(error = %e, "provider stream errored mid-step");
                        answer_text =
                            Some("Streaming failed while consulting the model.".to_string());
                        yield AgentEvent::new("error", json!({ "message": answer_text }));
                        break 'steps;
                    }
                };

                if last_ping.elapsed() >= PING_INTERVAL {
                    yield AgentEvent::new("ping", json!({ "t": chrono::Utc::now().timestamp() }));
                    last_ping = Instant::now();
                }

                // Buffer first so marker detection can precede any echo.
                if detected_tool {
                    tool_json_buf.push_str(&token);
                } else {
                    buffer.push_str(&token);
                }

                if detected_final {
                    yield AgentEvent::new("answer_token", json!({ "text": token }));
                    answer_text.get_or_insert_with(String::new).push_str(&token);
                    continue;
                }

                if detected_tool {
                    // Accumulate until the JSON object parses.
                    let Ok(args) = serde_json::from_str::<Value>(tool_json_buf.trim()) else {
                        continue;
                    };

                    // Loop guard: an identical consecutive call is skipped
                    // with an internal nudge (never surfaced to the user).
                    let duplicate = tool_trace.last().is_some_and(|last| {
                        last.get("tool") == Some(&json!(tool_name.clone()))
                            && last.get("args") == Some(&args)
                    });
                    if duplicate {
                        messages.push((
                            "assistant".to_string(),
                            "You already have the requested data. Respond as FINAL with a concise answer now."
                                .to_string(),
                        ));
                        advance_step = true;
                        break;
                    }

                    yield AgentEvent::new(
                        "tool_call",
                        json!({ "name": tool_name, "args": args }),
                    );
                    let result = execute_tool(&state, &tool_name, &args);
                    let serialized = serde_json::to_string(&result).unwrap_or_default();
                    tool_trace.push(json!({
                        "tool": tool_name,
                        "args": args,
                        "result": result,
                    }));

                    let truncated: String =
                        serialized.chars().take(TOOL_RESULT_LIMIT).collect();
                    messages.push((
                        "assistant".to_string(),
                        redact_pii(&format!("ToolResult({tool_name}): {truncated}")),
                    ));
                    yield AgentEvent::new(
                        "tool_result",
                        json!({ "name": tool_name, "summary": redact_pii(&serialized) }),
                    );
                    messages.push((
                        "assistant".to_string(),
                        "You now have the requested data. Respond as FINAL with a concise answer now."
                            .to_string(),
                    ));
                    advance_step = true;
                    break;
                }

                if let Some(idx) = buffer.find(FINAL_MARKER) {
                    let remainder = buffer[idx + FINAL_MARKER.len()..].to_string();
                    yield AgentEvent::new("decision", json!({ "type": "final" }));
                    if !remainder.is_empty() {
                        yield AgentEvent::new("answer_token", json!({ "text": remainder }));
                        answer_text.get_or_insert_with(String::new).push_str(&remainder);
                    }
                    detected_final = true;
                    continue;
                }

                if buffer.contains(TOOL_MARKER) {
                    let after = buffer
                        .split_once(TOOL_MARKER)
                        .map(|(_, rest)| rest)
                        .unwrap_or_default();
                    if let Some((name, rest)) = after.split_once(' ') {
                        tool_name = name.trim().to_string();
                        tool_json_buf = rest.trim().to_string();
                        yield AgentEvent::new(
                            "decision",
                            json!({ "type": "tool", "name": tool_name }),
                        );
                        detected_tool = true;
                    }
                    continue;
                }

                yield AgentEvent::new("thinking_token", json!({ "text": token }));
            }

            if advance_step {
                continue 'steps;
            }
            if detected_final {
                break 'steps;
            }
            // Stream ended without an explicit decision: finalize from the
            // buffer.
            if answer_text.is_none() {
                let fallback = buffer.trim().to_string();
                if !fallback.is_empty() {
                    answer_text = Some(fallback);
                }
            }
            yield AgentEvent::new("decision", json!({ "type": "final" }));
            break 'steps;
        }

        let answer = answer_text
            .filter(|a| !a.trim().is_empty())
            .unwrap_or_else(|| "I don't know based on the available tools.".to_string());
        yield AgentEvent::new(
            "final",
            json!({ "answer": redact_pii(&answer), "tool_trace": tool_trace }),
        );
    }
}

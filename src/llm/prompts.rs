// =============================================================================
// Prompt templates — brief generator and streaming agent
// =============================================================================

use crate::aggregate::RegimeSummary;

use super::brief::IndicatorInfo;

/// Strict brief template: one bullet per indicator, in input order, no
/// invented numbers. The verifier enforces the same constraints after the
/// model responds.
pub fn build_brief_prompt(
    regime: &RegimeSummary,
    indicator_ids: &[String],
    infos: &[IndicatorInfo],
) -> String {
    let mut ctx_lines = String::new();
    for info in infos {
        ctx_lines.push_str(&format!(
            "- id={}; name={}; latest_value={}; z20={}; status={}; status_label={}; \
             obs_date={}; window={}; flip_trigger={}\n",
            info.id,
            info.name,
            info.latest_value,
            info.z20.map(|z| z.to_string()).unwrap_or_else(|| "null".to_string()),
            info.status,
            info.status_label,
            info.obs_date.as_deref().unwrap_or("null"),
            info.window.as_deref().unwrap_or("null"),
            info.flip_trigger,
        ));
    }

    let ids = indicator_ids.join(", ");
    let count = indicator_ids.len();
    format!(
        "Write a concise daily liquidity brief.\n\
         Constraints: concise; no financial advice; under 300 words.\n\
         CRITICAL FORMAT RULES:\n\
         - Output exactly three parts in this order: (1) one Regime line, (2) an 'Evidence:' \
         header followed by bullets (one per indicator), (3) a final 'Interpretation:' \
         paragraph (2-3 sentences).\n\
         - Regime line format: 'Regime: {{label}} → tilting {{tilt}} (score {{score}} / max {{max_score}})'.\n\
         - Evidence bullets: For EACH id in IndicatorIDs, render ONE bullet using ONLY the \
         provided fields, in this format:\n\
           - <name-or-id>: <latest_value>[/<window if present>] (z <z20 if present>) → \
         <status_label> | Flip: <flip_trigger>\n\
           Use the id if name is missing. If z20 is null, omit the (z ...) segment. If window \
         is present, append '/<window>' to the value. Do not invent units or ranges.\n\
         - You MUST output exactly {count} bullets under Evidence — one per id — in the SAME \
         ORDER as IndicatorIDs. Do NOT drop or add any.\n\
           If any field is missing, still include the bullet and omit only the missing subparts.\n\
         - Do NOT invent ids, values, or ranges. Use only provided fields.\n\
         RegimeValues: Label={label}; Tilt={tilt}; Score={score}; MaxScore={max_score}.\n\
         IndicatorIDs: [{ids}].\n\
         IndicatorsContext:\n{ctx_lines}\
         Return only these three parts in markdown.\n",
        count = count,
        label = regime.label.as_str(),
        tilt = regime.tilt.as_str(),
        score = regime.score,
        max_score = regime.max_score,
        ids = ids,
        ctx_lines = ctx_lines,
    )
}

/// System prompt for the streaming agent: known ids plus the tool catalog.
pub fn build_agent_system_prompt(known_ids_context: &str, tool_catalog: &str) -> String {
    format!(
        "You are a precise liquidity assistant. Use tools only when needed.\n{known_ids_context}\n{tool_catalog}"
    )
}

/// Per-step decision prompt for the streaming agent.
pub fn build_agent_step_prompt() -> String {
    "Decide next action. If you need data, respond as:\n\
     TOOL <name> <json_args>\n\
     Else, respond as:\n\
     FINAL <answer>\n\
     Constraints: keep under 300 words; no invented numbers; cite IDs exactly.\n\
     If the question is definitional (e.g., 'what is X', 'define X', 'meaning of X'), FIRST \
     fetch documentation:\n\
     - If X matches a series_id (case-insensitive) in KnownIDs and not an indicator_id, call \
     get_series_doc {\"id\":\"X\"}.\n\
     - Else if X matches an indicator_id (case-insensitive), call get_indicator_doc {\"id\":\"X\"}.\n\
     - If ambiguous (both), ask for clarification once instead of guessing.\n\
     If the documentation response is empty or missing content, respond with: \"I don't know \
     based on registry docs. Please provide the canonical ID (indicator or series).\"\n\
     Normalize tokens when matching KnownIDs: lowercase; strip punctuation; convert \
     spaces/hyphens to underscores.\n\
     HARD RULES:\n\
     - If you suspect a typo, map to the closest KnownIDs match ONCE, fetch docs, then FINAL.\n\
     When discussing an indicator, align direction with the BriefContext."
        .to_string()
}

/// Tool catalog injected into the system prompt.
pub fn tool_catalog_description() -> String {
    "Tools available:\n\
     - get_snapshot(horizon, k?): Returns current snapshot JSON.\n\
     - get_router(horizon, k?): Returns router picks JSON.\n\
     - get_indicator_history(indicator_id, horizon, days?): Returns recent indicator data.\n\
     - get_series_history(series_id, limit?): Returns recent series data.\n\
     - Documentation tools (use when user asks what a thing means):\n\
       - get_indicator_doc(id): Returns an indicator's documentation.\n\
         - Example: TOOL get_indicator_doc {\"id\":\"net_liq\"}\n\
       - get_series_doc(id): Returns a series' documentation.\n\
         - Example: TOOL get_series_doc {\"id\":\"TGA\"}\n\
     Rules: Do NOT call the same tool with identical args twice.\n\
     Rules: Tool arguments MUST be a single valid JSON object with double-quoted keys.\n\
     Example: TOOL get_indicator_history {\"indicator_id\":\"reserves_w\",\"horizon\":\"1w\",\"days\":90}\n\
     Decide which tool to call (or none).\n\
     Respond with either 'TOOL <name> <json_args>' or 'FINAL <answer_text>'."
        .to_string()
}

// Hearth Agent Engine — Memory Collaborator Access
//
// The fact/profile/skill store is an external collaborator, consumed
// exclusively through orchestrator tools. These wrappers add the arg
// shapes, response parsing, and fail-soft behavior the engine wants —
// a missing profile or an unreachable store degrades the prompt, it does
// not fail the turn.

use crate::atoms::error::EngineResult;
use crate::engine::orchestrator::ToolHost;
use crate::engine::trace::TraceContext;
use crate::engine::types::*;
use log::{info, warn};
use serde_json::{json, Value};

/// Store one fact for the agent. Best-effort; the caller decides whether a
/// failure matters.
pub async fn store_fact(
    host: &dyn ToolHost,
    agent_id: &str,
    content: &str,
    category: &str,
    trace: &TraceContext,
) -> EngineResult<()> {
    let args = json!({ "agent_id": agent_id, "content": content, "category": category });
    let outcome = host.call_tool("store_fact", &args, trace).await?;
    if !outcome.success {
        return Err(format!("store_fact rejected: {}", outcome.output).into());
    }
    Ok(())
}

/// Top-K facts relevant to `query`. Unreachable store → empty list.
pub async fn relevant_facts(
    host: &dyn ToolHost,
    agent_id: &str,
    query: &str,
    limit: usize,
    trace: &TraceContext,
) -> Vec<Fact> {
    let args = json!({ "agent_id": agent_id, "query": query, "limit": limit });
    match host.call_tool("search_memories", &args, trace).await {
        Ok(outcome) if outcome.success => parse_list::<Fact>(&outcome.output),
        Ok(outcome) => {
            warn!("[memory] search_memories failed: {}", outcome.output);
            Vec::new()
        }
        Err(e) => {
            warn!("[memory] search_memories unreachable: {}", e);
            Vec::new()
        }
    }
}

/// All stored facts (used for extraction dedup). Unreachable → empty.
pub async fn list_facts(host: &dyn ToolHost, agent_id: &str, trace: &TraceContext) -> Vec<Fact> {
    let args = json!({ "agent_id": agent_id });
    match host.call_tool("list_facts", &args, trace).await {
        Ok(outcome) if outcome.success => parse_list::<Fact>(&outcome.output),
        _ => Vec::new(),
    }
}

/// The agent's persona/profile text. Missing → None.
pub async fn get_profile(
    host: &dyn ToolHost,
    agent_id: &str,
    trace: &TraceContext,
) -> Option<String> {
    let args = json!({ "agent_id": agent_id });
    match host.call_tool("get_profile", &args, trace).await {
        Ok(outcome) if outcome.success && !outcome.output.is_empty() => {
            // Profile may arrive as bare text or as {"persona": "..."}.
            match serde_json::from_str::<Value>(&outcome.output) {
                Ok(v) => v["persona"].as_str().or_else(|| v.as_str()).map(str::to_string),
                Err(_) => Some(outcome.output),
            }
        }
        _ => None,
    }
}

/// List skills for this agent, optionally filtered by enabled state and
/// trigger kind. Transport failure propagates — the scheduler wants to know.
pub async fn list_skills(
    host: &dyn ToolHost,
    agent_id: &str,
    enabled: Option<bool>,
    trigger_kind: Option<TriggerKind>,
    trace: &TraceContext,
) -> EngineResult<Vec<SkillRecord>> {
    let mut args = json!({ "agent_id": agent_id });
    if let Some(enabled) = enabled {
        args["enabled"] = json!(enabled);
    }
    if let Some(kind) = trigger_kind {
        args["trigger_kind"] = serde_json::to_value(kind)?;
    }
    let outcome = host.call_tool("list_skills", &args, trace).await?;
    if !outcome.success {
        return Err(format!("list_skills failed: {}", outcome.output).into());
    }
    Ok(parse_list::<SkillRecord>(&outcome.output))
}

/// Create a skill record.
pub async fn store_skill(
    host: &dyn ToolHost,
    agent_id: &str,
    skill: &SkillRecord,
    trace: &TraceContext,
) -> EngineResult<()> {
    let mut args = serde_json::to_value(skill)?;
    args["agent_id"] = json!(agent_id);
    let outcome = host.call_tool("store_skill", &args, trace).await?;
    if !outcome.success {
        return Err(format!("store_skill '{}' rejected: {}", skill.name, outcome.output).into());
    }
    info!("[memory] Stored skill '{}'", skill.name);
    Ok(())
}

/// Update a skill record in place (matched by name).
pub async fn update_skill(
    host: &dyn ToolHost,
    agent_id: &str,
    skill: &SkillRecord,
    trace: &TraceContext,
) -> EngineResult<()> {
    let mut args = serde_json::to_value(skill)?;
    args["agent_id"] = json!(agent_id);
    let outcome = host.call_tool("update_skill", &args, trace).await?;
    if !outcome.success {
        return Err(format!("update_skill '{}' rejected: {}", skill.name, outcome.output).into());
    }
    Ok(())
}

/// Persist a finished exchange for later backfill extraction. Best-effort.
pub async fn store_conversation(
    host: &dyn ToolHost,
    agent_id: &str,
    conversation_id: &str,
    user: &str,
    assistant: &str,
    trace: &TraceContext,
) {
    let args = json!({
        "agent_id": agent_id,
        "conversation_id": conversation_id,
        "user": user,
        "assistant": assistant,
    });
    if let Err(e) = host.call_tool("store_conversation", &args, trace).await {
        warn!("[memory] store_conversation failed: {}", e);
    }
}

/// Parse a tool payload that is either a bare JSON array or wrapped in a
/// well-known list field.
fn parse_list<T: serde::de::DeserializeOwned>(payload: &str) -> Vec<T> {
    let v: Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };
    let arr = if v.is_array() {
        v
    } else {
        ["items", "facts", "skills", "results"]
            .iter()
            .find_map(|k| v.get(*k).filter(|x| x.is_array()).cloned())
            .unwrap_or(Value::Null)
    };
    match serde_json::from_value::<Vec<T>>(arr) {
        Ok(items) => items,
        Err(e) => {
            warn!("[memory] Unparsable list payload: {}", e);
            Vec::new()
        }
    }
}

// Hearth Agent Engine — Idle Fact Extraction
//
// After a conversation goes quiet, pull new durable facts out of the recent
// exchanges without blocking any turn. An idle timer is (re)armed on every
// turn; it only fires if its epoch is still current — a newer turn
// supersedes the pending timer by bumping the epoch.

use crate::atoms::error::EngineResult;
use crate::engine::agent_loop::ConversationEngine;
use crate::engine::memory;
use crate::engine::provider::ChatCall;
use crate::engine::trace::TraceContext;
use crate::engine::types::*;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

/// Arm (or re-arm) the idle extraction timer for a conversation.
pub fn schedule_idle_extraction(engine: Arc<ConversationEngine>, conversation_id: String) {
    let epoch = engine.state.bump_extraction_epoch(&conversation_id);
    let idle = engine.state.config.idle_extraction;

    tokio::spawn(async move {
        tokio::time::sleep(idle).await;
        if !engine.state.extraction_epoch_current(&conversation_id, epoch) {
            return; // superseded by a newer turn
        }
        if engine.state.is_halted() {
            return;
        }
        let trace = TraceContext::new();
        match extract_session_facts(&engine, &conversation_id, &trace).await {
            Ok(stored) if stored > 0 => {
                info!("[extraction] {}: stored {} fact(s)", conversation_id, stored)
            }
            Ok(_) => {}
            Err(e) => warn!("[extraction] {} failed: {}", conversation_id, e),
        }
    });
}

/// Run one extraction pass over the session's recent exchanges.
/// A second idle fire with no new activity is a no-op.
pub async fn extract_session_facts(
    engine: &ConversationEngine,
    conversation_id: &str,
    trace: &TraceContext,
) -> EngineResult<usize> {
    let config = &engine.state.config;
    let session = engine.state.sessions.load(conversation_id);

    // Already extracted since the last activity → nothing new to mine.
    if let (Some(extracted), Some(active)) = (session.last_extraction, session.last_activity) {
        if extracted >= active {
            return Ok(0);
        }
    }

    let transcript = flatten_exchanges(&session.messages, config.extraction_max_turns);
    if transcript.is_empty() {
        return Ok(0);
    }

    let known = memory::list_facts(engine.host.as_ref(), &config.agent_id, trace).await;
    let known_listing = known
        .iter()
        .take(50)
        .map(|f| format!("- {}", truncate_utf8(&f.content, 150)))
        .collect::<Vec<_>>()
        .join("\n");

    let system = format!(
        "You extract durable facts about the user from conversations: preferences, \
         people, projects, recurring obligations. Skip anything transient or already \
         known.\n\nAlready known:\n{}\n\n\
         Reply with a JSON array only: \
         [{{\"content\": \"...\", \"category\": \"preference|context|instruction\", \
         \"confidence\": 0.0-1.0}}]. Reply [] when there is nothing new.",
        if known_listing.is_empty() { "(nothing yet)" } else { &known_listing }
    );

    let outcome = engine
        .backend
        .chat(ChatCall {
            model: config.summary_model.clone(),
            messages: vec![Message::system(system), Message::user(transcript)],
            tools: vec![],
            tool_choice: ToolChoice::None,
            temperature: 0.2,
            deadline: Duration::from_secs(45),
        })
        .await?;
    engine
        .state
        .cost
        .record_usage(outcome.usage.prompt_tokens, outcome.usage.completion_tokens);

    let candidates = parse_fact_array(&outcome.text);
    let mut stored = 0usize;
    for fact in candidates {
        if fact.confidence < config.confidence_threshold || fact.content.trim().is_empty() {
            continue;
        }
        let category = if fact.category.is_empty() { "context".to_string() } else { fact.category };
        match memory::store_fact(
            engine.host.as_ref(),
            &config.agent_id,
            fact.content.trim(),
            &category,
            trace,
        )
        .await
        {
            Ok(()) => stored += 1,
            Err(e) => warn!("[extraction] store_fact failed: {}", e),
        }
    }

    engine.state.sessions.mark_extracted(conversation_id);
    Ok(stored)
}

/// Flatten the last `max_turns` exchanges into properly paired plain text.
/// Tool and system messages are skipped; an exchange is one user turn and
/// the assistant text that answered it.
pub fn flatten_exchanges(messages: &[Message], max_turns: usize) -> String {
    let mut pairs: Vec<(String, String)> = Vec::new();
    let mut current_user: Option<String> = None;

    for msg in messages {
        match msg.role {
            Role::User => current_user = Some(msg.content.clone()),
            Role::Assistant if !msg.content.trim().is_empty() => {
                if let Some(user) = current_user.take() {
                    pairs.push((user, msg.content.clone()));
                }
            }
            _ => {}
        }
    }

    let from = pairs.len().saturating_sub(max_turns);
    pairs[from..]
        .iter()
        .map(|(u, a)| {
            format!("User: {}\nAssistant: {}", truncate_utf8(u, 800), truncate_utf8(a, 800))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Lenient parse of the extractor's JSON array (models love to wrap it in
/// prose or code fences).
pub fn parse_fact_array(text: &str) -> Vec<ExtractedFact> {
    let start = match text.find('[') {
        Some(i) => i,
        None => return Vec::new(),
    };
    let end = match text.rfind(']') {
        Some(i) if i > start => i,
        _ => return Vec::new(),
    };
    serde_json::from_str::<Vec<ExtractedFact>>(&text[start..=end]).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_pairs_and_skips_tools() {
        let messages = vec![
            Message::user("q1"),
            Message::assistant_calls("", vec![]),
            Message::tool_result("c1", "web_search", "noise"),
            Message::assistant("a1"),
            Message::user("q2"),
            Message::assistant("a2"),
        ];
        let flat = flatten_exchanges(&messages, 10);
        assert!(flat.contains("User: q1"));
        assert!(flat.contains("Assistant: a1"));
        assert!(flat.contains("User: q2"));
        assert!(!flat.contains("noise"));
    }

    #[test]
    fn test_flatten_respects_max_turns() {
        let mut messages = Vec::new();
        for i in 0..15 {
            messages.push(Message::user(format!("q{i}")));
            messages.push(Message::assistant(format!("a{i}")));
        }
        let flat = flatten_exchanges(&messages, 10);
        assert!(!flat.contains("User: q4\n"));
        assert!(flat.contains("User: q5"));
        assert!(flat.contains("User: q14"));
    }

    #[test]
    fn test_parse_fact_array_lenient() {
        let text = "Sure! Here you go:\n```json\n[{\"content\":\"likes tea\",\
                    \"category\":\"preference\",\"confidence\":0.9}]\n```";
        let facts = parse_fact_array(text);
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].content, "likes tea");
        assert!(parse_fact_array("no json here").is_empty());
        assert!(parse_fact_array("[]").is_empty());
    }
}

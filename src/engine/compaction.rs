// Hearth Agent Engine — Session Compaction
// Summarizes the older portion of a long session with the cheap model, then
// replaces those messages with a single summary sentinel. The last few
// exchanges stay verbatim, and a split always lands on a user message so a
// tool-call/tool-result pair can never straddle the boundary.

use crate::atoms::error::EngineResult;
use crate::engine::provider::{ChatBackend, ChatCall};
use crate::engine::sessions::SessionStore;
use crate::engine::types::*;
use log::{info, warn};
use std::time::Duration;

/// Statistics returned after a compaction operation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CompactionResult {
    pub conversation_id: String,
    pub messages_before: usize,
    pub messages_after: usize,
    pub chars_before: usize,
    pub chars_after: usize,
    pub summary_length: usize,
}

/// Configuration for compaction behaviour.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Total text length that triggers auto-compaction.
    pub threshold_chars: usize,
    /// How many recent exchanges (user→assistant spans) to keep verbatim.
    pub keep_exchanges: usize,
    /// Model used for the summary call.
    pub model: String,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self { threshold_chars: 20_000, keep_exchanges: 3, model: String::new() }
    }
}

/// Index where the kept tail begins: the `keep_exchanges`-th user message
/// from the end. Always a user-message index (or 0), so pairs never split.
pub fn split_point(messages: &[Message], keep_exchanges: usize) -> usize {
    let mut seen = 0usize;
    for (idx, msg) in messages.iter().enumerate().rev() {
        if msg.role == Role::User {
            seen += 1;
            if seen >= keep_exchanges {
                return idx;
            }
        }
    }
    0
}

/// Flatten the to-be-summarized prefix into a transcript. Tool results are
/// previewed, not inlined wholesale.
fn build_transcript(messages: &[Message]) -> String {
    let mut transcript = String::new();
    for msg in messages {
        match msg.role {
            Role::Tool => {
                let name = msg.name.as_deref().unwrap_or("unknown");
                transcript.push_str(&format!(
                    "[Tool: {} → {}]\n",
                    name,
                    truncate_utf8(&msg.content, 200)
                ));
            }
            Role::Assistant if msg.has_tool_calls() => {
                let names: Vec<&str> = msg
                    .tool_calls
                    .as_ref()
                    .map(|c| c.iter().map(|tc| tc.function.name.as_str()).collect())
                    .unwrap_or_default();
                transcript.push_str(&format!("Assistant: [called {}]\n", names.join(", ")));
            }
            role => {
                let label = match role {
                    Role::User => "User",
                    Role::Assistant => "Assistant",
                    Role::System => "System",
                    Role::Tool => unreachable!(),
                };
                transcript.push_str(&format!("{}: {}\n", label, truncate_utf8(&msg.content, 500)));
            }
        }
    }
    transcript
}

const SUMMARIZER_PROMPT: &str =
    "You are a conversation summarizer. Produce a dense summary that captures:\n\
     1. Key decisions and conclusions\n\
     2. Important context and preferences the user expressed\n\
     3. Any action items or ongoing tasks\n\
     4. Details needed to continue the conversation\n\n\
     Keep the summary under 800 words. Use bullet points for clarity.";

/// Perform compaction on a session. Returns the stats and the summary
/// call's token usage (the caller feeds it to the cost monitor).
pub async fn compact_session(
    store: &SessionStore,
    backend: &dyn ChatBackend,
    conversation_id: &str,
    config: &CompactionConfig,
) -> EngineResult<(CompactionResult, TokenUsage)> {
    let session = store.load(conversation_id);
    let total = session.messages.len();
    let chars_before = session.total_text_len();

    let split = split_point(&session.messages, config.keep_exchanges);
    if split == 0 {
        return Err("Nothing to compact before the kept exchanges.".into());
    }
    let old = &session.messages[..split];
    let retained = session.messages[split..].to_vec();

    info!(
        "[compaction] {}: summarizing {} message(s), keeping {}",
        conversation_id,
        old.len(),
        retained.len()
    );

    let call = ChatCall {
        model: config.model.clone(),
        messages: vec![
            Message::system(SUMMARIZER_PROMPT),
            Message::user(format!("Summarize this conversation:\n\n{}", build_transcript(old))),
        ],
        tools: vec![],
        tool_choice: ToolChoice::None,
        temperature: 0.3,
        deadline: Duration::from_secs(60),
    };
    let outcome = backend.chat(call).await?;
    if outcome.text.trim().is_empty() {
        return Err("Summarizer produced an empty summary.".into());
    }
    let summary = outcome.text.trim().to_string();

    store.apply_compaction(conversation_id, &summary, retained, old.len())?;

    let after = store.load(conversation_id);
    let result = CompactionResult {
        conversation_id: conversation_id.to_string(),
        messages_before: total,
        messages_after: after.messages.len(),
        chars_before,
        chars_after: after.total_text_len(),
        summary_length: summary.len(),
    };
    info!(
        "[compaction] Done: {} → {} messages, {} → {} chars",
        result.messages_before, result.messages_after, result.chars_before, result.chars_after
    );
    Ok((result, outcome.usage))
}

/// Auto-compact check, called before building a new turn's prompt.
/// A session below the threshold is left untouched, which also makes
/// re-compacting an already-compacted short session a no-op.
pub async fn auto_compact_if_needed(
    store: &SessionStore,
    backend: &dyn ChatBackend,
    conversation_id: &str,
    config: &CompactionConfig,
) -> (Option<CompactionResult>, TokenUsage) {
    if !store.should_compact(conversation_id, config.threshold_chars) {
        return (None, TokenUsage::default());
    }
    match compact_session(store, backend, conversation_id, config).await {
        Ok((result, usage)) => (Some(result), usage),
        Err(e) => {
            warn!("[compaction] Auto-compact failed for {}: {}", conversation_id, e);
            (None, TokenUsage::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(user: &str, assistant: &str) -> Vec<Message> {
        vec![Message::user(user), Message::assistant(assistant)]
    }

    #[test]
    fn test_split_point_lands_on_user_message() {
        let mut messages = Vec::new();
        for i in 0..5 {
            messages.extend(flat(&format!("q{i}"), &format!("a{i}")));
        }
        let split = split_point(&messages, 3);
        assert_eq!(split, 4); // q2 starts the kept tail
        assert_eq!(messages[split].role, Role::User);
    }

    #[test]
    fn test_split_point_keeps_everything_when_short() {
        let messages = flat("q", "a");
        assert_eq!(split_point(&messages, 3), 0);
    }

    #[test]
    fn test_split_never_straddles_tool_pair() {
        // Exchange with a tool pair in the middle, then two flat exchanges.
        let call = ToolCall {
            id: "c1".into(),
            call_type: "function".into(),
            function: FunctionCall { name: "web_search".into(), arguments: "{}".into() },
        };
        let mut messages = vec![
            Message::user("find it"),
            Message::assistant_calls("", vec![call]),
            Message::tool_result("c1", "web_search", "found"),
            Message::assistant("here"),
        ];
        messages.extend(flat("q1", "a1"));
        messages.extend(flat("q2", "a2"));

        let split = split_point(&messages, 2);
        assert_eq!(messages[split].role, Role::User);
        // The pair sits entirely on one side of the split.
        let prefix = &messages[..split];
        let has_call = prefix.iter().any(|m| m.has_tool_calls());
        let has_result = prefix.iter().any(|m| m.role == Role::Tool);
        assert_eq!(has_call, has_result);
    }

    #[test]
    fn test_transcript_previews_tools() {
        let messages = vec![
            Message::user("do it"),
            Message::tool_result("c1", "web_search", "x".repeat(1_000)),
        ];
        let transcript = build_transcript(&messages);
        assert!(transcript.contains("[Tool: web_search"));
        assert!(transcript.len() < 400);
    }
}

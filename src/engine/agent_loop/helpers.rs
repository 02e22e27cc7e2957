// agent_loop/helpers.rs — Resilience helpers for the reasoning loop.
//
// Keeps the main turn loop focused on orchestration by pulling out the
// self-contained detectors and repairs: textual tool-call leak parsing,
// hallucinated-action and refusal detection, empty-response nudging,
// tool-pair sanitation, and salvage of captured steps.
//
// Every detector here is deterministic and closed: the leak parser only
// accepts names from the active tool set, and the claim/refusal matchers
// are fixed pattern lists — no general evaluation of model text.

use crate::atoms::constants::SALVAGE_RESULT_MAX_BYTES;
use crate::engine::types::*;
use log::warn;
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

// ── Tool-call leak parser ──────────────────────────────────────────────

/// A tool call the model emitted as prose instead of a structured call.
#[derive(Debug, Clone, PartialEq)]
pub struct LeakedCall {
    pub name: String,
    pub arguments: String,
    /// Text preceding the call — often a usable preamble answer.
    pub preamble: String,
}

/// Detect the well-known leak shape `tool_name({...})` in model text.
/// Only names present in `tool_names` are accepted; the argument list must
/// be a balanced, JSON-parsable object (or empty). First match wins.
pub fn parse_leaked_call(text: &str, tool_names: &HashSet<String>) -> Option<LeakedCall> {
    static CALL_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = CALL_RE
        .get_or_init(|| Regex::new(r"\b([a-z][a-z0-9_]{2,})\s*\(").ok())
        .as_ref()?;

    for cap in re.captures_iter(text) {
        let name = &cap[1];
        if !tool_names.contains(name) {
            continue;
        }
        let open = cap.get(0)?.end() - 1; // index of '('
        let Some(args_raw) = balanced_parens(&text[open..]) else { continue };
        let args_trimmed = args_raw.trim();
        let arguments = if args_trimmed.is_empty() {
            "{}".to_string()
        } else if serde_json::from_str::<serde_json::Value>(args_trimmed)
            .map(|v| v.is_object())
            .unwrap_or(false)
        {
            args_trimmed.to_string()
        } else {
            continue;
        };
        let preamble = text[..cap.get(0)?.start()].trim().to_string();
        return Some(LeakedCall { name: name.to_string(), arguments, preamble });
    }
    None
}

/// Return the content between the parentheses starting at `text[0] == '('`,
/// honoring nesting and double-quoted strings. None when unbalanced.
fn balanced_parens(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    if bytes.first() != Some(&b'(') {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[1..i]);
                }
            }
            _ => {}
        }
    }
    None
}

// ── Hallucinated-action detection ──────────────────────────────────────

/// Closed list of action-claim patterns: the model says it did something,
/// yet no tool ran.
const ACTION_CLAIM_PATTERNS: &[&str] = &[
    r"(?i)\bI'?ve (sent|created|scheduled|added|updated|deleted|stored|set up)\b",
    r"(?i)\bI have (sent|created|scheduled|added|updated|deleted|stored|set up)\b",
    r"(?i)\bhas been (sent|created|scheduled|added|updated|deleted|stored)\b",
    r"(?i)\bsuccessfully (sent|created|scheduled|added|updated|deleted|stored)\b",
    r"(?i)\bEvent details:",
    r"(?i)\b(email|message|reminder|invite) (sent|created|scheduled)\b",
    r"(?i)\bis now (set|scheduled|stored|saved)\b",
];

fn compiled(patterns: &'static [&'static str], cell: &'static OnceLock<Vec<Regex>>) -> &'static [Regex] {
    cell.get_or_init(|| patterns.iter().filter_map(|p| Regex::new(p).ok()).collect())
}

/// True when the text claims an action was taken.
pub fn claims_action(text: &str) -> bool {
    static CELL: OnceLock<Vec<Regex>> = OnceLock::new();
    compiled(ACTION_CLAIM_PATTERNS, &CELL).iter().any(|re| re.is_match(text))
}

// ── Refusal detection ──────────────────────────────────────────────────

const REFUSAL_PATTERNS: &[&str] = &[
    r"(?i)\bI (can'?t|cannot|am unable to|'m unable to)\b",
    r"(?i)\bI (don'?t|do not) have (access|the ability|the tools)\b",
    r"(?i)\bas an AI\b",
    r"(?i)\bI'?m (not able|sorry, but I can'?t)\b",
];

/// True when the text reads as a capability refusal.
pub fn is_refusal(text: &str) -> bool {
    static CELL: OnceLock<Vec<Regex>> = OnceLock::new();
    compiled(REFUSAL_PATTERNS, &CELL).iter().any(|re| re.is_match(text))
}

// ── Empty-response nudge ───────────────────────────────────────────────

/// System nudge recapping the user's request, injected when the model
/// returns neither text nor tool calls.
pub fn empty_response_nudge(messages: &[Message]) -> Message {
    let user_recap = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| truncate_utf8(&m.content, 300).to_string())
        .unwrap_or_default();

    let nudge = if user_recap.is_empty() {
        "[SYSTEM] The previous response was empty. Retry the user's request. Use tools if needed."
            .to_string()
    } else {
        format!(
            "[SYSTEM] The previous response was empty. The user's request is: \"{}\"\n\
             Respond to this request directly. Use tools if needed.",
            user_recap
        )
    };
    Message::system(nudge)
}

// ── Captured-step salvage ──────────────────────────────────────────────

/// Pull a usable answer out of captured steps: the last non-empty step
/// text, if any.
pub fn salvage_step_text(steps: &[CapturedStep]) -> Option<String> {
    steps.iter().rev().find(|s| !s.text.trim().is_empty()).map(|s| s.text.trim().to_string())
}

/// Collect tool results across steps, each truncated for summarization.
pub fn salvage_tool_results(steps: &[CapturedStep]) -> Vec<(String, String)> {
    steps
        .iter()
        .flat_map(|s| s.tool_results.iter())
        .map(|r| (r.name.clone(), truncate_utf8(&r.output, SALVAGE_RESULT_MAX_BYTES).to_string()))
        .collect()
}

/// Last-resort answer: the raw truncated tool results, labeled.
pub fn raw_results_fallback(results: &[(String, String)]) -> String {
    results
        .iter()
        .map(|(name, output)| format!("{name}: {output}"))
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Tool-pair sanitation ───────────────────────────────────────────────

/// Ensure every assistant message with tool_calls has matching tool-result
/// messages, and every tool result has a matching preceding call.
///
/// Three passes:
///   1. Strip leading orphan tool results (no parent assistant message).
///   2. For each assistant+tool_calls, inject synthetic results for missing
///      call ids.
///   3. Remove remaining tool results whose id matches no preceding call.
///
/// Called on the history window before every model request and after
/// compaction, so the pairing invariant holds on every wire message list.
pub fn sanitize_tool_pairs(messages: &mut Vec<Message>) {
    // ── Pass 1: strip leading orphan tool results ──────────────────
    let first_non_system =
        messages.iter().position(|m| m.role != Role::System).unwrap_or(messages.len());
    let mut strip_end = first_non_system;
    while strip_end < messages.len() && messages[strip_end].role == Role::Tool {
        strip_end += 1;
    }
    if strip_end > first_non_system {
        warn!(
            "[engine] Removing {} orphaned leading tool result(s)",
            strip_end - first_non_system
        );
        messages.drain(first_non_system..strip_end);
    }

    // ── Pass 2: synthesize results for unanswered calls ────────────
    let mut i = 0;
    while i < messages.len() {
        if !(messages[i].role == Role::Assistant && messages[i].has_tool_calls()) {
            i += 1;
            continue;
        }

        let expected: Vec<(String, String)> = messages[i]
            .tool_calls
            .as_ref()
            .map(|calls| {
                calls.iter().map(|tc| (tc.id.clone(), tc.function.name.clone())).collect()
            })
            .unwrap_or_default();

        let mut found: HashSet<String> = HashSet::new();
        let mut j = i + 1;
        while j < messages.len() {
            match messages[j].role {
                Role::Tool => {
                    if let Some(id) = &messages[j].tool_call_id {
                        found.insert(id.clone());
                    }
                    j += 1;
                }
                // Injected system messages may sit between call and result.
                Role::System => j += 1,
                _ => break,
            }
        }

        let mut injected = 0;
        for (id, name) in &expected {
            if !found.contains(id) {
                let synthetic = Message::tool_result(
                    id.clone(),
                    name.clone(),
                    "[Tool execution was interrupted or the result was lost.]",
                );
                messages.insert(i + 1 + injected, synthetic);
                injected += 1;
            }
        }
        if injected > 0 {
            warn!("[engine] Injected {} synthetic tool result(s)", injected);
        }

        i += 1;
        while i < messages.len()
            && (messages[i].role == Role::Tool || messages[i].role == Role::System)
        {
            i += 1;
        }
    }

    // ── Pass 3: drop results with no matching call ─────────────────
    let mut known: HashSet<String> = HashSet::new();
    let mut drop_idx: Vec<usize> = Vec::new();
    for (idx, msg) in messages.iter().enumerate() {
        match msg.role {
            Role::Assistant => {
                if let Some(calls) = &msg.tool_calls {
                    for tc in calls {
                        known.insert(tc.id.clone());
                    }
                }
            }
            Role::Tool => {
                let orphan =
                    msg.tool_call_id.as_ref().map(|id| !known.contains(id)).unwrap_or(true);
                if orphan {
                    drop_idx.push(idx);
                }
            }
            _ => {}
        }
    }
    if !drop_idx.is_empty() {
        warn!("[engine] Removing {} orphaned tool result(s)", drop_idx.len());
        for &idx in drop_idx.iter().rev() {
            messages.remove(idx);
        }
    }
}

/// Trim a history window so it never opens with an assistant or tool
/// message (providers reject conversations that start mid-exchange).
pub fn align_window_start(messages: &mut Vec<Message>) {
    while let Some(first) = messages.first() {
        if first.role == Role::User || first.role == Role::System {
            break;
        }
        messages.remove(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> HashSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_leak_parser_extracts_call() {
        let text = r#"Let me check that. search_web({"query":"weather Berlin"})"#;
        let leak = parse_leaked_call(text, &names(&["search_web"])).unwrap();
        assert_eq!(leak.name, "search_web");
        assert_eq!(leak.arguments, r#"{"query":"weather Berlin"}"#);
        assert_eq!(leak.preamble, "Let me check that.");
    }

    #[test]
    fn test_leak_parser_ignores_unknown_names() {
        let text = r#"not_a_tool({"x":1})"#;
        assert!(parse_leaked_call(text, &names(&["search_web"])).is_none());
    }

    #[test]
    fn test_leak_parser_requires_json_object() {
        let set = names(&["search_web"]);
        assert!(parse_leaked_call("search_web(hello there)", &set).is_none());
        // Empty argument list is allowed.
        let leak = parse_leaked_call("search_web()", &set).unwrap();
        assert_eq!(leak.arguments, "{}");
    }

    #[test]
    fn test_leak_parser_handles_nested_and_strings() {
        let set = names(&["send_email"]);
        let text = r#"send_email({"to":"a@b.c","body":"see (attached) \" ok"})"#;
        let leak = parse_leaked_call(text, &set).unwrap();
        assert!(leak.arguments.contains("attached"));
    }

    #[test]
    fn test_claims_action_patterns() {
        assert!(claims_action("I've sent the email."));
        assert!(claims_action("The meeting has been created for 3pm."));
        assert!(claims_action("Event details: Standup at 9"));
        assert!(claims_action("Reminder set for tomorrow. Email sent."));
        assert!(!claims_action("Would you like me to send the email?"));
        assert!(!claims_action("Here's what I found about Berlin."));
    }

    #[test]
    fn test_refusal_patterns() {
        assert!(is_refusal("I can't send emails."));
        assert!(is_refusal("I don't have access to your calendar."));
        assert!(is_refusal("As an AI, I am unable to do that."));
        assert!(!is_refusal("Sure, sending it now."));
    }

    #[test]
    fn test_sanitize_injects_missing_result() {
        let call = ToolCall {
            id: "c1".into(),
            call_type: "function".into(),
            function: FunctionCall { name: "web_search".into(), arguments: "{}".into() },
        };
        let mut messages = vec![
            Message::user("go"),
            Message::assistant_calls("", vec![call]),
            Message::assistant("done"),
        ];
        sanitize_tool_pairs(&mut messages);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[2].role, Role::Tool);
        assert_eq!(messages[2].tool_call_id.as_deref(), Some("c1"));
    }

    #[test]
    fn test_sanitize_drops_orphan_results() {
        let mut messages = vec![
            Message::user("go"),
            Message::tool_result("ghost", "web_search", "stale"),
            Message::assistant("hello"),
        ];
        sanitize_tool_pairs(&mut messages);
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.role != Role::Tool));
    }

    #[test]
    fn test_align_window_start() {
        let mut messages = vec![
            Message::assistant("mid-exchange"),
            Message::tool_result("x", "t", "r"),
            Message::user("hello"),
            Message::assistant("hi"),
        ];
        align_window_start(&mut messages);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn test_salvage_prefers_step_text() {
        let steps = vec![
            CapturedStep {
                text: "".into(),
                tool_calls: vec![],
                tool_results: vec![ToolResult {
                    tool_call_id: "1".into(),
                    name: "web_search".into(),
                    output: "x".repeat(5_000),
                    success: true,
                }],
            },
            CapturedStep { text: "Found it: 21°C".into(), ..Default::default() },
        ];
        assert_eq!(salvage_step_text(&steps).as_deref(), Some("Found it: 21°C"));
        let results = salvage_tool_results(&steps);
        assert_eq!(results.len(), 1);
        assert!(results[0].1.len() <= SALVAGE_RESULT_MAX_BYTES);
    }
}

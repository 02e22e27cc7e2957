// Integration tests — the engine against scripted collaborators.
//
// The model and the orchestrator are replaced with in-memory fakes: the
// backend pops prepared outcomes, the tool host records every call and
// answers from an override table. The embedding service points at a
// non-routable address, so selection exercises the keyword fallback path
// exactly as it would with the service down.

use async_trait::async_trait;
use hearth_agent::atoms::error::{EngineError, EngineResult};
use hearth_agent::engine::agent_loop::ConversationEngine;
use hearth_agent::engine::compaction::{self, CompactionConfig};
use hearth_agent::engine::config::EngineConfig;
use hearth_agent::engine::embedding::EmbeddingClient;
use hearth_agent::engine::orchestrator::ToolHost;
use hearth_agent::engine::provider::{ChatBackend, ChatCall};
use hearth_agent::engine::sessions::{SessionStore, TurnWrite};
use hearth_agent::engine::state::EngineState;
use hearth_agent::engine::trace::TraceContext;
use hearth_agent::engine::types::*;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

// ── Fakes ──────────────────────────────────────────────────────────────

struct ScriptedBackend {
    script: Mutex<VecDeque<EngineResult<ChatOutcome>>>,
    calls: Mutex<Vec<ChatCall>>,
}

impl ScriptedBackend {
    fn new(outcomes: Vec<EngineResult<ChatOutcome>>) -> Arc<Self> {
        Arc::new(ScriptedBackend {
            script: Mutex::new(outcomes.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn text(text: &str) -> EngineResult<ChatOutcome> {
        Ok(ChatOutcome {
            text: text.to_string(),
            tool_calls: vec![],
            usage: TokenUsage { prompt_tokens: 10, completion_tokens: 5 },
            model: None,
        })
    }

    fn text_with_usage(text: &str, prompt: u64, completion: u64) -> EngineResult<ChatOutcome> {
        Ok(ChatOutcome {
            text: text.to_string(),
            tool_calls: vec![],
            usage: TokenUsage { prompt_tokens: prompt, completion_tokens: completion },
            model: None,
        })
    }

    fn calls_tool(name: &str, args: &str) -> EngineResult<ChatOutcome> {
        Ok(ChatOutcome {
            text: String::new(),
            tool_calls: vec![ToolCall {
                id: format!("call_{name}"),
                call_type: "function".into(),
                function: FunctionCall { name: name.into(), arguments: args.into() },
            }],
            usage: TokenUsage { prompt_tokens: 10, completion_tokens: 5 },
            model: None,
        })
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn chat(&self, call: ChatCall) -> EngineResult<ChatOutcome> {
        self.calls.lock().push(call);
        match self.script.lock().pop_front() {
            Some(outcome) => outcome,
            None => Self::text("(out of script)"),
        }
    }
}

struct FakeHost {
    tools: Vec<ToolDescriptor>,
    overrides: HashMap<String, ToolOutcome>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl FakeHost {
    fn new(tool_names: &[&str]) -> Arc<Self> {
        Arc::new(FakeHost {
            tools: tool_names
                .iter()
                .map(|n| ToolDescriptor {
                    name: n.to_string(),
                    description: format!("{n} tool"),
                    parameters: json!({"type": "object", "properties": {}}),
                })
                .collect(),
            overrides: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn with_override(tool_names: &[&str], name: &str, outcome: ToolOutcome) -> Arc<Self> {
        let mut host = FakeHost::new(tool_names);
        Arc::get_mut(&mut host).unwrap().overrides.insert(name.to_string(), outcome);
        host
    }

    fn called(&self, name: &str) -> bool {
        self.calls.lock().iter().any(|(n, _)| n == name)
    }

    fn calls_to(&self, name: &str) -> Vec<Value> {
        self.calls.lock().iter().filter(|(n, _)| n == name).map(|(_, a)| a.clone()).collect()
    }
}

#[async_trait]
impl ToolHost for FakeHost {
    async fn list_tools(&self) -> EngineResult<Vec<ToolDescriptor>> {
        Ok(self.tools.clone())
    }

    async fn call_tool(
        &self,
        name: &str,
        args: &Value,
        _trace: &TraceContext,
    ) -> EngineResult<ToolOutcome> {
        self.calls.lock().push((name.to_string(), args.clone()));
        Ok(self
            .overrides
            .get(name)
            .cloned()
            .unwrap_or(ToolOutcome { success: true, output: "[]".into() }))
    }
}

// ── Wiring ─────────────────────────────────────────────────────────────

fn test_config(hard_cap: u64) -> EngineConfig {
    let dir = std::env::temp_dir().join(format!("hearth-it-{}", uuid::Uuid::new_v4()));
    EngineConfig {
        data_dir: dir,
        min_call_interval: Duration::from_millis(0),
        idle_extraction: Duration::from_secs(3_600),
        hard_cap_per_hour: hard_cap,
        embedding_url: "http://127.0.0.1:1".into(),
        ..EngineConfig::default()
    }
}

fn engine_with(
    config: EngineConfig,
    backend: Arc<ScriptedBackend>,
    host: Arc<FakeHost>,
) -> Arc<ConversationEngine> {
    let state = Arc::new(EngineState::new(config.clone()).unwrap());
    let embeddings = Arc::new(EmbeddingClient::new(&config));
    ConversationEngine::new(state, backend, host, embeddings)
}

fn trace() -> TraceContext {
    TraceContext::new()
}

// ── Scenarios ──────────────────────────────────────────────────────────

#[tokio::test]
async fn hallucinated_action_retries_with_required_tools() {
    let backend = ScriptedBackend::new(vec![
        ScriptedBackend::text("I've sent the email."),          // primary: claim, no call
        ScriptedBackend::calls_tool("send_email", r#"{"to":"bob@example.com"}"#), // forced retry
        ScriptedBackend::text("Email sent to Bob."),            // compose after the tool
    ]);
    let host = FakeHost::new(&["send_email"]);
    let engine = engine_with(test_config(1_000_000), backend, host.clone());

    let reply = engine.handle_message("c1", "send the email to bob", &trace()).await;
    assert!(reply.error.is_none(), "reply errored: {:?}", reply.error);
    assert_eq!(reply.text, "Email sent to Bob.");
    assert!(reply.tools_used.contains(&"send_email".to_string()));
    assert!(host.called("send_email"));
}

#[tokio::test]
async fn hallucinated_action_without_retry_tool_gets_disclaimer() {
    let backend = ScriptedBackend::new(vec![
        ScriptedBackend::text("The meeting has been created."), // claim
        ScriptedBackend::text("Sorry, I still won't call tools."), // retry refuses again
    ]);
    let host = FakeHost::new(&["calendar_create"]);
    let engine = engine_with(test_config(1_000_000), backend, host.clone());

    let reply = engine.handle_message("c1", "schedule the meeting", &trace()).await;
    assert!(reply.error.is_none());
    assert!(reply.text.contains("wasn't able to complete"));
    assert!(!host.called("calendar_create"));
}

#[tokio::test]
async fn leaked_tool_call_is_executed() {
    let backend = ScriptedBackend::new(vec![
        ScriptedBackend::text(r#"search_web({"query":"weather Berlin"})"#),
        ScriptedBackend::text("It's 21°C and sunny in Berlin."), // salvage summary
    ]);
    let host = FakeHost::with_override(
        &["search_web"],
        "search_web",
        ToolOutcome { success: true, output: r#"{"temp_c": 21, "sky": "sunny"}"#.into() },
    );
    let engine = engine_with(test_config(1_000_000), backend, host.clone());

    let reply = engine.handle_message("c1", "what's the weather in Berlin?", &trace()).await;
    assert!(reply.error.is_none());
    assert!(reply.tools_used.contains(&"search_web".to_string()));
    assert_eq!(reply.text, "It's 21°C and sunny in Berlin.");

    let calls = host.calls_to("search_web");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0]["query"], "weather Berlin");
}

#[tokio::test]
async fn leaked_call_with_preamble_keeps_preamble() {
    let backend = ScriptedBackend::new(vec![ScriptedBackend::text(
        r#"Let me look that up. search_web({"query":"rust 1.80 release"})"#,
    )]);
    let host = FakeHost::new(&["search_web"]);
    let engine = engine_with(test_config(1_000_000), backend, host.clone());

    let reply = engine.handle_message("c1", "search for the rust release", &trace()).await;
    assert_eq!(reply.text, "Let me look that up.");
    assert!(host.called("search_web"));
}

#[tokio::test]
async fn silent_completion_is_salvaged() {
    let backend = ScriptedBackend::new(vec![
        ScriptedBackend::calls_tool("search_web", r#"{"query":"news"}"#),
        ScriptedBackend::text(""), // model goes quiet after the tool ran
        ScriptedBackend::text("Here are today's headlines."), // salvage summary
    ]);
    let host = FakeHost::new(&["search_web"]);
    let engine = engine_with(test_config(1_000_000), backend, host.clone());

    let reply = engine.handle_message("c1", "search the news", &trace()).await;
    assert!(reply.error.is_none());
    assert_eq!(reply.text, "Here are today's headlines.");
    assert!(reply.tools_used.contains(&"search_web".to_string()));
}

#[tokio::test]
async fn cost_pause_lets_turn_finish_then_gates_the_next() {
    // Hard cap 1_000; one call burns 1_100 tokens.
    let backend = ScriptedBackend::new(vec![
        ScriptedBackend::text_with_usage("done thinking", 900, 200),
        ScriptedBackend::text("should never run"),
    ]);
    let host = FakeHost::new(&["search_web"]);
    let engine = engine_with(test_config(1_000), backend, host.clone());

    let reply = engine.handle_message("c1", "hello there", &trace()).await;
    assert!(reply.error.is_none());
    assert_eq!(reply.text, "done thinking"); // in-flight turn completes
    assert!(reply.paused, "turn should carry paused=true");

    // The very next turn — any conversation — short-circuits.
    let gated = engine.handle_message("c2", "hello again", &trace()).await;
    assert!(gated.paused);
    assert!(gated.error.as_deref().unwrap_or("").contains("paused"));

    // Resume clears the gate.
    engine.state.cost.resume(true);
    let after = engine.handle_message("c3", "hello once more", &trace()).await;
    assert!(!after.paused);
}

#[tokio::test]
async fn turn_is_persisted_to_disk() {
    let backend = ScriptedBackend::new(vec![ScriptedBackend::text("hi, I'm here.")]);
    let host = FakeHost::new(&["search_web"]);
    let config = test_config(1_000_000);
    let sessions_dir = config.sessions_dir();
    let engine = engine_with(config, backend, host);

    let reply = engine.handle_message("conv-42", "hello", &trace()).await;
    assert!(reply.error.is_none());

    // A brand-new store must replay the turn from disk alone.
    let store = SessionStore::open(sessions_dir).unwrap();
    let session = store.load("conv-42");
    assert_eq!(session.messages.len(), 2);
    assert_eq!(session.messages[0].content, "hello");
    assert_eq!(session.messages[1].content, "hi, I'm here.");
}

#[tokio::test]
async fn breaker_trips_on_fifth_consecutive_failure() {
    let failures: Vec<EngineResult<ChatOutcome>> =
        (0..5).map(|i| Err(EngineError::Other(format!("model exploded #{i}")))).collect();
    let backend = ScriptedBackend::new(failures);
    let host = FakeHost::new(&["search_web"]);
    let engine = engine_with(test_config(1_000_000), backend, host);

    for i in 0..5 {
        let reply = engine.handle_message("c1", "hi", &trace()).await;
        assert!(reply.error.is_some(), "turn {i} should fail");
    }
    assert!(engine.state.breaker.is_tripped());

    // Tripped breaker short-circuits before any model call.
    let gated = engine.handle_message("c1", "hi again", &trace()).await;
    assert!(gated.error.as_deref().unwrap_or("").contains("breaker"));
}

#[tokio::test]
async fn skill_with_execution_plan_runs_without_model() {
    let backend = ScriptedBackend::new(vec![]); // any model call would pop "(out of script)"
    let host = FakeHost::with_override(
        &["status", "send_message"],
        "status",
        ToolOutcome { success: true, output: "all good".into() },
    );
    let engine = engine_with(test_config(1_000_000), backend.clone(), host.clone());

    let skill = SkillRecord {
        name: "nightly-status".into(),
        description: "check in".into(),
        instructions: "ignored for planned runs".into(),
        trigger_kind: TriggerKind::Cron,
        trigger_config: TriggerConfig {
            schedule: Some("0 22 * * *".into()),
            ..Default::default()
        },
        required_tools: vec!["status".into()],
        max_steps: 4,
        enabled: true,
        notify_on_completion: false,
        last_run_at: None,
        last_run_status: SkillRunStatus::NeverRun,
        last_run_summary: None,
        run_count: 0,
        max_runs: None,
        expires_at: None,
        execution_plan: Some(vec![PlannedCall { tool: "status".into(), args: json!({}) }]),
        created_at: None,
    };

    let reply = engine.run_skill(&skill, &trace()).await;
    assert!(reply.error.is_none());
    assert!(reply.text.contains("all good"));
    assert_eq!(reply.tools_used, vec!["status".to_string()]);
    // No model involvement at all.
    assert!(backend.calls.lock().is_empty());
    // The execution is recorded as a fact.
    let fact_calls = host.calls_to("store_fact");
    assert_eq!(fact_calls.len(), 1);
    assert!(fact_calls[0]["content"].as_str().unwrap().contains("nightly-status"));
}

#[tokio::test]
async fn proactive_skill_uses_required_and_core_tools_only() {
    let backend = ScriptedBackend::new(vec![
        ScriptedBackend::calls_tool("calendar_list", r#"{"when":"today"}"#),
        ScriptedBackend::text("You have two meetings today."),
    ]);
    let host = FakeHost::new(&["calendar_list", "search_web", "send_message", "status"]);
    let engine = engine_with(test_config(1_000_000), backend.clone(), host.clone());

    let skill = SkillRecord {
        name: "morning-brief".into(),
        description: "daily agenda".into(),
        instructions: "Summarize today's calendar.".into(),
        trigger_kind: TriggerKind::Cron,
        trigger_config: TriggerConfig { schedule: Some("0 8 * * *".into()), ..Default::default() },
        required_tools: vec!["calendar_list".into()],
        max_steps: 4,
        enabled: true,
        notify_on_completion: false,
        last_run_at: None,
        last_run_status: SkillRunStatus::NeverRun,
        last_run_summary: None,
        run_count: 0,
        max_runs: None,
        expires_at: None,
        execution_plan: None,
        created_at: None,
    };

    let reply = engine.run_skill(&skill, &trace()).await;
    assert!(reply.error.is_none());
    assert_eq!(reply.text, "You have two meetings today.");

    // The tool list offered to the model: required + catalogued core tools,
    // never the scored path (search_web must not ride along).
    let calls = backend.calls.lock();
    let offered: Vec<&str> = calls[0].tools.iter().map(|t| t.name.as_str()).collect();
    assert!(offered.contains(&"calendar_list"));
    assert!(offered.contains(&"send_message"));
    assert!(offered.contains(&"status"));
    assert!(!offered.contains(&"search_web"));
}

#[tokio::test]
async fn compaction_preserves_tool_pairing() {
    let config = test_config(1_000_000);
    let store = SessionStore::open(config.sessions_dir()).unwrap();

    // Build a long session with tool pairs sprinkled through it.
    for i in 0..10 {
        let call = ToolCall {
            id: format!("call_{i}"),
            call_type: "function".into(),
            function: FunctionCall { name: "search_web".into(), arguments: "{}".into() },
        };
        store
            .save_turn(
                "big",
                TurnWrite {
                    user: format!("question {i} {}", "x".repeat(2_500)),
                    assistant: format!("answer {i}"),
                    tools_used: vec!["search_web".into()],
                    prompt_tokens: 10,
                    completion_tokens: 10,
                    messages: Some(vec![
                        Message::user(format!("question {i} {}", "x".repeat(2_500))),
                        Message::assistant_calls("", vec![call.clone()]),
                        Message::tool_result(call.id.clone(), "search_web", format!("result {i}")),
                        Message::assistant(format!("answer {i}")),
                    ]),
                },
            )
            .unwrap();
    }
    assert!(store.should_compact("big", 20_000));

    let backend = ScriptedBackend::new(vec![ScriptedBackend::text(
        "Ten research questions were answered in sequence.",
    )]);
    let cfg = CompactionConfig {
        threshold_chars: 20_000,
        keep_exchanges: 3,
        model: "cheap".into(),
    };
    let (result, _usage) =
        compaction::compact_session(&store, backend.as_ref(), "big", &cfg).await.unwrap();
    assert!(result.messages_after < result.messages_before);

    let session = store.load("big");
    // Sentinel first, then the retained tail with pairing intact.
    assert_eq!(session.messages[0].name.as_deref(), Some("session_compaction"));
    for (i, m) in session.messages.iter().enumerate() {
        if m.has_tool_calls() {
            let next = &session.messages[i + 1];
            assert_eq!(next.role, Role::Tool);
            assert_eq!(
                next.tool_call_id.as_deref(),
                Some(m.tool_calls.as_ref().unwrap()[0].id.as_str())
            );
        }
    }
    // Idempotence: the compacted session is below threshold → no-op.
    let (again, _) = compaction::auto_compact_if_needed(&store, backend.as_ref(), "big", &cfg).await;
    assert!(again.is_none());
}

#[tokio::test]
async fn empty_model_response_gets_nudged_then_neutral() {
    let backend = ScriptedBackend::new(vec![
        ScriptedBackend::text(""), // empty
        ScriptedBackend::text(""), // still empty after the nudge
        ScriptedBackend::text(""),
    ]);
    let host = FakeHost::new(&["search_web"]);
    let engine = engine_with(test_config(1_000_000), backend, host);

    let reply = engine.handle_message("c1", "hello?", &trace()).await;
    assert!(reply.error.is_none());
    assert!(reply.text.contains("wasn't able to complete"));
}

// Hearth Agent Engine — Conversation Engine
// The core turn protocol: gate → refresh catalog → build context → select
// tools → reasoning loop → resilience → persist. One turn per conversation
// at a time; concurrent across conversations up to the worker budget.
//
// The engine never throws past its boundary: every turn resolves to a
// `TurnReply`, possibly with `paused: true` or an error string.

pub mod helpers;

use crate::atoms::constants::*;
use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::compaction::{self, CompactionConfig};
use crate::engine::embedding::EmbeddingClient;
use crate::engine::extraction;
use crate::engine::memory;
use crate::engine::orchestrator::ToolHost;
use crate::engine::provider::{is_deadline_error, is_tool_call_error, ChatBackend, ChatCall};
use crate::engine::sessions::TurnWrite;
use crate::engine::state::EngineState;
use crate::engine::tool_select::{select_tools, Selection, SelectionInput, SelectorLimits};
use crate::engine::trace::TraceContext;
use crate::engine::types::*;
use chrono::Utc;
use log::{info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

pub struct ConversationEngine {
    pub state: Arc<EngineState>,
    pub backend: Arc<dyn ChatBackend>,
    pub host: Arc<dyn ToolHost>,
    pub embeddings: Arc<EmbeddingClient>,
}

/// Everything the step loop accumulates across rounds.
#[derive(Default)]
struct TurnScratch {
    captured: Vec<CapturedStep>,
    tools_used: Vec<String>,
    prompt_tokens: u64,
    completion_tokens: u64,
    paused: bool,
    skill_tool_called: bool,
}

impl ConversationEngine {
    pub fn new(
        state: Arc<EngineState>,
        backend: Arc<dyn ChatBackend>,
        host: Arc<dyn ToolHost>,
        embeddings: Arc<EmbeddingClient>,
    ) -> Arc<Self> {
        Arc::new(ConversationEngine { state, backend, host, embeddings })
    }

    // ── Public surface ─────────────────────────────────────────────────

    /// Run one user turn end-to-end. Serialized per conversation.
    pub async fn handle_message(
        self: &Arc<Self>,
        conversation_id: &str,
        user_message: &str,
        trace: &TraceContext,
    ) -> TurnReply {
        // Gates fire before any queueing so a paused engine answers fast.
        if self.state.breaker.is_tripped() {
            return TurnReply::failed("breaker: too many consecutive failures; restart required");
        }
        if let Some(pause) = self.state.cost.paused() {
            let mut reply = TurnReply::failed(format!("paused: {}", pause.reason));
            reply.paused = true;
            return reply;
        }

        let lock = self.state.turn_lock(conversation_id);
        let _turn = lock.lock().await;
        let _permit = self.state.run_semaphore.clone().acquire_owned().await.ok();

        let result = self.run_user_turn(conversation_id, user_message, trace).await;
        match result {
            Ok(reply) => {
                self.state.breaker.record_success();
                reply
            }
            Err(e) => {
                warn!("[engine] Turn failed for {}: {} (trace={})", conversation_id, e, trace.short());
                self.state.breaker.record_failure();
                TurnReply::failed(e.to_string())
            }
        }
    }

    /// Proactive variant: a skill invokes the engine without a user message.
    /// Required tools resolve directly (no scoring); core tools still ride
    /// along; the result is returned, not delivered to a transport.
    pub async fn run_skill(self: &Arc<Self>, skill: &SkillRecord, trace: &TraceContext) -> TurnReply {
        if self.state.breaker.is_tripped() {
            return TurnReply::failed("breaker: too many consecutive failures; restart required");
        }
        if let Some(pause) = self.state.cost.paused() {
            let mut reply = TurnReply::failed(format!("paused: {}", pause.reason));
            reply.paused = true;
            return reply;
        }

        let reply = match self.run_skill_inner(skill, trace).await {
            Ok(reply) => {
                self.state.breaker.record_success();
                reply
            }
            Err(e) => {
                warn!("[engine] Skill '{}' failed: {} (trace={})", skill.name, e, trace.short());
                self.state.breaker.record_failure();
                TurnReply::failed(e.to_string())
            }
        };

        // Record the execution as a fact so later turns can reference it.
        let summary = if let Some(err) = &reply.error {
            format!("Skill '{}' failed: {}", skill.name, err)
        } else {
            format!("Skill '{}' ran: {}", skill.name, reply.text)
        };
        let summary = truncate_utf8(&summary, SKILL_SUMMARY_MAX_BYTES).to_string();
        if let Err(e) = memory::store_fact(
            self.host.as_ref(),
            &self.state.config.agent_id,
            &summary,
            "skill-run",
            trace,
        )
        .await
        {
            warn!("[engine] Could not store skill-run fact: {}", e);
        }

        reply
    }

    // ── Turn protocol ──────────────────────────────────────────────────

    async fn run_user_turn(
        self: &Arc<Self>,
        conversation_id: &str,
        user_message: &str,
        trace: &TraceContext,
    ) -> EngineResult<TurnReply> {
        let config = &self.state.config;
        let mut scratch = TurnScratch::default();

        // ── 2. Catalog refresh (TTL-gated) ─────────────────────────────
        self.refresh_catalog_if_stale().await;

        // ── Compaction before the prompt is built ──────────────────────
        let compact_cfg = CompactionConfig {
            threshold_chars: config.compact_threshold_chars,
            keep_exchanges: config.compact_keep_exchanges,
            model: config.summary_model.clone(),
        };
        let (_, usage) = compaction::auto_compact_if_needed(
            &self.state.sessions,
            self.backend.as_ref(),
            conversation_id,
            &compact_cfg,
        )
        .await;
        if usage.total() > 0 {
            self.state.cost.record_usage(usage.prompt_tokens, usage.completion_tokens);
        }

        // ── 3. Context build ───────────────────────────────────────────
        let session = self.state.sessions.load(conversation_id);
        let profile =
            memory::get_profile(self.host.as_ref(), &config.agent_id, trace).await;
        let facts =
            memory::relevant_facts(self.host.as_ref(), &config.agent_id, user_message, 5, trace)
                .await;
        let matched_playbooks =
            self.state.playbooks.match_message(self.host.as_ref(), user_message, trace).await;
        let skill_listing = self.skill_listing(trace).await;

        let system_prompt = self.build_system_prompt(
            conversation_id,
            profile.as_deref(),
            session.summary.as_deref(),
            &matched_playbooks,
            &skill_listing,
            &facts,
        );

        let mut history = self.select_history(&session.messages, user_message).await;
        helpers::align_window_start(&mut history);
        helpers::sanitize_tool_pairs(&mut history);

        // ── 4. Tool selection ──────────────────────────────────────────
        let (selection, tools) = self.select_turn_tools(user_message, &matched_playbooks, &session.recent_tools).await;
        let temperature = if selection.top_score > 0.6 {
            config.temperature.min(0.3)
        } else {
            config.temperature
        };

        // ── 5/6. Primary generation + resilience ───────────────────────
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(Message::system(system_prompt));
        messages.extend(history);
        let turn_start = messages.len();
        messages.push(Message::user(user_message));

        let text = self
            .generate_resilient(
                &mut messages,
                &tools,
                config.max_steps,
                temperature,
                user_message,
                !matched_playbooks.is_empty(),
                &mut scratch,
                trace,
            )
            .await?;

        // ── 8. Persistence and bookkeeping ─────────────────────────────
        let structured = if scratch.tools_used.is_empty() {
            None
        } else {
            Some(messages[turn_start..].to_vec())
        };
        let non_core_tools: Vec<String> = scratch
            .tools_used
            .iter()
            .filter(|t| !CORE_TOOLS.contains(&t.as_str()))
            .cloned()
            .collect();
        self.state.sessions.save_turn(
            conversation_id,
            TurnWrite {
                user: user_message.to_string(),
                assistant: text.clone(),
                tools_used: non_core_tools,
                prompt_tokens: scratch.prompt_tokens,
                completion_tokens: scratch.completion_tokens,
                messages: structured,
            },
        )?;

        if scratch.skill_tool_called {
            self.state.playbooks.invalidate();
        }

        memory::store_conversation(
            self.host.as_ref(),
            &config.agent_id,
            conversation_id,
            user_message,
            &text,
            trace,
        )
        .await;

        // ── Idle fact extraction timer ─────────────────────────────────
        extraction::schedule_idle_extraction(self.clone(), conversation_id.to_string());

        let steps = scratch.captured.len();
        Ok(TurnReply {
            text,
            tools_used: scratch.tools_used,
            steps,
            paused: scratch.paused,
            error: None,
        })
    }

    async fn run_skill_inner(
        self: &Arc<Self>,
        skill: &SkillRecord,
        trace: &TraceContext,
    ) -> EngineResult<TurnReply> {
        self.refresh_catalog_if_stale().await;

        // Zero-LLM path: a fixed execution plan runs as-is.
        if let Some(plan) = &skill.execution_plan {
            let mut outputs = Vec::new();
            for step in plan {
                let outcome = self.host.call_tool(&step.tool, &step.args, trace).await?;
                if !outcome.success {
                    return Err(EngineError::tool(&step.tool, outcome.output));
                }
                outputs.push(format!("{}: {}", step.tool, truncate_utf8(&outcome.output, 300)));
            }
            return Ok(TurnReply {
                text: outputs.join("\n"),
                tools_used: plan.iter().map(|p| p.tool.clone()).collect(),
                steps: plan.len(),
                paused: self.state.cost.paused().is_some(),
                error: None,
            });
        }

        // Resolve required tools directly, core tools still included.
        let tools: Vec<ToolDescriptor> = {
            let catalog = self.state.catalog.lock();
            let mut names: Vec<&str> = CORE_TOOLS.to_vec();
            names.extend(skill.required_tools.iter().map(String::as_str));
            let mut seen = HashSet::new();
            names
                .into_iter()
                .filter(|n| seen.insert(n.to_string()))
                .filter_map(|n| catalog.get(n).cloned())
                .collect()
        };

        let now = Utc::now().with_timezone(&self.state.config.timezone);
        let system = format!(
            "You are {}'s background agent executing the scheduled skill '{}'.\n\
             Current time: {} ({}).\n\
             Complete the task using your tools, then reply with a short summary \
             of what you did. There is no user to ask — make reasonable choices.",
            self.state.config.agent_id,
            skill.name,
            now.format("%Y-%m-%d %H:%M"),
            self.state.config.timezone.name(),
        );

        let mut scratch = TurnScratch::default();
        let mut messages =
            vec![Message::system(system), Message::user(skill.instructions.clone())];
        let max_steps = skill.max_steps.max(1);

        let mut text = self
            .run_steps(&mut messages, &tools, max_steps, 0.5, ToolChoice::Auto, &mut scratch, trace)
            .await?;

        // Silent completion still gets salvaged for skills.
        if text.trim().is_empty() {
            text = self.salvage_silent(&scratch, trace).await;
        }

        Ok(TurnReply {
            text,
            tools_used: scratch.tools_used.clone(),
            steps: scratch.captured.len(),
            paused: scratch.paused,
            error: None,
        })
    }

    // ── Catalog refresh ────────────────────────────────────────────────

    /// Refetch the catalog when older than the TTL; on change, rebuild the
    /// embedding index (the cache makes re-embedding near-free).
    pub async fn refresh_catalog_if_stale(&self) {
        let ttl = self.state.config.catalog_ttl;
        let stale = {
            let catalog = self.state.catalog.lock();
            catalog.fetched_at.map(|at| at.elapsed() >= ttl).unwrap_or(true)
        };
        if !stale {
            return;
        }

        let tools = match self.host.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                warn!("[engine] Catalog refresh failed: {}", e);
                return;
            }
        };

        let changed = {
            let mut catalog = self.state.catalog.lock();
            let old: HashSet<&str> = catalog.tools.iter().map(|t| t.name.as_str()).collect();
            let new: HashSet<&str> = tools.iter().map(|t| t.name.as_str()).collect();
            let changed = old != new || catalog.fetched_at.is_none();
            catalog.tools = tools.clone();
            catalog.fetched_at = Some(Instant::now());
            changed
        };

        if changed {
            info!("[engine] Catalog changed — rebuilding tool index ({} tools)", tools.len());
            let mut index = self.state.tool_index.lock().await;
            if let Err(e) = index.initialize(&tools, &self.embeddings).await {
                warn!("[engine] Tool index rebuild failed (keyword fallback active): {}", e);
            }
        }
    }

    // ── Context builders ───────────────────────────────────────────────

    fn build_system_prompt(
        &self,
        conversation_id: &str,
        profile: Option<&str>,
        summary: Option<&str>,
        playbooks: &[Playbook],
        skill_listing: &str,
        facts: &[Fact],
    ) -> String {
        let config = &self.state.config;
        let mut parts: Vec<String> = Vec::new();

        parts.push(
            profile
                .map(str::to_string)
                .unwrap_or_else(|| {
                    format!(
                        "You are {}, a personal assistant agent. Use your tools to act on \
                         the user's behalf; prefer doing over describing.",
                        config.agent_id
                    )
                }),
        );

        let now = Utc::now().with_timezone(&config.timezone);
        parts.push(format!(
            "Current time: {} {} ({})",
            now.format("%Y-%m-%d %H:%M"),
            now.format("%A"),
            config.timezone.name()
        ));
        parts.push(format!("Conversation: {conversation_id}"));

        if let Some(summary) = summary {
            parts.push(format!("## Earlier In This Conversation\n{summary}"));
        }

        for playbook in playbooks {
            parts.push(format!("## Playbook: {}\n{}", playbook.name, playbook.instructions));
        }

        if !skill_listing.is_empty() {
            parts.push(format!("## Your Scheduled Skills\n{skill_listing}"));
        }

        if !facts.is_empty() {
            let lines: Vec<String> =
                facts.iter().map(|f| format!("- {}", truncate_utf8(&f.content, 300))).collect();
            parts.push(format!("## Known Facts\n{}", lines.join("\n")));
        }

        parts.join("\n\n---\n\n")
    }

    /// Description-only listing of the agent's enabled scheduled skills.
    async fn skill_listing(&self, trace: &TraceContext) -> String {
        let skills = memory::list_skills(
            self.host.as_ref(),
            &self.state.config.agent_id,
            Some(true),
            None,
            trace,
        )
        .await
        .unwrap_or_default();

        skills
            .iter()
            .filter(|s| s.trigger_kind != TriggerKind::Keyword)
            .map(|s| format!("- {}: {}", s.name, s.description))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Pick the history window: the last 3 exchanges verbatim plus the older
    /// user turns most similar to the current message, capped overall.
    /// Embedding trouble degrades to a plain tail window.
    async fn select_history(&self, log: &[Message], current: &str) -> Vec<Message> {
        let cap = self.state.config.history_max_messages;
        if log.len() <= cap {
            return log.to_vec();
        }

        // Exchange boundaries: each span starts at a user message.
        let mut spans: Vec<(usize, usize)> = Vec::new();
        let mut start: Option<usize> = None;
        for (i, m) in log.iter().enumerate() {
            if m.role == Role::User {
                if let Some(s) = start {
                    spans.push((s, i));
                }
                start = Some(i);
            }
        }
        if let Some(s) = start {
            spans.push((s, log.len()));
        }
        if spans.len() <= 3 {
            return log[log.len() - cap..].to_vec();
        }

        let verbatim_from = spans[spans.len() - 3].0;
        let older = &spans[..spans.len() - 3];

        // Score older exchanges by their user turn's similarity.
        let older_texts: Vec<String> =
            older.iter().map(|(s, _)| log[*s].content.clone()).collect();
        let mut batch = vec![current.to_string()];
        batch.extend(older_texts);

        let picked: Vec<(usize, usize)> = match self.embeddings.embed_batch(&batch).await {
            Ok(mut vectors) if vectors.len() == older.len() + 1 => {
                let query = vectors.remove(0);
                let mut scored: Vec<((usize, usize), f64)> = older
                    .iter()
                    .zip(vectors.iter())
                    .map(|(span, vec)| (*span, cosine_similarity(&query, vec)))
                    .collect();
                scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

                let budget = cap.saturating_sub(log.len() - verbatim_from);
                let mut used = 0usize;
                let mut chosen: Vec<(usize, usize)> = Vec::new();
                for (span, _) in scored {
                    let len = span.1 - span.0;
                    if used + len > budget {
                        continue;
                    }
                    used += len;
                    chosen.push(span);
                }
                chosen.sort_by_key(|(s, _)| *s);
                chosen
            }
            _ => Vec::new(),
        };

        let mut window = Vec::new();
        if picked.is_empty() {
            // Degraded path: plain tail.
            let from = log.len().saturating_sub(cap);
            window.extend_from_slice(&log[from..]);
        } else {
            for (s, e) in picked {
                window.extend_from_slice(&log[s..e]);
            }
            window.extend_from_slice(&log[verbatim_from..]);
        }
        window
    }

    async fn select_turn_tools(
        &self,
        user_message: &str,
        playbooks: &[Playbook],
        recent_tools: &[Vec<String>],
    ) -> (Selection, Vec<ToolDescriptor>) {
        let config = &self.state.config;
        let catalog_tools: Vec<ToolDescriptor> = self.state.catalog.lock().tools.clone();
        let names: Vec<String> = catalog_tools.iter().map(|t| t.name.clone()).collect();

        let scores: Option<HashMap<String, f64>> = {
            let index = self.state.tool_index.lock().await;
            if index.is_ready() {
                match index.score_message(user_message, &names, &self.embeddings).await {
                    Ok(scores) => Some(scores),
                    Err(e) => {
                        warn!("[engine] Tool scoring failed, keyword fallback: {}", e);
                        None
                    }
                }
            } else {
                None
            }
        };

        let playbook_tools: Vec<String> =
            playbooks.iter().flat_map(|p| p.required_tools.iter().cloned()).collect();

        let limits = SelectorLimits {
            top_k: config.top_k,
            min_tools: config.min_tools,
            similarity_threshold: config.similarity_threshold,
            max_tools: config.max_tools,
            sticky_lookback: config.sticky_lookback,
            sticky_max: config.sticky_max,
        };
        let selection = select_tools(
            &limits,
            &SelectionInput {
                catalog: &catalog_tools,
                message: user_message,
                scores: scores.as_ref(),
                playbook_tools: &playbook_tools,
                recent_tools,
            },
        );

        let descriptors: Vec<ToolDescriptor> = selection
            .tools
            .iter()
            .filter_map(|n| catalog_tools.iter().find(|t| &t.name == n).cloned())
            .collect();

        info!(
            "[engine] Selected {} tool(s), top score {:.2}",
            descriptors.len(),
            selection.top_score
        );
        (selection, descriptors)
    }

    // ── Metered model call ─────────────────────────────────────────────

    /// One model call with the minimum-interval gate and cost accounting.
    async fn chat_metered(
        &self,
        call: ChatCall,
        scratch: &mut TurnScratch,
    ) -> EngineResult<ChatOutcome> {
        let min_interval = self.state.config.min_call_interval;
        let wait = {
            let last = self.state.last_model_call.lock();
            last.map(|at| min_interval.saturating_sub(at.elapsed()))
        };
        if let Some(wait) = wait {
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }

        let result = self.backend.chat(call).await;
        *self.state.last_model_call.lock() = Some(Instant::now());

        if let Ok(outcome) = &result {
            scratch.prompt_tokens += outcome.usage.prompt_tokens;
            scratch.completion_tokens += outcome.usage.completion_tokens;
            self.state
                .cost
                .record_usage(outcome.usage.prompt_tokens, outcome.usage.completion_tokens);
            if self.state.cost.check_pause().is_some() {
                scratch.paused = true;
            }
        }
        result
    }

    // ── Step loop ──────────────────────────────────────────────────────

    /// Run up to `max_steps` rounds of model call → tool execution. Each
    /// completed round is captured so a later failure can salvage it.
    /// Returns the final text ("" when the loop ends without one).
    #[allow(clippy::too_many_arguments)]
    async fn run_steps(
        &self,
        messages: &mut Vec<Message>,
        tools: &[ToolDescriptor],
        max_steps: u32,
        temperature: f64,
        first_choice: ToolChoice,
        scratch: &mut TurnScratch,
        trace: &TraceContext,
    ) -> EngineResult<String> {
        let config = &self.state.config;
        let tool_names: HashSet<String> = tools.iter().map(|t| t.name.clone()).collect();

        let mut tool_fail_counter: HashMap<String, u32> = HashMap::new();
        let mut round_signatures: Vec<u64> = Vec::new();

        for round in 1..=max_steps {
            let choice = if round == 1 { first_choice } else { ToolChoice::Auto };
            let outcome = self
                .chat_metered(
                    ChatCall {
                        model: config.model.clone(),
                        messages: messages.clone(),
                        tools: tools.to_vec(),
                        tool_choice: choice,
                        temperature,
                        deadline: config.call_deadline,
                    },
                    scratch,
                )
                .await?;

            // ── Final text: no tool calls ──────────────────────────────
            if outcome.tool_calls.is_empty() {
                messages.push(Message::assistant(outcome.text.clone()));
                scratch.captured.push(CapturedStep {
                    text: outcome.text.clone(),
                    ..Default::default()
                });
                return Ok(outcome.text);
            }

            // ── Validate calls before touching the orchestrator ────────
            for tc in &outcome.tool_calls {
                if !tool_names.contains(&tc.function.name) {
                    return Err(EngineError::tool(
                        &tc.function.name,
                        "unknown tool name in model call",
                    ));
                }
                if serde_json::from_str::<serde_json::Value>(&tc.function.arguments).is_err() {
                    return Err(EngineError::tool(
                        &tc.function.name,
                        format!(
                            "malformed JSON arguments: {}",
                            truncate_utf8(&tc.function.arguments, 200)
                        ),
                    ));
                }
            }

            messages.push(Message::assistant_calls(outcome.text.clone(), outcome.tool_calls.clone()));

            // ── Repetition detector ────────────────────────────────────
            let signature = call_signature(&outcome.tool_calls);
            round_signatures.push(signature);
            let n = round_signatures.len();
            if n >= MAX_REPEATED_SIGNATURES
                && round_signatures[n - MAX_REPEATED_SIGNATURES..].iter().all(|&s| s == signature)
            {
                let already_redirected = messages.iter().any(|m| {
                    m.role == Role::System && m.content.contains("stuck in a tool-calling loop")
                });
                messages.pop();
                if already_redirected {
                    warn!("[engine] Model ignored the loop redirect — hard-breaking turn");
                    return Ok("I was stuck calling the same tools repeatedly and couldn't make \
                               progress. Please try rephrasing your request."
                        .to_string());
                }
                warn!(
                    "[engine] Tool-call loop detected (same signature ×{}) — injecting redirect",
                    MAX_REPEATED_SIGNATURES
                );
                messages.push(Message::system(
                    "[SYSTEM] You are stuck in a tool-calling loop — the same tools with the \
                     same arguments, several rounds in a row. STOP calling tools and write a \
                     direct text answer summarizing what you have and any issues encountered.",
                ));
                continue;
            }

            // ── Execute ────────────────────────────────────────────────
            let mut step = CapturedStep {
                text: outcome.text.clone(),
                tool_calls: outcome.tool_calls.clone(),
                tool_results: Vec::new(),
            };
            for tc in &outcome.tool_calls {
                let name = &tc.function.name;

                if tool_fail_counter.get(name).copied().unwrap_or(0) >= TOOL_FAIL_BLOCK {
                    warn!("[engine] Blocking '{}' after repeated failures this turn", name);
                    messages.push(Message::tool_result(
                        tc.id.clone(),
                        name.clone(),
                        format!(
                            "Error: tool '{}' is blocked after {} consecutive failures. \
                             Use a different tool or tell the user.",
                            name, TOOL_FAIL_BLOCK
                        ),
                    ));
                    continue;
                }

                let args: serde_json::Value =
                    serde_json::from_str(&tc.function.arguments).unwrap_or(serde_json::json!({}));
                let result = match self.host.call_tool(name, &args, trace).await {
                    Ok(outcome) => outcome,
                    Err(e) => ToolOutcome { success: false, output: e.to_string() },
                };

                info!(
                    "[engine] Tool {} success={} output_len={} (trace={})",
                    name,
                    result.success,
                    result.output.len(),
                    trace.short()
                );

                messages.push(Message::tool_result(tc.id.clone(), name.clone(), result.output.clone()));
                step.tool_results.push(ToolResult {
                    tool_call_id: tc.id.clone(),
                    name: name.clone(),
                    output: result.output.clone(),
                    success: result.success,
                });
                if !scratch.tools_used.contains(name) {
                    scratch.tools_used.push(name.clone());
                }
                if SKILL_MODIFYING_TOOLS.contains(&name.as_str()) {
                    scratch.skill_tool_called = true;
                }

                if result.success {
                    tool_fail_counter.remove(name);
                } else {
                    let count = tool_fail_counter.entry(name.clone()).or_insert(0);
                    *count += 1;
                    if *count == TOOL_FAIL_NUDGE {
                        messages.push(Message::system(format!(
                            "[SYSTEM] The tool '{}' has failed {} times in a row. Stop calling \
                             it with the same arguments — try a different tool or approach.",
                            name, count
                        )));
                    }
                }
            }
            scratch.captured.push(step);
        }

        warn!("[engine] Max steps ({}) reached without a final answer", max_steps);
        Ok(String::new())
    }

    // ── Resilience protocol ────────────────────────────────────────────

    /// Primary generation wrapped in the recovery ladder. `messages` holds
    /// the full prompt; on return it also holds whatever the recovery
    /// appended, so persistence sees the real sequence.
    #[allow(clippy::too_many_arguments)]
    async fn generate_resilient(
        &self,
        messages: &mut Vec<Message>,
        tools: &[ToolDescriptor],
        max_steps: u32,
        temperature: f64,
        user_message: &str,
        playbooks_matched: bool,
        scratch: &mut TurnScratch,
        trace: &TraceContext,
    ) -> EngineResult<String> {
        let first = self
            .run_steps(messages, tools, max_steps, temperature, ToolChoice::Auto, scratch, trace)
            .await;

        let text = match first {
            Ok(text) => text,
            Err(e) if is_tool_call_error(&e) || matches!(e, EngineError::Tool { .. }) => {
                // One retry from the captured step state, slightly hotter,
                // with a clarifying turn echoing the error.
                warn!("[engine] Tool-call error, retrying: {}", e);
                messages.push(Message::system(format!(
                    "[SYSTEM] The previous tool call failed: {}. Call the tool again with \
                     valid JSON arguments matching its schema.",
                    e
                )));
                let retry = self
                    .run_steps(
                        messages,
                        tools,
                        2,
                        (temperature + 0.2).min(1.0),
                        ToolChoice::Auto,
                        scratch,
                        trace,
                    )
                    .await;
                match retry {
                    Ok(text) => text,
                    Err(e2) => {
                        // Final attempt: rephrase against the last assistant
                        // text, if the conversation has one.
                        let last_assistant = messages
                            .iter()
                            .rev()
                            .find(|m| m.role == Role::Assistant && !m.content.trim().is_empty())
                            .map(|m| m.content.clone());
                        match last_assistant {
                            Some(prior) => {
                                warn!("[engine] Retry failed too ({}), rephrasing", e2);
                                messages.push(Message::user(format!(
                                    "(rephrased) {user_message}\n\nYour earlier draft: {}",
                                    truncate_utf8(&prior, 500)
                                )));
                                self.run_steps(
                                    messages,
                                    tools,
                                    2,
                                    temperature,
                                    ToolChoice::Auto,
                                    scratch,
                                    trace,
                                )
                                .await?
                            }
                            None => return Err(e2),
                        }
                    }
                }
            }
            Err(e) if is_deadline_error(&e) => {
                // Deadline: transient for the call; salvage what ran. With
                // nothing captured the turn stays a failure (breaker counts).
                let nothing_ran = scratch
                    .captured
                    .iter()
                    .all(|s| s.tool_results.is_empty() && s.text.trim().is_empty());
                if nothing_ran {
                    return Err(e);
                }
                warn!("[engine] Model call hit the deadline — salvaging captured steps");
                let salvaged = self.salvage_silent(scratch, trace).await;
                messages.push(Message::assistant(salvaged.clone()));
                return Ok(salvaged);
            }
            Err(e) if matches!(e, EngineError::Network(_) | EngineError::Provider { .. }) => {
                // Transient transport: one retry, then surface.
                warn!("[engine] Transport error, one retry: {}", e);
                match self
                    .run_steps(messages, tools, max_steps, temperature, ToolChoice::Auto, scratch, trace)
                    .await
                {
                    Ok(text) => text,
                    Err(_) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        let any_tools_ran = scratch.captured.iter().any(|s| !s.tool_results.is_empty());
        let tool_names: HashSet<String> = tools.iter().map(|t| t.name.clone()).collect();

        // ── Tool-call leak as text ─────────────────────────────────────
        if !any_tools_ran {
            if let Some(leak) = helpers::parse_leaked_call(&text, &tool_names) {
                info!("[engine] Executing leaked tool call '{}'", leak.name);
                return self.recover_leak(messages, leak, scratch, trace).await;
            }
        }

        // ── Hallucinated action ────────────────────────────────────────
        if !any_tools_ran && !tools.is_empty() && helpers::claims_action(&text) {
            warn!("[engine] Action claimed with zero tool calls — retry with tool-choice=required");
            messages.push(Message::system(
                "[SYSTEM] You claimed an action was taken, but no tool was called. \
                 Actually perform the action now using the appropriate tool.",
            ));
            let retry = self
                .run_steps(messages, tools, 2, 0.2, ToolChoice::Required, scratch, trace)
                .await
                .unwrap_or_default();
            let retried_tools = scratch.captured.iter().any(|s| !s.tool_results.is_empty());
            if retried_tools {
                if !retry.trim().is_empty() {
                    return Ok(retry);
                }
                return Ok(self.salvage_silent(scratch, trace).await);
            }
            messages.push(Message::assistant(NEUTRAL_FAILURE_TEXT));
            return Ok(NEUTRAL_FAILURE_TEXT.to_string());
        }

        // ── Tool refusal ───────────────────────────────────────────────
        let non_core_selected = tools.iter().any(|t| !CORE_TOOLS.contains(&t.name.as_str()));
        if !any_tools_ran
            && helpers::is_refusal(&text)
            && (playbooks_matched || non_core_selected)
        {
            warn!("[engine] Refusal despite available tools — forcing one tool step");
            messages.push(Message::system(
                "[SYSTEM] You do have the tools for this request. Use one now.",
            ));
            let _ = self
                .run_steps(messages, tools, 1, temperature, ToolChoice::Required, scratch, trace)
                .await;
            let compose = self
                .run_steps(messages, tools, 1, temperature, ToolChoice::Auto, scratch, trace)
                .await
                .unwrap_or_default();
            if !compose.trim().is_empty() {
                return Ok(compose);
            }
            return Ok(self.salvage_silent(scratch, trace).await);
        }

        // ── Silent completion / empty response ─────────────────────────
        if text.trim().is_empty() {
            if any_tools_ran {
                let salvaged = self.salvage_silent(scratch, trace).await;
                messages.push(Message::assistant(salvaged.clone()));
                return Ok(salvaged);
            }
            // Nothing at all: one nudge retry, then the neutral fallback.
            let nudge = helpers::empty_response_nudge(messages);
            messages.push(nudge);
            let retry = self
                .run_steps(messages, tools, 2, temperature, ToolChoice::Auto, scratch, trace)
                .await
                .unwrap_or_default();
            if !retry.trim().is_empty() {
                return Ok(retry);
            }
            messages.push(Message::assistant(NEUTRAL_FAILURE_TEXT));
            return Ok(NEUTRAL_FAILURE_TEXT.to_string());
        }

        Ok(text)
    }

    /// Execute a leaked call and compose an answer from its result.
    async fn recover_leak(
        &self,
        messages: &mut Vec<Message>,
        leak: helpers::LeakedCall,
        scratch: &mut TurnScratch,
        trace: &TraceContext,
    ) -> EngineResult<String> {
        let args: serde_json::Value =
            serde_json::from_str(&leak.arguments).unwrap_or(serde_json::json!({}));
        let result = match self.host.call_tool(&leak.name, &args, trace).await {
            Ok(outcome) => outcome,
            Err(e) => ToolOutcome { success: false, output: e.to_string() },
        };

        // Rewrite the leak as a proper structured exchange.
        let call = ToolCall {
            id: format!("call_{}", uuid::Uuid::new_v4()),
            call_type: "function".into(),
            function: FunctionCall { name: leak.name.clone(), arguments: leak.arguments.clone() },
        };
        // The leaked text was already pushed as a plain assistant message;
        // replace it with the structured form.
        if messages.last().map(|m| m.role == Role::Assistant).unwrap_or(false) {
            messages.pop();
        }
        messages.push(Message::assistant_calls(leak.preamble.clone(), vec![call.clone()]));
        messages.push(Message::tool_result(call.id.clone(), leak.name.clone(), result.output.clone()));

        scratch.tools_used.push(leak.name.clone());
        scratch.captured.push(CapturedStep {
            text: leak.preamble.clone(),
            tool_calls: vec![call.clone()],
            tool_results: vec![ToolResult {
                tool_call_id: call.id,
                name: leak.name.clone(),
                output: result.output.clone(),
                success: result.success,
            }],
        });

        if !leak.preamble.trim().is_empty() {
            // The preamble already reads as an answer.
            messages.push(Message::assistant(leak.preamble.clone()));
            return Ok(leak.preamble);
        }

        let summary = self
            .summarize_results(&[(leak.name.clone(), result.output.clone())], scratch)
            .await;
        messages.push(Message::assistant(summary.clone()));
        Ok(summary)
    }

    /// Salvage a silent completion: step text if any, else a cheap summary
    /// of the truncated tool results, else the raw results.
    async fn salvage_silent(&self, scratch: &TurnScratch, _trace: &TraceContext) -> String {
        if let Some(text) = helpers::salvage_step_text(&scratch.captured) {
            return text;
        }
        let results = helpers::salvage_tool_results(&scratch.captured);
        if results.is_empty() {
            return NEUTRAL_FAILURE_TEXT.to_string();
        }
        // A fresh scratch so the summary call's usage still gets metered
        // without disturbing the captured steps.
        let mut meter = TurnScratch::default();
        self.summarize_results(&results, &mut meter).await
    }

    /// Cheap-model summary of tool results into a user-facing message.
    /// Falls back to the raw truncated results.
    async fn summarize_results(
        &self,
        results: &[(String, String)],
        scratch: &mut TurnScratch,
    ) -> String {
        let listing = results
            .iter()
            .map(|(name, output)| format!("### {name}\n{output}"))
            .collect::<Vec<_>>()
            .join("\n\n");

        let call = ChatCall {
            model: self.state.config.summary_model.clone(),
            messages: vec![
                Message::system(
                    "Summarize these tool results into a short, clear answer for the user. \
                     Do not mention tools or JSON.",
                ),
                Message::user(listing),
            ],
            tools: vec![],
            tool_choice: ToolChoice::None,
            temperature: 0.3,
            deadline: std::time::Duration::from_secs(30),
        };
        match self.chat_metered(call, scratch).await {
            Ok(outcome) if !outcome.text.trim().is_empty() => outcome.text,
            _ => helpers::raw_results_fallback(results),
        }
    }
}

/// Hash of the sorted (name, arguments) pairs of a round's tool calls.
fn call_signature(calls: &[ToolCall]) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut parts: Vec<(&str, &str)> =
        calls.iter().map(|tc| (tc.function.name.as_str(), tc.function.arguments.as_str())).collect();
    parts.sort();
    let mut hasher = DefaultHasher::new();
    for (name, args) in &parts {
        name.hash(&mut hasher);
        args.hash(&mut hasher);
    }
    hasher.finish()
}

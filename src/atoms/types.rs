// ── Hearth Atoms: Pure Data Types ──────────────────────────────────────────
// All plain struct/enum definitions with no logic.
// Atoms layer rule: no I/O, no side effects, no imports from engine/.
//
// These types are re-exported from engine/types.rs via
//   pub use crate::atoms::types::*;
// so engine modules import them with `use crate::engine::types::*`.

use serde::{Deserialize, Serialize};

// ── Messages ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Message { role: Role::System, content: content.into(), tool_calls: None, tool_call_id: None, name: None }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Message { role: Role::User, content: content.into(), tool_calls: None, tool_call_id: None, name: None }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Message { role: Role::Assistant, content: content.into(), tool_calls: None, tool_call_id: None, name: None }
    }

    /// Assistant message carrying structured tool calls.
    pub fn assistant_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Message { role: Role::Assistant, content: content.into(), tool_calls: Some(calls), tool_call_id: None, name: None }
    }

    /// Tool-result message satisfying the call with `call_id`.
    pub fn tool_result(call_id: impl Into<String>, tool_name: impl Into<String>, output: impl Into<String>) -> Self {
        Message {
            role: Role::Tool,
            content: output.into(),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
            name: Some(tool_name.into()),
        }
    }

    /// Whether this assistant message carries at least one tool call.
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().map(|tc| !tc.is_empty()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

// ── Tool Calling ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String, // JSON string
}

/// A tool descriptor owned by the orchestrator's catalog. The engine holds a
/// read-only copy refreshed at most every catalog-TTL interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[serde(default = "default_parameters")]
    pub parameters: serde_json::Value,
}

fn default_parameters() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// Outcome of a single tool execution at the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    pub output: String,
}

/// Result of one executed tool call, kept with its call id for pairing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub name: String,
    pub output: String,
    pub success: bool,
}

/// Tool-choice directive passed to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolChoice {
    Auto,
    Required,
    None,
}

// ── Model invocation ───────────────────────────────────────────────────

/// Token usage reported by the model API (for metering).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// One completed model response: final text, structured tool calls, usage.
#[derive(Debug, Clone, Default)]
pub struct ChatOutcome {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
    /// The actual model that responded (from the API, not config).
    pub model: Option<String>,
}

/// One completed step of the reasoning loop, captured so a later failure can
/// salvage what already ran.
#[derive(Debug, Clone, Default)]
pub struct CapturedStep {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
}

// ── Turn result ────────────────────────────────────────────────────────

/// What a user turn (or proactive skill run) resolves to. The engine never
/// throws past this boundary: failures land in `error`, cost pauses in
/// `paused`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnReply {
    pub text: String,
    pub tools_used: Vec<String>,
    pub steps: usize,
    #[serde(default)]
    pub paused: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TurnReply {
    pub fn failed(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        TurnReply { text: String::new(), tools_used: vec![], steps: 0, paused: false, error: Some(reason) }
    }
}

// ── Skills & Playbooks ─────────────────────────────────────────────────

/// How a skill is triggered. Keyword-triggered skills are "playbooks": their
/// instructions are injected into the prompt when a user message matches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Cron,
    Interval,
    OneShot,
    Keyword,
}

/// Trigger configuration. Which fields are meaningful depends on the kind:
/// `schedule` (cron expression) for Cron, `interval_minutes` for Interval,
/// `at` / `in_minutes` for OneShot, `keywords` + `priority` for Keyword.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_minutes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_minutes: Option<u64>,
    /// RFC 3339 absolute fire time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkillRunStatus {
    Success,
    Error,
    NeverRun,
}

impl Default for SkillRunStatus {
    fn default() -> Self {
        SkillRunStatus::NeverRun
    }
}

/// A fixed tool call inside a skill's execution plan (zero-LLM runs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedCall {
    pub tool: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// A skill stored by the memory collaborator. The scheduler treats it as
/// read-mostly with targeted writes after each execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillRecord {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub instructions: String,
    pub trigger_kind: TriggerKind,
    #[serde(default)]
    pub trigger_config: TriggerConfig,
    #[serde(default)]
    pub required_tools: Vec<String>,
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub notify_on_completion: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<String>,
    #[serde(default)]
    pub last_run_status: SkillRunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_summary: Option<String>,
    #[serde(default)]
    pub run_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_runs: Option<u64>,
    /// RFC 3339; the skill is disabled once this passes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    /// Fixed sequence of tool calls for zero-LLM execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_plan: Option<Vec<PlannedCall>>,
    /// RFC 3339; set by the memory collaborator on creation. Anchors
    /// relative one-shot triggers (`in_minutes`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

pub(crate) fn default_max_steps() -> u32 {
    8
}

/// The keyword-triggered view of a skill, as the prompt builder consumes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Playbook {
    pub name: String,
    pub description: String,
    pub keywords: Vec<String>,
    pub priority: i32,
    pub instructions: String,
    pub required_tools: Vec<String>,
    pub max_steps: u32,
    pub notify_on_completion: bool,
}

// ── Memory facts ───────────────────────────────────────────────────────

/// A stored fact about the user, as the memory collaborator returns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub content: String,
    #[serde(default)]
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// A fact candidate produced by the extraction model, pre-filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedFact {
    pub content: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub confidence: f64,
}

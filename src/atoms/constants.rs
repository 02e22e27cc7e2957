// ── Hearth Atoms: Constants ────────────────────────────────────────────────
// Fixed names and limits shared across the engine. Tunable values live in
// engine/config.rs; these are structural.

/// Core tools that are ALWAYS offered to the model when the catalog has them
/// (never gated behind selection scores).
pub const CORE_TOOLS: &[&str] = &[
    "send_message",
    "store_fact",
    "search_memories",
    "status",
    "spawn_subagent",
];

/// Tools whose execution mutates the skill store; calling any of them
/// invalidates the playbook registry cache for the rest of the turn.
pub const SKILL_MODIFYING_TOOLS: &[&str] = &["store_skill", "update_skill", "delete_skill"];

/// Consecutive turn failures before the per-agent circuit breaker trips.
pub const BREAKER_TRIP_THRESHOLD: u32 = 5;

/// Consecutive failures of one tool (within a turn) before a redirect nudge.
pub const TOOL_FAIL_NUDGE: u32 = 3;

/// Consecutive failures of one tool (within a turn) before it is blocked.
pub const TOOL_FAIL_BLOCK: u32 = 5;

/// Identical tool-call signatures in a row before the loop redirect fires.
pub const MAX_REPEATED_SIGNATURES: usize = 3;

/// Tool-result JSON is truncated to this many bytes before salvage
/// summarization.
pub const SALVAGE_RESULT_MAX_BYTES: usize = 2_000;

/// Proactive skill execution summaries stored as facts are truncated to this.
pub const SKILL_SUMMARY_MAX_BYTES: usize = 500;

/// Neutral sentence delivered when the resilience protocol cannot produce a
/// meaningful answer. Raw tool JSON or stack traces are never delivered.
pub const NEUTRAL_FAILURE_TEXT: &str =
    "I wasn't able to complete this action. Please try again.";

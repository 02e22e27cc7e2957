// Hearth Agent Engine — Configuration
//
// All tunables come from the process environment (the orchestrator launches
// the agent with its env prepared). Every knob has a default that matches
// the documented behavior, so an empty environment yields a working engine
// pointed at localhost collaborators.

use crate::atoms::error::{EngineError, EngineResult};
use log::warn;
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration, parsed once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Logical agent identity (memory scope, skill ownership).
    pub agent_id: String,
    /// Orchestrator (tool host) base URL.
    pub orchestrator_url: String,
    /// Address the engine's inbound HTTP surface binds to.
    pub listen_addr: String,
    /// Data directory for sessions, the embedding cache, and state files.
    pub data_dir: PathBuf,

    // ── Language model ────────────────────────────────────────────────
    pub model_url: String,
    pub model_api_key: String,
    pub model: String,
    /// Cheap model for compaction, salvage summaries, and fact extraction.
    pub summary_model: String,
    pub temperature: f64,
    pub max_steps: u32,
    pub call_deadline: Duration,
    /// Minimum spacing between model calls.
    pub min_call_interval: Duration,

    // ── Embeddings / tool selection ───────────────────────────────────
    pub embedding_url: String,
    pub embedding_model: String,
    pub embedding_provider: String,
    pub top_k: usize,
    pub min_tools: usize,
    pub similarity_threshold: f64,
    pub max_tools: usize,
    pub sticky_lookback: usize,
    pub sticky_max: usize,
    pub catalog_ttl: Duration,

    // ── Sessions ──────────────────────────────────────────────────────
    pub compact_threshold_chars: usize,
    pub compact_keep_exchanges: usize,
    pub session_max_age_days: i64,
    pub history_max_messages: usize,

    // ── Cost monitor ──────────────────────────────────────────────────
    pub hard_cap_per_hour: u64,
    pub spike_multiplier: f64,
    pub short_window_minutes: usize,
    pub min_baseline_tokens: u64,

    // ── Scheduler ─────────────────────────────────────────────────────
    pub timezone: chrono_tz::Tz,
    pub skill_cooldown: Duration,

    // ── Fact extraction ───────────────────────────────────────────────
    pub idle_extraction: Duration,
    pub extraction_max_turns: usize,
    pub confidence_threshold: f64,

    /// Worker budget: concurrent turns across conversations.
    pub max_concurrent_turns: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            agent_id: "main".into(),
            orchestrator_url: "http://127.0.0.1:8700".into(),
            listen_addr: "127.0.0.1:8787".into(),
            data_dir: default_data_dir(),
            model_url: "http://localhost:11434/v1".into(),
            model_api_key: String::new(),
            model: "qwen2.5:14b".into(),
            summary_model: "qwen2.5:3b".into(),
            temperature: 0.7,
            max_steps: 8,
            call_deadline: Duration::from_secs(90),
            min_call_interval: Duration::from_millis(1000),
            embedding_url: "http://localhost:11434".into(),
            embedding_model: "nomic-embed-text".into(),
            embedding_provider: "ollama".into(),
            top_k: 15,
            min_tools: 5,
            similarity_threshold: 0.3,
            max_tools: 25,
            sticky_lookback: 3,
            sticky_max: 8,
            catalog_ttl: Duration::from_secs(600),
            compact_threshold_chars: 20_000,
            compact_keep_exchanges: 3,
            session_max_age_days: 30,
            history_max_messages: 20,
            hard_cap_per_hour: 250_000,
            spike_multiplier: 3.0,
            short_window_minutes: 2,
            min_baseline_tokens: 1_000,
            timezone: chrono_tz::UTC,
            skill_cooldown: Duration::from_secs(300),
            idle_extraction: Duration::from_secs(300),
            extraction_max_turns: 10,
            confidence_threshold: 0.7,
            max_concurrent_turns: 4,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".hearth")
}

/// Read an env var and parse it, falling back to `default` (with a warning)
/// when set but unparsable.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!("[config] {} has unparsable value '{}' — using default", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl EngineConfig {
    /// Build the configuration from the process environment.
    pub fn from_env() -> EngineResult<Self> {
        let d = EngineConfig::default();

        let data_dir = match std::env::var("HEARTH_DATA_DIR") {
            Ok(p) if !p.is_empty() => PathBuf::from(p),
            _ => d.data_dir.clone(),
        };

        let tz_name = env_string("HEARTH_TIMEZONE", "UTC");
        let timezone: chrono_tz::Tz = tz_name
            .parse()
            .map_err(|_| EngineError::Config(format!("unknown timezone '{}'", tz_name)))?;

        Ok(EngineConfig {
            agent_id: env_string("HEARTH_AGENT_ID", &d.agent_id),
            orchestrator_url: env_string("HEARTH_ORCHESTRATOR_URL", &d.orchestrator_url),
            listen_addr: env_string("HEARTH_LISTEN_ADDR", &d.listen_addr),
            data_dir,
            model_url: env_string("HEARTH_MODEL_URL", &d.model_url),
            model_api_key: env_string("HEARTH_MODEL_API_KEY", ""),
            model: env_string("HEARTH_MODEL", &d.model),
            summary_model: env_string("HEARTH_SUMMARY_MODEL", &d.summary_model),
            temperature: env_parse("HEARTH_TEMPERATURE", d.temperature),
            max_steps: env_parse("HEARTH_MAX_STEPS", d.max_steps),
            call_deadline: Duration::from_secs(env_parse("HEARTH_CALL_DEADLINE_SECS", 90)),
            min_call_interval: Duration::from_millis(env_parse("HEARTH_MIN_CALL_INTERVAL_MS", 1000)),
            embedding_url: env_string("HEARTH_EMBEDDING_URL", &d.embedding_url),
            embedding_model: env_string("HEARTH_EMBEDDING_MODEL", &d.embedding_model),
            embedding_provider: env_string("HEARTH_EMBEDDING_PROVIDER", &d.embedding_provider),
            top_k: env_parse("HEARTH_TOOL_TOP_K", d.top_k),
            min_tools: env_parse("HEARTH_TOOL_MIN", d.min_tools),
            similarity_threshold: env_parse("HEARTH_TOOL_SIMILARITY", d.similarity_threshold),
            max_tools: env_parse("HEARTH_TOOL_CAP", d.max_tools),
            sticky_lookback: env_parse("HEARTH_STICKY_LOOKBACK", d.sticky_lookback),
            sticky_max: env_parse("HEARTH_STICKY_MAX", d.sticky_max),
            catalog_ttl: Duration::from_secs(env_parse("HEARTH_CATALOG_TTL_SECS", 600)),
            compact_threshold_chars: env_parse("HEARTH_COMPACT_THRESHOLD", d.compact_threshold_chars),
            compact_keep_exchanges: env_parse("HEARTH_COMPACT_KEEP", d.compact_keep_exchanges),
            session_max_age_days: env_parse("HEARTH_SESSION_MAX_AGE_DAYS", d.session_max_age_days),
            history_max_messages: env_parse("HEARTH_HISTORY_MAX", d.history_max_messages),
            hard_cap_per_hour: env_parse("HEARTH_HARD_CAP_PER_HOUR", d.hard_cap_per_hour),
            spike_multiplier: env_parse("HEARTH_SPIKE_MULTIPLIER", d.spike_multiplier),
            short_window_minutes: env_parse("HEARTH_SPIKE_WINDOW_MIN", d.short_window_minutes),
            min_baseline_tokens: env_parse("HEARTH_MIN_BASELINE_TOKENS", d.min_baseline_tokens),
            timezone,
            skill_cooldown: Duration::from_secs(env_parse("HEARTH_SKILL_COOLDOWN_SECS", 300)),
            idle_extraction: Duration::from_secs(env_parse("HEARTH_IDLE_EXTRACTION_SECS", 300)),
            extraction_max_turns: env_parse("HEARTH_EXTRACTION_MAX_TURNS", d.extraction_max_turns),
            confidence_threshold: env_parse("HEARTH_FACT_CONFIDENCE", d.confidence_threshold),
            max_concurrent_turns: env_parse("HEARTH_MAX_CONCURRENT_TURNS", d.max_concurrent_turns),
        })
    }

    /// Path of the on-disk embedding cache file.
    pub fn embedding_cache_path(&self) -> PathBuf {
        self.data_dir.join("tool_embeddings.json")
    }

    /// Directory holding one JSONL file per conversation.
    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    /// Single-shot health notification state file.
    pub fn health_state_path(&self) -> PathBuf {
        self.data_dir.join("health_state.json")
    }

    /// Last diagnostics report, diffed against the next run.
    pub fn health_report_path(&self) -> PathBuf {
        self.data_dir.join("health_report.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let c = EngineConfig::default();
        assert_eq!(c.max_tools, 25);
        assert_eq!(c.min_tools, 5);
        assert_eq!(c.top_k, 15);
        assert_eq!(c.max_steps, 8);
        assert_eq!(c.compact_threshold_chars, 20_000);
        assert!((c.similarity_threshold - 0.3).abs() < 1e-9);
        assert_eq!(c.call_deadline, Duration::from_secs(90));
    }

    #[test]
    fn test_env_parse_falls_back_on_garbage() {
        std::env::set_var("HEARTH_TEST_PARSE", "not-a-number");
        let v: u32 = env_parse("HEARTH_TEST_PARSE", 42);
        assert_eq!(v, 42);
        std::env::remove_var("HEARTH_TEST_PARSE");
    }
}

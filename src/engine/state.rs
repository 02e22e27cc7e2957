// engine/state.rs — Shared engine state and type aliases.
//
// The five process-wide singletons of the design — halt flag, cost monitor,
// catalog snapshot, embedding index, session store — live here as fields of
// one configuration-injected `EngineState`, each with a single writer:
// the scheduler owns the halt flag, the turn gate owns the catalog refresh,
// the reasoning loop owns cost recording.

use crate::atoms::constants::BREAKER_TRIP_THRESHOLD;
use crate::atoms::error::EngineResult;
use crate::engine::config::EngineConfig;
use crate::engine::cost::{CostLimits, CostMonitor};
use crate::engine::playbooks::PlaybookRegistry;
use crate::engine::sessions::SessionStore;
use crate::engine::tool_index::ToolIndex;
use crate::engine::types::ToolDescriptor;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Read-mostly copy of the orchestrator's tool catalog.
#[derive(Default)]
pub struct CatalogSnapshot {
    pub tools: Vec<ToolDescriptor>,
    pub fetched_at: Option<Instant>,
}

impl CatalogSnapshot {
    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|t| t.name == name)
    }
}

/// Per-agent circuit breaker. Failures increment, successes decrement
/// (never reset); the trip latches until process restart.
pub struct CircuitBreaker {
    consecutive: AtomicU32,
    tripped: AtomicBool,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        CircuitBreaker { consecutive: AtomicU32::new(0), tripped: AtomicBool::new(false) }
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> u32 {
        self.consecutive.load(Ordering::SeqCst)
    }

    /// Record a failed turn. Returns true when this failure trips the
    /// breaker.
    pub fn record_failure(&self) -> bool {
        let count = self.consecutive.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= BREAKER_TRIP_THRESHOLD {
            let first = !self.tripped.swap(true, Ordering::SeqCst);
            if first {
                log::error!(
                    "[engine] Circuit breaker TRIPPED after {} consecutive failures — \
                     refusing turns until restart",
                    count
                );
            }
            return first;
        }
        false
    }

    /// Record a successful turn: decrement, don't reset.
    pub fn record_success(&self) {
        let _ = self
            .consecutive
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some(c.saturating_sub(1)));
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

/// Engine state shared across turns, the scheduler, and the HTTP surface.
pub struct EngineState {
    pub config: EngineConfig,
    /// Global halt: set by the operator, checked by the scheduler tick and
    /// long-running jobs.
    pub halt: AtomicBool,
    pub cost: CostMonitor,
    pub sessions: SessionStore,
    pub playbooks: PlaybookRegistry,
    pub tool_index: tokio::sync::Mutex<ToolIndex>,
    pub catalog: Mutex<CatalogSnapshot>,
    pub breaker: CircuitBreaker,
    /// Worker budget across conversations.
    pub run_semaphore: Arc<tokio::sync::Semaphore>,
    /// One lock per conversation: turns within a conversation serialize.
    turn_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Minimum-interval gate between model calls.
    pub last_model_call: Mutex<Option<Instant>>,
    /// Idle-extraction generation per conversation: bumped on every turn so
    /// a stale idle timer notices it was superseded.
    pub extraction_epochs: Mutex<HashMap<String, u64>>,
    epoch_counter: AtomicU64,
}

impl EngineState {
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        let sessions = SessionStore::open(config.sessions_dir())?;
        let cost = CostMonitor::new(CostLimits {
            hard_cap_per_hour: config.hard_cap_per_hour,
            spike_multiplier: config.spike_multiplier,
            short_window_minutes: config.short_window_minutes,
            min_baseline_tokens: config.min_baseline_tokens,
        });
        let tool_index = ToolIndex::new(config.embedding_cache_path());
        let playbooks = PlaybookRegistry::new(config.agent_id.clone());
        let max_turns = config.max_concurrent_turns.max(1);

        Ok(EngineState {
            config,
            halt: AtomicBool::new(false),
            cost,
            sessions,
            playbooks,
            tool_index: tokio::sync::Mutex::new(tool_index),
            catalog: Mutex::new(CatalogSnapshot::default()),
            breaker: CircuitBreaker::new(),
            run_semaphore: Arc::new(tokio::sync::Semaphore::new(max_turns)),
            turn_locks: Mutex::new(HashMap::new()),
            last_model_call: Mutex::new(None),
            extraction_epochs: Mutex::new(HashMap::new()),
            epoch_counter: AtomicU64::new(0),
        })
    }

    /// The serialization lock for one conversation.
    pub fn turn_lock(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.turn_locks.lock();
        locks.entry(conversation_id.to_string()).or_default().clone()
    }

    /// Bump and return the extraction epoch for a conversation. The idle
    /// timer captures the value at scheduling time and only fires if it is
    /// still current.
    pub fn bump_extraction_epoch(&self, conversation_id: &str) -> u64 {
        let epoch = self.epoch_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.extraction_epochs.lock().insert(conversation_id.to_string(), epoch);
        epoch
    }

    /// Whether `epoch` is still the current extraction epoch.
    pub fn extraction_epoch_current(&self, conversation_id: &str, epoch: u64) -> bool {
        self.extraction_epochs.lock().get(conversation_id).copied() == Some(epoch)
    }

    pub fn is_halted(&self) -> bool {
        self.halt.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_decrements_on_success() {
        let b = CircuitBreaker::new();
        for _ in 0..4 {
            assert!(!b.record_failure());
        }
        assert_eq!(b.failures(), 4);
        assert!(!b.is_tripped());
        // One success after four failures leaves the counter at 3.
        b.record_success();
        assert_eq!(b.failures(), 3);

        // Two more failures reach the threshold and latch the trip.
        assert!(!b.record_failure());
        assert!(b.record_failure());
        assert!(b.is_tripped());
        // The latch does not clear on success.
        b.record_success();
        assert!(b.is_tripped());
    }

    #[test]
    fn test_extraction_epochs() {
        let state =
            EngineState::new(test_config()).expect("state");
        let e1 = state.bump_extraction_epoch("c1");
        assert!(state.extraction_epoch_current("c1", e1));
        let e2 = state.bump_extraction_epoch("c1");
        assert!(!state.extraction_epoch_current("c1", e1));
        assert!(state.extraction_epoch_current("c1", e2));
    }

    fn test_config() -> EngineConfig {
        let dir = std::env::temp_dir().join(format!("hearth-test-{}", uuid::Uuid::new_v4()));
        EngineConfig { data_dir: dir, ..EngineConfig::default() }
    }
}

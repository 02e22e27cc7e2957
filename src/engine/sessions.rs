// Hearth Agent Engine — Session Store
//
// Durable per-conversation state: an append-only JSONL file per conversation
// plus an in-memory mirror. Each line is one record — a turn (flat text pair
// or full structured message sequence) or a compaction. After any successful
// write the on-disk stream replays back to exactly the in-memory state.
//
// The engine serializes turns per conversation, so the store itself only
// guards its map with a mutex; file writes for one conversation never race.

use crate::atoms::error::EngineResult;
use crate::engine::types::*;
use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Name stamped on the compaction sentinel message.
pub const COMPACTION_SENTINEL: &str = "session_compaction";

/// How many recent turns' tool lists are retained for sticky selection.
const RECENT_TOOLS_KEPT: usize = 10;

/// One line of a session file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum SessionRecord {
    Turn {
        at: DateTime<Utc>,
        user: String,
        assistant: String,
        #[serde(default)]
        tools_used: Vec<String>,
        #[serde(default)]
        prompt_tokens: u64,
        #[serde(default)]
        completion_tokens: u64,
        /// Full structured sequence for tool-using turns; absent for flat
        /// text pairs.
        #[serde(skip_serializing_if = "Option::is_none")]
        messages: Option<Vec<Message>>,
    },
    Compaction {
        at: DateTime<Utc>,
        summary: String,
        /// The verbatim tail kept alongside the summary.
        retained: Vec<Message>,
        replaced: usize,
    },
}

/// In-memory session state, reconstructed from the record stream on miss.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub conversation_id: String,
    pub messages: Vec<Message>,
    pub summary: Option<String>,
    /// Tools used per turn, oldest first, bounded to the last few turns.
    pub recent_tools: Vec<Vec<String>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub last_extraction: Option<DateTime<Utc>>,
}

impl Session {
    /// Total text length of the log — the compaction trigger metric.
    pub fn total_text_len(&self) -> usize {
        self.messages.iter().map(|m| m.content.len()).sum()
    }
}

/// A turn as the engine hands it over for persistence.
#[derive(Debug, Clone)]
pub struct TurnWrite {
    pub user: String,
    pub assistant: String,
    pub tools_used: Vec<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Structured sequence (user + assistant tool-calls + tool results +
    /// assistant text) for tool-using turns.
    pub messages: Option<Vec<Message>>,
}

pub struct SessionStore {
    dir: PathBuf,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn open(dir: PathBuf) -> EngineResult<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(SessionStore { dir, sessions: Mutex::new(HashMap::new()) })
    }

    fn file_path(&self, conversation_id: &str) -> PathBuf {
        // Conversation ids come from external channels — keep filenames tame.
        let safe: String = conversation_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.jsonl"))
    }

    /// Load a session, reading the record stream on miss. A missing file
    /// yields an empty session.
    pub fn load(&self, conversation_id: &str) -> Session {
        let mut map = self.sessions.lock();
        if let Some(s) = map.get(conversation_id) {
            return s.clone();
        }
        let session = self.replay(conversation_id);
        map.insert(conversation_id.to_string(), session.clone());
        session
    }

    fn replay(&self, conversation_id: &str) -> Session {
        let mut session =
            Session { conversation_id: conversation_id.to_string(), ..Default::default() };

        let raw = match std::fs::read_to_string(self.file_path(conversation_id)) {
            Ok(raw) => raw,
            Err(_) => return session,
        };

        for (lineno, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<SessionRecord>(line) {
                Ok(record) => apply_record(&mut session, record),
                Err(e) => {
                    warn!(
                        "[sessions] {}: skipping unreadable record at line {}: {}",
                        conversation_id,
                        lineno + 1,
                        e
                    );
                }
            }
        }

        session.recent_tools = session
            .recent_tools
            .split_off(session.recent_tools.len().saturating_sub(RECENT_TOOLS_KEPT));
        session
    }

    /// Append one turn: write the record, then update the mirror.
    pub fn save_turn(&self, conversation_id: &str, turn: TurnWrite) -> EngineResult<()> {
        // Make sure the mirror exists before mutating it.
        self.load(conversation_id);

        let record = SessionRecord::Turn {
            at: Utc::now(),
            user: turn.user.clone(),
            assistant: turn.assistant.clone(),
            tools_used: turn.tools_used.clone(),
            prompt_tokens: turn.prompt_tokens,
            completion_tokens: turn.completion_tokens,
            messages: turn.messages.clone(),
        };
        self.append_record(conversation_id, &record)?;

        let mut map = self.sessions.lock();
        let session = map.entry(conversation_id.to_string()).or_default();
        apply_record(session, record);
        if session.recent_tools.len() > RECENT_TOOLS_KEPT {
            let drop = session.recent_tools.len() - RECENT_TOOLS_KEPT;
            session.recent_tools.drain(..drop);
        }
        Ok(())
    }

    /// True when the log has outgrown the compaction threshold.
    pub fn should_compact(&self, conversation_id: &str, threshold_chars: usize) -> bool {
        self.load(conversation_id).total_text_len() > threshold_chars
    }

    /// Apply a finished compaction: replace the in-memory log with the
    /// sentinel + retained tail and append the compaction record.
    pub fn apply_compaction(
        &self,
        conversation_id: &str,
        summary: &str,
        retained: Vec<Message>,
        replaced: usize,
    ) -> EngineResult<()> {
        let record = SessionRecord::Compaction {
            at: Utc::now(),
            summary: summary.to_string(),
            retained,
            replaced,
        };
        self.append_record(conversation_id, &record)?;

        let mut map = self.sessions.lock();
        let session = map.entry(conversation_id.to_string()).or_default();
        session.conversation_id = conversation_id.to_string();
        apply_record(session, record);
        info!(
            "[sessions] {}: compacted {} message(s), {} retained",
            conversation_id,
            replaced,
            session.messages.len().saturating_sub(1)
        );
        Ok(())
    }

    /// Stamp the last-extraction time (idle fact extraction bookkeeping).
    pub fn mark_extracted(&self, conversation_id: &str) {
        let mut map = self.sessions.lock();
        if let Some(s) = map.get_mut(conversation_id) {
            s.last_extraction = Some(Utc::now());
        }
    }

    /// Delete per-conversation files untouched for longer than `max_age_days`.
    pub fn cleanup(&self, max_age_days: i64) -> EngineResult<usize> {
        let cutoff = std::time::SystemTime::now()
            - std::time::Duration::from_secs((max_age_days.max(0) as u64) * 86_400);
        let mut removed = 0usize;

        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let modified = entry.metadata().and_then(|m| m.modified());
            if let Ok(modified) = modified {
                if modified < cutoff {
                    if std::fs::remove_file(&path).is_ok() {
                        removed += 1;
                        self.evict_for_path(&path);
                    }
                }
            }
        }

        if removed > 0 {
            info!("[sessions] Cleanup removed {} stale session file(s)", removed);
        }
        Ok(removed)
    }

    fn evict_for_path(&self, path: &Path) {
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { return };
        let mut map = self.sessions.lock();
        map.retain(|id, _| self.file_path(id).file_stem().and_then(|s| s.to_str()) != Some(stem));
    }

    fn append_record(&self, conversation_id: &str, record: &SessionRecord) -> EngineResult<()> {
        let path = self.file_path(conversation_id);
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        file.write_all(&line)?;
        Ok(())
    }
}

/// Fold one record into a session — the single definition of how the record
/// stream maps to state, used by both replay and live writes.
fn apply_record(session: &mut Session, record: SessionRecord) {
    match record {
        SessionRecord::Turn { at, user, assistant, tools_used, messages, .. } => {
            match messages {
                Some(seq) => session.messages.extend(seq),
                None => {
                    session.messages.push(Message::user(user));
                    session.messages.push(Message::assistant(assistant));
                }
            }
            session.recent_tools.push(tools_used);
            session.last_activity = Some(at);
        }
        SessionRecord::Compaction { at, summary, retained, .. } => {
            let mut log = vec![sentinel_message(&summary)];
            log.extend(retained);
            session.messages = log;
            session.summary = Some(summary);
            session.last_activity = Some(at);
        }
    }
}

/// The single summary item that supersedes everything it summarized.
pub fn sentinel_message(summary: &str) -> Message {
    Message {
        role: Role::System,
        content: format!("[Session Summary]\n{summary}"),
        tool_calls: None,
        tool_call_id: None,
        name: Some(COMPACTION_SENTINEL.to_string()),
    }
}

// Hearth Agent Engine — Playbook Registry
//
// Playbooks are keyword-triggered guidance: when a user message matches a
// playbook's keywords, its instructions join the system prompt and its
// required tools join the selection. They live in the memory collaborator
// as keyword-triggered skills; this registry caches them on a short TTL and
// re-seeds the built-in defaults on boot.
//
// Seeding never deletes user-created playbooks; defaults are created when
// absent and updated in place when their seed content changed (detected by
// a content hash over instructions, keywords, description, required tools,
// and max steps).

use crate::atoms::error::EngineResult;
use crate::engine::memory;
use crate::engine::orchestrator::ToolHost;
use crate::engine::trace::TraceContext;
use crate::engine::types::*;
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

/// How long a cached playbook list stays fresh.
const CACHE_TTL: Duration = Duration::from_secs(60);

struct CacheState {
    playbooks: Vec<Playbook>,
    fetched_at: Option<Instant>,
}

pub struct PlaybookRegistry {
    agent_id: String,
    cache: Mutex<CacheState>,
}

impl PlaybookRegistry {
    pub fn new(agent_id: impl Into<String>) -> Self {
        PlaybookRegistry {
            agent_id: agent_id.into(),
            cache: Mutex::new(CacheState { playbooks: Vec::new(), fetched_at: None }),
        }
    }

    /// Drop the cache; the next read refetches. Called after any
    /// skill-modifying tool runs in a turn.
    pub fn invalidate(&self) {
        self.cache.lock().fetched_at = None;
    }

    /// Current playbooks, refreshing from the memory collaborator when the
    /// TTL expired. An unreachable store serves the stale cache.
    pub async fn playbooks(&self, host: &dyn ToolHost, trace: &TraceContext) -> Vec<Playbook> {
        {
            let cache = self.cache.lock();
            if let Some(at) = cache.fetched_at {
                if at.elapsed() < CACHE_TTL {
                    return cache.playbooks.clone();
                }
            }
        }

        match memory::list_skills(host, &self.agent_id, Some(true), Some(TriggerKind::Keyword), trace)
            .await
        {
            Ok(skills) => {
                let playbooks: Vec<Playbook> = skills.iter().map(as_playbook).collect();
                let mut cache = self.cache.lock();
                cache.playbooks = playbooks.clone();
                cache.fetched_at = Some(Instant::now());
                playbooks
            }
            Err(e) => {
                warn!("[playbooks] Refresh failed, serving stale cache: {}", e);
                self.cache.lock().playbooks.clone()
            }
        }
    }

    /// Playbooks matching the message, ordered by priority descending with
    /// name ascending as the stable secondary key.
    pub async fn match_message(
        &self,
        host: &dyn ToolHost,
        message: &str,
        trace: &TraceContext,
    ) -> Vec<Playbook> {
        let mut matched: Vec<Playbook> = self
            .playbooks(host, trace)
            .await
            .into_iter()
            .filter(|p| playbook_matches(p, message))
            .collect();
        matched.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.name.cmp(&b.name)));
        matched
    }

    /// Seed the built-in defaults: create absent ones, update in place when
    /// the seed content changed, leave user-created playbooks alone.
    /// Returns (created, updated).
    pub async fn seed_defaults(
        &self,
        host: &dyn ToolHost,
        trace: &TraceContext,
    ) -> EngineResult<(usize, usize)> {
        let existing =
            memory::list_skills(host, &self.agent_id, None, Some(TriggerKind::Keyword), trace)
                .await?;

        let mut created = 0usize;
        let mut updated = 0usize;
        for seed in default_playbooks() {
            match existing.iter().find(|s| s.name == seed.name) {
                None => {
                    memory::store_skill(host, &self.agent_id, &seed, trace).await?;
                    created += 1;
                }
                Some(current) if seed_hash(current) != seed_hash(&seed) => {
                    // Preserve run bookkeeping; only the seeded content moves.
                    let mut next = current.clone();
                    next.description = seed.description.clone();
                    next.instructions = seed.instructions.clone();
                    next.required_tools = seed.required_tools.clone();
                    next.max_steps = seed.max_steps;
                    next.trigger_config.keywords = seed.trigger_config.keywords.clone();
                    next.trigger_config.priority = seed.trigger_config.priority;
                    memory::update_skill(host, &self.agent_id, &next, trace).await?;
                    updated += 1;
                }
                Some(_) => {}
            }
        }

        if created + updated > 0 {
            info!("[playbooks] Seeded defaults: {} created, {} updated", created, updated);
        }
        self.invalidate();
        Ok((created, updated))
    }
}

/// Case-insensitive substring match over any keyword.
pub fn playbook_matches(playbook: &Playbook, message: &str) -> bool {
    let message = message.to_lowercase();
    playbook.keywords.iter().any(|k| !k.is_empty() && message.contains(&k.to_lowercase()))
}

/// The keyword-triggered view of a skill record.
pub fn as_playbook(skill: &SkillRecord) -> Playbook {
    Playbook {
        name: skill.name.clone(),
        description: skill.description.clone(),
        keywords: skill.trigger_config.keywords.clone(),
        priority: skill.trigger_config.priority,
        instructions: skill.instructions.clone(),
        required_tools: skill.required_tools.clone(),
        max_steps: skill.max_steps,
        notify_on_completion: skill.notify_on_completion,
    }
}

/// Content hash over the seeded fields only — bookkeeping fields never make
/// a default look "changed".
fn seed_hash(skill: &SkillRecord) -> u64 {
    let mut h = DefaultHasher::new();
    skill.description.hash(&mut h);
    skill.instructions.hash(&mut h);
    skill.required_tools.hash(&mut h);
    skill.max_steps.hash(&mut h);
    skill.trigger_config.keywords.hash(&mut h);
    skill.trigger_config.priority.hash(&mut h);
    h.finish()
}

fn keyword_skill(
    name: &str,
    description: &str,
    keywords: &[&str],
    priority: i32,
    instructions: &str,
    required_tools: &[&str],
    max_steps: u32,
) -> SkillRecord {
    SkillRecord {
        name: name.into(),
        description: description.into(),
        instructions: instructions.into(),
        trigger_kind: TriggerKind::Keyword,
        trigger_config: TriggerConfig {
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            priority,
            ..Default::default()
        },
        required_tools: required_tools.iter().map(|t| t.to_string()).collect(),
        max_steps,
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
    }
}

/// Built-in default playbooks, seeded on first boot.
pub fn default_playbooks() -> Vec<SkillRecord> {
    vec![
        keyword_skill(
            "email-triage",
            "Summarize and prioritize the inbox when the user asks about email.",
            &["email", "inbox", "unread"],
            10,
            "When the user asks about their email: list recent unread messages with \
             gmail_read, group them by sender and urgency, and answer with a short \
             prioritized summary. Never send mail unless explicitly asked; when asked, \
             confirm the recipient and subject in your reply.",
            &["gmail_read", "gmail_send"],
            6,
        ),
        keyword_skill(
            "meeting-prep",
            "Pull today's calendar and brief the user before meetings.",
            &["meeting", "calendar", "agenda"],
            8,
            "When the user asks about meetings or their calendar: fetch today's events \
             with calendar_list, then for each upcoming event give the time (user's \
             timezone), attendees, and anything relevant from stored facts. Keep it to \
             one line per event.",
            &["calendar_list"],
            6,
        ),
        keyword_skill(
            "research-note",
            "Search the web and store durable findings as facts.",
            &["research", "look up", "find out"],
            5,
            "When the user asks you to research something: run web_search, read the \
             best results, answer concisely with sources, and store durable findings \
             with store_fact so they are available in later conversations.",
            &["web_search", "store_fact"],
            8,
        ),
    ]
}

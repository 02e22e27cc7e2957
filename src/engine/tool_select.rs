// Hearth Agent Engine — Tool Selector
//
// Returns a bounded tool subset for one user message. Selection order:
// core tools, embedding scores (top-N unconditional, then threshold up to
// top-K), regex keyword fallback when the index is down, playbook-required
// tools, sticky tools from recent turns, then the overall cap. Core,
// playbook, and sticky tools survive the cap; everything returned is
// guaranteed to exist in the current catalog.

use crate::atoms::constants::CORE_TOOLS;
use crate::engine::types::ToolDescriptor;
use log::info;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

/// Selector tunables, lifted out of EngineConfig so the selector stays a
/// pure function over its inputs.
#[derive(Debug, Clone)]
pub struct SelectorLimits {
    pub top_k: usize,
    pub min_tools: usize,
    pub similarity_threshold: f64,
    pub max_tools: usize,
    pub sticky_lookback: usize,
    pub sticky_max: usize,
}

impl Default for SelectorLimits {
    fn default() -> Self {
        SelectorLimits {
            top_k: 15,
            min_tools: 5,
            similarity_threshold: 0.3,
            max_tools: 25,
            sticky_lookback: 3,
            sticky_max: 8,
        }
    }
}

/// Everything a selection decision depends on. Identical inputs produce an
/// identical selection.
pub struct SelectionInput<'a> {
    pub catalog: &'a [ToolDescriptor],
    pub message: &'a str,
    /// Embedding scores per tool name; None when the index is uninitialized
    /// or scoring failed (triggers the keyword fallback).
    pub scores: Option<&'a HashMap<String, f64>>,
    /// Required tools of every playbook matching the message.
    pub playbook_tools: &'a [String],
    /// Tools used per recent turn, most recent last.
    pub recent_tools: &'a [Vec<String>],
}

/// Selection result: ordered tool names plus the best embedding score
/// (drives the temperature clamp upstream).
#[derive(Debug, Clone)]
pub struct Selection {
    pub tools: Vec<String>,
    pub top_score: f64,
}

// ── Tool groups ────────────────────────────────────────────────────────

/// Map a tool name to its group. The fallback matcher and the sticky
/// sibling expansion both work over this closed mapping.
pub fn tool_group(name: &str) -> &'static str {
    match name {
        n if n.starts_with("gmail_") || n.contains("email") => "email",
        n if n.starts_with("calendar_") => "calendar",
        "web_search" | "search_web" | "web_fetch" | "fetch_url" => "web",
        n if n.starts_with("file_") || n == "read_file" || n == "write_file" || n == "list_files" => "files",
        n if n.starts_with("slack_") || n.starts_with("telegram_") || n == "send_message" => "messaging",
        n if n.contains("memor") || n.contains("fact") => "memory",
        n if n.contains("skill") => "skills",
        n if n.starts_with("task_") || n.contains("reminder") => "tasks",
        n if n.starts_with("contact") => "contacts",
        n if n.starts_with("github_") => "github",
        n if n.starts_with("status") || n.starts_with("spawn_") => "meta",
        _ => "other",
    }
}

/// Keyword fallback rules: message pattern → tool group.
/// Applied only when embedding scores are unavailable.
const FALLBACK_RULES: &[(&str, &str)] = &[
    (r"(?i)\b(email|e-mail|mail|inbox|gmail)\b", "email"),
    (r"(?i)\b(calendar|meeting|schedule|appointment|event)\b", "calendar"),
    (r"(?i)\b(search|look up|look something up|google|news|weather)\b", "web"),
    (r"(?i)\b(file|document|folder|attachment)\b", "files"),
    (r"(?i)\b(slack|telegram|message|text me|notify)\b", "messaging"),
    (r"(?i)\b(remember|memory|recall|forget|note down)\b", "memory"),
    (r"(?i)\b(skill|automation|recurring|every day|remind)\b", "skills"),
    (r"(?i)\b(task|todo|reminder)\b", "tasks"),
    (r"(?i)\b(contact|phone number|address book)\b", "contacts"),
    (r"(?i)\b(github|issue|pull request|repo)\b", "github"),
];

fn compiled_rules() -> &'static [(Regex, &'static str)] {
    static RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RULES.get_or_init(|| {
        FALLBACK_RULES
            .iter()
            .filter_map(|(pattern, group)| Regex::new(pattern).ok().map(|re| (re, *group)))
            .collect()
    })
}

/// Groups whose keyword patterns match the message.
fn fallback_groups(message: &str) -> HashSet<&'static str> {
    compiled_rules()
        .iter()
        .filter(|(re, _)| re.is_match(message))
        .map(|(_, group)| *group)
        .collect()
}

// ── Selection ──────────────────────────────────────────────────────────

/// Run the full selection protocol. Deterministic for identical inputs.
pub fn select_tools(limits: &SelectorLimits, input: &SelectionInput<'_>) -> Selection {
    let catalog_names: HashSet<&str> = input.catalog.iter().map(|t| t.name.as_str()).collect();
    if catalog_names.is_empty() {
        return Selection { tools: Vec::new(), top_score: 0.0 };
    }

    let mut selected: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut push = |name: &str, selected: &mut Vec<String>, seen: &mut HashSet<String>| {
        if catalog_names.contains(name) && seen.insert(name.to_string()) {
            selected.push(name.to_string());
        }
    };

    // ── 1. Core tools (always present when catalogued) ─────────────────
    for &core in CORE_TOOLS {
        push(core, &mut selected, &mut seen);
    }
    let core_set: HashSet<String> = selected.iter().cloned().collect();

    // ── 2/3. Scored selection, or keyword fallback ─────────────────────
    let mut top_score = 0.0f64;
    match input.scores {
        Some(scores) => {
            let mut ranked: Vec<(&str, f64)> = input
                .catalog
                .iter()
                .filter_map(|t| scores.get(&t.name).map(|s| (t.name.as_str(), *s)))
                .collect();
            // Sort descending by score, name as the stable tiebreak.
            ranked.sort_by(|a, b| {
                b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(b.0))
            });
            top_score = ranked.first().map(|(_, s)| *s).unwrap_or(0.0);

            let mut taken = 0usize;
            for &(name, score) in &ranked {
                if taken >= limits.top_k {
                    break;
                }
                let unconditional = taken < limits.min_tools;
                if unconditional || score >= limits.similarity_threshold {
                    let before = selected.len();
                    push(name, &mut selected, &mut seen);
                    if selected.len() > before {
                        taken += 1;
                    }
                } else {
                    // Ranked list is sorted: once below threshold past the
                    // unconditional prefix, nothing later qualifies.
                    break;
                }
            }
        }
        None => {
            let groups = fallback_groups(input.message);
            if !groups.is_empty() {
                // Deterministic: walk the catalog in order.
                for tool in input.catalog {
                    if groups.contains(tool_group(&tool.name)) {
                        push(&tool.name, &mut selected, &mut seen);
                    }
                }
                info!(
                    "[tool-select] Keyword fallback matched {} group(s) → {} tools",
                    groups.len(),
                    selected.len()
                );
            }
        }
    }

    // ── 4. Playbook-required tools (bypass the cap) ────────────────────
    let mut playbook_set: HashSet<String> = HashSet::new();
    for name in input.playbook_tools {
        if catalog_names.contains(name.as_str()) {
            playbook_set.insert(name.clone());
            push(name, &mut selected, &mut seen);
        }
    }

    // ── 5. Sticky tools from recent turns (bypass the cap) ─────────────
    let sticky = sticky_tools(limits, input.recent_tools, input.catalog, &core_set);
    let sticky_set: HashSet<String> = sticky.iter().cloned().collect();
    for name in &sticky {
        push(name, &mut selected, &mut seen);
    }

    // ── 6. Overall cap: drop lowest-scoring unprotected tools first ────
    if selected.len() > limits.max_tools {
        let over = selected.len() - limits.max_tools;
        let score_of = |name: &str| -> f64 {
            input.scores.and_then(|s| s.get(name)).copied().unwrap_or(0.0)
        };
        let mut droppable: Vec<(String, f64)> = selected
            .iter()
            .filter(|n| {
                !core_set.contains(*n) && !playbook_set.contains(*n) && !sticky_set.contains(*n)
            })
            .map(|n| (n.clone(), score_of(n)))
            .collect();
        droppable.sort_by(|a, b| {
            a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal).then(b.0.cmp(&a.0))
        });
        let drop_set: HashSet<String> = droppable.into_iter().take(over).map(|(n, _)| n).collect();
        selected.retain(|n| !drop_set.contains(n));
    }

    Selection { tools: selected, top_score }
}

/// Collect sticky tools: non-core tools used in the last `sticky_lookback`
/// turns, expanded to their group siblings in the catalog, capped at
/// `sticky_max`. Originals keep priority over siblings.
fn sticky_tools(
    limits: &SelectorLimits,
    recent_tools: &[Vec<String>],
    catalog: &[ToolDescriptor],
    core_set: &HashSet<String>,
) -> Vec<String> {
    let lookback = recent_tools.len().saturating_sub(limits.sticky_lookback);
    let mut originals: Vec<String> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for turn in &recent_tools[lookback..] {
        for name in turn {
            if !core_set.contains(name) && seen.insert(name.as_str()) {
                originals.push(name.clone());
            }
        }
    }
    if originals.is_empty() {
        return originals;
    }

    let groups: HashSet<&'static str> =
        originals.iter().map(|n| tool_group(n)).filter(|g| *g != "other").collect();

    let mut out = originals.clone();
    for tool in catalog {
        if out.len() >= limits.sticky_max {
            break;
        }
        if groups.contains(tool_group(&tool.name))
            && !core_set.contains(&tool.name)
            && !out.contains(&tool.name)
        {
            out.push(tool.name.clone());
        }
    }
    out.truncate(limits.sticky_max);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog(names: &[&str]) -> Vec<ToolDescriptor> {
        names
            .iter()
            .map(|n| ToolDescriptor {
                name: n.to_string(),
                description: format!("{} tool", n),
                parameters: serde_json::json!({"type": "object", "properties": {}}),
            })
            .collect()
    }

    fn big_catalog() -> Vec<ToolDescriptor> {
        let mut names: Vec<String> = vec![
            "send_message".into(),
            "store_fact".into(),
            "search_memories".into(),
            "status".into(),
            "spawn_subagent".into(),
            "gmail_send".into(),
            "gmail_read".into(),
            "calendar_list".into(),
            "calendar_create".into(),
            "web_search".into(),
        ];
        for i in 0..30 {
            names.push(format!("misc_tool_{i}"));
        }
        catalog(&names.iter().map(|s| s.as_str()).collect::<Vec<_>>())
    }

    #[test]
    fn test_core_tools_survive_cap() {
        // Scenario: 40 tools, unrelated message, cap 25 — all five core
        // tools present, total within the cap.
        let cat = big_catalog();
        let scores: HashMap<String, f64> =
            cat.iter().enumerate().map(|(i, t)| (t.name.clone(), 0.9 - i as f64 * 0.01)).collect();
        let limits = SelectorLimits::default();
        let sel = select_tools(
            &limits,
            &SelectionInput {
                catalog: &cat,
                message: "hello",
                scores: Some(&scores),
                playbook_tools: &[],
                recent_tools: &[],
            },
        );
        for core in CORE_TOOLS {
            assert!(sel.tools.iter().any(|t| t == core), "missing core tool {core}");
        }
        assert!(sel.tools.len() <= limits.max_tools);
    }

    #[test]
    fn test_empty_catalog_returns_empty() {
        let sel = select_tools(
            &SelectorLimits::default(),
            &SelectionInput {
                catalog: &[],
                message: "anything",
                scores: None,
                playbook_tools: &[],
                recent_tools: &[],
            },
        );
        assert!(sel.tools.is_empty());
    }

    #[test]
    fn test_fallback_matches_email_group() {
        let cat = catalog(&["gmail_send", "gmail_read", "web_search", "send_message"]);
        let sel = select_tools(
            &SelectorLimits::default(),
            &SelectionInput {
                catalog: &cat,
                message: "can you check my email inbox?",
                scores: None,
                playbook_tools: &[],
                recent_tools: &[],
            },
        );
        assert!(sel.tools.contains(&"gmail_send".to_string()));
        assert!(sel.tools.contains(&"gmail_read".to_string()));
        assert!(!sel.tools.contains(&"web_search".to_string()));
    }

    #[test]
    fn test_fallback_without_match_yields_core_only() {
        let cat = catalog(&["send_message", "gmail_send", "misc_tool"]);
        let sel = select_tools(
            &SelectorLimits::default(),
            &SelectionInput {
                catalog: &cat,
                message: "zzzz qqqq",
                scores: None,
                playbook_tools: &[],
                recent_tools: &[],
            },
        );
        assert_eq!(sel.tools, vec!["send_message".to_string()]);
    }

    #[test]
    fn test_threshold_and_min_tools() {
        let cat = catalog(&["a_tool", "b_tool", "c_tool", "d_tool", "e_tool", "f_tool", "g_tool"]);
        let mut scores = HashMap::new();
        for (i, t) in cat.iter().enumerate() {
            // a..e get 0.05, f/g get 0.8 — min_tools=2 forces two in even
            // below threshold; threshold admits only the high scorers.
            let s = if i >= 5 { 0.8 } else { 0.05 };
            scores.insert(t.name.clone(), s);
        }
        let limits = SelectorLimits { min_tools: 2, top_k: 4, ..Default::default() };
        let sel = select_tools(
            &limits,
            &SelectionInput {
                catalog: &cat,
                message: "hi",
                scores: Some(&scores),
                playbook_tools: &[],
                recent_tools: &[],
            },
        );
        // High scorers taken unconditionally (top of ranking), then nothing
        // below threshold beyond the min_tools prefix.
        assert!(sel.tools.contains(&"f_tool".to_string()));
        assert!(sel.tools.contains(&"g_tool".to_string()));
        assert_eq!(sel.tools.iter().filter(|t| t.ends_with("_tool")).count(), 2);
        assert!((sel.top_score - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_playbook_and_sticky_bypass_cap() {
        let cat = big_catalog();
        let scores: HashMap<String, f64> =
            cat.iter().map(|t| (t.name.clone(), 0.9)).collect();
        let limits = SelectorLimits { max_tools: 10, ..Default::default() };
        let playbook_tools = vec!["calendar_create".to_string()];
        let recent = vec![vec!["gmail_send".to_string()]];
        let sel = select_tools(
            &limits,
            &SelectionInput {
                catalog: &cat,
                message: "hello",
                scores: Some(&scores),
                playbook_tools: &playbook_tools,
                recent_tools: &recent,
            },
        );
        assert!(sel.tools.len() <= limits.max_tools.max(
            CORE_TOOLS.len() + playbook_tools.len() + limits.sticky_max
        ));
        assert!(sel.tools.contains(&"calendar_create".to_string()));
        assert!(sel.tools.contains(&"gmail_send".to_string()));
        for core in CORE_TOOLS {
            assert!(sel.tools.iter().any(|t| t == core));
        }
    }

    #[test]
    fn test_sticky_expands_to_siblings() {
        let cat = catalog(&["gmail_send", "gmail_read", "web_search"]);
        let limits = SelectorLimits::default();
        let recent = vec![vec!["gmail_send".to_string()]];
        let sticky = sticky_tools(&limits, &recent, &cat, &HashSet::new());
        assert!(sticky.contains(&"gmail_send".to_string()));
        assert!(sticky.contains(&"gmail_read".to_string()));
        assert!(!sticky.contains(&"web_search".to_string()));
    }

    #[test]
    fn test_selection_is_deterministic() {
        let cat = big_catalog();
        let scores: HashMap<String, f64> =
            cat.iter().enumerate().map(|(i, t)| (t.name.clone(), (i % 7) as f64 / 7.0)).collect();
        let limits = SelectorLimits::default();
        let input = SelectionInput {
            catalog: &cat,
            message: "check my calendar",
            scores: Some(&scores),
            playbook_tools: &[],
            recent_tools: &[],
        };
        let a = select_tools(&limits, &input);
        let b = select_tools(&limits, &input);
        assert_eq!(a.tools, b.tools);
    }

    #[test]
    fn test_never_emits_uncatalogued_names() {
        let cat = catalog(&["send_message", "gmail_send"]);
        let playbook_tools = vec!["ghost_tool".to_string()];
        let recent = vec![vec!["departed_tool".to_string()]];
        let sel = select_tools(
            &SelectorLimits::default(),
            &SelectionInput {
                catalog: &cat,
                message: "email time",
                scores: None,
                playbook_tools: &playbook_tools,
                recent_tools: &recent,
            },
        );
        for name in &sel.tools {
            assert!(cat.iter().any(|t| &t.name == name), "uncatalogued {name}");
        }
    }
}

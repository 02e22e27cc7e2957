// Hearth Agent Engine — Skill Scheduler
//
// A once-per-minute heartbeat: auto-enable skills whose tools appeared,
// probe critical collaborators, evaluate which cron/interval/one-shot
// skills are due, and dispatch them into the engine's proactive path.
// The tick runs as a singleton — two ticks never overlap.
//
// Additional scheduled jobs ride the same heartbeat on internal cron
// expressions: daily session cleanup, the weekly fact synthesis, and the
// six-hourly health report.

use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::agent_loop::ConversationEngine;
use crate::engine::memory;
use crate::engine::trace::TraceContext;
use crate::engine::types::*;
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Internal job schedules (agent timezone).
const CLEANUP_SCHEDULE: &str = "15 3 * * *";
const SYNTHESIS_SCHEDULE: &str = "0 3 * * SUN";
const HEALTH_REPORT_SCHEDULE: &str = "0 */6 * * *";

/// What one tick did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub checked: usize,
    pub executed: usize,
    pub halted: bool,
}

/// Why a skill does or does not run this tick.
#[derive(Debug, Clone, PartialEq)]
pub enum SkillDecision {
    Due,
    NotDue,
    /// Expired or exhausted — disable and skip.
    Expire(&'static str),
    /// Temporarily skipped (cooldown, double-fire guard…).
    Skip(&'static str),
}

/// Spawn the heartbeat loop. Singleton; the returned handle aborts it.
pub fn spawn_heartbeat(engine: Arc<ConversationEngine>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!("[heartbeat] Skill heartbeat started (60s interval)");
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let report = run_tick(&engine, Utc::now()).await;
            if report.halted {
                continue;
            }
            if report.executed > 0 {
                info!(
                    "[heartbeat] Tick: {} skill(s) checked, {} executed",
                    report.checked, report.executed
                );
            }
        }
    })
}

/// One scheduler tick at `now`.
pub async fn run_tick(engine: &Arc<ConversationEngine>, now: DateTime<Utc>) -> TickReport {
    if engine.state.is_halted() {
        return TickReport { halted: true, ..Default::default() };
    }

    let trace = TraceContext::new();
    let tz = engine.state.config.timezone;

    // Keep the catalog warm for auto-enable and pre-flight gates.
    engine.refresh_catalog_if_stale().await;

    auto_enable_sweep(engine, &trace).await;
    health_probe_sweep(engine, &trace).await;

    // Internal jobs share the cron machinery.
    if cron_due(CLEANUP_SCHEDULE, tz, now).unwrap_or(false) {
        if let Err(e) = engine.state.sessions.cleanup(engine.state.config.session_max_age_days) {
            warn!("[heartbeat] Session cleanup failed: {}", e);
        }
    }
    if cron_due(SYNTHESIS_SCHEDULE, tz, now).unwrap_or(false) {
        run_weekly_synthesis(engine, &trace).await;
    }
    if cron_due(HEALTH_REPORT_SCHEDULE, tz, now).unwrap_or(false) {
        run_health_report(engine, &trace).await;
    }

    // ── Due evaluation ─────────────────────────────────────────────────
    let skills = match memory::list_skills(
        engine.host.as_ref(),
        &engine.state.config.agent_id,
        Some(true),
        None,
        &trace,
    )
    .await
    {
        Ok(skills) => skills,
        Err(e) => {
            warn!("[heartbeat] Could not list skills: {}", e);
            return TickReport::default();
        }
    };

    let mut report = TickReport::default();
    for skill in skills.iter().filter(|s| s.trigger_kind != TriggerKind::Keyword) {
        report.checked += 1;

        match evaluate_skill(skill, now, tz, engine.state.config.skill_cooldown) {
            SkillDecision::NotDue => continue,
            SkillDecision::Skip(reason) => {
                info!("[heartbeat] Skipping '{}': {}", skill.name, reason);
                continue;
            }
            SkillDecision::Expire(reason) => {
                info!("[heartbeat] Disabling '{}': {}", skill.name, reason);
                let mut next = skill.clone();
                next.enabled = false;
                if let Err(e) = memory::update_skill(
                    engine.host.as_ref(),
                    &engine.state.config.agent_id,
                    &next,
                    &trace,
                )
                .await
                {
                    warn!("[heartbeat] Could not disable '{}': {}", skill.name, e);
                }
                continue;
            }
            SkillDecision::Due => {}
        }

        if !preflight_gate(engine, skill, &trace).await {
            info!("[heartbeat] Pre-flight gate held back '{}'", skill.name);
            continue;
        }

        report.executed += 1;
        execute_skill(engine, skill.clone(), now, &trace).await;
    }

    report
}

// ── Due evaluation (pure) ──────────────────────────────────────────────

/// Decide whether an enabled non-keyword skill runs this tick.
pub fn evaluate_skill(
    skill: &SkillRecord,
    now: DateTime<Utc>,
    tz: Tz,
    cooldown: Duration,
) -> SkillDecision {
    // Expiration and run budget first.
    if let Some(expires) = parse_ts(skill.expires_at.as_deref()) {
        if expires <= now {
            return SkillDecision::Expire("expired");
        }
    }
    if let Some(max_runs) = skill.max_runs {
        if skill.run_count >= max_runs {
            return SkillDecision::Expire("max runs reached");
        }
    }

    let last_run = parse_ts(skill.last_run_at.as_deref());

    // Failure cooldown. One-shots get one more attempt after the cooldown
    // elapses, then their firing logic auto-disables them.
    if skill.last_run_status == SkillRunStatus::Error {
        if let Some(last) = last_run {
            if now.signed_duration_since(last)
                < ChronoDuration::from_std(cooldown).unwrap_or(ChronoDuration::minutes(5))
            {
                return SkillDecision::Skip("failure cooldown");
            }
        }
    }

    let config = &skill.trigger_config;
    if let Some(schedule) = config.schedule.as_deref() {
        // Double-fire guard: a cron skill that already ran this minute
        // stays quiet until the next minute.
        if let Some(last) = last_run {
            if same_minute(last, now) {
                return SkillDecision::Skip("already ran this minute");
            }
        }
        return match cron_due(schedule, tz, now) {
            Ok(true) => SkillDecision::Due,
            Ok(false) => SkillDecision::NotDue,
            Err(e) => {
                warn!("[heartbeat] Bad cron '{}' on '{}': {}", schedule, skill.name, e);
                SkillDecision::Skip("unparsable cron expression")
            }
        };
    }

    // One-shot: absolute time, or minutes after creation.
    let one_shot_target = parse_ts(config.at.as_deref()).or_else(|| {
        config.in_minutes.and_then(|mins| {
            parse_ts(skill.created_at.as_deref())
                .map(|created| created + ChronoDuration::minutes(mins as i64))
        })
    });
    if let Some(target) = one_shot_target {
        // A successful one-shot never fires again (it gets disabled on
        // completion, but guard against a missed write too).
        if skill.last_run_status == SkillRunStatus::Success && last_run.is_some() {
            return SkillDecision::Expire("one-shot already fired");
        }
        return if target <= now { SkillDecision::Due } else { SkillDecision::NotDue };
    }

    // Interval (default daily).
    let interval_minutes = config.interval_minutes.unwrap_or(1440);
    match last_run {
        None => SkillDecision::Due,
        Some(last) => {
            if now.signed_duration_since(last) >= ChronoDuration::minutes(interval_minutes as i64) {
                SkillDecision::Due
            } else {
                SkillDecision::NotDue
            }
        }
    }
}

/// Evaluate a cron expression in `tz`: due when its next fire time after
/// the start of the previous minute lands in the current minute.
pub fn cron_due(expr: &str, tz: Tz, now: DateTime<Utc>) -> EngineResult<bool> {
    let schedule = parse_cron(expr)?;
    let local = now.with_timezone(&tz);
    let minute_start = local
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .ok_or_else(|| EngineError::Scheduler("time truncation failed".into()))?;
    let prev_minute = minute_start - ChronoDuration::minutes(1);

    match schedule.after(&prev_minute).next() {
        Some(next) => Ok(next >= minute_start && next < minute_start + ChronoDuration::minutes(1)),
        None => Ok(false),
    }
}

/// Parse a cron expression, accepting the 5-field form by prepending a
/// seconds field.
fn parse_cron(expr: &str) -> EngineResult<Schedule> {
    let expr = expr.trim();
    let fields = expr.split_whitespace().count();
    let normalized = if fields == 5 { format!("0 {expr}") } else { expr.to_string() };
    Schedule::from_str(&normalized)
        .map_err(|e| EngineError::Scheduler(format!("cron '{expr}': {e}")))
}

fn parse_ts(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok()).map(|t| t.with_timezone(&Utc))
}

fn same_minute(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.timestamp() / 60 == b.timestamp() / 60
}

// ── Execution ──────────────────────────────────────────────────────────

async fn execute_skill(
    engine: &Arc<ConversationEngine>,
    skill: SkillRecord,
    now: DateTime<Utc>,
    trace: &TraceContext,
) {
    info!("[heartbeat] Executing skill '{}' (trace={})", skill.name, trace.short());
    let reply = engine.run_skill(&skill, trace).await;

    let mut next = skill.clone();
    next.last_run_at = Some(now.to_rfc3339());
    next.run_count = skill.run_count + 1;
    let one_shot =
        skill.trigger_config.at.is_some() || skill.trigger_config.in_minutes.is_some();

    match &reply.error {
        None => {
            next.last_run_status = SkillRunStatus::Success;
            next.last_run_summary = Some(truncate_utf8(&reply.text, 300).to_string());
            // One-shots fire once; run budgets auto-disable.
            if one_shot {
                next.enabled = false;
            }
            if let Some(max_runs) = next.max_runs {
                if next.run_count >= max_runs {
                    next.enabled = false;
                }
            }
        }
        Some(err) => {
            error!("[heartbeat] Skill '{}' failed: {}", skill.name, err);
            next.last_run_status = SkillRunStatus::Error;
            next.last_run_summary = Some(truncate_utf8(err, 300).to_string());
            // Failed one-shots stay enabled for exactly one post-cooldown
            // retry; a failed retry ends it.
            if one_shot && skill.last_run_status == SkillRunStatus::Error {
                next.enabled = false;
            }
            notify(
                engine,
                &format!(
                    "Skill '{}' failed ({}): {} — retrying after {}s cooldown.",
                    skill.name,
                    describe_trigger(&skill),
                    truncate_utf8(err, 200),
                    engine.state.config.skill_cooldown.as_secs()
                ),
                trace,
            )
            .await;
        }
    }

    if let Err(e) =
        memory::update_skill(engine.host.as_ref(), &engine.state.config.agent_id, &next, trace).await
    {
        warn!("[heartbeat] Could not update '{}' after run: {}", skill.name, e);
    }

    if reply.paused {
        notify(
            engine,
            &format!(
                "Cost monitor paused the agent during skill '{}'. \
                 New work is on hold until resume.",
                skill.name
            ),
            trace,
        )
        .await;
    }
}

fn describe_trigger(skill: &SkillRecord) -> String {
    let c = &skill.trigger_config;
    if let Some(s) = &c.schedule {
        format!("cron {s}")
    } else if let Some(at) = &c.at {
        format!("at {at}")
    } else if let Some(m) = c.in_minutes {
        format!("in {m}m")
    } else {
        format!("every {}m", c.interval_minutes.unwrap_or(1440))
    }
}

/// Pre-flight gates keyed on skill shape: a meeting-preparation skill with
/// a calendar requirement is pointless on an empty day.
async fn preflight_gate(
    engine: &Arc<ConversationEngine>,
    skill: &SkillRecord,
    trace: &TraceContext,
) -> bool {
    let name = skill.name.to_lowercase();
    let wants_calendar = skill.required_tools.iter().any(|t| t.starts_with("calendar"));
    if wants_calendar && (name.contains("meeting") || name.contains("agenda")) {
        let args = serde_json::json!({ "when": "today" });
        match engine.host.call_tool("calendar_list", &args, trace).await {
            Ok(outcome) if outcome.success => {
                let empty = serde_json::from_str::<serde_json::Value>(&outcome.output)
                    .map(|v| v.as_array().map(|a| a.is_empty()).unwrap_or(false))
                    .unwrap_or(false);
                return !empty;
            }
            // An unreachable calendar never blocks the skill itself.
            _ => return true,
        }
    }
    true
}

// ── Auto-enable sweep ──────────────────────────────────────────────────

/// Enable disabled scheduled skills whose required tools all appeared in
/// the catalog. Skills with no required tools stay manual. Idempotent.
async fn auto_enable_sweep(engine: &Arc<ConversationEngine>, trace: &TraceContext) {
    let disabled = match memory::list_skills(
        engine.host.as_ref(),
        &engine.state.config.agent_id,
        Some(false),
        None,
        trace,
    )
    .await
    {
        Ok(skills) => skills,
        Err(_) => return,
    };

    let catalog_names: Vec<String> = engine.state.catalog.lock().names();
    for skill in disabled.iter().filter(|s| s.trigger_kind != TriggerKind::Keyword) {
        if skill.required_tools.is_empty() {
            continue;
        }
        // A one-shot that already fired stays off.
        if skill.last_run_status == SkillRunStatus::Success
            && (skill.trigger_config.at.is_some() || skill.trigger_config.in_minutes.is_some())
        {
            continue;
        }
        if skill.required_tools.iter().all(|t| catalog_names.contains(t)) {
            info!("[heartbeat] Auto-enabling '{}' — required tools present", skill.name);
            let mut next = skill.clone();
            next.enabled = true;
            if let Err(e) = memory::update_skill(
                engine.host.as_ref(),
                &engine.state.config.agent_id,
                &next,
                trace,
            )
            .await
            {
                warn!("[heartbeat] Auto-enable of '{}' failed: {}", skill.name, e);
            }
        }
    }
}

// ── Health probes ──────────────────────────────────────────────────────

/// On-disk single-shot notification state: exactly one notification per
/// down/up transition, across restarts.
#[derive(Debug, Default, Serialize, Deserialize)]
struct HealthState {
    down: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    since: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_notified: Option<DateTime<Utc>>,
}

async fn health_probe_sweep(engine: &Arc<ConversationEngine>, trace: &TraceContext) {
    let reachable = engine.embeddings.is_reachable(Duration::from_secs(3)).await;
    let path = engine.state.config.health_state_path();

    let mut state: HealthState = std::fs::read_to_string(&path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();

    if !reachable && !state.down {
        state.down = true;
        state.since = Some(Utc::now());
        state.last_notified = Some(Utc::now());
        warn!("[heartbeat] Embedding service DOWN — tool selection degrades to keywords");
        notify(
            engine,
            "Heads up: the embedding service is unreachable. Tool selection \
             falls back to keyword matching until it recovers.",
            trace,
        )
        .await;
    } else if reachable && state.down {
        let down_for = state
            .since
            .map(|s| Utc::now().signed_duration_since(s).num_minutes())
            .unwrap_or(0);
        state = HealthState { down: false, since: None, last_notified: Some(Utc::now()) };
        info!("[heartbeat] Embedding service recovered after {}m", down_for);
        notify(
            engine,
            &format!("The embedding service recovered (down ~{down_for}m)."),
            trace,
        )
        .await;
    } else {
        return; // no transition, no write
    }

    if let Err(e) =
        std::fs::write(&path, serde_json::to_vec(&state).unwrap_or_default())
    {
        warn!("[heartbeat] Could not persist health state: {}", e);
    }
}

// ── Weekly synthesis ───────────────────────────────────────────────────

async fn run_weekly_synthesis(engine: &Arc<ConversationEngine>, trace: &TraceContext) {
    info!("[heartbeat] Running weekly fact synthesis");
    let args = serde_json::json!({ "agent_id": engine.state.config.agent_id });
    match engine.host.call_tool("synthesize_facts", &args, trace).await {
        Ok(outcome) if outcome.success => {
            notify(
                engine,
                &format!("Weekly memory synthesis done: {}", truncate_utf8(&outcome.output, 300)),
                trace,
            )
            .await;
        }
        Ok(outcome) => warn!("[heartbeat] Synthesis failed: {}", outcome.output),
        Err(e) => warn!("[heartbeat] Synthesis unreachable: {}", e),
    }
}

// ── Health report ──────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
struct HealthReport {
    issues: Vec<String>,
}

async fn run_health_report(engine: &Arc<ConversationEngine>, trace: &TraceContext) {
    let mut issues: Vec<String> = Vec::new();

    if engine.host.list_tools().await.is_err() {
        issues.push("orchestrator unreachable".into());
    }
    if !engine.state.tool_index.lock().await.is_ready() {
        issues.push("tool index uninitialized (keyword fallback active)".into());
    }
    if !engine.embeddings.is_reachable(Duration::from_secs(3)).await {
        issues.push("embedding service unreachable".into());
    }
    if engine.state.cost.paused().is_some() {
        issues.push("cost monitor paused".into());
    }
    if engine.state.breaker.is_tripped() {
        issues.push("circuit breaker tripped".into());
    }

    let report = HealthReport { issues };
    let path = engine.state.config.health_report_path();
    let previous: HealthReport = std::fs::read_to_string(&path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();

    let new_issues: Vec<&String> =
        report.issues.iter().filter(|i| !previous.issues.contains(i)).collect();
    let resolved: Vec<&String> =
        previous.issues.iter().filter(|i| !report.issues.contains(i)).collect();

    if !new_issues.is_empty() || !resolved.is_empty() {
        let mut lines = Vec::new();
        for issue in &new_issues {
            lines.push(format!("new: {issue}"));
        }
        for issue in &resolved {
            lines.push(format!("resolved: {issue}"));
        }
        notify(engine, &format!("Health report changed:\n{}", lines.join("\n")), trace).await;
    }

    if let Err(e) = std::fs::write(&path, serde_json::to_vec(&report).unwrap_or_default()) {
        warn!("[heartbeat] Could not persist health report: {}", e);
    }
}

// ── Conversation backfill ──────────────────────────────────────────────

/// Paginated extraction of facts from unprocessed historical conversations.
/// Batches of 10 with a 3s inter-batch sleep; re-checks the halt flag
/// between batches.
pub async fn backfill_conversations(
    engine: &Arc<ConversationEngine>,
    trace: &TraceContext,
) -> EngineResult<usize> {
    let mut total = 0usize;
    loop {
        if engine.state.is_halted() {
            info!("[heartbeat] Backfill halted after {} conversation(s)", total);
            return Ok(total);
        }

        let args =
            serde_json::json!({ "agent_id": engine.state.config.agent_id, "batch": 10 });
        let outcome = engine.host.call_tool("extract_conversation_facts", &args, trace).await?;
        if !outcome.success {
            return Err(format!("backfill batch failed: {}", outcome.output).into());
        }

        let v: serde_json::Value = serde_json::from_str(&outcome.output).unwrap_or_default();
        let processed = v["processed"].as_u64().unwrap_or(0) as usize;
        let remaining = v["remaining"].as_u64().unwrap_or(0) as usize;
        total += processed;
        info!("[heartbeat] Backfill: {} processed, {} remaining", total, remaining);

        if processed == 0 || remaining == 0 {
            return Ok(total);
        }
        tokio::time::sleep(Duration::from_secs(3)).await;
    }
}

// ── Notifications ──────────────────────────────────────────────────────

async fn notify(engine: &Arc<ConversationEngine>, text: &str, trace: &TraceContext) {
    let args = serde_json::json!({ "text": text });
    if let Err(e) = engine.host.call_tool("send_message", &args, trace).await {
        warn!("[heartbeat] Notification failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cron_skill(schedule: &str) -> SkillRecord {
        SkillRecord {
            name: "morning-brief".into(),
            description: "daily briefing".into(),
            instructions: "brief the user".into(),
            trigger_kind: TriggerKind::Cron,
            trigger_config: TriggerConfig { schedule: Some(schedule.into()), ..Default::default() },
            required_tools: vec![],
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
        }
    }

    fn warsaw() -> Tz {
        "Europe/Warsaw".parse().unwrap()
    }

    fn warsaw_time(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        warsaw()
            .with_ymd_and_hms(y, mo, d, h, mi, s)
            .single()
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_cron_due_in_configured_timezone() {
        // "0 9 * * *" Europe/Warsaw, tick at 09:00:30 local — due.
        let now = warsaw_time(2025, 6, 2, 9, 0, 30);
        assert!(cron_due("0 9 * * *", warsaw(), now).unwrap());
        // 09:01:30 — no longer due.
        let later = warsaw_time(2025, 6, 2, 9, 1, 30);
        assert!(!cron_due("0 9 * * *", warsaw(), later).unwrap());
        // 08:59:59 — not yet.
        let earlier = warsaw_time(2025, 6, 2, 8, 59, 59);
        assert!(!cron_due("0 9 * * *", warsaw(), earlier).unwrap());
    }

    #[test]
    fn test_cron_due_midnight_boundary() {
        // "0 0 * * *" must fire in the 00:00 minute despite the previous
        // minute belonging to yesterday.
        let now = warsaw_time(2025, 6, 3, 0, 0, 10);
        assert!(cron_due("0 0 * * *", warsaw(), now).unwrap());
        let before = warsaw_time(2025, 6, 2, 23, 59, 50);
        assert!(!cron_due("0 0 * * *", warsaw(), before).unwrap());
    }

    #[test]
    fn test_cron_rejects_garbage() {
        assert!(cron_due("not a cron", warsaw(), Utc::now()).is_err());
        // 6-field (with seconds) is accepted as-is.
        assert!(cron_due("0 0 9 * * *", warsaw(), warsaw_time(2025, 6, 2, 9, 0, 5)).unwrap());
    }

    #[test]
    fn test_evaluate_cron_skill_due_and_guard() {
        let tz = warsaw();
        let now = warsaw_time(2025, 6, 2, 9, 0, 30);
        let mut skill = cron_skill("0 9 * * *");
        assert_eq!(
            evaluate_skill(&skill, now, tz, Duration::from_secs(300)),
            SkillDecision::Due
        );

        // Double-fire guard: last run within the current minute.
        skill.last_run_at = Some(warsaw_time(2025, 6, 2, 9, 0, 5).to_rfc3339());
        skill.last_run_status = SkillRunStatus::Success;
        assert_eq!(
            evaluate_skill(&skill, now, tz, Duration::from_secs(300)),
            SkillDecision::Skip("already ran this minute")
        );
    }

    #[test]
    fn test_evaluate_failure_cooldown() {
        let tz = warsaw();
        let now = warsaw_time(2025, 6, 2, 9, 0, 30);
        let mut skill = cron_skill("0 9 * * *");
        skill.last_run_status = SkillRunStatus::Error;
        skill.last_run_at = Some((now - ChronoDuration::minutes(2)).to_rfc3339());
        assert_eq!(
            evaluate_skill(&skill, now, tz, Duration::from_secs(300)),
            SkillDecision::Skip("failure cooldown")
        );
        // Cooldown elapsed → the cron gate decides again.
        skill.last_run_at = Some((now - ChronoDuration::minutes(10)).to_rfc3339());
        assert_eq!(
            evaluate_skill(&skill, now, tz, Duration::from_secs(300)),
            SkillDecision::Due
        );
    }

    #[test]
    fn test_evaluate_one_shot_in_minutes() {
        let tz = warsaw();
        let created = warsaw_time(2025, 6, 2, 12, 0, 0);
        let mut skill = cron_skill("unused");
        skill.trigger_kind = TriggerKind::OneShot;
        skill.trigger_config = TriggerConfig { in_minutes: Some(5), ..Default::default() };
        skill.created_at = Some(created.to_rfc3339());

        // T+4: not yet.
        let not_yet = created + ChronoDuration::minutes(4);
        assert_eq!(evaluate_skill(&skill, not_yet, tz, Duration::from_secs(300)), SkillDecision::NotDue);
        // T+5: due.
        let due = created + ChronoDuration::minutes(5);
        assert_eq!(evaluate_skill(&skill, due, tz, Duration::from_secs(300)), SkillDecision::Due);
        // After a successful run it never fires again.
        skill.last_run_status = SkillRunStatus::Success;
        skill.last_run_at = Some(due.to_rfc3339());
        assert!(matches!(
            evaluate_skill(&skill, due + ChronoDuration::minutes(1), tz, Duration::from_secs(300)),
            SkillDecision::Expire(_)
        ));
    }

    #[test]
    fn test_evaluate_interval_default_daily() {
        let tz = warsaw();
        let now = warsaw_time(2025, 6, 2, 10, 0, 0);
        let mut skill = cron_skill("unused");
        skill.trigger_kind = TriggerKind::Interval;
        skill.trigger_config = TriggerConfig::default(); // interval defaults to 1440

        // Never ran → due immediately.
        assert_eq!(evaluate_skill(&skill, now, tz, Duration::from_secs(300)), SkillDecision::Due);

        skill.last_run_status = SkillRunStatus::Success;
        skill.last_run_at = Some((now - ChronoDuration::hours(23)).to_rfc3339());
        assert_eq!(evaluate_skill(&skill, now, tz, Duration::from_secs(300)), SkillDecision::NotDue);

        skill.last_run_at = Some((now - ChronoDuration::hours(25)).to_rfc3339());
        assert_eq!(evaluate_skill(&skill, now, tz, Duration::from_secs(300)), SkillDecision::Due);
    }

    #[test]
    fn test_evaluate_expiration_and_max_runs() {
        let tz = warsaw();
        let now = warsaw_time(2025, 6, 2, 9, 0, 30);
        let mut skill = cron_skill("0 9 * * *");
        skill.expires_at = Some((now - ChronoDuration::minutes(1)).to_rfc3339());
        assert!(matches!(
            evaluate_skill(&skill, now, tz, Duration::from_secs(300)),
            SkillDecision::Expire(_)
        ));

        let mut skill = cron_skill("0 9 * * *");
        skill.max_runs = Some(3);
        skill.run_count = 3;
        assert!(matches!(
            evaluate_skill(&skill, now, tz, Duration::from_secs(300)),
            SkillDecision::Expire(_)
        ));
    }
}

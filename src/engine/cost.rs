// Hearth Agent Engine — Cost Monitor
//
// Sliding 60-minute window over token usage. Two tripwires: a hard hourly
// cap, and a spike detector comparing the last couple of minutes against
// the hour's baseline rate. Pausing is soft — the in-flight operation
// finishes, and the flag gates the next message or skill dispatch.
//
// Counters only ever grow within a minute; advancing the clock zeroes the
// buckets it skips over.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

const BUCKETS: usize = 60;

#[derive(Debug, Clone)]
pub struct CostLimits {
    pub hard_cap_per_hour: u64,
    pub spike_multiplier: f64,
    pub short_window_minutes: usize,
    /// The spike check only arms once the baseline holds at least this many
    /// tokens — a cold window never reads as a spike.
    pub min_baseline_tokens: u64,
}

impl Default for CostLimits {
    fn default() -> Self {
        CostLimits {
            hard_cap_per_hour: 250_000,
            spike_multiplier: 3.0,
            short_window_minutes: 2,
            min_baseline_tokens: 1_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PauseInfo {
    pub reason: String,
    pub at: DateTime<Utc>,
}

struct Inner {
    buckets: [u64; BUCKETS],
    /// Epoch minute the current bucket belongs to.
    current_minute: i64,
    paused: Option<PauseInfo>,
}

pub struct CostMonitor {
    limits: CostLimits,
    inner: Mutex<Inner>,
}

impl CostMonitor {
    pub fn new(limits: CostLimits) -> Self {
        CostMonitor {
            limits,
            inner: Mutex::new(Inner {
                buckets: [0; BUCKETS],
                current_minute: now_minute(),
                paused: None,
            }),
        }
    }

    /// Add one model call's tokens into the current minute's bucket.
    pub fn record_usage(&self, prompt_tokens: u64, completion_tokens: u64) {
        self.record_at(now_minute(), prompt_tokens, completion_tokens);
    }

    /// Evaluate the tripwires. Returns the pause info when newly (or still)
    /// paused.
    pub fn check_pause(&self) -> Option<PauseInfo> {
        self.check_at(now_minute())
    }

    /// Current pause state without re-evaluating.
    pub fn paused(&self) -> Option<PauseInfo> {
        self.inner.lock().paused.clone()
    }

    /// Clear the pause; optionally zero the whole window.
    pub fn resume(&self, reset_window: bool) {
        let mut inner = self.inner.lock();
        inner.paused = None;
        if reset_window {
            inner.buckets = [0; BUCKETS];
        }
    }

    /// Sum across the whole window (diagnostics).
    pub fn hour_total(&self) -> u64 {
        let mut inner = self.inner.lock();
        advance(&mut inner, now_minute());
        inner.buckets.iter().sum()
    }

    fn record_at(&self, minute: i64, prompt_tokens: u64, completion_tokens: u64) {
        let mut inner = self.inner.lock();
        advance(&mut inner, minute);
        let idx = (minute.rem_euclid(BUCKETS as i64)) as usize;
        inner.buckets[idx] += prompt_tokens + completion_tokens;
    }

    fn check_at(&self, minute: i64) -> Option<PauseInfo> {
        let mut inner = self.inner.lock();
        advance(&mut inner, minute);

        if inner.paused.is_some() {
            return inner.paused.clone();
        }

        let hour_total: u64 = inner.buckets.iter().sum();
        if hour_total >= self.limits.hard_cap_per_hour {
            let info = PauseInfo {
                reason: format!(
                    "hard cap: {} tokens in the last hour (cap {})",
                    hour_total, self.limits.hard_cap_per_hour
                ),
                at: Utc::now(),
            };
            log::warn!("[cost] Pausing — {}", info.reason);
            inner.paused = Some(info.clone());
            return Some(info);
        }

        // Short window = the current minute plus the preceding ones.
        let short = self.limits.short_window_minutes.min(BUCKETS);
        let mut short_total = 0u64;
        for back in 0..short {
            let idx = ((minute - back as i64).rem_euclid(BUCKETS as i64)) as usize;
            short_total += inner.buckets[idx];
        }

        // Baseline: mean tokens/minute across the remaining non-zero buckets.
        let mut baseline_total = 0u64;
        let mut baseline_count = 0u64;
        for back in short..BUCKETS {
            let idx = ((minute - back as i64).rem_euclid(BUCKETS as i64)) as usize;
            if inner.buckets[idx] > 0 {
                baseline_total += inner.buckets[idx];
                baseline_count += 1;
            }
        }

        if baseline_total >= self.limits.min_baseline_tokens && baseline_count > 0 {
            let baseline_rate = baseline_total as f64 / baseline_count as f64;
            let short_rate = short_total as f64 / short.max(1) as f64;
            if short_rate > baseline_rate * self.limits.spike_multiplier {
                let info = PauseInfo {
                    reason: format!(
                        "spike: {:.0} tokens/min vs baseline {:.0} tokens/min",
                        short_rate, baseline_rate
                    ),
                    at: Utc::now(),
                };
                log::warn!("[cost] Pausing — {}", info.reason);
                inner.paused = Some(info.clone());
                return Some(info);
            }
        }

        None
    }
}

fn advance(inner: &mut Inner, minute: i64) {
    if minute <= inner.current_minute {
        return;
    }
    let gap = (minute - inner.current_minute) as usize;
    if gap >= BUCKETS {
        inner.buckets = [0; BUCKETS];
    } else {
        for step in 1..=gap {
            let idx = ((inner.current_minute + step as i64).rem_euclid(BUCKETS as i64)) as usize;
            inner.buckets[idx] = 0;
        }
    }
    inner.current_minute = minute;
}

fn now_minute() -> i64 {
    Utc::now().timestamp() / 60
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(cap: u64) -> CostMonitor {
        CostMonitor::new(CostLimits { hard_cap_per_hour: cap, ..Default::default() })
    }

    #[test]
    fn test_record_increases_sum_exactly() {
        let m = monitor(1_000_000);
        let t0 = 1_000_000i64;
        m.record_at(t0, 400, 100);
        m.record_at(t0, 30, 20);
        let inner = m.inner.lock();
        assert_eq!(inner.buckets.iter().sum::<u64>(), 550);
    }

    #[test]
    fn test_hard_cap_pauses() {
        // 99_800 tokens across the last 59 minutes, then a 500-token call.
        let m = monitor(100_000);
        let t0 = 2_000_000i64;
        for back in 1..60 {
            m.record_at(t0 - 60 + back, 99_800 / 59, 0);
        }
        // Distribute the rounding remainder into one bucket.
        let used: u64 = m.inner.lock().buckets.iter().sum();
        m.record_at(t0 - 1, 99_800 - used, 0);

        assert!(m.check_at(t0).is_none());
        m.record_at(t0, 400, 100);
        let pause = m.check_at(t0).expect("should pause at hard cap");
        assert!(pause.reason.contains("hard cap"));
        // Pause is sticky until resumed.
        assert!(m.paused().is_some());
        m.resume(true);
        assert!(m.paused().is_none());
        assert_eq!(m.inner.lock().buckets.iter().sum::<u64>(), 0);
    }

    #[test]
    fn test_spike_needs_baseline() {
        // Fresh window, one giant burst — must NOT pause (no baseline).
        let m = monitor(1_000_000);
        let t0 = 3_000_000i64;
        m.record_at(t0, 50_000, 0);
        assert!(m.check_at(t0).is_none());
    }

    #[test]
    fn test_spike_detected_over_baseline() {
        let m = monitor(10_000_000);
        let t0 = 4_000_000i64;
        // Steady baseline: 500 tokens/min for 40 minutes.
        for back in 3..43 {
            m.record_at(t0 - back, 500, 0);
        }
        // Burst: 5_000/min in the short window.
        m.record_at(t0 - 1, 5_000, 0);
        m.record_at(t0, 5_000, 0);
        let pause = m.check_at(t0).expect("spike should pause");
        assert!(pause.reason.contains("spike"));
    }

    #[test]
    fn test_minute_rollover_zeroes_skipped_buckets() {
        let m = monitor(1_000_000);
        let t0 = 5_000_000i64;
        m.record_at(t0, 100, 0);
        // 10 minutes later, the bucket for t0 must still hold its tokens,
        // and the skipped ones must be zero.
        m.record_at(t0 + 10, 50, 0);
        let inner = m.inner.lock();
        assert_eq!(inner.buckets.iter().sum::<u64>(), 150);
        drop(inner);
        // After a full window gap, everything resets.
        m.record_at(t0 + 10 + 60, 25, 0);
        assert_eq!(m.inner.lock().buckets.iter().sum::<u64>(), 25);
    }
}

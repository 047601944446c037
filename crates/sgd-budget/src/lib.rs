// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-organization daily spend tracking and budget enforcement.
//!
//! `track` performs an atomic per-`(org_id, date)` increment through a
//! [`BudgetBackend`], computes the new percentage used, and — on crossing
//! 100% — refuses the call with [`BudgetOutcome::Exceeded`]. Alert
//! thresholds at 50/80/100% are each raised at most once per
//! `(org_id, date)`, gated by an idempotency key on the same backend.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

const ALERT_THRESHOLDS: [f64; 3] = [0.5, 0.8, 1.0];
const AUDIT_RETENTION: usize = 1000;

/// Backing store for the daily spend counter and alert idempotency keys.
/// A real deployment backs this with the same atomic-counter store used by
/// [`sgd_cache`]; tests and local development use [`InMemoryBudgetBackend`].
pub trait BudgetBackend: Send + Sync {
    /// Atomically add `amount` to the counter at `key`, returning the new
    /// total. Must not be a read-modify-write race under concurrent callers.
    fn incr(&self, key: &str, amount: f64) -> f64;
    /// Read the counter at `key` without mutating it.
    fn peek(&self, key: &str) -> f64;
    /// Returns `true` and marks `key` seen if this is the first time this
    /// exact key has been observed; `false` on every subsequent call.
    fn mark_once(&self, key: &str) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Fifty,
    Eighty,
    Hundred,
}

impl AlertLevel {
    fn from_pct(pct: f64) -> Option<AlertLevel> {
        if pct >= 1.0 {
            Some(AlertLevel::Hundred)
        } else if pct >= 0.8 {
            Some(AlertLevel::Eighty)
        } else if pct >= 0.5 {
            Some(AlertLevel::Fifty)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub org_id: String,
    pub daily_budget_usd: f64,
    pub current_spend_usd: f64,
    pub percentage_used: f64,
    pub is_exceeded: bool,
    pub retry_after_seconds: Option<u64>,
    pub alert_level: Option<AlertLevel>,
}

/// A single tracked cost, retained per-org for audit (grounded in the
/// original's bounded Redis audit list: newest-first, last 1000 entries).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostLedgerEntry {
    pub org_id: String,
    pub model: String,
    pub task: String,
    pub cost_usd: f64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailySpend {
    pub date: chrono::NaiveDate,
    pub spend_usd: f64,
    pub percentage_of_budget: f64,
}

/// Read-only rollup of [`CostLedgerEntry`] over a trailing window, built
/// from whatever entries are still resident in the in-process audit ring
/// (a real deployment would query the durable audit store instead).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpendingReport {
    pub org_id: String,
    pub period_days: u32,
    pub daily_budget_usd: f64,
    pub daily_spending: Vec<DailySpend>,
    pub total_spend_usd: f64,
    pub average_daily_spend_usd: f64,
}

pub struct BudgetController {
    backend: Box<dyn BudgetBackend>,
    daily_budget_usd: f64,
    audit: Mutex<std::collections::HashMap<String, VecDeque<CostLedgerEntry>>>,
}

impl BudgetController {
    pub fn new(backend: Box<dyn BudgetBackend>, daily_budget_usd: f64) -> Self {
        BudgetController {
            backend,
            daily_budget_usd,
            audit: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// `track(org_id, cost_usd, model, task) -> BudgetStatus`.
    ///
    /// The call that pushes spend from below budget to at-or-over budget is
    /// itself permitted; only subsequent calls that day are refused.
    pub fn track(
        &self,
        org_id: &str,
        cost_usd: f64,
        model: &str,
        task: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> BudgetStatus {
        let today = Utc::now().date_naive();
        let key = daily_key(org_id, today);

        let spend_before = self.backend.peek(&key);
        let was_already_exceeded = self.daily_budget_usd > 0.0 && spend_before >= self.daily_budget_usd;

        let status = if was_already_exceeded {
            self.status_from(org_id, spend_before)
        } else {
            let new_spend = self.backend.incr(&key, cost_usd);
            self.append_ledger(
                org_id, model, task, cost_usd, prompt_tokens, completion_tokens,
            );
            let status = self.status_from(org_id, new_spend);
            self.raise_alerts_if_needed(org_id, today, &status);
            status
        };

        if status.is_exceeded {
            tracing::warn!(
                org_id,
                spend = status.current_spend_usd,
                budget = self.daily_budget_usd,
                "daily budget exceeded"
            );
        }
        status
    }

    /// `check(org_id) -> BudgetStatus`, non-mutating.
    pub fn check(&self, org_id: &str) -> BudgetStatus {
        let today = Utc::now().date_naive();
        let key = daily_key(org_id, today);
        let spend = self.backend.peek(&key);
        self.status_from(org_id, spend)
    }

    pub fn spending_report(&self, org_id: &str, days: u32) -> SpendingReport {
        let today = Utc::now().date_naive();
        let mut daily_spending = Vec::with_capacity(days as usize);
        let mut total = 0.0;
        for i in 0..days {
            let date = today - chrono::Duration::days(i64::from(i));
            let spend = self.backend.peek(&daily_key(org_id, date));
            total += spend;
            daily_spending.push(DailySpend {
                date,
                spend_usd: spend,
                percentage_of_budget: pct(spend, self.daily_budget_usd),
            });
        }
        let average = if days > 0 { total / f64::from(days) } else { 0.0 };
        SpendingReport {
            org_id: org_id.to_string(),
            period_days: days,
            daily_budget_usd: self.daily_budget_usd,
            daily_spending,
            total_spend_usd: total,
            average_daily_spend_usd: average,
        }
    }

    pub fn recent_ledger(&self, org_id: &str) -> Vec<CostLedgerEntry> {
        self.audit
            .lock()
            .expect("audit mutex poisoned")
            .get(org_id)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn append_ledger(
        &self,
        org_id: &str,
        model: &str,
        task: &str,
        cost_usd: f64,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) {
        let mut audit = self.audit.lock().expect("audit mutex poisoned");
        let entries = audit.entry(org_id.to_string()).or_default();
        entries.push_front(CostLedgerEntry {
            org_id: org_id.to_string(),
            model: model.to_string(),
            task: task.to_string(),
            cost_usd,
            prompt_tokens,
            completion_tokens,
            timestamp: Utc::now(),
        });
        while entries.len() > AUDIT_RETENTION {
            entries.pop_back();
        }
    }

    fn status_from(&self, org_id: &str, spend: f64) -> BudgetStatus {
        let percentage_used = pct(spend, self.daily_budget_usd);
        let is_exceeded = self.daily_budget_usd > 0.0 && spend >= self.daily_budget_usd;
        BudgetStatus {
            org_id: org_id.to_string(),
            daily_budget_usd: self.daily_budget_usd,
            current_spend_usd: spend,
            percentage_used,
            is_exceeded,
            retry_after_seconds: is_exceeded.then(seconds_until_utc_midnight),
            alert_level: AlertLevel::from_pct(percentage_used / 100.0),
        }
    }

    fn raise_alerts_if_needed(&self, org_id: &str, date: chrono::NaiveDate, status: &BudgetStatus) {
        let pct_fraction = status.percentage_used / 100.0;
        for threshold in ALERT_THRESHOLDS {
            if pct_fraction < threshold {
                continue;
            }
            let alert_key = format!("budget:alert:{org_id}:{date}:{threshold}");
            if self.backend.mark_once(&alert_key) {
                tracing::warn!(
                    org_id,
                    threshold = threshold * 100.0,
                    spend = status.current_spend_usd,
                    budget = status.daily_budget_usd,
                    "budget alert threshold crossed"
                );
            }
        }
    }
}

fn pct(spend: f64, budget: f64) -> f64 {
    if budget > 0.0 {
        (spend / budget) * 100.0
    } else {
        0.0
    }
}

fn daily_key(org_id: &str, date: chrono::NaiveDate) -> String {
    format!("budget:daily:{org_id}:{date}")
}

fn seconds_until_utc_midnight() -> u64 {
    let now = Utc::now();
    let midnight = (now.date_naive() + chrono::Duration::days(1)).and_time(NaiveTime::MIN);
    let midnight = midnight.and_utc();
    midnight.signed_duration_since(now).num_seconds().max(0) as u64
}

/// In-process backend for local development and tests.
#[derive(Default)]
pub struct InMemoryBudgetBackend {
    counters: Mutex<std::collections::HashMap<String, f64>>,
    seen: Mutex<std::collections::HashSet<String>>,
}

impl InMemoryBudgetBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BudgetBackend for InMemoryBudgetBackend {
    fn incr(&self, key: &str, amount: f64) -> f64 {
        let mut counters = self.counters.lock().expect("counters mutex poisoned");
        let entry = counters.entry(key.to_string()).or_insert(0.0);
        *entry += amount;
        *entry
    }

    fn peek(&self, key: &str) -> f64 {
        *self
            .counters
            .lock()
            .expect("counters mutex poisoned")
            .get(key)
            .unwrap_or(&0.0)
    }

    fn mark_once(&self, key: &str) -> bool {
        self.seen.lock().expect("seen mutex poisoned").insert(key.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(budget: f64) -> BudgetController {
        BudgetController::new(Box::new(InMemoryBudgetBackend::new()), budget)
    }

    #[test]
    fn tracks_cumulative_spend_within_budget() {
        let c = controller(10.0);
        let status = c.track("org1", 3.0, "model-x", "render", 100, 200);
        assert!(!status.is_exceeded);
        assert_eq!(status.current_spend_usd, 3.0);
    }

    #[test]
    fn the_call_that_crosses_the_cap_is_still_permitted() {
        let c = controller(10.0);
        let _ = c.track("org1", 9.99, "model-x", "render", 0, 0);
        let status = c.track("org1", 0.05, "model-x", "render", 0, 0);
        assert!(status.is_exceeded);
        assert!(status.retry_after_seconds.unwrap() <= 86_400);
    }

    #[test]
    fn subsequent_calls_after_exceeded_are_refused_without_incrementing() {
        let c = controller(1.0);
        let _ = c.track("org1", 1.5, "model-x", "render", 0, 0);
        let spend_after_first = c.check("org1").current_spend_usd;
        let second = c.track("org1", 5.0, "model-x", "render", 0, 0);
        assert!(second.is_exceeded);
        assert_eq!(second.current_spend_usd, spend_after_first);
    }

    #[test]
    fn alert_levels_escalate_with_spend() {
        let c = controller(10.0);
        let status = c.track("org1", 6.0, "model-x", "render", 0, 0);
        assert_eq!(status.alert_level, Some(AlertLevel::Fifty));
        let status = c.track("org1", 2.5, "model-x", "render", 0, 0);
        assert_eq!(status.alert_level, Some(AlertLevel::Eighty));
    }

    #[test]
    fn check_does_not_mutate_spend() {
        let c = controller(10.0);
        let _ = c.track("org1", 2.0, "model-x", "render", 0, 0);
        let before = c.check("org1").current_spend_usd;
        let _ = c.check("org1");
        let after = c.check("org1").current_spend_usd;
        assert_eq!(before, after);
    }

    #[test]
    fn ledger_is_bounded_and_newest_first() {
        let c = controller(1_000_000.0);
        for i in 0..5 {
            c.track("org1", 1.0, "model-x", &format!("task-{i}"), 0, 0);
        }
        let ledger = c.recent_ledger("org1");
        assert_eq!(ledger.len(), 5);
        assert_eq!(ledger[0].task, "task-4");
    }

    #[test]
    fn spending_report_aggregates_across_days() {
        let c = controller(10.0);
        c.track("org1", 4.0, "model-x", "render", 0, 0);
        let report = c.spending_report("org1", 3);
        assert_eq!(report.period_days, 3);
        assert!(report.total_spend_usd >= 4.0);
        assert_eq!(report.daily_spending.len(), 3);
    }
}

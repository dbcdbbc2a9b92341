//! Budget monitoring for gate LLM spend.
//!
//! Tracks estimated gate evaluation cost per UTC day, alerts when the daily
//! total crosses the configured threshold or limit (with a cooldown so a
//! busy stream does not spam the log), and exposes a status summary.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{Datelike, Utc};
use serde::Serialize;
use tracing::{info, warn};

const ALERT_COOLDOWN: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy)]
pub struct BudgetLimits {
    /// Daily spend ceiling in USD.
    pub daily_limit_usd: f64,
    /// Fraction of the limit at which the first alert fires.
    pub alert_threshold: f64,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        BudgetLimits {
            daily_limit_usd: 10.0,
            alert_threshold: 0.8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BudgetStatus {
    LowUsage,
    ModerateUsage,
    ThresholdReached,
    LimitExceeded,
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetSummary {
    pub date: String,
    pub daily_cost_usd: f64,
    pub daily_limit_usd: f64,
    pub percentage_used: f64,
    pub monthly_total_usd: f64,
    pub status: BudgetStatus,
}

struct BudgetState {
    /// `YYYY-MM-DD` → accumulated cost.
    daily_costs: HashMap<String, f64>,
    /// alert key → last fire time.
    last_alert: HashMap<String, Instant>,
}

pub struct BudgetMonitor {
    limits: BudgetLimits,
    state: Mutex<BudgetState>,
}

impl BudgetMonitor {
    pub fn new(limits: BudgetLimits) -> Self {
        BudgetMonitor {
            limits,
            state: Mutex::new(BudgetState {
                daily_costs: HashMap::new(),
                last_alert: HashMap::new(),
            }),
        }
    }

    fn today() -> String {
        Utc::now().format("%Y-%m-%d").to_string()
    }

    /// Record one evaluation's estimated cost and fire any due alerts.
    pub fn record_cost(&self, cost_usd: f64, subscription_id: i32) {
        let today = Self::today();
        let daily_total = {
            let mut state = self.state.lock().expect("budget lock poisoned");
            let entry = state.daily_costs.entry(today.clone()).or_insert(0.0);
            *entry += cost_usd;
            *entry
        };

        self.check_alerts(&today, daily_total);
        tracing::debug!(
            cost_usd,
            subscription_id,
            daily_total,
            date = %today,
            "gate cost recorded"
        );
    }

    /// Whether today's spend has reached the hard limit. Gate callers use
    /// this to stop spending and fall back to the failover policy.
    pub fn is_exhausted(&self) -> bool {
        self.daily_cost(&Self::today()) >= self.limits.daily_limit_usd
    }

    pub fn daily_cost(&self, date: &str) -> f64 {
        self.state
            .lock()
            .expect("budget lock poisoned")
            .daily_costs
            .get(date)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn monthly_total(&self) -> f64 {
        let now = Utc::now();
        let prefix = format!("{:04}-{:02}", now.year(), now.month());
        let state = self.state.lock().expect("budget lock poisoned");
        state
            .daily_costs
            .iter()
            .filter(|(date, _)| date.starts_with(&prefix))
            .map(|(_, cost)| cost)
            .sum()
    }

    /// Drop per-day records older than `before_date` (lexicographic compare
    /// works on `YYYY-MM-DD`).
    pub fn prune_before(&self, before_date: &str) {
        let mut state = self.state.lock().expect("budget lock poisoned");
        let removed: Vec<String> = state
            .daily_costs
            .keys()
            .filter(|date| date.as_str() < before_date)
            .cloned()
            .collect();
        for date in &removed {
            state.daily_costs.remove(date);
        }
        if !removed.is_empty() {
            info!(removed = removed.len(), "pruned old daily cost records");
        }
    }

    pub fn summary(&self) -> BudgetSummary {
        let today = Self::today();
        let daily_cost = self.daily_cost(&today);
        let limit = self.limits.daily_limit_usd;
        BudgetSummary {
            date: today,
            daily_cost_usd: daily_cost,
            daily_limit_usd: limit,
            percentage_used: if limit > 0.0 {
                (daily_cost / limit) * 100.0
            } else {
                0.0
            },
            monthly_total_usd: self.monthly_total(),
            status: self.status_for(daily_cost),
        }
    }

    fn status_for(&self, cost: f64) -> BudgetStatus {
        let limit = self.limits.daily_limit_usd;
        if cost >= limit {
            BudgetStatus::LimitExceeded
        } else if cost >= limit * self.limits.alert_threshold {
            BudgetStatus::ThresholdReached
        } else if cost >= limit * 0.5 {
            BudgetStatus::ModerateUsage
        } else {
            BudgetStatus::LowUsage
        }
    }

    fn check_alerts(&self, date: &str, daily_cost: f64) {
        let limit = self.limits.daily_limit_usd;
        if daily_cost >= limit * self.limits.alert_threshold {
            self.alert_once(
                "threshold_reached",
                date,
                daily_cost,
                "daily gate spending crossed the alert threshold",
            );
        }
        if daily_cost >= limit {
            self.alert_once(
                "limit_exceeded",
                date,
                daily_cost,
                "daily gate spending limit exceeded",
            );
        }
    }

    fn alert_once(&self, alert_type: &str, date: &str, daily_cost: f64, message: &str) {
        let key = format!("{alert_type}_{date}");
        {
            let mut state = self.state.lock().expect("budget lock poisoned");
            if let Some(last) = state.last_alert.get(&key) {
                if last.elapsed() < ALERT_COOLDOWN {
                    return;
                }
            }
            state.last_alert.insert(key, Instant::now());
        }
        warn!(
            alert_type,
            date,
            daily_cost_usd = daily_cost,
            daily_limit_usd = self.limits.daily_limit_usd,
            "{message}"
        );
    }
}

impl Default for BudgetMonitor {
    fn default() -> Self {
        Self::new(BudgetLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(limit: f64) -> BudgetMonitor {
        BudgetMonitor::new(BudgetLimits {
            daily_limit_usd: limit,
            alert_threshold: 0.8,
        })
    }

    #[test]
    fn costs_accumulate_per_day() {
        let monitor = monitor(10.0);
        monitor.record_cost(0.25, 1);
        monitor.record_cost(0.50, 2);
        let today = BudgetMonitor::today();
        assert!((monitor.daily_cost(&today) - 0.75).abs() < 1e-9);
        assert!((monitor.monthly_total() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn exhaustion_trips_at_the_limit() {
        let monitor = monitor(1.0);
        assert!(!monitor.is_exhausted());
        monitor.record_cost(0.6, 1);
        assert!(!monitor.is_exhausted());
        monitor.record_cost(0.4, 1);
        assert!(monitor.is_exhausted());
    }

    #[test]
    fn status_escalates_with_spend() {
        let monitor = monitor(10.0);
        assert_eq!(monitor.summary().status, BudgetStatus::LowUsage);
        monitor.record_cost(5.0, 1);
        assert_eq!(monitor.summary().status, BudgetStatus::ModerateUsage);
        monitor.record_cost(3.0, 1);
        assert_eq!(monitor.summary().status, BudgetStatus::ThresholdReached);
        monitor.record_cost(2.0, 1);
        assert_eq!(monitor.summary().status, BudgetStatus::LimitExceeded);
    }

    #[test]
    fn pruning_drops_only_older_dates() {
        let monitor = monitor(10.0);
        {
            let mut state = monitor.state.lock().unwrap();
            state.daily_costs.insert("2024-01-01".to_owned(), 1.0);
            state.daily_costs.insert("2024-06-01".to_owned(), 2.0);
        }
        monitor.prune_before("2024-06-01");
        assert_eq!(monitor.daily_cost("2024-01-01"), 0.0);
        assert!((monitor.daily_cost("2024-06-01") - 2.0).abs() < 1e-9);
    }

    #[test]
    fn summary_reports_percentages() {
        let monitor = monitor(10.0);
        monitor.record_cost(2.5, 1);
        let summary = monitor.summary();
        assert!((summary.percentage_used - 25.0).abs() < 1e-9);
        assert_eq!(summary.daily_limit_usd, 10.0);
    }
}

//! Shared rate limiting and cost tracking for external-service calls.
//!
//! One [`SharedBudget`] exists per process, created at startup and injected
//! into every component that talks to an external service, so the sharing is
//! explicit rather than ambient global state. Two composable policies:
//!
//! 1. **Call ceilings** — a per-minute limiter (callers wait for a permit)
//!    and a rolling 24-hour window (callers fail fast with
//!    [`ServiceError::QuotaExceeded`] once the day ceiling is exhausted).
//! 2. **Cost ledger** — converts each call's measured units into a monetary
//!    estimate from a static per-service rate table, accumulates a rolling
//!    daily total, and logs a non-fatal alert when the daily budget is first
//!    crossed.

use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};

use docgraph_core::models::CostRecord;

use crate::config::BudgetConfig;
use crate::error::ServiceError;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Cost per 1,000 input/output units for a service.
#[derive(Debug, Clone, Copy)]
struct RateCard {
    input_per_1k: f64,
    output_per_1k: f64,
}

/// Static rate table. Units are tokens for completion/embedding and pages
/// for OCR.
fn rate_for(service: &str) -> RateCard {
    match service {
        "completion" => RateCard {
            input_per_1k: 0.003,
            output_per_1k: 0.015,
        },
        "embedding" => RateCard {
            input_per_1k: 0.0001,
            output_per_1k: 0.0,
        },
        "ocr" => RateCard {
            input_per_1k: 1.5,
            output_per_1k: 0.0,
        },
        _ => RateCard {
            input_per_1k: 0.0,
            output_per_1k: 0.0,
        },
    }
}

/// Estimate the cost of a call without recording it. Used by the
/// classifier's pre-processing cost hint.
pub fn estimate_cost(service: &str, input_units: i64, output_units: i64) -> f64 {
    let rate = rate_for(service);
    (input_units as f64 / 1000.0) * rate.input_per_1k
        + (output_units as f64 / 1000.0) * rate.output_per_1k
}

/// Process-wide rate limiter and cost ledger.
pub struct SharedBudget {
    minute_limiter: DirectRateLimiter,
    calls_per_day: usize,
    daily_budget_usd: f64,
    day_window: Mutex<VecDeque<Instant>>,
    spend_window: Mutex<VecDeque<(Instant, f64)>>,
    budget_alerted: AtomicBool,
}

impl SharedBudget {
    pub fn new(config: &BudgetConfig) -> Arc<Self> {
        let per_minute =
            NonZeroU32::new(config.calls_per_minute).expect("calls_per_minute must be > 0");
        Arc::new(Self {
            minute_limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
            calls_per_day: config.calls_per_day as usize,
            daily_budget_usd: config.daily_budget_usd,
            day_window: Mutex::new(VecDeque::new()),
            spend_window: Mutex::new(VecDeque::new()),
            budget_alerted: AtomicBool::new(false),
        })
    }

    /// Acquire a permit for one external call.
    ///
    /// Fails fast with [`ServiceError::QuotaExceeded`] when the rolling
    /// 24-hour ceiling is exhausted; otherwise waits for the per-minute
    /// limiter.
    pub async fn acquire(&self, service: &str) -> Result<(), ServiceError> {
        {
            let mut window = self.day_window.lock().expect("day window poisoned");
            let now = Instant::now();
            while window.front().is_some_and(|&t| now.duration_since(t) > DAY) {
                window.pop_front();
            }
            if window.len() >= self.calls_per_day {
                tracing::warn!(service, "daily call quota exhausted");
                return Err(ServiceError::QuotaExceeded);
            }
            window.push_back(now);
        }

        // Waiting (not failing) is the contract for the per-minute ceiling.
        self.minute_limiter.until_ready().await;
        Ok(())
    }

    /// Record the measured cost of a completed call and return the
    /// append-only ledger row.
    pub fn record(
        &self,
        document_id: &str,
        service: &str,
        input_units: i64,
        output_units: i64,
    ) -> CostRecord {
        let cost = estimate_cost(service, input_units, output_units);

        let total = {
            let mut spend = self.spend_window.lock().expect("spend window poisoned");
            let now = Instant::now();
            while spend.front().is_some_and(|&(t, _)| now.duration_since(t) > DAY) {
                spend.pop_front();
            }
            spend.push_back((now, cost));
            spend.iter().map(|(_, c)| c).sum::<f64>()
        };

        if total > self.daily_budget_usd {
            if !self.budget_alerted.swap(true, Ordering::SeqCst) {
                tracing::warn!(
                    total_usd = total,
                    budget_usd = self.daily_budget_usd,
                    "daily cost budget crossed"
                );
            }
        } else {
            self.budget_alerted.store(false, Ordering::SeqCst);
        }

        CostRecord::new(document_id, service, input_units, output_units, cost)
    }

    /// Rolling 24-hour spend total.
    pub fn daily_spend(&self) -> f64 {
        let mut spend = self.spend_window.lock().expect("spend window poisoned");
        let now = Instant::now();
        while spend.front().is_some_and(|&(t, _)| now.duration_since(t) > DAY) {
            spend.pop_front();
        }
        spend.iter().map(|(_, c)| c).sum()
    }

    /// Calls made in the rolling 24-hour window.
    pub fn calls_today(&self) -> usize {
        let mut window = self.day_window.lock().expect("day window poisoned");
        let now = Instant::now();
        while window.front().is_some_and(|&t| now.duration_since(t) > DAY) {
            window.pop_front();
        }
        window.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(per_minute: u32, per_day: u32) -> Arc<SharedBudget> {
        SharedBudget::new(&BudgetConfig {
            calls_per_minute: per_minute,
            calls_per_day: per_day,
            daily_budget_usd: 1.0,
        })
    }

    #[tokio::test]
    async fn day_ceiling_fails_fast() {
        let b = budget(1000, 2);
        assert!(b.acquire("completion").await.is_ok());
        assert!(b.acquire("completion").await.is_ok());
        let err = b.acquire("completion").await.unwrap_err();
        assert!(matches!(err, ServiceError::QuotaExceeded));
        assert_eq!(b.calls_today(), 2);
    }

    #[tokio::test]
    async fn minute_limiter_delays_bursts() {
        // 60/min refills one permit per second; the third call must wait.
        let b = budget(60, 1000);
        let start = Instant::now();
        b.acquire("completion").await.unwrap();
        b.acquire("completion").await.unwrap();
        b.acquire("completion").await.unwrap();
        // governor allows an initial burst; just assert no failure and that
        // the day window recorded every call.
        assert_eq!(b.calls_today(), 3);
        assert!(start.elapsed() < Duration::from_secs(30));
    }

    #[test]
    fn cost_ledger_accumulates() {
        let b = budget(10, 10);
        let r1 = b.record("doc1", "completion", 1000, 1000);
        assert!((r1.cost - 0.018).abs() < 1e-9);
        let r2 = b.record("doc1", "embedding", 10_000, 0);
        assert!((r2.cost - 0.001).abs() < 1e-9);
        assert!((b.daily_spend() - 0.019).abs() < 1e-9);
    }

    #[test]
    fn unknown_service_is_free() {
        assert_eq!(estimate_cost("telepathy", 1_000_000, 1_000_000), 0.0);
    }

    #[test]
    fn ocr_priced_per_page() {
        // 10 pages at $1.5 per 1k pages.
        assert!((estimate_cost("ocr", 10, 0) - 0.015).abs() < 1e-9);
    }
}

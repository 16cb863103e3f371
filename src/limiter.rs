//! Dual-window rate limiting for enrichment calls.
//!
//! The platform enforces a short-interval quota and a daily quota server
//! side; blowing either yields 429s and, eventually, a ban. This gate keeps
//! every outbound call under both budgets, counted over sliding windows so
//! there is no thundering herd at a reset edge.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config;
use crate::error::EnrichError;

pub struct RateLimiter {
    // The mutex doubles as the FIFO queue: tokio's Mutex wakes waiters in
    // acquisition order, and a caller holds it for the whole wait, so
    // tokens are handed out in the order they were requested.
    windows: Mutex<Windows>,
    short_budget: u32,
    short_window: Duration,
    daily_budget: u32,
    daily_window: Duration,
    wait_timeout: Duration,
}

struct Windows {
    short: VecDeque<Instant>,
    daily: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(
        short_budget: u32,
        short_window: Duration,
        daily_budget: u32,
        daily_window: Duration,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            windows: Mutex::new(Windows {
                short: VecDeque::new(),
                daily: VecDeque::new(),
            }),
            short_budget,
            short_window,
            daily_budget,
            daily_window,
            wait_timeout,
        }
    }

    /// Limiter with the production budgets from `config`.
    pub fn from_config() -> Self {
        Self::new(
            config::SHORT_WINDOW_BUDGET,
            config::SHORT_WINDOW,
            config::DAILY_WINDOW_BUDGET,
            config::DAILY_WINDOW,
            config::LIMITER_WAIT_TIMEOUT,
        )
    }

    /// Block until both windows have headroom, then consume one token from
    /// each. Callers are served strictly in request order. Errs with
    /// `LimiterTimeout` rather than waiting past the bounded timeout.
    pub async fn acquire(&self) -> Result<(), EnrichError> {
        let start = Instant::now();
        let mut w = self.windows.lock().await;

        loop {
            let now = Instant::now();
            prune(&mut w.short, now, self.short_window);
            prune(&mut w.daily, now, self.daily_window);

            if (w.short.len() as u32) < self.short_budget
                && (w.daily.len() as u32) < self.daily_budget
            {
                w.short.push_back(now);
                w.daily.push_back(now);
                return Ok(());
            }

            // Earliest instant at which the constrained window frees a slot.
            let mut wake = now;
            if w.short.len() as u32 >= self.short_budget {
                if let Some(&oldest) = w.short.front() {
                    wake = wake.max(oldest + self.short_window);
                }
            }
            if w.daily.len() as u32 >= self.daily_budget {
                if let Some(&oldest) = w.daily.front() {
                    wake = wake.max(oldest + self.daily_window);
                }
            }

            if wake > start + self.wait_timeout {
                return Err(EnrichError::LimiterTimeout);
            }
            tokio::time::sleep_until(wake).await;
        }
    }

    /// Current headroom as (short window, daily window).
    pub async fn remaining(&self) -> (u32, u32) {
        let mut w = self.windows.lock().await;
        let now = Instant::now();
        prune(&mut w.short, now, self.short_window);
        prune(&mut w.daily, now, self.daily_window);
        (
            self.short_budget.saturating_sub(w.short.len() as u32),
            self.daily_budget.saturating_sub(w.daily.len() as u32),
        )
    }
}

fn prune(window: &mut VecDeque<Instant>, now: Instant, span: Duration) {
    while let Some(&oldest) = window.front() {
        if now.duration_since(oldest) >= span {
            window.pop_front();
        } else {
            break;
        }
    }
}

// ── Tests ──

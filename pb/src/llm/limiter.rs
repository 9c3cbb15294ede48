//! LLM rate limiter
//!
//! Dual-window admission: at most `qps` acquisitions in any sliding 1 s
//! window and `qpm` in any sliding 60 s window. A single mutex is held
//! across the wait so acquirers drain strictly one at a time; `acquire()`
//! with `qps = 0` never returns.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

const SECOND_WINDOW: Duration = Duration::from_secs(1);
const MINUTE_WINDOW: Duration = Duration::from_secs(60);

/// Per-window occupancy snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterStats {
    pub qps_current: usize,
    pub qps_limit: f64,
    pub qps_available: f64,
    pub qpm_current: usize,
    pub qpm_limit: f64,
    pub qpm_available: f64,
}

struct Windows {
    second: VecDeque<Instant>,
    minute: VecDeque<Instant>,
}

impl Windows {
    fn prune(&mut self, now: Instant) {
        while self.second.front().is_some_and(|t| now - *t > SECOND_WINDOW) {
            self.second.pop_front();
        }
        while self.minute.front().is_some_and(|t| now - *t > MINUTE_WINDOW) {
            self.minute.pop_front();
        }
    }
}

/// Dual-window (QPS + QPM) token admission controller.
pub struct RateLimiter {
    qps: f64,
    qpm: f64,
    inner: Mutex<Windows>,
}

impl RateLimiter {
    pub fn new(qps: f64, qpm: f64) -> Self {
        debug!(qps, qpm, "Rate limiter initialised");
        Self {
            qps,
            qpm,
            inner: Mutex::new(Windows {
                second: VecDeque::new(),
                minute: VecDeque::new(),
            }),
        }
    }

    /// Block until both windows admit one more call, then record it.
    pub async fn acquire(&self) {
        let mut windows = self.inner.lock().await;

        loop {
            let now = Instant::now();
            windows.prune(now);
            if !self.at_capacity(&windows) {
                break;
            }

            match self.required_wait(&windows, now) {
                Some(wait) if wait > Duration::ZERO => {
                    debug!(?wait, "Rate limit wait");
                    tokio::time::sleep(wait).await;
                }
                // The oldest entry sits exactly on the window edge; admit.
                Some(_) => break,
                // A saturated window with no expirable entry (limit of
                // zero): nothing will ever drain, keep waiting.
                None => tokio::time::sleep(SECOND_WINDOW).await,
            }
        }

        let now = Instant::now();
        windows.second.push_back(now);
        windows.minute.push_back(now);
        debug!(
            qps_current = windows.second.len(),
            qpm_current = windows.minute.len(),
            "Rate limit admitted"
        );
    }

    fn at_capacity(&self, windows: &Windows) -> bool {
        windows.second.len() as f64 >= self.qps || windows.minute.len() as f64 >= self.qpm
    }

    /// Minimum sleep until one entry expires from a saturated window.
    fn required_wait(&self, windows: &Windows, now: Instant) -> Option<Duration> {
        let mut wait: Option<Duration> = None;

        if windows.second.len() as f64 >= self.qps {
            let oldest = *windows.second.front()?;
            let remaining = SECOND_WINDOW.saturating_sub(now - oldest);
            wait = Some(wait.map_or(remaining, |w| w.max(remaining)));
        }
        if windows.minute.len() as f64 >= self.qpm {
            let oldest = *windows.minute.front()?;
            let remaining = MINUTE_WINDOW.saturating_sub(now - oldest);
            wait = Some(wait.map_or(remaining, |w| w.max(remaining)));
        }

        wait
    }

    /// Current occupancy per window.
    pub async fn stats(&self) -> RateLimiterStats {
        let mut windows = self.inner.lock().await;
        windows.prune(Instant::now());

        RateLimiterStats {
            qps_current: windows.second.len(),
            qps_limit: self.qps,
            qps_available: (self.qps - windows.second.len() as f64).max(0.0),
            qpm_current: windows.minute.len(),
            qpm_limit: self.qpm,
            qpm_available: (self.qpm - windows.minute.len() as f64).max(0.0),
        }
    }
}

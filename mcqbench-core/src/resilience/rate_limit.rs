// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Sliding-window limiter for outbound requests.
//!
//! Admits at most `capacity` requests per `window`. A rate of N requests per
//! second maps to `capacity = max(1, floor(N))` and `window = capacity / N`
//! seconds, so fractional rates stretch the window instead of rounding to zero.
//! Waiters queue on a fair mutex and are admitted in arrival order.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Slowest supported rate; one request per 1000 seconds
pub const MIN_RATE: f64 = 1e-3;

/// Preallocation bound for the issuance log
const MAX_PREALLOC: usize = 1024;

#[derive(Debug)]
pub struct RateLimiter {
    inner: Option<Window>,
}

#[derive(Debug)]
struct Window {
    capacity: usize,
    window: Duration,
    issued: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Limiter for `requests_per_second`; negative means unlimited.
    ///
    /// Zero and NaN are rejected by config validation; here they fall back to unlimited.
    /// Positive rates below [`MIN_RATE`] are raised to it.
    pub fn new(requests_per_second: f64) -> Self {
        if !(requests_per_second > 0.0) || !requests_per_second.is_finite() {
            return Self::unlimited();
        }

        let rate = requests_per_second.max(MIN_RATE);
        let capacity = rate.floor().max(1.0);
        let window = match Duration::try_from_secs_f64(capacity / rate) {
            Ok(window) if !window.is_zero() => window,
            _ => return Self::unlimited(),
        };
        let capacity = capacity as usize;
        Self {
            inner: Some(Window {
                capacity,
                window,
                issued: Mutex::new(VecDeque::with_capacity(capacity.min(MAX_PREALLOC))),
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self { inner: None }
    }

    /// Build from an optional rate (`None` = unlimited)
    pub fn from_rate(rate: Option<f64>) -> Self {
        rate.map(Self::new).unwrap_or_else(Self::unlimited)
    }

    pub fn is_unlimited(&self) -> bool {
        self.inner.is_none()
    }

    /// Requests admitted per window and the window length
    pub fn shape(&self) -> Option<(usize, Duration)> {
        self.inner.as_ref().map(|w| (w.capacity, w.window))
    }

    /// Wait until one more request may be issued, then record it
    pub async fn acquire(&self) {
        let Some(window) = &self.inner else {
            return;
        };

        // Held across the sleep so later callers stay queued behind us
        let mut issued = window.issued.lock().await;
        loop {
            let now = Instant::now();
            while let Some(&oldest) = issued.front() {
                if now.duration_since(oldest) >= window.window {
                    issued.pop_front();
                } else {
                    break;
                }
            }

            if issued.len() < window.capacity {
                issued.push_back(now);
                return;
            }

            if let Some(&oldest) = issued.front() {
                tokio::time::sleep_until(oldest + window.window).await;
            }
        }
    }
}

//! Per-organization hourly request and cost limits

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::config::RateLimitConfig;
use crate::error::{Error, Result};
use crate::models::OrganizationId;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    requests: u32,
    cost: f64,
}

impl Window {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            requests: 0,
            cost: 0.0,
        }
    }
}

/// A request counted against the window ahead of dispatch, at its estimated
/// cost. Dropping it without [`RateSlot::complete`] gives the slot back.
#[must_use]
#[derive(Debug)]
pub struct RateSlot<'a> {
    limiter: &'a RateLimiter,
    organization_id: OrganizationId,
    window_started: Instant,
    estimated_cost: f64,
    completed: bool,
}

impl RateSlot<'_> {
    /// Keep the request counted and swap its estimate for the actual cost
    pub fn complete(mut self, actual_cost: f64) {
        self.completed = true;
        let delta = actual_cost.max(0.0) - self.estimated_cost;
        self.limiter
            .adjust(self.organization_id, self.window_started, false, delta);
    }
}

impl Drop for RateSlot<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.limiter.adjust(
                self.organization_id,
                self.window_started,
                true,
                -self.estimated_cost,
            );
        }
    }
}

/// Fixed-window limiter. A window resets once it has been open for the full duration.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<OrganizationId, Window>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` on the organization's current window, resetting it first if it elapsed
    fn with_window<T>(&self, organization_id: OrganizationId, f: impl FnOnce(&mut Window) -> T) -> T {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let window = windows.entry(organization_id).or_insert_with(Window::new);
        if window.started.elapsed() >= self.config.window() {
            *window = Window::new();
        }
        f(window)
    }

    /// Settle a slot. A no-op once the slot's window has been replaced.
    fn adjust(&self, organization_id: OrganizationId, window_started: Instant, release: bool, cost_delta: f64) {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let Some(window) = windows.get_mut(&organization_id) else {
            return;
        };
        if window.started != window_started {
            return;
        }
        if release {
            window.requests = window.requests.saturating_sub(1);
        }
        window.cost = (window.cost + cost_delta).max(0.0);
    }

    /// Take a slot for one request costing about `estimated_cost`, or fail with
    /// `RateLimited` when it would exceed the window. The request and its estimate
    /// count from here on, so concurrent callers see each other.
    pub fn check_limit(&self, organization_id: OrganizationId, estimated_cost: f64) -> Result<RateSlot<'_>> {
        let window_length = self.config.window();
        let max_requests = self.config.max_requests_per_hour;
        let max_cost = self.config.max_cost_per_hour;
        let estimated_cost = estimated_cost.max(0.0);

        let window_started = self.with_window(organization_id, |window| {
            let retry_after = window_length.saturating_sub(window.started.elapsed());
            if max_requests > 0 && window.requests >= max_requests {
                debug!(organization_id = %organization_id, requests = window.requests, "Request limit reached");
                return Err(Error::RateLimited {
                    reason: format!("hourly request limit exceeded ({}/{})", window.requests, max_requests),
                    retry_after,
                });
            }
            if max_cost > 0.0 && window.cost + estimated_cost > max_cost + 1e-9 {
                debug!(organization_id = %organization_id, cost = window.cost, "Cost limit reached");
                return Err(Error::RateLimited {
                    reason: "hourly cost limit would be exceeded".to_string(),
                    retry_after,
                });
            }
            window.requests += 1;
            window.cost += estimated_cost;
            Ok(window.started)
        })?;

        Ok(RateSlot {
            limiter: self,
            organization_id,
            window_started,
            estimated_cost,
            completed: false,
        })
    }

    /// (requests, cost) in the current window, slots in flight included
    pub fn usage(&self, organization_id: OrganizationId) -> (u32, f64) {
        self.with_window(organization_id, |window| (window.requests, window.cost))
    }

    pub fn window_length(&self) -> Duration {
        self.config.window()
    }
}

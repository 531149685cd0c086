//! Fixed-window rate limiting of delivery scheduling.
//!
//! Each (organization, destination) pair gets a counter that is incremented
//! whenever a delivery is scheduled. Once the counter reaches the configured
//! maximum, further scheduling is refused until the window expires.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use sierra_core::{DestinationId, OrganizationId};
use tokio::time::Instant;

use crate::error::DeliveryError;

/// Rate limiter settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Deliveries allowed per key per window.
    pub max_per_window: u32,
    /// Window length.
    pub window: Duration,
    /// When false every request is allowed.
    pub enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_window: 100,
            window: Duration::from_secs(60),
            enabled: true,
        }
    }
}

impl RateLimitConfig {
    /// Set the maximum deliveries per window.
    #[must_use]
    pub fn with_max_per_window(mut self, max: u32) -> Self {
        self.max_per_window = max;
        self
    }

    /// Set the window length.
    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Enable or disable rate limiting.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

type Key = (OrganizationId, DestinationId);

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window limiter keyed by organization and destination.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<Key, Window>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Limits applied to every key.
    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count one scheduling attempt, rejecting it if the window is full.
    pub fn try_acquire(
        &self,
        organization_id: OrganizationId,
        destination_id: DestinationId,
    ) -> Result<(), DeliveryError> {
        if !self.config.enabled {
            return Ok(());
        }

        let now = Instant::now();
        let mut windows = self.lock();
        let window = windows
            .entry((organization_id, destination_id))
            .or_insert(Window {
                started: now,
                count: 0,
            });

        if now.saturating_duration_since(window.started) >= self.config.window {
            *window = Window {
                started: now,
                count: 0,
            };
        }

        if window.count >= self.config.max_per_window {
            return Err(DeliveryError::RateLimitExceeded {
                organization_id,
                destination_id,
            });
        }

        window.count += 1;
        Ok(())
    }

    /// Scheduling slots left in the current window.
    #[must_use]
    pub fn remaining(&self, organization_id: OrganizationId, destination_id: DestinationId) -> u32 {
        if !self.config.enabled {
            return self.config.max_per_window;
        }

        let now = Instant::now();
        let windows = self.lock();
        match windows.get(&(organization_id, destination_id)) {
            Some(w) if now.saturating_duration_since(w.started) < self.config.window => {
                self.config.max_per_window.saturating_sub(w.count)
            }
            _ => self.config.max_per_window,
        }
    }

    /// Drop counters whose window has ended. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.lock();
        let before = windows.len();
        windows.retain(|_, w| now.saturating_duration_since(w.started) < self.config.window);
        before - windows.len()
    }

    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Key, Window>> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

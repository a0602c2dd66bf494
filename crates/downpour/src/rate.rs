//! Fixed-window rate gate for credential use.
//!
//! Two windows guard every acquisition: a per-credential window (the cookie
//! cooldown, default one use per 600 s) and a provider-wide ceiling shared
//! by all credentials of that provider. Windows run on monotonic time.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::core::config;
use crate::source::Provider;

/// Limits enforced by the gate.
#[derive(Debug, Clone)]
pub struct RateLimits {
    /// Requests allowed per credential within one credential window
    pub per_credential: u32,
    /// Length of the per-credential window (the cooldown)
    pub credential_window: Duration,
    /// Aggregate requests allowed per provider within the provider window
    pub provider_ceiling: u32,
    /// Length of the provider-wide window
    pub provider_window: Duration,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            per_credential: config::rate::PER_CREDENTIAL_PER_WINDOW,
            credential_window: config::credentials::cooldown(),
            provider_ceiling: config::rate::PROVIDER_CEILING,
            provider_window: config::rate::provider_window(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u32,
    started: Instant,
}

impl RateWindow {
    /// A window admits a request when it has rolled over or still has budget.
    fn admits(&self, limit: u32, window: Duration, now: Instant) -> bool {
        now.duration_since(self.started) >= window || self.count < limit
    }

    /// Roll the window if it has elapsed, otherwise spend one unit of budget.
    fn stamp(&mut self, window: Duration, now: Instant) {
        if now.duration_since(self.started) >= window {
            self.started = now;
            self.count = 1;
        } else {
            self.count += 1;
        }
    }
}

#[derive(Default)]
struct GateInner {
    credentials: HashMap<Uuid, RateWindow>,
    providers: HashMap<Provider, RateWindow>,
}

/// Shared rate gate. The credential pool checks `permit` while selecting and
/// calls `record` for the winner under its own lock, so check-then-stamp is
/// atomic with respect to other acquisitions.
#[derive(Clone)]
pub struct RateGate {
    limits: RateLimits,
    inner: Arc<Mutex<GateInner>>,
}

impl RateGate {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            inner: Arc::new(Mutex::new(GateInner::default())),
        }
    }

    /// The limits this gate enforces.
    pub fn limits(&self) -> &RateLimits {
        &self.limits
    }

    /// Whether `credential_id` may be used for `provider` right now.
    /// Pure check; call `record` to actually spend the budget.
    pub async fn permit(&self, provider: Provider, credential_id: Uuid) -> bool {
        let now = Instant::now();
        let inner = self.inner.lock().await;

        let credential_ok = inner
            .credentials
            .get(&credential_id)
            .map(|w| w.admits(self.limits.per_credential, self.limits.credential_window, now))
            .unwrap_or(true);

        let provider_ok = inner
            .providers
            .get(&provider)
            .map(|w| w.admits(self.limits.provider_ceiling, self.limits.provider_window, now))
            .unwrap_or(true);

        credential_ok && provider_ok
    }

    /// Spend one unit of budget in both windows.
    pub async fn record(&self, provider: Provider, credential_id: Uuid) {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        inner
            .credentials
            .entry(credential_id)
            .and_modify(|w| w.stamp(self.limits.credential_window, now))
            .or_insert(RateWindow { count: 1, started: now });

        inner
            .providers
            .entry(provider)
            .and_modify(|w| w.stamp(self.limits.provider_window, now))
            .or_insert(RateWindow { count: 1, started: now });
    }

    /// Pre-load a credential window with `remaining` time left on it.
    /// Used at startup to carry persisted cooldowns across a restart.
    pub async fn block_for(&self, credential_id: Uuid, remaining: Duration) {
        let window = self.limits.credential_window;
        let remaining = remaining.min(window);
        let now = Instant::now();

        // Shift the window start back so exactly `remaining` is left. A process
        // clock younger than the shift falls back to a full window.
        let started = now.checked_sub(window - remaining).unwrap_or(now);

        let mut inner = self.inner.lock().await;
        inner.credentials.insert(
            credential_id,
            RateWindow {
                count: self.limits.per_credential.max(1),
                started,
            },
        );
    }

    /// How long until `credential_id` is admitted again, if it is blocked.
    pub async fn remaining_cooldown(&self, credential_id: Uuid) -> Option<Duration> {
        let now = Instant::now();
        let inner = self.inner.lock().await;

        let window = inner.credentials.get(&credential_id)?;
        if window.admits(self.limits.per_credential, self.limits.credential_window, now) {
            return None;
        }
        Some(self.limits.credential_window - now.duration_since(window.started))
    }

    /// Whether the provider-wide ceiling alone would reject a request.
    pub async fn provider_saturated(&self, provider: Provider) -> bool {
        let now = Instant::now();
        let inner = self.inner.lock().await;

        inner
            .providers
            .get(&provider)
            .map(|w| !w.admits(self.limits.provider_ceiling, self.limits.provider_window, now))
            .unwrap_or(false)
    }
}

impl Default for RateGate {
    fn default() -> Self {
        Self::new(RateLimits::default())
    }
}

//! Credential rotation pool.
//!
//! Holds the cookies and API keys the extraction backends authenticate with,
//! hands them out one worker at a time, and takes them out of rotation when
//! a provider starts rejecting them. Selection is least-recently-used among
//! the credentials the rate gate admits, so load spreads evenly and no
//! account burns through its cooldown budget.
//!
//! Payloads live behind `secrecy::SecretString` and never reach `Debug`
//! output, logs or the management views.

pub mod import;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use strum::IntoEnumIterator;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use crate::core::error::{EngineError, EngineResult};
use crate::core::metrics;
use crate::rate::RateGate;
use crate::source::Provider;
use crate::storage::db::StoredCredential;
use crate::storage::{self, DbPool};

/// What kind of secret a credential carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum CredentialKind {
    /// Netscape-format browser cookie export
    CookieFile,
    /// Provider API key or token
    ApiKey,
}

/// How the job that held the lease ended. Drives failure accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The attempt succeeded; consecutive-failure count resets
    Success,
    /// The attempt failed for reasons unrelated to the credential
    Failure,
    /// The provider rejected the credential itself
    AuthFailure,
    /// The job was cancelled before the credential was really used
    Cancelled,
}

/// Pool state changes, published for operational reporting.
#[derive(Debug, Clone)]
pub enum CredentialEvent {
    /// A credential entered the pool
    Added { id: Uuid, provider: Provider },
    /// A credential was taken out of rotation
    Quarantined { id: Uuid, provider: Provider },
    /// A credential returned to rotation
    Reset { id: Uuid, provider: Provider },
}

/// A reserved credential, held by exactly one worker from `acquire` to
/// `release`. Dropping a lease without releasing it leaves the credential
/// reserved, so workers release on every path, including cancellation.
#[derive(Debug, Clone)]
pub struct CredentialLease {
    /// Credential id, used for release and rate accounting
    pub id: Uuid,
    /// Provider the credential belongs to
    pub provider: Provider,
    /// Kind of secret behind the lease
    pub kind: CredentialKind,
    payload: Arc<SecretString>,
}

impl CredentialLease {
    /// The secret payload, for handing to an extraction backend.
    pub fn expose_payload(&self) -> &str {
        self.payload.expose_secret()
    }
}

/// Redacted, serializable projection of a credential for the management
/// surface. Carries everything except the payload.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialView {
    pub id: Uuid,
    pub provider: Provider,
    pub kind: CredentialKind,
    /// Operator-facing handle (source file name, "remote-bundle", …)
    pub label: Option<String>,
    pub reserved: bool,
    pub quarantined: bool,
    pub failure_count: u32,
    pub last_used_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub added_at: DateTime<Utc>,
}

struct CredentialRecord {
    id: Uuid,
    provider: Provider,
    kind: CredentialKind,
    label: Option<String>,
    payload: Arc<SecretString>,
    reserved: bool,
    quarantined: bool,
    quarantined_at: Option<DateTime<Utc>>,
    failure_count: u32,
    last_used_at: Option<DateTime<Utc>>,
    cooldown_until: Option<DateTime<Utc>>,
    added_at: DateTime<Utc>,
}

impl CredentialRecord {
    fn view(&self) -> CredentialView {
        CredentialView {
            id: self.id,
            provider: self.provider,
            kind: self.kind,
            label: self.label.clone(),
            reserved: self.reserved,
            quarantined: self.quarantined,
            failure_count: self.failure_count,
            last_used_at: self.last_used_at,
            cooldown_until: self.cooldown_until,
            added_at: self.added_at,
        }
    }

    fn to_stored(&self) -> StoredCredential {
        StoredCredential {
            id: self.id,
            provider: self.provider,
            kind: self.kind,
            label: self.label.clone(),
            payload: self.payload.clone(),
            quarantined: self.quarantined,
            quarantined_at: self.quarantined_at,
            failure_count: self.failure_count,
            last_used_at: self.last_used_at,
            cooldown_until: self.cooldown_until,
            added_at: self.added_at,
        }
    }

    fn from_stored(stored: StoredCredential) -> Self {
        Self {
            id: stored.id,
            provider: stored.provider,
            kind: stored.kind,
            label: stored.label,
            payload: stored.payload,
            // Reservations never survive a restart; the jobs that held them
            // are re-queued anyway.
            reserved: false,
            quarantined: stored.quarantined,
            quarantined_at: stored.quarantined_at,
            failure_count: stored.failure_count,
            last_used_at: stored.last_used_at,
            cooldown_until: stored.cooldown_until,
            added_at: stored.added_at,
        }
    }
}

/// The rotation pool. All mutation happens under one `tokio::sync::Mutex`,
/// so selection-and-reservation is atomic and release is commutative.
pub struct CredentialPool {
    inner: Mutex<HashMap<Uuid, CredentialRecord>>,
    gate: Arc<RateGate>,
    events: broadcast::Sender<CredentialEvent>,
    quarantine_threshold: u32,
    quarantine_ttl: Option<Duration>,
    db: Option<DbPool>,
}

impl CredentialPool {
    /// Create a pool gated by `gate`.
    ///
    /// `quarantine_ttl` of `None` means quarantined credentials stay out of
    /// rotation until an operator resets them. When the pool has a database
    /// every state change is written through (failures are logged, never
    /// surfaced to the calling job).
    pub fn new(gate: Arc<RateGate>, quarantine_threshold: u32, quarantine_ttl: Option<Duration>, db: Option<DbPool>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Mutex::new(HashMap::new()),
            gate,
            events,
            quarantine_threshold,
            quarantine_ttl,
            db,
        }
    }

    /// Subscribe to pool state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<CredentialEvent> {
        self.events.subscribe()
    }

    /// Reserve the least-recently-used usable credential for `provider`.
    ///
    /// Usable means: not reserved, not quarantined, and admitted by the rate
    /// gate. The winner is reserved and its rate window stamped before the
    /// lock drops, so two workers can never hold the same credential.
    pub async fn acquire(&self, provider: Provider) -> EngineResult<CredentialLease> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        self.serve_quarantine_ttl(&mut inner, provider, now);

        let mut total = 0usize;
        let mut reserved_n = 0usize;
        let mut quarantined_n = 0usize;
        let mut gated_n = 0usize;
        let mut best: Option<(Option<DateTime<Utc>>, DateTime<Utc>, Uuid)> = None;

        for record in inner.values().filter(|r| r.provider == provider) {
            total += 1;
            if record.reserved {
                reserved_n += 1;
                continue;
            }
            if record.quarantined {
                quarantined_n += 1;
                continue;
            }
            if !self.gate.permit(provider, record.id).await {
                gated_n += 1;
                continue;
            }

            let key = (record.last_used_at, record.added_at, record.id);
            if best.map(|b| key < b).unwrap_or(true) {
                best = Some(key);
            }
        }

        let Some((_, _, id)) = best else {
            log::warn!(
                "⚠️ No usable credential for {} ({} total: {} reserved, {} quarantined, {} cooling down)",
                provider,
                total,
                reserved_n,
                quarantined_n,
                gated_n
            );
            return Err(EngineError::NoCredentials { provider });
        };

        self.gate.record(provider, id).await;

        // The id came out of the map two lines up; the entry is still there
        // because we hold the lock.
        let cooldown = self.gate.limits().credential_window;
        let lease = match inner.get_mut(&id) {
            Some(record) => {
                record.reserved = true;
                record.cooldown_until =
                    now.checked_add_signed(chrono::Duration::from_std(cooldown).unwrap_or_else(|_| chrono::Duration::zero()));
                self.persist(record);
                CredentialLease {
                    id: record.id,
                    provider: record.provider,
                    kind: record.kind,
                    payload: record.payload.clone(),
                }
            }
            None => return Err(EngineError::NoCredentials { provider }),
        };

        refresh_gauges(&inner);
        log::debug!("🔑 Leased credential {} for {}", lease.id, provider);
        Ok(lease)
    }

    /// Return a lease and apply the outcome of the job that held it.
    pub async fn release(&self, lease: &CredentialLease, outcome: ReleaseOutcome) {
        let mut inner = self.inner.lock().await;

        let Some(record) = inner.get_mut(&lease.id) else {
            log::warn!("Released unknown credential {}", lease.id);
            return;
        };

        record.reserved = false;
        record.last_used_at = Some(Utc::now());

        match outcome {
            ReleaseOutcome::Success => {
                record.failure_count = 0;
            }
            ReleaseOutcome::AuthFailure => {
                record.failure_count += 1;
                log::warn!(
                    "🔑 Credential {} ({}) auth failure {}/{}",
                    record.id,
                    record.provider,
                    record.failure_count,
                    self.quarantine_threshold
                );
                if record.failure_count >= self.quarantine_threshold && !record.quarantined {
                    record.quarantined = true;
                    record.quarantined_at = Some(Utc::now());
                    log::warn!(
                        "🚫 Credential {} ({}) quarantined after {} consecutive auth failures",
                        record.id,
                        record.provider,
                        record.failure_count
                    );
                    metrics::record_credential_quarantine(&record.provider.to_string());
                    let _ = self.events.send(CredentialEvent::Quarantined {
                        id: record.id,
                        provider: record.provider,
                    });
                }
            }
            ReleaseOutcome::Failure | ReleaseOutcome::Cancelled => {}
        }

        self.persist(record);
        refresh_gauges(&inner);
    }

    /// Register a new credential. Takes effect for the next acquisition;
    /// leases already held are untouched.
    pub async fn add(&self, provider: Provider, kind: CredentialKind, payload: SecretString, label: Option<String>) -> Uuid {
        let record = CredentialRecord {
            id: Uuid::new_v4(),
            provider,
            kind,
            label,
            payload: Arc::new(payload),
            reserved: false,
            quarantined: false,
            quarantined_at: None,
            failure_count: 0,
            last_used_at: None,
            cooldown_until: None,
            added_at: Utc::now(),
        };
        let id = record.id;

        let mut inner = self.inner.lock().await;
        self.persist(&record);
        log::info!(
            "🔑 Added {} credential {} for {}{}",
            record.kind,
            id,
            provider,
            record.label.as_deref().map(|l| format!(" ({})", l)).unwrap_or_default()
        );
        inner.insert(id, record);
        refresh_gauges(&inner);
        drop(inner);

        let _ = self.events.send(CredentialEvent::Added { id, provider });
        id
    }

    /// Take a credential out of rotation by hand. Returns `false` for an
    /// unknown id.
    pub async fn quarantine(&self, id: Uuid) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.get_mut(&id) else {
            return false;
        };

        if !record.quarantined {
            record.quarantined = true;
            record.quarantined_at = Some(Utc::now());
            log::warn!("🚫 Credential {} ({}) quarantined by operator", id, record.provider);
            metrics::record_credential_quarantine(&record.provider.to_string());
            let provider = record.provider;
            self.persist(record);
            refresh_gauges(&inner);
            let _ = self.events.send(CredentialEvent::Quarantined { id, provider });
        }
        true
    }

    /// Clear quarantine and failure accounting. Returns `false` for an
    /// unknown id.
    pub async fn reset(&self, id: Uuid) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.get_mut(&id) else {
            return false;
        };

        record.quarantined = false;
        record.quarantined_at = None;
        record.failure_count = 0;
        log::info!("♻️ Credential {} ({}) reset", id, record.provider);
        let provider = record.provider;
        self.persist(record);
        refresh_gauges(&inner);
        let _ = self.events.send(CredentialEvent::Reset { id, provider });
        true
    }

    /// Redacted views, optionally filtered by provider, ordered by provider
    /// then age.
    pub async fn list(&self, provider: Option<Provider>) -> Vec<CredentialView> {
        let inner = self.inner.lock().await;
        inner
            .values()
            .filter(|r| provider.map(|p| r.provider == p).unwrap_or(true))
            .map(CredentialRecord::view)
            .sorted_by_key(|v| (v.provider.to_string(), v.added_at))
            .collect()
    }

    /// Hydrate the pool from persisted rows at startup. Returns how many
    /// credentials were restored.
    pub async fn restore(&self, stored: Vec<StoredCredential>) -> usize {
        let mut inner = self.inner.lock().await;
        let mut restored = 0usize;

        for row in stored {
            let record = CredentialRecord::from_stored(row);
            inner.insert(record.id, record);
            restored += 1;
        }

        refresh_gauges(&inner);
        restored
    }

    /// Credentials currently usable for `provider` (not reserved, not
    /// quarantined; the rate gate is not consulted).
    pub async fn usable_count(&self, provider: Provider) -> usize {
        let inner = self.inner.lock().await;
        inner
            .values()
            .filter(|r| r.provider == provider && !r.reserved && !r.quarantined)
            .count()
    }

    /// Release quarantined credentials whose TTL has elapsed. No-op unless a
    /// TTL is configured.
    fn serve_quarantine_ttl(&self, inner: &mut HashMap<Uuid, CredentialRecord>, provider: Provider, now: DateTime<Utc>) {
        let Some(ttl) = self.quarantine_ttl else {
            return;
        };

        for record in inner.values_mut().filter(|r| r.provider == provider && r.quarantined) {
            let served = record
                .quarantined_at
                .map(|at| (now - at).to_std().map(|elapsed| elapsed >= ttl).unwrap_or(false))
                .unwrap_or(true);

            if served {
                record.quarantined = false;
                record.quarantined_at = None;
                record.failure_count = 0;
                log::info!(
                    "♻️ Credential {} ({}) released from quarantine after TTL",
                    record.id,
                    record.provider
                );
                self.persist(record);
                let _ = self.events.send(CredentialEvent::Reset {
                    id: record.id,
                    provider: record.provider,
                });
            }
        }
    }

    /// Write-through to the credential table. Persistence trouble is logged
    /// and counted; it never fails the calling operation.
    fn persist(&self, record: &CredentialRecord) {
        let Some(ref db) = self.db else {
            return;
        };

        match storage::get_connection(db) {
            Ok(conn) => {
                if let Err(e) = storage::db::save_credential(&conn, &record.to_stored()) {
                    log::error!("Failed to persist credential {}: {}", record.id, e);
                    metrics::record_error("database", "credential_save");
                }
            }
            Err(e) => {
                log::error!("Failed to get DB connection for credential {}: {}", record.id, e);
                metrics::record_error("database", "connection");
            }
        }
    }
}

fn refresh_gauges(inner: &HashMap<Uuid, CredentialRecord>) {
    for provider in Provider::iter() {
        let usable = inner
            .values()
            .filter(|r| r.provider == provider && !r.reserved && !r.quarantined)
            .count();
        metrics::update_credentials_available(&provider.to_string(), usable);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate::RateLimits;
    use pretty_assertions::assert_eq;
    use tokio::time::Duration as TokioDuration;

    fn wide_open_limits() -> RateLimits {
        RateLimits {
            per_credential: u32::MAX,
            credential_window: TokioDuration::from_secs(1),
            provider_ceiling: u32::MAX,
            provider_window: TokioDuration::from_secs(1),
        }
    }

    fn pool_with_limits(limits: RateLimits) -> CredentialPool {
        CredentialPool::new(Arc::new(RateGate::new(limits)), 3, None, None)
    }

    fn secret(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    #[tokio::test]
    async fn test_acquire_reserves_exclusively() {
        let pool = pool_with_limits(wide_open_limits());
        pool.add(Provider::YouTube, CredentialKind::CookieFile, secret("c1"), None)
            .await;

        let lease = pool.acquire(Provider::YouTube).await.unwrap();

        // Same credential cannot be handed out twice
        assert!(matches!(
            pool.acquire(Provider::YouTube).await,
            Err(EngineError::NoCredentials { .. })
        ));

        pool.release(&lease, ReleaseOutcome::Success).await;
        assert!(pool.acquire(Provider::YouTube).await.is_ok());
    }

    #[tokio::test]
    async fn test_acquire_empty_pool() {
        let pool = pool_with_limits(wide_open_limits());
        assert!(matches!(
            pool.acquire(Provider::Spotify).await,
            Err(EngineError::NoCredentials {
                provider: Provider::Spotify
            })
        ));
    }

    #[tokio::test]
    async fn test_acquire_ignores_other_providers() {
        let pool = pool_with_limits(wide_open_limits());
        pool.add(Provider::SoundCloud, CredentialKind::ApiKey, secret("k"), None)
            .await;

        assert!(pool.acquire(Provider::YouTube).await.is_err());
        assert!(pool.acquire(Provider::SoundCloud).await.is_ok());
    }

    #[tokio::test]
    async fn test_lru_prefers_never_used_then_stalest() {
        let pool = pool_with_limits(wide_open_limits());
        pool.add(Provider::YouTube, CredentialKind::CookieFile, secret("a"), None)
            .await;
        pool.add(Provider::YouTube, CredentialKind::CookieFile, secret("b"), None)
            .await;

        let first = pool.acquire(Provider::YouTube).await.unwrap();
        pool.release(&first, ReleaseOutcome::Success).await;

        // The other credential has never been used and must win now
        let second = pool.acquire(Provider::YouTube).await.unwrap();
        assert_ne!(first.id, second.id);
        pool.release(&second, ReleaseOutcome::Success).await;

        // Both used once; the stalest (first) rotates back in
        let third = pool.acquire(Provider::YouTube).await.unwrap();
        assert_eq!(third.id, first.id);
    }

    #[tokio::test]
    async fn test_quarantine_after_consecutive_auth_failures() {
        let pool = pool_with_limits(wide_open_limits());
        let id = pool
            .add(Provider::YouTube, CredentialKind::CookieFile, secret("c"), None)
            .await;

        for _ in 0..3 {
            let lease = pool.acquire(Provider::YouTube).await.unwrap();
            pool.release(&lease, ReleaseOutcome::AuthFailure).await;
        }

        let views = pool.list(Some(Provider::YouTube)).await;
        assert_eq!(views.len(), 1);
        assert!(views[0].quarantined);
        assert_eq!(views[0].failure_count, 3);
        assert_eq!(views[0].id, id);

        // Quarantined credentials are not usable
        assert!(pool.acquire(Provider::YouTube).await.is_err());
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let pool = pool_with_limits(wide_open_limits());
        pool.add(Provider::YouTube, CredentialKind::CookieFile, secret("c"), None)
            .await;

        for _ in 0..2 {
            let lease = pool.acquire(Provider::YouTube).await.unwrap();
            pool.release(&lease, ReleaseOutcome::AuthFailure).await;
        }
        let lease = pool.acquire(Provider::YouTube).await.unwrap();
        pool.release(&lease, ReleaseOutcome::Success).await;

        // Two more failures are not enough after the reset
        for _ in 0..2 {
            let lease = pool.acquire(Provider::YouTube).await.unwrap();
            pool.release(&lease, ReleaseOutcome::AuthFailure).await;
        }

        let views = pool.list(None).await;
        assert!(!views[0].quarantined);
        assert_eq!(views[0].failure_count, 2);
    }

    #[tokio::test]
    async fn test_plain_failure_leaves_counter_untouched() {
        let pool = pool_with_limits(wide_open_limits());
        pool.add(Provider::YouTube, CredentialKind::CookieFile, secret("c"), None)
            .await;

        for _ in 0..5 {
            let lease = pool.acquire(Provider::YouTube).await.unwrap();
            pool.release(&lease, ReleaseOutcome::Failure).await;
        }

        let views = pool.list(None).await;
        assert!(!views[0].quarantined);
        assert_eq!(views[0].failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_blocks_second_acquire_until_window_rolls() {
        let limits = RateLimits {
            per_credential: 1,
            credential_window: TokioDuration::from_secs(10),
            provider_ceiling: u32::MAX,
            provider_window: TokioDuration::from_secs(10),
        };
        let pool = pool_with_limits(limits);
        pool.add(Provider::YouTube, CredentialKind::CookieFile, secret("c"), None)
            .await;

        let lease = pool.acquire(Provider::YouTube).await.unwrap();
        pool.release(&lease, ReleaseOutcome::Success).await;

        // Released but still cooling down
        assert!(pool.acquire(Provider::YouTube).await.is_err());

        tokio::time::advance(TokioDuration::from_secs(10)).await;
        assert!(pool.acquire(Provider::YouTube).await.is_ok());
    }

    #[tokio::test]
    async fn test_manual_quarantine_and_reset() {
        let pool = pool_with_limits(wide_open_limits());
        let id = pool
            .add(Provider::Instagram, CredentialKind::ApiKey, secret("k"), None)
            .await;

        assert!(pool.quarantine(id).await);
        assert!(pool.acquire(Provider::Instagram).await.is_err());

        assert!(pool.reset(id).await);
        assert!(pool.acquire(Provider::Instagram).await.is_ok());

        assert!(!pool.quarantine(Uuid::new_v4()).await);
        assert!(!pool.reset(Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn test_quarantine_ttl_releases_credential() {
        let gate = Arc::new(RateGate::new(wide_open_limits()));
        let pool = CredentialPool::new(gate, 3, Some(Duration::ZERO), None);
        let id = pool
            .add(Provider::YouTube, CredentialKind::CookieFile, secret("c"), None)
            .await;

        pool.quarantine(id).await;

        // TTL of zero means the next acquire already lifts the quarantine
        let lease = pool.acquire(Provider::YouTube).await.unwrap();
        assert_eq!(lease.id, id);

        let views = pool.list(None).await;
        assert!(!views[0].quarantined);
        assert_eq!(views[0].failure_count, 0);
    }

    #[tokio::test]
    async fn test_events_published() {
        let pool = pool_with_limits(wide_open_limits());
        let mut events = pool.subscribe();

        let id = pool
            .add(Provider::YouTube, CredentialKind::CookieFile, secret("c"), None)
            .await;
        pool.quarantine(id).await;
        pool.reset(id).await;

        assert!(matches!(events.recv().await, Ok(CredentialEvent::Added { .. })));
        assert!(matches!(events.recv().await, Ok(CredentialEvent::Quarantined { .. })));
        assert!(matches!(events.recv().await, Ok(CredentialEvent::Reset { .. })));
    }

    #[tokio::test]
    async fn test_view_carries_no_payload() {
        let pool = pool_with_limits(wide_open_limits());
        pool.add(
            Provider::YouTube,
            CredentialKind::CookieFile,
            secret("super-secret-cookie"),
            Some("main.txt".to_string()),
        )
        .await;

        let views = pool.list(None).await;
        let json = serde_json::to_string(&views).unwrap();
        assert!(!json.contains("super-secret-cookie"));
        assert!(json.contains("main.txt"));
    }

    #[tokio::test]
    async fn test_lease_debug_redacts_payload() {
        let pool = pool_with_limits(wide_open_limits());
        pool.add(Provider::YouTube, CredentialKind::CookieFile, secret("super-secret"), None)
            .await;

        let lease = pool.acquire(Provider::YouTube).await.unwrap();
        let debug = format!("{:?}", lease);
        assert!(!debug.contains("super-secret"));
        assert_eq!(lease.expose_payload(), "super-secret");
    }
}

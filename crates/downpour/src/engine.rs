//! Engine facade: the one front door for submissions, cancellation, status
//! queries, credential management and lifecycle.
//!
//! `Engine::start` assembles the rate gate, credential pool, fair queue,
//! worker pool and retention sweeper from an [`EngineConfig`], restores
//! persisted state when a database is configured, and returns the running
//! engine. `shutdown` closes the queue, fires the root cancellation token
//! and joins every spawned task.

use std::sync::Arc;

use bon::Builder;
use chrono::Utc;
use dashmap::DashMap;
use secrecy::SecretString;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use url::Url;
use uuid::Uuid;

use crate::cache::MetadataCache;
use crate::core::config;
use crate::core::error::{EngineError, EngineResult};
use crate::core::metrics;
use crate::core::retry::RetryConfig;
use crate::credentials::import::{self, ImportSummary};
use crate::credentials::{CredentialEvent, CredentialKind, CredentialPool, CredentialView};
use crate::progress::{LogReporter, ProgressReporter, TerminalUpdate};
use crate::queue::{Job, JobQueue, JobRequest, JobState, JobView, Ticket};
use crate::rate::{RateGate, RateLimits};
use crate::source::{Provider, SourceRegistry, Transcoder};
use crate::storage::{self, DbPool};
use crate::workers::WorkerPool;

struct JobEntry {
    job: Job,
    cancel: CancellationToken,
    /// Set when the job reaches a terminal state; drives retention eviction
    terminal_at: Option<Instant>,
}

/// Active job registry shared by the engine facade and the workers.
///
/// Entries live from submission until the retention window past their
/// terminal report. All accessors clone out of the map so no guard is ever
/// held across an await.
pub(crate) struct JobTable {
    entries: DashMap<Uuid, JobEntry>,
}

impl JobTable {
    fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    fn insert(&self, job: Job, cancel: CancellationToken) {
        self.entries.insert(
            job.id,
            JobEntry {
                job,
                cancel,
                terminal_at: None,
            },
        );
    }

    fn remove(&self, job_id: Uuid) {
        self.entries.remove(&job_id);
    }

    pub(crate) fn snapshot(&self, job_id: Uuid) -> Option<Job> {
        self.entries.get(&job_id).map(|e| e.job.clone())
    }

    /// Job snapshot plus its cancellation token, for a worker picking up a
    /// dispatched ticket.
    pub(crate) fn checkout(&self, job_id: Uuid) -> Option<(Job, CancellationToken)> {
        self.entries.get(&job_id).map(|e| (e.job.clone(), e.cancel.clone()))
    }

    fn view(&self, job_id: Uuid) -> Option<JobView> {
        self.entries.get(&job_id).map(|e| e.job.view())
    }

    fn cancel_state(&self, job_id: Uuid) -> Option<(JobState, CancellationToken)> {
        self.entries.get(&job_id).map(|e| (e.job.state, e.cancel.clone()))
    }

    pub(crate) fn set_running(&self, job_id: Uuid) {
        if let Some(mut entry) = self.entries.get_mut(&job_id) {
            if !entry.job.state.is_terminal() {
                entry.job.state = JobState::Running;
            }
        }
    }

    pub(crate) fn set_attempts(&self, job_id: Uuid, attempts: u32) {
        if let Some(mut entry) = self.entries.get_mut(&job_id) {
            entry.job.attempts = attempts;
        }
    }

    /// Write a terminal state. The first writer wins; anything later is a
    /// no-op so a cancel racing a worker cannot flip a settled job.
    pub(crate) fn finish(
        &self,
        job_id: Uuid,
        state: JobState,
        last_error: Option<String>,
        artifact_path: Option<String>,
    ) -> bool {
        match self.entries.get_mut(&job_id) {
            Some(mut entry) if !entry.job.state.is_terminal() => {
                entry.job.state = state;
                entry.job.last_error = last_error;
                entry.job.artifact_path = artifact_path;
                entry.terminal_at = Some(Instant::now());
                true
            }
            _ => false,
        }
    }

    /// Drop terminal entries older than `retention`. Returns how many were
    /// evicted.
    fn evict_expired(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| match entry.terminal_at {
            Some(at) => now.duration_since(at) < retention,
            None => true,
        });
        before - self.entries.len()
    }
}

/// Shared state wired through the worker pool.
pub(crate) struct EngineContext {
    pub(crate) queue: Arc<JobQueue>,
    pub(crate) jobs: Arc<JobTable>,
    pub(crate) credentials: Arc<CredentialPool>,
    pub(crate) sources: Arc<SourceRegistry>,
    pub(crate) transcoder: Option<Arc<dyn Transcoder>>,
    pub(crate) cache: Arc<MetadataCache>,
    pub(crate) reporter: Arc<dyn ProgressReporter>,
    pub(crate) db: Option<DbPool>,
    pub(crate) retry: RetryConfig,
    pub(crate) call_timeout: Duration,
    pub(crate) progress_interval: Duration,
    pub(crate) inter_start_delay: Duration,
    pub(crate) download_dir: String,
    pub(crate) max_file_size: u64,
    pub(crate) max_duration_secs: u32,
    /// Instant of the last job start anywhere in the pool, for pacing
    pub(crate) last_start: Mutex<Option<Instant>>,
}

impl EngineContext {
    /// Write-through of the current job row. Persistence trouble is logged
    /// and counted; it never fails the calling operation.
    pub(crate) fn persist_job(&self, job_id: Uuid) {
        let Some(ref db) = self.db else {
            return;
        };
        let Some(job) = self.jobs.snapshot(job_id) else {
            return;
        };

        match storage::get_connection(db) {
            Ok(conn) => {
                if let Err(e) = storage::db::save_job(&conn, &job) {
                    log::error!("Failed to persist job {}: {}", job_id, e);
                    metrics::record_error("database", "job_save");
                }
            }
            Err(e) => {
                log::error!("Failed to get DB connection for job {}: {}", job_id, e);
                metrics::record_error("database", "connection");
            }
        }
    }
}

/// Engine assembly options.
///
/// Every knob defaults to its `core::config` constant; the source registry
/// is the only piece an embedder must provide for downloads to work.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use downpour::engine::{Engine, EngineConfig};
/// use downpour::source::SourceRegistry;
///
/// # async fn example() -> downpour::EngineResult<()> {
/// let config = EngineConfig::builder()
///     .sources(Arc::new(SourceRegistry::new()))
///     .worker_count(2)
///     .build();
/// let engine = Engine::start(config).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Builder)]
pub struct EngineConfig {
    /// Extraction backends, keyed by provider
    pub sources: Arc<SourceRegistry>,
    /// Converter for format mismatches; the transcode step is skipped when absent
    pub transcoder: Option<Arc<dyn Transcoder>>,
    /// Progress sink; the log-only reporter when absent
    pub reporter: Option<Arc<dyn ProgressReporter>>,
    /// SQLite pool for restart resilience; in-memory only when absent
    pub db: Option<DbPool>,
    /// Number of concurrent download workers
    #[builder(default = config::workers::MAX_CONCURRENT)]
    pub worker_count: usize,
    /// Pending bound of the fair queue
    #[builder(default = config::queue::MAX_PENDING)]
    pub queue_capacity: usize,
    /// Maximum jobs one user may have running at once
    #[builder(default = config::queue::PER_USER_RUNNING_CAP)]
    pub per_user_running_cap: usize,
    /// Cooldown and ceiling windows enforced by the rate gate
    #[builder(default)]
    pub rate_limits: RateLimits,
    /// Retry policy applied to each job's download attempts
    #[builder(default = RetryConfig::transfer())]
    pub retry: RetryConfig,
    /// Consecutive auth failures before a credential is quarantined
    #[builder(default = config::credentials::QUARANTINE_THRESHOLD)]
    pub quarantine_threshold: u32,
    /// Quarantined credentials return to rotation after this long;
    /// manual reset only when absent
    pub quarantine_ttl: Option<Duration>,
    /// Minimum interval between accepted submissions per user; off when absent
    pub submit_cooldown: Option<Duration>,
    /// Deadline for a single external call (resolve, transfer, transcode)
    #[builder(default = config::network::call_timeout())]
    pub call_timeout: Duration,
    /// Interval between forwarded progress events
    #[builder(default = config::progress::update_interval())]
    pub progress_interval: Duration,
    /// Global delay between job starts across the pool
    #[builder(default = config::workers::inter_start_delay())]
    pub inter_start_delay: Duration,
    /// How long terminal jobs stay queryable before eviction
    #[builder(default = config::progress::retention())]
    pub retention: Duration,
    /// Directory download artifacts land in
    #[builder(into, default = config::DOWNLOAD_DIR.clone())]
    pub download_dir: String,
    /// Admission limit on reported media size
    #[builder(default = config::limits::MAX_FILE_SIZE_BYTES)]
    pub max_file_size: u64,
    /// Admission limit on reported media duration
    #[builder(default = config::limits::MAX_MEDIA_DURATION_SECS)]
    pub max_duration_secs: u32,
    /// Metadata cache TTL
    #[builder(default = config::cache::metadata_ttl())]
    pub metadata_ttl: Duration,
    /// Metadata cache capacity
    #[builder(default = config::cache::METADATA_CAPACITY)]
    pub metadata_capacity: u64,
}

/// The download orchestration engine.
///
/// One instance owns the queue, the credential pool, the worker pool and
/// the retention sweeper. All methods take `&self`; the engine is made to
/// live behind an `Arc` shared with the embedding front end.
pub struct Engine {
    ctx: Arc<EngineContext>,
    workers: WorkerPool,
    tasks: TaskTracker,
    root: CancellationToken,
    submit_cooldown: Option<Duration>,
    submit_marks: DashMap<i64, Instant>,
}

impl Engine {
    /// Assemble and start the engine.
    ///
    /// When a database is configured this restores persisted state first:
    /// credentials come back with their cooldown windows pre-loaded, jobs
    /// interrupted mid-run are re-queued with `attempts` preserved, pending
    /// jobs rejoin the queue. Workers start only after restore so nothing
    /// dispatches against half-restored state.
    pub async fn start(config: EngineConfig) -> EngineResult<Self> {
        metrics::init_metrics();

        let gate = Arc::new(RateGate::new(config.rate_limits));
        let credentials = Arc::new(CredentialPool::new(
            Arc::clone(&gate),
            config.quarantine_threshold,
            config.quarantine_ttl,
            config.db.clone(),
        ));
        let queue = Arc::new(JobQueue::new(config.queue_capacity, config.per_user_running_cap));
        let jobs = Arc::new(JobTable::new());
        let reporter = config.reporter.unwrap_or_else(|| Arc::new(LogReporter));
        let cache = Arc::new(MetadataCache::new(config.metadata_ttl, config.metadata_capacity));

        let ctx = Arc::new(EngineContext {
            queue,
            jobs,
            credentials,
            sources: config.sources,
            transcoder: config.transcoder,
            cache,
            reporter,
            db: config.db,
            retry: config.retry,
            call_timeout: config.call_timeout,
            progress_interval: config.progress_interval,
            inter_start_delay: config.inter_start_delay,
            download_dir: config.download_dir,
            max_file_size: config.max_file_size,
            max_duration_secs: config.max_duration_secs,
            last_start: Mutex::new(None),
        });

        let root = CancellationToken::new();

        let restored = restore_state(&ctx, &gate, &root).await?;
        if restored.credentials > 0 || restored.requeued > 0 || restored.pending > 0 {
            log::info!(
                "♻️ Restored {} credentials, re-queued {} interrupted and {} pending jobs",
                restored.credentials,
                restored.requeued,
                restored.pending
            );
        }

        let worker_count = config.worker_count.max(1);
        let workers = WorkerPool::start(Arc::clone(&ctx), worker_count);

        let tasks = TaskTracker::new();
        tasks.spawn(sweep_loop(Arc::clone(&ctx), config.retention, root.clone()));
        tasks.close();

        log::info!(
            "🚀 Engine started: {} workers, queue capacity {}, per-user cap {}",
            worker_count,
            ctx.queue.capacity(),
            config.per_user_running_cap
        );

        Ok(Self {
            ctx,
            workers,
            tasks,
            root,
            submit_cooldown: config.submit_cooldown,
            submit_marks: DashMap::new(),
        })
    }

    /// Validate and admit a submission. Returns the new job's id.
    ///
    /// Rejections never create a job: `QueueFull` on backpressure,
    /// `UserCooldown` when the per-user submit interval has not elapsed,
    /// `UnsupportedUrl`/`InvalidUrl` for URLs no registered source takes.
    pub async fn submit(&self, request: JobRequest) -> EngineResult<Uuid> {
        if self.root.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        if let Some(cooldown) = self.submit_cooldown {
            if let Some(mark) = self.submit_marks.get(&request.user_id) {
                let elapsed = mark.elapsed();
                if elapsed < cooldown {
                    return Err(EngineError::UserCooldown {
                        user_id: request.user_id,
                        retry_after: cooldown - elapsed,
                    });
                }
            }
        }

        let raw_url = request.url.trim();
        if raw_url.len() > config::limits::MAX_URL_LENGTH {
            return Err(EngineError::UnsupportedUrl(format!(
                "URL longer than {} characters",
                config::limits::MAX_URL_LENGTH
            )));
        }
        let url = Url::parse(raw_url)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(EngineError::UnsupportedUrl(raw_url.to_string()));
        }
        let provider =
            Provider::from_url(&url).ok_or_else(|| EngineError::UnsupportedUrl(raw_url.to_string()))?;
        if !self.ctx.sources.supports(&url) {
            return Err(EngineError::UnsupportedUrl(raw_url.to_string()));
        }

        let job = Job::new(request.user_id, provider, url, request.format, request.quality);
        let job_id = job.id;
        let user_id = job.user_id;

        // Register before queueing so a dispatched ticket always finds its entry
        self.ctx.jobs.insert(job, self.root.child_token());
        if let Err(e) = self.ctx.queue.submit(Ticket::new(job_id, user_id)).await {
            self.ctx.jobs.remove(job_id);
            return Err(e);
        }

        self.ctx.persist_job(job_id);
        metrics::record_job_submitted(&provider.to_string(), &request.format.to_string());
        self.submit_marks.insert(user_id, Instant::now());
        log::info!(
            "Job {} queued: user {} wants {} from {}",
            job_id,
            user_id,
            request.format,
            provider
        );
        Ok(job_id)
    }

    /// Request cancellation of a job.
    ///
    /// Still queued: the entry is pulled from the queue and the terminal
    /// state written here. Already running: the job's token fires and the
    /// executing worker settles it cooperatively: in-flight external calls
    /// are allowed to finish or time out, never force-killed.
    ///
    /// # Returns
    ///
    /// `true` when the request took effect; `false` for unknown or already
    /// terminal jobs, so calling twice is harmless.
    pub async fn cancel(&self, job_id: Uuid) -> bool {
        let Some((state, token)) = self.ctx.jobs.cancel_state(job_id) else {
            return false;
        };
        if state.is_terminal() {
            return false;
        }

        token.cancel();

        if state == JobState::Queued && self.ctx.queue.remove(job_id).await {
            // Never dispatched, so no worker will: the engine owns the terminal write
            if self.ctx.jobs.finish(job_id, JobState::Cancelled, None, None) {
                self.ctx.persist_job(job_id);
                metrics::record_job_cancelled();
                self.ctx.reporter.report_terminal(job_id, TerminalUpdate::cancelled()).await;
            }
            log::info!("🚫 Job {} cancelled while queued", job_id);
        }
        true
    }

    /// Current view of a job: the active registry first, then the database
    /// for jobs already evicted past retention.
    pub async fn status(&self, job_id: Uuid) -> Option<JobView> {
        if let Some(view) = self.ctx.jobs.view(job_id) {
            return Some(view);
        }

        let db = self.ctx.db.as_ref()?;
        match storage::get_connection(db) {
            Ok(conn) => match storage::db::get_job(&conn, job_id) {
                Ok(found) => found.map(|job| job.view()),
                Err(e) => {
                    log::warn!("⚠️ Status lookup for job {} failed: {}", job_id, e);
                    None
                }
            },
            Err(e) => {
                log::warn!("⚠️ No DB connection for status lookup: {}", e);
                None
            }
        }
    }

    /// Jobs currently waiting in the queue.
    pub async fn queue_depth(&self) -> usize {
        self.ctx.queue.depth().await
    }

    /// Register a credential for rotation.
    pub async fn add_credential(
        &self,
        provider: Provider,
        kind: CredentialKind,
        payload: SecretString,
        label: Option<String>,
    ) -> Uuid {
        self.ctx.credentials.add(provider, kind, payload, label).await
    }

    /// Take a credential out of rotation by hand.
    pub async fn quarantine_credential(&self, id: Uuid) -> bool {
        self.ctx.credentials.quarantine(id).await
    }

    /// Clear a credential's quarantine and failure accounting.
    pub async fn reset_credential(&self, id: Uuid) -> bool {
        self.ctx.credentials.reset(id).await
    }

    /// Redacted credential views, optionally filtered by provider.
    pub async fn list_credentials(&self, provider: Option<Provider>) -> Vec<CredentialView> {
        self.ctx.credentials.list(provider).await
    }

    /// Credentials currently usable for a provider.
    pub async fn usable_credentials(&self, provider: Provider) -> usize {
        self.ctx.credentials.usable_count(provider).await
    }

    /// Subscribe to credential pool state changes.
    pub fn credential_events(&self) -> broadcast::Receiver<CredentialEvent> {
        self.ctx.credentials.subscribe()
    }

    /// Scan a directory for Netscape cookie files and register each as a
    /// cookie credential.
    pub async fn import_cookie_directory(&self, dir: &str) -> anyhow::Result<ImportSummary> {
        import::import_cookie_directory(&self.ctx.credentials, dir).await
    }

    /// Fetch a cookie bundle over HTTP(S) and register it.
    pub async fn import_remote_credential(&self, provider: Provider, url: &str) -> anyhow::Result<Uuid> {
        import::import_remote(&self.ctx.credentials, provider, url).await
    }

    /// Graceful shutdown: reject new submissions, stop dispatching, fire
    /// the root token so in-flight jobs settle cooperatively, then join
    /// every worker and the sweeper. Idempotent.
    pub async fn shutdown(&self) {
        log::info!("Engine shutting down...");
        self.ctx.queue.close();
        self.root.cancel();
        self.workers.wait().await;
        self.tasks.wait().await;
        log::info!("✅ Engine stopped");
    }
}

struct RestoredState {
    credentials: usize,
    requeued: usize,
    pending: usize,
}

/// Rehydrate pool and queue from the database, in dependency order:
/// credentials (with cooldown windows) before any job can dispatch.
async fn restore_state(
    ctx: &Arc<EngineContext>,
    gate: &RateGate,
    root: &CancellationToken,
) -> EngineResult<RestoredState> {
    let mut restored = RestoredState {
        credentials: 0,
        requeued: 0,
        pending: 0,
    };
    let Some(ref db) = ctx.db else {
        return Ok(restored);
    };

    let conn = storage::get_connection(db)?;

    restored.requeued = storage::db::requeue_interrupted_jobs(&conn)?;

    let stored = storage::db::load_credentials(&conn)?;
    let now = Utc::now();
    for row in &stored {
        // Carry persisted wall-clock cooldowns into the monotonic windows
        if let Some(until) = row.cooldown_until {
            if let Ok(remaining) = (until - now).to_std() {
                gate.block_for(row.id, remaining).await;
            }
        }
    }
    restored.credentials = ctx.credentials.restore(stored).await;

    for job in storage::db::load_pending_jobs(&conn)? {
        let ticket = Ticket::new(job.id, job.user_id);
        ctx.jobs.insert(job.clone(), root.child_token());
        if let Err(e) = ctx.queue.submit(ticket).await {
            // Capacity shrank since the rows were written: leave them
            // queued in the database for the next boot
            log::warn!("⚠️ Could not re-queue job {}: {}", job.id, e);
            ctx.jobs.remove(job.id);
            continue;
        }
        restored.pending += 1;
    }

    Ok(restored)
}

/// Periodic retention sweep: evict terminal entries from the registry and
/// purge terminal rows from the database.
async fn sweep_loop(ctx: Arc<EngineContext>, retention: Duration, shutdown: CancellationToken) {
    let period = (retention / 4).max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let evicted = ctx.jobs.evict_expired(retention);
        if evicted > 0 {
            log::debug!("Evicted {} terminal job entries past retention", evicted);
        }

        if let Some(ref db) = ctx.db {
            match storage::get_connection(db) {
                Ok(conn) => {
                    if let Err(e) = storage::db::purge_terminal_jobs(&conn, retention) {
                        log::warn!("⚠️ Terminal job purge failed: {}", e);
                    }
                }
                Err(e) => log::warn!("⚠️ No DB connection for retention purge: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MediaFormat;
    use pretty_assertions::assert_eq;

    fn table_with_job() -> (JobTable, Uuid) {
        let table = JobTable::new();
        let job = Job::new(
            1,
            Provider::YouTube,
            Url::parse("https://youtu.be/abc").unwrap(),
            MediaFormat::Mp3,
            None,
        );
        let id = job.id;
        table.insert(job, CancellationToken::new());
        (table, id)
    }

    // ==================== Job Table Tests ====================

    #[tokio::test]
    async fn test_first_terminal_write_wins() {
        let (table, id) = table_with_job();

        assert!(table.finish(id, JobState::Succeeded, None, Some("a.mp3".to_string())));
        // A racing cancel must not flip the settled state
        assert!(!table.finish(id, JobState::Cancelled, None, None));

        let view = table.view(id).unwrap();
        assert_eq!(view.state, JobState::Succeeded);
        assert_eq!(view.artifact_path.as_deref(), Some("a.mp3"));
    }

    #[tokio::test]
    async fn test_set_running_ignores_terminal_jobs() {
        let (table, id) = table_with_job();

        table.finish(id, JobState::Cancelled, None, None);
        table.set_running(id);

        assert_eq!(table.view(id).unwrap().state, JobState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_respects_retention() {
        let (table, finished) = table_with_job();
        let running = Job::new(
            2,
            Provider::YouTube,
            Url::parse("https://youtu.be/def").unwrap(),
            MediaFormat::Mp3,
            None,
        );
        let running_id = running.id;
        table.insert(running, CancellationToken::new());

        table.finish(finished, JobState::Failed, Some("timeout".to_string()), None);

        let retention = Duration::from_secs(600);
        tokio::time::advance(Duration::from_secs(599)).await;
        assert_eq!(table.evict_expired(retention), 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(table.evict_expired(retention), 1);

        // Terminal entry gone, the non-terminal one untouched
        assert!(table.view(finished).is_none());
        assert!(table.view(running_id).is_some());
    }

    #[tokio::test]
    async fn test_checkout_returns_job_and_token() {
        let (table, id) = table_with_job();

        let (job, token) = table.checkout(id).unwrap();
        assert_eq!(job.id, id);
        assert!(!token.is_cancelled());

        assert!(table.checkout(Uuid::new_v4()).is_none());
    }
}

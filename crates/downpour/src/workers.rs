//! Worker pool: a fixed set of workers drives jobs through the download
//! pipeline.
//!
//! Each worker runs a loop: fetch ticket → acquire credential → resolve
//! metadata → transfer with progress → optional transcode → report terminal
//! state. Concurrency is bounded by the worker count; per-user limits and
//! provider ceilings are enforced by the queue and the credential pool, not
//! here.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::core::config;
use crate::core::error::{EngineError, EngineResult, ErrorClass};
use crate::core::metrics;
use crate::core::retry::{self, RetryConfig};
use crate::credentials::{CredentialLease, ReleaseOutcome};
use crate::engine::EngineContext;
use crate::progress::{ProgressUpdate, TerminalUpdate};
use crate::queue::{Job, JobState, Ticket};
use crate::source::{MediaMetadata, MediaSource, SourceProgress, TransferOutcome, TransferRequest};

/// Handle over the spawned worker tasks.
///
/// Workers exit on their own once the queue is closed; `wait` then returns
/// after every in-flight job has settled.
pub struct WorkerPool {
    tracker: TaskTracker,
}

impl WorkerPool {
    /// Spawn `count` workers against the shared engine context.
    pub(crate) fn start(context: Arc<EngineContext>, count: usize) -> Self {
        let tracker = TaskTracker::new();
        for worker_id in 0..count {
            tracker.spawn(worker_loop(worker_id, Arc::clone(&context)));
        }
        tracker.close();
        log::info!("Started {} download workers", count);
        Self { tracker }
    }

    /// Wait for every worker to drain and exit. Close the queue first,
    /// otherwise this never returns.
    pub(crate) async fn wait(&self) {
        self.tracker.wait().await;
    }
}

async fn worker_loop(worker_id: usize, ctx: Arc<EngineContext>) {
    log::info!("Worker {} started", worker_id);
    loop {
        match ctx.queue.next_for_worker(config::queue::worker_wait()).await {
            Some(ticket) => process_ticket(&ctx, ticket).await,
            None => {
                if ctx.queue.is_closed() {
                    break;
                }
            }
        }
    }
    log::info!("Worker {} stopped", worker_id);
}

/// Drive one dispatched job to a terminal state.
///
/// Every exit path reports a terminal event, persists the final row and
/// returns the user's running slot to the queue.
async fn process_ticket(ctx: &EngineContext, ticket: Ticket) {
    let job_id = ticket.job_id;

    let Some((job, cancel)) = ctx.jobs.checkout(job_id) else {
        // Cancelled and evicted between dispatch and pickup
        log::warn!("⚠️ No job entry for ticket {}, skipping", job_id);
        ctx.queue.on_finished(ticket.user_id).await;
        return;
    };

    if cancel.is_cancelled() {
        log::info!("🚫 Job {} cancelled before start", job_id);
        ctx.jobs.finish(job_id, JobState::Cancelled, None, None);
        ctx.persist_job(job_id);
        metrics::record_job_cancelled();
        ctx.reporter.report_terminal(job_id, TerminalUpdate::cancelled()).await;
        ctx.queue.on_finished(ticket.user_id).await;
        return;
    }

    pace_start(ctx, job_id).await;

    ctx.jobs.set_running(job_id);
    ctx.persist_job(job_id);
    metrics::WORKERS_BUSY.inc();
    log::info!(
        "📥 Job {} started for user {} ({} → {})",
        job_id,
        job.user_id,
        job.provider,
        job.format
    );

    let started = std::time::Instant::now();
    let base_attempts = job.attempts;
    let budget = ctx.retry.max_retries + 1;
    let mut last_attempt: u32 = 0;

    // Transient failures retry inside `execute`. An auth rejection ends the
    // round instead: the failed credential already took its quarantine
    // accounting at release, and the next round acquires a different one.
    // All rounds share the job's attempt budget.
    let result = loop {
        let round = RetryConfig {
            max_retries: budget.saturating_sub(last_attempt + 1),
            ..ctx.retry.clone()
        };
        let round_base = last_attempt;
        let outcome = retry::execute(&round, &cancel, "download", |attempt| {
            last_attempt = round_base + attempt;
            run_attempt(ctx, &job, base_attempts + round_base + attempt, &cancel)
        })
        .await;

        match &outcome {
            Err(err) if err.class() == ErrorClass::AuthFailure && last_attempt < budget => {
                log::warn!(
                    "🔑 Job {}: credential rejected on attempt {}/{}, swapping credentials",
                    job_id,
                    last_attempt,
                    budget
                );
            }
            _ => break outcome,
        }
    };

    metrics::WORKERS_BUSY.dec();
    let elapsed = started.elapsed();
    let format = job.format.to_string();
    metrics::record_job_attempts(last_attempt);

    match result {
        Ok(artifact_path) => {
            let quality = job.effective_quality();
            metrics::DOWNLOAD_DURATION_SECONDS
                .with_label_values(&[&format, &quality])
                .observe(elapsed.as_secs_f64());
            metrics::record_download_success(&format, &quality);
            metrics::record_provider_download(&job.provider.to_string());
            log::info!(
                "✅ Job {} succeeded in {:.1} s: {}",
                job_id,
                elapsed.as_secs_f64(),
                artifact_path
            );
            ctx.jobs
                .finish(job_id, JobState::Succeeded, None, Some(artifact_path.clone()));
            ctx.persist_job(job_id);
            ctx.reporter
                .report_terminal(job_id, TerminalUpdate::succeeded(artifact_path))
                .await;
        }
        Err(err) if err.class() == ErrorClass::Cancelled => {
            log::info!("🚫 Job {} cancelled after {:.1} s", job_id, elapsed.as_secs_f64());
            ctx.jobs.finish(job_id, JobState::Cancelled, None, None);
            ctx.persist_job(job_id);
            metrics::record_job_cancelled();
            ctx.reporter.report_terminal(job_id, TerminalUpdate::cancelled()).await;
        }
        Err(err) => {
            metrics::record_download_failure(&format, err.short_reason());
            log::error!("❌ Job {} failed after {:.1} s: {}", job_id, elapsed.as_secs_f64(), err);
            ctx.jobs
                .finish(job_id, JobState::Failed, Some(err.to_string()), None);
            ctx.persist_job(job_id);
            ctx.reporter
                .report_terminal(job_id, TerminalUpdate::failed(err.short_reason()))
                .await;
        }
    }

    ctx.queue.on_finished(ticket.user_id).await;
}

/// Enforce the global delay between download starts.
///
/// The lock is held across the sleep so starts are strictly serialized,
/// which is what keeps providers from seeing a burst when several workers
/// pick up jobs at once.
async fn pace_start(ctx: &EngineContext, job_id: Uuid) {
    let mut last_start = ctx.last_start.lock().await;
    if let Some(previous) = *last_start {
        let elapsed = previous.elapsed();
        if elapsed < ctx.inter_start_delay {
            let wait = ctx.inter_start_delay - elapsed;
            log::info!(
                "Waiting {:?} before starting job {} (rate limit protection)",
                wait,
                job_id
            );
            tokio::time::sleep(wait).await;
        }
    }
    *last_start = Some(Instant::now());
}

/// One attempt: lease a credential, run the pipeline against it, release
/// the lease with the matching outcome.
async fn run_attempt(
    ctx: &EngineContext,
    job: &Job,
    attempt: u32,
    cancel: &CancellationToken,
) -> EngineResult<String> {
    ctx.jobs.set_attempts(job.id, attempt);
    ctx.persist_job(job.id);

    // ── Source lookup ──
    let source = ctx
        .sources
        .resolve(job.provider, &job.url)
        .ok_or_else(|| EngineError::UnsupportedUrl(job.url.to_string()))?;

    // ── Credential acquire, with its own capped backoff ──
    let lease = retry::execute(&RetryConfig::acquire(), cancel, "credential acquire", |_| {
        ctx.credentials.acquire(job.provider)
    })
    .await?;
    log::debug!("Job {}: attempt {} using credential {}", job.id, attempt, lease.id);

    let result = attempt_with_lease(ctx, job, attempt, cancel, &source, &lease).await;

    ctx.credentials.release(&lease, release_outcome_for(&result)).await;
    result
}

fn release_outcome_for<T>(result: &EngineResult<T>) -> ReleaseOutcome {
    match result {
        Ok(_) => ReleaseOutcome::Success,
        Err(err) => match err.class() {
            ErrorClass::AuthFailure => ReleaseOutcome::AuthFailure,
            ErrorClass::Cancelled => ReleaseOutcome::Cancelled,
            _ => ReleaseOutcome::Failure,
        },
    }
}

/// The pipeline body: resolve → admission → transfer → optional transcode.
async fn attempt_with_lease(
    ctx: &EngineContext,
    job: &Job,
    attempt: u32,
    cancel: &CancellationToken,
    source: &Arc<dyn MediaSource>,
    lease: &CredentialLease,
) -> EngineResult<String> {
    // ── Metadata, cache first ──
    let metadata = match ctx.cache.get(&job.url).await {
        Some(cached) => cached,
        None => {
            let resolved = match tokio::time::timeout(ctx.call_timeout, source.resolve(&job.url, lease)).await
            {
                Ok(Ok(metadata)) => metadata,
                Ok(Err(e)) => {
                    metrics::record_error("download", "resolve");
                    return Err(e);
                }
                Err(_) => {
                    metrics::record_error("download", "resolve");
                    return Err(EngineError::Timeout(ctx.call_timeout));
                }
            };
            ctx.cache.set(&job.url, resolved.clone()).await;
            resolved
        }
    };
    log::debug!("Job {}: resolved \"{}\"", job.id, metadata.title);

    // ── Admission ──
    check_admission(&metadata, ctx.max_duration_secs, ctx.max_file_size)?;
    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }

    // ── Transfer with progress ──
    let request = TransferRequest {
        url: job.url.clone(),
        output_path: output_path_for(&ctx.download_dir, job),
        format: job.format,
        quality: job.quality.clone(),
        max_file_size: Some(ctx.max_file_size),
        attempt,
    };
    let outcome = match transfer_with_progress(ctx, job.id, source, &request, lease, cancel).await {
        Ok(outcome) => outcome,
        Err(e) => {
            if e.class() != ErrorClass::Cancelled {
                metrics::record_error("download", "transfer");
            }
            return Err(e);
        }
    };
    metrics::record_file_size(&job.format.to_string(), outcome.file_size);

    // ── Transcode when the delivered container differs ──
    if job.format.matches_path(&outcome.file_path) {
        return Ok(outcome.file_path);
    }
    let Some(transcoder) = &ctx.transcoder else {
        // No converter configured: deliver what the source produced
        return Ok(outcome.file_path);
    };
    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }
    match tokio::time::timeout(ctx.call_timeout, transcoder.transcode(&outcome.file_path, job.format)).await
    {
        Ok(Ok(converted)) => Ok(converted),
        Ok(Err(e)) => {
            metrics::record_error("download", "transcode");
            Err(e)
        }
        Err(_) => {
            metrics::record_error("download", "transcode");
            Err(EngineError::Timeout(ctx.call_timeout))
        }
    }
}

/// Run the source transfer while forwarding throttled progress events.
///
/// Cancellation lets the transfer settle instead of tearing it down
/// mid-write; the per-call deadline still bounds how long that can take.
async fn transfer_with_progress(
    ctx: &EngineContext,
    job_id: Uuid,
    source: &Arc<dyn MediaSource>,
    request: &TransferRequest,
    lease: &CredentialLease,
    cancel: &CancellationToken,
) -> EngineResult<TransferOutcome> {
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<SourceProgress>();

    let source_task = Arc::clone(source);
    let request_task = request.clone();
    let lease_task = lease.clone();
    let mut transfer_handle =
        tokio::spawn(async move { source_task.transfer(&request_task, &lease_task, progress_tx).await });

    let deadline = Instant::now() + ctx.call_timeout;
    let mut cancel_requested = false;
    let mut last_percent = 0u8;
    let mut last_report: Option<Instant> = None;

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled(), if !cancel_requested => {
                cancel_requested = true;
                log::info!("🚫 Job {}: cancel requested, letting the transfer settle", job_id);
            }
            _ = tokio::time::sleep_until(deadline) => {
                transfer_handle.abort();
                break Err(EngineError::Timeout(ctx.call_timeout));
            }
            Some(update) = progress_rx.recv() => {
                // Progress never moves backwards, whatever the source reports
                let percent = update.percent.min(100).clamp(last_percent, 100);
                let now = Instant::now();
                let due = last_report.map_or(true, |at| now.duration_since(at) >= ctx.progress_interval);
                if due && !cancel_requested {
                    last_percent = percent;
                    last_report = Some(now);
                    let mut event = ProgressUpdate::from(update);
                    event.percent = percent;
                    ctx.reporter.report(job_id, event).await;
                }
            }
            joined = &mut transfer_handle => {
                break match joined {
                    Ok(outcome) => outcome,
                    Err(e) => Err(EngineError::Internal(anyhow::anyhow!("transfer task failed: {}", e))),
                };
            }
        }
    };

    if cancel_requested {
        // The artifact of a cancelled transfer is never delivered
        if let Ok(outcome) = &result {
            let _ = fs_err::tokio::remove_file(&outcome.file_path).await;
        }
        return Err(EngineError::Cancelled);
    }
    result
}

/// Admission limits checked against resolved metadata, before any bytes move.
fn check_admission(metadata: &MediaMetadata, max_duration_secs: u32, max_file_size: u64) -> EngineResult<()> {
    if metadata.is_live {
        return Err(EngineError::ContentUnavailable(
            "live streams are not supported".to_string(),
        ));
    }
    if let Some(duration) = metadata.duration_secs {
        if duration > max_duration_secs {
            return Err(EngineError::TooLong {
                actual_secs: duration,
                limit_secs: max_duration_secs,
            });
        }
    }
    if let Some(size) = metadata.estimated_size {
        if size > max_file_size {
            return Err(EngineError::TooLarge {
                actual: size,
                limit: max_file_size,
            });
        }
    }
    Ok(())
}

fn output_path_for(download_dir: &str, job: &Job) -> String {
    format!(
        "{}/{}.{}",
        download_dir.trim_end_matches('/'),
        job.id,
        job.format.extension()
    )
}

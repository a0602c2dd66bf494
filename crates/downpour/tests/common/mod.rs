//! Shared helpers for the engine integration tests.
//!
//! Builds engines tuned for `start_paused` runtimes: zero pacing delays,
//! unthrottled progress forwarding and wide-open rate windows, so tests
//! drive every timer with virtual time.

#![allow(dead_code)]

use std::sync::Arc;

use secrecy::SecretString;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

use downpour::core::retry::RetryConfig;
use downpour::engine::EngineConfig;
use downpour::progress::{ChannelReporter, ProgressEvent, ProgressReporter, TerminalUpdate};
use downpour::queue::JobRequest;
use downpour::rate::RateLimits;
use downpour::source::{MediaFormat, MediaSource, Provider, SourceRegistry};
use downpour::{CredentialKind, Engine};

/// Registry with a single registered source.
pub fn registry_with(source: Arc<dyn MediaSource>) -> Arc<SourceRegistry> {
    let mut registry = SourceRegistry::new();
    registry.register(source);
    Arc::new(registry)
}

/// Rate limits that never block an acquisition.
pub fn open_limits() -> RateLimits {
    RateLimits {
        per_credential: u32::MAX,
        credential_window: Duration::from_millis(1),
        provider_ceiling: u32::MAX,
        provider_window: Duration::from_millis(1),
    }
}

/// Three attempts with millisecond backoff and no jitter.
pub fn quick_retry() -> RetryConfig {
    RetryConfig::new()
        .max_retries(2)
        .initial_delay(Duration::from_millis(10))
        .max_delay(Duration::from_millis(40))
        .no_jitter()
}

/// Channel reporter split into the trait object the engine wants and the
/// receiver the test asserts on.
pub fn reporter_pair() -> (Arc<dyn ProgressReporter>, mpsc::UnboundedReceiver<ProgressEvent>) {
    let (reporter, rx) = ChannelReporter::new();
    (Arc::new(reporter), rx)
}

/// Engine config for virtual-time tests. Tests tweak the public fields
/// before passing it to [`Engine::start`].
pub fn fast_config(
    sources: Arc<SourceRegistry>,
    reporter: Arc<dyn ProgressReporter>,
) -> EngineConfig {
    let mut config = EngineConfig::builder()
        .sources(sources)
        .reporter(reporter)
        .rate_limits(open_limits())
        .retry(quick_retry())
        .worker_count(2)
        .build();
    config.inter_start_delay = Duration::ZERO;
    config.progress_interval = Duration::ZERO;
    config
}

/// Register `count` cookie credentials and return their ids.
pub async fn seed_credentials(engine: &Engine, provider: Provider, count: usize) -> Vec<Uuid> {
    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        let id = engine
            .add_credential(
                provider,
                CredentialKind::CookieFile,
                SecretString::from(format!("# Netscape HTTP Cookie File\ncookie-{}", i)),
                Some(format!("test-{}.txt", i)),
            )
            .await;
        ids.push(id);
    }
    ids
}

/// An Mp3 request for a YouTube URL unique to `marker`.
pub fn mp3_request(user_id: i64, marker: &str) -> JobRequest {
    JobRequest::builder()
        .user_id(user_id)
        .url(format!("https://www.youtube.com/watch?v={}", marker))
        .format(MediaFormat::Mp3)
        .build()
}

/// Wait for the job's terminal event, discarding progress frames.
///
/// The ten-minute ceiling is virtual time; a test that hits it has
/// deadlocked, not run slow.
pub async fn wait_for_terminal(
    rx: &mut mpsc::UnboundedReceiver<ProgressEvent>,
    job_id: Uuid,
) -> TerminalUpdate {
    timeout(Duration::from_secs(600), async {
        loop {
            match rx.recv().await {
                Some(ProgressEvent::Terminal { job_id: id, update }) if id == job_id => {
                    return update;
                }
                Some(_) => continue,
                None => panic!("progress channel closed before job {} finished", job_id),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for job {} to finish", job_id))
}

/// Collect every event up to and including the job's terminal one.
pub async fn collect_until_terminal(
    rx: &mut mpsc::UnboundedReceiver<ProgressEvent>,
    job_id: Uuid,
) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    timeout(Duration::from_secs(600), async {
        loop {
            match rx.recv().await {
                Some(event) => {
                    let done = matches!(
                        &event,
                        ProgressEvent::Terminal { job_id: id, .. } if *id == job_id
                    );
                    events.push(event);
                    if done {
                        break;
                    }
                }
                None => panic!("progress channel closed before job {} finished", job_id),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for job {} to finish", job_id));
    events
}

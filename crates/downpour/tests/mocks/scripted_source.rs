//! Scripted extraction source for engine integration tests.
//!
//! Each transfer attempt pops the next [`AttemptPlan`] from the script;
//! an exhausted script means every further attempt succeeds immediately.
//! The source also tracks call counts, the credentials it was handed and
//! a high-water mark of concurrent transfers, so tests can assert on
//! retry budgets, credential rotation and per-user concurrency caps.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use url::Url;
use uuid::Uuid;

use downpour::credentials::CredentialLease;
use downpour::source::{
    MediaFormat, MediaMetadata, MediaSource, Provider, SourceProgress, Transcoder,
    TransferOutcome, TransferRequest,
};
use downpour::{EngineError, EngineResult, ErrorClass};

/// What a single transfer attempt should do.
#[derive(Debug, Clone)]
pub enum AttemptPlan {
    /// Report progress and deliver the requested path immediately
    Succeed,
    /// Deliver after sleeping, with progress frames along the way
    SucceedAfter(Duration),
    /// Deliver a file whose extension differs from the requested one
    SucceedWithExtension(&'static str),
    /// Fail with a transient extraction error
    FailTransient,
    /// Fail with a permanent extraction error
    FailPermanent,
    /// Fail with an auth rejection, counting against the credential
    FailAuth,
    /// Sleep far past any call timeout
    Stall,
}

/// Extraction source whose transfer behavior is driven by a script.
pub struct ScriptedSource {
    provider: Provider,
    metadata: MediaMetadata,
    script: Mutex<VecDeque<AttemptPlan>>,
    resolve_calls: AtomicUsize,
    transfer_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    used_credentials: Mutex<Vec<Uuid>>,
}

impl ScriptedSource {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            metadata: MediaMetadata {
                title: "Test Track".to_string(),
                artist: Some("Test Artist".to_string()),
                duration_secs: Some(240),
                estimated_size: Some(6_000_000),
                is_live: false,
            },
            script: Mutex::new(VecDeque::new()),
            resolve_calls: AtomicUsize::new(0),
            transfer_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            used_credentials: Mutex::new(Vec::new()),
        }
    }

    /// Replace the metadata every `resolve` call returns.
    pub fn with_metadata(mut self, metadata: MediaMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Queue behaviors, one per upcoming transfer attempt.
    pub fn plan(&self, plans: impl IntoIterator<Item = AttemptPlan>) {
        self.script.lock().unwrap().extend(plans);
    }

    pub fn resolve_count(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    pub fn transfer_count(&self) -> usize {
        self.transfer_calls.load(Ordering::SeqCst)
    }

    /// Highest number of transfers observed running at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Credential ids seen across all transfer attempts, in call order.
    pub fn credentials_seen(&self) -> Vec<Uuid> {
        self.used_credentials.lock().unwrap().clone()
    }

    async fn run_plan(
        &self,
        plan: AttemptPlan,
        request: &TransferRequest,
        progress_tx: &mpsc::UnboundedSender<SourceProgress>,
    ) -> EngineResult<TransferOutcome> {
        match plan {
            AttemptPlan::Succeed => {
                for percent in [25, 50, 100] {
                    send_progress(progress_tx, percent);
                }
                Ok(self.outcome(request.output_path.clone()))
            }
            AttemptPlan::SucceedAfter(delay) => {
                send_progress(progress_tx, 10);
                sleep(delay / 2).await;
                send_progress(progress_tx, 60);
                sleep(delay - delay / 2).await;
                send_progress(progress_tx, 100);
                Ok(self.outcome(request.output_path.clone()))
            }
            AttemptPlan::SucceedWithExtension(ext) => {
                send_progress(progress_tx, 100);
                Ok(self.outcome(with_extension(&request.output_path, ext)))
            }
            AttemptPlan::FailTransient => Err(EngineError::Extraction {
                provider: self.provider,
                reason: "fragment 3 not found, unable to continue".to_string(),
                class: ErrorClass::Transient,
                retry_after: None,
            }),
            AttemptPlan::FailPermanent => Err(EngineError::Extraction {
                provider: self.provider,
                reason: "this track is private".to_string(),
                class: ErrorClass::Permanent,
                retry_after: None,
            }),
            AttemptPlan::FailAuth => Err(EngineError::AuthRejected {
                provider: self.provider,
                reason: "cookies expired, sign in to confirm".to_string(),
            }),
            AttemptPlan::Stall => {
                send_progress(progress_tx, 5);
                sleep(Duration::from_secs(3600)).await;
                Ok(self.outcome(request.output_path.clone()))
            }
        }
    }

    fn outcome(&self, file_path: String) -> TransferOutcome {
        TransferOutcome {
            file_path,
            file_size: 5_242_880,
            duration_secs: self.metadata.duration_secs,
            mime_hint: None,
        }
    }
}

#[async_trait]
impl MediaSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    fn provider(&self) -> Provider {
        self.provider
    }

    fn supports_url(&self, url: &Url) -> bool {
        Provider::from_url(url) == Some(self.provider)
    }

    async fn resolve(
        &self,
        _url: &Url,
        _credential: &CredentialLease,
    ) -> EngineResult<MediaMetadata> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.metadata.clone())
    }

    async fn transfer(
        &self,
        request: &TransferRequest,
        credential: &CredentialLease,
        progress_tx: mpsc::UnboundedSender<SourceProgress>,
    ) -> EngineResult<TransferOutcome> {
        self.transfer_calls.fetch_add(1, Ordering::SeqCst);
        self.used_credentials.lock().unwrap().push(credential.id);

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let plan = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(AttemptPlan::Succeed);

        let result = self.run_plan(plan, request, &progress_tx).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Transcoder that "converts" by rewriting the extension on the path.
#[derive(Default)]
pub struct RenamingTranscoder {
    calls: AtomicUsize,
}

impl RenamingTranscoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcoder for RenamingTranscoder {
    async fn transcode(&self, input_path: &str, target: MediaFormat) -> EngineResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(with_extension(input_path, target.extension()))
    }
}

fn send_progress(tx: &mpsc::UnboundedSender<SourceProgress>, percent: u8) {
    let _ = tx.send(SourceProgress {
        percent,
        speed_bytes_sec: Some(1_048_576.0),
        eta_seconds: Some(3),
        downloaded_bytes: None,
        total_bytes: None,
    });
}

fn with_extension(path: &str, ext: &str) -> String {
    match path.rsplit_once('.') {
        Some((stem, _)) => format!("{}.{}", stem, ext),
        None => format!("{}.{}", path, ext),
    }
}

//! Metrics collection for the download engine using Prometheus
//!
//! This module provides a centralized metrics registry for tracking:
//! - Performance metrics (download duration, queue wait time)
//! - Queue metrics (depth, retries)
//! - Credential pool metrics (availability, quarantines)
//! - System health metrics (errors, busy workers)

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec, register_histogram,
    register_histogram_vec, Counter, CounterVec, Gauge, GaugeVec, Histogram, HistogramVec,
};

// ======================
// PERFORMANCE METRICS
// ======================

lazy_static! {
    /// Download duration in seconds by format and quality
    /// Labels: format (mp3/mp4/srt/txt), quality (320k/1080p/etc)
    pub static ref DOWNLOAD_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "downpour_download_duration_seconds",
        "Time spent downloading files by format and quality",
        &["format", "quality"],
        vec![1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]
    )
    .unwrap();

    /// Queue wait time from job submission to dispatch
    pub static ref QUEUE_WAIT_TIME_SECONDS: Histogram = register_histogram!(
        "downpour_queue_wait_time_seconds",
        "Time jobs spend waiting in queue before a worker picks them up",
        vec![0.1, 1.0, 5.0, 30.0, 60.0, 300.0, 600.0, 1800.0]
    )
    .unwrap();

    /// Successful downloads count
    /// Labels: format, quality
    pub static ref DOWNLOAD_SUCCESS_TOTAL: CounterVec = register_counter_vec!(
        "downpour_download_success_total",
        "Total number of successful downloads",
        &["format", "quality"]
    )
    .unwrap();

    /// Failed downloads count
    /// Labels: format, error_type
    pub static ref DOWNLOAD_FAILURE_TOTAL: CounterVec = register_counter_vec!(
        "downpour_download_failure_total",
        "Total number of failed downloads",
        &["format", "error_type"]
    )
    .unwrap();

    /// File size distribution
    /// Labels: format
    pub static ref FILE_SIZE_BYTES: HistogramVec = register_histogram_vec!(
        "downpour_file_size_bytes",
        "Size of files processed by format",
        &["format"],
        vec![1_000_000.0, 5_000_000.0, 10_000_000.0, 25_000_000.0, 50_000_000.0, 100_000_000.0, 500_000_000.0]
    )
    .unwrap();
}

// ======================
// QUEUE METRICS
// ======================

lazy_static! {
    /// Total queue depth across all users
    pub static ref QUEUE_DEPTH_TOTAL: Gauge = register_gauge!(
        "downpour_queue_depth_total",
        "Total number of jobs waiting in queue"
    )
    .unwrap();

    /// Jobs admitted into the queue
    /// Labels: provider, format
    pub static ref JOBS_SUBMITTED_TOTAL: CounterVec = register_counter_vec!(
        "downpour_jobs_submitted_total",
        "Total number of jobs accepted for download",
        &["provider", "format"]
    )
    .unwrap();

    /// Jobs that reached the Cancelled terminal state
    pub static ref JOBS_CANCELLED_TOTAL: Counter = register_counter!(
        "downpour_jobs_cancelled_total",
        "Total number of jobs cancelled before completion"
    )
    .unwrap();

    /// Attempts consumed per finished job
    pub static ref ATTEMPTS_PER_JOB: Histogram = register_histogram!(
        "downpour_attempts_per_job",
        "Download attempts consumed per job before it settled",
        vec![1.0, 2.0, 3.0, 4.0, 5.0]
    )
    .unwrap();

    /// Retry count
    /// Labels: retry_count (1/2/3/4/5)
    pub static ref RETRIES_TOTAL: CounterVec = register_counter_vec!(
        "downpour_retries_total",
        "Total number of retried attempts",
        &["retry_count"]
    )
    .unwrap();
}

// ======================
// CREDENTIAL METRICS
// ======================

lazy_static! {
    /// Usable credentials per provider (not reserved, cooled down, not quarantined)
    /// Labels: provider (youtube/spotify/instagram/soundcloud)
    pub static ref CREDENTIALS_AVAILABLE: GaugeVec = register_gauge_vec!(
        "downpour_credentials_available",
        "Number of usable credentials by provider",
        &["provider"]
    )
    .unwrap();

    /// Credentials quarantined after repeated auth failures
    /// Labels: provider
    pub static ref CREDENTIALS_QUARANTINED_TOTAL: CounterVec = register_counter_vec!(
        "downpour_credentials_quarantined_total",
        "Total number of credential quarantines",
        &["provider"]
    )
    .unwrap();

    /// Rate limit hits count
    /// Labels: provider
    pub static ref RATE_LIMIT_HITS_TOTAL: CounterVec = register_counter_vec!(
        "downpour_rate_limit_hits_total",
        "Total number of provider rate limit hits",
        &["provider"]
    )
    .unwrap();
}

// ======================
// SYSTEM HEALTH METRICS
// ======================

lazy_static! {
    /// Errors count by type and operation
    /// Labels: error_type (download/database/http/io), operation
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "downpour_errors_total",
        "Total number of errors by type and operation",
        &["error_type", "operation"]
    )
    .unwrap();

    /// Workers currently processing a job
    pub static ref WORKERS_BUSY: Gauge = register_gauge!(
        "downpour_workers_busy",
        "Number of workers currently processing a job"
    )
    .unwrap();

    /// Provider distribution for downloads
    /// Labels: provider (youtube/spotify/instagram/soundcloud)
    pub static ref PROVIDER_DOWNLOADS_TOTAL: CounterVec = register_counter_vec!(
        "downpour_provider_downloads_total",
        "Downloads by source provider",
        &["provider"]
    )
    .unwrap();
}

/// Initialize metrics (call this at startup to register all metrics)
pub fn init_metrics() {
    log::info!("Initializing metrics registry...");

    // Initialize all lazy statics by accessing them
    let _ = &*DOWNLOAD_DURATION_SECONDS;
    let _ = &*QUEUE_WAIT_TIME_SECONDS;
    let _ = &*DOWNLOAD_SUCCESS_TOTAL;
    let _ = &*DOWNLOAD_FAILURE_TOTAL;
    let _ = &*FILE_SIZE_BYTES;

    // Initialize download counters with common format combinations
    // This ensures they appear in /metrics even with 0 values
    DOWNLOAD_SUCCESS_TOTAL.with_label_values(&["mp3", "320k"]);
    DOWNLOAD_SUCCESS_TOTAL.with_label_values(&["mp3", "default"]);
    DOWNLOAD_SUCCESS_TOTAL.with_label_values(&["mp4", "1080p"]);
    DOWNLOAD_SUCCESS_TOTAL.with_label_values(&["mp4", "720p"]);
    DOWNLOAD_SUCCESS_TOTAL.with_label_values(&["srt", "default"]);
    DOWNLOAD_SUCCESS_TOTAL.with_label_values(&["txt", "default"]);

    DOWNLOAD_FAILURE_TOTAL.with_label_values(&["mp3", "timeout"]);
    DOWNLOAD_FAILURE_TOTAL.with_label_values(&["mp3", "file-too-large"]);
    DOWNLOAD_FAILURE_TOTAL.with_label_values(&["mp3", "network-error"]);
    DOWNLOAD_FAILURE_TOTAL.with_label_values(&["mp4", "timeout"]);
    DOWNLOAD_FAILURE_TOTAL.with_label_values(&["mp4", "file-too-large"]);
    DOWNLOAD_FAILURE_TOTAL.with_label_values(&["mp4", "network-error"]);

    let _ = &*QUEUE_DEPTH_TOTAL;
    let _ = &*JOBS_SUBMITTED_TOTAL;
    let _ = &*JOBS_CANCELLED_TOTAL;
    let _ = &*ATTEMPTS_PER_JOB;
    let _ = &*RETRIES_TOTAL;

    let _ = &*CREDENTIALS_AVAILABLE;
    let _ = &*CREDENTIALS_QUARANTINED_TOTAL;
    let _ = &*RATE_LIMIT_HITS_TOTAL;

    // Initialize per-provider gauges and counters
    for provider in ["youtube", "spotify", "instagram", "soundcloud"] {
        CREDENTIALS_AVAILABLE.with_label_values(&[provider]);
        RATE_LIMIT_HITS_TOTAL.with_label_values(&[provider]);
        PROVIDER_DOWNLOADS_TOTAL.with_label_values(&[provider]);
    }

    let _ = &*ERRORS_TOTAL;
    let _ = &*WORKERS_BUSY;
    let _ = &*PROVIDER_DOWNLOADS_TOTAL;

    // Initialize error counters with common error categories and operations
    ERRORS_TOTAL.with_label_values(&["download", "resolve"]);
    ERRORS_TOTAL.with_label_values(&["download", "transfer"]);
    ERRORS_TOTAL.with_label_values(&["download", "transcode"]);
    ERRORS_TOTAL.with_label_values(&["database", "query"]);
    ERRORS_TOTAL.with_label_values(&["http", "request"]);
    ERRORS_TOTAL.with_label_values(&["io", "filesystem"]);
    ERRORS_TOTAL.with_label_values(&["other", "unknown"]);

    log::info!("Metrics registry initialized successfully");
}

/// Helper function to record download success
pub fn record_download_success(format: &str, quality: &str) {
    DOWNLOAD_SUCCESS_TOTAL.with_label_values(&[format, quality]).inc();
}

/// Helper function to record download failure
pub fn record_download_failure(format: &str, error_type: &str) {
    DOWNLOAD_FAILURE_TOTAL.with_label_values(&[format, error_type]).inc();
}

/// Helper function to record error
pub fn record_error(error_type: &str, operation: &str) {
    ERRORS_TOTAL.with_label_values(&[error_type, operation]).inc();
}

/// Helper function to record rate limit hit
pub fn record_rate_limit_hit(provider: &str) {
    RATE_LIMIT_HITS_TOTAL.with_label_values(&[provider]).inc();
}

/// Helper function to update total queue depth
pub fn update_queue_depth_total(depth: usize) {
    QUEUE_DEPTH_TOTAL.set(depth as f64);
}

/// Helper function to update usable credential count
pub fn update_credentials_available(provider: &str, count: usize) {
    CREDENTIALS_AVAILABLE.with_label_values(&[provider]).set(count as f64);
}

/// Helper function to record a credential quarantine
pub fn record_credential_quarantine(provider: &str) {
    CREDENTIALS_QUARANTINED_TOTAL.with_label_values(&[provider]).inc();
}

/// Helper function to record provider download
pub fn record_provider_download(provider: &str) {
    PROVIDER_DOWNLOADS_TOTAL.with_label_values(&[provider]).inc();
}

/// Helper function to record file size
pub fn record_file_size(format: &str, size_bytes: u64) {
    FILE_SIZE_BYTES.with_label_values(&[format]).observe(size_bytes as f64);
}

/// Helper function to record queue wait time
pub fn record_queue_wait(seconds: f64) {
    QUEUE_WAIT_TIME_SECONDS.observe(seconds);
}

/// Helper function to record an accepted submission
pub fn record_job_submitted(provider: &str, format: &str) {
    JOBS_SUBMITTED_TOTAL.with_label_values(&[provider, format]).inc();
}

/// Helper function to record a cancelled job
pub fn record_job_cancelled() {
    JOBS_CANCELLED_TOTAL.inc();
}

/// Helper function to record attempts consumed by a finished job
pub fn record_job_attempts(attempts: u32) {
    ATTEMPTS_PER_JOB.observe(f64::from(attempts));
}

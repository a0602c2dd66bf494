use once_cell::sync::Lazy;
use std::env;
use std::time::Duration;

/// Directory scanned for Netscape cookie files at startup
/// Read from COOKIES_DIR environment variable
/// Supports tilde (~) expansion for home directory
/// Default: ./cookies
pub static COOKIES_DIR: Lazy<String> = Lazy::new(|| env::var("COOKIES_DIR").unwrap_or_else(|_| "./cookies".to_string()));

/// Optional URL serving a refreshed cookie bundle
/// Read from COOKIES_URL environment variable
/// When set, operators can hot-feed cookies without touching the host
pub static COOKIES_URL: Lazy<Option<String>> = Lazy::new(|| {
    env::var("COOKIES_URL")
        .ok()
        .and_then(|s| if s.trim().is_empty() { None } else { Some(s) })
});

/// Directory download artifacts land in before delivery
/// Read from DOWNLOAD_DIR environment variable
/// Default: ./downloads
pub static DOWNLOAD_DIR: Lazy<String> =
    Lazy::new(|| env::var("DOWNLOAD_DIR").unwrap_or_else(|_| "./downloads".to_string()));

/// Database file path
/// Read from DATABASE_PATH environment variable
/// Default: downpour.sqlite
pub static DATABASE_PATH: Lazy<String> =
    Lazy::new(|| env::var("DATABASE_PATH").unwrap_or_else(|_| "downpour.sqlite".to_string()));

/// Log file path
/// Read from LOG_FILE_PATH environment variable
/// Default: downpour.log
pub static LOG_FILE_PATH: Lazy<String> =
    Lazy::new(|| env::var("LOG_FILE_PATH").unwrap_or_else(|_| "downpour.log".to_string()));

/// Queue configuration
pub mod queue {
    use super::Duration;

    /// Maximum number of jobs waiting in the queue before submits are
    /// rejected with a backpressure error
    pub const MAX_PENDING: usize = 100;

    /// Maximum jobs one user may have running at the same time.
    /// Jobs over the cap stay queued, they are never rejected.
    pub const PER_USER_RUNNING_CAP: usize = 2;

    /// Interval between queue checks while a worker waits for work (in milliseconds)
    pub const CHECK_INTERVAL_MS: u64 = 100;

    /// How long a worker blocks on the queue before giving the shutdown
    /// signal a chance (in seconds)
    pub const WORKER_WAIT_SECS: u64 = 1;

    /// Queue check interval duration
    pub fn check_interval() -> Duration {
        Duration::from_millis(CHECK_INTERVAL_MS)
    }

    /// Worker queue-wait duration
    pub fn worker_wait() -> Duration {
        Duration::from_secs(WORKER_WAIT_SECS)
    }
}

/// Worker pool configuration
pub mod workers {
    use super::Duration;

    /// Number of concurrent download workers
    /// Kept small to avoid provider-side 403 rate limiting
    pub const MAX_CONCURRENT: usize = 3;

    /// Global delay between starting new downloads (milliseconds)
    /// Helps avoid rate limiting when multiple users download simultaneously
    pub const INTER_START_DELAY_MS: u64 = 3000;

    /// Inter-start delay duration
    pub fn inter_start_delay() -> Duration {
        Duration::from_millis(INTER_START_DELAY_MS)
    }
}

/// Credential rotation configuration
pub mod credentials {
    use super::Duration;

    /// Minimum time a credential rests between uses (in seconds).
    /// One use per window is what keeps accounts under the radar.
    pub const COOLDOWN_SECS: u64 = 600;

    /// Consecutive auth failures before a credential is quarantined
    pub const QUARANTINE_THRESHOLD: u32 = 3;

    /// Cooldown window duration
    pub fn cooldown() -> Duration {
        Duration::from_secs(COOLDOWN_SECS)
    }
}

/// Provider-wide rate ceiling configuration
pub mod rate {
    use super::Duration;

    /// Requests allowed per credential within one cooldown window
    pub const PER_CREDENTIAL_PER_WINDOW: u32 = 1;

    /// Aggregate requests allowed per provider within the provider window,
    /// regardless of how many credentials are rotating
    pub const PROVIDER_CEILING: u32 = 30;

    /// Provider-wide window length (in seconds)
    pub const PROVIDER_WINDOW_SECS: u64 = 60;

    /// Provider window duration
    pub fn provider_window() -> Duration {
        Duration::from_secs(PROVIDER_WINDOW_SECS)
    }
}

/// Retry configuration
pub mod retry {
    use super::Duration;

    /// Attempt budget per job. Each attempt may use a different credential.
    pub const MAX_JOB_ATTEMPTS: u32 = 3;

    /// Base delay before the first retry (in seconds)
    pub const INITIAL_DELAY_SECS: u64 = 2;

    /// Ceiling on any single backoff delay (in seconds)
    pub const MAX_DELAY_SECS: u64 = 60;

    /// Base for exponential backoff calculation
    pub const BACKOFF_MULTIPLIER: f64 = 2.0;

    /// Initial retry delay duration
    pub fn initial_delay() -> Duration {
        Duration::from_secs(INITIAL_DELAY_SECS)
    }

    /// Maximum retry delay duration
    pub fn max_delay() -> Duration {
        Duration::from_secs(MAX_DELAY_SECS)
    }
}

/// Progress reporting configuration
pub mod progress {
    use super::Duration;

    /// Interval between forwarded progress events (in seconds)
    pub const UPDATE_INTERVAL_SECS: u64 = 5;

    /// How long a terminal job stays queryable before eviction (in seconds)
    pub const RETENTION_SECS: u64 = 600;

    /// Progress update interval duration
    pub fn update_interval() -> Duration {
        Duration::from_secs(UPDATE_INTERVAL_SECS)
    }

    /// Terminal-state retention duration
    pub fn retention() -> Duration {
        Duration::from_secs(RETENTION_SECS)
    }
}

/// Admission limits checked before any bytes move
pub mod limits {
    /// Maximum URL length (RFC 7230 recommends 8000, but we use 2048 for safety)
    pub const MAX_URL_LENGTH: usize = 2048;

    /// Longest media accepted for download (in seconds)
    pub const MAX_MEDIA_DURATION_SECS: u32 = 15 * 60;

    /// Largest media accepted for download (in bytes)
    pub const MAX_FILE_SIZE_BYTES: u64 = 2 * 1024 * 1024 * 1024; // 2 GiB
}

/// Network configuration
pub mod network {
    use super::Duration;

    /// Timeout for a single external call (resolve, transfer or transcode),
    /// in seconds. Generous because slow metadata fetches are routine.
    pub const CALL_TIMEOUT_SECS: u64 = 240;

    /// Per-call timeout duration
    pub fn call_timeout() -> Duration {
        Duration::from_secs(CALL_TIMEOUT_SECS)
    }
}

/// Metadata cache configuration
pub mod cache {
    use super::Duration;

    /// How long resolved metadata stays valid (in seconds)
    pub const METADATA_TTL_SECS: u64 = 300;

    /// Maximum number of cached metadata entries
    pub const METADATA_CAPACITY: u64 = 1024;

    /// Metadata TTL duration
    pub fn metadata_ttl() -> Duration {
        Duration::from_secs(METADATA_TTL_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_defaults_without_env() {
        // Lazy statics read the environment once; these assertions only
        // hold when the variables are unset, hence the serial guard.
        assert!(queue::MAX_PENDING >= workers::MAX_CONCURRENT);
        assert_eq!(credentials::cooldown(), Duration::from_secs(600));
        assert_eq!(progress::update_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_duration_helpers_match_consts() {
        assert_eq!(queue::check_interval().as_millis() as u64, queue::CHECK_INTERVAL_MS);
        assert_eq!(retry::initial_delay().as_secs(), retry::INITIAL_DELAY_SECS);
        assert_eq!(rate::provider_window().as_secs(), rate::PROVIDER_WINDOW_SECS);
    }
}

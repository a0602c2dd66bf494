use std::time::Duration;

use thiserror::Error;

use crate::source::Provider;

/// Centralized error types for the engine
///
/// All errors in the engine are converted to this enum for consistent error handling.
/// Uses `thiserror` for automatic error conversion and display formatting.
///
/// # Example
///
/// ```no_run
/// use downpour::EngineError;
///
/// fn handle_error(err: EngineError) {
///     eprintln!("Error: {}", err);
/// }
/// ```
#[derive(Error, Debug)]
pub enum EngineError {
    /// Queue is at capacity, the job was not admitted
    #[error("Queue is full ({capacity} jobs pending), try again later")]
    QueueFull {
        /// Configured queue capacity
        capacity: usize,
    },

    /// Per-user submit cooldown has not elapsed yet
    #[error("User {user_id} must wait {} s before submitting again", retry_after.as_secs())]
    UserCooldown {
        /// Submitting user
        user_id: i64,
        /// Time remaining until the next submit is accepted
        retry_after: Duration,
    },

    /// Every credential for the provider is reserved, cooling down or quarantined
    #[error("No usable credential for {provider}")]
    NoCredentials {
        /// Provider the acquire was for
        provider: Provider,
    },

    /// Provider rejected the credential itself (expired cookies, revoked key)
    #[error("{provider} rejected the credential: {reason}")]
    AuthRejected {
        /// Provider that rejected the call
        provider: Provider,
        /// Provider-supplied rejection detail
        reason: String,
    },

    /// Provider asked us to slow down
    #[error("{provider} rate limited the request")]
    RateLimited {
        /// Provider that throttled the call
        provider: Provider,
        /// Server-suggested wait, when the response carried one
        retry_after: Option<Duration>,
    },

    /// Extraction/transfer failed in a provider-specific way
    #[error("{provider} extraction failed: {reason}")]
    Extraction {
        /// Provider the job ran against
        provider: Provider,
        /// Provider-supplied failure detail
        reason: String,
        /// How the failure should be treated by the retry policy
        class: ErrorClass,
        /// Server-suggested wait, when the response carried one
        retry_after: Option<Duration>,
    },

    /// External call exceeded its deadline
    #[error("Operation timed out after {} s", .0.as_secs())]
    Timeout(Duration),

    /// Media exists but cannot be served (private, geo-blocked, removed)
    #[error("Content unavailable: {0}")]
    ContentUnavailable(String),

    /// No registered source accepts the URL
    #[error("Unsupported URL: {0}")]
    UnsupportedUrl(String),

    /// Media is larger than the configured admission limit
    #[error("File too large: {actual} bytes (limit {limit})")]
    TooLarge {
        /// Size reported by the provider
        actual: u64,
        /// Configured limit
        limit: u64,
    },

    /// Media runs longer than the configured admission limit
    #[error("Media too long: {actual_secs} s (limit {limit_secs} s)")]
    TooLong {
        /// Duration reported by the provider
        actual_secs: u32,
        /// Configured limit
        limit_secs: u32,
    },

    /// Job was cancelled by the user or by shutdown
    #[error("Cancelled")]
    Cancelled,

    /// URL parsing errors
    #[error("URL parsing error: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// HTTP/Fetch errors
    #[error("HTTP error: {0}")]
    Network(#[from] reqwest::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Database connection pool errors
    #[error("Database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Anyhow errors (for general error handling)
    #[error("Engine error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Type alias for Result with EngineError
pub type EngineResult<T> = Result<T, EngineError>;

/// How a failure should be treated by the retry policy and the credential pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorClass {
    /// Worth retrying with backoff, possibly on another credential
    Transient,
    /// Retrying will not help, fail the job now
    Permanent,
    /// The credential is bad, not the job: swap and retry
    AuthFailure,
    /// The user or shutdown asked us to stop
    Cancelled,
}

impl EngineError {
    /// Classify the error for the retry policy.
    ///
    /// Transport-level trouble is transient. Anything that says the request
    /// itself is bad is permanent. Credential rejections get their own class
    /// so the worker can swap credentials instead of burning attempts.
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::Network(_)
            | EngineError::Io(_)
            | EngineError::Timeout(_)
            | EngineError::RateLimited { .. }
            | EngineError::NoCredentials { .. }
            | EngineError::UserCooldown { .. } => ErrorClass::Transient,

            EngineError::AuthRejected { .. } => ErrorClass::AuthFailure,

            EngineError::Extraction { class, .. } => *class,

            EngineError::Cancelled => ErrorClass::Cancelled,

            EngineError::QueueFull { .. }
            | EngineError::ContentUnavailable(_)
            | EngineError::UnsupportedUrl(_)
            | EngineError::TooLarge { .. }
            | EngineError::TooLong { .. }
            | EngineError::InvalidUrl(_)
            | EngineError::Database(_)
            | EngineError::Pool(_)
            | EngineError::Internal(_) => ErrorClass::Permanent,
        }
    }

    /// Server-suggested wait attached to the error, if any.
    /// The retry policy takes the max of this and its own backoff.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            EngineError::RateLimited { retry_after, .. }
            | EngineError::Extraction { retry_after, .. } => *retry_after,
            EngineError::UserCooldown { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Short machine-stable reason string for terminal reports and storage.
    /// Stays stable across releases so downstream consumers can match on it.
    pub fn short_reason(&self) -> &'static str {
        match self {
            EngineError::QueueFull { .. } => "queue-full",
            EngineError::UserCooldown { .. } => "user-cooldown",
            EngineError::NoCredentials { .. } => "no-credentials",
            EngineError::AuthRejected { .. } => "auth-rejected",
            EngineError::RateLimited { .. } => "rate-limited",
            EngineError::Extraction { .. } => "extraction-failed",
            EngineError::Timeout(_) => "timeout",
            EngineError::ContentUnavailable(_) => "content-unavailable",
            EngineError::UnsupportedUrl(_) => "unsupported-url",
            EngineError::TooLarge { .. } => "file-too-large",
            EngineError::TooLong { .. } => "media-too-long",
            EngineError::Cancelled => "cancelled",
            EngineError::InvalidUrl(_) => "invalid-url",
            EngineError::Network(_) => "network-error",
            EngineError::Io(_) => "io-error",
            EngineError::Database(_) | EngineError::Pool(_) => "storage-error",
            EngineError::Internal(_) => "internal-error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_are_transient() {
        let err = EngineError::Timeout(Duration::from_secs(240));
        assert_eq!(err.class(), ErrorClass::Transient);

        let err = EngineError::RateLimited {
            provider: Provider::YouTube,
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(err.class(), ErrorClass::Transient);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_auth_rejection_has_own_class() {
        let err = EngineError::AuthRejected {
            provider: Provider::YouTube,
            reason: "cookies expired".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::AuthFailure);
        assert_eq!(err.short_reason(), "auth-rejected");
    }

    #[test]
    fn test_extraction_carries_its_class() {
        let err = EngineError::Extraction {
            provider: Provider::SoundCloud,
            reason: "fragment 3 not found".to_string(),
            class: ErrorClass::Transient,
            retry_after: None,
        };
        assert_eq!(err.class(), ErrorClass::Transient);

        let err = EngineError::Extraction {
            provider: Provider::SoundCloud,
            reason: "track is private".to_string(),
            class: ErrorClass::Permanent,
            retry_after: None,
        };
        assert_eq!(err.class(), ErrorClass::Permanent);
    }

    #[test]
    fn test_admission_errors_are_permanent() {
        let err = EngineError::TooLarge { actual: 3_000_000_000, limit: 2_147_483_648 };
        assert_eq!(err.class(), ErrorClass::Permanent);

        let err = EngineError::UnsupportedUrl("ftp://example.com/x".to_string());
        assert_eq!(err.class(), ErrorClass::Permanent);
    }

    #[test]
    fn test_class_display_is_kebab() {
        assert_eq!(ErrorClass::AuthFailure.to_string(), "auth-failure");
        assert_eq!(ErrorClass::Transient.to_string(), "transient");
    }
}

//! Job model: the unit of work flowing through the engine.
//!
//! A job is one URL-to-artifact conversion request. It is created on
//! admission, mutated only by the worker executing it and by the engine
//! (cancellation), and evicted from active tracking after a retention
//! window past its terminal report.

use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::source::{MediaFormat, Provider};

/// Lifecycle state of a job.
///
/// Transitions: `Queued → Running → {Succeeded, Failed, Cancelled}`.
/// A queued job may also go straight to `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Admitted, waiting for a worker slot
    Queued,
    /// Picked up by a worker, pipeline in flight
    Running,
    /// Artifact delivered
    Succeeded,
    /// Attempt budget exhausted or permanent error
    Failed,
    /// Stopped on user request
    Cancelled,
}

impl JobState {
    /// Returns `true` once the job can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Cancelled)
    }
}

/// Inbound submission payload accepted by the engine.
///
/// The URL arrives as raw text from the front end; the engine validates
/// it and infers the provider before a job is created.
///
/// # Example
///
/// ```no_run
/// use downpour::queue::JobRequest;
/// use downpour::source::MediaFormat;
///
/// let request = JobRequest::builder()
///     .user_id(42)
///     .url("https://youtu.be/jNQXAC9IVRw")
///     .format(MediaFormat::Mp3)
///     .quality("320k")
///     .build();
/// ```
#[derive(Debug, Clone, Builder)]
pub struct JobRequest {
    /// Submitting user (fairness key)
    pub user_id: i64,
    /// Source URL as received from the front end
    #[builder(into)]
    pub url: String,
    /// Requested artifact format
    pub format: MediaFormat,
    /// Requested quality ("320k", "720p"); format default when omitted
    #[builder(into)]
    pub quality: Option<String>,
}

/// Structure representing one download job.
///
/// Contains all the information needed to drive the pipeline: source URL,
/// submitting user, requested format and quality, plus the bookkeeping
/// the scheduler and `status` queries rely on.
#[derive(Debug, Clone)]
pub struct Job {
    /// Unique job identifier
    pub id: Uuid,
    /// Submitting user (fairness key)
    pub user_id: i64,
    /// Provider the source URL belongs to
    pub provider: Provider,
    /// Source URL for the download
    pub url: Url,
    /// Requested artifact format
    pub format: MediaFormat,
    /// Requested quality; `None` falls back to the format default
    pub quality: Option<String>,
    /// Lifecycle state
    pub state: JobState,
    /// Attempts consumed so far
    pub attempts: u32,
    /// Admission timestamp
    pub created_at: DateTime<Utc>,
    /// Last classified failure, kept for `status` queries
    pub last_error: Option<String>,
    /// Delivered artifact path once `Succeeded`
    pub artifact_path: Option<String>,
}

impl Job {
    /// Creates a new `Queued` job with a fresh UUID and the current timestamp.
    pub fn new(
        user_id: i64,
        provider: Provider,
        url: Url,
        format: MediaFormat,
        quality: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            provider,
            url,
            format,
            quality,
            state: JobState::Queued,
            attempts: 0,
            created_at: Utc::now(),
            last_error: None,
            artifact_path: None,
        }
    }

    /// Requested quality, falling back to the format default ("320k" for
    /// audio, "720p" for video).
    pub fn effective_quality(&self) -> String {
        self.quality
            .clone()
            .unwrap_or_else(|| self.format.default_quality().to_string())
    }

    /// Serializable projection for the `status` surface.
    pub fn view(&self) -> JobView {
        JobView {
            id: self.id,
            user_id: self.user_id,
            provider: self.provider,
            url: self.url.to_string(),
            format: self.format,
            quality: self.quality.clone(),
            state: self.state,
            attempts: self.attempts,
            created_at: self.created_at,
            last_error: self.last_error.clone(),
            artifact_path: self.artifact_path.clone(),
        }
    }
}

/// Serializable projection of a job returned by `status` queries.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: Uuid,
    pub user_id: i64,
    pub provider: Provider,
    pub url: String,
    pub format: MediaFormat,
    pub quality: Option<String>,
    pub state: JobState,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub artifact_path: Option<String>,
}

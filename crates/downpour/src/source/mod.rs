//! Multi-provider extraction source abstraction layer.
//!
//! Provides the `MediaSource` trait for implementing pluggable extraction
//! backends and a `SourceRegistry` that routes jobs to the backend registered
//! for their provider. New backends are added by implementing `MediaSource`
//! and registering them in the registry; the engine itself ships none, the
//! embedding application decides how bytes are actually fetched.

use async_trait::async_trait;
use lazy_regex::regex_is_match;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use url::Url;

use crate::core::error::EngineResult;
use crate::credentials::CredentialLease;

/// Provider a job runs against. Credentials, rate windows and extraction
/// backends are all keyed by this.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// youtube.com, youtu.be, music.youtube.com
    YouTube,
    /// open.spotify.com
    Spotify,
    /// instagram.com, instagr.am
    Instagram,
    /// soundcloud.com, snd.sc
    SoundCloud,
}

impl Provider {
    /// Infer the provider from a URL's host.
    ///
    /// Matches registrable domains and their subdomains; returns `None` for
    /// hosts no provider claims.
    pub fn from_url(url: &Url) -> Option<Provider> {
        let host = url.host_str()?;

        if regex_is_match!(r"(^|\.)(youtube\.com|youtu\.be|youtube-nocookie\.com)$"i, host) {
            Some(Provider::YouTube)
        } else if regex_is_match!(r"(^|\.)spotify\.com$"i, host) {
            Some(Provider::Spotify)
        } else if regex_is_match!(r"(^|\.)(instagram\.com|instagr\.am)$"i, host) {
            Some(Provider::Instagram)
        } else if regex_is_match!(r"(^|\.)(soundcloud\.com|snd\.sc)$"i, host) {
            Some(Provider::SoundCloud)
        } else {
            None
        }
    }
}

/// Delivery format a job asks for.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MediaFormat {
    /// Audio, extracted or transcoded
    Mp3,
    /// Video container
    Mp4,
    /// Subtitles with timestamps
    Srt,
    /// Subtitles as plain text
    Txt,
}

impl MediaFormat {
    /// File extension for the format (no dot).
    pub fn extension(&self) -> &'static str {
        match self {
            MediaFormat::Mp3 => "mp3",
            MediaFormat::Mp4 => "mp4",
            MediaFormat::Srt => "srt",
            MediaFormat::Txt => "txt",
        }
    }

    /// Quality label used when the request carries none, for metrics and
    /// source hints.
    pub fn default_quality(&self) -> &'static str {
        match self {
            MediaFormat::Mp3 => "320k",
            MediaFormat::Mp4 => "720p",
            MediaFormat::Srt | MediaFormat::Txt => "default",
        }
    }

    /// Whether a delivered file already has this format's extension.
    /// Case-insensitive, so a source handing back `.MP3` does not trigger
    /// a pointless transcode.
    pub fn matches_path(&self, path: &str) -> bool {
        std::path::Path::new(path)
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case(self.extension()))
            .unwrap_or(false)
    }
}

/// Metadata resolved for a URL before any bytes move.
///
/// Admission checks (duration, size) and the metadata cache both work off
/// this struct.
#[derive(Debug, Clone)]
pub struct MediaMetadata {
    /// Media title
    pub title: String,
    /// Artist / uploader, when the provider exposes one
    pub artist: Option<String>,
    /// Duration in seconds (if media file)
    pub duration_secs: Option<u32>,
    /// Estimated file size in bytes, when the provider exposes one
    pub estimated_size: Option<u64>,
    /// Whether the URL points to a livestream (not downloadable)
    pub is_live: bool,
}

/// Progress information emitted during transfer.
#[derive(Debug, Clone)]
pub struct SourceProgress {
    /// Transfer progress percentage (0-100)
    pub percent: u8,
    /// Transfer speed in bytes per second
    pub speed_bytes_sec: Option<f64>,
    /// Estimated time remaining in seconds
    pub eta_seconds: Option<u64>,
    /// Bytes transferred so far
    pub downloaded_bytes: Option<u64>,
    /// Total bytes expected
    pub total_bytes: Option<u64>,
}

/// Request parameters for a transfer operation.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// URL to download from
    pub url: Url,
    /// Local path to save the downloaded file
    pub output_path: String,
    /// Target format
    pub format: MediaFormat,
    /// Quality hint (e.g., "320k", "720p")
    pub quality: Option<String>,
    /// Maximum allowed file size in bytes
    pub max_file_size: Option<u64>,
    /// 1-based attempt number. Sources may degrade quality on later attempts.
    pub attempt: u32,
}

/// Output from a successful transfer operation.
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    /// Actual file path of the downloaded file (may differ from requested path)
    pub file_path: String,
    /// File size in bytes
    pub file_size: u64,
    /// Duration in seconds (if media file)
    pub duration_secs: Option<u32>,
    /// MIME type hint (e.g., "audio/mpeg", "video/mp4")
    pub mime_hint: Option<String>,
}

/// Trait for extraction source implementations.
///
/// Each source serves exactly one provider and receives the credential the
/// worker leased for the attempt. Both calls run under the engine's per-call
/// timeout; implementations should not add their own outer retry loops,
/// since failed calls are retried by the engine according to their error
/// class.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Human-readable name of this source (e.g., "yt-dlp", "scdl")
    fn name(&self) -> &str;

    /// Provider this source serves.
    fn provider(&self) -> Provider;

    /// Whether this source can handle the given URL.
    fn supports_url(&self, url: &Url) -> bool;

    /// Resolve metadata (title, duration, size estimate) for the URL.
    async fn resolve(&self, url: &Url, credential: &CredentialLease) -> EngineResult<MediaMetadata>;

    /// Execute the transfer, sending progress updates through the channel.
    /// Dropping the sender without an error means the source stopped
    /// reporting, not that the transfer failed.
    async fn transfer(
        &self,
        request: &TransferRequest,
        credential: &CredentialLease,
        progress_tx: mpsc::UnboundedSender<SourceProgress>,
    ) -> EngineResult<TransferOutcome>;
}

/// Trait for post-transfer container conversion.
///
/// Invoked only when the delivered file's extension differs from the
/// requested format. Returns the path of the converted artifact.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Convert `input_path` into the target format, returning the new path.
    async fn transcode(&self, input_path: &str, target: MediaFormat) -> EngineResult<String>;
}

/// Registry that routes jobs to the extraction source registered for their
/// provider.
///
/// Sources are tried in insertion order; the first source for the provider
/// that also claims the URL wins, so a specialised backend can be registered
/// ahead of a general one.
#[derive(Default)]
pub struct SourceRegistry {
    sources: Vec<Arc<dyn MediaSource>>,
}

impl SourceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self { sources: Vec::new() }
    }

    /// Register an extraction source. Sources are tried in insertion order.
    pub fn register(&mut self, source: Arc<dyn MediaSource>) {
        self.sources.push(source);
    }

    /// Find the first source for the provider that supports the given URL.
    pub fn resolve(&self, provider: Provider, url: &Url) -> Option<Arc<dyn MediaSource>> {
        self.sources
            .iter()
            .find(|s| s.provider() == provider && s.supports_url(url))
            .cloned()
    }

    /// Whether any registered source claims the URL.
    pub fn supports(&self, url: &Url) -> bool {
        self.sources.iter().any(|s| s.supports_url(url))
    }

    /// Names of all registered sources, for startup diagnostics.
    pub fn names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }
}

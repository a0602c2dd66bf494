//! Downpour: download orchestration engine for multi-source media fetching
//!
//! This library provides the core machinery for running high-volume media
//! downloads against rate-limited providers: a fair per-user job queue, a
//! rotating credential pool with cooldown and quarantine tracking, a
//! classified retry protocol, a bounded worker pool and a pluggable
//! progress sink. The chat front end, the extraction backend and the
//! transcoder are external collaborators wired in through traits.
//!
//! # Module Structure
//!
//! - `cache`: short-lived metadata cache keyed by URL
//! - `core`: configuration, errors, retry protocol, logging, metrics
//! - `credentials`: credential pool, rotation, quarantine, import
//! - `queue`: fair job queue and the job model
//! - `rate`: fixed-window cooldown gate
//! - `source`: provider traits and the source registry
//! - `workers`: the worker pool driving the download pipeline
//! - `progress`: progress reporting types and sinks
//! - `storage`: SQLite persistence for restart resilience
//! - `engine`: the facade tying everything together

pub mod cache;
pub mod core;
pub mod credentials;
pub mod engine;
pub mod progress;
pub mod queue;
pub mod rate;
pub mod source;
pub mod storage;
pub mod workers;

// Re-export commonly used types for convenience
pub use core::{config, EngineError, EngineResult, ErrorClass};
pub use credentials::{CredentialKind, CredentialLease, CredentialPool, CredentialView};
pub use engine::{Engine, EngineConfig};
pub use progress::{ChannelReporter, LogReporter, ProgressEvent, ProgressReporter, ProgressUpdate, TerminalUpdate};
pub use queue::{Job, JobQueue, JobRequest, JobState, JobView};
pub use source::{MediaFormat, MediaMetadata, MediaSource, Provider, SourceRegistry, Transcoder};
pub use storage::{create_pool, get_connection, DbConnection, DbPool};

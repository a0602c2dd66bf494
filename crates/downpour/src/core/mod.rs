//! Core utilities: configuration, errors, retry protocol, logging, metrics

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod retry;

// Re-exports for convenience
pub use error::{EngineError, EngineResult, ErrorClass};
pub use logging::{init_logger, log_credentials_configuration};

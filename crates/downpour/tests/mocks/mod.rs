//! Mock extraction backends shared across integration tests

pub mod scripted_source;

#[allow(unused_imports)]
pub use scripted_source::{AttemptPlan, RenamingTranscoder, ScriptedSource};

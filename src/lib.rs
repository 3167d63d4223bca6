//! Judges untrusted submissions in Python, JavaScript, C and C++ against
//! test cases inside resource-limited OS sandboxes.

pub mod config;
pub mod constants;
pub mod coordinator;
pub mod core;
pub mod languages;
pub mod native;

#[cfg(test)]
mod stubs;

pub use config::EngineConfig;
pub use coordinator::JudgeEngine;
pub use crate::core::domain::{JudgeResult, JudgeVerdict, SubmissionRequest};

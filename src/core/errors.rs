use std::path::PathBuf;

use thiserror::Error;

use crate::core::{
    domain::{CompilationLimitType, InputMode, Language},
    pipeline::verdict::JudgeState,
};

/// A submission that cannot be judged as constructed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("submission must contain at least one test case")]
    NoTestCases,
    #[error("test case {index} uses {found:?} input but the submission uses {expected:?}")]
    MixedInputModes {
        index: usize,
        expected: InputMode,
        found: InputMode,
    },
    #[error("test case {index} has an expected output that does not fit {mode:?} input")]
    ExpectedShapeMismatch { index: usize, mode: InputMode },
    #[error("invalid entry point name: {0:?}")]
    InvalidEntryPoint(String),
    #[error("resource limit `{0}` must be greater than zero")]
    ZeroLimit(&'static str),
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox command is empty")]
    EmptyCommand,
    #[error("failed to spawn sandboxed process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("sandboxed process has no {0} pipe")]
    MissingPipe(&'static str),
    #[error("failed to supervise sandboxed process: {0}")]
    Supervise(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum PrepareError {
    #[error("compilation failed")]
    CompilationFailed { diagnostics: String },
    /// The compiler or checker itself crashed, as opposed to rejecting the source.
    #[error("toolchain failed (exit code {exit_code:?}, signal {signal:?})")]
    Toolchain {
        exit_code: Option<i32>,
        signal: Option<i32>,
        stderr: String,
    },
    #[error("compilation exceeded its {0:?} limit")]
    CompilationLimitsExceeded(CompilationLimitType),
    #[error("compiler produced no artifact at {}", .0.display())]
    MissingArtifact(PathBuf),
    #[error("workspace error: {0}")]
    Workspace(#[from] std::io::Error),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("invalid deny pattern {pattern:?} for {language}: {source}")]
    DenyPattern {
        language: Language,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid judge state transition {from:?} -> {to:?}")]
pub struct StateError {
    pub from: JudgeState,
    pub to: JudgeState,
}

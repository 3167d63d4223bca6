use std::path::Path;

use crate::core::{
    domain::{Artifact, ExecutionOutcome, InputMode, Language, ResourceProfile},
    errors::{PrepareError, SandboxError},
    traits::sandbox::MemoryLedger,
};

/// How a finished program ended, judged from its exit status and signal.
/// Stderr is program-controlled, so it may only refine a failure, never
/// turn a clean exit into one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgramExit {
    /// Exit status 0 and no signal.
    Clean,
    Exception,
    OutOfMemory,
}

/// Per-language strategy for turning source into something runnable and
/// running it once per test case inside the sandbox.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait LanguageExecutor: std::fmt::Debug + Send + Sync {
    fn language(&self) -> Language;

    fn supports(&self, mode: InputMode) -> bool;

    /// Writes the source (and harness) into `workspace` and compiles or
    /// syntax-checks it. Runs at most once per submission.
    async fn prepare(
        &self,
        workspace: &Path,
        source: &str,
        entry_point: &str,
        mode: InputMode,
    ) -> Result<Artifact, PrepareError>;

    /// Executes the artifact once with `cwd` as its private run directory.
    async fn run(
        &self,
        artifact: &Artifact,
        cwd: &Path,
        stdin: &str,
        limits: &ResourceProfile,
        ledger: Option<MemoryLedger>,
    ) -> Result<ExecutionOutcome, SandboxError>;

    fn classify_exit(&self, artifact: &Artifact, outcome: &ExecutionOutcome) -> ProgramExit;
}

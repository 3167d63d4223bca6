use std::path::PathBuf;
use std::sync::Arc;

use futures::{StreamExt, stream};

use crate::{
    constants::AUDIT_TARGET,
    core::{
        compare::{Comparison, compare_output},
        domain::{
            Artifact, ComparePolicy, ErrorKind, ExecutionOutcome, LimitKind, ResourceProfile,
            ShortCircuit, TestCase,
        },
        traits::{
            executor::{LanguageExecutor, ProgramExit},
            sandbox::MemoryLedger,
        },
    },
    native::workspace::run_dir,
};

/// Longest stderr excerpt written to the audit log per test.
const AUDIT_STDERR_BYTES: usize = 2048;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TestState {
    Passed,
    /// Ran cleanly but the output did not match.
    Failed { actual: String },
    Errored(ErrorKind),
    /// Not run because an earlier test stopped the submission.
    Skipped,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestRun {
    pub index: usize,
    pub state: TestState,
    pub wall_time_ms: u64,
    pub cpu_time_ms: u64,
    pub memory_used_bytes: u64,
}

impl TestRun {
    fn without_usage(index: usize, state: TestState) -> Self {
        Self {
            index,
            state,
            wall_time_ms: 0,
            cpu_time_ms: 0,
            memory_used_bytes: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RunPolicy {
    pub compare: ComparePolicy,
    pub short_circuit: ShortCircuit,
    /// Tests in flight at once; 1 runs them strictly in order.
    pub parallelism: usize,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            compare: ComparePolicy::default(),
            short_circuit: ShortCircuit::Never,
            parallelism: 1,
        }
    }
}

impl RunPolicy {
    fn stops_after(&self, state: &TestState) -> bool {
        match self.short_circuit {
            ShortCircuit::Never => false,
            ShortCircuit::OnError => matches!(state, TestState::Errored(_)),
            ShortCircuit::OnFailure => {
                matches!(state, TestState::Errored(_) | TestState::Failed { .. })
            }
        }
    }
}

/// Drives every test case of one submission through its prepared artifact.
#[derive(Debug)]
pub struct TestRunner {
    executor: Arc<dyn LanguageExecutor>,
    artifact: Artifact,
    workspace: PathBuf,
    limits: ResourceProfile,
    policy: RunPolicy,
}

impl TestRunner {
    pub fn new(
        executor: Arc<dyn LanguageExecutor>,
        artifact: Artifact,
        workspace: impl Into<PathBuf>,
        limits: ResourceProfile,
        policy: RunPolicy,
    ) -> Self {
        Self {
            executor,
            artifact,
            workspace: workspace.into(),
            limits,
            policy,
        }
    }

    /// Returns exactly one run per test, in index order.
    #[tracing::instrument(skip_all, fields(artifact = %self.artifact.id, tests = tests.len()))]
    pub async fn run_all(&self, tests: &[TestCase]) -> Vec<TestRun> {
        let parallelism = self.policy.parallelism.max(1);
        // Concurrent tests share the submission's memory ceiling.
        let ledger = (parallelism > 1).then(|| MemoryLedger::new(self.limits.memory_limit_bytes));

        // Built up front so the stream holds plain boxed futures and stays
        // `Send` inside the spawned judging task.
        let futures: Vec<_> = tests
            .iter()
            .enumerate()
            .map(|(index, test)| Box::pin(self.run_one(index, test, ledger.clone())))
            .collect();
        let mut runs = Vec::with_capacity(tests.len());
        let mut pending = stream::iter(futures).buffered(parallelism);
        while let Some(run) = pending.next().await {
            let stop = self.policy.stops_after(&run.state);
            runs.push(run);
            if stop {
                tracing::debug!(index = runs.len() - 1, "Short-circuiting remaining tests");
                break;
            }
        }
        // Dropping the stream cancels in-flight runs; their sandboxes kill
        // the process groups on drop.
        drop(pending);

        for index in runs.len()..tests.len() {
            runs.push(TestRun::without_usage(index, TestState::Skipped));
        }
        runs
    }

    pub async fn run_one(&self, index: usize, test: &TestCase, ledger: Option<MemoryLedger>) -> TestRun {
        let cwd = run_dir(&self.workspace, index);
        if let Err(e) = tokio::fs::create_dir_all(&cwd).await {
            tracing::error!(index, "Failed to create run directory: {}", e);
            return TestRun::without_usage(index, TestState::Errored(ErrorKind::Internal));
        }

        let stdin = test.input.to_stdin();
        let outcome = match self
            .executor
            .run(&self.artifact, &cwd, &stdin, &self.limits, ledger)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(index, "Sandbox failed: {}", e);
                return TestRun::without_usage(index, TestState::Errored(ErrorKind::Internal));
            }
        };

        let state = self.classify(test, &outcome);
        if let TestState::Errored(kind) = &state {
            tracing::info!(
                target: AUDIT_TARGET,
                artifact = %self.artifact.id,
                index,
                error_kind = %kind,
                exit_code = ?outcome.exit_code,
                signal = ?outcome.signal,
                stderr = excerpt(&outcome.stderr, AUDIT_STDERR_BYTES),
                "Test errored"
            );
        }
        tracing::debug!(index, state = ?state, wall_ms = outcome.wall_time_ms, "Test finished");

        TestRun {
            index,
            state,
            wall_time_ms: outcome.wall_time_ms,
            cpu_time_ms: outcome.cpu_time_ms,
            memory_used_bytes: outcome.memory_used_bytes,
        }
    }

    fn classify(&self, test: &TestCase, outcome: &ExecutionOutcome) -> TestState {
        if outcome.timed_out || outcome.limit_exceeded == Some(LimitKind::Cpu) {
            return TestState::Errored(ErrorKind::Timeout);
        }
        if outcome.limit_exceeded == Some(LimitKind::Memory) {
            return TestState::Errored(ErrorKind::Memory);
        }
        match self.executor.classify_exit(&self.artifact, outcome) {
            ProgramExit::OutOfMemory => return TestState::Errored(ErrorKind::Memory),
            ProgramExit::Exception => return TestState::Errored(ErrorKind::Runtime),
            ProgramExit::Clean => {}
        }
        if outcome.truncated_output {
            return TestState::Failed {
                actual: outcome.stdout.clone(),
            };
        }
        match compare_output(&test.expected_output, &outcome.stdout, &self.policy.compare) {
            Comparison::Match => TestState::Passed,
            Comparison::Mismatch { actual } => TestState::Failed { actual },
        }
    }
}

fn excerpt(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

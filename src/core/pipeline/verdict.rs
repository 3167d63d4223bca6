use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    constants::{DETAIL_EXCERPT_CHARS, MSG_BUSY, MSG_FAIL, MSG_PASS},
    core::{
        domain::{ErrorKind, JudgeResult, JudgeVerdict, TestCase, TestDetail, TestReport, TestStatus},
        errors::StateError,
        pipeline::running::{TestRun, TestState},
    },
};

/// How per-test wall times fold into `execution_time_ms`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeAggregation {
    #[default]
    Max,
    Sum,
}

/// Lifecycle of one judging call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JudgeState {
    Received,
    Screened,
    Rejected,
    Preparing,
    CompileFailed,
    Ready,
    Running,
    Errored,
    Completed,
    Passed,
    Failed,
}

impl JudgeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JudgeState::Rejected
                | JudgeState::CompileFailed
                | JudgeState::Errored
                | JudgeState::Passed
                | JudgeState::Failed
        )
    }

    pub fn allows(&self, next: JudgeState) -> bool {
        use JudgeState::*;
        match (*self, next) {
            (Received, Screened)
            | (Screened, Rejected)
            | (Screened, Preparing)
            | (Preparing, CompileFailed)
            | (Preparing, Ready)
            | (Ready, Running)
            | (Running, Completed)
            | (Completed, Passed)
            | (Completed, Failed) => true,
            // Engine faults and limit breaches can end any live judgement.
            (from, Errored) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Validates and logs the state transitions of one judgement.
#[derive(Debug)]
pub struct StateTracker {
    id: Uuid,
    state: JudgeState,
}

impl StateTracker {
    pub fn new(id: Uuid) -> Self {
        tracing::debug!(judgement = %id, state = ?JudgeState::Received, "Judgement received");
        Self {
            id,
            state: JudgeState::Received,
        }
    }

    pub fn state(&self) -> JudgeState {
        self.state
    }

    pub fn advance(&mut self, next: JudgeState) -> Result<(), StateError> {
        if !self.state.allows(next) {
            return Err(StateError {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(judgement = %self.id, from = ?self.state, to = ?next, "State transition");
        self.state = next;
        Ok(())
    }

    /// Moves to the terminal state matching `verdict`, passing through
    /// `Completed` when every test ran.
    pub fn finish(&mut self, verdict: &JudgeVerdict) -> Result<(), StateError> {
        match verdict.result() {
            JudgeResult::Error => self.advance(JudgeState::Errored),
            JudgeResult::Pass => {
                self.advance(JudgeState::Completed)?;
                self.advance(JudgeState::Passed)
            }
            JudgeResult::Fail => {
                self.advance(JudgeState::Completed)?;
                self.advance(JudgeState::Failed)
            }
        }
    }
}

/// Folds per-test runs into the submission verdict.
///
/// Any `INTERNAL` error wins; otherwise the first erroring test in index
/// order decides the error kind. Hidden tests never carry detail.
pub fn aggregate(tests: &[TestCase], runs: &[TestRun], time: TimeAggregation) -> JudgeVerdict {
    let reports: Vec<TestReport> = tests
        .iter()
        .enumerate()
        .map(|(index, test)| report(index, test, runs.get(index)))
        .collect();

    let errors = || {
        runs.iter().filter_map(|run| match run.state {
            TestState::Errored(kind) => Some(kind),
            _ => None,
        })
    };
    let error = errors()
        .find(|kind| *kind == ErrorKind::Internal)
        .or_else(|| errors().next());

    let execution_time_ms = match time {
        TimeAggregation::Max => runs.iter().map(|r| r.wall_time_ms).max().unwrap_or(0),
        TimeAggregation::Sum => runs
            .iter()
            .fold(0u64, |total, r| total.saturating_add(r.wall_time_ms)),
    };
    let memory_used_bytes = runs.iter().map(|r| r.memory_used_bytes).max().unwrap_or(0);

    let all_passed = reports.iter().all(|r| r.passed);
    let (result, message) = match error {
        Some(kind) => (JudgeResult::Error, kind.message()),
        None if all_passed => (JudgeResult::Pass, MSG_PASS),
        None => (JudgeResult::Fail, MSG_FAIL),
    };

    JudgeVerdict::new(
        result,
        error,
        message,
        reports,
        execution_time_ms,
        memory_used_bytes,
        None,
    )
}

fn report(index: usize, test: &TestCase, run: Option<&TestRun>) -> TestReport {
    let skipped = TestState::Skipped;
    let state = run.map_or(&skipped, |r| &r.state);
    let passed = *state == TestState::Passed;
    if test.is_hidden() {
        return TestReport {
            index,
            passed,
            visible_detail: None,
        };
    }

    let detail = match state {
        TestState::Passed => TestDetail {
            status: TestStatus::Passed,
            error_kind: None,
            expected: None,
            actual: None,
        },
        TestState::Failed { actual } => TestDetail {
            status: TestStatus::Failed,
            error_kind: None,
            expected: Some(excerpt(&test.expected_output.render())),
            actual: Some(excerpt(actual)),
        },
        TestState::Errored(kind) => TestDetail {
            status: TestStatus::Errored,
            error_kind: Some(*kind),
            expected: None,
            actual: None,
        },
        TestState::Skipped => TestDetail {
            status: TestStatus::Skipped,
            error_kind: None,
            expected: None,
            actual: None,
        },
    };
    TestReport {
        index,
        passed,
        visible_detail: Some(detail),
    }
}

fn excerpt(text: &str) -> String {
    text.chars().take(DETAIL_EXCERPT_CHARS).collect()
}

fn unexecuted(total: usize) -> Vec<TestReport> {
    (0..total)
        .map(|index| TestReport {
            index,
            passed: false,
            visible_detail: None,
        })
        .collect()
}

/// Verdict for a judgement that ended before any test ran.
pub fn error_verdict(kind: ErrorKind, total: usize) -> JudgeVerdict {
    JudgeVerdict::new(
        JudgeResult::Error,
        Some(kind),
        kind.message(),
        unexecuted(total),
        0,
        0,
        None,
    )
}

pub fn busy_verdict(total: usize) -> JudgeVerdict {
    JudgeVerdict::new(
        JudgeResult::Error,
        Some(ErrorKind::Internal),
        MSG_BUSY,
        unexecuted(total),
        0,
        0,
        None,
    )
}

pub fn syntax_verdict(total: usize, diagnostics: Option<String>) -> JudgeVerdict {
    JudgeVerdict::new(
        JudgeResult::Error,
        Some(ErrorKind::Syntax),
        ErrorKind::Syntax.message(),
        unexecuted(total),
        0,
        0,
        diagnostics,
    )
}

/// Strips the workspace directory from compiler output so only bare file
/// names remain, then truncates to `max_bytes`.
pub fn sanitize_diagnostics(raw: &str, workspace: &Path, max_bytes: usize) -> String {
    let root = workspace.to_string_lossy();
    let mut cleaned = raw.replace(&format!("{root}/"), "").replace(root.as_ref(), ".");
    if cleaned.len() > max_bytes {
        let mut end = max_bytes;
        while !cleaned.is_char_boundary(end) {
            end -= 1;
        }
        cleaned.truncate(end);
    }
    cleaned
}

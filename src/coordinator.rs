use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use uuid::Uuid;

use crate::{
    config::EngineConfig,
    constants::AUDIT_TARGET,
    core::{
        domain::{CompilationLimitType, ErrorKind, JudgeVerdict, Language, ResourceProfile, SubmissionRequest},
        errors::{ConfigError, PrepareError},
        pipeline::{
            running::{RunPolicy, TestRunner},
            screening::Screener,
            verdict::{
                JudgeState, StateTracker, aggregate, busy_verdict, error_verdict, sanitize_diagnostics,
                syntax_verdict,
            },
        },
        traits::executor::LanguageExecutor,
    },
    languages::ExecutorRegistry,
    native::{sandbox::ProcessSandbox, workspace::Workspace},
};

/// Entry point of the engine. Cheap to clone; all clones share one slot
/// pool and one read-only configuration.
#[derive(Clone, Debug)]
pub struct JudgeEngine {
    inner: Arc<EngineInner>,
}

#[derive(Debug)]
struct EngineInner {
    config: EngineConfig,
    screener: Screener,
    registry: ExecutorRegistry,
    slots: Arc<Semaphore>,
}

impl JudgeEngine {
    pub fn new(config: EngineConfig, registry: ExecutorRegistry) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut screener = Screener::new(config.max_source_bytes)?;
        for language in Language::ALL {
            screener = screener.with_patterns(language, &config.languages.get(language).deny_patterns)?;
        }
        let slots = Arc::new(Semaphore::new(config.max_concurrent_sandboxes));
        tracing::info!(
            slots = config.max_concurrent_sandboxes,
            languages = ?registry.languages(),
            "Judge engine ready"
        );
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                screener,
                registry,
                slots,
            }),
        })
    }

    /// Engine backed by OS-process sandboxes and the executors enabled in `config`.
    pub fn from_config(config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let sandbox = Arc::new(ProcessSandbox::new(config.sandbox.clone()));
        let registry = ExecutorRegistry::from_config(&config, sandbox);
        Self::new(config, registry)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn languages(&self) -> Vec<Language> {
        self.inner.registry.languages()
    }

    pub fn available_slots(&self) -> usize {
        self.inner.slots.available_permits()
    }

    /// Judges one submission. Every failure inside the engine is folded
    /// into the returned verdict.
    pub async fn judge(&self, request: SubmissionRequest) -> JudgeVerdict {
        self.judge_with_id(Uuid::new_v4(), request).await
    }

    #[tracing::instrument(skip_all, fields(judgement = %id, language = %request.language()))]
    async fn judge_with_id(&self, id: Uuid, request: SubmissionRequest) -> JudgeVerdict {
        let received_at = Utc::now();
        let language = request.language();
        let verdict = self.admit(id, request).await;

        tracing::info!(
            target: AUDIT_TARGET,
            judgement = %id,
            %language,
            received_at = %received_at.to_rfc3339(),
            finished_at = %Utc::now().to_rfc3339(),
            result = ?verdict.result(),
            error_kind = ?verdict.error_kind(),
            passed = verdict.passed_count(),
            total = verdict.total_count(),
            execution_time_ms = verdict.execution_time_ms(),
            memory_used_bytes = verdict.memory_used_bytes(),
            "Judgement finished"
        );
        verdict
    }

    async fn admit(&self, id: Uuid, request: SubmissionRequest) -> JudgeVerdict {
        let total = request.test_cases().len();
        let language = request.language();
        let mut tracker = StateTracker::new(id);

        let Some(executor) = self.inner.registry.get(language) else {
            tracing::error!(%language, "No executor registered for language");
            step(&mut tracker, JudgeState::Errored);
            return error_verdict(ErrorKind::Internal, total);
        };
        let mode = request.input_mode();
        if !executor.supports(mode) {
            tracing::error!(%language, mode = mode.as_str(), "Input mode not supported by executor");
            step(&mut tracker, JudgeState::Errored);
            return error_verdict(ErrorKind::Internal, total);
        }

        let screening = self.inner.screener.screen(request.source_code(), language);
        step(&mut tracker, JudgeState::Screened);
        if !screening.safe {
            tracing::info!(
                target: AUDIT_TARGET,
                judgement = %id,
                reason = screening.reason.as_deref().unwrap_or_default(),
                "Submission rejected by pre-screen"
            );
            step(&mut tracker, JudgeState::Rejected);
            return error_verdict(ErrorKind::Security, total);
        }

        let limits = self.inner.config.resolve_limits(language, request.limits());
        let Some(permits) = self.acquire_slots().await else {
            tracing::warn!(
                available = self.available_slots(),
                "No execution slot within admission timeout"
            );
            step(&mut tracker, JudgeState::Errored);
            return busy_verdict(total);
        };

        // The pipeline owns the permits and the workspace. A panic inside it
        // stays in the task; dropping this call aborts the task, which kills
        // its process groups and removes its workspace.
        let inner = self.inner.clone();
        let pipeline = AbortOnDrop(tokio::spawn(async move {
            let verdict = inner
                .run_pipeline(id, &request, executor, limits, &mut tracker)
                .await;
            drop(permits);
            verdict
        }));
        match pipeline.join().await {
            Ok(verdict) => verdict,
            Err(e) => {
                tracing::error!(judgement = %id, "Judging task failed: {}", e);
                error_verdict(ErrorKind::Internal, total)
            }
        }
    }

    async fn acquire_slots(&self) -> Option<OwnedSemaphorePermit> {
        let wanted = u32::try_from(self.inner.config.parallel_tests.max(1)).unwrap_or(u32::MAX);
        let timeout = Duration::from_millis(self.inner.config.admission_timeout_ms);
        match tokio::time::timeout(timeout, self.inner.slots.clone().acquire_many_owned(wanted)).await {
            Ok(Ok(permits)) => Some(permits),
            Ok(Err(_)) | Err(_) => None,
        }
    }
}

impl EngineInner {
    async fn run_pipeline(
        &self,
        id: Uuid,
        request: &SubmissionRequest,
        executor: Arc<dyn LanguageExecutor>,
        limits: ResourceProfile,
        tracker: &mut StateTracker,
    ) -> JudgeVerdict {
        let total = request.test_cases().len();
        step(tracker, JudgeState::Preparing);

        let workspace = match Workspace::create(&self.config.scratch_root).await {
            Ok(workspace) => workspace,
            Err(e) => {
                tracing::error!(judgement = %id, "Failed to create workspace: {}", e);
                step(tracker, JudgeState::Errored);
                return error_verdict(ErrorKind::Internal, total);
            }
        };
        tracing::debug!(judgement = %id, workspace = %workspace.id(), "Workspace created");

        let verdict = self
            .judge_in(id, request, executor, limits, tracker, workspace.path())
            .await;
        workspace.remove().await;
        verdict
    }

    async fn judge_in(
        &self,
        id: Uuid,
        request: &SubmissionRequest,
        executor: Arc<dyn LanguageExecutor>,
        limits: ResourceProfile,
        tracker: &mut StateTracker,
        workspace: &Path,
    ) -> JudgeVerdict {
        let total = request.test_cases().len();
        let prepared = executor
            .prepare(
                workspace,
                request.source_code(),
                request.entry_point(),
                request.input_mode(),
            )
            .await;
        let artifact = match prepared {
            Ok(artifact) => artifact,
            Err(e) => {
                let verdict = self.preparation_verdict(id, e, workspace, total);
                let next = if verdict.error_kind() == Some(ErrorKind::Syntax) {
                    JudgeState::CompileFailed
                } else {
                    JudgeState::Errored
                };
                step(tracker, next);
                return verdict;
            }
        };
        step(tracker, JudgeState::Ready);

        let policy = RunPolicy {
            compare: *request.compare(),
            short_circuit: request.short_circuit().unwrap_or(self.config.short_circuit),
            parallelism: self.config.parallel_tests,
        };
        let runner = TestRunner::new(executor, artifact, workspace, limits, policy);
        step(tracker, JudgeState::Running);
        let runs = runner.run_all(request.test_cases()).await;

        let verdict = aggregate(request.test_cases(), &runs, self.config.time_aggregation);
        if let Err(e) = tracker.finish(&verdict) {
            tracing::error!(judgement = %id, "{}", e);
        }
        verdict
    }

    fn preparation_verdict(&self, id: Uuid, error: PrepareError, workspace: &Path, total: usize) -> JudgeVerdict {
        match error {
            PrepareError::CompilationFailed { diagnostics } => {
                tracing::info!(target: AUDIT_TARGET, judgement = %id, diagnostics = diagnostics.as_str(), "Compilation failed");
                let shown = (self.config.expose_compiler_diagnostics && !diagnostics.trim().is_empty())
                    .then(|| sanitize_diagnostics(&diagnostics, workspace, self.config.max_diagnostics_bytes));
                syntax_verdict(total, shown)
            }
            PrepareError::CompilationLimitsExceeded(CompilationLimitType::Time) => {
                error_verdict(ErrorKind::Timeout, total)
            }
            PrepareError::CompilationLimitsExceeded(CompilationLimitType::Ram) => {
                error_verdict(ErrorKind::Memory, total)
            }
            PrepareError::Toolchain {
                exit_code,
                signal,
                stderr,
            } => {
                tracing::error!(
                    target: AUDIT_TARGET,
                    judgement = %id,
                    ?exit_code,
                    ?signal,
                    stderr = stderr.as_str(),
                    "Toolchain failed"
                );
                error_verdict(ErrorKind::Internal, total)
            }
            other => {
                tracing::error!(judgement = %id, "Preparation failed: {}", other);
                error_verdict(ErrorKind::Internal, total)
            }
        }
    }
}

/// Aborts the judging task when the caller stops waiting for it.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> AbortOnDrop<T> {
    async fn join(mut self) -> Result<T, JoinError> {
        (&mut self.0).await
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn step(tracker: &mut StateTracker, next: JudgeState) {
    if let Err(e) = tracker.advance(next) {
        tracing::error!("{}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        constants::{MSG_BUSY, MSG_INTERNAL, MSG_PASS, MSG_SECURITY, WORKSPACE_PREFIX},
        core::{
            domain::{
                Artifact, ArtifactKind, ExecutionOutcome, ExpectedOutput, InputMode, JudgeResult,
                ShortCircuit, TestCase, TestInput,
            },
            traits::executor::MockLanguageExecutor,
        },
        languages::exit_class,
        stubs::sandbox::SandboxStub,
    };
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::Mutex;

    fn config() -> EngineConfig {
        EngineConfig {
            scratch_root: std::env::temp_dir().join("codejudge_engine_tests"),
            admission_timeout_ms: 100,
            ..EngineConfig::default()
        }
    }

    fn sum_case(a: i64, b: i64) -> TestCase {
        TestCase::public(
            TestInput::Args(vec![json!(a), json!(b)]),
            ExpectedOutput::Value(json!(a + b)),
        )
    }

    fn request(source: &str, tests: Vec<TestCase>) -> SubmissionRequest {
        SubmissionRequest::new(Language::Python, source, tests).unwrap()
    }

    fn artifact(workspace: &Path) -> Artifact {
        Artifact {
            id: Uuid::new_v4(),
            language: Language::Python,
            mode: InputMode::Args,
            kind: ArtifactKind::Script,
            path: workspace.join("solution.py"),
            harness: Some(workspace.join("harness.py")),
            entry_point: "solution".to_string(),
        }
    }

    fn base_executor() -> MockLanguageExecutor {
        let mut executor = MockLanguageExecutor::new();
        executor.expect_language().return_const(Language::Python);
        executor.expect_supports().returning(|mode| mode == InputMode::Args);
        executor
            .expect_classify_exit()
            .returning(|_, outcome| exit_class(outcome, true, None));
        executor
    }

    fn engine(executor: MockLanguageExecutor, config: EngineConfig) -> JudgeEngine {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(executor));
        JudgeEngine::new(config, registry).unwrap()
    }

    #[tokio::test]
    async fn test_passing_submission_cleans_workspace() {
        let seen = Arc::new(Mutex::new(None::<PathBuf>));
        let recorded = seen.clone();

        let mut executor = base_executor();
        executor
            .expect_prepare()
            .times(1)
            .returning(move |workspace, _, _, _| {
                *recorded.lock().unwrap() = Some(workspace.to_path_buf());
                Ok(artifact(workspace))
            });
        executor.expect_run().times(2).returning(|_, _, stdin, _, _| {
            let args: Vec<i64> = serde_json::from_str(stdin).unwrap();
            Ok(ExecutionOutcome {
                stdout: format!("{}\n", args.iter().sum::<i64>()),
                exit_code: Some(0),
                wall_time_ms: 7,
                memory_used_bytes: 2048,
                ..Default::default()
            })
        });

        let engine = engine(executor, config());
        let verdict = engine
            .judge(request("def solution(a, b):\n    return a + b\n", vec![sum_case(2, 3), sum_case(10, 20)]))
            .await;

        assert_eq!(verdict.result(), JudgeResult::Pass);
        assert_eq!(verdict.message(), MSG_PASS);
        assert_eq!(verdict.passed_count(), 2);
        assert_eq!(verdict.memory_used_bytes(), 2048);
        assert_eq!(engine.available_slots(), engine.config().max_concurrent_sandboxes);

        let workspace = seen.lock().unwrap().clone().unwrap();
        assert!(!workspace.exists());
    }

    #[tokio::test]
    async fn test_screen_rejection_never_prepares() {
        let engine = engine(base_executor(), config());
        let verdict = engine
            .judge(request("import os\nos.system('ls')\n", vec![sum_case(1, 1)]))
            .await;

        assert_eq!(verdict.result(), JudgeResult::Error);
        assert_eq!(verdict.error_kind(), Some(ErrorKind::Security));
        assert_eq!(verdict.message(), MSG_SECURITY);
        assert_eq!(verdict.passed_count(), 0);
        assert_eq!(verdict.total_count(), 1);
    }

    #[tokio::test]
    async fn test_oversized_source_is_security_error() {
        let config = EngineConfig {
            max_source_bytes: 16,
            ..config()
        };
        let engine = engine(base_executor(), config);
        let verdict = engine
            .judge(request(&"x = 1\n".repeat(10), vec![sum_case(1, 1)]))
            .await;
        assert_eq!(verdict.error_kind(), Some(ErrorKind::Security));
    }

    #[tokio::test]
    async fn test_unregistered_language_is_internal() {
        let engine = JudgeEngine::new(config(), ExecutorRegistry::new()).unwrap();
        let verdict = engine.judge(request("def solution(): pass", vec![sum_case(1, 1)])).await;

        assert_eq!(verdict.error_kind(), Some(ErrorKind::Internal));
        assert_eq!(verdict.message(), MSG_INTERNAL);
    }

    #[tokio::test]
    async fn test_unsupported_mode_is_internal() {
        let engine = engine(base_executor(), config());
        let stdin_case = TestCase::public(
            TestInput::Stdin("1 2\n".to_string()),
            ExpectedOutput::Text("3\n".to_string()),
        );
        let verdict = engine.judge(request("print(3)", vec![stdin_case])).await;
        assert_eq!(verdict.error_kind(), Some(ErrorKind::Internal));
    }

    #[tokio::test]
    async fn test_syntax_error_carries_sanitized_diagnostics() {
        let mut executor = base_executor();
        executor.expect_prepare().returning(|workspace, _, _, _| {
            Err(PrepareError::CompilationFailed {
                diagnostics: format!("{}/solution.py:1: SyntaxError: invalid syntax\n", workspace.display()),
            })
        });
        executor.expect_run().never();

        let engine = engine(executor, config());
        let verdict = engine.judge(request("def f(:", vec![sum_case(1, 1), sum_case(2, 2)])).await;

        assert_eq!(verdict.error_kind(), Some(ErrorKind::Syntax));
        assert_eq!(verdict.total_count(), 2);
        assert_eq!(verdict.diagnostics(), Some("solution.py:1: SyntaxError: invalid syntax\n"));
    }

    #[tokio::test]
    async fn test_diagnostics_can_be_hidden() {
        let mut executor = base_executor();
        executor.expect_prepare().returning(|_, _, _, _| {
            Err(PrepareError::CompilationFailed {
                diagnostics: "solution.py:1: SyntaxError".to_string(),
            })
        });
        let config = EngineConfig {
            expose_compiler_diagnostics: false,
            ..config()
        };
        let verdict = engine(executor, config)
            .judge(request("def f(:", vec![sum_case(1, 1)]))
            .await;
        assert_eq!(verdict.error_kind(), Some(ErrorKind::Syntax));
        assert!(verdict.diagnostics().is_none());
    }

    #[tokio::test]
    async fn test_preparation_failures_map_to_error_kinds() {
        let cases = [
            (CompilationLimitType::Time, ErrorKind::Timeout),
            (CompilationLimitType::Ram, ErrorKind::Memory),
        ];
        for (limit, kind) in cases {
            let mut executor = base_executor();
            executor
                .expect_prepare()
                .returning(move |_, _, _, _| Err(PrepareError::CompilationLimitsExceeded(limit)));
            let verdict = engine(executor, config())
                .judge(request("x = 1", vec![sum_case(1, 1)]))
                .await;
            assert_eq!(verdict.error_kind(), Some(kind));
        }

        let mut executor = base_executor();
        executor.expect_prepare().returning(|_, _, _, _| {
            Err(PrepareError::Toolchain {
                exit_code: None,
                signal: Some(libc::SIGSEGV),
                stderr: "internal compiler error".to_string(),
            })
        });
        let verdict = engine(executor, config())
            .judge(request("x = 1", vec![sum_case(1, 1)]))
            .await;
        assert_eq!(verdict.error_kind(), Some(ErrorKind::Internal));
        assert!(verdict.diagnostics().is_none());
    }

    #[tokio::test]
    async fn test_request_short_circuit_overrides_config() {
        let mut executor = base_executor();
        executor
            .expect_prepare()
            .returning(|workspace, _, _, _| Ok(artifact(workspace)));
        executor.expect_run().times(1).returning(|_, _, _, _, _| {
            Ok(ExecutionOutcome {
                exit_code: Some(1),
                stderr: "Traceback (most recent call last):\n".to_string(),
                ..Default::default()
            })
        });

        let verdict = engine(executor, config())
            .judge(
                request("def solution(a, b): raise ValueError()", vec![sum_case(1, 1), sum_case(2, 2)])
                    .with_short_circuit(ShortCircuit::OnError),
            )
            .await;
        assert_eq!(verdict.error_kind(), Some(ErrorKind::Runtime));
        assert!(verdict.per_test_results().iter().all(|r| !r.passed));
    }

    #[tokio::test]
    async fn test_panicking_pipeline_is_internal() {
        let mut executor = base_executor();
        executor
            .expect_prepare()
            .returning(|_, _, _, _| panic!("executor bug"));

        let engine = engine(executor, config());
        let verdict = engine.judge(request("x = 1", vec![sum_case(1, 1)])).await;

        assert_eq!(verdict.error_kind(), Some(ErrorKind::Internal));
        assert_eq!(engine.available_slots(), engine.config().max_concurrent_sandboxes);
    }

    #[tokio::test]
    async fn test_busy_when_no_slot_frees_up() {
        let config = EngineConfig {
            max_concurrent_sandboxes: 1,
            admission_timeout_ms: 50,
            ..config()
        };
        let sandbox = Arc::new(SandboxStub::new(
            ExecutionOutcome {
                stdout: "2\n".to_string(),
                exit_code: Some(0),
                ..Default::default()
            },
            Duration::from_millis(500),
        ));
        let registry = ExecutorRegistry::from_config(&config, sandbox.clone());
        let engine = JudgeEngine::new(config, registry).unwrap();

        let slow = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.judge(request("def solution(a, b): return a + b", vec![sum_case(1, 1)])).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let rejected = engine
            .judge(request("def solution(a, b): return a + b", vec![sum_case(1, 1)]))
            .await;

        assert_eq!(rejected.error_kind(), Some(ErrorKind::Internal));
        assert_eq!(rejected.message(), MSG_BUSY);

        let first = slow.await.unwrap();
        assert_eq!(first.result(), JudgeResult::Pass);
        // One syntax check and one test run.
        assert_eq!(sandbox.calls(), 2);
        assert_eq!(engine.available_slots(), 1);
    }

    fn workspaces(scratch_root: &Path) -> usize {
        std::fs::read_dir(scratch_root)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .filter(|e| e.file_name().to_string_lossy().starts_with(WORKSPACE_PREFIX))
                    .count()
            })
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_abandoned_judgement_releases_slots_and_workspace() {
        let scratch_root = std::env::temp_dir().join(format!("codejudge_abandon_{}", Uuid::new_v4()));
        let config = EngineConfig {
            scratch_root: scratch_root.clone(),
            ..config()
        };
        let sandbox = Arc::new(SandboxStub::new(
            ExecutionOutcome {
                exit_code: Some(0),
                ..Default::default()
            },
            Duration::from_secs(30),
        ));
        let registry = ExecutorRegistry::from_config(&config, sandbox.clone());
        let engine = JudgeEngine::new(config, registry).unwrap();

        let judging = engine.judge(request("def solution(a, b): return a + b", vec![sum_case(1, 1)]));
        assert!(tokio::time::timeout(Duration::from_millis(200), judging).await.is_err());
        assert_eq!(sandbox.calls(), 1);

        let released = async {
            while engine.available_slots() < engine.config().max_concurrent_sandboxes || workspaces(&scratch_root) > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        assert!(tokio::time::timeout(Duration::from_secs(5), released).await.is_ok());
        std::fs::remove_dir_all(&scratch_root).unwrap();
    }

    #[tokio::test]
    async fn test_parallel_tests_hold_multiple_slots() {
        let config = EngineConfig {
            max_concurrent_sandboxes: 2,
            parallel_tests: 2,
            ..config()
        };
        let registry = ExecutorRegistry::from_config(&config, Arc::new(SandboxStub::printing("4\n")));
        let engine = JudgeEngine::new(config, registry).unwrap();

        let verdict = engine
            .judge(request(
                "def solution(a, b): return a + b",
                vec![sum_case(2, 2), sum_case(1, 3), sum_case(0, 4)],
            ))
            .await;
        assert_eq!(verdict.result(), JudgeResult::Pass);
        assert_eq!(verdict.total_count(), 3);
        assert_eq!(engine.available_slots(), 2);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = EngineConfig {
            max_concurrent_sandboxes: 0,
            ..config()
        };
        assert!(JudgeEngine::new(config, ExecutorRegistry::new()).is_err());

        let mut config = self::config();
        config.languages.python.deny_patterns = vec!["(".to_string()];
        assert!(matches!(
            JudgeEngine::new(config, ExecutorRegistry::new()),
            Err(ConfigError::DenyPattern { .. })
        ));
    }
}

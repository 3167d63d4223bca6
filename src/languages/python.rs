use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use uuid::Uuid;

use crate::{
    config::LanguageConfig,
    constants::HARNESS_SYNTAX_EXIT,
    core::{
        domain::{Artifact, ArtifactKind, ExecutionOutcome, InputMode, Language, ResourceProfile},
        errors::{PrepareError, SandboxError},
        traits::{
            executor::{LanguageExecutor, ProgramExit},
            sandbox::{MemoryLedger, Sandbox, SandboxCommand},
        },
    },
    languages::{exit_class, preparation_result},
};

const SOURCE_FILE: &str = "solution.py";
const HARNESS_FILE: &str = "harness.py";

/// Driver for submitted Python. `check` compiles only; `args` reads a JSON
/// argument list from stdin, calls the entry point and prints the JSON
/// result as the only line on real stdout; `stdin` runs the module as
/// `__main__`. Failures leave through the exit status alone: 4 for
/// `MemoryError`, 1 for any other uncaught exception.
const HARNESS: &str = r#"import builtins
import json
import sys
import traceback

EXCEPTION_EXIT = 1
SYNTAX_EXIT = 3
MEMORY_EXIT = 4

ALLOWED = frozenset({
    "math", "cmath", "collections", "heapq", "bisect", "itertools", "functools",
    "operator", "string", "re", "typing", "fractions", "decimal", "statistics",
    "random", "copy", "dataclasses", "enum", "array",
})
BLOCKED = ("open", "exec", "eval", "compile", "breakpoint", "exit", "quit", "help", "input")


def encode(value):
    if isinstance(value, (set, frozenset)):
        return sorted(value)
    raise TypeError(f"result of type {type(value).__name__} is not JSON serializable")


def main():
    mode, path, entry = sys.argv[1], sys.argv[2], sys.argv[3]
    with open(path, encoding="utf-8") as handle:
        source = handle.read()
    try:
        code = compile(source, "solution.py", "exec")
    except (SyntaxError, ValueError) as exc:
        sys.stderr.write("".join(traceback.format_exception_only(type(exc), exc)))
        sys.exit(SYNTAX_EXIT)
    if mode == "check":
        return

    payload = sys.stdin.read() if mode == "args" else None
    namespace = {"__name__": "__main__" if mode == "stdin" else "solution", "__builtins__": builtins}
    real_import = builtins.__import__
    execute = exec

    def guarded_import(name, globals=None, locals=None, fromlist=(), level=0):
        if globals is namespace and (level != 0 or name.partition(".")[0] not in ALLOWED):
            raise ImportError(f"import of {name!r} is not allowed")
        return real_import(name, globals, locals, fromlist, level)

    builtins.__import__ = guarded_import
    for name in BLOCKED:
        if mode == "stdin" and name == "input":
            continue
        if hasattr(builtins, name):
            delattr(builtins, name)

    if mode == "stdin":
        execute(code, namespace)
        return

    args = json.loads(payload)
    real_stdout = sys.stdout
    sys.stdout = sys.stderr
    execute(code, namespace)
    function = namespace.get(entry)
    if not callable(function):
        raise NameError(f"entry point {entry!r} is not defined")
    result = function(*args)
    real_stdout.write(json.dumps(result, default=encode, separators=(",", ":")) + "\n")
    real_stdout.flush()


try:
    main()
except SystemExit:
    raise
except MemoryError:
    traceback.print_exc()
    sys.exit(MEMORY_EXIT)
except BaseException:
    traceback.print_exc()
    sys.exit(EXCEPTION_EXIT)
"#;

#[derive(Debug)]
pub struct PythonExecutor {
    sandbox: Arc<dyn Sandbox>,
    interpreter: PathBuf,
    extra_args: Vec<String>,
    check_limits: ResourceProfile,
}

impl PythonExecutor {
    pub fn new(sandbox: Arc<dyn Sandbox>, config: &LanguageConfig, check_limits: ResourceProfile) -> Self {
        Self {
            sandbox,
            interpreter: config
                .program
                .clone()
                .unwrap_or_else(|| PathBuf::from("python3")),
            extra_args: config.extra_args.clone(),
            check_limits,
        }
    }

    fn command(&self, cwd: &Path, harness: &Path, mode: &str, source: &Path, entry_point: &str) -> SandboxCommand {
        SandboxCommand::new(&self.interpreter, cwd)
            .args(["-I", "-B"])
            .args(self.extra_args.iter().cloned())
            .arg(harness.to_string_lossy())
            .arg(mode)
            .arg(source.to_string_lossy())
            .arg(entry_point)
            .readable(harness.parent().unwrap_or(cwd))
            .with_address_space_limit(true)
    }
}

#[async_trait::async_trait]
impl LanguageExecutor for PythonExecutor {
    fn language(&self) -> Language {
        Language::Python
    }

    fn supports(&self, _mode: InputMode) -> bool {
        true
    }

    #[tracing::instrument(skip(self, source))]
    async fn prepare(
        &self,
        workspace: &Path,
        source: &str,
        entry_point: &str,
        mode: InputMode,
    ) -> Result<Artifact, PrepareError> {
        let source_path = workspace.join(SOURCE_FILE);
        let harness_path = workspace.join(HARNESS_FILE);
        fs::write(&source_path, source).await?;
        fs::write(&harness_path, HARNESS).await?;

        let command = self.command(workspace, &harness_path, "check", &source_path, entry_point);
        let outcome = self.sandbox.execute(&command, "", &self.check_limits).await?;
        preparation_result(outcome, Some(HARNESS_SYNTAX_EXIT))?;

        Ok(Artifact {
            id: Uuid::new_v4(),
            language: Language::Python,
            mode,
            kind: ArtifactKind::Script,
            path: source_path,
            harness: Some(harness_path),
            entry_point: entry_point.to_string(),
        })
    }

    async fn run(
        &self,
        artifact: &Artifact,
        cwd: &Path,
        stdin: &str,
        limits: &ResourceProfile,
        ledger: Option<MemoryLedger>,
    ) -> Result<ExecutionOutcome, SandboxError> {
        let harness = artifact
            .harness
            .as_deref()
            .ok_or(SandboxError::EmptyCommand)?;
        let command = self
            .command(cwd, harness, artifact.mode.as_str(), &artifact.path, &artifact.entry_point)
            .with_memory_ledger(ledger);
        self.sandbox.execute(&command, stdin, limits).await
    }

    fn classify_exit(&self, _artifact: &Artifact, outcome: &ExecutionOutcome) -> ProgramExit {
        exit_class(outcome, true, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        constants::HARNESS_MEMORY_EXIT,
        core::{domain::CompilationLimitType, traits::sandbox::MockSandbox},
        native::workspace::Workspace,
    };

    fn executor(sandbox: MockSandbox) -> PythonExecutor {
        PythonExecutor::new(Arc::new(sandbox), &LanguageConfig::default(), ResourceProfile::default())
    }

    async fn workspace() -> Workspace {
        Workspace::create(&std::env::temp_dir().join("codejudge_python_tests"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_prepare_writes_files_and_checks_syntax() {
        let mut sandbox = MockSandbox::new();
        sandbox
            .expect_execute()
            .withf(|command, stdin, _| {
                command.program == Path::new("python3")
                    && command.args[..2] == ["-I", "-B"]
                    && command.args[3] == "check"
                    && command.address_space_limit
                    && stdin.is_empty()
            })
            .times(1)
            .returning(|_, _, _| {
                Ok(ExecutionOutcome {
                    exit_code: Some(0),
                    ..Default::default()
                })
            });

        let workspace = workspace().await;
        let artifact = executor(sandbox)
            .prepare(workspace.path(), "def solution():\n    return 1\n", "solution", InputMode::Args)
            .await
            .unwrap();

        assert_eq!(artifact.kind, ArtifactKind::Script);
        assert_eq!(artifact.mode, InputMode::Args);
        assert!(artifact.path.exists());
        assert!(artifact.harness.as_ref().unwrap().exists());
    }

    #[tokio::test]
    async fn test_prepare_reports_syntax_error() {
        let mut sandbox = MockSandbox::new();
        sandbox.expect_execute().returning(|_, _, _| {
            Ok(ExecutionOutcome {
                exit_code: Some(HARNESS_SYNTAX_EXIT),
                stderr: "  File \"solution.py\", line 1\n    def f(\n         ^\nSyntaxError: '(' was never closed\n".to_string(),
                ..Default::default()
            })
        });

        let workspace = workspace().await;
        let result = executor(sandbox)
            .prepare(workspace.path(), "def f(\n", "solution", InputMode::Args)
            .await;

        assert!(matches!(
            result,
            Err(PrepareError::CompilationFailed { diagnostics }) if diagnostics.contains("SyntaxError")
        ));
    }

    #[tokio::test]
    async fn test_prepare_check_timeout() {
        let mut sandbox = MockSandbox::new();
        sandbox.expect_execute().returning(|_, _, _| {
            Ok(ExecutionOutcome {
                timed_out: true,
                ..Default::default()
            })
        });

        let workspace = workspace().await;
        let result = executor(sandbox)
            .prepare(workspace.path(), "x = 1\n", "solution", InputMode::Stdin)
            .await;

        assert!(matches!(
            result,
            Err(PrepareError::CompilationLimitsExceeded(CompilationLimitType::Time))
        ));
    }

    #[tokio::test]
    async fn test_run_passes_mode_and_ledger() {
        let mut sandbox = MockSandbox::new();
        sandbox
            .expect_execute()
            .withf(|command, stdin, limits| {
                command.args[3] == "args"
                    && command.args[5] == "two_sum"
                    && command.memory_ledger.is_some()
                    && command.cwd == Path::new("/tmp/run_0")
                    && command.readable == [PathBuf::from("/tmp")]
                    && stdin == "[1,2]"
                    && limits.wall_timeout_ms == 1234
            })
            .returning(|_, _, _| {
                Ok(ExecutionOutcome {
                    stdout: "3\n".to_string(),
                    exit_code: Some(0),
                    ..Default::default()
                })
            });

        let artifact = Artifact {
            id: Uuid::new_v4(),
            language: Language::Python,
            mode: InputMode::Args,
            kind: ArtifactKind::Script,
            path: PathBuf::from("/tmp/solution.py"),
            harness: Some(PathBuf::from("/tmp/harness.py")),
            entry_point: "two_sum".to_string(),
        };
        let limits = ResourceProfile {
            wall_timeout_ms: 1234,
            ..ResourceProfile::default()
        };
        let outcome = executor(sandbox)
            .run(&artifact, Path::new("/tmp/run_0"), "[1,2]", &limits, Some(MemoryLedger::new(10)))
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "3\n");
    }

    #[test]
    fn test_harness_reserves_exit_statuses() {
        assert!(HARNESS.contains(&format!("SYNTAX_EXIT = {HARNESS_SYNTAX_EXIT}\n")));
        assert!(HARNESS.contains(&format!("MEMORY_EXIT = {HARNESS_MEMORY_EXIT}\n")));
    }

    #[test]
    fn test_classify_exit_uses_status_not_stderr() {
        let executor = executor(MockSandbox::new());
        let artifact = Artifact {
            id: Uuid::new_v4(),
            language: Language::Python,
            mode: InputMode::Stdin,
            kind: ArtifactKind::Script,
            path: PathBuf::from("/tmp/solution.py"),
            harness: Some(PathBuf::from("/tmp/harness.py")),
            entry_point: "solution".to_string(),
        };

        let passing = ExecutionOutcome {
            stdout: "42\n".to_string(),
            stderr: "Traceback (most recent call last):\n  debug dump\nMemoryError\n".to_string(),
            exit_code: Some(0),
            ..Default::default()
        };
        assert_eq!(executor.classify_exit(&artifact, &passing), ProgramExit::Clean);

        let raised = ExecutionOutcome {
            stderr: "Traceback (most recent call last):\nZeroDivisionError: division by zero\n".to_string(),
            exit_code: Some(1),
            ..Default::default()
        };
        assert_eq!(executor.classify_exit(&artifact, &raised), ProgramExit::Exception);

        let exhausted = ExecutionOutcome {
            exit_code: Some(HARNESS_MEMORY_EXIT),
            ..Default::default()
        };
        assert_eq!(executor.classify_exit(&artifact, &exhausted), ProgramExit::OutOfMemory);
    }
}

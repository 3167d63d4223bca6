//! Language executors and the table they are registered in.

use std::collections::HashMap;
use std::sync::Arc;

use crate::{
    config::EngineConfig,
    constants::HARNESS_MEMORY_EXIT,
    core::{
        domain::{CompilationLimitType, ExecutionOutcome, Language, LimitKind},
        errors::PrepareError,
        traits::{
            executor::{LanguageExecutor, ProgramExit},
            sandbox::Sandbox,
        },
    },
};

pub mod gcc;
pub mod javascript;
pub mod python;

pub use gcc::GccExecutor;
pub use javascript::NodeExecutor;
pub use python::PythonExecutor;

/// Maps a language tag to its executor. Adding a language means
/// implementing [`LanguageExecutor`] and registering it here.
#[derive(Clone, Debug, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<Language, Arc<dyn LanguageExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `executor` under its own language, returning the one it replaced.
    pub fn register(&mut self, executor: Arc<dyn LanguageExecutor>) -> Option<Arc<dyn LanguageExecutor>> {
        self.executors.insert(executor.language(), executor)
    }

    pub fn get(&self, language: Language) -> Option<Arc<dyn LanguageExecutor>> {
        self.executors.get(&language).cloned()
    }

    pub fn languages(&self) -> Vec<Language> {
        let mut languages: Vec<Language> = self.executors.keys().copied().collect();
        languages.sort();
        languages
    }

    /// Registers every language enabled in `config`.
    pub fn from_config(config: &EngineConfig, sandbox: Arc<dyn Sandbox>) -> Self {
        let mut registry = Self::new();
        for language in Language::ALL {
            let language_config = config.languages.get(language);
            if !language_config.enabled {
                tracing::info!(%language, "Language disabled by configuration");
                continue;
            }
            let compile_limits = config.compile_limits(language);
            let executor: Arc<dyn LanguageExecutor> = match language {
                Language::Python => Arc::new(PythonExecutor::new(
                    sandbox.clone(),
                    language_config,
                    compile_limits,
                )),
                Language::JavaScript => Arc::new(NodeExecutor::new(
                    sandbox.clone(),
                    language_config,
                    compile_limits,
                )),
                Language::Cpp => Arc::new(GccExecutor::cpp(
                    sandbox.clone(),
                    language_config,
                    compile_limits,
                )),
                Language::C => Arc::new(GccExecutor::c(
                    sandbox.clone(),
                    language_config,
                    compile_limits,
                )),
            };
            registry.register(executor);
        }
        registry
    }
}

/// Maps the outcome of a compile or syntax-check run to a preparation
/// result. `rejection_exit` is the exit code that means "source rejected";
/// `None` treats any non-zero exit that way.
pub(crate) fn preparation_result(
    outcome: ExecutionOutcome,
    rejection_exit: Option<i32>,
) -> Result<(), PrepareError> {
    if outcome.timed_out || outcome.limit_exceeded == Some(LimitKind::Cpu) {
        return Err(PrepareError::CompilationLimitsExceeded(CompilationLimitType::Time));
    }
    if outcome.limit_exceeded == Some(LimitKind::Memory) {
        return Err(PrepareError::CompilationLimitsExceeded(CompilationLimitType::Ram));
    }
    match (outcome.exit_code, rejection_exit) {
        (Some(0), _) => Ok(()),
        (Some(code), Some(expected)) if code == expected => Err(PrepareError::CompilationFailed {
            diagnostics: outcome.stderr,
        }),
        (Some(_), None) => Err(PrepareError::CompilationFailed {
            diagnostics: outcome.stderr,
        }),
        _ => Err(PrepareError::Toolchain {
            exit_code: outcome.exit_code,
            signal: outcome.signal,
            stderr: outcome.stderr,
        }),
    }
}

/// Shared exit classification. `harnessed` means a generated harness owns
/// the exit status, so [`HARNESS_MEMORY_EXIT`] is its report. `fatal_oom`
/// is the runtime's own abort message, trusted only when a signal killed
/// the process.
pub(crate) fn exit_class(outcome: &ExecutionOutcome, harnessed: bool, fatal_oom: Option<&str>) -> ProgramExit {
    if outcome.exit_code == Some(0) && outcome.signal.is_none() {
        return ProgramExit::Clean;
    }
    if harnessed && outcome.exit_code == Some(HARNESS_MEMORY_EXIT) {
        return ProgramExit::OutOfMemory;
    }
    if outcome.signal.is_some() && fatal_oom.is_some_and(|marker| outcome.stderr.contains(marker)) {
        return ProgramExit::OutOfMemory;
    }
    ProgramExit::Exception
}

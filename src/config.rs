use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::{
    domain::{Language, ResourceOverride, ResourceProfile, ShortCircuit},
    errors::ConfigError,
    pipeline::verdict::TimeAggregation,
};
use crate::native::limits::{FilesystemIsolation, NetworkIsolation};

/// Process-wide engine configuration, loaded once at startup and read-only
/// afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Size of the execution slot pool shared by all submissions.
    pub max_concurrent_sandboxes: usize,
    pub admission_timeout_ms: u64,
    pub max_source_bytes: usize,
    pub scratch_root: PathBuf,
    pub default_limits: ResourceProfile,
    /// Upper bound applied after request overrides.
    pub limit_ceiling: ResourceProfile,
    pub default_compile_limits: ResourceProfile,
    pub short_circuit: ShortCircuit,
    /// Tests of one submission run at once; the submission holds this many slots.
    pub parallel_tests: usize,
    pub time_aggregation: TimeAggregation,
    pub expose_compiler_diagnostics: bool,
    pub max_diagnostics_bytes: usize,
    pub sandbox: SandboxConfig,
    pub languages: LanguagesConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sandboxes: 4,
            admission_timeout_ms: 2_000,
            max_source_bytes: 64 * 1024,
            scratch_root: std::env::temp_dir().join("codejudge"),
            default_limits: ResourceProfile::default(),
            limit_ceiling: ResourceProfile {
                wall_timeout_ms: 30_000,
                cpu_time_ms: 20_000,
                memory_limit_bytes: 1024 * 1024 * 1024,
                max_output_bytes: 16 * 1024 * 1024,
            },
            default_compile_limits: ResourceProfile {
                wall_timeout_ms: 15_000,
                cpu_time_ms: 10_000,
                memory_limit_bytes: 768 * 1024 * 1024,
                max_output_bytes: 256 * 1024,
            },
            short_circuit: ShortCircuit::Never,
            parallel_tests: 1,
            time_aggregation: TimeAggregation::Max,
            expose_compiler_diagnostics: true,
            max_diagnostics_bytes: 2048,
            sandbox: SandboxConfig::default(),
            languages: LanguagesConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: EngineConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `path` when given, otherwise validated defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("max_concurrent_sandboxes", self.max_concurrent_sandboxes as u64),
            ("admission_timeout_ms", self.admission_timeout_ms),
            ("max_source_bytes", self.max_source_bytes as u64),
            ("parallel_tests", self.parallel_tests as u64),
            ("max_diagnostics_bytes", self.max_diagnostics_bytes as u64),
            ("sandbox.max_open_files", self.sandbox.max_open_files),
            ("sandbox.max_file_size_bytes", self.sandbox.max_file_size_bytes),
            ("sandbox.address_space_factor", self.sandbox.address_space_factor),
            ("sandbox.monitor_interval_ms", self.sandbox.monitor_interval_ms),
            ("sandbox.kill_grace_ms", self.sandbox.kill_grace_ms),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        if self.sandbox.max_processes == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.max_processes must be greater than zero".to_string(),
            ));
        }
        if self.parallel_tests > self.max_concurrent_sandboxes {
            return Err(ConfigError::Invalid(format!(
                "parallel_tests ({}) exceeds max_concurrent_sandboxes ({})",
                self.parallel_tests, self.max_concurrent_sandboxes
            )));
        }
        if self.sandbox.path_env.is_empty() {
            return Err(ConfigError::Invalid("sandbox.path_env is empty".to_string()));
        }
        if self.sandbox.filesystem == FilesystemIsolation::Jail {
            let jail_root = &self.sandbox.jail_root;
            if !jail_root.is_absolute() {
                return Err(ConfigError::Invalid("sandbox.jail_root must be absolute".to_string()));
            }
            if self.scratch_root.starts_with(jail_root) || jail_root.starts_with(&self.scratch_root) {
                return Err(ConfigError::Invalid(
                    "sandbox.jail_root and scratch_root must not contain each other".to_string(),
                ));
            }
            if let Some(path) = self.sandbox.system_paths.iter().find(|p| !p.is_absolute()) {
                return Err(ConfigError::Invalid(format!(
                    "sandbox.system_paths entry {} must be absolute",
                    path.display()
                )));
            }
        }

        let profiles = [
            ("default_limits", &self.default_limits),
            ("limit_ceiling", &self.limit_ceiling),
            ("default_compile_limits", &self.default_compile_limits),
        ];
        for (name, profile) in profiles {
            profile
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("{name}: {e}")))?;
        }
        for language in Language::ALL {
            let config = self.languages.get(language);
            for overrides in [&config.run_limits, &config.compile_limits] {
                overrides
                    .validate()
                    .map_err(|e| ConfigError::Invalid(format!("languages.{language}: {e}")))?;
            }
        }
        Ok(())
    }

    /// Defaults, then per-language overrides, then the request's own
    /// overrides, clamped to the ceiling.
    pub fn resolve_limits(&self, language: Language, request: &ResourceOverride) -> ResourceProfile {
        self.default_limits
            .apply(&self.languages.get(language).run_limits)
            .apply(request)
            .clamp_to(&self.limit_ceiling)
    }

    pub fn compile_limits(&self, language: Language) -> ResourceProfile {
        self.default_compile_limits
            .apply(&self.languages.get(language).compile_limits)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxConfig {
    pub network: NetworkIsolation,
    pub filesystem: FilesystemIsolation,
    /// Empty directory each jailed process mounts its private root on.
    pub jail_root: PathBuf,
    /// Host paths mirrored read-only into every jail; missing ones are skipped.
    pub system_paths: Vec<PathBuf>,
    /// RLIMIT_NPROC counts every process of the real uid, so only set this
    /// when the judge runs as a dedicated user.
    pub max_processes: Option<u64>,
    pub max_open_files: u64,
    pub max_file_size_bytes: u64,
    /// RLIMIT_AS is set to the memory limit times this factor.
    pub address_space_factor: u64,
    /// Command prefix for an external jail, e.g. `["bwrap", "--ro-bind", "/", "/", "--"]`.
    pub wrapper: Vec<String>,
    pub path_env: String,
    pub monitor_interval_ms: u64,
    pub kill_grace_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            network: NetworkIsolation::Required,
            filesystem: FilesystemIsolation::Jail,
            jail_root: std::env::temp_dir().join("codejudge-jail"),
            system_paths: [
                "/usr",
                "/bin",
                "/lib",
                "/lib32",
                "/lib64",
                "/libx32",
                "/etc/alternatives",
                "/etc/ld.so.cache",
            ]
            .into_iter()
            .map(PathBuf::from)
            .collect(),
            max_processes: None,
            max_open_files: 128,
            max_file_size_bytes: 16 * 1024 * 1024,
            address_space_factor: 4,
            wrapper: Vec::new(),
            path_env: "/usr/local/bin:/usr/bin:/bin".to_string(),
            monitor_interval_ms: 20,
            kill_grace_ms: 500,
        }
    }
}

impl SandboxConfig {
    /// Rlimits and monitoring without namespaces, for hosts that jail the
    /// judge through `wrapper` or not at all.
    pub fn unconfined() -> Self {
        Self {
            network: NetworkIsolation::Off,
            filesystem: FilesystemIsolation::Off,
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LanguagesConfig {
    pub python: LanguageConfig,
    pub javascript: LanguageConfig,
    pub cpp: LanguageConfig,
    pub c: LanguageConfig,
}

impl LanguagesConfig {
    pub fn get(&self, language: Language) -> &LanguageConfig {
        match language {
            Language::Python => &self.python,
            Language::JavaScript => &self.javascript,
            Language::Cpp => &self.cpp,
            Language::C => &self.c,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LanguageConfig {
    pub enabled: bool,
    /// Interpreter or compiler binary; the executor's default when absent.
    pub program: Option<PathBuf>,
    pub extra_args: Vec<String>,
    pub run_limits: ResourceOverride,
    pub compile_limits: ResourceOverride,
    pub deny_patterns: Vec<String>,
}

impl Default for LanguageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: None,
            extra_args: Vec::new(),
            run_limits: ResourceOverride::default(),
            compile_limits: ResourceOverride::default(),
            deny_patterns: Vec::new(),
        }
    }
}

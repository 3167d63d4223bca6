use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::constants::{
    DEFAULT_ENTRY_POINT, MSG_INTERNAL, MSG_MEMORY, MSG_RUNTIME, MSG_SECURITY, MSG_SYNTAX,
    MSG_TIMEOUT,
};
use crate::core::errors::RequestError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[serde(alias = "py")]
    Python,
    #[serde(alias = "js", alias = "node")]
    JavaScript,
    #[serde(alias = "c++")]
    Cpp,
    C,
}

impl Language {
    pub const ALL: [Language; 4] = [
        Language::Python,
        Language::JavaScript,
        Language::Cpp,
        Language::C,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Cpp => "cpp",
            Language::C => "c",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a test case's input reaches the submitted program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    /// The harness decodes a JSON argument list and calls the entry point.
    Args,
    /// The program's own main reads raw stdin.
    Stdin,
}

impl InputMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputMode::Args => "args",
            InputMode::Stdin => "stdin",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestInput {
    Args(Vec<Value>),
    Stdin(String),
}

impl TestInput {
    pub fn mode(&self) -> InputMode {
        match self {
            TestInput::Args(_) => InputMode::Args,
            TestInput::Stdin(_) => InputMode::Stdin,
        }
    }

    /// Bytes fed to the sandboxed process on stdin.
    pub fn to_stdin(&self) -> String {
        match self {
            TestInput::Args(args) => Value::Array(args.clone()).to_string(),
            TestInput::Stdin(text) => text.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedOutput {
    Value(Value),
    Text(String),
}

impl ExpectedOutput {
    pub fn mode(&self) -> InputMode {
        match self {
            ExpectedOutput::Value(_) => InputMode::Args,
            ExpectedOutput::Text(_) => InputMode::Stdin,
        }
    }

    pub fn render(&self) -> String {
        match self {
            ExpectedOutput::Value(value) => value.to_string(),
            ExpectedOutput::Text(text) => text.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Hidden,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(from = "TestCasePayload")]
pub struct TestCase {
    pub input: TestInput,
    pub expected_output: ExpectedOutput,
    pub visibility: Visibility,
}

impl TestCase {
    pub fn public(input: TestInput, expected_output: ExpectedOutput) -> Self {
        Self {
            input,
            expected_output,
            visibility: Visibility::Public,
        }
    }

    pub fn hidden(input: TestInput, expected_output: ExpectedOutput) -> Self {
        Self {
            input,
            expected_output,
            visibility: Visibility::Hidden,
        }
    }

    pub fn is_hidden(&self) -> bool {
        self.visibility == Visibility::Hidden
    }
}

/// Wire shape of a test case: `{input, expected_output, hidden}`.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TestCasePayload {
    input: TestInput,
    expected_output: ExpectedOutput,
    #[serde(default)]
    hidden: bool,
}

impl From<TestCasePayload> for TestCase {
    fn from(payload: TestCasePayload) -> Self {
        Self {
            input: payload.input,
            expected_output: payload.expected_output,
            visibility: if payload.hidden {
                Visibility::Hidden
            } else {
                Visibility::Public
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceProfile {
    pub wall_timeout_ms: u64,
    pub cpu_time_ms: u64,
    pub memory_limit_bytes: u64,
    pub max_output_bytes: u64,
}

impl ResourceProfile {
    pub fn validate(&self) -> Result<(), RequestError> {
        for (name, value) in self.fields() {
            if value == 0 {
                return Err(RequestError::ZeroLimit(name));
            }
        }
        Ok(())
    }

    /// Layers the fields present in `overrides` over this profile.
    pub fn apply(&self, overrides: &ResourceOverride) -> Self {
        Self {
            wall_timeout_ms: overrides.wall_timeout_ms.unwrap_or(self.wall_timeout_ms),
            cpu_time_ms: overrides.cpu_time_ms.unwrap_or(self.cpu_time_ms),
            memory_limit_bytes: overrides
                .memory_limit_bytes
                .unwrap_or(self.memory_limit_bytes),
            max_output_bytes: overrides.max_output_bytes.unwrap_or(self.max_output_bytes),
        }
    }

    pub fn clamp_to(&self, ceiling: &ResourceProfile) -> Self {
        Self {
            wall_timeout_ms: self.wall_timeout_ms.min(ceiling.wall_timeout_ms),
            cpu_time_ms: self.cpu_time_ms.min(ceiling.cpu_time_ms),
            memory_limit_bytes: self.memory_limit_bytes.min(ceiling.memory_limit_bytes),
            max_output_bytes: self.max_output_bytes.min(ceiling.max_output_bytes),
        }
    }

    fn fields(&self) -> [(&'static str, u64); 4] {
        [
            ("wall_timeout_ms", self.wall_timeout_ms),
            ("cpu_time_ms", self.cpu_time_ms),
            ("memory_limit_bytes", self.memory_limit_bytes),
            ("max_output_bytes", self.max_output_bytes),
        ]
    }
}

impl Default for ResourceProfile {
    fn default() -> Self {
        Self {
            wall_timeout_ms: 5_000,
            cpu_time_ms: 4_000,
            memory_limit_bytes: 256 * 1024 * 1024,
            max_output_bytes: 1024 * 1024,
        }
    }
}

/// Partial profile; absent fields inherit from the layer below.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResourceOverride {
    pub wall_timeout_ms: Option<u64>,
    pub cpu_time_ms: Option<u64>,
    pub memory_limit_bytes: Option<u64>,
    pub max_output_bytes: Option<u64>,
}

impl ResourceOverride {
    pub fn validate(&self) -> Result<(), RequestError> {
        let fields = [
            ("wall_timeout_ms", self.wall_timeout_ms),
            ("cpu_time_ms", self.cpu_time_ms),
            ("memory_limit_bytes", self.memory_limit_bytes),
            ("max_output_bytes", self.max_output_bytes),
        ];
        match fields.into_iter().find(|(_, value)| *value == Some(0)) {
            Some((name, _)) => Err(RequestError::ZeroLimit(name)),
            None => Ok(()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FloatTolerance {
    #[serde(default)]
    pub absolute: f64,
    #[serde(default)]
    pub relative: f64,
}

impl FloatTolerance {
    pub fn accepts(&self, expected: f64, actual: f64) -> bool {
        if !expected.is_finite() || !actual.is_finite() {
            return expected == actual;
        }
        let diff = (expected - actual).abs();
        diff <= self.absolute || diff <= self.relative * expected.abs().max(actual.abs())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhitespaceMode {
    Exact,
    /// Ignore trailing whitespace on each line and trailing blank lines.
    #[default]
    Trailing,
    /// Compare whitespace-separated tokens.
    Tokens,
}

/// Problem-declared comparison semantics. There is no global epsilon: a
/// problem without `float_tolerance` compares numbers exactly.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ComparePolicy {
    pub float_tolerance: Option<FloatTolerance>,
    pub order_sensitive: bool,
    pub whitespace: WhitespaceMode,
}

impl Default for ComparePolicy {
    fn default() -> Self {
        Self {
            float_tolerance: None,
            order_sensitive: true,
            whitespace: WhitespaceMode::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShortCircuit {
    #[default]
    Never,
    OnError,
    OnFailure,
}

/// One judging request. Fields are private so every instance has passed
/// validation; it is never mutated after construction.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(try_from = "SubmissionPayload")]
pub struct SubmissionRequest {
    language: Language,
    source_code: String,
    entry_point: String,
    test_cases: Vec<TestCase>,
    limits: ResourceOverride,
    compare: ComparePolicy,
    short_circuit: Option<ShortCircuit>,
}

impl SubmissionRequest {
    pub fn new(
        language: Language,
        source_code: impl Into<String>,
        test_cases: Vec<TestCase>,
    ) -> Result<Self, RequestError> {
        let Some(first) = test_cases.first() else {
            return Err(RequestError::NoTestCases);
        };
        let mode = first.input.mode();
        for (index, test) in test_cases.iter().enumerate() {
            let found = test.input.mode();
            if found != mode {
                return Err(RequestError::MixedInputModes {
                    index,
                    expected: mode,
                    found,
                });
            }
            if test.expected_output.mode() != mode {
                return Err(RequestError::ExpectedShapeMismatch { index, mode });
            }
        }

        Ok(Self {
            language,
            source_code: source_code.into(),
            entry_point: DEFAULT_ENTRY_POINT.to_string(),
            test_cases,
            limits: ResourceOverride::default(),
            compare: ComparePolicy::default(),
            short_circuit: None,
        })
    }

    pub fn with_entry_point(self, entry_point: impl Into<String>) -> Result<Self, RequestError> {
        let entry_point = entry_point.into();
        if !is_identifier(&entry_point) {
            return Err(RequestError::InvalidEntryPoint(entry_point));
        }
        Ok(Self {
            entry_point,
            ..self
        })
    }

    pub fn with_limits(self, limits: ResourceOverride) -> Result<Self, RequestError> {
        limits.validate()?;
        Ok(Self { limits, ..self })
    }

    pub fn with_compare(self, compare: ComparePolicy) -> Self {
        Self { compare, ..self }
    }

    pub fn with_short_circuit(self, short_circuit: ShortCircuit) -> Self {
        Self {
            short_circuit: Some(short_circuit),
            ..self
        }
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn source_code(&self) -> &str {
        &self.source_code
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn test_cases(&self) -> &[TestCase] {
        &self.test_cases
    }

    pub fn limits(&self) -> &ResourceOverride {
        &self.limits
    }

    pub fn compare(&self) -> &ComparePolicy {
        &self.compare
    }

    pub fn short_circuit(&self) -> Option<ShortCircuit> {
        self.short_circuit
    }

    pub fn input_mode(&self) -> InputMode {
        // Construction guarantees at least one test and a single mode.
        self.test_cases
            .first()
            .map(|test| test.input.mode())
            .unwrap_or(InputMode::Stdin)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 64 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SubmissionPayload {
    language: Language,
    source_code: String,
    #[serde(default)]
    entry_point: Option<String>,
    #[serde(alias = "tests")]
    test_cases: Vec<TestCase>,
    #[serde(default)]
    limits: Option<ResourceOverride>,
    #[serde(default)]
    compare: Option<ComparePolicy>,
    #[serde(default)]
    short_circuit: Option<ShortCircuit>,
}

impl TryFrom<SubmissionPayload> for SubmissionRequest {
    type Error = RequestError;

    fn try_from(payload: SubmissionPayload) -> Result<Self, Self::Error> {
        let mut request =
            SubmissionRequest::new(payload.language, payload.source_code, payload.test_cases)?;
        if let Some(entry_point) = payload.entry_point {
            request = request.with_entry_point(entry_point)?;
        }
        if let Some(limits) = payload.limits {
            request = request.with_limits(limits)?;
        }
        if let Some(compare) = payload.compare {
            request = request.with_compare(compare);
        }
        if let Some(short_circuit) = payload.short_circuit {
            request = request.with_short_circuit(short_circuit);
        }
        Ok(request)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// Source interpreted through a harness script.
    Script,
    Executable,
}

/// Output of `prepare`, consumed by every `run` of the same submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Artifact {
    pub id: Uuid,
    pub language: Language,
    pub mode: InputMode,
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub harness: Option<PathBuf>,
    pub entry_point: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitKind {
    Cpu,
    Memory,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompilationLimitType {
    Ram,
    Time,
}

/// Raw result of one sandboxed execution.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub wall_time_ms: u64,
    pub cpu_time_ms: u64,
    pub memory_used_bytes: u64,
    pub timed_out: bool,
    pub truncated_output: bool,
    pub limit_exceeded: Option<LimitKind>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JudgeResult {
    Pass,
    Fail,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorKind {
    Syntax,
    Runtime,
    Timeout,
    Memory,
    Security,
    Internal,
}

impl ErrorKind {
    pub fn message(&self) -> &'static str {
        match self {
            ErrorKind::Syntax => MSG_SYNTAX,
            ErrorKind::Runtime => MSG_RUNTIME,
            ErrorKind::Timeout => MSG_TIMEOUT,
            ErrorKind::Memory => MSG_MEMORY,
            ErrorKind::Security => MSG_SECURITY,
            ErrorKind::Internal => MSG_INTERNAL,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Syntax => "SYNTAX",
            ErrorKind::Runtime => "RUNTIME",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Memory => "MEMORY",
            ErrorKind::Security => "SECURITY",
            ErrorKind::Internal => "INTERNAL",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
    Errored,
    Skipped,
}

/// Per-test detail, only ever attached to public tests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestDetail {
    pub status: TestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    pub index: usize,
    pub passed: bool,
    #[serde(rename = "detail", skip_serializing_if = "Option::is_none")]
    pub visible_detail: Option<TestDetail>,
}

/// Final, immutable outcome of one judging call. Only [`JudgeVerdict::new`]
/// builds one, so it serializes but never deserializes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct JudgeVerdict {
    result: JudgeResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<ErrorKind>,
    message: String,
    #[serde(rename = "tests")]
    per_test_results: Vec<TestReport>,
    passed_count: usize,
    total_count: usize,
    execution_time_ms: u64,
    memory_used_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    diagnostics: Option<String>,
}

impl JudgeVerdict {
    pub(crate) fn new(
        result: JudgeResult,
        error_kind: Option<ErrorKind>,
        message: &str,
        per_test_results: Vec<TestReport>,
        execution_time_ms: u64,
        memory_used_bytes: u64,
        diagnostics: Option<String>,
    ) -> Self {
        let passed_count = per_test_results.iter().filter(|r| r.passed).count();
        let total_count = per_test_results.len();
        Self {
            result,
            error_kind: if result == JudgeResult::Error {
                error_kind
            } else {
                None
            },
            message: message.to_string(),
            per_test_results,
            passed_count,
            total_count,
            execution_time_ms,
            memory_used_bytes,
            diagnostics,
        }
    }

    pub fn result(&self) -> JudgeResult {
        self.result
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error_kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn per_test_results(&self) -> &[TestReport] {
        &self.per_test_results
    }

    pub fn passed_count(&self) -> usize {
        self.passed_count
    }

    pub fn total_count(&self) -> usize {
        self.total_count
    }

    pub fn execution_time_ms(&self) -> u64 {
        self.execution_time_ms
    }

    pub fn memory_used_bytes(&self) -> u64 {
        self.memory_used_bytes
    }

    pub fn diagnostics(&self) -> Option<&str> {
        self.diagnostics.as_deref()
    }
}

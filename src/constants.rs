pub const MSG_PASS: &str = "All test cases passed";
pub const MSG_FAIL: &str = "Solution failed one or more test cases";
pub const MSG_SYNTAX: &str = "Compilation failed";
pub const MSG_RUNTIME: &str = "Runtime error during execution";
pub const MSG_TIMEOUT: &str = "Time limit exceeded";
pub const MSG_MEMORY: &str = "Memory limit exceeded";
pub const MSG_SECURITY: &str = "Submission rejected by security policy";
pub const MSG_INTERNAL: &str = "Internal judge error, please try again";
pub const MSG_BUSY: &str = "Judge busy, please try again";

/// Entry point the harness calls when a request does not name one.
pub const DEFAULT_ENTRY_POINT: &str = "solution";

/// Tracing target for operator-only audit records.
pub const AUDIT_TARGET: &str = "codejudge::audit";

pub const WORKSPACE_PREFIX: &str = "judge_";
pub const RUN_DIR_PREFIX: &str = "run_";

/// Longest excerpt of expected/actual output shown for a failed public test.
pub const DETAIL_EXCERPT_CHARS: usize = 256;

/// Harness exit status for source that does not compile.
pub const HARNESS_SYNTAX_EXIT: i32 = 3;
/// Harness exit status for an allocation failure the program did not survive.
pub const HARNESS_MEMORY_EXIT: i32 = 4;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::{
    domain::{ExecutionOutcome, ResourceProfile},
    errors::SandboxError,
};

/// One process invocation inside the sandbox.
#[derive(Clone, Debug, Default)]
pub struct SandboxCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    /// Host paths the process may read besides the system directories.
    /// `cwd` is always visible and is the only writable place.
    pub readable: Vec<PathBuf>,
    /// Apply an address-space rlimit as a backstop to RSS monitoring.
    /// Off for runtimes that reserve large virtual ranges up front.
    pub address_space_limit: bool,
    pub memory_ledger: Option<MemoryLedger>,
}

impl SandboxCommand {
    pub fn new(program: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            cwd: cwd.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn readable(mut self, path: impl Into<PathBuf>) -> Self {
        self.readable.push(path.into());
        self
    }

    pub fn with_address_space_limit(mut self, enabled: bool) -> Self {
        self.address_space_limit = enabled;
        self
    }

    pub fn with_memory_ledger(mut self, ledger: Option<MemoryLedger>) -> Self {
        self.memory_ledger = ledger;
        self
    }
}

/// Resident memory shared by all concurrently live sandboxes of one
/// submission, checked against the submission's own ceiling.
#[derive(Clone, Debug)]
pub struct MemoryLedger {
    inner: Arc<LedgerInner>,
}

#[derive(Debug)]
struct LedgerInner {
    ceiling_bytes: u64,
    live_bytes: AtomicU64,
}

impl MemoryLedger {
    pub fn new(ceiling_bytes: u64) -> Self {
        Self {
            inner: Arc::new(LedgerInner {
                ceiling_bytes,
                live_bytes: AtomicU64::new(0),
            }),
        }
    }

    pub fn ceiling_bytes(&self) -> u64 {
        self.inner.ceiling_bytes
    }

    pub fn live_bytes(&self) -> u64 {
        self.inner.live_bytes.load(Ordering::SeqCst)
    }

    /// Replaces a sandbox's previous contribution with `current` and returns
    /// the submission-wide total after the update.
    pub fn update(&self, previous: u64, current: u64) -> u64 {
        let live = &self.inner.live_bytes;
        if current >= previous {
            let delta = current - previous;
            live.fetch_add(delta, Ordering::SeqCst) + delta
        } else {
            let delta = previous - current;
            live.fetch_sub(delta, Ordering::SeqCst) - delta
        }
    }

    pub fn exceeded_by(&self, total: u64) -> bool {
        total > self.inner.ceiling_bytes
    }
}

/// The authoritative enforcement point: every untrusted process runs
/// through `execute`, which always reaps what it spawned before returning.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait Sandbox: std::fmt::Debug + Send + Sync {
    async fn execute(
        &self,
        command: &SandboxCommand,
        stdin: &str,
        limits: &ResourceProfile,
    ) -> Result<ExecutionOutcome, SandboxError>;
}

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::core::{
    domain::{ExecutionOutcome, ResourceProfile},
    errors::SandboxError,
    traits::sandbox::{Sandbox, SandboxCommand},
};

/// Sandbox that never spawns anything: every call sleeps for `delay` and
/// returns the same outcome.
#[derive(Debug, Clone)]
pub struct SandboxStub {
    outcome: ExecutionOutcome,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl SandboxStub {
    pub fn new(outcome: ExecutionOutcome, delay: Duration) -> Self {
        Self {
            outcome,
            delay,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Clean exit printing `stdout`.
    pub fn printing(stdout: &str) -> Self {
        Self::new(
            ExecutionOutcome {
                stdout: stdout.to_string(),
                exit_code: Some(0),
                wall_time_ms: 5,
                memory_used_bytes: 4096,
                ..Default::default()
            },
            Duration::ZERO,
        )
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Sandbox for SandboxStub {
    #[tracing::instrument(skip(self, stdin))]
    async fn execute(
        &self,
        command: &SandboxCommand,
        stdin: &str,
        limits: &ResourceProfile,
    ) -> Result<ExecutionOutcome, SandboxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        tracing::debug!("Stub execution result: {:?}", self.outcome);

        Ok(self.outcome.clone())
    }
}

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Duration, Instant, MissedTickBehavior, timeout};

use crate::{
    config::SandboxConfig,
    core::{
        domain::{ExecutionOutcome, LimitKind, ResourceProfile},
        errors::SandboxError,
        traits::sandbox::{MemoryLedger, Sandbox, SandboxCommand},
    },
    native::{limits::ChildLimits, monitor},
};

/// Runs each command as the leader of a fresh process group with rlimits,
/// private user, mount and network namespaces, and a `/proc` monitor over
/// the group.
#[derive(Debug)]
pub struct ProcessSandbox {
    config: SandboxConfig,
    counters: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    spawned: AtomicU64,
    live: AtomicUsize,
}

impl ProcessSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Number of process groups ever spawned.
    pub fn spawned_total(&self) -> u64 {
        self.counters.spawned.load(Ordering::SeqCst)
    }

    /// Number of process groups not yet killed and reaped.
    pub fn live_processes(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    /// Runs a trivial command in `cwd` with the configured isolation.
    /// Fails when this host cannot provide it.
    pub async fn check_isolation(&self, cwd: &Path) -> Result<(), SandboxError> {
        let command = SandboxCommand::new("/bin/sh", cwd).args(["-c", "exit 0"]);
        let limits = ResourceProfile {
            wall_timeout_ms: 5_000,
            ..ResourceProfile::default()
        };
        let outcome = self.execute(&command, "", &limits).await?;
        if outcome.exit_code != Some(0) {
            return Err(SandboxError::Spawn(io::Error::other(format!(
                "isolation check exited with {:?} (signal {:?}): {}",
                outcome.exit_code,
                outcome.signal,
                outcome.stderr.trim()
            ))));
        }
        Ok(())
    }

    fn build(&self, command: &SandboxCommand, limits: &ResourceProfile) -> Result<Command, SandboxError> {
        if command.program.as_os_str().is_empty() {
            return Err(SandboxError::EmptyCommand);
        }

        let mut cmd = match self.config.wrapper.split_first() {
            Some((jail, jail_args)) => {
                let mut cmd = Command::new(jail);
                cmd.args(jail_args).arg(&command.program);
                cmd
            }
            None => Command::new(&command.program),
        };
        cmd.args(&command.args)
            .current_dir(&command.cwd)
            .env_clear()
            .env("PATH", &self.config.path_env)
            .env("HOME", &command.cwd)
            .env("TMPDIR", &command.cwd)
            .env("LANG", "C.UTF-8")
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let child_limits = ChildLimits::new(limits, &self.config, command).map_err(SandboxError::Spawn)?;
        unsafe {
            cmd.pre_exec(move || child_limits.apply());
        }
        Ok(cmd)
    }

    /// Waits for the leader to exit while sampling the group; kills the
    /// group on a limit breach. The leader is left unreaped.
    async fn supervise(
        &self,
        exited: &mut JoinHandle<io::Result<ExitUsage>>,
        pgid: i32,
        limits: &ResourceProfile,
        usage: &mut Usage,
    ) -> Result<ExitUsage, SandboxError> {
        let period = Duration::from_millis(self.config.monitor_interval_ms);
        // The first tick fires at once so short runs get a sample too.
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = &mut *exited => {
                    return joined(result);
                }
                _ = ticker.tick() => {
                    let sample = tokio::task::spawn_blocking(move || monitor::sample_group(pgid))
                        .await
                        .unwrap_or_default();
                    if let Some(kind) = usage.observe(sample, limits) {
                        tracing::debug!(?kind, rss = sample.rss_bytes, cpu_ms = sample.cpu_time_ms, "Limit exceeded, killing group");
                        usage.limit = Some(kind);
                        kill_group(pgid);
                        return joined((&mut *exited).await);
                    }
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Sandbox for ProcessSandbox {
    #[tracing::instrument(skip(self, command, stdin), fields(program = %command.program.display()))]
    async fn execute(
        &self,
        command: &SandboxCommand,
        stdin: &str,
        limits: &ResourceProfile,
    ) -> Result<ExecutionOutcome, SandboxError> {
        let mut cmd = self.build(command, limits)?;
        let start = Instant::now();
        let mut child = cmd.spawn().map_err(SandboxError::Spawn)?;
        let Some(pid) = child.id() else {
            return Err(SandboxError::Supervise(io::Error::other("child reaped before supervision")));
        };
        let mut guard = GroupGuard::new(pid as i32, self.counters.clone());

        let mut stdin_pipe = child.stdin.take().ok_or(SandboxError::MissingPipe("stdin"))?;
        let stdout_pipe = child.stdout.take().ok_or(SandboxError::MissingPipe("stdout"))?;
        let stderr_pipe = child.stderr.take().ok_or(SandboxError::MissingPipe("stderr"))?;

        let input = stdin.as_bytes().to_vec();
        let writer = tokio::spawn(async move {
            // The program may exit without reading its input.
            if let Err(e) = stdin_pipe.write_all(&input).await {
                if e.kind() != io::ErrorKind::BrokenPipe {
                    tracing::debug!("Failed to write stdin: {}", e);
                }
            }
        });
        let cap = limits.max_output_bytes as usize;
        let stdout_reader = tokio::spawn(read_capped(stdout_pipe, cap));
        let stderr_reader = tokio::spawn(read_capped(stderr_pipe, cap));

        let mut usage = Usage::new(command.memory_ledger.clone());
        let mut exited = tokio::task::spawn_blocking(move || wait_exited(pid as i32));
        let wall = Duration::from_millis(limits.wall_timeout_ms);
        let supervised = timeout(wall, self.supervise(&mut exited, guard.pgid, limits, &mut usage)).await;

        let grace = Duration::from_millis(self.config.kill_grace_ms);
        let (exit_usage, timed_out) = match supervised {
            Ok(exit_usage) => (Some(exit_usage?), false),
            Err(_) => {
                kill_group(guard.pgid);
                let exit_usage = timeout(grace, &mut exited).await.ok().and_then(|r| joined(r).ok());
                (exit_usage, true)
            }
        };
        let wall_time_ms = start.elapsed().as_millis() as u64;

        let mut status: Option<ExitStatus> = None;
        if let Some(exit_usage) = exit_usage {
            // Descendants may outlive the leader and hold the pipes open. The
            // unreaped leader keeps the group id from being reused.
            kill_group(guard.pgid);
            status = Some(child.wait().await.map_err(SandboxError::Supervise)?);
            guard.mark_reaped();
            usage.absorb(exit_usage);
        }
        writer.abort();
        let (stdout, stdout_truncated) = collect(stdout_reader, grace).await;
        let (stderr, stderr_truncated) = collect(stderr_reader, grace).await;
        drop(guard);

        let exit_code = status.and_then(|s| s.code());
        let signal = status.and_then(|s| s.signal());
        let mut limit_exceeded = usage.limit;
        if limit_exceeded.is_none() && signal == Some(libc::SIGXCPU) {
            limit_exceeded = Some(LimitKind::Cpu);
        }

        let outcome = ExecutionOutcome {
            stdout,
            stderr,
            exit_code,
            signal,
            wall_time_ms,
            cpu_time_ms: usage.cpu_time_ms,
            memory_used_bytes: usage.peak_rss_bytes,
            timed_out,
            truncated_output: stdout_truncated || stderr_truncated,
            limit_exceeded,
        };
        tracing::debug!(
            exit_code = ?outcome.exit_code,
            signal = ?outcome.signal,
            wall_ms = outcome.wall_time_ms,
            cpu_ms = outcome.cpu_time_ms,
            rss = outcome.memory_used_bytes,
            timed_out,
            limit = ?outcome.limit_exceeded,
            "Sandboxed process finished"
        );
        Ok(outcome)
    }
}

/// Kernel accounting for an exited leader and the children it reaped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct ExitUsage {
    cpu_time_ms: u64,
    max_rss_bytes: u64,
}

impl ExitUsage {
    fn from_rusage(rusage: &libc::rusage) -> Self {
        let millis = |tv: libc::timeval| tv.tv_sec as u64 * 1_000 + tv.tv_usec as u64 / 1_000;
        Self {
            cpu_time_ms: millis(rusage.ru_utime) + millis(rusage.ru_stime),
            max_rss_bytes: rusage.ru_maxrss as u64 * 1024,
        }
    }
}

/// Blocks until `pid` exits without reaping it, so the group can still be
/// signalled safely afterwards.
fn wait_exited(pid: i32) -> io::Result<ExitUsage> {
    loop {
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
        // The libc wrapper has no rusage argument.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_waitid,
                libc::P_PID as libc::c_int,
                pid,
                &mut info as *mut libc::siginfo_t,
                libc::WEXITED | libc::WNOWAIT,
                &mut rusage as *mut libc::rusage,
            )
        };
        if rc == 0 {
            return Ok(ExitUsage::from_rusage(&rusage));
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn joined(result: Result<io::Result<ExitUsage>, JoinError>) -> Result<ExitUsage, SandboxError> {
    match result {
        Ok(exit_usage) => exit_usage.map_err(SandboxError::Supervise),
        Err(e) => Err(SandboxError::Supervise(io::Error::other(e))),
    }
}

/// Peak usage seen by the monitor plus this sandbox's share of the
/// submission-wide memory ledger.
#[derive(Debug)]
struct Usage {
    peak_rss_bytes: u64,
    cpu_time_ms: u64,
    limit: Option<LimitKind>,
    ledger: Option<MemoryLedger>,
    posted_bytes: u64,
}

impl Usage {
    fn new(ledger: Option<MemoryLedger>) -> Self {
        Self {
            peak_rss_bytes: 0,
            cpu_time_ms: 0,
            limit: None,
            ledger,
            posted_bytes: 0,
        }
    }

    fn observe(&mut self, sample: monitor::GroupUsage, limits: &ResourceProfile) -> Option<LimitKind> {
        self.peak_rss_bytes = self.peak_rss_bytes.max(sample.rss_bytes);
        self.cpu_time_ms = self.cpu_time_ms.max(sample.cpu_time_ms);

        if let Some(ledger) = &self.ledger {
            let total = ledger.update(self.posted_bytes, sample.rss_bytes);
            self.posted_bytes = sample.rss_bytes;
            if ledger.exceeded_by(total) {
                return Some(LimitKind::Memory);
            }
        }
        if sample.rss_bytes > limits.memory_limit_bytes {
            return Some(LimitKind::Memory);
        }
        if sample.cpu_time_ms > limits.cpu_time_ms {
            return Some(LimitKind::Cpu);
        }
        None
    }

    /// Folds in the exit accounting. `ru_maxrss` also counts the pages the
    /// child inherited from the judge before exec, so it only stands in
    /// when the monitor never saw the process.
    fn absorb(&mut self, exit: ExitUsage) {
        self.cpu_time_ms = self.cpu_time_ms.max(exit.cpu_time_ms);
        if self.peak_rss_bytes == 0 {
            self.peak_rss_bytes = exit.max_rss_bytes;
        }
    }
}

impl Drop for Usage {
    fn drop(&mut self) {
        if let Some(ledger) = &self.ledger {
            ledger.update(self.posted_bytes, 0);
        }
    }
}

/// Kills the group unless its leader was reaped, and releases the live
/// slot however `execute` exits.
struct GroupGuard {
    pgid: i32,
    counters: Arc<Counters>,
    reaped: bool,
}

impl GroupGuard {
    fn new(pgid: i32, counters: Arc<Counters>) -> Self {
        counters.spawned.fetch_add(1, Ordering::SeqCst);
        counters.live.fetch_add(1, Ordering::SeqCst);
        Self {
            pgid,
            counters,
            reaped: false,
        }
    }

    /// After the leader is reaped its id may belong to someone else.
    fn mark_reaped(&mut self) {
        self.reaped = true;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if !self.reaped {
            kill_group(self.pgid);
        }
        self.counters.live.fetch_sub(1, Ordering::SeqCst);
    }
}

fn kill_group(pgid: i32) {
    if pgid <= 0 {
        return;
    }
    // ESRCH once the whole group is gone.
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

/// Reads everything, keeping at most `cap` bytes.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> std::io::Result<(Vec<u8>, bool)> {
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = cap.saturating_sub(kept.len());
        if n > room {
            truncated = true;
        }
        kept.extend_from_slice(&buf[..n.min(room)]);
    }
    Ok((kept, truncated))
}

async fn collect(
    mut reader: tokio::task::JoinHandle<std::io::Result<(Vec<u8>, bool)>>,
    grace: Duration,
) -> (String, bool) {
    match timeout(grace, &mut reader).await {
        Ok(Ok(Ok((bytes, truncated)))) => (String::from_utf8_lossy(&bytes).into_owned(), truncated),
        Ok(Ok(Err(e))) => {
            tracing::warn!("Failed to read sandbox output: {}", e);
            (String::new(), false)
        }
        Ok(Err(e)) => {
            tracing::warn!("Output reader task failed: {}", e);
            (String::new(), false)
        }
        Err(_) => {
            // Something outside the group still holds the pipe.
            reader.abort();
            tracing::warn!("Output pipe still open after group kill");
            (String::new(), true)
        }
    }
}

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

const SOURCE_FILE: &str = "solution.js";
const HARNESS_FILE: &str = "harness.js";
/// Floor for V8's old-space size so the runtime itself can start.
const MIN_HEAP_MIB: u64 = 16;
/// V8's own abort message when the heap limit is hit.
const FATAL_OOM: &str = "JavaScript heap out of memory";

/// Evaluates the submission in a fresh `vm` context with no `require` or
/// `process`. In `args` mode the console goes to stderr and the JSON
/// result is the only stdout line; in `stdin` mode the program gets
/// `input`, `readline()` and `print()` and its console writes to stdout.
/// Uncaught failures exit 4 for allocation failures and 1 otherwise.
const HARNESS: &str = r#""use strict";
const fs = require("fs");
const util = require("util");
const vm = require("vm");

const EXCEPTION_EXIT = 1;
const SYNTAX_EXIT = 3;
const MEMORY_EXIT = 4;

const [mode, path, entry] = process.argv.slice(2);

function report(err) {
  process.stderr.write(String((err && err.stack) || err) + "\n");
}

function fail(err) {
  report(err);
  const exhausted = err && err.name === "RangeError" && /allocation failed/i.test(String(err.message));
  process.exit(exhausted ? MEMORY_EXIT : EXCEPTION_EXIT);
}

process.on("uncaughtException", fail);
process.on("unhandledRejection", fail);

let script;
try {
  script = new vm.Script(fs.readFileSync(path, "utf8"), { filename: "solution.js" });
} catch (err) {
  report(err);
  process.exit(SYNTAX_EXIT);
}
if (mode === "check") {
  process.exit(0);
}

const render = (parts) => parts.map((p) => (typeof p === "string" ? p : util.inspect(p))).join(" ") + "\n";
const toStderr = (...parts) => process.stderr.write(render(parts));
const toStdout = (...parts) => process.stdout.write(render(parts));

if (mode === "stdin") {
  const input = fs.readFileSync(0, "utf8");
  const lines = input.split("\n").map((line) => line.replace(/\r$/, ""));
  if (input.endsWith("\n")) {
    lines.pop();
  }
  let next = 0;
  const context = vm.createContext({
    console: { log: toStdout, info: toStdout, debug: toStdout, warn: toStderr, error: toStderr },
    print: toStdout,
    readline: () => (next < lines.length ? lines[next++] : undefined),
    input,
  });
  try {
    script.runInContext(context);
  } catch (err) {
    fail(err);
  }
} else {
  const shim = { exports: {} };
  const context = vm.createContext({
    console: { log: toStderr, info: toStderr, warn: toStderr, error: toStderr, debug: toStderr },
    module: shim,
    exports: shim.exports,
  });

  (async () => {
    const args = JSON.parse(fs.readFileSync(0, "utf8"));
    script.runInContext(context);
    let fn = vm.runInContext(`typeof ${entry} === "function" ? ${entry} : undefined`, context);
    if (typeof fn !== "function" && shim.exports) {
      fn = typeof shim.exports === "function" ? shim.exports : shim.exports[entry];
    }
    if (typeof fn !== "function") {
      throw new ReferenceError(`entry point ${entry} is not defined`);
    }
    const result = await fn(...args);
    process.stdout.write(JSON.stringify(result === undefined ? null : result) + "\n");
  })().catch(fail);
}
"#;

#[derive(Debug)]
pub struct NodeExecutor {
    sandbox: Arc<dyn Sandbox>,
    runtime: PathBuf,
    extra_args: Vec<String>,
    check_limits: ResourceProfile,
}

impl NodeExecutor {
    pub fn new(sandbox: Arc<dyn Sandbox>, config: &LanguageConfig, check_limits: ResourceProfile) -> Self {
        Self {
            sandbox,
            runtime: config.program.clone().unwrap_or_else(|| PathBuf::from("node")),
            extra_args: config.extra_args.clone(),
            check_limits,
        }
    }

    fn command(
        &self,
        cwd: &Path,
        harness: &Path,
        mode: &str,
        source: &Path,
        entry_point: &str,
        limits: &ResourceProfile,
    ) -> SandboxCommand {
        let heap_mib = (limits.memory_limit_bytes / (1024 * 1024)).max(MIN_HEAP_MIB);
        // V8 reserves far more address space than it touches, so memory is
        // bounded by the heap flag and the RSS monitor instead of RLIMIT_AS.
        SandboxCommand::new(&self.runtime, cwd)
            .arg(format!("--max-old-space-size={heap_mib}"))
            .args(self.extra_args.iter().cloned())
            .arg(harness.to_string_lossy())
            .arg(mode)
            .arg(source.to_string_lossy())
            .arg(entry_point)
            .readable(harness.parent().unwrap_or(cwd))
            .with_address_space_limit(false)
    }
}

#[async_trait::async_trait]
impl LanguageExecutor for NodeExecutor {
    fn language(&self) -> Language {
        Language::JavaScript
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

        let command = self.command(
            workspace,
            &harness_path,
            "check",
            &source_path,
            entry_point,
            &self.check_limits,
        );
        let outcome = self.sandbox.execute(&command, "", &self.check_limits).await?;
        preparation_result(outcome, Some(HARNESS_SYNTAX_EXIT))?;

        Ok(Artifact {
            id: Uuid::new_v4(),
            language: Language::JavaScript,
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
            .command(
                cwd,
                harness,
                artifact.mode.as_str(),
                &artifact.path,
                &artifact.entry_point,
                limits,
            )
            .with_memory_ledger(ledger);
        self.sandbox.execute(&command, stdin, limits).await
    }

    fn classify_exit(&self, _artifact: &Artifact, outcome: &ExecutionOutcome) -> ProgramExit {
        exit_class(outcome, true, Some(FATAL_OOM))
    }
}

use std::io::Read;
use std::panic;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use codejudge::native::sandbox::ProcessSandbox;
use codejudge::{EngineConfig, JudgeEngine, SubmissionRequest};

/// Judges one submission request and prints the verdict as JSON.
#[derive(Debug, Parser)]
#[command(name = "codejudge", version)]
struct Args {
    /// JSON engine configuration; built-in defaults when absent.
    #[arg(long, env = "CODEJUDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Submission request JSON; read from stdin when absent.
    #[arg(long)]
    input: Option<PathBuf>,

    #[arg(long)]
    pretty: bool,

    /// Validate the configuration, list enabled languages and exit.
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    set_panic_hook();

    let args = Args::parse();
    let config = EngineConfig::load(args.config.as_deref())?;
    let sandbox = ProcessSandbox::new(config.sandbox.clone());
    let engine = JudgeEngine::from_config(config)?;

    if args.check_config {
        let languages: Vec<&str> = engine.languages().iter().map(|l| l.as_str()).collect();
        println!("configuration ok; languages: {}", languages.join(", "));
        let scratch_root = &engine.config().scratch_root;
        std::fs::create_dir_all(scratch_root)?;
        match sandbox.check_isolation(scratch_root).await {
            Ok(()) => println!("sandbox isolation ok"),
            Err(e) => {
                tracing::error!(error = %e, "Sandbox isolation unavailable; every run will be refused");
                return Err(e.into());
            }
        }
        return Ok(());
    }

    let raw = match &args.input {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            let mut raw = String::new();
            std::io::stdin().read_to_string(&mut raw)?;
            raw
        }
    };
    let request: SubmissionRequest = serde_json::from_str(&raw)?;
    tracing::info!(language = %request.language(), tests = request.test_cases().len(), "Judging request");

    let verdict = engine.judge(request).await;
    let output = if args.pretty {
        serde_json::to_string_pretty(&verdict)?
    } else {
        serde_json::to_string(&verdict)?
    };
    println!("{output}");

    Ok(())
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}

//! emk - hierarchical build system CLI

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use emk_core::{Engine, EngineConfig, ModuleRegistry, ScriptRegistry, default_config_dirs};

mod args;

use args::{BuildOptions, Style};

#[derive(Parser)]
#[command(name = "emk")]
#[command(version, about = "emk - a hierarchical, incremental, parallel build system")]
struct Cli {
    /// Targets to build, and key=value options (log, threads, style, trace,
    /// trace_unchanged, explicit_target, emk_dev). The target `clean`
    /// switches to cleaning mode.
    #[arg(trailing_var_arg = true)]
    words: Vec<String>,
}

/// Map the `log=` option onto a tracing filter (overridable via `RUST_LOG`).
fn env_filter(level: &str) -> EnvFilter {
    let directive = match level {
        "warning" => "warn",
        "critical" | "error" => "error",
        other => other,
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive))
}

fn init_logging(opts: &BuildOptions) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(&opts.log))
        .with_target(false)
        .with_ansi(opts.style == Style::Console)
        .init();
}

fn engine_config(opts: &BuildOptions) -> EngineConfig {
    EngineConfig {
        threads: opts.threads,
        cleaning: opts.cleaning,
        emk_dev: opts.emk_dev,
        explicit_targets: opts.explicit_targets.clone(),
        options: opts.options.clone(),
        trace: opts.trace.clone(),
        trace_unchanged: opts.trace_unchanged,
        config_dirs: default_config_dirs(),
    }
}

fn run(opts: &BuildOptions) -> Result<()> {
    let config = engine_config(opts);
    let engine = Engine::new(
        config,
        Arc::new(ScriptRegistry::default()),
        ModuleRegistry::default(),
    );

    // Signals interrupt the build: the executor stops handing out work,
    // waits for in-flight rules, and the run fails with exit code 1.
    let interrupt_handle = engine.clone();
    let mut signals =
        signal_hook::iterator::Signals::new([signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM])
            .context("install signal handler")?;
    std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            interrupt_handle.interrupt();
        }
    });

    let cwd: PathBuf = std::env::current_dir().context("determine working directory")?;
    engine.run(&cwd)?;
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let opts = args::parse_args(&cli.words);
    init_logging(&opts);

    match run(&opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<emk_core::BuildError>() {
                Some(build_err) => tracing::error!("Build error: {}", build_err.render()),
                None => tracing::error!("Build error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

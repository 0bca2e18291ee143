//! # pmr: store reordering checker
//!
//! Replays a persistent-memory operation log against a copy of the target
//! file, materializes every store ordering the chosen engine considers
//! possible at each crash point, and runs a consistency checker on each.
//!
//! ```text
//! pmr -l trace.log -t pool.img -c prog -p ./check-list -r partial -- --verbose
//! ```
//!
//! Exit status: 0 when every candidate passed, 1 when at least one did not,
//! 2 when the run could not be completed.

mod config;

use std::fs::File;
use std::future::Future;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pmr_core::{parse_trace, EngineKind, OperationRegistry, TraceError};
use pmr_io::{
    load_checker, open_sink, CheckerError, CheckerKind, CheckerSpec, ImageError, MemoryImage,
    OutputLevel, ReplayConfig, ReplayError, Replayer, RunReport, SinkKind,
};

use crate::config::{Config, ConfigError};

/// Persistent-memory store reordering checker.
#[derive(Parser, Debug)]
#[command(name = "pmr", version, about, long_about = None)]
struct Cli {
    /// Operation log to replay.
    #[arg(short = 'l', long)]
    logfile: PathBuf,

    /// File holding the persisted state the trace starts from.
    #[arg(short = 't', long)]
    target: PathBuf,

    /// Checker kind: prog or lib.
    #[arg(short = 'c', long)]
    checker: CheckerKind,

    /// Checker program or shared library.
    #[arg(short = 'p', long)]
    path: PathBuf,

    /// Entry point of a lib checker.
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// Reorder engine (no-reorder, full, partial, full-accumulative,
    /// partial-accumulative, reverse-accumulative).
    #[arg(short = 'r', long)]
    reorder_engine: Option<EngineKind>,

    /// Result sink: print, file or json.
    #[arg(long)]
    output_type: Option<SinkKind>,

    /// Destination of the file and json sinks.
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Lowest level written: debug, info, warning, error, critical.
    #[arg(short = 'e', long)]
    output_level: Option<OutputLevel>,

    /// TOML configuration file (default: ./pmr.toml if present).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Treat CPU caches as part of the persistence domain.
    #[arg(long)]
    eadr: bool,

    /// Candidates checked concurrently.
    #[arg(long)]
    jobs: Option<usize>,

    /// Per-candidate checker timeout.
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Keep the scratch image of every failing candidate.
    #[arg(long)]
    keep_failing_images: bool,

    /// Extra arguments for a prog checker, placed before the image path.
    #[arg(last = true)]
    checker_args: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot open trace {}: {source}", .path.display())]
    OpenTrace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Trace(#[from] TraceError),

    #[error("cannot load target {}: {source}", .path.display())]
    Target {
        path: PathBuf,
        #[source]
        source: ImageError,
    },

    #[error(transparent)]
    Checker(#[from] CheckerError),

    #[error("cannot open output: {0}")]
    Output(#[source] std::io::Error),

    #[error("cannot prepare scratch directory: {0}")]
    Scratch(#[source] std::io::Error),

    #[error("cannot start runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error(transparent)]
    Replay(#[from] ReplayError),
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "pmr=info,pmr_io=info,pmr_core=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(report) if report.is_consistent() => ExitCode::SUCCESS,
        Ok(report) => {
            tracing::warn!("{} inconsistent candidate(s)", report.failed);
            ExitCode::from(1)
        }
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> Result<RunReport, CliError> {
    let config = Config::load(cli.config.as_deref())?;

    // Flags win over the file.
    let engine = cli.reorder_engine.unwrap_or(config.engine.kind);
    let sink_kind = cli.output_type.unwrap_or(config.output.kind);
    let output = cli.output.clone().or_else(|| config.output.path.clone());
    let level = cli.output_level.unwrap_or(config.output.level);
    let keep_failing_images = cli.keep_failing_images || config.output.keep_failing_images;
    let mut checker_args = config.checker.args.clone();
    checker_args.extend(cli.checker_args.iter().cloned());

    let mut registry = OperationRegistry::builtin();
    for (alias, target) in &config.trace.aliases {
        registry.alias(alias, target)?;
    }

    let file = File::open(&cli.logfile).map_err(|source| CliError::OpenTrace {
        path: cli.logfile.clone(),
        source,
    })?;
    let trace = parse_trace(BufReader::new(file), &registry, &config.trace.options())?;
    tracing::info!(
        "Trace {}: {} operations, {} writes",
        cli.logfile.display(),
        trace.len(),
        trace.write_count()
    );

    let image = MemoryImage::open(&cli.target).map_err(|source| CliError::Target {
        path: cli.target.clone(),
        source,
    })?;

    let checker = load_checker(&CheckerSpec {
        kind: cli.checker,
        path: cli.path.clone(),
        name: cli.name.clone(),
        args: checker_args,
        timeout: cli
            .timeout_secs
            .or(config.checker.timeout_secs)
            .map(Duration::from_secs),
    })?;

    // A configured scratch directory is left in place; a temporary one is
    // removed on drop unless failing images must survive the run.
    let (scratch_dir, _scratch_guard) = match &config.output.scratch_dir {
        Some(dir) => (dir.clone(), None),
        None => {
            let dir = tempfile::Builder::new()
                .prefix("pmr-")
                .keep(keep_failing_images)
                .tempdir()
                .map_err(CliError::Scratch)?;
            (dir.path().to_path_buf(), Some(dir))
        }
    };
    tracing::debug!("Scratch directory: {}", scratch_dir.display());

    let mut sink = open_sink(sink_kind, output.as_deref(), level).map_err(CliError::Output)?;

    let replayer = Replayer::new(
        ReplayConfig {
            eadr: cli.eadr || config.engine.eadr,
            jobs: cli.jobs.unwrap_or(config.engine.jobs),
            scratch_dir,
            keep_failing_images,
        },
        engine.engine(),
        checker,
    );

    let report = block_on(replayer.run(&trace, image, sink.as_mut()))??;
    Ok(report)
}

/// Run `future` to completion on a current-thread runtime.
///
/// Blocking calls still running afterwards (library checkers that outlived
/// their timeout) are abandoned, not waited for.
fn block_on<F: Future>(future: F) -> Result<F::Output, CliError> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;
    let output = rt.block_on(future);
    rt.shutdown_background();
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_full_command_line() {
        let cli = Cli::try_parse_from([
            "pmr",
            "-l",
            "trace.log",
            "-t",
            "pool.img",
            "-c",
            "lib",
            "-p",
            "libcheck.so",
            "-n",
            "check_consistency",
            "-r",
            "PartialAccumulative",
            "--output-type",
            "json",
            "-o",
            "out.jsonl",
            "-e",
            "warning",
            "--eadr",
            "--jobs",
            "4",
        ])
        .unwrap();

        assert_eq!(cli.checker, CheckerKind::Lib);
        assert_eq!(cli.name.as_deref(), Some("check_consistency"));
        assert_eq!(cli.reorder_engine, Some(EngineKind::PartialAccumulative));
        assert_eq!(cli.output_type, Some(SinkKind::Json));
        assert_eq!(cli.output_level, Some(OutputLevel::Warning));
        assert!(cli.eadr);
        assert_eq!(cli.jobs, Some(4));
    }

    #[test]
    fn test_trailing_args_go_to_checker() {
        let cli = Cli::try_parse_from([
            "pmr", "-l", "t", "-t", "p", "-c", "prog", "-p", "check", "--", "-v", "--pool",
        ])
        .unwrap();
        assert_eq!(cli.checker_args, vec!["-v".to_string(), "--pool".to_string()]);
    }

    #[test]
    fn test_required_flags() {
        assert!(Cli::try_parse_from(["pmr", "-l", "trace.log"]).is_err());
        assert!(Cli::try_parse_from([
            "pmr", "-l", "t", "-t", "p", "-c", "python", "-p", "check"
        ])
        .is_err());
    }

    #[test]
    fn test_block_on_abandons_hung_blocking_calls() {
        let started = std::time::Instant::now();
        let value = block_on(async {
            let hung =
                tokio::task::spawn_blocking(|| std::thread::sleep(Duration::from_secs(5)));
            let timed_out = tokio::time::timeout(Duration::from_millis(50), hung)
                .await
                .is_err();
            assert!(timed_out);
            7
        })
        .unwrap();
        assert_eq!(value, 7);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_run_reports_inconsistency() {
        let dir = tempfile::tempdir().unwrap();
        let trace = dir.path().join("trace.log");
        let target = dir.path().join("pool.img");
        std::fs::write(
            &trace,
            "STORE;0x0;0x11;0x1\nSTORE;0x0;0x22;0x1\nFLUSH;0x0;0x1\nFENCE\n",
        )
        .unwrap();
        std::fs::write(&target, [0u8; 8]).unwrap();
        let config = dir.path().join("empty.toml");
        std::fs::write(&config, "").unwrap();

        let cli = Cli::try_parse_from([
            "pmr".into(),
            "-l".into(),
            trace.display().to_string(),
            "-t".into(),
            target.display().to_string(),
            "-c".into(),
            "prog".into(),
            "-p".into(),
            "sh".into(),
            "-r".into(),
            "full".into(),
            "--config".into(),
            config.display().to_string(),
            "-e".into(),
            "critical".into(),
            "--".into(),
            "-c".into(),
            r#"test "$(od -An -tx1 -N1 "$1" | tr -d ' ')" != 11"#.into(),
            "checker".into(),
        ])
        .unwrap();

        let report = run(cli).unwrap();
        assert_eq!(report.candidates, 2);
        assert_eq!(report.failed, 1);
    }

    #[test]
    fn test_run_rejects_bad_trace() {
        let dir = tempfile::tempdir().unwrap();
        let trace = dir.path().join("trace.log");
        let target = dir.path().join("pool.img");
        std::fs::write(&trace, "START\nSTORE;0x0;0x1;0x1\n").unwrap();
        std::fs::write(&target, [0u8; 8]).unwrap();
        let config = dir.path().join("empty.toml");
        std::fs::write(&config, "").unwrap();

        let cli = Cli::try_parse_from([
            "pmr".into(),
            "-l".into(),
            trace.display().to_string(),
            "-t".into(),
            target.display().to_string(),
            "-c".into(),
            "prog".into(),
            "-p".into(),
            "true".into(),
            "--config".into(),
            config.display().to_string(),
        ])
        .unwrap();

        assert!(matches!(
            run(cli),
            Err(CliError::Trace(TraceError::MalformedTrace { record: 0, .. }))
        ));
    }
}

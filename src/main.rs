//! multirun entry point.
//!
//! The output stream carries result lines only; tracing logs go to stderr
//! or to the log file.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use multirun::protocol::SetupError;
use multirun::sink::ResultSink;
use multirun::source::RecordSource;
use multirun::spec::{self, JobSpec, Registry, SpecOverrides};
use multirun::supervisor::{RunReport, Supervisor, SupervisorConfig};

#[derive(Debug, Parser)]
#[command(name = "multirun")]
#[command(
    about = "Run a user handler over a stream of JSON records with a pool of worker processes",
    long_about = None
)]
struct Cli {
    /// Job spec file (JSON or YAML). Optional: a job can be assembled
    /// from the override options alone. Custom executables and handlers
    /// can only be specified in a spec file.
    #[arg(short = 's', long)]
    spec_file: Option<PathBuf>,

    /// Input data file, one JSON object per line. Default: stdin.
    #[arg(short = 'd', long)]
    data: Option<PathBuf>,

    /// Number of worker processes to spawn for the input.
    #[arg(short = 'n', long, default_value_t = num_cpus::get())]
    n_processes: usize,

    /// Output file for results. Default: stdout.
    #[arg(short = 'o', long)]
    output_file: Option<PathBuf>,

    /// Open mode for the output file: one of w, w+, a, a+.
    #[arg(long, default_value = "w+")]
    output_mode: String,

    /// Log level: error, warn, info, debug or trace.
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,

    /// Write logs to this file instead of stderr.
    #[arg(short = 'l', long)]
    log_file: Option<PathBuf>,

    /// Override exec_type from the spec.
    #[arg(short = 'e', long)]
    exec_type: Option<String>,

    /// Override exec_info.code with a path to user code.
    #[arg(short = 'c', long)]
    code: Option<String>,

    /// Override exec_info.handler (function name within user code).
    #[arg(long)]
    handler: Option<String>,

    /// Override exec_info.setup_hook (run once per worker at startup).
    #[arg(long)]
    setup_hook: Option<String>,

    /// Disable the per-worker resource sampler.
    #[arg(long)]
    no_monitor: bool,
}

fn main() {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    match &cli.log_file {
        Some(path) => {
            let file = match std::fs::File::create(path) {
                Ok(file) => file,
                Err(err) => {
                    eprintln!("error opening log file {}: {err}", path.display());
                    std::process::exit(2);
                }
            };
            tracing_subscriber::fmt()
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .with_env_filter(filter)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(filter)
                .init();
        }
    }

    let code = match run(cli) {
        Ok(report) if report.interrupted => {
            info!("exiting: interrupted");
            1
        }
        Ok(_) => 0,
        Err(err) => {
            if let Some(setup) = err.downcast_ref::<SetupError>() {
                eprintln!("error encountered when {}:\n{}", setup.when, setup.stack);
                2
            } else {
                error!("run failed: {err:#}");
                1
            }
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<RunReport> {
    // Assemble the spec: file, then CLI overrides, then validation.
    let mut spec_value = match &cli.spec_file {
        Some(path) => spec::load_spec_file(path)
            .map_err(|err| setup_error("loading spec", format!("{err:#}")))?,
        None => serde_json::Value::Object(serde_json::Map::new()),
    };
    spec::apply_overrides(
        &mut spec_value,
        &SpecOverrides {
            exec_type: cli.exec_type.as_deref(),
            code: cli.code.as_deref(),
            handler: cli.handler.as_deref(),
            setup_hook: cli.setup_hook.as_deref(),
        },
    );
    let problems = spec::validate(&spec_value);
    if !problems.is_empty() {
        return Err(setup_error("validating spec", problems.join("\n")));
    }

    let job_spec = JobSpec::from_value(spec_value);
    let mut registry = Registry::builtin();
    registry.merge_spec(&job_spec);

    let input: Box<dyn BufRead> = match &cli.data {
        Some(path) => {
            let file = std::fs::File::open(path)
                .map_err(|err| setup_error("opening data stream", err))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(std::io::stdin())),
    };
    let output: Box<dyn Write> = match &cli.output_file {
        Some(path) => Box::new(open_output(path, &cli.output_mode)?),
        None => Box::new(std::io::stdout()),
    };

    let config = SupervisorConfig {
        n_procs: Some(cli.n_processes.max(1)),
        poll_timeout: None,
        monitor: !cli.no_monitor,
    };
    let mut supervisor = Supervisor::new(job_spec, registry, RecordSource::new(input), config);
    supervisor.setup().map_err(anyhow::Error::new)?;

    let mut sink = ResultSink::new(output);
    let report = supervisor.run(&mut sink)?;
    sink.flush().context("flush output")?;

    log_stats(&supervisor);
    Ok(report)
}

/// Wrap a pre-run failure so it maps to exit code 2.
fn setup_error(when: &str, stack: impl ToString) -> anyhow::Error {
    anyhow::Error::new(SetupError::new(when, stack.to_string()))
}

fn open_output(path: &Path, mode: &str) -> Result<std::fs::File> {
    let mode = mode.replace('b', "");
    let mut options = std::fs::OpenOptions::new();
    match mode.as_str() {
        "w" => options.write(true).create(true).truncate(true),
        "w+" => options.read(true).write(true).create(true).truncate(true),
        "a" => options.append(true).create(true),
        "a+" => options.read(true).append(true).create(true),
        other => {
            return Err(setup_error(
                "opening output stream",
                format!("unsupported output mode '{other}' (expected one of w, w+, a, a+)"),
            ));
        }
    };
    options
        .open(path)
        .map_err(|err| setup_error("opening output stream", err))
}

fn log_stats<R: BufRead>(supervisor: &Supervisor<R>) {
    info!(processes = supervisor.n_procs(), "pool size");
    #[cfg(feature = "stats")]
    if let Some(stats) = supervisor.stats()
        && let Ok(collector) = stats.lock()
        && let Some(average) = collector.average_overall()
    {
        info!(
            cpus = %format!("{:.3}", average.cpus),
            rss_bytes = average.memory as u64,
            "per-process average usage"
        );
    }
}

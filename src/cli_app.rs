//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use stream_smoketest::core::config::TestConfiguration;
use stream_smoketest::core::errors::SmokeError;
use stream_smoketest::daemon::signals::SignalHandler;
use stream_smoketest::local::{LocalOutcome, LocalRun};
use stream_smoketest::logger::activity::{ActivityLoggerConfig, spawn_logger};
use stream_smoketest::model::performance::StreamPerformance;
use stream_smoketest::model::runtime::AssertionKind;

/// Load-test harness for streaming platforms.
#[derive(Debug, Parser)]
#[command(
    name = "smoketest",
    author,
    version,
    about = "Stream load-test harness",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Run a whole test in this process against in-memory streams.
    Run(RunArgs),
    /// Load and validate a test configuration without running it.
    Validate(ValidateArgs),
    /// List the assertions a configuration may enable.
    Assertions,
}

#[derive(Debug, Clone, Args)]
struct RunArgs {
    /// Test configuration file (TOML).
    #[arg(long, value_name = "PATH")]
    config: PathBuf,
    /// Number of worker drivers. Defaults to one per task.
    #[arg(long, value_name = "N")]
    workers: Option<usize>,
}

#[derive(Debug, Clone, Args)]
struct ValidateArgs {
    /// Test configuration file (TOML).
    #[arg(long, value_name = "PATH")]
    config: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Bad configuration or arguments.
    #[error("{0}")]
    User(String),
    /// The harness itself failed.
    #[error("{0}")]
    Runtime(String),
    /// The test ran but did not pass.
    #[error("{0}")]
    Failed(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Json(_) => 3,
            Self::Failed(_) => 4,
        }
    }
}

impl From<SmokeError> for CliError {
    fn from(err: SmokeError) -> Self {
        match err {
            SmokeError::InvalidConfig { .. }
            | SmokeError::MissingConfig { .. }
            | SmokeError::ConfigParse { .. } => Self::User(err.to_string()),
            other => Self::Runtime(other.to_string()),
        }
    }
}

pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Run(args) => run_test(cli, args),
        Command::Validate(args) => run_validate(cli, args),
        Command::Assertions => list_assertions(cli),
    }
}

fn run_test(cli: &Cli, args: &RunArgs) -> Result<(), CliError> {
    let config = TestConfiguration::load(&args.config)?;
    let (logger, logger_join) =
        spawn_logger(ActivityLoggerConfig::for_path(config.paths.activity_log.clone()))?;
    let signals = SignalHandler::new();

    eprintln!(
        "[SMK-CLI] running test {} ({}) with {} task(s){}",
        config.name,
        config.id,
        config.tasks.len(),
        if config.forever { ", until interrupted" } else { "" }
    );
    let outcome = LocalRun::new(config, args.workers, logger.clone()).run(&|| signals.should_shutdown());

    logger.shutdown();
    if logger_join.join().is_err() {
        eprintln!("[SMK-CLI] logger thread panicked");
    }
    let outcome = outcome?;

    match output_mode(cli) {
        OutputMode::Human => print_outcome(&outcome),
        OutputMode::Json => write_json_line(&json!({
            "succeeded": outcome.succeeded(),
            "runtime": outcome.verdict(),
            "final": outcome.final_runtime,
        }))?,
    }

    if outcome.succeeded() {
        Ok(())
    } else {
        Err(CliError::Failed(format!(
            "test {} did not pass",
            outcome.final_runtime.name
        )))
    }
}

fn run_validate(cli: &Cli, args: &ValidateArgs) -> Result<(), CliError> {
    let config = TestConfiguration::load(&args.config)?;
    let hash = config.stable_hash()?;
    match output_mode(cli) {
        OutputMode::Human => {
            println!("{} {}", "valid".green().bold(), args.config.display());
            println!("  test:       {} ({})", config.name, config.id);
            println!("  tasks:      {}", config.tasks.len());
            println!("  streams:    {}", config.tasks_by_stream().len());
            println!(
                "  duration:   {}",
                if config.forever {
                    "forever".to_string()
                } else {
                    format!("{} minute(s)", config.minutes)
                }
            );
            println!("  assertions: {}", config.assertions.len());
            println!("  hash:       {hash}");
        }
        OutputMode::Json => write_json_line(&json!({
            "valid": true,
            "config": config,
            "hash": hash,
        }))?,
    }
    Ok(())
}

fn list_assertions(cli: &Cli) -> Result<(), CliError> {
    match output_mode(cli) {
        OutputMode::Human => {
            for kind in AssertionKind::ALL {
                println!("{}", kind.as_str());
            }
        }
        OutputMode::Json => {
            let names: Vec<Value> = AssertionKind::ALL
                .iter()
                .map(|kind| Value::from(kind.as_str()))
                .collect();
            write_json_line(&Value::Array(names))?;
        }
    }
    Ok(())
}

fn print_outcome(outcome: &LocalOutcome) {
    let last = &outcome.final_runtime;
    println!(
        "{} {} ({}) ran {}",
        "test".bold(),
        last.name,
        last.id,
        last.human_running
    );
    println!("  final state: {}", last.state);
    for (name, stream) in &last.streams {
        print_stream(name, stream);
    }

    match &outcome.verdict().assertion_results {
        Some(results) if !results.assertions.is_empty() => {
            println!("{}", "assertions".bold());
            for (name, result) in &results.assertions {
                let mark = if result.succeeded {
                    "pass".green()
                } else {
                    "FAIL".red().bold()
                };
                println!("  [{mark}] {name}: {}", result.expected);
            }
        }
        _ => println!("no assertions configured"),
    }

    if !last.errors.is_empty() {
        println!("{}", "errors".red().bold());
        for error in &last.errors {
            println!(
                "  {}: {}",
                error.worker_id.as_deref().unwrap_or("coordinator"),
                error.message
            );
        }
    }

    let verdict = if outcome.succeeded() {
        "PASSED".green().bold()
    } else {
        "FAILED".red().bold()
    };
    println!("{verdict}");
}

fn print_stream(name: &str, stream: &StreamPerformance) {
    println!("  {}", name.cyan());
    if let Some(writers) = &stream.writers {
        let c = &writers.counters;
        println!(
            "    writers: {} events, {}, {:.1} ev/s, {} active / {} dead",
            c.events,
            format_bytes(c.bytes),
            c.events_per_sec,
            c.worker_stats.active,
            c.worker_stats.dead
        );
        if writers.tx_started > 0 {
            println!(
                "    transactions: {} committed, {} aborted, {} failed",
                writers.tx_committed, writers.tx_aborted, writers.tx_failed
            );
        }
    }
    if let Some(readers) = &stream.readers {
        let c = &readers.counters;
        println!(
            "    readers: {} events, {}, {:.1} ev/s, {} out of sequence",
            c.events,
            format_bytes(c.bytes),
            c.events_per_sec,
            readers.events_out_of_sequence
        );
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("SMK_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }
    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };
    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_requires_config() {
        assert!(Cli::try_parse_from(["smoketest", "run"]).is_err());
        let cli = Cli::try_parse_from(["smoketest", "run", "--config", "t.toml", "--workers", "3"])
            .unwrap();
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.config, PathBuf::from("t.toml"));
                assert_eq!(args.workers, Some(3));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn json_flag_is_global() {
        let cli = Cli::try_parse_from(["smoketest", "assertions", "--json"]).unwrap();
        assert!(cli.json);
    }

    #[test]
    fn output_mode_resolution() {
        assert_eq!(resolve_output_mode(true, Some("human"), true), OutputMode::Json);
        assert_eq!(resolve_output_mode(false, Some("JSON"), true), OutputMode::Json);
        assert_eq!(resolve_output_mode(false, Some("human"), false), OutputMode::Human);
        assert_eq!(resolve_output_mode(false, None, true), OutputMode::Human);
        assert_eq!(resolve_output_mode(false, Some("auto"), false), OutputMode::Json);
    }

    #[test]
    fn config_errors_map_to_user_exit_code() {
        let err: CliError = SmokeError::InvalidConfig {
            details: "bad".to_string(),
        }
        .into();
        assert_eq!(err.exit_code(), 1);
        let err: CliError = SmokeError::Runtime {
            details: "boom".to_string(),
        }
        .into();
        assert_eq!(err.exit_code(), 2);
        assert_eq!(CliError::Failed("x".to_string()).exit_code(), 4);
    }

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MiB");
    }
}

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::time::{SystemTime, UNIX_EPOCH};

use stream_smoketest::model::payload::PerformanceReport;
use stream_smoketest::model::performance::{
    PerformanceCounters, StreamPerformance, WorkerStats, WriterCounters,
};

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_smoketest") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) {
        "smoketest.exe"
    } else {
        "smoketest"
    };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve smoketest binary path for integration test"),
    }
}

/// Run the binary, keeping a transcript next to the other test logs.
pub fn run_cli_case(case_name: &str, args: &[&str]) -> CmdResult {
    let root = std::env::temp_dir().join("smoketest-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let output = Command::new(&bin_path)
        .args(args)
        .env("SMK_OUTPUT_FORMAT", "json")
        .env("RUST_BACKTRACE", "1")
        .output()
        .expect("execute smoketest command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let log_content = format!(
        "case={case_name}\nbin={}\nargs={args:?}\nstatus={}\n----- stdout -----\n{stdout}\n----- stderr -----\n{stderr}\n",
        bin_path.display(),
        output.status
    );
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}

/// Write a config file into `dir` and return its path.
pub fn write_config(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("smoketest.toml");
    fs::write(&path, body).expect("write config");
    path
}

/// A writer-only report for `stream` from one live worker.
pub fn writer_report(
    worker: &str,
    sequence: u64,
    stream: &str,
    events: u64,
    bytes: u64,
) -> PerformanceReport {
    PerformanceReport {
        worker_id: worker.to_string(),
        incarnation: format!("{worker}-1"),
        sequence,
        start_time: 1_000,
        current_time: 61_000,
        stream_name: stream.to_string(),
        stream_performance: StreamPerformance {
            writers: Some(WriterCounters {
                counters: PerformanceCounters {
                    events,
                    bytes,
                    worker_stats: WorkerStats {
                        count: 1,
                        active: 1,
                        idle: 0,
                        dead: 0,
                    },
                    ..PerformanceCounters::default()
                },
                ..WriterCounters::default()
            }),
            readers: None,
        },
    }
}

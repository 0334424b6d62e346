mod isolate_runner;
mod runner;
mod simple_runner;

use isolate_runner::IsolateRunner;
pub use runner::SandboxRunner;
use simple_runner::SimpleRunner;

use anyhow::Result;

use crate::status::Status;

/// Result of one sandboxed run, record-level fields plus per-test-case
/// outcomes for grading runs.
#[derive(Debug, Default)]
pub struct ExecutionOutcome {
    pub status: Option<Status>,
    pub time: Option<f64>,
    pub wall_time: Option<f64>,
    pub memory: Option<u64>,
    pub exit_code: Option<i64>,
    pub exit_signal: Option<i64>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub compile_output: Option<String>,
    pub message: Option<String>,
    pub cases: Vec<CaseOutcome>,
}

impl ExecutionOutcome {
    pub fn status(&self) -> Status {
        self.status.unwrap_or(Status::BoxError)
    }
}

/// Outcome of a single grading test case.
#[derive(Debug)]
pub struct CaseOutcome {
    pub index: usize,
    pub status: Status,
    pub time: Option<f64>,
    pub wall_time: Option<f64>,
    pub memory: Option<u64>,
    pub exit_code: Option<i64>,
    pub exit_signal: Option<i64>,
    pub stdout: Option<String>,
}

/// Incremental test-case completion report emitted by the engine while a
/// grading run is in flight.
#[derive(Debug, Clone, Copy)]
pub struct ProgressUpdate {
    pub done: u64,
    pub total: u64,
}

/// Creates a sandbox runner for a worker.
///
/// Uses the `isolate` sandbox when the binary is available; otherwise falls
/// back to a plain-process runner that only enforces timeouts, for
/// development and test hosts.
pub fn create_sandbox_runner(id: u8) -> Result<Box<dyn SandboxRunner>> {
    let isolate_available = std::process::Command::new("which")
        .arg("isolate")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false);

    if isolate_available {
        log::info!("Creating IsolateRunner {id} (full isolation mode)");
        let runner = IsolateRunner::build(id)?;
        Ok(Box::new(runner))
    } else {
        log::info!("Creating SimpleRunner {id} (no isolation)");
        let runner = SimpleRunner::build(id)?;
        Ok(Box::new(runner))
    }
}

/// Classifies a normally reaped process: terminating signal first, then a
/// non-zero exit, then the output check.
fn status_from_exit(
    exit_code: Option<i64>,
    exit_signal: Option<i64>,
    stdout: &str,
    expected_output: Option<&str>,
) -> Status {
    if let Some(signal) = exit_signal {
        return Status::from_signal(i32::try_from(signal).ok());
    }
    if exit_code.is_some_and(|code| code != 0) {
        return Status::RuntimeNzec;
    }
    match expected_output {
        Some(expected) if !compare_output_standard(stdout, expected) => Status::WrongAnswer,
        _ => Status::Accepted,
    }
}

/// Applies `%SOURCE%`/`%EXECUTABLE%` substitutions to a command template.
fn apply_template(cmd_template: &[String], source: &str, executable: &str) -> Vec<String> {
    cmd_template
        .iter()
        .map(|s| s.replace("%SOURCE%", source).replace("%EXECUTABLE%", executable))
        .collect()
}

/// Record-level resource figures for a grading run are the maxima over its
/// test cases.
fn max_opt<T: PartialOrd + Copy>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if a >= b { a } else { b }),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Compares program output with expected output, ignoring trailing empty
/// lines and trailing spaces on each line.
fn compare_output_standard(program_output: &str, expected_output: &str) -> bool {
    let normalize = |s: &str| -> String {
        s.lines()
            .map(|line| line.trim_end())
            .collect::<Vec<_>>()
            .join("\n")
            .trim_end()
            .to_string()
    };

    normalize(program_output) == normalize(expected_output)
}

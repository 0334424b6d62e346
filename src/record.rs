use serde::Deserialize;
use uuid::Uuid;

use crate::config::LimitsConfig;
use crate::progress::Progress;
use crate::status::Status;

/// Resource and feature limits attached to one execution request.
/// Immutable once the record is created.
#[derive(Debug, Clone)]
pub struct Constraints {
    /// CPU time limit in seconds
    pub time_limit: f64,
    /// Hard wall-clock ceiling in seconds, always above `time_limit`
    pub wall_time_limit: f64,
    /// Memory ceiling in KB
    pub memory_limit: u64,
    /// Stack ceiling in KB
    pub stack_limit: u64,
    pub max_processes: u64,
    pub enable_network: bool,
    pub compiler_options: Option<String>,
    pub command_line_arguments: Option<String>,
    pub callback_url: Option<String>,
    /// Base64-encoded zip archive for project submissions
    pub additional_files: Option<String>,
}

impl Constraints {
    /// Fills absent limits from the configured defaults and clamps the rest
    /// to the configured maxima.
    pub fn from_request(req: &SubmissionRequest, limits: &LimitsConfig) -> Self {
        let time_limit = req
            .cpu_time_limit
            .unwrap_or(limits.default_time_limit)
            .min(limits.max_time_limit);
        Self {
            time_limit,
            wall_time_limit: time_limit + limits.wall_time_margin,
            memory_limit: req
                .memory_limit
                .unwrap_or(limits.default_memory_limit)
                .min(limits.max_memory_limit),
            stack_limit: req.stack_limit.unwrap_or(limits.default_stack_limit),
            max_processes: req
                .max_processes_and_or_threads
                .unwrap_or(limits.default_max_processes),
            enable_network: req.enable_network.unwrap_or(false),
            compiler_options: req.compiler_options.clone(),
            command_line_arguments: req.command_line_arguments.clone(),
            callback_url: req.callback_url.clone(),
            additional_files: req.additional_files.clone(),
        }
    }
}

/// Body of `POST /submissions` and `POST /grading/{problem_id}`.
#[derive(Deserialize, Debug, Clone)]
pub struct SubmissionRequest {
    #[serde(default)]
    pub source_code: String,
    pub language_id: i64,
    pub stdin: Option<String>,
    pub expected_output: Option<String>,
    pub cpu_time_limit: Option<f64>,
    pub memory_limit: Option<u64>,
    pub stack_limit: Option<u64>,
    pub max_processes_and_or_threads: Option<u64>,
    pub enable_network: Option<bool>,
    pub compiler_options: Option<String>,
    pub command_line_arguments: Option<String>,
    pub callback_url: Option<String>,
    pub additional_files: Option<String>,
    /// Ordered test cases, required for grading requests only; supplied by
    /// the curriculum collaborator
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct TestCase {
    pub stdin: Option<String>,
    pub expected_output: String,
}

/// Durable record of one execution request, either a single-run submission
/// or a test-driven grading run.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub token: String,
    pub source_code: String,
    pub language_id: i64,
    pub stdin: Option<String>,
    pub expected_output: Option<String>,
    pub constraints: Constraints,
    pub status: Status,
    pub queued_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    /// CPU time in seconds, write-once after execution
    pub time: Option<f64>,
    pub wall_time: Option<f64>,
    /// Peak memory in KB
    pub memory: Option<u64>,
    pub exit_code: Option<i64>,
    pub exit_signal: Option<i64>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub compile_output: Option<String>,
    pub message: Option<String>,
    pub queue_host: Option<String>,
    pub execution_host: Option<String>,
    pub grading: Option<GradingData>,
}

#[derive(Debug, Clone)]
pub struct GradingData {
    pub problem_id: i64,
    pub cases: Vec<GradingCase>,
    pub progress: Progress,
}

/// One test case of a grading run: the inputs it was created with plus the
/// outcome fields filled in by the execution engine.
#[derive(Debug, Clone)]
pub struct GradingCase {
    pub token: String,
    pub stdin: Option<String>,
    pub expected_output: String,
    pub status: Status,
    pub time: Option<f64>,
    pub wall_time: Option<f64>,
    pub memory: Option<u64>,
    pub exit_code: Option<i64>,
    pub exit_signal: Option<i64>,
    pub stdout: Option<String>,
}

impl ExecutionRecord {
    /// Builds a fresh record in the queued state. The token is assigned here,
    /// exactly once.
    pub fn new(req: &SubmissionRequest, constraints: Constraints, problem_id: Option<i64>) -> Self {
        let grading = problem_id.map(|problem_id| GradingData {
            problem_id,
            cases: req
                .test_cases
                .iter()
                .map(|case| GradingCase {
                    token: Uuid::new_v4().to_string(),
                    stdin: case.stdin.clone(),
                    expected_output: case.expected_output.clone(),
                    status: Status::InQueue,
                    time: None,
                    wall_time: None,
                    memory: None,
                    exit_code: None,
                    exit_signal: None,
                    stdout: None,
                })
                .collect(),
            progress: Progress::new(req.test_cases.len() as u64),
        });

        Self {
            token: Uuid::new_v4().to_string(),
            source_code: req.source_code.clone(),
            language_id: req.language_id,
            stdin: req.stdin.clone(),
            expected_output: req.expected_output.clone(),
            constraints,
            status: Status::InQueue,
            queued_at: crate::create_timestamp(),
            started_at: None,
            finished_at: None,
            time: None,
            wall_time: None,
            memory: None,
            exit_code: None,
            exit_signal: None,
            stdout: None,
            stderr: None,
            compile_output: None,
            message: None,
            queue_host: Some(crate::hostname()),
            execution_host: None,
            grading,
        }
    }

    pub fn is_grading(&self) -> bool {
        self.grading.is_some()
    }
}

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::timeout;

use crate::config::LanguageConfig;
use crate::record::{Constraints, ExecutionRecord};
use crate::status::Status;

use super::{
    CaseOutcome, ExecutionOutcome, ProgressUpdate, SandboxRunner, apply_template, max_opt,
    status_from_exit,
};

const COMPILE_TIMEOUT: Duration = Duration::from_secs(30);
const EXECUTABLE_NAME: &str = "main";

/// Executes records as plain processes, without security isolation.
///
/// Only the wall-clock ceiling is enforced; there is no memory, filesystem
/// or permission control. Intended for development and test hosts where the
/// `isolate` binary is unavailable.
pub struct SimpleRunner {
    id: u8,
    work_dir: PathBuf,
}

/// Scratch directory for one run, removed on drop so nothing leaks into the
/// next execution.
struct RunDir {
    path: PathBuf,
}

impl RunDir {
    fn create(work_dir: &Path, token: &str) -> Result<Self> {
        let path = work_dir.join(token);
        fs::create_dir_all(&path)?;
        Ok(Self { path })
    }
}

impl Drop for RunDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            log::warn!("Failed to remove run dir {}: {e}", self.path.display());
        }
    }
}

enum Waited {
    Finished(std::process::ExitStatus),
    TimedOut,
    SpawnFailed(std::io::Error),
}

/// Raw result of one process run.
struct RawRun {
    status: Option<Status>,
    wall_time: f64,
    exit_code: Option<i64>,
    exit_signal: Option<i64>,
    stdout: String,
    stderr: String,
}

impl SandboxRunner for SimpleRunner {
    fn build(id: u8) -> Result<Self> {
        let work_dir = std::env::temp_dir()
            .join("runbox-simple")
            .join(id.to_string());
        fs::create_dir_all(&work_dir)?;

        log::info!("SimpleRunner {id} initialized");
        log::warn!(
            "SimpleRunner provides NO security isolation - use only in trusted environments"
        );

        Ok(Self { id, work_dir })
    }

    fn run(
        &self,
        record: &ExecutionRecord,
        language: &LanguageConfig,
        progress_tx: Option<UnboundedSender<ProgressUpdate>>,
    ) -> Result<ExecutionOutcome> {
        let run_dir = RunDir::create(&self.work_dir, &record.token)?;
        log::debug!("SimpleRunner {} running record {}", self.id, record.token);
        self.inject_sources(&run_dir, record, language)?;

        let mut outcome = ExecutionOutcome::default();
        if let Some(compile_cmd) = &language.compile_cmd {
            let (success, compile_output) =
                self.compile(&run_dir, compile_cmd, record, language)?;
            outcome.compile_output = compile_output;
            if !success {
                outcome.status = Some(Status::CompilationError);
                return Ok(outcome);
            }
        }

        let run_cmd = build_run_command(record, language);

        match &record.grading {
            None => {
                let raw = self.run_once(
                    &run_dir,
                    0,
                    record.stdin.as_deref(),
                    &record.constraints,
                    &run_cmd,
                )?;
                outcome.wall_time = Some(raw.wall_time);
                outcome.exit_code = raw.exit_code;
                outcome.exit_signal = raw.exit_signal;
                outcome.stdout = Some(raw.stdout.clone());
                outcome.stderr = Some(raw.stderr.clone());
                outcome.status = Some(classify(&raw, record.expected_output.as_deref()));
            }
            Some(grading) => {
                let total = grading.cases.len() as u64;
                let mut first_failure: Option<Status> = None;

                for (index, case) in grading.cases.iter().enumerate() {
                    let raw = self.run_once(
                        &run_dir,
                        index,
                        case.stdin.as_deref(),
                        &record.constraints,
                        &run_cmd,
                    )?;
                    let status = classify(&raw, Some(&case.expected_output));

                    if !status.is_successful() {
                        first_failure = first_failure.or(Some(status));
                    }
                    outcome.wall_time = max_opt(outcome.wall_time, Some(raw.wall_time));
                    outcome.cases.push(CaseOutcome {
                        index,
                        status,
                        time: None,
                        wall_time: Some(raw.wall_time),
                        memory: None,
                        exit_code: raw.exit_code,
                        exit_signal: raw.exit_signal,
                        stdout: Some(raw.stdout),
                    });

                    if let Some(tx) = &progress_tx {
                        let _ = tx.send(ProgressUpdate {
                            done: index as u64 + 1,
                            total,
                        });
                    }
                }

                outcome.status = Some(first_failure.unwrap_or(Status::Accepted));
            }
        }

        Ok(outcome)
    }
}

fn classify(raw: &RawRun, expected_output: Option<&str>) -> Status {
    if let Some(status) = raw.status {
        return status;
    }
    status_from_exit(raw.exit_code, raw.exit_signal, &raw.stdout, expected_output)
}

fn build_run_command(record: &ExecutionRecord, language: &LanguageConfig) -> Vec<String> {
    let mut command = apply_template(&language.run_cmd, &language.source_file, EXECUTABLE_NAME);
    if let Some(args) = record
        .constraints
        .command_line_arguments
        .as_deref()
        .filter(|a| !a.is_empty())
    {
        command.extend(args.split_whitespace().map(str::to_string));
    }
    command
}

impl SimpleRunner {
    fn inject_sources(
        &self,
        run_dir: &RunDir,
        record: &ExecutionRecord,
        language: &LanguageConfig,
    ) -> Result<()> {
        if language.is_project {
            let encoded = record
                .constraints
                .additional_files
                .as_deref()
                .ok_or_else(|| anyhow!("project submission without additional files"))?;
            let archive = BASE64
                .decode(encoded.trim())
                .map_err(|e| anyhow!("additional files are not valid base64: {e}"))?;
            let archive_path = run_dir.path.join("archive.zip");
            fs::write(&archive_path, archive)?;

            let output = std::process::Command::new("unzip")
                .arg("-o")
                .arg("-q")
                .arg(&archive_path)
                .arg("-d")
                .arg(&run_dir.path)
                .output()
                .map_err(|e| anyhow!("Failed to spawn unzip: {e}"))?;
            if !output.status.success() {
                bail!(
                    "unpacking additional files failed: {}",
                    String::from_utf8_lossy(&output.stderr)
                );
            }
        } else {
            fs::write(
                run_dir.path.join(&language.source_file),
                format!("{}\n", record.source_code),
            )?;
        }
        Ok(())
    }

    fn compile(
        &self,
        run_dir: &RunDir,
        compile_cmd: &[String],
        record: &ExecutionRecord,
        language: &LanguageConfig,
    ) -> Result<(bool, Option<String>)> {
        let mut command =
            apply_template(compile_cmd, &language.source_file, EXECUTABLE_NAME).join(" ");
        if let Some(options) = record
            .constraints
            .compiler_options
            .as_deref()
            .filter(|o| !o.is_empty())
        {
            command.push(' ');
            command.push_str(options);
        }

        let dir = run_dir.path.clone();
        let result = tokio::runtime::Handle::current().block_on(async {
            timeout(COMPILE_TIMEOUT, async {
                tokio::process::Command::new("/bin/sh")
                    .arg("-c")
                    .arg(&command)
                    .current_dir(&dir)
                    .stdin(Stdio::null())
                    .output()
                    .await
            })
            .await
        });

        match result {
            Ok(Ok(output)) => {
                let mut log_text = String::from_utf8_lossy(&output.stdout).into_owned();
                log_text.push_str(&String::from_utf8_lossy(&output.stderr));
                let produced = run_dir.path.join(EXECUTABLE_NAME).exists();
                let success = output.status.success() && produced;
                Ok((success, Some(log_text)))
            }
            Ok(Err(e)) => Err(anyhow!("compilation process error: {e}")),
            Err(_) => Ok((false, Some("compilation timed out".to_string()))),
        }
    }

    fn run_once(
        &self,
        run_dir: &RunDir,
        index: usize,
        stdin: Option<&str>,
        constraints: &Constraints,
        run_cmd: &[String],
    ) -> Result<RawRun> {
        if run_cmd.is_empty() {
            bail!("empty run command");
        }

        let dir = run_dir.path.clone();
        let program = run_cmd[0].clone();
        let args = run_cmd[1..].to_vec();
        let input = stdin.map(str::to_string);
        let wall_limit = Duration::from_secs_f64(constraints.wall_time_limit);
        let stdout_path = dir.join(format!("{index}.out"));
        let stderr_path = dir.join(format!("{index}.err"));

        let start = Instant::now();
        let waited = tokio::runtime::Handle::current().block_on(async {
            let stdout_file = fs::File::create(&stdout_path)?;
            let stderr_file = fs::File::create(&stderr_path)?;

            let mut cmd = tokio::process::Command::new(&program);
            cmd.args(&args)
                .current_dir(&dir)
                .stdin(Stdio::piped())
                .stdout(Stdio::from(stdout_file))
                .stderr(Stdio::from(stderr_file));

            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => return Ok::<_, anyhow::Error>(Waited::SpawnFailed(e)),
            };

            if let Some(mut handle) = child.stdin.take() {
                use tokio::io::AsyncWriteExt;
                if let Some(input) = &input {
                    let _ = handle.write_all(input.as_bytes()).await;
                }
                let _ = handle.shutdown().await;
                drop(handle);
            }

            match timeout(wall_limit, child.wait()).await {
                Ok(status) => Ok(Waited::Finished(status?)),
                Err(_) => {
                    // Kill the runaway process so the worker is freed
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                    Ok(Waited::TimedOut)
                }
            }
        })?;

        let wall_time = start.elapsed().as_secs_f64();
        let stdout = fs::read_to_string(&stdout_path).unwrap_or_default();
        let stderr = fs::read_to_string(&stderr_path).unwrap_or_default();

        match waited {
            Waited::SpawnFailed(spawn_err) => {
                // A binary the OS refuses to exec is an execution-format
                // failure, not an infrastructure error
                let exec_failure = spawn_err.raw_os_error() == Some(libc::ENOEXEC)
                    || spawn_err.kind() == std::io::ErrorKind::PermissionDenied
                    || spawn_err.kind() == std::io::ErrorKind::NotFound;
                if exec_failure {
                    Ok(RawRun {
                        status: Some(Status::ExecFormatError),
                        wall_time,
                        exit_code: None,
                        exit_signal: None,
                        stdout,
                        stderr: spawn_err.to_string(),
                    })
                } else {
                    Err(anyhow!("failed to spawn program: {spawn_err}"))
                }
            }
            Waited::TimedOut => Ok(RawRun {
                status: Some(Status::TimeLimitExceeded),
                wall_time,
                exit_code: None,
                exit_signal: None,
                stdout,
                stderr,
            }),
            Waited::Finished(exit_status) => {
                use std::os::unix::process::ExitStatusExt;

                Ok(RawRun {
                    status: None,
                    wall_time,
                    exit_code: exit_status.code().map(i64::from),
                    exit_signal: exit_status.signal().map(i64::from),
                    stdout,
                    stderr,
                })
            }
        }
    }
}

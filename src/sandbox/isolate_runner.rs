use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Result, anyhow, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Local;
use tokio::sync::mpsc::UnboundedSender;

use crate::config::LanguageConfig;
use crate::record::{Constraints, ExecutionRecord};
use crate::status::Status;

use super::{
    CaseOutcome, ExecutionOutcome, ProgressUpdate, SandboxRunner, apply_template, max_opt,
    status_from_exit,
};

// Compilation limits, independent of the record's own constraints
const COMPILE_TIME_LIMIT: f64 = 30.0; // seconds
const COMPILE_MEMORY_LIMIT: u64 = 262144; // KB
const COMPILE_PROCESSES: u64 = 10;
const COMPILE_OPEN_FILES: u32 = 512;
const COMPILE_FILE_SIZE: u32 = 65536; // KB

const RUNTIME_OPEN_FILES: u32 = 64;
const RUNTIME_FILE_SIZE: u32 = 16384; // KB

const CACHE_DIR_PERMISSIONS: u32 = 0o700;
const EXECUTABLE_NAME: &str = "main";

/// One single-use isolate box. Created at the start of a run and destroyed
/// unconditionally when dropped, so no state leaks between executions.
struct BoxGuard {
    id: u8,
    box_dir: PathBuf,
}

impl BoxGuard {
    fn init(id: u8) -> Result<Self> {
        // A leftover box from a crashed run would make --init fail
        let _ = Command::new("isolate")
            .args(["-b", &id.to_string(), "--cg", "--cleanup"])
            .output();

        let output = Command::new("isolate")
            .args(["-b", &id.to_string(), "--cg", "--init"])
            .output()
            .map_err(|e| anyhow!("Failed to spawn isolate --init: {e}"))?;

        if !output.status.success() {
            bail!(
                "isolate --init exited with non-zero status: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let root_dir = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if root_dir.is_empty() {
            bail!(
                "isolate --init produced empty stdout; stderr={}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        Ok(Self {
            id,
            box_dir: PathBuf::from(root_dir).join("box"),
        })
    }
}

impl Drop for BoxGuard {
    fn drop(&mut self) {
        let out = Command::new("isolate")
            .args(["-b", &self.id.to_string(), "--cg", "--cleanup"])
            .output();

        if out.is_ok_and(|c| c.status.success()) {
            log::debug!("Sandbox {} destroyed", self.id);
        } else {
            log::error!("Sandbox {} failed to clean up", self.id);
        }
    }
}

/// Raw result of one `isolate --run` invocation, as read from the meta file.
#[derive(Debug, Default)]
struct MetaFile {
    status: Option<String>,
    exit_code: Option<i64>,
    exit_signal: Option<i64>,
    time: Option<f64>,
    wall_time: Option<f64>,
    memory: Option<u64>,
    oom_killed: bool,
    message: Option<String>,
}

fn parse_meta(content: &str) -> MetaFile {
    let mut meta = MetaFile::default();
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key {
            "status" => meta.status = Some(value.to_string()),
            "exitcode" => meta.exit_code = value.parse().ok(),
            "exitsig" => meta.exit_signal = value.parse().ok(),
            "time" => meta.time = value.parse().ok(),
            "time-wall" => meta.wall_time = value.parse().ok(),
            "cg-mem" | "max-rss" => {
                if meta.memory.is_none() {
                    meta.memory = value.parse().ok();
                }
            }
            "cg-oom-killed" => meta.oom_killed = value != "0",
            "message" => meta.message = Some(value.to_string()),
            _ => {}
        }
    }
    meta
}

/// Executes records inside `isolate`, one ephemeral box per run.
pub struct IsolateRunner {
    /// Box id reserved for this worker; every run re-creates the box
    id: u8,
    /// Host-side directory for meta files and archives, outside the box
    cache_dir: PathBuf,
}

impl SandboxRunner for IsolateRunner {
    fn build(id: u8) -> Result<Self> {
        let cache_dir = Self::setup_cache_directory(id)?;
        log::info!("IsolateRunner {id} initialized");
        Ok(Self { id, cache_dir })
    }

    fn run(
        &self,
        record: &ExecutionRecord,
        language: &LanguageConfig,
        progress_tx: Option<UnboundedSender<ProgressUpdate>>,
    ) -> Result<ExecutionOutcome> {
        let sandbox = BoxGuard::init(self.id)?;
        let run_dir = self.create_run_dir(&record.token)?;

        self.inject_sources(&sandbox, &run_dir, record, language)?;

        let mut outcome = ExecutionOutcome::default();
        if let Some(compile_cmd) = &language.compile_cmd {
            let compile_log = self.compile(&sandbox, &run_dir, compile_cmd, record, language)?;
            outcome.compile_output = compile_log.output;
            if !compile_log.success {
                outcome.status = Some(Status::CompilationError);
                return Ok(outcome);
            }
        }

        let run_cmd = self.build_run_command(record, language);

        match &record.grading {
            None => {
                let raw = self.run_once(
                    &sandbox,
                    &run_dir,
                    0,
                    record.stdin.as_deref(),
                    &record.constraints,
                    &run_cmd,
                )?;
                raw.fill_record_fields(&mut outcome);
                outcome.status = Some(raw.classify(record.expected_output.as_deref())?);
            }
            Some(grading) => {
                let total = grading.cases.len() as u64;
                let mut first_failure: Option<Status> = None;

                for (index, case) in grading.cases.iter().enumerate() {
                    let raw = self.run_once(
                        &sandbox,
                        &run_dir,
                        index,
                        case.stdin.as_deref(),
                        &record.constraints,
                        &run_cmd,
                    )?;
                    let status = raw.classify(Some(&case.expected_output))?;

                    if !status.is_successful() {
                        first_failure = first_failure.or(Some(status));
                    }
                    outcome.time = max_opt(outcome.time, raw.meta.time);
                    outcome.wall_time = max_opt(outcome.wall_time, raw.meta.wall_time);
                    outcome.memory = max_opt(outcome.memory, raw.meta.memory);
                    outcome.cases.push(CaseOutcome {
                        index,
                        status,
                        time: raw.meta.time,
                        wall_time: raw.meta.wall_time,
                        memory: raw.meta.memory,
                        exit_code: raw.meta.exit_code,
                        exit_signal: raw.meta.exit_signal,
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

        // `sandbox` drops here, destroying the box whatever happened above
        Ok(outcome)
    }
}

struct CompileLog {
    success: bool,
    output: Option<String>,
}

struct RawRun {
    meta: MetaFile,
    stdout: String,
    stderr: String,
}

impl RawRun {
    /// Normalizes the meta file into a status. An `XX` (internal sandbox
    /// failure) that is not an exec failure propagates as an error so the
    /// worker records an infrastructure failure.
    fn classify(&self, expected_output: Option<&str>) -> Result<Status> {
        if self.meta.status.as_deref() == Some("XX") {
            let message = self.meta.message.as_deref().unwrap_or("unknown");
            if message.contains("execve") || message.contains("Exec format") {
                return Ok(Status::ExecFormatError);
            }
            bail!("isolate internal failure: {message}");
        }
        if self.meta.oom_killed {
            return Ok(Status::MemoryLimitExceeded);
        }
        if self.meta.status.as_deref() == Some("TO") {
            return Ok(Status::TimeLimitExceeded);
        }
        Ok(status_from_exit(
            self.meta.exit_code,
            self.meta.exit_signal,
            &self.stdout,
            expected_output,
        ))
    }

    fn fill_record_fields(&self, outcome: &mut ExecutionOutcome) {
        outcome.time = self.meta.time;
        outcome.wall_time = self.meta.wall_time;
        outcome.memory = self.meta.memory;
        outcome.exit_code = self.meta.exit_code;
        outcome.exit_signal = self.meta.exit_signal;
        outcome.stdout = Some(self.stdout.clone());
        outcome.stderr = Some(self.stderr.clone());
        outcome.message = self.meta.message.clone();
    }
}

impl IsolateRunner {
    fn setup_cache_directory(id: u8) -> Result<PathBuf> {
        use directories::ProjectDirs;

        let proj_dirs = ProjectDirs::from("", "", "runbox")
            .ok_or_else(|| anyhow!("Unable to find user directory"))?;

        let cache_base_dir = proj_dirs.cache_dir();
        fs::create_dir_all(cache_base_dir)?;
        fs::set_permissions(
            cache_base_dir,
            fs::Permissions::from_mode(CACHE_DIR_PERMISSIONS),
        )?;

        let cache_dir = cache_base_dir.join(id.to_string());
        fs::create_dir_all(&cache_dir)?;

        Ok(cache_dir)
    }

    fn create_run_dir(&self, token: &str) -> Result<PathBuf> {
        let run_dir = self
            .cache_dir
            .join(format!("{}-{token}", Local::now().format("%y%m%d-%H%M%S")));
        fs::create_dir_all(&run_dir)?;
        Ok(run_dir)
    }

    /// Writes the source file into the box, or unpacks the additional-files
    /// archive for project submissions.
    fn inject_sources(
        &self,
        sandbox: &BoxGuard,
        run_dir: &Path,
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
            let archive_path = run_dir.join("archive.zip");
            fs::write(&archive_path, archive)?;

            let output = Command::new("unzip")
                .arg("-o")
                .arg("-q")
                .arg(&archive_path)
                .arg("-d")
                .arg(&sandbox.box_dir)
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
                sandbox.box_dir.join(&language.source_file),
                format!("{}\n", record.source_code),
            )?;
        }
        Ok(())
    }

    fn compile(
        &self,
        sandbox: &BoxGuard,
        run_dir: &Path,
        compile_cmd: &[String],
        record: &ExecutionRecord,
        language: &LanguageConfig,
    ) -> Result<CompileLog> {
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

        let meta_path = run_dir.join("compile.meta");
        let args = [
            "-b".to_string(),
            self.id.to_string(),
            "--cg".to_string(),
            "--run".to_string(),
            format!("--wall-time={COMPILE_TIME_LIMIT}"),
            format!("--cg-mem={COMPILE_MEMORY_LIMIT}"),
            format!("--processes={COMPILE_PROCESSES}"),
            format!("--open-files={COMPILE_OPEN_FILES}"),
            format!("--fsize={COMPILE_FILE_SIZE}"),
            "-E".to_string(),
            "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
            "-M".to_string(),
            meta_path.to_string_lossy().into_owned(),
            "--stderr-to-stdout".to_string(),
            "-o".to_string(),
            "compile_output.txt".to_string(),
            "--silent".to_string(),
            "--".to_string(),
            "/bin/sh".to_string(),
            "-c".to_string(),
            command,
        ];
        Command::new("isolate").args(args).output()?;

        let meta_content = fs::read_to_string(&meta_path)?;
        let meta = parse_meta(&meta_content);
        let output = fs::read_to_string(sandbox.box_dir.join("compile_output.txt")).ok();

        let produced_executable = sandbox.box_dir.join(EXECUTABLE_NAME).exists();
        let success = meta.status.is_none() && meta.exit_code.unwrap_or(0) == 0 && produced_executable;

        Ok(CompileLog { success, output })
    }

    fn build_run_command(&self, record: &ExecutionRecord, language: &LanguageConfig) -> Vec<String> {
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

    fn run_once(
        &self,
        sandbox: &BoxGuard,
        run_dir: &Path,
        index: usize,
        stdin: Option<&str>,
        constraints: &Constraints,
        run_cmd: &[String],
    ) -> Result<RawRun> {
        let stdin_name = format!("{index}.in");
        let stdout_name = format!("{index}.out");
        let stderr_name = format!("{index}.err");
        let meta_path = run_dir.join(format!("{index}.meta"));

        let mut args = vec![
            "-b".to_string(),
            self.id.to_string(),
            "--cg".to_string(),
            "--run".to_string(),
            format!("--time={}", constraints.time_limit),
            // Hard wall-clock ceiling so a worker can never be blocked
            // indefinitely by a runaway process
            format!("--wall-time={:.4}", constraints.wall_time_limit),
            format!("--cg-mem={}", constraints.memory_limit),
            format!("--stack={}", constraints.stack_limit),
            format!("--processes={}", constraints.max_processes),
            format!("--open-files={RUNTIME_OPEN_FILES}"),
            format!("--fsize={RUNTIME_FILE_SIZE}"),
            "-E".to_string(),
            "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
            "-M".to_string(),
            meta_path.to_string_lossy().into_owned(),
            "-o".to_string(),
            stdout_name.clone(),
            "--stderr".to_string(),
            stderr_name.clone(),
            "--silent".to_string(),
        ];
        if constraints.enable_network {
            args.push("--share-net".to_string());
        }
        if let Some(stdin) = stdin {
            fs::write(sandbox.box_dir.join(&stdin_name), stdin)?;
            args.push("-i".to_string());
            args.push(stdin_name);
        }
        args.push("--".to_string());
        args.extend(run_cmd.iter().cloned());

        Command::new("isolate").args(args).output()?;

        let meta_content = fs::read_to_string(&meta_path)
            .map_err(|e| anyhow!("failed to read isolate meta file: {e}"))?;

        Ok(RawRun {
            meta: parse_meta(&meta_content),
            stdout: fs::read_to_string(sandbox.box_dir.join(&stdout_name)).unwrap_or_default(),
            stderr: fs::read_to_string(sandbox.box_dir.join(&stderr_name)).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_meta_parsing() {
        let meta = parse_meta(
            "time:0.012\ntime-wall:0.034\ncg-mem:1824\nexitcode:0\nstatus:TO\nmessage:Time limit exceeded\n",
        );
        assert_eq!(meta.time, Some(0.012));
        assert_eq!(meta.wall_time, Some(0.034));
        assert_eq!(meta.memory, Some(1824));
        assert_eq!(meta.exit_code, Some(0));
        assert_eq!(meta.status.as_deref(), Some("TO"));
        assert_eq!(meta.message.as_deref(), Some("Time limit exceeded"));
    }

    #[test]
    fn test_classification_precedence() {
        let tle = RawRun {
            meta: parse_meta("status:TO\nkilled:1\ntime-wall:2.1\n"),
            stdout: String::new(),
            stderr: String::new(),
        };
        assert_eq!(tle.classify(None).unwrap(), Status::TimeLimitExceeded);

        let mle = RawRun {
            meta: parse_meta("status:SG\nexitsig:9\ncg-oom-killed:1\n"),
            stdout: String::new(),
            stderr: String::new(),
        };
        assert_eq!(mle.classify(None).unwrap(), Status::MemoryLimitExceeded);

        let segv = RawRun {
            meta: parse_meta("status:SG\nexitsig:11\n"),
            stdout: String::new(),
            stderr: String::new(),
        };
        assert_eq!(segv.classify(None).unwrap(), Status::RuntimeSigsegv);

        let nzec = RawRun {
            meta: parse_meta("status:RE\nexitcode:1\n"),
            stdout: String::new(),
            stderr: String::new(),
        };
        assert_eq!(nzec.classify(None).unwrap(), Status::RuntimeNzec);

        let exec_err = RawRun {
            meta: parse_meta("status:XX\nmessage:execve(\"./main\"): No such file or directory\n"),
            stdout: String::new(),
            stderr: String::new(),
        };
        assert_eq!(exec_err.classify(None).unwrap(), Status::ExecFormatError);

        let box_err = RawRun {
            meta: parse_meta("status:XX\nmessage:Cannot mount box\n"),
            stdout: String::new(),
            stderr: String::new(),
        };
        assert!(box_err.classify(None).is_err());
    }

    #[test]
    fn test_wrong_answer_from_meta() {
        let run = RawRun {
            meta: parse_meta("time:0.01\nexitcode:0\n"),
            stdout: "5\n".to_string(),
            stderr: String::new(),
        };
        assert_eq!(run.classify(Some("2")).unwrap(), Status::WrongAnswer);
        assert_eq!(run.classify(Some("5")).unwrap(), Status::Accepted);
    }
}

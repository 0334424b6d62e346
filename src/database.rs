use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};

use crate::progress::Progress;
use crate::record::{Constraints, ExecutionRecord, GradingCase, GradingData};
use crate::status::Status;

const DATABASE_NAME: &str = "runbox.sqlite3";

pub fn get_db_path() -> PathBuf {
    use directories::ProjectDirs;

    let proj_dirs = ProjectDirs::from("", "", "runbox").expect("Unable to find user directory");
    let data_dir = proj_dirs.data_local_dir();

    fs::create_dir_all(data_dir).expect("Failed to create local data dir");

    data_dir.join(DATABASE_NAME)
}

pub async fn init_db(db_path: impl AsRef<Path>) -> sqlx::Result<SqlitePool> {
    let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display()); // rwc = read/write/create
    let db_pool = SqlitePoolOptions::new()
        .max_connections(2)
        .connect(&db_url)
        .await?;

    // PRAGMA statements cannot run inside a transaction
    for pragma_sql in &[
        "PRAGMA foreign_keys = ON;",
        "PRAGMA busy_timeout = 2000;", // 2 seconds timeout for lock contention
        "PRAGMA journal_mode = WAL;",  // Write-Ahead Logging for better concurrency
        "PRAGMA synchronous = NORMAL;",
    ] {
        sqlx::query(pragma_sql).execute(&db_pool).await?;
    }

    let mut tx = db_pool.begin().await?;

    for sql in &[
        r"
        CREATE TABLE IF NOT EXISTS submissions (
            token                   TEXT    PRIMARY KEY,
            kind                    TEXT    NOT NULL,
            problem_id              INTEGER,
            source_code             TEXT    NOT NULL,
            language_id             INTEGER NOT NULL,
            stdin                   TEXT,
            expected_output         TEXT,
            time_limit              REAL    NOT NULL,
            wall_time_limit         REAL    NOT NULL,
            memory_limit            INTEGER NOT NULL,
            stack_limit             INTEGER NOT NULL,
            max_processes           INTEGER NOT NULL,
            enable_network          INTEGER NOT NULL,
            compiler_options        TEXT,
            command_line_arguments  TEXT,
            callback_url            TEXT,
            additional_files        TEXT,
            status                  INTEGER NOT NULL,
            queued_at               TEXT    NOT NULL,
            started_at              TEXT,
            finished_at             TEXT,
            time                    REAL,
            wall_time               REAL,
            memory                  INTEGER,
            exit_code               INTEGER,
            exit_signal             INTEGER,
            stdout                  TEXT,
            stderr                  TEXT,
            compile_output          TEXT,
            message                 TEXT,
            queue_host              TEXT,
            execution_host          TEXT,
            progress_done           INTEGER NOT NULL DEFAULT 0,
            progress_total          INTEGER NOT NULL DEFAULT 0,
            progress_message        TEXT
        );",
        "CREATE INDEX IF NOT EXISTS idx_submissions_queued_at ON submissions(queued_at);",
        "CREATE INDEX IF NOT EXISTS idx_submissions_status ON submissions(status);",
        r"
        CREATE TABLE IF NOT EXISTS grading_case (
            grading_token   TEXT    NOT NULL,
            case_index      INTEGER NOT NULL,
            case_token      TEXT    NOT NULL UNIQUE,
            stdin           TEXT,
            expected_output TEXT    NOT NULL,
            status          INTEGER NOT NULL,
            time            REAL,
            wall_time       REAL,
            memory          INTEGER,
            exit_code       INTEGER,
            exit_signal     INTEGER,
            stdout          TEXT,
            PRIMARY KEY (grading_token, case_index),
            FOREIGN KEY (grading_token) REFERENCES submissions (token)
        );",
    ] {
        sqlx::query(sql).execute(tx.as_mut()).await?;
    }

    tx.commit().await?;

    log::info!("Initialized database at {}", db_path.as_ref().display());

    Ok(db_pool)
}

pub fn remove_db(db_path: impl AsRef<Path>) {
    // WAL and SHM files might not exist, ignore errors
    let wal_path = format!("{}-wal", db_path.as_ref().display());
    let shm_path = format!("{}-shm", db_path.as_ref().display());
    let _ = fs::remove_file(wal_path);
    let _ = fs::remove_file(shm_path);

    if let Err(e) = std::fs::remove_file(&db_path) {
        log::warn!(
            "Unable to remove database at {}: {e}",
            db_path.as_ref().display()
        );
    } else {
        log::info!("Removed database at {}", db_path.as_ref().display());
    }
}

/// Persists a freshly created record (and its grading cases) in one
/// transaction.
pub async fn create_record(record: &ExecutionRecord, pool: Arc<SqlitePool>) -> sqlx::Result<()> {
    let mut tx = pool.begin().await?;

    let kind = if record.is_grading() {
        "grading"
    } else {
        "submission"
    };
    let grading = record.grading.as_ref();

    sqlx::query(
        r#"
        INSERT INTO submissions (
            token, kind, problem_id, source_code, language_id, stdin, expected_output,
            time_limit, wall_time_limit, memory_limit, stack_limit, max_processes,
            enable_network, compiler_options, command_line_arguments, callback_url,
            additional_files, status, queued_at, queue_host, progress_done, progress_total
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
        "#,
    )
    .bind(&record.token)
    .bind(kind)
    .bind(grading.map(|g| g.problem_id))
    .bind(&record.source_code)
    .bind(record.language_id)
    .bind(&record.stdin)
    .bind(&record.expected_output)
    .bind(record.constraints.time_limit)
    .bind(record.constraints.wall_time_limit)
    .bind(record.constraints.memory_limit as i64)
    .bind(record.constraints.stack_limit as i64)
    .bind(record.constraints.max_processes as i64)
    .bind(record.constraints.enable_network as i64)
    .bind(&record.constraints.compiler_options)
    .bind(&record.constraints.command_line_arguments)
    .bind(&record.constraints.callback_url)
    .bind(&record.constraints.additional_files)
    .bind(record.status.id())
    .bind(&record.queued_at)
    .bind(&record.queue_host)
    .bind(grading.map_or(0, |g| g.cases.len() as i64))
    .execute(tx.as_mut())
    .await?;

    if let Some(grading) = grading {
        for (index, case) in grading.cases.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO grading_case (grading_token, case_index, case_token, stdin, expected_output, status)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.token)
            .bind(index as i64)
            .bind(&case.token)
            .bind(&case.stdin)
            .bind(&case.expected_output)
            .bind(case.status.id())
            .execute(tx.as_mut())
            .await?;
        }
    }

    tx.commit().await?;
    Ok(())
}

fn status_from_row(row: &SqliteRow, column: &str) -> sqlx::Result<Status> {
    let id: i64 = row.try_get(column)?;
    Status::from_id(id).ok_or_else(|| sqlx::Error::Decode(format!("unknown status id {id}").into()))
}

fn record_from_row(row: &SqliteRow) -> sqlx::Result<ExecutionRecord> {
    Ok(ExecutionRecord {
        token: row.try_get("token")?,
        source_code: row.try_get("source_code")?,
        language_id: row.try_get("language_id")?,
        stdin: row.try_get("stdin")?,
        expected_output: row.try_get("expected_output")?,
        constraints: Constraints {
            time_limit: row.try_get("time_limit")?,
            wall_time_limit: row.try_get("wall_time_limit")?,
            memory_limit: row.try_get::<i64, _>("memory_limit")? as u64,
            stack_limit: row.try_get::<i64, _>("stack_limit")? as u64,
            max_processes: row.try_get::<i64, _>("max_processes")? as u64,
            enable_network: row.try_get::<i64, _>("enable_network")? != 0,
            compiler_options: row.try_get("compiler_options")?,
            command_line_arguments: row.try_get("command_line_arguments")?,
            callback_url: row.try_get("callback_url")?,
            additional_files: row.try_get("additional_files")?,
        },
        status: status_from_row(row, "status")?,
        queued_at: row.try_get("queued_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        time: row.try_get("time")?,
        wall_time: row.try_get("wall_time")?,
        memory: row.try_get::<Option<i64>, _>("memory")?.map(|m| m as u64),
        exit_code: row.try_get("exit_code")?,
        exit_signal: row.try_get("exit_signal")?,
        stdout: row.try_get("stdout")?,
        stderr: row.try_get("stderr")?,
        compile_output: row.try_get("compile_output")?,
        message: row.try_get("message")?,
        queue_host: row.try_get("queue_host")?,
        execution_host: row.try_get("execution_host")?,
        grading: None,
    })
}

/// Fetches the full record for a token, grading cases included. Returns
/// `sqlx::Error::RowNotFound` for an unknown token.
pub async fn fetch_record(token: &str, pool: Arc<SqlitePool>) -> sqlx::Result<ExecutionRecord> {
    let row = sqlx::query("SELECT * FROM submissions WHERE token = ?")
        .bind(token)
        .fetch_one(pool.as_ref())
        .await?;

    let mut record = record_from_row(&row)?;

    let kind: String = row.try_get("kind")?;
    if kind == "grading" {
        let case_rows = sqlx::query(
            r#"
            SELECT case_token, stdin, expected_output, status, time, wall_time,
                   memory, exit_code, exit_signal, stdout
            FROM grading_case
            WHERE grading_token = ?
            ORDER BY case_index
            "#,
        )
        .bind(token)
        .fetch_all(pool.as_ref())
        .await?;

        let mut cases = Vec::with_capacity(case_rows.len());
        for case_row in &case_rows {
            cases.push(GradingCase {
                token: case_row.try_get("case_token")?,
                stdin: case_row.try_get("stdin")?,
                expected_output: case_row.try_get("expected_output")?,
                status: status_from_row(case_row, "status")?,
                time: case_row.try_get("time")?,
                wall_time: case_row.try_get("wall_time")?,
                memory: case_row
                    .try_get::<Option<i64>, _>("memory")?
                    .map(|m| m as u64),
                exit_code: case_row.try_get("exit_code")?,
                exit_signal: case_row.try_get("exit_signal")?,
                stdout: case_row.try_get("stdout")?,
            });
        }

        let mut progress = Progress::new(row.try_get::<i64, _>("progress_total")? as u64);
        progress.update(row.try_get::<i64, _>("progress_done")? as u64, progress.total);
        if let Some(message) = row.try_get::<Option<String>, _>("progress_message")? {
            progress.record_error(message);
        }

        record.grading = Some(GradingData {
            problem_id: row.try_get::<Option<i64>, _>("problem_id")?.unwrap_or(0),
            cases,
            progress,
        });
    }

    Ok(record)
}

/// Moves a queued record to the processing state, setting `started_at` and
/// the executing host. The guarded update succeeds for exactly one caller, so
/// two workers can never own the same token.
pub async fn claim_for_processing(
    token: &str,
    host: &str,
    pool: Arc<SqlitePool>,
) -> sqlx::Result<bool> {
    let now = crate::create_timestamp();
    let result = sqlx::query(
        r#"
        UPDATE submissions
        SET status = ?, started_at = ?, execution_host = ?
        WHERE token = ? AND status = ?
        "#,
    )
    .bind(Status::Processing.id())
    .bind(&now)
    .bind(host)
    .bind(token)
    .bind(Status::InQueue.id())
    .execute(pool.as_ref())
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Writes the terminal outcome of a run. The caller stamps `finished_at`;
/// the `finished_at IS NULL` guard makes the terminal state write-once and
/// the MAX guard keeps `progress_done` monotonic even when the caller's
/// in-memory counters lag behind the streamed progress updates.
pub async fn save_result(record: &ExecutionRecord, pool: Arc<SqlitePool>) -> sqlx::Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        UPDATE submissions
        SET status = ?, finished_at = ?, time = ?, wall_time = ?, memory = ?,
            exit_code = ?, exit_signal = ?, stdout = ?, stderr = ?,
            compile_output = ?, message = ?,
            progress_done = MAX(progress_done, ?), progress_total = ?,
            progress_message = ?
        WHERE token = ? AND finished_at IS NULL
        "#,
    )
    .bind(record.status.id())
    .bind(&record.finished_at)
    .bind(record.time)
    .bind(record.wall_time)
    .bind(record.memory.map(|m| m as i64))
    .bind(record.exit_code)
    .bind(record.exit_signal)
    .bind(&record.stdout)
    .bind(&record.stderr)
    .bind(&record.compile_output)
    .bind(&record.message)
    .bind(record.grading.as_ref().map_or(0, |g| g.progress.done as i64))
    .bind(record.grading.as_ref().map_or(0, |g| g.progress.total as i64))
    .bind(record.grading.as_ref().and_then(|g| g.progress.message.clone()))
    .bind(&record.token)
    .execute(tx.as_mut())
    .await?;

    if let Some(grading) = &record.grading {
        for case in &grading.cases {
            sqlx::query(
                r#"
                UPDATE grading_case
                SET status = ?, time = ?, wall_time = ?, memory = ?,
                    exit_code = ?, exit_signal = ?, stdout = ?
                WHERE case_token = ?
                "#,
            )
            .bind(case.status.id())
            .bind(case.time)
            .bind(case.wall_time)
            .bind(case.memory.map(|m| m as i64))
            .bind(case.exit_code)
            .bind(case.exit_signal)
            .bind(&case.stdout)
            .bind(&case.token)
            .execute(tx.as_mut())
            .await?;
        }
    }

    tx.commit().await?;
    Ok(())
}

/// Advances the per-test-case counters of a processing grading run. The MAX
/// guard keeps the persisted counter monotonic even with stale updates.
pub async fn update_progress(
    token: &str,
    done: u64,
    total: u64,
    pool: Arc<SqlitePool>,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        UPDATE submissions
        SET progress_done = MAX(progress_done, ?), progress_total = ?
        WHERE token = ? AND status = ?
        "#,
    )
    .bind(done as i64)
    .bind(total as i64)
    .bind(token)
    .bind(Status::Processing.id())
    .execute(pool.as_ref())
    .await?;

    Ok(())
}

/// Removes a record that never made it into the queue. Admission control
/// uses this to roll back the insert when the queue rejects the job.
pub async fn discard_record(token: &str, pool: Arc<SqlitePool>) -> sqlx::Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM grading_case WHERE grading_token = ?")
        .bind(token)
        .execute(tx.as_mut())
        .await?;
    sqlx::query("DELETE FROM submissions WHERE token = ?")
        .bind(token)
        .execute(tx.as_mut())
        .await?;
    tx.commit().await?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotTerminal,
    NotFound,
}

/// Deletes a record, but only once it has reached a terminal state; queued
/// and processing records are owned by the pipeline and must not disappear
/// under it.
pub async fn delete_terminal(token: &str, pool: Arc<SqlitePool>) -> sqlx::Result<DeleteOutcome> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query("SELECT status FROM submissions WHERE token = ?")
        .bind(token)
        .fetch_optional(tx.as_mut())
        .await?;

    let Some(row) = row else {
        return Ok(DeleteOutcome::NotFound);
    };

    if !status_from_row(&row, "status")?.is_terminal() {
        return Ok(DeleteOutcome::NotTerminal);
    }

    sqlx::query("DELETE FROM grading_case WHERE grading_token = ?")
        .bind(token)
        .execute(tx.as_mut())
        .await?;
    sqlx::query("DELETE FROM submissions WHERE token = ?")
        .bind(token)
        .execute(tx.as_mut())
        .await?;

    tx.commit().await?;
    Ok(DeleteOutcome::Deleted)
}

/// Record counts per status id, for the health/monitoring surface.
pub async fn status_counts(pool: Arc<SqlitePool>) -> sqlx::Result<Vec<(i64, i64)>> {
    let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM submissions GROUP BY status")
        .fetch_all(pool.as_ref())
        .await?;

    rows.iter()
        .map(|row| Ok((row.try_get("status")?, row.try_get("count")?)))
        .collect()
}

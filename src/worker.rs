use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, LanguageConfig};
use crate::database as db;
use crate::queue::JobQueue;
use crate::record::ExecutionRecord;
use crate::routes::JobMessage;
use crate::routes::submissions::{grading_payload, record_response, submission_payload};
use crate::sandbox::{ExecutionOutcome, ProgressUpdate, SandboxRunner, create_sandbox_runner};
use crate::status::Status;
use crate::webhook::WebhookDispatcher;

const DISPATCH_ATTEMPTS: u32 = 3;
const DISPATCH_RETRY_DELAY: Duration = Duration::from_millis(500);

pub async fn worker(
    id: u8,
    config: Arc<Config>,
    db_pool: Arc<SqlitePool>,
    queue: Arc<JobQueue>,
    webhooks: Arc<WebhookDispatcher>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let sandbox: Arc<Box<dyn SandboxRunner>> = Arc::new(create_sandbox_runner(id)?);
    log::info!("Worker {id} initialized");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("Worker {id} received shutdown signal, stopping");
                break;
            }

            job_message = queue.pop() => {
                let token = job_message.token().to_string();

                // 1. Get the full record from the store
                let mut record = match db::fetch_record(&token, db_pool.clone()).await {
                    Ok(record) => record,
                    Err(e) => {
                        log::error!("Failed to fetch record {token}, discarded: {e}");
                        queue.mark_finished(false);
                        continue;
                    }
                };
                log::info!("Worker {id} got record {token} from queue");

                // 2. Claim it. The guarded update succeeds for exactly one
                // worker; losing the race means another worker owns it.
                match db::claim_for_processing(&token, &crate::hostname(), db_pool.clone()).await {
                    Ok(true) => record.status = Status::Processing,
                    Ok(false) => {
                        log::warn!("Record {token} was already claimed, worker {id} skipping");
                        queue.mark_finished(false);
                        continue;
                    }
                    Err(e) => {
                        log::error!("Failed to claim record {token}: {e}");
                        queue.mark_finished(false);
                        continue;
                    }
                }

                // 3. Run the engine, then persist a terminal result no matter
                // what happened. A record never stays in the processing state.
                let result = execute(id, &sandbox, &record, &config, db_pool.clone()).await;
                match result {
                    Ok(outcome) => {
                        apply_outcome(&mut record, outcome);
                        log::info!(
                            "Record {token} finished on worker {id}: {}",
                            record.status
                        );
                    }
                    Err(e) => {
                        log::error!("Engine failed for record {token} on worker {id}: {e:#}");
                        record.status = Status::BoxError;
                        record.message = Some(format!("execution failed: {e:#}"));
                        if let Some(grading) = &mut record.grading {
                            grading.progress.record_error("execution failed");
                        }
                    }
                }

                record.finished_at = Some(crate::create_timestamp());
                if let Err(e) = db::save_result(&record, db_pool.clone()).await {
                    log::error!("Failed to save result for record {token}: {e}");
                }
                queue.mark_finished(record.status != Status::BoxError);

                if let JobMessage::Blocking { responder, base64_encoded, .. } = job_message {
                    if responder.send(record_response(&record, base64_encoded)).is_err() {
                        log::warn!("Failed to send blocking result for {token} back to server");
                    }
                }

                let convert = if record.is_grading() {
                    grading_payload
                } else {
                    submission_payload
                };
                webhooks.dispatch(&record, convert);
            }
        };
    }

    log::info!("Worker {id} has shut down gracefully");
    Ok(())
}

/// Runs the engine on the blocking pool, retrying infrastructure failures up
/// to the dispatch bound. Grading progress streams back over a channel and is
/// written to the store as the cases finish.
async fn execute(
    id: u8,
    sandbox: &Arc<Box<dyn SandboxRunner>>,
    record: &ExecutionRecord,
    config: &Config,
    db_pool: Arc<SqlitePool>,
) -> anyhow::Result<ExecutionOutcome> {
    let language = config
        .languages
        .iter()
        .find(|l| l.id == record.language_id)
        .cloned()
        .ok_or_else(|| anyhow!("no language configured with id {}", record.language_id))?;

    let progress_tx = record
        .is_grading()
        .then(|| spawn_progress_drain(record.token.clone(), db_pool));

    let mut last_error = anyhow!("engine never ran");
    for attempt in 1..=DISPATCH_ATTEMPTS {
        match run_blocking(sandbox, record, &language, progress_tx.clone()).await {
            Ok(outcome) => return Ok(outcome),
            Err(e) => {
                log::warn!(
                    "Engine attempt {attempt}/{DISPATCH_ATTEMPTS} for record {} failed on worker {id}: {e:#}",
                    record.token
                );
                last_error = e;
                if attempt < DISPATCH_ATTEMPTS {
                    tokio::time::sleep(DISPATCH_RETRY_DELAY).await;
                }
            }
        }
    }

    Err(last_error)
}

async fn run_blocking(
    sandbox: &Arc<Box<dyn SandboxRunner>>,
    record: &ExecutionRecord,
    language: &LanguageConfig,
    progress_tx: Option<mpsc::UnboundedSender<ProgressUpdate>>,
) -> anyhow::Result<ExecutionOutcome> {
    let sandbox = Arc::clone(sandbox);
    let record = record.clone();
    let language = language.clone();

    let handle = tokio::task::spawn_blocking(move || {
        sandbox.run(&record, &language, progress_tx)
    });
    handle.await?
}

fn spawn_progress_drain(
    token: String,
    db_pool: Arc<SqlitePool>,
) -> mpsc::UnboundedSender<ProgressUpdate> {
    let (tx, mut rx) = mpsc::unbounded_channel::<ProgressUpdate>();
    tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            if let Err(e) =
                db::update_progress(&token, update.done, update.total, db_pool.clone()).await
            {
                log::warn!("Failed to persist progress for record {token}: {e}");
            }
        }
    });
    tx
}

/// Merges an engine outcome into the record, including per-case results and
/// the final progress counters of a grading run.
fn apply_outcome(record: &mut ExecutionRecord, outcome: ExecutionOutcome) {
    record.status = outcome.status();
    record.time = outcome.time;
    record.wall_time = outcome.wall_time;
    record.memory = outcome.memory;
    record.exit_code = outcome.exit_code;
    record.exit_signal = outcome.exit_signal;
    record.stdout = outcome.stdout;
    record.stderr = outcome.stderr;
    record.compile_output = outcome.compile_output;
    record.message = outcome.message;

    if let Some(grading) = &mut record.grading {
        let total = grading.cases.len() as u64;
        let done = outcome.cases.len() as u64;

        for case_outcome in outcome.cases {
            let Some(case) = grading.cases.get_mut(case_outcome.index) else {
                continue;
            };
            case.status = case_outcome.status;
            case.time = case_outcome.time;
            case.wall_time = case_outcome.wall_time;
            case.memory = case_outcome.memory;
            case.exit_code = case_outcome.exit_code;
            case.exit_signal = case_outcome.exit_signal;
            case.stdout = case_outcome.stdout;
        }

        // A compile failure finishes the record before any case ran, so the
        // counters reflect only the cases that actually produced outcomes.
        if done == total {
            grading.progress.complete();
        } else {
            grading.progress.update(done, total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;
    use crate::record::{Constraints, SubmissionRequest};
    use crate::sandbox::CaseOutcome;
    use pretty_assertions::assert_eq;

    fn grading_record() -> ExecutionRecord {
        let req: SubmissionRequest = serde_json::from_str(
            r#"{
                "source_code": "x",
                "language_id": 1,
                "test_cases": [
                    { "expected_output": "1" },
                    { "expected_output": "2" }
                ]
            }"#,
        )
        .unwrap();
        let constraints = Constraints::from_request(&req, &LimitsConfig::default());
        ExecutionRecord::new(&req, constraints, Some(9))
    }

    #[test]
    fn test_apply_outcome_merges_cases_and_completes_progress() {
        let mut record = grading_record();
        let outcome = ExecutionOutcome {
            status: Some(Status::WrongAnswer),
            wall_time: Some(0.4),
            cases: vec![
                CaseOutcome {
                    index: 0,
                    status: Status::Accepted,
                    time: Some(0.1),
                    wall_time: Some(0.2),
                    memory: Some(1024),
                    exit_code: Some(0),
                    exit_signal: None,
                    stdout: Some("1\n".to_string()),
                },
                CaseOutcome {
                    index: 1,
                    status: Status::WrongAnswer,
                    time: Some(0.1),
                    wall_time: Some(0.2),
                    memory: Some(1024),
                    exit_code: Some(0),
                    exit_signal: None,
                    stdout: Some("3\n".to_string()),
                },
            ],
            ..Default::default()
        };

        apply_outcome(&mut record, outcome);

        assert_eq!(record.status, Status::WrongAnswer);
        let grading = record.grading.as_ref().unwrap();
        assert_eq!(grading.cases[0].status, Status::Accepted);
        assert_eq!(grading.cases[1].stdout.as_deref(), Some("3\n"));
        assert_eq!(grading.progress.done, 2);
        assert_eq!(grading.progress.total, 2);
    }

    #[test]
    fn test_apply_outcome_compile_failure_leaves_counters() {
        let mut record = grading_record();
        let outcome = ExecutionOutcome {
            status: Some(Status::CompilationError),
            compile_output: Some("error: expected `;`".to_string()),
            ..Default::default()
        };

        apply_outcome(&mut record, outcome);

        assert_eq!(record.status, Status::CompilationError);
        let grading = record.grading.as_ref().unwrap();
        assert_eq!(grading.progress.done, 0);
        assert_eq!(grading.progress.total, 2);
    }
}

mod delete;
mod get;
mod post;

pub use delete::delete_submission_handler;
pub use get::get_submission_handler;
pub use post::{post_grading_handler, post_submission_handler};

use actix_web::{HttpResponse, Responder, delete, get, post, web};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::json;
use sqlx::sqlite::SqlitePool;
use tokio::sync::oneshot;

use super::{ErrorResponse, ErrorResponseWithMessage, ValidationResponse};
use crate::config::Config;
use crate::database as db;
use crate::queue::JobQueue;
use crate::record::ExecutionRecord;

/// Handoff from the HTTP layer to the worker pool. Only the token travels
/// through the queue; workers fetch the full record from the store.
pub enum JobMessage {
    FireAndForget {
        token: String,
    },
    Blocking {
        token: String,
        /// The caller's transport-encoding choice, applied to the result
        /// the worker sends back
        base64_encoded: bool,
        responder: oneshot::Sender<serde_json::Value>,
    },
}

impl JobMessage {
    pub fn token(&self) -> &str {
        match self {
            Self::FireAndForget { token } => token,
            Self::Blocking { token, .. } => token,
        }
    }
}

#[derive(Deserialize)]
pub struct QueryFlags {
    #[serde(default)]
    pub wait: bool,
    #[serde(default)]
    pub base64_encoded: bool,
}

fn encode_text(text: &Option<String>, base64_encoded: bool) -> Option<String> {
    text.as_ref().map(|t| {
        if base64_encoded {
            BASE64.encode(t.as_bytes())
        } else {
            t.clone()
        }
    })
}

/// The externally visible shape of a record, shared by GET responses and the
/// blocking wait mode.
pub fn record_response(record: &ExecutionRecord, base64_encoded: bool) -> serde_json::Value {
    let mut body = json!({
        "token": record.token,
        "status": record.status,
        "language_id": record.language_id,
        "time": record.time,
        "wall_time": record.wall_time,
        "memory": record.memory,
        "exit_code": record.exit_code,
        "exit_signal": record.exit_signal,
        "stdout": encode_text(&record.stdout, base64_encoded),
        "stderr": encode_text(&record.stderr, base64_encoded),
        "compile_output": encode_text(&record.compile_output, base64_encoded),
        "message": record.message,
        "queued_at": record.queued_at,
        "started_at": record.started_at,
        "finished_at": record.finished_at,
        "queue_host": record.queue_host,
        "execution_host": record.execution_host,
    });

    if let Some(grading) = &record.grading {
        body["problem_id"] = json!(grading.problem_id);
        body["progress"] = json!({
            "done": grading.progress.done,
            "total": grading.progress.total,
            "percentage": grading.progress.percentage(),
            "message": grading.progress.message,
        });
        body["test_cases"] = grading
            .cases
            .iter()
            .map(|case| {
                json!({
                    "token": case.token,
                    "status": case.status,
                    "time": case.time,
                    "wall_time": case.wall_time,
                    "memory": case.memory,
                    "exit_code": case.exit_code,
                    "exit_signal": case.exit_signal,
                    "stdout": encode_text(&case.stdout, base64_encoded),
                })
            })
            .collect();
    }

    body
}

/// Callback payload for a plain submission.
pub fn submission_payload(record: &ExecutionRecord) -> serde_json::Value {
    json!({
        "token": record.token,
        "status": record.status,
        "time": record.time,
        "wall_time": record.wall_time,
        "memory": record.memory,
        "exit_code": record.exit_code,
        "exit_signal": record.exit_signal,
        "stdout": record.stdout,
        "stderr": record.stderr,
        "compile_output": record.compile_output,
        "message": record.message,
        "finished_at": record.finished_at,
    })
}

/// Callback payload for a grading run: the per-case verdicts plus the final
/// progress counters, without the bulky output fields.
pub fn grading_payload(record: &ExecutionRecord) -> serde_json::Value {
    let Some(grading) = &record.grading else {
        return submission_payload(record);
    };

    json!({
        "token": record.token,
        "problem_id": grading.problem_id,
        "status": record.status,
        "compile_output": record.compile_output,
        "message": record.message,
        "finished_at": record.finished_at,
        "progress": {
            "done": grading.progress.done,
            "total": grading.progress.total,
            "percentage": grading.progress.percentage(),
        },
        "test_cases": grading
            .cases
            .iter()
            .map(|case| {
                json!({
                    "token": case.token,
                    "status": case.status,
                    "time": case.time,
                    "wall_time": case.wall_time,
                    "memory": case.memory,
                })
            })
            .collect::<Vec<_>>(),
    })
}

use super::*;

use crate::record::{Constraints, SubmissionRequest};
use crate::validator;

#[post("/submissions")]
pub async fn post_submission_handler(
    queue: web::Data<JobQueue>,
    pool: web::Data<SqlitePool>,
    config: web::Data<Config>,
    flags: web::Query<QueryFlags>,
    body: web::Json<SubmissionRequest>,
) -> impl Responder {
    submit(queue, pool, config, flags, body.into_inner(), None).await
}

#[post("/grading/{problem_id}")]
pub async fn post_grading_handler(
    queue: web::Data<JobQueue>,
    pool: web::Data<SqlitePool>,
    config: web::Data<Config>,
    path: web::Path<i64>,
    flags: web::Query<QueryFlags>,
    body: web::Json<SubmissionRequest>,
) -> impl Responder {
    let problem_id = path.into_inner();
    submit(queue, pool, config, flags, body.into_inner(), Some(problem_id)).await
}

async fn submit(
    queue: web::Data<JobQueue>,
    pool: web::Data<SqlitePool>,
    config: web::Data<Config>,
    flags: web::Query<QueryFlags>,
    mut request: SubmissionRequest,
    problem_id: Option<i64>,
) -> HttpResponse {
    if config.features.maintenance_mode {
        return HttpResponse::ServiceUnavailable().json(ErrorResponse {
            error: "service is in maintenance mode",
        });
    }
    if queue.is_full() {
        return HttpResponse::ServiceUnavailable().json(ErrorResponse {
            error: "queue is full",
        });
    }

    if flags.base64_encoded && !request.source_code.is_empty() {
        match BASE64.decode(request.source_code.trim().as_bytes()) {
            Ok(decoded) => match String::from_utf8(decoded) {
                Ok(source) => request.source_code = source,
                Err(_) => {
                    return HttpResponse::UnprocessableEntity().json(ErrorResponseWithMessage {
                        error: "invalid request",
                        message: "source_code is not valid UTF-8".to_string(),
                    });
                }
            },
            Err(_) => {
                return HttpResponse::UnprocessableEntity().json(ErrorResponseWithMessage {
                    error: "invalid request",
                    message: "source_code is not valid base64".to_string(),
                });
            }
        }
    }

    let violations = validator::validate(
        &request,
        &config.languages,
        &config.features,
        problem_id.is_some(),
    );
    if !violations.is_empty() {
        return HttpResponse::UnprocessableEntity().json(ValidationResponse::new(violations));
    }

    let constraints = Constraints::from_request(&request, &config.limits);
    let record = ExecutionRecord::new(&request, constraints, problem_id);
    let token = record.token.clone();

    if let Err(e) = db::create_record(&record, pool.clone().into_inner()).await {
        log::error!("Failed to insert record {token}: {e}");
        return HttpResponse::InternalServerError().json(ErrorResponse {
            error: "failed to persist submission",
        });
    }
    log::info!("Inserted record {token} into database");

    if flags.wait {
        if !config.features.enable_wait {
            db::discard_record(&token, pool.clone().into_inner())
                .await
                .unwrap_or_else(|e| log::error!("Failed to roll back record {token}: {e}"));
            return HttpResponse::BadRequest().json(ErrorResponse {
                error: "wait is not allowed",
            });
        }

        let (tx, rx) = oneshot::channel();
        let message = JobMessage::Blocking {
            token: token.clone(),
            base64_encoded: flags.base64_encoded,
            responder: tx,
        };
        if !admit(&queue, &pool, message).await {
            return queue_full_rollback(&token).await;
        }
        log::debug!("Sent blocking record {token} to queue");

        match rx.await {
            Ok(response) => {
                log::info!("Received final result of blocking record {token}");
                HttpResponse::Ok().json(response)
            }
            Err(e) => {
                log::error!("Failed to receive result for record {token}: {e}");
                HttpResponse::InternalServerError().json(ErrorResponse {
                    error: "worker dropped the submission",
                })
            }
        }
    } else {
        let message = JobMessage::FireAndForget {
            token: token.clone(),
        };
        if !admit(&queue, &pool, message).await {
            return queue_full_rollback(&token).await;
        }
        log::debug!("Sent record {token} to queue");

        HttpResponse::Created().json(serde_json::json!({ "token": token }))
    }
}

/// Tries to admit the message, rolling back the freshly inserted record when
/// the queue rejects it so no orphaned queued row remains.
async fn admit(queue: &web::Data<JobQueue>, pool: &web::Data<SqlitePool>, message: JobMessage) -> bool {
    let token = message.token().to_string();
    if queue.try_push(message).await.is_err() {
        db::discard_record(&token, pool.clone().into_inner())
            .await
            .unwrap_or_else(|e| log::error!("Failed to roll back record {token}: {e}"));
        return false;
    }
    true
}

async fn queue_full_rollback(token: &str) -> HttpResponse {
    log::warn!("Queue rejected record {token}, insert rolled back");
    HttpResponse::ServiceUnavailable().json(ErrorResponse {
        error: "queue is full",
    })
}

use actix_web::{HttpResponse, Responder, get, web};
use serde_json::json;
use sqlx::sqlite::SqlitePool;

use super::ErrorResponse;
use crate::database as db;
use crate::queue::JobQueue;
use crate::status::Status;

#[get("/workers")]
pub async fn get_workers_handler(
    queue: web::Data<JobQueue>,
    pool: web::Data<SqlitePool>,
) -> impl Responder {
    let snapshot = queue.snapshot();

    let counts = match db::status_counts(pool.into_inner()).await {
        Ok(counts) => counts,
        Err(e) => {
            log::error!("Failed to read status counts: {e}");
            return HttpResponse::InternalServerError().json(ErrorResponse {
                error: "failed to load worker statistics",
            });
        }
    };

    let records: Vec<_> = counts
        .into_iter()
        .map(|(id, count)| {
            json!({
                "status": Status::from_id(id),
                "count": count,
            })
        })
        .collect();

    HttpResponse::Ok().json(json!({
        "queue": snapshot,
        "active_sandboxes": snapshot.processing,
        "records": records,
    }))
}

#[get("/health")]
pub async fn get_health_handler(queue: web::Data<JobQueue>) -> impl Responder {
    let snapshot = queue.snapshot();
    let healthy = snapshot.depth < snapshot.max_size;

    HttpResponse::Ok().json(json!({
        "status": if healthy { "ok" } else { "full" },
        "queue_depth": snapshot.depth,
        "queue_max": snapshot.max_size,
        "processing": snapshot.processing,
    }))
}

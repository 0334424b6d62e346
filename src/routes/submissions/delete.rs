use super::*;

use crate::database::DeleteOutcome;

#[delete("/submissions/{token}")]
pub async fn delete_submission_handler(
    pool: web::Data<SqlitePool>,
    config: web::Data<Config>,
    path: web::Path<String>,
) -> impl Responder {
    if !config.features.enable_delete {
        return HttpResponse::BadRequest().json(ErrorResponse {
            error: "deleting submissions is not allowed",
        });
    }

    let token = path.into_inner();
    match db::delete_terminal(&token, pool.into_inner()).await {
        Ok(DeleteOutcome::Deleted) => {
            log::info!("Deleted record {token}");
            HttpResponse::Ok().json(serde_json::json!({ "token": token }))
        }
        Ok(DeleteOutcome::NotTerminal) => HttpResponse::BadRequest().json(ErrorResponse {
            error: "submission has not finished",
        }),
        Ok(DeleteOutcome::NotFound) => HttpResponse::NotFound().json(ErrorResponse {
            error: "submission not found",
        }),
        Err(e) => {
            log::error!("Failed to delete record {token}: {e}");
            HttpResponse::InternalServerError().json(ErrorResponse {
                error: "failed to delete submission",
            })
        }
    }
}

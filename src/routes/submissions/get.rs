use super::*;

#[get("/submissions/{token}")]
pub async fn get_submission_handler(
    pool: web::Data<SqlitePool>,
    path: web::Path<String>,
    flags: web::Query<QueryFlags>,
) -> impl Responder {
    let token = path.into_inner();

    match db::fetch_record(&token, pool.into_inner()).await {
        Ok(record) => HttpResponse::Ok().json(record_response(&record, flags.base64_encoded)),
        Err(sqlx::Error::RowNotFound) => HttpResponse::NotFound().json(ErrorResponse {
            error: "submission not found",
        }),
        Err(e) => {
            log::error!("Failed to fetch record {token}: {e}");
            HttpResponse::InternalServerError().json(ErrorResponse {
                error: "failed to load submission",
            })
        }
    }
}

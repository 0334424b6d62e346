pub mod submissions;
mod workers;

pub use submissions::JobMessage;
pub use workers::{get_health_handler, get_workers_handler};

use actix_web::error::{InternalError, JsonPayloadError, QueryPayloadError};
use actix_web::{HttpRequest, HttpResponse};
use serde::Serialize;

use crate::validator::Violation;

#[derive(Serialize)]
pub(crate) struct ErrorResponse {
    pub error: &'static str,
}

#[derive(Serialize)]
pub(crate) struct ErrorResponseWithMessage {
    pub error: &'static str,
    pub message: String,
}

#[derive(Serialize)]
pub(crate) struct ValidationResponse {
    pub error: &'static str,
    pub violations: Vec<Violation>,
}

impl ValidationResponse {
    pub fn new(violations: Vec<Violation>) -> Self {
        Self {
            error: "validation failed",
            violations,
        }
    }
}

pub fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = HttpResponse::BadRequest().json(ErrorResponseWithMessage {
        error: "invalid request body",
        message: err.to_string(),
    });
    InternalError::from_response(err, response).into()
}

pub fn query_error_handler(err: QueryPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = HttpResponse::BadRequest().json(ErrorResponseWithMessage {
        error: "invalid query parameters",
        message: err.to_string(),
    });
    InternalError::from_response(err, response).into()
}

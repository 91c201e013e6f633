// Errors surfaced by the HTTP layer
use actix_web::error::BlockingError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

/// Every variant maps to a plain-text 500; callers get no structured error body.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("malformed request body: {0}")]
    MalformedBody(String),

    #[error("generation failed: {0:#}")]
    Generation(#[from] anyhow::Error),

    #[error("generation task did not complete: {0}")]
    Blocking(#[from] BlockingError),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }

    fn error_response(&self) -> HttpResponse {
        log::error!("{}", self);
        let body = match self {
            ApiError::MalformedBody(_) => "Failed to parse request body",
            ApiError::Generation(_) | ApiError::Blocking(_) => "Failed to generate text",
        };
        HttpResponse::build(self.status_code()).body(body)
    }
}

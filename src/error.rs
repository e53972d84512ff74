use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Pin not found: {0}")]
    NotFoundPin(String),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("GPIO is inaccessible: {0}")]
    Inaccessible(String),
    #[error("Pin {pin} is inaccessible: {reason}")]
    Acquire { pin: u8, reason: String },
    #[error("Interrupt handler failed on pin {pin}: {reason}")]
    Interrupt { pin: u8, reason: String },
    #[error("Refresh engine is not running")]
    EngineStopped,
    #[error("GPIO error: {0}")]
    Gpio(String),
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFoundPin(_) => StatusCode::NOT_FOUND,
            AppError::InvalidValue(_) | AppError::Config(_) => StatusCode::BAD_REQUEST,
            AppError::Inaccessible(_) | AppError::EngineStopped => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Acquire { .. } | AppError::Interrupt { .. } | AppError::Gpio(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}

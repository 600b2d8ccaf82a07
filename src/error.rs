//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - **Domain errors** (`PipelineError`, `ModelError`): raised by the audio
//!   pipeline and the acoustic models. They carry enough detail to log but
//!   say nothing about HTTP.
//! - **`AppError`**: what request handlers return. Implements
//!   `ResponseError`, so actix turns it into a JSON error body.
//!
//! ## Propagation policy:
//! - Staging, transcoding and denoising failures abort the request
//!   (`PipelineError` → 500).
//! - Model load failures disable one handler (`ModelError::Load`, recorded).
//! - Model inference failures become a null transcription
//!   (`ModelError::Inference`, logged and swallowed).

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Fatal failures of the per-request audio pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The external transcoder exited non-zero or could not be launched.
    #[error("audio conversion failed: {0}")]
    Conversion(String),

    /// The decoded waveform had no samples, or every sample was zero.
    #[error("audio contains no signal: {0}")]
    EmptyAudio(String),

    /// The canonical WAV could not be decoded or written.
    #[error("audio decode failed: {0}")]
    Decode(String),

    #[error("scratch file error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking worker panicked or was cancelled.
    #[error("worker task failed: {0}")]
    Worker(String),
}

impl From<hound::Error> for PipelineError {
    fn from(err: hound::Error) -> Self {
        match err {
            hound::Error::IoError(io) => PipelineError::Io(io),
            other => PipelineError::Decode(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(err: tokio::task::JoinError) -> Self {
        PipelineError::Worker(err.to_string())
    }
}

/// Failures of an acoustic model.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// Weights, tokenizer or configuration could not be fetched or built.
    #[error("failed to load model {model_id}: {message}")]
    Load { model_id: String, message: String },

    /// The forward pass or token decoding failed for one request.
    #[error("inference failed on {model_id}: {message}")]
    Inference { model_id: String, message: String },
}

/// HTTP-facing error types.
///
/// ## Error Categories:
/// - **Internal**: server-side problems (500)
/// - **BadRequest**: client sent an unusable upload or form (400)
/// - **NotFound**: requested resource doesn't exist (404)
/// - **ConfigError**: configuration problems (500)
/// - **ValidationError**: form fields failed validation (400)
/// - **PayloadTooLarge**: upload exceeded the configured limit (400)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    ConfigError(String),
    ValidationError(String),
    PayloadTooLarge(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::PayloadTooLarge(msg) => write!(f, "Payload too large: {}", msg),
        }
    }
}

/// Converts errors into a consistent JSON body:
///
/// ```json
/// {
///   "error": {
///     "type": "bad_request",
///     "message": "No audio file in request",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_)
            | AppError::ValidationError(_)
            | AppError::PayloadTooLarge(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::Internal(msg) => ("internal_error", msg),
            AppError::BadRequest(msg) => ("bad_request", msg),
            AppError::NotFound(msg) => ("not_found", msg),
            AppError::ConfigError(msg) => ("config_error", msg),
            AppError::ValidationError(msg) => ("validation_error", msg),
            AppError::PayloadTooLarge(msg) => ("payload_too_large", msg),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Pipeline failures are server-side: the upload was accepted but could not
/// be turned into audio.
impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// A broken multipart stream is always the client's fault.
impl From<actix_multipart::MultipartError> for AppError {
    fn from(err: actix_multipart::MultipartError) -> Self {
        AppError::BadRequest(format!("Malformed multipart body: {}", err))
    }
}

pub type AppResult<T> = Result<T, AppError>;

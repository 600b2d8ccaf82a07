//! # Transcription and Denoise Handlers
//!
//! ## Endpoints:
//! - `POST /api/v1/transcribe` (also `/transcribe/`): multipart upload, JSON result
//! - `POST /api/v1/denoise` (also `/denoise/`): multipart upload, denoised WAV back
//!
//! ## Form fields:
//! - **file** (or **audio**): the clip, any container the transcoder understands
//! - **region** (or **country**): optional region key, e.g. `Malaysia`
//!
//! Unknown fields are drained and ignored.

use crate::error::{AppError, AppResult};
use crate::middleware::RequestId;
use crate::state::AppState;
use actix_multipart::{Field, Multipart};
use actix_web::http::header::{ContentDisposition, DispositionParam, DispositionType};
use actix_web::{web, HttpMessage, HttpRequest, HttpResponse};
use futures_util::stream::StreamExt;
use tracing::{error, info};
use uuid::Uuid;

/// Longest region value accepted; real keys are a country name.
const MAX_REGION_BYTES: usize = 256;

/// Parsed multipart form.
#[derive(Debug)]
pub struct AudioUpload {
    pub bytes: Vec<u8>,
    pub filename: Option<String>,
    pub region: Option<String>,
}

/// Read the form, enforcing `max_bytes` on the audio field while streaming.
pub async fn read_upload(mut payload: Multipart, max_bytes: usize) -> AppResult<AudioUpload> {
    let mut audio: Option<(Vec<u8>, Option<String>)> = None;
    let mut region: Option<String> = None;

    while let Some(item) = payload.next().await {
        let mut field = item?;
        let (name, filename) = {
            let disposition = field.content_disposition().ok_or_else(|| {
                AppError::BadRequest("Multipart field without content disposition".to_string())
            })?;
            (
                disposition.get_name().unwrap_or_default().to_string(),
                disposition.get_filename().map(str::to_string),
            )
        };

        match name.as_str() {
            "file" | "audio" => {
                let bytes = read_field(&mut field, max_bytes)
                    .await?
                    .ok_or_else(|| {
                        AppError::PayloadTooLarge(format!(
                            "Audio upload exceeds {} bytes",
                            max_bytes
                        ))
                    })?;
                audio = Some((bytes, filename));
            }
            "region" | "country" => {
                let bytes = read_field(&mut field, MAX_REGION_BYTES)
                    .await?
                    .ok_or_else(|| AppError::ValidationError("Region value is too long".to_string()))?;
                let value = String::from_utf8(bytes)
                    .map_err(|_| AppError::ValidationError("Region must be UTF-8 text".to_string()))?;
                let value = value.trim();
                region = (!value.is_empty()).then(|| value.to_string());
            }
            _ => {
                while let Some(chunk) = field.next().await {
                    chunk?;
                }
            }
        }
    }

    let (bytes, filename) =
        audio.ok_or_else(|| AppError::BadRequest("No audio file provided (field 'file')".to_string()))?;
    if bytes.is_empty() {
        return Err(AppError::BadRequest("Uploaded audio file is empty".to_string()));
    }

    Ok(AudioUpload {
        bytes,
        filename,
        region,
    })
}

/// Collect a field; `None` once it grows past `limit`.
async fn read_field(field: &mut Field, limit: usize) -> AppResult<Option<Vec<u8>>> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk?;
        if bytes.len() + chunk.len() > limit {
            return Ok(None);
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(Some(bytes))
}

/// Id assigned by the request middleware, or a fresh one when it is not mounted.
fn request_id(req: &HttpRequest) -> Uuid {
    req.extensions()
        .get::<RequestId>()
        .map(|RequestId(id)| *id)
        .unwrap_or_else(Uuid::new_v4)
}

/// Denoise the upload, then transcribe it with the base model and, when the
/// region routes to a loaded model, the region model too.
///
/// ## Response:
/// ```json
/// {
///   "request_id": "9b2f…",
///   "base_model": { "text": "good morning", "model": "openai/whisper-base", "model_name": "whisper-base" },
///   "region_model": { "text": "selamat pagi", "model_name": "Malaysian Whisper Model",
///                     "model_id": "mesolitica/malaysian-whisper-small-v3", "language": "ms" },
///   "region": "Malaysia",
///   "processing_time_seconds": 1.42,
///   "noise_reduction_metrics": { "original_rms": 0.12, "denoised_rms": 0.08, "noise_reduction": 0.04 }
/// }
/// ```
pub async fn transcribe(
    req: HttpRequest,
    state: web::Data<AppState>,
    payload: Multipart,
) -> AppResult<HttpResponse> {
    let upload = read_upload(payload, state.config.max_upload_bytes()).await?;
    info!(
        bytes = upload.bytes.len(),
        filename = ?upload.filename,
        region = ?upload.region,
        "Transcription upload received"
    );

    let outcome = state
        .pipeline
        .transcribe_request(request_id(&req), &upload.bytes, upload.filename.as_deref(), upload.region)
        .await;

    match outcome {
        Ok(result) => {
            state.record_transcription(&result);
            Ok(HttpResponse::Ok().json(result))
        }
        Err(e) => {
            state.record_pipeline_failure();
            error!(error = %e, "Transcription pipeline failed");
            Err(e.into())
        }
    }
}

/// Return the denoised clip as `audio/wav`, metrics in `X-*` headers.
pub async fn denoise(
    req: HttpRequest,
    state: web::Data<AppState>,
    payload: Multipart,
) -> AppResult<HttpResponse> {
    let upload = read_upload(payload, state.config.max_upload_bytes()).await?;

    let clip = match state
        .pipeline
        .denoise_request(request_id(&req), &upload.bytes, upload.filename.as_deref())
        .await
    {
        Ok(clip) => clip,
        Err(e) => {
            state.record_pipeline_failure();
            error!(error = %e, "Denoise pipeline failed");
            return Err(e.into());
        }
    };
    state.record_denoise();

    let disposition = ContentDisposition {
        disposition: DispositionType::Attachment,
        parameters: vec![DispositionParam::Filename("denoised.wav".to_string())],
    };

    Ok(HttpResponse::Ok()
        .content_type("audio/wav")
        .insert_header(disposition)
        .insert_header(("X-Original-RMS", format!("{:.6}", clip.metrics.original_rms)))
        .insert_header(("X-Denoised-RMS", format!("{:.6}", clip.metrics.denoised_rms)))
        .insert_header(("X-Noise-Reduction", format!("{:.6}", clip.metrics.noise_reduction)))
        .body(clip.wav_bytes))
}

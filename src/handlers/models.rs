//! # Model Listing
//!
//! `GET /api/v1/models`: the base model and every registered region model,
//! with the strategy each one uses and whether it loaded at startup.

use crate::error::AppResult;
use crate::state::AppState;
use crate::transcription::{HandlerStatus, ModelDescriptor, ModelHandler, TranscriptionStrategy};
use actix_web::{web, HttpResponse};
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Serialize)]
pub struct ModelInfoResponse<'a> {
    #[serde(flatten)]
    pub descriptor: &'a ModelDescriptor,
    pub strategy: &'a TranscriptionStrategy,
    pub status: &'a HandlerStatus,
    pub available: bool,
}

impl<'a> From<&'a ModelHandler> for ModelInfoResponse<'a> {
    fn from(handler: &'a ModelHandler) -> Self {
        Self {
            descriptor: handler.descriptor(),
            strategy: handler.strategy(),
            status: handler.status(),
            available: handler.is_ready(),
        }
    }
}

pub async fn list_models(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let pipeline = &state.pipeline;
    let regions: Vec<ModelInfoResponse> = pipeline.region_handlers().map(Into::into).collect();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "base_model": ModelInfoResponse::from(pipeline.base()),
        "region_models": regions,
        "available_regions": pipeline.available_regions(),
    })))
}

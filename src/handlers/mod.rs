pub mod config;
pub mod models;
pub mod transcribe;

pub use config::*;
pub use models::*;
pub use transcribe::*;

use crate::health;
use actix_web::web;

/// Route table, shared by `main` and the handler tests.
///
/// The unversioned `/transcribe/`, `/denoise/` and `/health` paths are kept
/// for clients written against the first release.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/health", web::get().to(health::health_check))
            .route("/metrics", web::get().to(health::detailed_metrics))
            .route("/transcribe", web::post().to(transcribe))
            .route("/denoise", web::post().to(denoise))
            .route("/models", web::get().to(list_models))
            .route("/config", web::get().to(get_config)),
    )
    .route("/transcribe/", web::post().to(transcribe))
    .route("/denoise/", web::post().to(denoise))
    .route("/health", web::get().to(health::health_check));
}

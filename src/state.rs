//! # Application State
//!
//! Everything the request handlers share, built once in `main` before the
//! server binds and handed to actix as `web::Data<AppState>`.
//!
//! ## Sharing pattern:
//! - **config**: `Arc<AppConfig>`, immutable after startup
//! - **pipeline**: `Arc<TranscriptionPipeline>`, registry and handlers are read-only at request time
//! - **metrics**: `Arc<RwLock<AppMetrics>>`, the only state requests write to
//!
//! Lock poisoning is recovered from rather than propagated: a counter left
//! half-updated by a panicking request is still a usable counter.

use crate::config::AppConfig;
use crate::transcription::{AggregatedResult, TranscriptionPipeline};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub pipeline: Arc<TranscriptionPipeline>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub start_time: Instant,
}

/// Decrements `active_requests` on drop.
pub struct InFlightGuard {
    state: AppState,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.state.end_request();
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Requests currently inside the service.
    pub active_requests: u32,
    /// Keyed by "METHOD /path".
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
    pub transcription: TranscriptionCounters,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

/// Pipeline outcomes, as opposed to HTTP outcomes.
#[derive(Debug, Default, Clone, Serialize)]
pub struct TranscriptionCounters {
    pub served: u64,
    /// Requests where the base model returned no text.
    pub base_null_results: u64,
    /// Requests that were routed to a region model.
    pub region_requests: u64,
    pub region_null_results: u64,
    /// Requests aborted by staging, transcoding or denoising.
    pub pipeline_failures: u64,
    pub denoise_only_served: u64,
    pub total_processing_seconds: f64,
}

impl AppState {
    pub fn new(config: AppConfig, pipeline: TranscriptionPipeline) -> Self {
        Self {
            config: Arc::new(config),
            pipeline: Arc::new(pipeline),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    fn metrics_read(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn metrics_write(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn increment_request_count(&self) {
        self.metrics_write().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_write().error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_write();
        let entry = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        entry.request_count += 1;
        entry.total_duration_ms += duration_ms;
        if is_error {
            entry.error_count += 1;
        }
    }

    pub fn begin_request(&self) {
        self.metrics_write().active_requests += 1;
    }

    /// Count a request as in flight until the returned guard drops, whether
    /// the request completes or its future is abandoned.
    pub fn track_in_flight(&self) -> InFlightGuard {
        self.begin_request();
        InFlightGuard { state: self.clone() }
    }

    pub fn end_request(&self) {
        let mut metrics = self.metrics_write();
        metrics.active_requests = metrics.active_requests.saturating_sub(1);
    }

    pub fn record_transcription(&self, result: &AggregatedResult) {
        let mut metrics = self.metrics_write();
        let counters = &mut metrics.transcription;
        counters.served += 1;
        counters.total_processing_seconds += result.processing_time_seconds;
        if result.base.text.is_none() {
            counters.base_null_results += 1;
        }
        if let Some(region) = &result.region {
            counters.region_requests += 1;
            if region.text.is_none() {
                counters.region_null_results += 1;
            }
        }
    }

    pub fn record_denoise(&self) {
        self.metrics_write().transcription.denoise_only_served += 1;
    }

    pub fn record_pipeline_failure(&self) {
        self.metrics_write().transcription.pipeline_failures += 1;
    }

    /// Consistent copy of the metrics; the lock is released before returning.
    pub fn metrics_snapshot(&self) -> AppMetrics {
        self.metrics_read().clone()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl AppMetrics {
    pub fn error_rate(&self) -> f64 {
        ratio(self.error_count, self.request_count)
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        ratio(self.total_duration_ms, self.request_count)
    }

    pub fn error_rate(&self) -> f64 {
        ratio(self.error_count, self.request_count)
    }
}

impl TranscriptionCounters {
    pub fn average_processing_seconds(&self) -> f64 {
        if self.served == 0 {
            0.0
        } else {
            self.total_processing_seconds / self.served as f64
        }
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

//! # Transcription Orchestrator
//!
//! One request, start to finish:
//!
//! 1. Stage the upload as a scratch file
//! 2. Denoise it (fatal on failure)
//! 3. Run the base model and, when the region hint routes to a ready
//!    handler, the region model on the same denoised clip, concurrently
//! 4. Wait for both
//! 5. Delete every scratch file
//! 6. Aggregate texts, metrics and elapsed time
//!
//! Model failures never fail the request; they show up as `null` text.
//! Both results are always awaited, even when one model is much faster.

use crate::audio::{
    AudioDenoiser, AudioJob, AudioTranscoder, FfmpegTranscoder, NoiseReductionMetrics,
};
use crate::config::AppConfig;
use crate::device::{DeviceManager, DevicePreference};
use crate::error::PipelineError;
use crate::transcription::handler::{ModelHandler, TranscriptionStrategy};
use crate::transcription::registry::{ModelDescriptor, ModelRegistry};
use anyhow::{anyhow, Context};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Which model produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultSource {
    Base,
    Region,
}

/// Text from one model, `None` when that model failed.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptionResult {
    pub source: ResultSource,
    pub text: Option<String>,
    pub descriptor: ModelDescriptor,
}

impl Serialize for TranscriptionResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.source {
            ResultSource::Base => {
                let mut s = serializer.serialize_struct("BaseModelResult", 3)?;
                s.serialize_field("text", &self.text)?;
                s.serialize_field("model", &self.descriptor.model_id)?;
                s.serialize_field("model_name", &self.descriptor.display_name)?;
                s.end()
            }
            ResultSource::Region => {
                let mut s = serializer.serialize_struct("RegionModelResult", 4)?;
                s.serialize_field("text", &self.text)?;
                s.serialize_field("model_name", &self.descriptor.display_name)?;
                s.serialize_field("model_id", &self.descriptor.model_id)?;
                s.serialize_field("language", &self.descriptor.language)?;
                s.end()
            }
        }
    }
}

/// Response body of a transcription request.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedResult {
    pub request_id: Uuid,
    #[serde(rename = "base_model")]
    pub base: TranscriptionResult,
    #[serde(rename = "region_model")]
    pub region: Option<TranscriptionResult>,
    /// Region hint as the client sent it.
    #[serde(rename = "region")]
    pub region_key: Option<String>,
    pub processing_time_seconds: f64,
    pub noise_reduction_metrics: NoiseReductionMetrics,
}

/// Output of the denoise-only operation.
#[derive(Debug, Clone)]
pub struct DenoisedClip {
    pub wav_bytes: Vec<u8>,
    pub metrics: NoiseReductionMetrics,
}

pub struct TranscriptionPipeline {
    denoiser: AudioDenoiser,
    base: ModelHandler,
    /// Every registry entry, loaded or not; routing skips the ones that are not ready.
    regions: HashMap<String, ModelHandler>,
    registry: ModelRegistry,
    work_dir: PathBuf,
}

impl TranscriptionPipeline {
    /// Build the pipeline and load every model before the server starts.
    ///
    /// A base model that fails to load aborts startup; a region model that
    /// fails only disables its region.
    pub async fn initialize(config: &AppConfig) -> anyhow::Result<Self> {
        let registry = ModelRegistry::load(&config.models).context("Failed to load region table")?;

        let work_dir = config
            .audio
            .temp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        std::fs::create_dir_all(&work_dir)
            .with_context(|| format!("Failed to create work directory {}", work_dir.display()))?;

        let transcoder = FfmpegTranscoder::new(config.audio.ffmpeg_path.clone());
        if !transcoder.is_available().await {
            warn!(
                ffmpeg = %config.audio.ffmpeg_path,
                "Transcoder binary not found; every request will fail until it is installed"
            );
        }
        let denoiser = AudioDenoiser::new(
            Arc::new(transcoder) as Arc<dyn AudioTranscoder>,
            config.audio.denoise.clone(),
            config.audio.sample_rate,
        );

        let preference: DevicePreference = config.models.device.parse().map_err(|e: String| anyhow!(e))?;
        let device = DeviceManager::select(preference);
        let cache_dir = config.models.cache_dir.as_deref();

        let base_descriptor =
            ModelDescriptor::base(&config.models.base_model_id, &config.models.base_model_name);
        let mut base = ModelHandler::new(
            base_descriptor.clone(),
            TranscriptionStrategy::for_descriptor(&base_descriptor, &config.models),
        );
        if !base.load(&device, cache_dir).await {
            return Err(anyhow!(
                "Base model '{}' failed to load: {:?}",
                base_descriptor.model_id,
                base.status()
            ));
        }

        let mut regions = HashMap::with_capacity(registry.len());
        for descriptor in registry.iter() {
            let mut handler = ModelHandler::new(
                descriptor.clone(),
                TranscriptionStrategy::for_descriptor(descriptor, &config.models),
            );
            handler.load(&device, cache_dir).await;
            regions.insert(descriptor.region_key.clone(), handler);
        }

        let pipeline = Self::from_parts(denoiser, base, regions.into_values().collect(), registry, work_dir);
        info!(
            ready_regions = ?pipeline.available_regions(),
            "Transcription pipeline initialized"
        );
        Ok(pipeline)
    }

    /// Assemble a pipeline from already prepared parts.
    pub fn from_parts(
        denoiser: AudioDenoiser,
        base: ModelHandler,
        regions: Vec<ModelHandler>,
        registry: ModelRegistry,
        work_dir: PathBuf,
    ) -> Self {
        let regions = regions
            .into_iter()
            .map(|h| (h.descriptor().region_key.clone(), h))
            .collect();
        Self {
            denoiser,
            base,
            regions,
            registry,
            work_dir,
        }
    }

    pub fn base(&self) -> &ModelHandler {
        &self.base
    }

    /// Region handlers in registry order.
    pub fn region_handlers(&self) -> impl Iterator<Item = &ModelHandler> {
        self.registry
            .iter()
            .filter_map(|d| self.regions.get(&d.region_key))
    }

    /// Region keys whose model is loaded.
    pub fn available_regions(&self) -> Vec<String> {
        self.region_handlers()
            .filter(|h| h.is_ready())
            .map(|h| h.descriptor().region_key.clone())
            .collect()
    }

    /// Ready handler for a region hint, if any.
    pub fn route(&self, region_hint: Option<&str>) -> Option<&ModelHandler> {
        let hint = region_hint.map(str::trim).filter(|h| !h.is_empty())?;
        let descriptor = self.registry.describe(hint)?;
        self.regions
            .get(&descriptor.region_key)
            .filter(|handler| handler.is_ready())
    }

    /// Denoise and transcribe one upload. `request_id` names the scratch
    /// files, tags every log line and is echoed in the result.
    pub async fn transcribe_request(
        &self,
        request_id: Uuid,
        bytes: &[u8],
        filename: Option<&str>,
        region_hint: Option<String>,
    ) -> Result<AggregatedResult, PipelineError> {
        let started = Instant::now();
        let region_hint = region_hint
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty());

        let mut job = AudioJob::stage(
            request_id,
            bytes,
            filename,
            &self.work_dir,
            self.denoiser.sample_rate(),
            region_hint.clone(),
        )
        .await?;

        let metrics = match self.denoise_job(&mut job).await {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Denoising failed");
                job.cleanup();
                return Err(e);
            }
        };

        let region_handler = self.route(region_hint.as_deref());
        if region_hint.is_some() && region_handler.is_none() {
            info!(job_id = %job.id, region = ?region_hint, "No ready model for region, base model only");
        }

        let (base_text, region_text) = match job.denoised_path() {
            Some(audio) => {
                let region_future = async {
                    match region_handler {
                        Some(handler) => Some(handler.transcribe(audio).await),
                        None => None,
                    }
                };
                tokio::join!(self.base.transcribe(audio), region_future)
            }
            None => (None, None),
        };

        job.cleanup();

        let result = AggregatedResult {
            request_id,
            base: TranscriptionResult {
                source: ResultSource::Base,
                text: base_text,
                descriptor: self.base.descriptor().clone(),
            },
            region: region_handler.zip(region_text).map(|(handler, text)| TranscriptionResult {
                source: ResultSource::Region,
                text,
                descriptor: handler.descriptor().clone(),
            }),
            region_key: region_hint,
            processing_time_seconds: round_seconds(started.elapsed().as_secs_f64()),
            noise_reduction_metrics: metrics,
        };

        info!(
            request_id = %result.request_id,
            base_ok = result.base.text.is_some(),
            region = ?result.region.as_ref().map(|r| r.descriptor.region_key.as_str()),
            seconds = result.processing_time_seconds,
            "Transcription request served"
        );
        Ok(result)
    }

    /// Denoise one upload and return the cleaned WAV bytes.
    pub async fn denoise_request(
        &self,
        request_id: Uuid,
        bytes: &[u8],
        filename: Option<&str>,
    ) -> Result<DenoisedClip, PipelineError> {
        let mut job = AudioJob::stage(
            request_id,
            bytes,
            filename,
            &self.work_dir,
            self.denoiser.sample_rate(),
            None,
        )
        .await?;

        let outcome = match self.denoise_job(&mut job).await {
            Ok(metrics) => match job.denoised_path() {
                Some(path) => tokio::fs::read(path)
                    .await
                    .map(|wav_bytes| DenoisedClip { wav_bytes, metrics })
                    .map_err(PipelineError::from),
                None => Err(PipelineError::Worker("denoised clip missing".into())),
            },
            Err(e) => Err(e),
        };

        job.cleanup();
        outcome
    }

    async fn denoise_job(&self, job: &mut AudioJob) -> Result<NoiseReductionMetrics, PipelineError> {
        let input = job
            .input_path()
            .map(Path::to_path_buf)
            .ok_or_else(|| PipelineError::Worker("upload was released before denoising".into()))?;
        let result = self.denoiser.process(&input, &self.work_dir).await?;
        job.release_input();
        job.attach_denoised(result.output);
        Ok(result.metrics)
    }
}

fn round_seconds(seconds: f64) -> f64 {
    (seconds * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::job::test_support::wait_until_empty;
    use crate::audio::transcoder::test_support::WavTranscoder;
    use crate::audio::wav::test_support::{noisy_speech, wav_bytes};
    use crate::config::DenoiseConfig;
    use crate::error::ModelError;
    use crate::transcription::handler::test_support::MockModel;
    use crate::transcription::model::SpeechModel;
    use async_trait::async_trait;
    use futures_util::FutureExt;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Canonicalizes like `WavTranscoder`, then never finishes.
    struct StallingTranscoder;

    #[async_trait]
    impl AudioTranscoder for StallingTranscoder {
        async fn transcode(&self, input: &Path, output: &Path, sample_rate: u32) -> Result<(), PipelineError> {
            WavTranscoder.transcode(input, output, sample_rate).await?;
            std::future::pending().await
        }
    }

    struct Fixture {
        dir: TempDir,
        pipeline: TranscriptionPipeline,
        base: Arc<MockModel>,
        malaysia: Arc<MockModel>,
    }

    async fn fixture() -> Fixture {
        fixture_with(Arc::new(WavTranscoder)).await
    }

    async fn fixture_with(transcoder: Arc<dyn AudioTranscoder>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::builtin().unwrap();
        let config = AppConfig::default().models;

        let base_model = MockModel::replying("openai/whisper-base", "good morning");
        let base_descriptor = ModelDescriptor::base("openai/whisper-base", "whisper-base");
        let base = ModelHandler::with_model(
            base_descriptor.clone(),
            TranscriptionStrategy::for_descriptor(&base_descriptor, &config),
            base_model.clone(),
        );

        let malaysia_model = MockModel::replying("mesolitica/malaysian-whisper-small-v3", "selamat pagi");
        let malaysia_descriptor = registry.describe("Malaysia").unwrap().clone();
        let malaysia = ModelHandler::with_model(
            malaysia_descriptor.clone(),
            TranscriptionStrategy::for_descriptor(&malaysia_descriptor, &config),
            malaysia_model.clone(),
        );

        let thailand_descriptor = registry.describe("Thailand").unwrap().clone();
        let mut thailand = ModelHandler::new(
            thailand_descriptor.clone(),
            TranscriptionStrategy::for_descriptor(&thailand_descriptor, &config),
        );
        thailand
            .load_with(|d| async move {
                Err::<Arc<dyn SpeechModel>, _>(ModelError::Load {
                    model_id: d.model_id,
                    message: "no weights".into(),
                })
            })
            .await;

        let denoiser = AudioDenoiser::new(transcoder, DenoiseConfig::default(), 48_000);
        let pipeline = TranscriptionPipeline::from_parts(
            denoiser,
            base,
            vec![malaysia, thailand],
            registry,
            dir.path().to_path_buf(),
        );

        Fixture {
            dir,
            pipeline,
            base: base_model,
            malaysia: malaysia_model,
        }
    }

    fn residual_files(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    fn speech_upload() -> Vec<u8> {
        wav_bytes(&noisy_speech(2.0, 48_000), 48_000, 1)
    }

    #[tokio::test]
    async fn test_routing() {
        let f = fixture().await;
        assert!(f.pipeline.route(Some("Malaysia")).is_some());
        assert!(f.pipeline.route(Some(" malaysia ")).is_some());
        assert!(f.pipeline.route(Some("Thailand")).is_none(), "failed load must not route");
        assert!(f.pipeline.route(Some("Singapore")).is_none(), "no handler registered");
        assert!(f.pipeline.route(Some("Atlantis")).is_none());
        assert!(f.pipeline.route(Some("")).is_none());
        assert!(f.pipeline.route(None).is_none());
        assert_eq!(f.pipeline.available_regions(), vec!["Malaysia".to_string()]);
    }

    #[tokio::test]
    async fn test_base_only_without_region_hint() {
        let f = fixture().await;
        let result = f
            .pipeline
            .transcribe_request(Uuid::new_v4(), &speech_upload(), Some("clip.wav"), None)
            .await
            .unwrap();

        assert_eq!(result.base.text.as_deref(), Some("good morning"));
        assert!(result.region.is_none());
        assert!(result.region_key.is_none());
        assert!(result.noise_reduction_metrics.noise_reduction > 0.0);
        assert_eq!(f.malaysia.call_count(), 0);
        assert_eq!(residual_files(f.dir.path()), 0);
    }

    #[tokio::test]
    async fn test_region_hint_runs_both_on_same_audio() {
        let f = fixture().await;
        let result = f
            .pipeline
            .transcribe_request(Uuid::new_v4(), &speech_upload(), Some("clip.wav"), Some("Malaysia".into()))
            .await
            .unwrap();

        assert_eq!(result.base.text.as_deref(), Some("good morning"));
        let region = result.region.as_ref().unwrap();
        assert_eq!(region.text.as_deref(), Some("selamat pagi"));
        assert_eq!(region.descriptor.language.as_deref(), Some("ms"));
        assert_eq!(result.region_key.as_deref(), Some("Malaysia"));

        let base_calls = f.base.calls.lock().unwrap();
        let region_calls = f.malaysia.calls.lock().unwrap();
        assert_eq!(base_calls.len(), 1);
        assert_eq!(region_calls.len(), 1);
        assert_eq!(base_calls[0].0, region_calls[0].0);
        assert_eq!(residual_files(f.dir.path()), 0);
    }

    #[tokio::test]
    async fn test_failed_region_behaves_like_absent_hint() {
        let f = fixture().await;
        let result = f
            .pipeline
            .transcribe_request(Uuid::new_v4(), &speech_upload(), None, Some("Thailand".into()))
            .await
            .unwrap();
        assert!(result.base.text.is_some());
        assert!(result.region.is_none());
        assert_eq!(residual_files(f.dir.path()), 0);
    }

    #[tokio::test]
    async fn test_region_failure_does_not_affect_base() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::builtin().unwrap();
        let config = AppConfig::default().models;
        let base_descriptor = ModelDescriptor::base("openai/whisper-base", "whisper-base");
        let malaysia_descriptor = registry.describe("Malaysia").unwrap().clone();

        let pipeline = TranscriptionPipeline::from_parts(
            AudioDenoiser::new(Arc::new(WavTranscoder), DenoiseConfig::default(), 48_000),
            ModelHandler::with_model(
                base_descriptor.clone(),
                TranscriptionStrategy::for_descriptor(&base_descriptor, &config),
                MockModel::replying("base", "hello"),
            ),
            vec![ModelHandler::with_model(
                malaysia_descriptor.clone(),
                TranscriptionStrategy::for_descriptor(&malaysia_descriptor, &config),
                MockModel::failing("region", "decoder exploded"),
            )],
            registry,
            dir.path().to_path_buf(),
        );

        let result = pipeline
            .transcribe_request(Uuid::new_v4(), &speech_upload(), None, Some("Malaysia".into()))
            .await
            .unwrap();
        assert_eq!(result.base.text.as_deref(), Some("hello"));
        assert_eq!(result.region.as_ref().map(|r| r.text.clone()), Some(None));
        assert_eq!(residual_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_undecodable_upload_fails_and_leaves_nothing() {
        let f = fixture().await;
        let err = f
            .pipeline
            .transcribe_request(Uuid::new_v4(), b"definitely not audio", Some("clip.mp3"), Some("Malaysia".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Conversion(_)));
        assert_eq!(f.base.call_count(), 0);
        assert_eq!(residual_files(f.dir.path()), 0);
    }

    #[tokio::test]
    async fn test_silent_upload_is_rejected() {
        let f = fixture().await;
        let silent = wav_bytes(&vec![0.0; 48_000], 48_000, 1);
        let err = f.pipeline.transcribe_request(Uuid::new_v4(), &silent, None, None).await.unwrap_err();
        assert!(matches!(err, PipelineError::EmptyAudio(_)));
        assert_eq!(residual_files(f.dir.path()), 0);
    }

    #[tokio::test]
    async fn test_denoise_request_returns_wav() {
        let f = fixture().await;
        let clip = f
            .pipeline
            .denoise_request(Uuid::new_v4(), &speech_upload(), Some("clip.wav"))
            .await
            .unwrap();
        assert_eq!(&clip.wav_bytes[..4], b"RIFF");
        assert!(clip.metrics.denoised_rms < clip.metrics.original_rms);
        assert_eq!(residual_files(f.dir.path()), 0);
    }

    #[tokio::test]
    async fn test_response_shape() {
        let f = fixture().await;
        let result = f
            .pipeline
            .transcribe_request(Uuid::new_v4(), &speech_upload(), None, Some("Malaysia".into()))
            .await
            .unwrap();
        let json = serde_json::to_value(&result).unwrap();

        assert_eq!(json["base_model"]["model"], "openai/whisper-base");
        assert_eq!(json["base_model"]["model_name"], "whisper-base");
        assert_eq!(json["region_model"]["model_id"], "mesolitica/malaysian-whisper-small-v3");
        assert_eq!(json["region_model"]["language"], "ms");
        assert_eq!(json["region"], "Malaysia");
        assert!(json["processing_time_seconds"].is_number());
        assert!(json["noise_reduction_metrics"]["original_rms"].is_number());
    }

    #[tokio::test]
    async fn test_result_carries_caller_request_id() {
        let f = fixture().await;
        let id = Uuid::new_v4();
        let result = f
            .pipeline
            .transcribe_request(id, &speech_upload(), None, None)
            .await
            .unwrap();
        assert_eq!(result.request_id, id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_requests_dropped_after_first_poll_leave_nothing() {
        let f = fixture().await;
        let upload = speech_upload();

        for _ in 0..50 {
            let mut transcribe =
                Box::pin(f.pipeline.transcribe_request(Uuid::new_v4(), &upload, Some("clip.wav"), Some("Malaysia".into())));
            assert!(transcribe.as_mut().now_or_never().is_none());
            drop(transcribe);

            let mut denoise = Box::pin(f.pipeline.denoise_request(Uuid::new_v4(), &upload, Some("clip.wav")));
            assert!(denoise.as_mut().now_or_never().is_none());
            drop(denoise);
        }

        assert_eq!(wait_until_empty(f.dir.path()).await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_request_timed_out_while_denoising_leaves_nothing() {
        let f = fixture_with(Arc::new(StallingTranscoder)).await;
        let upload = speech_upload();

        let transcribe = f
            .pipeline
            .transcribe_request(Uuid::new_v4(), &upload, None, Some("Malaysia".into()));
        assert!(tokio::time::timeout(Duration::from_millis(200), transcribe).await.is_err());

        let denoise = f.pipeline.denoise_request(Uuid::new_v4(), &upload, None);
        assert!(tokio::time::timeout(Duration::from_millis(200), denoise).await.is_err());

        assert_eq!(f.base.call_count(), 0);
        assert_eq!(wait_until_empty(f.dir.path()).await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_requests_cancelled_at_any_stage_leave_nothing() {
        let f = fixture().await;
        let upload = speech_upload();

        // Deadlines spread over staging, denoising and inference.
        for deadline_ms in 0..40 {
            let request = f
                .pipeline
                .transcribe_request(Uuid::new_v4(), &upload, None, Some("Malaysia".into()));
            let _ = tokio::time::timeout(Duration::from_millis(deadline_ms), request).await;
        }

        assert_eq!(wait_until_empty(f.dir.path()).await, 0);
    }

    #[test]
    fn test_round_seconds() {
        assert_eq!(round_seconds(1.23456), 1.23);
        assert_eq!(round_seconds(2.0), 2.0);
        assert_eq!(round_seconds(0.0), 0.0);
    }
}

//! # Model Handler
//!
//! Wraps one loaded model together with the strategy needed to drive it.
//! Every handler exposes the same contract: given the path of a denoised
//! WAV, return text or nothing. Inference failures never escape; they are
//! logged and turned into `None` so the other model's result still reaches
//! the client.
//!
//! ## Strategies:
//! - **GenericPipeline**: whole clip, 30 s windows encoded in batches, language detected
//! - **ExplicitGeneration**: first window, fixed language, transcribe task
//! - **RawFeatureExtraction**: first window, fixed language, bounded token budget

use crate::audio::wav;
use crate::config::ModelsConfig;
use crate::error::ModelError;
use crate::transcription::model::{
    DecodeRequest, SpeechModel, WhisperModel, WindowPolicy, MODEL_SAMPLE_RATE,
};
use crate::transcription::registry::{CapabilityVariant, ModelDescriptor};
use candle_core::Device;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Closed set of ways to drive a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum TranscriptionStrategy {
    GenericPipeline { batch_size: usize },
    ExplicitGeneration { language: String },
    RawFeatureExtraction { language: String, max_new_tokens: usize },
}

impl TranscriptionStrategy {
    /// Strategy for a descriptor, with knobs taken from configuration.
    ///
    /// The registry guarantees a language for the fixed-language variants;
    /// a descriptor built by hand without one falls back to English.
    pub fn for_descriptor(descriptor: &ModelDescriptor, config: &ModelsConfig) -> Self {
        let language = || descriptor.language.clone().unwrap_or_else(|| "en".to_string());
        match descriptor.variant {
            CapabilityVariant::GenericPipeline => TranscriptionStrategy::GenericPipeline {
                batch_size: config.pipeline_batch_size,
            },
            CapabilityVariant::ExplicitGeneration => {
                TranscriptionStrategy::ExplicitGeneration { language: language() }
            }
            CapabilityVariant::RawFeatureExtraction => TranscriptionStrategy::RawFeatureExtraction {
                language: language(),
                max_new_tokens: config.raw_max_new_tokens,
            },
        }
    }

    pub fn decode_request(&self) -> DecodeRequest {
        match self {
            TranscriptionStrategy::GenericPipeline { batch_size } => DecodeRequest {
                language: None,
                max_new_tokens: None,
                windows: WindowPolicy::All {
                    batch_size: *batch_size,
                },
            },
            TranscriptionStrategy::ExplicitGeneration { language } => DecodeRequest {
                language: Some(language.clone()),
                max_new_tokens: None,
                windows: WindowPolicy::FirstOnly,
            },
            TranscriptionStrategy::RawFeatureExtraction {
                language,
                max_new_tokens,
            } => DecodeRequest {
                language: Some(language.clone()),
                max_new_tokens: Some(*max_new_tokens),
                windows: WindowPolicy::FirstOnly,
            },
        }
    }
}

/// Load state of a handler.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum HandlerStatus {
    Pending,
    Ready {
        loaded_at: DateTime<Utc>,
        load_seconds: f64,
    },
    Failed {
        message: String,
        failed_at: DateTime<Utc>,
    },
}

impl HandlerStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, HandlerStatus::Ready { .. })
    }
}

pub struct ModelHandler {
    descriptor: ModelDescriptor,
    strategy: TranscriptionStrategy,
    model: Option<Arc<dyn SpeechModel>>,
    status: HandlerStatus,
}

impl ModelHandler {
    pub fn new(descriptor: ModelDescriptor, strategy: TranscriptionStrategy) -> Self {
        Self {
            descriptor,
            strategy,
            model: None,
            status: HandlerStatus::Pending,
        }
    }

    /// Handler around an already constructed model.
    pub fn with_model(
        descriptor: ModelDescriptor,
        strategy: TranscriptionStrategy,
        model: Arc<dyn SpeechModel>,
    ) -> Self {
        Self {
            descriptor,
            strategy,
            model: Some(model),
            status: HandlerStatus::Ready {
                loaded_at: Utc::now(),
                load_seconds: 0.0,
            },
        }
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    pub fn strategy(&self) -> &TranscriptionStrategy {
        &self.strategy
    }

    pub fn status(&self) -> &HandlerStatus {
        &self.status
    }

    pub fn is_ready(&self) -> bool {
        self.status.is_ready() && self.model.is_some()
    }

    /// Load the Whisper checkpoint the descriptor names.
    ///
    /// ## Returns:
    /// - **true**: the handler is ready (also when it already was)
    /// - **false**: loading failed; the reason is kept in `status()`
    pub async fn load(&mut self, device: &Device, cache_dir: Option<&Path>) -> bool {
        let device = device.clone();
        let cache_dir = cache_dir.map(Path::to_path_buf);
        self.load_with(move |descriptor| async move {
            let model = WhisperModel::load(&descriptor, device, cache_dir.as_deref()).await?;
            Ok(Arc::new(model) as Arc<dyn SpeechModel>)
        })
        .await
    }

    /// Load through an arbitrary loader. Failures are recorded, never raised.
    pub async fn load_with<F, Fut>(&mut self, loader: F) -> bool
    where
        F: FnOnce(ModelDescriptor) -> Fut,
        Fut: Future<Output = Result<Arc<dyn SpeechModel>, ModelError>>,
    {
        if self.is_ready() {
            return true;
        }

        let started = Instant::now();
        match loader(self.descriptor.clone()).await {
            Ok(model) => {
                let load_seconds = started.elapsed().as_secs_f64();
                info!(
                    region = %self.descriptor.region_key,
                    model_id = %self.descriptor.model_id,
                    load_seconds,
                    "Model handler ready"
                );
                self.model = Some(model);
                self.status = HandlerStatus::Ready {
                    loaded_at: Utc::now(),
                    load_seconds,
                };
                true
            }
            Err(e) => {
                error!(
                    region = %self.descriptor.region_key,
                    model_id = %self.descriptor.model_id,
                    error = %e,
                    "Model handler failed to load"
                );
                self.model = None;
                self.status = HandlerStatus::Failed {
                    message: e.to_string(),
                    failed_at: Utc::now(),
                };
                false
            }
        }
    }

    /// Transcribe a denoised WAV. `None` when the handler is not ready or inference fails.
    pub async fn transcribe(&self, audio: &Path) -> Option<String> {
        let model = match (&self.status, &self.model) {
            (HandlerStatus::Ready { .. }, Some(model)) => Arc::clone(model),
            _ => {
                warn!(model_id = %self.descriptor.model_id, "Transcription requested from a handler that is not ready");
                return None;
            }
        };

        let request = self.strategy.decode_request();
        let path: PathBuf = audio.to_path_buf();
        let started = Instant::now();

        let outcome = tokio::task::spawn_blocking(move || {
            let pcm = load_model_input(&path, model.model_id())?;
            model.transcribe(&pcm, &request)
        })
        .await;

        match outcome {
            Ok(Ok(text)) => {
                info!(
                    model_id = %self.descriptor.model_id,
                    chars = text.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Transcription finished"
                );
                Some(text)
            }
            Ok(Err(e)) => {
                warn!(model_id = %self.descriptor.model_id, error = %e, "Transcription failed");
                None
            }
            Err(e) => {
                error!(model_id = %self.descriptor.model_id, error = %e, "Transcription worker crashed");
                None
            }
        }
    }
}

/// Denoised WAV → mono samples at the model rate.
fn load_model_input(path: &Path, model_id: &str) -> Result<Vec<f32>, ModelError> {
    let inference_error = |message: String| ModelError::Inference {
        model_id: model_id.to_string(),
        message,
    };
    let decoded = wav::read_wav(path).map_err(|e| inference_error(e.to_string()))?;
    let rate = decoded.sample_rate;
    let mono = decoded.into_mono();
    wav::resample(&mono, rate, MODEL_SAMPLE_RATE).map_err(|e| inference_error(e.to_string()))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Scripted model: returns `reply` (or fails) and remembers what it was asked.
    pub struct MockModel {
        pub id: String,
        pub reply: Result<String, String>,
        pub calls: Mutex<Vec<(usize, DecodeRequest)>>,
    }

    impl MockModel {
        pub fn replying(id: &str, text: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                reply: Ok(text.to_string()),
                calls: Mutex::new(Vec::new()),
            })
        }

        pub fn failing(id: &str, message: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                reply: Err(message.to_string()),
                calls: Mutex::new(Vec::new()),
            })
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl SpeechModel for MockModel {
        fn model_id(&self) -> &str {
            &self.id
        }

        fn transcribe(&self, pcm: &[f32], request: &DecodeRequest) -> Result<String, ModelError> {
            self.calls.lock().unwrap().push((pcm.len(), request.clone()));
            self.reply.clone().map_err(|message| ModelError::Inference {
                model_id: self.id.clone(),
                message,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::MockModel;
    use super::*;
    use crate::config::AppConfig;
    use crate::transcription::registry::ModelRegistry;

    fn write_clip(dir: &Path, seconds: f32) -> PathBuf {
        let path = dir.join("clip.wav");
        let samples = crate::audio::wav::test_support::noisy_speech(seconds, 48_000);
        wav::write_wav_i16(&path, &samples, 48_000).unwrap();
        path
    }

    fn malaysia() -> ModelDescriptor {
        ModelRegistry::builtin().unwrap().describe("Malaysia").unwrap().clone()
    }

    #[test]
    fn test_strategy_for_each_variant() {
        let config = AppConfig::default().models;
        let registry = ModelRegistry::builtin().unwrap();

        assert_eq!(
            TranscriptionStrategy::for_descriptor(registry.describe("Singapore").unwrap(), &config),
            TranscriptionStrategy::GenericPipeline { batch_size: 8 }
        );
        assert_eq!(
            TranscriptionStrategy::for_descriptor(registry.describe("Malaysia").unwrap(), &config),
            TranscriptionStrategy::ExplicitGeneration {
                language: "ms".into()
            }
        );
        assert_eq!(
            TranscriptionStrategy::for_descriptor(registry.describe("Thailand").unwrap(), &config),
            TranscriptionStrategy::RawFeatureExtraction {
                language: "th".into(),
                max_new_tokens: 255
            }
        );
    }

    #[test]
    fn test_decode_requests() {
        let generic = TranscriptionStrategy::GenericPipeline { batch_size: 4 }.decode_request();
        assert_eq!(generic.language, None);
        assert_eq!(generic.windows, WindowPolicy::All { batch_size: 4 });

        let raw = TranscriptionStrategy::RawFeatureExtraction {
            language: "th".into(),
            max_new_tokens: 255,
        }
        .decode_request();
        assert_eq!(raw.language.as_deref(), Some("th"));
        assert_eq!(raw.max_new_tokens, Some(255));
        assert_eq!(raw.windows, WindowPolicy::FirstOnly);
    }

    #[tokio::test]
    async fn test_transcribe_resamples_to_model_rate() {
        let dir = tempfile::tempdir().unwrap();
        let clip = write_clip(dir.path(), 1.0);
        let model = MockModel::replying("mesolitica/malaysian-whisper-small-v3", "selamat pagi");
        let handler = ModelHandler::with_model(
            malaysia(),
            TranscriptionStrategy::ExplicitGeneration {
                language: "ms".into(),
            },
            model.clone(),
        );

        assert_eq!(handler.transcribe(&clip).await.as_deref(), Some("selamat pagi"));

        let calls = model.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, 16_000);
        assert_eq!(calls[0].1.language.as_deref(), Some("ms"));
    }

    #[tokio::test]
    async fn test_inference_failure_becomes_none() {
        let dir = tempfile::tempdir().unwrap();
        let clip = write_clip(dir.path(), 0.5);
        let handler = ModelHandler::with_model(
            malaysia(),
            TranscriptionStrategy::ExplicitGeneration {
                language: "ms".into(),
            },
            MockModel::failing("m", "out of memory"),
        );
        assert_eq!(handler.transcribe(&clip).await, None);
    }

    #[tokio::test]
    async fn test_unreadable_audio_becomes_none() {
        let dir = tempfile::tempdir().unwrap();
        let model = MockModel::replying("m", "text");
        let handler = ModelHandler::with_model(
            malaysia(),
            TranscriptionStrategy::ExplicitGeneration {
                language: "ms".into(),
            },
            model.clone(),
        );
        assert_eq!(handler.transcribe(&dir.path().join("missing.wav")).await, None);
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn test_load_failure_is_recorded() {
        let mut handler = ModelHandler::new(
            malaysia(),
            TranscriptionStrategy::ExplicitGeneration {
                language: "ms".into(),
            },
        );
        assert_eq!(handler.status(), &HandlerStatus::Pending);

        let loaded = handler
            .load_with(|descriptor| async move {
                Err::<Arc<dyn SpeechModel>, _>(ModelError::Load {
                    model_id: descriptor.model_id,
                    message: "repository not found".into(),
                })
            })
            .await;

        assert!(!loaded);
        assert!(!handler.is_ready());
        match handler.status() {
            HandlerStatus::Failed { message, .. } => assert!(message.contains("repository not found")),
            other => panic!("unexpected status {:?}", other),
        }

        let dir = tempfile::tempdir().unwrap();
        let clip = write_clip(dir.path(), 0.2);
        assert_eq!(handler.transcribe(&clip).await, None);
    }

    #[tokio::test]
    async fn test_load_success_and_idempotence() {
        let mut handler = ModelHandler::new(
            malaysia(),
            TranscriptionStrategy::ExplicitGeneration {
                language: "ms".into(),
            },
        );
        let model = MockModel::replying("m", "ok");
        let first = model.clone();
        assert!(
            handler
                .load_with(move |_| async move { Ok(first as Arc<dyn SpeechModel>) })
                .await
        );
        assert!(handler.is_ready());

        // A second load does not call the loader again.
        assert!(
            handler
                .load_with(|descriptor| async move {
                    Err::<Arc<dyn SpeechModel>, _>(ModelError::Load {
                        model_id: descriptor.model_id,
                        message: "loader ran twice".into(),
                    })
                })
                .await
        );
        assert!(handler.is_ready());
    }
}

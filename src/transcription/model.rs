//! # Whisper Model
//!
//! Loads Whisper-architecture checkpoints from the Hugging Face hub and runs
//! greedy decoding with Candle.
//!
//! ## Loading Process:
//! 1. Fetch `config.json`, `tokenizer.json` and the weights (cached locally by hf-hub)
//! 2. Build the Slaney mel filterbank for the checkpoint's `num_mel_bins`
//! 3. Memory-map safetensors, or read `pytorch_model.bin` when that is all the repo has
//! 4. Resolve the special tokens the decoder prompt needs
//!
//! ## Inference:
//! `SpeechModel::transcribe` is blocking and must run on a blocking worker.
//! The decoder keeps a cross-attention cache inside the model, so each model
//! serializes its own forward passes behind a mutex.

use crate::error::ModelError;
use crate::transcription::mel;
use crate::transcription::registry::ModelDescriptor;
use anyhow::{anyhow, bail, Context, Result};
use candle_core::{Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, Config};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokenizers::Tokenizer;
use tracing::{debug, info};

/// Rate every model expects its waveform at.
pub const MODEL_SAMPLE_RATE: u32 = m::SAMPLE_RATE as u32;

/// Language codes Whisper has dedicated prompt tokens for.
const LANGUAGES: &[&str] = &[
    "en", "zh", "de", "es", "ru", "ko", "fr", "ja", "pt", "tr", "pl", "ca", "nl", "ar", "sv",
    "it", "id", "hi", "fi", "vi", "he", "uk", "el", "ms", "cs", "ro", "da", "hu", "ta", "no",
    "th", "ur", "hr", "bg", "lt", "la", "mi", "ml", "cy", "sk", "te", "fa", "lv", "bn", "sr",
    "az", "sl", "kn", "et", "mk", "br", "eu", "is", "hy", "ne", "mn", "bs", "kk", "sq", "sw",
    "gl", "mr", "pa", "si", "km", "sn", "yo", "so", "af", "oc", "ka", "be", "tg", "sd", "gu",
    "am", "yi", "lo", "uz", "fo", "ht", "ps", "tk", "nn", "mt", "sa", "lb", "my", "bo", "tl",
    "mg", "as", "tt", "haw", "ln", "ha", "ba", "jw", "su",
];

/// Consecutive repeats of the same n-gram that end decoding.
const LOOP_REPEATS: usize = 4;

/// Which 30 s windows of the waveform get decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPolicy {
    /// Only the first window; longer audio is truncated.
    FirstOnly,
    /// Every window, encoded `batch_size` at a time.
    All { batch_size: usize },
}

impl WindowPolicy {
    /// Number of windows decoded for `samples` at the model rate.
    pub fn window_count(&self, samples: usize) -> usize {
        match self {
            WindowPolicy::FirstOnly => 1,
            WindowPolicy::All { .. } => samples.div_ceil(m::N_SAMPLES).max(1),
        }
    }

    fn batch_size(&self) -> usize {
        match self {
            WindowPolicy::FirstOnly => 1,
            WindowPolicy::All { batch_size } => (*batch_size).max(1),
        }
    }
}

/// Per-call generation settings derived from a handler's strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeRequest {
    /// Forced language code; `None` detects it from the first window.
    pub language: Option<String>,
    /// Upper bound on generated tokens per window.
    pub max_new_tokens: Option<usize>,
    pub windows: WindowPolicy,
}

/// Anything that turns 16 kHz mono samples into text.
pub trait SpeechModel: Send + Sync {
    fn model_id(&self) -> &str;

    /// Blocking. `pcm` is mono at `MODEL_SAMPLE_RATE`.
    fn transcribe(&self, pcm: &[f32], request: &DecodeRequest) -> Result<String, ModelError>;
}

struct SpecialTokens {
    sot: u32,
    eot: u32,
    transcribe: u32,
    no_timestamps: u32,
    /// Language codes this tokenizer knows, with their token ids.
    languages: Vec<(&'static str, u32)>,
}

impl SpecialTokens {
    fn resolve(tokenizer: &Tokenizer) -> Result<Self> {
        let languages = LANGUAGES
            .iter()
            .filter_map(|code| {
                tokenizer
                    .token_to_id(&format!("<|{}|>", code))
                    .map(|id| (*code, id))
            })
            .collect();

        Ok(Self {
            sot: token_id(tokenizer, m::SOT_TOKEN)?,
            eot: token_id(tokenizer, m::EOT_TOKEN)?,
            transcribe: token_id(tokenizer, m::TRANSCRIBE_TOKEN)?,
            no_timestamps: token_id(tokenizer, m::NO_TIMESTAMPS_TOKEN)?,
            languages,
        })
    }

    fn language(&self, code: &str) -> Result<u32> {
        self.languages
            .iter()
            .find(|(known, _)| known.eq_ignore_ascii_case(code))
            .map(|(_, id)| *id)
            .ok_or_else(|| anyhow!("tokenizer has no language token for '{}'", code))
    }
}

fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32> {
    tokenizer
        .token_to_id(token)
        .ok_or_else(|| anyhow!("token not found: {}", token))
}

/// A loaded Whisper checkpoint.
pub struct WhisperModel {
    model_id: String,
    model: Mutex<m::model::Whisper>,
    tokenizer: Tokenizer,
    config: Config,
    device: Device,
    mel_filters: Vec<f32>,
    /// Added to the logits every step; `-inf` on suppressed tokens.
    suppress: Tensor,
    tokens: SpecialTokens,
}

impl WhisperModel {
    /// Download (or reuse from cache) and load the checkpoint a descriptor names.
    ///
    /// ## Parameters:
    /// - **descriptor**: which repository to load, and where its tokenizer lives
    /// - **device**: where tensors are allocated
    /// - **cache_dir**: hub cache override; `HF_HUB_CACHE` / `HF_HOME` otherwise
    pub async fn load(
        descriptor: &ModelDescriptor,
        device: Device,
        cache_dir: Option<&Path>,
    ) -> Result<Self, ModelError> {
        Self::load_inner(descriptor, device, cache_dir)
            .await
            .map_err(|e| ModelError::Load {
                model_id: descriptor.model_id.clone(),
                message: format!("{:#}", e),
            })
    }

    async fn load_inner(
        descriptor: &ModelDescriptor,
        device: Device,
        cache_dir: Option<&Path>,
    ) -> Result<Self> {
        let started = std::time::Instant::now();
        info!(model_id = %descriptor.model_id, "Loading Whisper checkpoint");

        let api = hub_api(cache_dir)?;
        let repo = api.model(descriptor.model_id.clone());

        let config_path = repo
            .get("config.json")
            .await
            .with_context(|| format!("downloading config.json from {}", descriptor.model_id))?;

        let tokenizer_repo = descriptor.tokenizer_id.as_deref().unwrap_or(&descriptor.model_id);
        let tokenizer_path = api
            .model(tokenizer_repo.to_string())
            .get("tokenizer.json")
            .await
            .with_context(|| format!("downloading tokenizer.json from {}", tokenizer_repo))?;

        let (weights_path, safetensors) = match repo.get("model.safetensors").await {
            Ok(path) => (path, true),
            Err(e) => {
                debug!(model_id = %descriptor.model_id, error = %e, "No safetensors weights, trying pytorch_model.bin");
                let path = repo
                    .get("pytorch_model.bin")
                    .await
                    .with_context(|| format!("downloading weights from {}", descriptor.model_id))?;
                (path, false)
            }
        };

        let config: Config = serde_json::from_reader(std::fs::File::open(&config_path)?)
            .context("parsing config.json")?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("loading tokenizer: {}", e))?;
        let tokens = SpecialTokens::resolve(&tokenizer)?;

        let vb = if safetensors {
            // SAFETY: the hub cache file is not modified while mapped.
            unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], m::DTYPE, &device)? }
        } else {
            VarBuilder::from_pth(&weights_path, m::DTYPE, &device)?
        };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        let suppress: Vec<f32> = (0..config.vocab_size as u32)
            .map(|i| {
                if config.suppress_tokens.contains(&i) {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
            .collect();
        let suppress = Tensor::new(suppress.as_slice(), &device)?;
        let mel_filters = mel::mel_filters(m::SAMPLE_RATE, m::N_FFT, config.num_mel_bins);

        info!(
            model_id = %descriptor.model_id,
            mel_bins = config.num_mel_bins,
            languages = tokens.languages.len(),
            elapsed_s = started.elapsed().as_secs_f64(),
            "Whisper checkpoint loaded"
        );

        Ok(Self {
            model_id: descriptor.model_id.clone(),
            model: Mutex::new(model),
            tokenizer,
            config,
            device,
            mel_filters,
            suppress,
            tokens,
        })
    }

    /// Log-mel features for each decoded window, `(1, n_mels, N_FRAMES)` each.
    fn mel_windows(&self, pcm: &[f32], policy: WindowPolicy) -> Result<Vec<Tensor>> {
        let n_mels = self.config.num_mel_bins;
        pcm.chunks(m::N_SAMPLES)
            .take(policy.window_count(pcm.len()))
            .map(|chunk| {
                let mut window = chunk.to_vec();
                window.resize(m::N_SAMPLES, 0.0);
                let mel = m::audio::pcm_to_mel(&self.config, &window, &self.mel_filters);
                let frames = mel.len() / n_mels;
                let mel = Tensor::from_vec(mel, (1, n_mels, frames), &self.device)?;
                Ok(mel.narrow(2, 0, m::N_FRAMES.min(frames))?)
            })
            .collect()
    }

    fn run(&self, pcm: &[f32], request: &DecodeRequest) -> Result<String> {
        if pcm.is_empty() {
            bail!("empty waveform");
        }

        let windows = self.mel_windows(pcm, request.windows)?;
        let budget = request
            .max_new_tokens
            .unwrap_or(self.config.max_target_positions / 2);
        let mut language = match &request.language {
            Some(code) => Some(self.tokens.language(code)?),
            None => None,
        };

        let mut model = self
            .model
            .lock()
            .map_err(|_| anyhow!("model lock poisoned by an earlier panic"))?;

        let mut texts = Vec::new();
        for batch in windows.chunks(request.windows.batch_size()) {
            let mel = Tensor::cat(batch, 0)?;
            let features = model.encoder.forward(&mel, true)?;

            for i in 0..batch.len() {
                let xa = features.narrow(0, i, 1)?;
                if language.is_none() && request.language.is_none() {
                    language = self.detect_language(&mut model, &xa)?;
                }
                let text = self.decode_window(&mut model, &xa, language, budget)?;
                if !text.is_empty() {
                    texts.push(text);
                }
            }
        }
        model.reset_kv_cache();

        debug!(
            model_id = %self.model_id,
            windows = windows.len(),
            chars = texts.iter().map(String::len).sum::<usize>(),
            "Decoded waveform"
        );
        Ok(texts.join(" "))
    }

    /// Most likely language token after the start-of-transcript token.
    fn detect_language(&self, model: &mut m::model::Whisper, xa: &Tensor) -> Result<Option<u32>> {
        if self.tokens.languages.is_empty() {
            return Ok(None);
        }
        let ids: Vec<u32> = self.tokens.languages.iter().map(|(_, id)| *id).collect();
        let ids = Tensor::new(ids.as_slice(), &self.device)?;

        let prompt = Tensor::new(&[[self.tokens.sot]], &self.device)?;
        let ys = model.decoder.forward(&prompt, xa, true)?;
        let logits = model.decoder.final_linear(&ys.i(..1)?)?.i(0)?.i(0)?;
        let best = logits.index_select(&ids, 0)?.argmax(0)?.to_scalar::<u32>()? as usize;

        let (code, id) = self.tokens.languages[best];
        debug!(model_id = %self.model_id, language = code, "Detected language");
        Ok(Some(id))
    }

    fn decode_window(
        &self,
        model: &mut m::model::Whisper,
        xa: &Tensor,
        language: Option<u32>,
        max_new_tokens: usize,
    ) -> Result<String> {
        let mut tokens = vec![self.tokens.sot];
        tokens.extend(language);
        tokens.push(self.tokens.transcribe);
        tokens.push(self.tokens.no_timestamps);
        let prompt_len = tokens.len();

        let limit = max_new_tokens.min(self.config.max_target_positions.saturating_sub(prompt_len));
        for step in 0..limit {
            let input = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = model.decoder.forward(&input, xa, step == 0)?;
            let (_, seq_len, _) = ys.dims3()?;
            let logits = model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?
                .broadcast_add(&self.suppress)?;
            let next = logits.argmax(0)?.to_scalar::<u32>()?;

            if next == self.tokens.eot {
                break;
            }
            if is_repetitive(&tokens[prompt_len..], next) {
                debug!(model_id = %self.model_id, step, "Stopping on repeated tokens");
                break;
            }
            tokens.push(next);
        }

        let text = self
            .tokenizer
            .decode(&tokens[prompt_len..], true)
            .map_err(|e| anyhow!("tokenizer decode: {}", e))?;
        Ok(text.trim().to_string())
    }
}

impl SpeechModel for WhisperModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn transcribe(&self, pcm: &[f32], request: &DecodeRequest) -> Result<String, ModelError> {
        self.run(pcm, request).map_err(|e| ModelError::Inference {
            model_id: self.model_id.clone(),
            message: format!("{:#}", e),
        })
    }
}

/// Hub client honouring `HF_TOKEN` and the cache overrides.
fn hub_api(cache_dir: Option<&Path>) -> Result<hf_hub::api::tokio::Api> {
    use hf_hub::api::tokio::ApiBuilder;

    let mut builder = ApiBuilder::new()
        .with_token(std::env::var("HF_TOKEN").ok())
        .with_progress(false);

    let cache = cache_dir
        .map(Path::to_path_buf)
        .or_else(|| std::env::var("HF_HUB_CACHE").ok().map(PathBuf::from))
        .or_else(|| {
            std::env::var("HF_HOME")
                .ok()
                .map(|home| PathBuf::from(home).join("hub"))
        });
    if let Some(cache) = cache {
        debug!(cache_dir = %cache.display(), "Using hub cache directory");
        builder = builder.with_cache_dir(cache);
    }

    builder.build().context("building Hugging Face hub client")
}

/// True when appending `next` completes a run of the same 1- to 4-token
/// pattern repeated `LOOP_REPEATS` times.
fn is_repetitive(generated: &[u32], next: u32) -> bool {
    let seq: Vec<u32> = generated.iter().copied().chain(std::iter::once(next)).collect();
    (1..=4).any(|k| {
        let span = k * LOOP_REPEATS;
        if seq.len() < span {
            return false;
        }
        let tail = &seq[seq.len() - span..];
        tail.chunks(k).all(|chunk| chunk == &tail[..k])
    })
}

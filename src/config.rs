//! # Configuration Management
//!
//! Loads the service configuration from layered sources:
//! - Default values (the `Default` impl below)
//! - An optional `config.toml` next to the binary
//! - Environment variables with the `APP_` prefix
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms set these)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_AUDIO__DENOISE__PROP_DECREASE`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values
//!
//! Sections are separated by a double underscore so that field names which
//! contain a single underscore (`max_upload_mb`) survive the mapping.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Main application configuration.
///
/// ## Sections:
/// - **server**: where the HTTP listener binds
/// - **models**: base model, region table and inference knobs
/// - **audio**: transcoder, upload limits and noise suppression parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub audio: AudioConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: accept connections from any address (containers)
/// - `workers = 0`: let actix pick one worker per physical core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
}

/// Acoustic model configuration.
///
/// ## Fields:
/// - `base_model_id`: hub repository of the general-purpose model that every request uses
/// - `base_model_name`: short name reported next to the base transcription
/// - `region_table`: optional TOML file replacing the built-in region table
/// - `cache_dir`: hub cache directory (falls back to `HF_HUB_CACHE` / `HF_HOME`)
/// - `device`: `auto`, `cpu`, `cuda` or `metal`
/// - `pipeline_batch_size`: 30-second windows encoded together by the long-form strategy
/// - `raw_max_new_tokens`: token budget of the raw-feature strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub base_model_id: String,
    pub base_model_name: String,
    pub region_table: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub device: String,
    pub pipeline_batch_size: usize,
    pub raw_max_new_tokens: usize,
}

/// Audio ingestion configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Path or name of the ffmpeg executable.
    pub ffmpeg_path: String,
    /// Rate every upload is canonicalized to before denoising.
    pub sample_rate: u32,
    /// Parent directory of per-request scratch files. System temp dir when unset.
    pub temp_dir: Option<PathBuf>,
    /// Uploads larger than this are rejected with 400.
    pub max_upload_mb: usize,
    pub denoise: DenoiseConfig,
}

/// Stationary spectral-gate parameters.
///
/// ## Fields:
/// - `prop_decrease`: fraction by which gated bins are attenuated (0.0 - 1.0)
/// - `freq_mask_smooth_hz`: width of the mask smoothing kernel along frequency
/// - `time_mask_smooth_ms`: width of the mask smoothing kernel along time
/// - `n_std_thresh`: standard deviations above the per-bin mean that count as signal
/// - `n_fft`: STFT window length; the hop is a quarter of it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenoiseConfig {
    pub prop_decrease: f32,
    pub freq_mask_smooth_hz: f32,
    pub time_mask_smooth_ms: f32,
    pub n_std_thresh: f32,
    pub n_fft: usize,
}

impl Default for DenoiseConfig {
    fn default() -> Self {
        Self {
            prop_decrease: 0.75,
            freq_mask_smooth_hz: 100.0,
            time_mask_smooth_ms: 50.0,
            n_std_thresh: 1.5,
            n_fft: 1024,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8000,
                workers: 0,
            },
            models: ModelsConfig {
                base_model_id: "openai/whisper-base".to_string(),
                base_model_name: "whisper-base".to_string(),
                region_table: None,
                cache_dir: None,
                device: "cpu".to_string(),
                pipeline_batch_size: 8,
                raw_max_new_tokens: 255,
            },
            audio: AudioConfig {
                ffmpeg_path: "ffmpeg".to_string(),
                sample_rate: 48_000,
                temp_dir: None,
                max_upload_mb: 50,
                denoise: DenoiseConfig::default(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: override server host
    /// - `APP_MODELS__DEVICE=cuda`: run inference on the first CUDA device
    /// - `APP_AUDIO__FFMPEG_PATH=/opt/ffmpeg/bin/ffmpeg`: custom transcoder
    /// - `HOST` / `PORT`: special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Catches values that would only fail deep inside a request, such as a
    /// zero-length STFT window or an attenuation outside `[0, 1]`.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.models.base_model_id.trim().is_empty() {
            return Err(anyhow::anyhow!("Base model id cannot be empty"));
        }

        if self.models.pipeline_batch_size == 0 {
            return Err(anyhow::anyhow!("Pipeline batch size must be greater than 0"));
        }

        if self.models.raw_max_new_tokens == 0 {
            return Err(anyhow::anyhow!("Raw strategy token budget must be greater than 0"));
        }

        self.models
            .device
            .parse::<crate::device::DevicePreference>()
            .map_err(|e| anyhow::anyhow!(e))?;

        if self.audio.ffmpeg_path.trim().is_empty() {
            return Err(anyhow::anyhow!("ffmpeg path cannot be empty"));
        }

        if self.audio.sample_rate < 8_000 {
            return Err(anyhow::anyhow!(
                "Canonical sample rate must be at least 8000 Hz, got {}",
                self.audio.sample_rate
            ));
        }

        if self.audio.max_upload_mb == 0 {
            return Err(anyhow::anyhow!("Max upload size must be greater than 0"));
        }

        let denoise = &self.audio.denoise;
        if !(0.0..=1.0).contains(&denoise.prop_decrease) {
            return Err(anyhow::anyhow!(
                "prop_decrease must be between 0.0 and 1.0, got {}",
                denoise.prop_decrease
            ));
        }

        if denoise.n_fft < 16 || !denoise.n_fft.is_power_of_two() {
            return Err(anyhow::anyhow!(
                "n_fft must be a power of two >= 16, got {}",
                denoise.n_fft
            ));
        }

        if denoise.freq_mask_smooth_hz <= 0.0 || denoise.time_mask_smooth_ms <= 0.0 {
            return Err(anyhow::anyhow!("Mask smoothing widths must be positive"));
        }

        Ok(())
    }

    /// Upload limit in bytes.
    pub fn max_upload_bytes(&self) -> usize {
        self.audio.max_upload_mb * 1024 * 1024
    }
}

//! # Audio Processing Module
//!
//! Everything that happens to an upload before a model sees it.
//!
//! ## Key Components:
//! - **Job**: scratch-file ownership for one request (`job`)
//! - **Transcoder**: container → mono 16-bit PCM WAV (`transcoder`)
//! - **Spectral gate**: stationary noise suppression (`spectral`)
//! - **Denoiser**: transcode, validate, gate, measure, persist (`denoiser`)
//! - **WAV helpers**: decode, downmix, resample, write (`wav`)

pub mod denoiser;
pub mod job;
pub mod spectral;
pub mod transcoder;
pub mod wav;

pub use denoiser::{AudioDenoiser, NoiseReductionMetrics};
pub use job::AudioJob;
pub use transcoder::{AudioTranscoder, FfmpegTranscoder};

//! # Audio Denoiser
//!
//! Turns an arbitrary upload into a clean mono WAV:
//!
//! 1. Canonicalize to mono 16-bit PCM at the configured rate (external transcoder)
//! 2. Decode and reject empty or silent audio
//! 3. Stationary spectral gating on a blocking worker
//! 4. RMS before/after as a quality signal
//! 5. Persist the result as a new scratch WAV
//!
//! The intermediate canonical file is deleted before `process` returns, on
//! success and failure alike.

use crate::audio::job::scratch_file;
use crate::audio::spectral::SpectralGate;
use crate::audio::transcoder::AudioTranscoder;
use crate::audio::wav;
use crate::config::DenoiseConfig;
use crate::error::PipelineError;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempPath;
use tracing::{debug, info};

/// Signal level before and after suppression.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NoiseReductionMetrics {
    pub original_rms: f32,
    pub denoised_rms: f32,
    /// `original_rms - denoised_rms`; positive when energy was removed.
    pub noise_reduction: f32,
}

impl NoiseReductionMetrics {
    fn measure(original: &[f32], denoised: &[f32]) -> Self {
        let original_rms = wav::rms(original);
        let denoised_rms = wav::rms(denoised);
        Self {
            original_rms,
            denoised_rms,
            noise_reduction: original_rms - denoised_rms,
        }
    }
}

/// Denoised clip plus its metrics. The file is removed when `output` drops.
#[derive(Debug)]
pub struct DenoiseResult {
    pub output: TempPath,
    pub metrics: NoiseReductionMetrics,
}

pub struct AudioDenoiser {
    transcoder: Arc<dyn AudioTranscoder>,
    settings: DenoiseConfig,
    sample_rate: u32,
    gate: Arc<SpectralGate>,
}

impl AudioDenoiser {
    pub fn new(transcoder: Arc<dyn AudioTranscoder>, settings: DenoiseConfig, sample_rate: u32) -> Self {
        let gate = Arc::new(SpectralGate::new(&settings, sample_rate));
        Self {
            transcoder,
            settings,
            sample_rate,
            gate,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Canonicalize, validate and denoise `input`, writing scratch files under `work_dir`.
    ///
    /// ## Returns:
    /// - **Ok(DenoiseResult)**: denoised mono WAV at the canonical rate
    /// - **Err(PipelineError::Conversion)**: the transcoder failed or was missing
    /// - **Err(PipelineError::EmptyAudio)**: no samples, or only zeros
    /// - **Err(PipelineError::Decode / Io / Worker)**: anything else on the way
    pub async fn process(&self, input: &Path, work_dir: &Path) -> Result<DenoiseResult, PipelineError> {
        let started = Instant::now();

        let canonical = scratch_file(work_dir, "canonical-", ".wav")?;
        self.transcoder
            .transcode(input, &canonical, self.sample_rate)
            .await?;

        let output = scratch_file(work_dir, "denoised-", ".wav")?;
        let gate = Arc::clone(&self.gate);
        let settings = self.settings.clone();
        let expected_rate = self.sample_rate;

        // Both scratch files move into the worker so a cancelled request cannot
        // race the worker on file creation; whatever it returns is dropped (and
        // deleted) by the join handle if nobody awaits it.
        let (output, metrics) = tokio::task::spawn_blocking(move || {
            let decoded = wav::read_wav(&canonical);
            if let Err(e) = canonical.close() {
                debug!(error = %e, "Canonical scratch file was already gone");
            }
            let decoded = decoded?;
            let rate = decoded.sample_rate;
            let samples = decoded.into_mono();

            if samples.is_empty() {
                return Err(PipelineError::EmptyAudio("decoded waveform has no samples".into()));
            }
            if samples.iter().all(|&s| s == 0.0) {
                return Err(PipelineError::EmptyAudio("all samples are zero".into()));
            }

            let denoised = if rate == expected_rate {
                gate.reduce(&samples)
            } else {
                SpectralGate::new(&settings, rate).reduce(&samples)
            };

            let metrics = NoiseReductionMetrics::measure(&samples, &denoised);
            wav::write_wav_i16(&output, &denoised, rate)?;
            Ok((output, metrics))
        })
        .await??;

        info!(
            original_rms = metrics.original_rms,
            denoised_rms = metrics.denoised_rms,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Audio denoised"
        );

        Ok(DenoiseResult { output, metrics })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::transcoder::test_support::WavTranscoder;
    use crate::audio::transcoder::FfmpegTranscoder;
    use crate::audio::wav::test_support::{noisy_speech, wav_bytes};

    fn denoiser(transcoder: Arc<dyn AudioTranscoder>) -> AudioDenoiser {
        AudioDenoiser::new(transcoder, DenoiseConfig::default(), 48_000)
    }

    fn file_count(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    /// Stage `bytes` outside the work dir so only pipeline files are counted.
    fn upload(bytes: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.wav");
        std::fs::write(&path, bytes).unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn test_noisy_speech_is_attenuated() {
        let work = tempfile::tempdir().unwrap();
        let (_upload_dir, input) = upload(&wav_bytes(&noisy_speech(1.0, 16_000), 16_000, 1));

        let result = denoiser(Arc::new(WavTranscoder))
            .process(&input, work.path())
            .await
            .unwrap();

        assert!(result.metrics.noise_reduction > 0.0);
        assert!(result.metrics.denoised_rms > 0.0);
        assert!(
            (result.metrics.original_rms - result.metrics.denoised_rms
                - result.metrics.noise_reduction)
                .abs()
                < 1e-6
        );

        let decoded = wav::read_wav(&result.output).unwrap();
        assert_eq!(decoded.sample_rate, 48_000);
        assert_eq!(decoded.channels, 1);
        assert_eq!(decoded.samples.len(), 48_000);

        // Only the denoised output remains.
        assert_eq!(file_count(work.path()), 1);
        drop(result);
        assert_eq!(file_count(work.path()), 0);
    }

    #[tokio::test]
    async fn test_silent_audio_is_rejected() {
        let work = tempfile::tempdir().unwrap();
        let (_upload_dir, input) = upload(&wav_bytes(&vec![0.0; 16_000], 16_000, 1));

        let err = denoiser(Arc::new(WavTranscoder))
            .process(&input, work.path())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::EmptyAudio(_)));
        assert_eq!(file_count(work.path()), 0);
    }

    #[tokio::test]
    async fn test_zero_length_audio_is_rejected() {
        let work = tempfile::tempdir().unwrap();
        let (_upload_dir, input) = upload(&wav_bytes(&[], 16_000, 1));

        let err = denoiser(Arc::new(WavTranscoder))
            .process(&input, work.path())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::EmptyAudio(_)));
        assert_eq!(file_count(work.path()), 0);
    }

    #[tokio::test]
    async fn test_corrupt_upload_is_conversion_error() {
        let work = tempfile::tempdir().unwrap();
        let (_upload_dir, input) = upload(b"\x00\x01garbage");

        let err = denoiser(Arc::new(WavTranscoder))
            .process(&input, work.path())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Conversion(_)));
        assert_eq!(file_count(work.path()), 0);
    }

    #[tokio::test]
    async fn test_missing_transcoder_leaves_no_files() {
        let work = tempfile::tempdir().unwrap();
        let (_upload_dir, input) = upload(&wav_bytes(&noisy_speech(0.2, 16_000), 16_000, 1));

        let err = denoiser(Arc::new(FfmpegTranscoder::new("/nonexistent/ffmpeg")))
            .process(&input, work.path())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Conversion(_)));
        assert_eq!(file_count(work.path()), 0);
    }
}

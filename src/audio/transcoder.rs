//! # Container Canonicalization
//!
//! Uploads arrive in whatever container the client recorded (webm, ogg, mp3,
//! m4a, wav ...). Before denoising, every upload is rewritten as mono 16-bit
//! PCM WAV at the configured rate by an external transcoder.
//!
//! The transcoder is a trait so the pipeline can be exercised without ffmpeg
//! installed.

use crate::error::PipelineError;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

#[async_trait]
pub trait AudioTranscoder: Send + Sync {
    /// Rewrite `input` as mono 16-bit PCM WAV at `sample_rate` into `output`.
    ///
    /// ## Returns:
    /// - **Ok(())**: `output` holds a readable WAV file
    /// - **Err(PipelineError::Conversion)**: the tool failed or could not be launched
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        sample_rate: u32,
    ) -> Result<(), PipelineError>;
}

/// Runs `ffmpeg` as an async child process.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    binary: String,
}

impl FfmpegTranscoder {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Whether the configured binary can be launched at all.
    pub async fn is_available(&self) -> bool {
        Command::new(&self.binary)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl AudioTranscoder for FfmpegTranscoder {
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        sample_rate: u32,
    ) -> Result<(), PipelineError> {
        debug!(
            input = %input.display(),
            output = %output.display(),
            sample_rate,
            "Running ffmpeg"
        );

        let result = Command::new(&self.binary)
            .args(["-hide_banner", "-loglevel", "error", "-nostdin", "-y", "-i"])
            .arg(input)
            .args(["-acodec", "pcm_s16le", "-ar"])
            .arg(sample_rate.to_string())
            .args(["-ac", "1", "-f", "wav"])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                PipelineError::Conversion(format!("could not launch {}: {}", self.binary, e))
            })?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(PipelineError::Conversion(format!(
                "{} exited with {}: {}",
                self.binary,
                result.status,
                stderr.trim()
            )));
        }

        Ok(())
    }
}

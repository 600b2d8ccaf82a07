//! # WAV I/O and Sample Conversion
//!
//! Thin helpers over `hound` and `rubato` shared by the denoiser and the
//! model handlers:
//! - decode any PCM/float WAV into interleaved `f32` in `[-1.0, 1.0]`
//! - collapse interleaved channels into one by averaging
//! - write mono 16-bit PCM
//! - resample between rates (models want 16 kHz, the denoiser works at 48 kHz)

use crate::error::PipelineError;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::path::Path;

/// Decoded audio as it came out of the file.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    /// Interleaved samples, `channels` values per frame.
    pub samples: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
}

impl DecodedAudio {
    /// Mono view of the signal, averaging channels when there are several.
    pub fn into_mono(self) -> Vec<f32> {
        to_mono(self.samples, self.channels)
    }
}

/// Read a WAV file into normalized `f32` samples.
///
/// ## Returns:
/// - **Ok(DecodedAudio)**: samples in `[-1.0, 1.0]`, still interleaved
/// - **Err(PipelineError::Decode)**: not a WAV file or an unsupported layout
pub fn read_wav(path: &Path) -> Result<DecodedAudio, PipelineError> {
    let reader = WavReader::open(path)?;
    let spec = reader.spec();
    let samples = collect_samples(reader, spec)?;

    Ok(DecodedAudio {
        samples,
        channels: spec.channels,
        sample_rate: spec.sample_rate,
    })
}

fn collect_samples<R: std::io::Read>(
    mut reader: WavReader<R>,
    spec: WavSpec,
) -> Result<Vec<f32>, PipelineError> {
    let samples = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Float, 32) => reader.samples::<f32>().collect::<hound::Result<Vec<_>>>()?,
        (SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .map(|s| s.map(|s| s as f32 / 32768.0))
            .collect::<hound::Result<Vec<_>>>()?,
        (SampleFormat::Int, bits @ (8 | 24 | 32)) => {
            let scale = (1i64 << (bits - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|s| s as f32 / scale))
                .collect::<hound::Result<Vec<_>>>()?
        }
        (format, bits) => {
            return Err(PipelineError::Decode(format!(
                "unsupported WAV layout: {:?} at {} bits",
                format, bits
            )))
        }
    };
    Ok(samples)
}

/// Average interleaved channels into a single channel.
pub fn to_mono(samples: Vec<f32>, channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples;
    }
    let channels = channels as usize;
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Write mono samples as 16-bit PCM, clipping to the representable range.
pub fn write_wav_i16(path: &Path, samples: &[f32], sample_rate: u32) -> Result<(), PipelineError> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec)?;
    for &sample in samples {
        writer.write_sample(float_to_i16(sample))?;
    }
    writer.finalize()?;
    Ok(())
}

fn float_to_i16(sample: f32) -> i16 {
    (sample * 32768.0).round().clamp(-32768.0, 32767.0) as i16
}

/// Root-mean-square level of a signal. Zero for an empty slice.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}

/// Resample a mono signal with a windowed-sinc interpolator.
///
/// The input is fed in fixed chunks, then silence until the interpolator has
/// emitted the whole signal. The filter delay is cut from the front so output
/// sample `i` lines up with input time `i / to_rate`.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, PipelineError> {
    use rubato::{
        Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
    };

    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let ratio = to_rate as f64 / from_rate as f64;
    let chunk_size = 1024;

    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, chunk_size, 1)
        .map_err(|e| PipelineError::Decode(format!("resampler init: {}", e)))?;

    let expected_len = (samples.len() as f64 * ratio).round() as usize;
    let delay = resampler.output_delay();
    let mut output = Vec::with_capacity(expected_len + delay + chunk_size);

    let mut feed = |input: &[f32], output: &mut Vec<f32>| -> Result<usize, PipelineError> {
        let mut block = input.to_vec();
        block.resize(chunk_size, 0.0);
        let result = resampler
            .process(std::slice::from_ref(&block), None)
            .map_err(|e| PipelineError::Decode(format!("resample: {}", e)))?;
        let produced = result.first().map_or(0, Vec::len);
        if let Some(channel) = result.first() {
            output.extend_from_slice(channel);
        }
        Ok(produced)
    };

    for chunk in samples.chunks(chunk_size) {
        feed(chunk, &mut output)?;
    }
    // Flush the samples still inside the filter.
    while output.len() < expected_len + delay {
        if feed(&[], &mut output)? == 0 {
            break;
        }
    }

    output.drain(..delay.min(output.len()));
    output.resize(expected_len, 0.0);
    Ok(output)
}

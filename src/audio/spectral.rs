//! # Stationary Spectral Gating
//!
//! Noise suppression that assumes the noise floor does not change over the
//! clip. The clip is its own noise estimate:
//!
//! 1. Hann-windowed STFT (`n_fft`, hop `n_fft / 4`, centered with zero padding)
//! 2. Magnitudes in dB, floored 80 dB under each bin's peak
//! 3. Per-bin threshold `mean + n_std_thresh * std` over time
//! 4. Binary mask of cells above threshold, smoothed with a triangular 2-D kernel
//! 5. Gain `mask * prop_decrease + (1 - prop_decrease)` applied to the spectrum
//! 6. Inverse STFT with window-sum-square normalization
//!
//! Frame transforms and the mask convolution run on the rayon pool; callers
//! are expected to already be on a blocking worker.

use crate::config::DenoiseConfig;
use rayon::prelude::*;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

const TOP_DB: f32 = 80.0;

/// Configured spectral gate for one sample rate.
pub struct SpectralGate {
    n_fft: usize,
    hop: usize,
    prop_decrease: f32,
    n_std_thresh: f32,
    window: Vec<f32>,
    kernel: SmoothingKernel,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
}

/// Normalized outer product of two triangular ramps.
#[derive(Debug, Clone)]
pub struct SmoothingKernel {
    /// Row-major, `freq_len` rows of `time_len` taps.
    pub taps: Vec<f32>,
    pub freq_len: usize,
    pub time_len: usize,
}

impl SmoothingKernel {
    /// Build the kernel from half-widths measured in bins and frames.
    pub fn new(n_grad_freq: usize, n_grad_time: usize) -> Self {
        let freq = triangle(n_grad_freq);
        let time = triangle(n_grad_time);
        let mut taps: Vec<f32> = freq
            .iter()
            .flat_map(|&f| time.iter().map(move |&t| f * t))
            .collect();
        let total: f32 = taps.iter().sum();
        for tap in &mut taps {
            *tap /= total;
        }
        Self {
            taps,
            freq_len: freq.len(),
            time_len: time.len(),
        }
    }
}

/// Symmetric ramp `1/(n+1), 2/(n+1), ..., 1, ..., 1/(n+1)` of length `2n + 1`.
fn triangle(n: usize) -> Vec<f32> {
    let step = 1.0 / (n + 1) as f32;
    (1..=n)
        .map(|i| i as f32 * step)
        .chain(std::iter::once(1.0))
        .chain((1..=n).rev().map(|i| i as f32 * step))
        .collect()
}

impl SpectralGate {
    pub fn new(settings: &DenoiseConfig, sample_rate: u32) -> Self {
        let n_fft = settings.n_fft;
        let hop = (n_fft / 4).max(1);

        let bin_hz = sample_rate as f32 / (n_fft as f32 / 2.0);
        let frame_ms = hop as f32 / sample_rate as f32 * 1000.0;
        let n_grad_freq = ((settings.freq_mask_smooth_hz / bin_hz) as usize).max(1);
        let n_grad_time = ((settings.time_mask_smooth_ms / frame_ms) as usize).max(1);

        let mut planner = FftPlanner::<f32>::new();
        Self {
            n_fft,
            hop,
            prop_decrease: settings.prop_decrease,
            n_std_thresh: settings.n_std_thresh,
            window: hann(n_fft),
            kernel: SmoothingKernel::new(n_grad_freq, n_grad_time),
            forward: planner.plan_fft_forward(n_fft),
            inverse: planner.plan_fft_inverse(n_fft),
        }
    }

    pub fn kernel(&self) -> &SmoothingKernel {
        &self.kernel
    }

    /// Suppress stationary noise in a mono signal. Output length equals input length.
    pub fn reduce(&self, signal: &[f32]) -> Vec<f32> {
        if signal.is_empty() {
            return Vec::new();
        }

        let pad = self.n_fft / 2;
        let mut padded = vec![0.0f32; pad];
        padded.extend_from_slice(signal);
        padded.resize(padded.len() + pad, 0.0);
        if padded.len() < self.n_fft {
            padded.resize(self.n_fft, 0.0);
        }
        let overhang = (padded.len() - self.n_fft) % self.hop;
        if overhang != 0 {
            padded.resize(padded.len() + self.hop - overhang, 0.0);
        }
        let n_frames = 1 + (padded.len() - self.n_fft) / self.hop;

        let mut spectra = self.stft(&padded, n_frames);
        let mask = self.signal_mask(&spectra);
        let smoothed = self.smooth(&mask, n_frames);

        let keep = 1.0 - self.prop_decrease;
        spectra
            .par_iter_mut()
            .zip(smoothed.par_iter())
            .for_each(|(frame, gains)| {
                for (bin, &gain) in frame.iter_mut().zip(gains.iter()) {
                    *bin *= gain * self.prop_decrease + keep;
                }
            });

        let restored = self.istft(&spectra, padded.len());
        restored[pad..pad + signal.len()].to_vec()
    }

    fn n_bins(&self) -> usize {
        self.n_fft / 2 + 1
    }

    /// One half-spectrum per frame.
    fn stft(&self, padded: &[f32], n_frames: usize) -> Vec<Vec<Complex<f32>>> {
        (0..n_frames)
            .into_par_iter()
            .map(|f| {
                let start = f * self.hop;
                let mut buffer: Vec<Complex<f32>> = padded[start..start + self.n_fft]
                    .iter()
                    .zip(&self.window)
                    .map(|(&s, &w)| Complex::new(s * w, 0.0))
                    .collect();
                self.forward.process(&mut buffer);
                buffer.truncate(self.n_bins());
                buffer
            })
            .collect()
    }

    /// 1.0 where a cell rises above its bin's threshold, 0.0 elsewhere.
    fn signal_mask(&self, spectra: &[Vec<Complex<f32>>]) -> Vec<Vec<f32>> {
        let n_bins = self.n_bins();
        let n_frames = spectra.len() as f32;

        let db: Vec<Vec<f32>> = spectra
            .par_iter()
            .map(|frame| frame.iter().map(|c| amp_to_db(c.norm())).collect())
            .collect();

        // Floor and threshold are per bin, computed across time.
        let thresholds: Vec<(f32, f32)> = (0..n_bins)
            .into_par_iter()
            .map(|bin| {
                let peak = db.iter().map(|frame| frame[bin]).fold(f32::MIN, f32::max);
                let floor = peak - TOP_DB;
                let mean = db.iter().map(|frame| frame[bin].max(floor)).sum::<f32>() / n_frames;
                let var = db
                    .iter()
                    .map(|frame| (frame[bin].max(floor) - mean).powi(2))
                    .sum::<f32>()
                    / n_frames;
                (floor, mean + var.sqrt() * self.n_std_thresh)
            })
            .collect();

        db.par_iter()
            .map(|frame| {
                frame
                    .iter()
                    .zip(&thresholds)
                    .map(|(&value, &(floor, thresh))| {
                        if value.max(floor) > thresh {
                            1.0
                        } else {
                            0.0
                        }
                    })
                    .collect()
            })
            .collect()
    }

    /// Same-size 2-D convolution of the mask with the smoothing kernel, zero padded.
    fn smooth(&self, mask: &[Vec<f32>], n_frames: usize) -> Vec<Vec<f32>> {
        let n_bins = self.n_bins() as isize;
        let half_f = (self.kernel.freq_len / 2) as isize;
        let half_t = (self.kernel.time_len / 2) as isize;
        let kernel = &self.kernel;

        (0..n_frames)
            .into_par_iter()
            .map(|t| {
                let t = t as isize;
                (0..n_bins)
                    .map(|f| {
                        let mut acc = 0.0f32;
                        for kf in 0..kernel.freq_len as isize {
                            let src_f = f + kf - half_f;
                            if src_f < 0 || src_f >= n_bins {
                                continue;
                            }
                            let row = &kernel.taps[kf as usize * kernel.time_len..];
                            for kt in 0..kernel.time_len as isize {
                                let src_t = t + kt - half_t;
                                if src_t < 0 || src_t >= n_frames as isize {
                                    continue;
                                }
                                acc += row[kt as usize] * mask[src_t as usize][src_f as usize];
                            }
                        }
                        acc
                    })
                    .collect()
            })
            .collect()
    }

    fn istft(&self, spectra: &[Vec<Complex<f32>>], len: usize) -> Vec<f32> {
        let n_fft = self.n_fft;
        let scale = 1.0 / n_fft as f32;

        let frames: Vec<Vec<f32>> = spectra
            .par_iter()
            .map(|half| {
                let mut full = vec![Complex::new(0.0f32, 0.0); n_fft];
                full[..half.len()].copy_from_slice(half);
                for k in half.len()..n_fft {
                    full[k] = half[n_fft - k].conj();
                }
                self.inverse.process(&mut full);
                full.iter()
                    .zip(&self.window)
                    .map(|(c, &w)| c.re * scale * w)
                    .collect()
            })
            .collect();

        let mut output = vec![0.0f32; len];
        let mut norm = vec![0.0f32; len];
        for (f, frame) in frames.iter().enumerate() {
            let start = f * self.hop;
            for (i, (&sample, &w)) in frame.iter().zip(&self.window).enumerate() {
                output[start + i] += sample;
                norm[start + i] += w * w;
            }
        }
        for (sample, &n) in output.iter_mut().zip(&norm) {
            if n > 1e-8 {
                *sample /= n;
            }
        }
        output
    }
}

/// Periodic Hann window.
fn hann(n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / n as f32).cos())
        .collect()
}

fn amp_to_db(amplitude: f32) -> f32 {
    20.0 * (amplitude + f64::EPSILON as f32).log10()
}

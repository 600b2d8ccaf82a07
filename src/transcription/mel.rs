//! Slaney-style mel filterbank matching the one Whisper checkpoints were
//! trained with (`n_fft = 400` at 16 kHz, area-normalized triangles).
//!
//! The result is laid out row-major, `n_mels` rows of `n_fft / 2 + 1` weights,
//! which is what `whisper::audio::pcm_to_mel` expects.

const F_SP: f64 = 200.0 / 3.0;
const MIN_LOG_HZ: f64 = 1000.0;
const MIN_LOG_MEL: f64 = MIN_LOG_HZ / F_SP;

fn log_step() -> f64 {
    6.4f64.ln() / 27.0
}

fn hz_to_mel(freq: f64) -> f64 {
    if freq < MIN_LOG_HZ {
        freq / F_SP
    } else {
        MIN_LOG_MEL + (freq / MIN_LOG_HZ).ln() / log_step()
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    if mel < MIN_LOG_MEL {
        mel * F_SP
    } else {
        MIN_LOG_HZ * (log_step() * (mel - MIN_LOG_MEL)).exp()
    }
}

/// Build the filterbank for `n_mels` bands between 0 Hz and Nyquist.
pub fn mel_filters(sample_rate: usize, n_fft: usize, n_mels: usize) -> Vec<f32> {
    let n_bins = n_fft / 2 + 1;
    let nyquist = sample_rate as f64 / 2.0;

    let fft_freqs: Vec<f64> = (0..n_bins)
        .map(|i| i as f64 * nyquist / (n_bins - 1) as f64)
        .collect();

    let max_mel = hz_to_mel(nyquist);
    let band_edges: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(max_mel * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut weights = vec![0.0f32; n_mels * n_bins];
    for band in 0..n_mels {
        let (left, centre, right) = (band_edges[band], band_edges[band + 1], band_edges[band + 2]);
        let enorm = 2.0 / (right - left);
        for (bin, &freq) in fft_freqs.iter().enumerate() {
            let rising = (freq - left) / (centre - left);
            let falling = (right - freq) / (right - centre);
            let w = rising.min(falling).max(0.0);
            weights[band * n_bins + bin] = (w * enorm) as f32;
        }
    }
    weights
}

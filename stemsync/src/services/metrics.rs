//! Loudness metrics and peak normalization
//!
//! Levels are dBFS: `20·log10(x + 1e-10)`, so digital silence reports about
//! -200 dB instead of negative infinity.

use super::audio_codec::PcmAudio;
use serde::Serialize;

/// Peak target for stem normalization
pub const NORMALIZE_TARGET_DB: f64 = -1.0;

const LEVEL_FLOOR: f64 = 1e-10;

/// Level and length of one audio buffer
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AudioMetrics {
    /// Seconds
    pub duration: f64,
    pub rms_db: f64,
    pub peak_db: f64,
}

pub fn amplitude_to_db(amplitude: f64) -> f64 {
    20.0 * (amplitude + LEVEL_FLOOR).log10()
}

pub fn db_to_amplitude(db: f64) -> f64 {
    10f64.powf(db / 20.0)
}

/// Compute RMS, peak and duration over all channels
pub fn calculate(audio: &PcmAudio) -> AudioMetrics {
    let (sum_sq, peak) = audio.samples.iter().fold((0.0f64, 0.0f64), |(sum, peak), &s| {
        let s = s as f64;
        (sum + s * s, peak.max(s.abs()))
    });

    let rms = if audio.samples.is_empty() {
        0.0
    } else {
        (sum_sq / audio.samples.len() as f64).sqrt()
    };

    AudioMetrics {
        duration: audio.duration_secs(),
        rms_db: amplitude_to_db(rms),
        peak_db: amplitude_to_db(peak),
    }
}

/// Scale so the absolute peak sits at `target_db`
///
/// All-zero (or empty) audio is left untouched.
pub fn normalize_peak(audio: &mut PcmAudio, target_db: f64) {
    let peak = audio
        .samples
        .iter()
        .fold(0.0f32, |peak, &s| peak.max(s.abs()));

    if peak <= 0.0 {
        return;
    }

    let gain = (db_to_amplitude(target_db) / peak as f64) as f32;
    for s in audio.samples.iter_mut() {
        *s *= gain;
    }
}

//! Vocal confidence from pitch, intensity and harmonicity.
//!
//! Each analysis frame is measured with a normalized autocorrelation: the
//! strongest peak inside the pitch range gives the pitch (Hz) and the
//! harmonics-to-noise ratio (dB), and the frame's mean square gives the
//! intensity in dB SPL. Frames where all three are positive add their product
//! to the score, which is then normalized by the frame count and the per-track
//! maximum of each measurement.

use crate::media::AudioTrack;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Reference sound pressure for dB SPL, in Pa.
const REFERENCE_PRESSURE: f64 = 2e-5;
/// Caps the autocorrelation used for HNR so a perfect tone stays finite (60 dB).
const MAX_CORRELATION: f64 = 0.999_999;

#[derive(thiserror::Error, Debug)]
pub enum ProsodyError {
    #[error("invalid audio: {0}")]
    InvalidAudio(String),

    #[error("analysis task failed: {0}")]
    TaskFailed(String),
}

pub trait ProsodyAnalyzer: Send + Sync {
    /// Confidence in `[0, 100]`.
    fn analyze(&self, audio: Arc<AudioTrack>) -> BoxFuture<'_, Result<i64, ProsodyError>>;
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProsodySettings {
    pub hop: Duration,
    pub window: Duration,
    pub min_pitch_hz: f64,
    pub max_pitch_hz: f64,
    /// Minimum autocorrelation peak for a frame to count as voiced.
    pub voicing_threshold: f64,
    /// Frames quieter than this fraction of the track's peak are silent.
    pub silence_threshold: f64,
}

impl Default for ProsodySettings {
    fn default() -> Self {
        Self {
            hop: Duration::from_millis(10),
            window: Duration::from_millis(40),
            min_pitch_hz: 75.0,
            max_pitch_hz: 600.0,
            voicing_threshold: 0.45,
            silence_threshold: 0.03,
        }
    }
}

/// Measurements for one analysis frame. Undefined values are 0.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ProsodyFrame {
    pub pitch_hz: f64,
    pub intensity_db: f64,
    pub harmonicity_db: f64,
}

/// Confidence score for a sequence of frames.
pub fn confidence_from_frames(frames: &[ProsodyFrame]) -> i64 {
    let (mut max_p, mut max_i, mut max_h) = (0.0f64, 0.0f64, 0.0f64);
    let mut score = 0.0f64;

    for f in frames {
        max_p = max_p.max(f.pitch_hz);
        max_i = max_i.max(f.intensity_db);
        max_h = max_h.max(f.harmonicity_db);
        if f.pitch_hz > 0.0 && f.intensity_db > 0.0 && f.harmonicity_db > 0.0 {
            score += f.pitch_hz * f.intensity_db * f.harmonicity_db;
        }
    }

    let normalizer = frames.len() as f64 * max_p * max_i * max_h;
    if normalizer == 0.0 || !normalizer.is_finite() {
        return 0;
    }
    (score / normalizer * 100.0).round_ties_even() as i64
}

/// Splits `track` into overlapping frames and measures each one.
pub fn measure_frames(track: &AudioTrack, settings: &ProsodySettings) -> Vec<ProsodyFrame> {
    let sr = f64::from(track.sample_rate);
    let window = (settings.window.as_secs_f64() * sr).round() as usize;
    let hop = ((settings.hop.as_secs_f64() * sr).round() as usize).max(1);
    let min_lag = ((sr / settings.max_pitch_hz).floor() as usize).max(1);
    let max_lag = (sr / settings.min_pitch_hz).ceil() as usize;

    let samples = &track.samples;
    if window == 0 || samples.len() < window || max_lag >= window {
        return Vec::new();
    }

    let track_peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
    let silence = f64::from(track_peak) * settings.silence_threshold;
    let count = (samples.len() - window) / hop + 1;

    (0..count)
        .map(|i| {
            let frame = &samples[i * hop..i * hop + window];
            measure_frame(frame, sr, min_lag, max_lag, silence, settings)
        })
        .collect()
}

fn measure_frame(
    frame: &[f32],
    sample_rate: f64,
    min_lag: usize,
    max_lag: usize,
    silence: f64,
    settings: &ProsodySettings,
) -> ProsodyFrame {
    let mean = frame.iter().map(|&s| f64::from(s)).sum::<f64>() / frame.len() as f64;
    let centred: Vec<f64> = frame.iter().map(|&s| f64::from(s) - mean).collect();

    let peak = centred.iter().fold(0.0f64, |m, s| m.max(s.abs()));
    if peak == 0.0 || peak < silence {
        return ProsodyFrame::default();
    }

    let mean_square = centred.iter().map(|s| s * s).sum::<f64>() / centred.len() as f64;
    let intensity_db = 10.0 * (mean_square / (REFERENCE_PRESSURE * REFERENCE_PRESSURE)).log10();

    let correlations: Vec<(usize, f64)> = (min_lag..=max_lag)
        .map(|lag| (lag, normalized_autocorrelation(&centred, lag)))
        .collect();
    let best = correlations
        .iter()
        .fold(f64::MIN, |m, &(_, r)| m.max(r));

    // Shortest lag close to the best peak, so harmonics of the period don't win.
    let chosen = correlations
        .iter()
        .enumerate()
        .find(|&(idx, &(_, r))| {
            let rising = idx == 0 || correlations[idx - 1].1 <= r;
            let falling = idx + 1 == correlations.len() || correlations[idx + 1].1 <= r;
            r >= best * 0.95 && rising && falling
        })
        .map(|(_, &c)| c);

    let Some((lag, r)) = chosen else {
        return ProsodyFrame {
            intensity_db: intensity_db.max(0.0),
            ..ProsodyFrame::default()
        };
    };

    let harmonicity_db = if r > 0.0 {
        let r = r.min(MAX_CORRELATION);
        10.0 * (r / (1.0 - r)).log10()
    } else {
        0.0
    };
    let pitch_hz = if r >= settings.voicing_threshold {
        sample_rate / lag as f64
    } else {
        0.0
    };

    ProsodyFrame {
        pitch_hz,
        intensity_db: if intensity_db.is_finite() { intensity_db } else { 0.0 },
        harmonicity_db,
    }
}

fn normalized_autocorrelation(x: &[f64], lag: usize) -> f64 {
    let n = x.len() - lag;
    let (mut xy, mut xx, mut yy) = (0.0, 0.0, 0.0);
    for i in 0..n {
        let (a, b) = (x[i], x[i + lag]);
        xy += a * b;
        xx += a * a;
        yy += b * b;
    }
    if xx == 0.0 || yy == 0.0 {
        return 0.0;
    }
    xy / (xx * yy).sqrt()
}

/// Native prosody analysis, run on the blocking thread pool.
#[derive(Clone, Debug, Default)]
pub struct AutocorrelationProsodyAnalyzer {
    settings: ProsodySettings,
}

impl AutocorrelationProsodyAnalyzer {
    pub fn new(settings: ProsodySettings) -> Self {
        Self { settings }
    }
}

impl ProsodyAnalyzer for AutocorrelationProsodyAnalyzer {
    fn analyze(&self, audio: Arc<AudioTrack>) -> BoxFuture<'_, Result<i64, ProsodyError>> {
        let settings = self.settings;
        async move {
            if audio.sample_rate == 0 {
                return Err(ProsodyError::InvalidAudio("sample rate is 0".to_owned()));
            }
            let started = Instant::now();
            let confidence = tokio::task::spawn_blocking(move || {
                confidence_from_frames(&measure_frames(&audio, &settings))
            })
            .await
            .map_err(|e| ProsodyError::TaskFailed(e.to_string()))?;
            tracing::info!(
                confidence,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "confidence score calculated"
            );
            Ok(confidence)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    const SR: u32 = 16_000;

    fn tone(freq: f64, secs: f64, amplitude: f64) -> Vec<f32> {
        let n = (secs * f64::from(SR)) as usize;
        (0..n)
            .map(|i| (amplitude * (2.0 * PI * freq * i as f64 / f64::from(SR)).sin()) as f32)
            .collect()
    }

    #[test]
    fn silent_track_scores_zero() {
        let track = AudioTrack::new(SR, vec![0.0; SR as usize]);
        let frames = measure_frames(&track, &ProsodySettings::default());
        assert!(!frames.is_empty());
        assert_eq!(confidence_from_frames(&frames), 0);
    }

    #[test]
    fn no_frames_scores_zero() {
        assert_eq!(confidence_from_frames(&[]), 0);
        let short = AudioTrack::new(SR, vec![0.1; 100]);
        assert!(measure_frames(&short, &ProsodySettings::default()).is_empty());
    }

    #[test]
    fn steady_tone_scores_full_confidence() {
        let track = AudioTrack::new(SR, tone(200.0, 1.0, 0.5));
        let frames = measure_frames(&track, &ProsodySettings::default());
        assert!((frames[10].pitch_hz - 200.0).abs() < 1.0);
        assert!(frames[10].intensity_db > 0.0);
        assert!(frames[10].harmonicity_db > 20.0);
        assert_eq!(confidence_from_frames(&frames), 100);
    }

    #[test]
    fn pitch_tracks_tone_frequency() {
        let track = AudioTrack::new(SR, tone(150.0, 0.5, 0.3));
        let frames = measure_frames(&track, &ProsodySettings::default());
        let pitch = frames[5].pitch_hz;
        assert!((pitch - 150.0).abs() < 2.0, "pitch {pitch}");
    }

    #[test]
    fn half_silent_track_scores_about_half() {
        let mut samples = tone(200.0, 1.0, 0.5);
        samples.extend(std::iter::repeat_n(0.0f32, SR as usize));
        let track = AudioTrack::new(SR, samples);
        let score = confidence_from_frames(&measure_frames(&track, &ProsodySettings::default()));
        assert!((45..=55).contains(&score), "score {score}");
    }

    #[test]
    fn frames_with_a_missing_measure_do_not_add_to_the_score() {
        let frames = [
            ProsodyFrame {
                pitch_hz: 100.0,
                intensity_db: 60.0,
                harmonicity_db: 10.0,
            },
            ProsodyFrame {
                pitch_hz: 0.0,
                intensity_db: 60.0,
                harmonicity_db: 10.0,
            },
        ];
        assert_eq!(confidence_from_frames(&frames), 50);
    }

    #[tokio::test]
    async fn analyzer_runs_off_the_async_threads() {
        let analyzer = AutocorrelationProsodyAnalyzer::default();
        let silent = Arc::new(AudioTrack::new(SR, vec![0.0; SR as usize]));
        assert_eq!(analyzer.analyze(silent).await.unwrap(), 0);

        let bad = Arc::new(AudioTrack::new(0, vec![0.0; 10]));
        assert!(analyzer.analyze(bad).await.is_err());
    }
}

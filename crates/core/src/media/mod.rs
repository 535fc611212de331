mod frames;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub use frames::{
    sample_frames, sample_positions, FfmpegFrameSource, Frame, FrameError, FrameSource, VideoInfo,
};

/// Sample rate every extracted track is resampled to.
pub const ANALYSIS_SAMPLE_RATE: u32 = 16_000;

/// A local video file the pipeline can read.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VideoHandle(PathBuf);

impl VideoHandle {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

/// Mono f32 PCM pulled out of a video.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioTrack {
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

impl AudioTrack {
    pub fn new(sample_rate: u32, samples: Vec<f32>) -> Self {
        Self {
            sample_rate,
            samples,
        }
    }

    pub fn duration(&self) -> Duration {
        duration_from_samples(self.sample_rate, self.samples.len())
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Consecutive pieces of at most `max_len` each, covering the whole track.
    pub fn split(&self, max_len: Duration) -> Vec<AudioTrack> {
        let per_chunk = (max_len.as_secs_f64() * f64::from(self.sample_rate)) as usize;
        if per_chunk == 0 || self.samples.len() <= per_chunk {
            return vec![self.clone()];
        }
        self.samples
            .chunks(per_chunk)
            .map(|chunk| AudioTrack::new(self.sample_rate, chunk.to_vec()))
            .collect()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ExtractError {
    #[error("ffmpeg unavailable: {0}")]
    FfmpegUnavailable(String),

    #[error("ffmpeg failed: {0}")]
    FfmpegFailed(String),

    #[error("invalid pcm output: {0}")]
    InvalidPcm(String),

    #[error("video has no audio track: {0}")]
    NoAudio(PathBuf),
}

pub type Result<T> = std::result::Result<T, ExtractError>;

pub trait MediaExtractor: Send + Sync {
    fn extract_audio(&self, video: VideoHandle) -> BoxFuture<'_, Result<AudioTrack>>;
}

#[derive(Clone, Debug, Default)]
pub struct FfmpegMediaExtractor;

impl FfmpegMediaExtractor {
    pub fn new() -> Self {
        Self
    }

    fn parse_f32le_mono(raw: &[u8]) -> Result<Vec<f32>> {
        if !raw.len().is_multiple_of(4usize) {
            return Err(ExtractError::InvalidPcm(format!(
                "f32le byte length must be multiple of 4, got {}",
                raw.len()
            )));
        }
        let mut out = Vec::with_capacity(raw.len() / 4);
        for chunk in raw.chunks_exact(4) {
            out.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        Ok(out)
    }

    async fn decode_with_ffmpeg(&self, video: &Path) -> Result<Vec<f32>> {
        let output = tokio::process::Command::new(ffmpeg_program())
            .args(["-hide_banner", "-nostdin", "-loglevel", "error", "-i"])
            .arg(video)
            .args([
                "-vn",
                "-sn",
                "-dn",
                "-ac",
                "1",
                "-ar",
                "16000",
                "-f",
                "f32le",
                "-acodec",
                "pcm_f32le",
                "pipe:1",
            ])
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ExtractError::FfmpegFailed(e.to_string()))?;

        if !output.status.success() {
            let stderr_s = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            if stderr_s.contains("does not contain any stream")
                || stderr_s.contains("matches no streams")
            {
                return Err(ExtractError::NoAudio(video.to_path_buf()));
            }
            return Err(ExtractError::FfmpegFailed(format!(
                "exit_code={:?} stderr={stderr_s}",
                output.status.code()
            )));
        }

        Self::parse_f32le_mono(&output.stdout)
    }
}

impl MediaExtractor for FfmpegMediaExtractor {
    fn extract_audio(&self, video: VideoHandle) -> BoxFuture<'_, Result<AudioTrack>> {
        async move {
            let started = Instant::now();
            ensure_ffmpeg_available()?;
            let samples = self.decode_with_ffmpeg(video.path()).await?;
            if samples.is_empty() {
                return Err(ExtractError::NoAudio(video.path().to_path_buf()));
            }
            let track = AudioTrack::new(ANALYSIS_SAMPLE_RATE, samples);
            tracing::info!(
                video = %video.path().display(),
                audio_secs = track.duration().as_secs_f32(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "audio extracted"
            );
            Ok(track)
        }
        .boxed()
    }
}

#[cfg(feature = "ffmpeg-sidecar")]
pub(crate) fn ensure_ffmpeg_available() -> Result<()> {
    ffmpeg_sidecar::download::auto_download()
        .map_err(|e| ExtractError::FfmpegUnavailable(e.to_string()))
}

#[cfg(not(feature = "ffmpeg-sidecar"))]
pub(crate) fn ensure_ffmpeg_available() -> Result<()> {
    Ok(())
}

#[cfg(feature = "ffmpeg-sidecar")]
pub(crate) fn ffmpeg_program() -> PathBuf {
    ffmpeg_sidecar::paths::ffmpeg_path()
}

#[cfg(not(feature = "ffmpeg-sidecar"))]
pub(crate) fn ffmpeg_program() -> PathBuf {
    PathBuf::from("ffmpeg")
}

#[cfg(feature = "ffmpeg-sidecar")]
pub(crate) fn ffprobe_program() -> PathBuf {
    ffmpeg_sidecar::ffprobe::ffprobe_path()
}

#[cfg(not(feature = "ffmpeg-sidecar"))]
pub(crate) fn ffprobe_program() -> PathBuf {
    PathBuf::from("ffprobe")
}

pub fn duration_from_samples(sample_rate_hz: u32, samples: usize) -> Duration {
    if sample_rate_hz == 0 {
        return Duration::from_secs(0);
    }
    let micros = (u128::from(samples as u64) * 1_000_000u128) / u128::from(sample_rate_hz);
    Duration::from_micros(micros.min(u128::from(u64::MAX)) as u64)
}

/// Encodes a track as 16-bit PCM WAV, the format speech APIs accept.
pub fn encode_wav(track: &AudioTrack) -> std::result::Result<Vec<u8>, hound::Error> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: track.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &s in &track.samples {
            let v = (s.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
            writer.write_sample(v)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

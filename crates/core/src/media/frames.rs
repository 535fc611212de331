use crate::media::{ensure_ffmpeg_available, ffmpeg_program, ffprobe_program, VideoHandle};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};

/// One decoded video frame, PNG-encoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub index: u64,
    pub png: Bytes,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct VideoInfo {
    pub frame_count: u64,
    pub frame_rate: f64,
}

#[derive(thiserror::Error, Debug)]
pub enum FrameError {
    #[error("ffmpeg unavailable: {0}")]
    FfmpegUnavailable(String),

    #[error("ffprobe failed: {0}")]
    ProbeFailed(String),

    #[error("video has no video stream")]
    NoVideoStream,

    #[error("frame {index} could not be read: {details}")]
    ReadFailed { index: u64, details: String },
}

pub trait FrameSource: Send + Sync {
    fn probe(&self, video: VideoHandle) -> BoxFuture<'_, Result<VideoInfo, FrameError>>;

    /// Reads frame `index`. `info` is the result of [`FrameSource::probe`] for `video`.
    fn read_frame(
        &self,
        video: VideoHandle,
        info: VideoInfo,
        index: u64,
    ) -> BoxFuture<'_, Result<Frame, FrameError>>;
}

/// Zero-based frame indices to sample from a video of `frame_count` frames.
///
/// Frames are `jump` apart, where `jump = frame_count / samples` (at least 1),
/// starting at `jump` and stopping before `frame_count - 2 * jump`, so both
/// ends of the recording are skipped.
pub fn sample_positions(frame_count: u64, samples: u64) -> Vec<u64> {
    let jump = (frame_count / samples.max(1)).max(1);
    let end = frame_count.saturating_sub(jump.saturating_mul(2));
    (jump..end)
        .step_by(usize::try_from(jump).unwrap_or(usize::MAX))
        .map(|position| position - 1)
        .collect()
}

/// Lazily reads the sampled frames of `video`, one ffmpeg call per frame.
///
/// Nothing is read until the stream is polled. Each call probes the video
/// again and starts from the first position.
pub fn sample_frames<'a>(
    source: &'a dyn FrameSource,
    video: VideoHandle,
    samples: u64,
) -> BoxStream<'a, Result<Frame, FrameError>> {
    let probe_video = video.clone();
    stream::once(async move { source.probe(probe_video).await })
        .map(move |probed| match probed {
            Ok(info) => {
                let video = video.clone();
                let positions = sample_positions(info.frame_count, samples);
                tracing::debug!(
                    frame_count = info.frame_count,
                    sampled = positions.len(),
                    "sampling frames"
                );
                stream::iter(positions)
                    .then(move |index| source.read_frame(video.clone(), info, index))
                    .boxed()
            }
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        })
        .flatten()
        .boxed()
}

#[derive(Clone, Debug, Default)]
pub struct FfmpegFrameSource;

impl FfmpegFrameSource {
    pub fn new() -> Self {
        Self
    }

    fn parse_probe(stdout: &[u8]) -> Result<VideoInfo, FrameError> {
        let json: serde_json::Value =
            serde_json::from_slice(stdout).map_err(|e| FrameError::ProbeFailed(e.to_string()))?;

        let stream = json["streams"]
            .as_array()
            .and_then(|s| s.first())
            .ok_or(FrameError::NoVideoStream)?;

        let frame_rate = parse_frame_rate(
            stream["avg_frame_rate"]
                .as_str()
                .or_else(|| stream["r_frame_rate"].as_str())
                .unwrap_or("0"),
        );

        let counted = |key: &str| {
            stream[key]
                .as_str()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|&n| n > 0)
        };

        let frame_count = counted("nb_read_packets")
            .or_else(|| counted("nb_frames"))
            .or_else(|| {
                let duration = json["format"]["duration"]
                    .as_str()
                    .and_then(|d| d.parse::<f64>().ok())?;
                let estimate = (duration * frame_rate).floor();
                (estimate > 0.0).then_some(estimate as u64)
            })
            .unwrap_or(0);

        Ok(VideoInfo {
            frame_count,
            frame_rate,
        })
    }
}

impl FrameSource for FfmpegFrameSource {
    fn probe(&self, video: VideoHandle) -> BoxFuture<'_, Result<VideoInfo, FrameError>> {
        async move {
            ensure_ffmpeg_available().map_err(|e| FrameError::FfmpegUnavailable(e.to_string()))?;
            let output = tokio::process::Command::new(ffprobe_program())
                .args([
                    "-v",
                    "error",
                    "-select_streams",
                    "v:0",
                    "-count_packets",
                    "-show_entries",
                    "stream=nb_read_packets,nb_frames,avg_frame_rate,r_frame_rate:format=duration",
                    "-of",
                    "json",
                ])
                .arg(video.path())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| FrameError::ProbeFailed(e.to_string()))?;

            if !output.status.success() {
                return Err(FrameError::ProbeFailed(
                    String::from_utf8_lossy(&output.stderr).trim().to_owned(),
                ));
            }
            Self::parse_probe(&output.stdout)
        }
        .boxed()
    }

    fn read_frame(
        &self,
        video: VideoHandle,
        info: VideoInfo,
        index: u64,
    ) -> BoxFuture<'_, Result<Frame, FrameError>> {
        async move {
            let (before_input, after_input) = frame_args(index, info.frame_rate);
            let output = tokio::process::Command::new(ffmpeg_program())
                .args(["-hide_banner", "-nostdin", "-loglevel", "error"])
                .args(&before_input)
                .arg("-i")
                .arg(video.path())
                .args(&after_input)
                .stdin(std::process::Stdio::null())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| FrameError::ReadFailed {
                    index,
                    details: e.to_string(),
                })?;

            if !output.status.success() || output.stdout.is_empty() {
                return Err(FrameError::ReadFailed {
                    index,
                    details: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
                });
            }

            Ok(Frame {
                index,
                png: Bytes::from(output.stdout),
            })
        }
        .boxed()
    }
}

/// ffmpeg arguments placed before and after `-i` to grab frame `index` as PNG.
///
/// With a known frame rate the input is seeked to the frame's timestamp, so
/// only the frames after the nearest keyframe are decoded. Without one, the
/// `select` filter counts frames from the start.
fn frame_args(index: u64, frame_rate: f64) -> (Vec<String>, Vec<String>) {
    let mut before_input = Vec::new();
    let mut after_input = Vec::new();
    if frame_rate > 0.0 && frame_rate.is_finite() {
        before_input.extend(["-ss".to_owned(), format!("{:.6}", index as f64 / frame_rate)]);
    } else {
        after_input.extend([
            "-vf".to_owned(),
            format!("select=eq(n\\,{index})"),
            "-vsync".to_owned(),
            "0".to_owned(),
        ]);
    }
    after_input.extend(
        ["-frames:v", "1", "-f", "image2pipe", "-vcodec", "png", "pipe:1"].map(str::to_owned),
    );
    (before_input, after_input)
}

/// Parses ffprobe rates such as `30000/1001` or `25`.
fn parse_frame_rate(raw: &str) -> f64 {
    match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().unwrap_or(0.0);
            let den: f64 = den.trim().parse().unwrap_or(0.0);
            if den == 0.0 {
                0.0
            } else {
                num / den
            }
        }
        None => raw.trim().parse().unwrap_or(0.0),
    }
}

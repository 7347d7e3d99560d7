//! Decoder/encoder seam of the conversion pipeline.
//!
//! The pipeline only talks to these traits. The production implementation
//! drives ffmpeg child processes (see [`crate::ffmpeg`]); tests use a scripted
//! in-memory backend.

use std::path::Path;
use anyhow::Result;
use async_trait::async_trait;
use crate::format::{AudioCodec, OutputFormat, OutputKind, VideoCodec};

/// Fallback sample rate when the source does not report one
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;
/// Fallback channel count when the source does not report one
pub const DEFAULT_CHANNELS: u32 = 2;

/// Properties of an opened source
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SourceInfo {
    /// Total duration in microseconds, the unit of every unit timestamp
    pub duration_us: Option<i64>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u32>,
    /// Video properties, only probed for audio+video conversions
    pub video: Option<VideoInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    /// Bits per second, if the container reports it
    pub bitrate: Option<u64>,
}

impl SourceInfo {
    /// Duration usable for progress math (known and positive)
    pub fn progress_duration(&self) -> Option<i64> {
        self.duration_us.filter(|d| *d > 0)
    }
}

/// A block of interleaved signed 16-bit little-endian samples
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBlock {
    pub timestamp_us: i64,
    pub sample_rate: u32,
    pub channels: u32,
    pub samples: Vec<u8>,
}

/// One raw decoded picture
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub timestamp_us: i64,
    pub data: Vec<u8>,
}

/// A decoded unit pulled from a source
#[derive(Debug, Clone, PartialEq)]
pub enum MediaUnit {
    Audio(AudioBlock),
    Video(VideoFrame),
}

impl MediaUnit {
    pub fn timestamp_us(&self) -> i64 {
        match self {
            MediaUnit::Audio(block) => block.timestamp_us,
            MediaUnit::Video(frame) => frame.timestamp_us,
        }
    }
}

/// Encoder parameters of the output
#[derive(Debug, Clone, PartialEq)]
pub struct SinkConfig {
    pub format: OutputFormat,
    pub audio_codec: AudioCodec,
    pub sample_rate: u32,
    pub channels: u32,
    pub video: Option<VideoSinkConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoSinkConfig {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub bitrate: Option<u64>,
}

impl SinkConfig {
    /// Pick encoders for `format` and forward the source properties it needs.
    ///
    /// Sample rate is always taken from the source. Video geometry, frame rate
    /// and bitrate are only forwarded for audio+video formats, and such a
    /// format requires the source to have a video stream.
    pub fn for_format(format: OutputFormat, source: &SourceInfo) -> Result<Self> {
        let video = match format.video_codec() {
            Some(codec) => {
                let info = source
                    .video
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("source has no video stream for {} output", format))?;
                Some(VideoSinkConfig {
                    codec,
                    width: info.width,
                    height: info.height,
                    frame_rate: info.frame_rate,
                    bitrate: info.bitrate,
                })
            }
            None => None,
        };

        Ok(SinkConfig {
            format,
            audio_codec: format.audio_codec(),
            sample_rate: source.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE),
            channels: source.channels.unwrap_or(DEFAULT_CHANNELS),
            video,
        })
    }
}

/// Streaming decoder over one input
#[async_trait]
pub trait MediaSource: Send {
    fn info(&self) -> &SourceInfo;

    /// Next decoded unit, `None` once the source is exhausted
    async fn next_unit(&mut self) -> Result<Option<MediaUnit>>;
}

/// Streaming encoder writing one output file
#[async_trait]
pub trait MediaSink: Send {
    async fn write_samples(&mut self, block: &AudioBlock) -> Result<()>;

    async fn write_frame(&mut self, frame: &VideoFrame) -> Result<()>;

    /// Flush and finalize the container. The output is complete only after this returns Ok.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Factory for sources and sinks
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Open `input` for decoding the streams `kind` needs
    async fn open_source(&self, input: &Path, kind: OutputKind) -> Result<Box<dyn MediaSource>>;

    /// Create `output` configured by `config`. `input` is the file the units come
    /// from, for backends that take parts of the output (e.g. the audio track of
    /// an audio+video output) directly from it.
    async fn open_sink(
        &self,
        output: &Path,
        config: &SinkConfig,
        input: &Path,
    ) -> Result<Box<dyn MediaSink>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn av_source() -> SourceInfo {
        SourceInfo {
            duration_us: Some(10_000_000),
            sample_rate: Some(48_000),
            channels: Some(2),
            video: Some(VideoInfo {
                width: 1280,
                height: 720,
                frame_rate: 29.97,
                bitrate: Some(2_500_000),
            }),
        }
    }

    #[test]
    fn test_audio_only_ignores_video_properties() {
        let config = SinkConfig::for_format(OutputFormat::Mp3, &av_source()).unwrap();
        assert_eq!(config.audio_codec, AudioCodec::Mp3);
        assert_eq!(config.sample_rate, 48_000);
        assert_eq!(config.video, None);
    }

    #[test]
    fn test_audio_video_forwards_rate_and_bitrate() {
        let config = SinkConfig::for_format(OutputFormat::Mp4, &av_source()).unwrap();
        let video = config.video.unwrap();
        assert_eq!(video.codec, VideoCodec::H264);
        assert_eq!((video.width, video.height), (1280, 720));
        assert_eq!(video.frame_rate, 29.97);
        assert_eq!(video.bitrate, Some(2_500_000));
        assert_eq!(config.sample_rate, 48_000);
        assert_eq!(config.audio_codec, AudioCodec::Aac);
    }

    #[test]
    fn test_audio_video_requires_video_stream() {
        let source = SourceInfo {
            video: None,
            ..av_source()
        };
        assert!(SinkConfig::for_format(OutputFormat::Mp4, &source).is_err());
        assert!(SinkConfig::for_format(OutputFormat::Wav, &source).is_ok());
    }

    #[test]
    fn test_missing_audio_properties_fall_back() {
        let config = SinkConfig::for_format(OutputFormat::Wav, &SourceInfo::default()).unwrap();
        assert_eq!(config.sample_rate, DEFAULT_SAMPLE_RATE);
        assert_eq!(config.channels, DEFAULT_CHANNELS);
    }

    #[test]
    fn test_progress_duration_rejects_non_positive() {
        let mut info = SourceInfo::default();
        assert_eq!(info.progress_duration(), None);
        info.duration_us = Some(0);
        assert_eq!(info.progress_duration(), None);
        info.duration_us = Some(-5);
        assert_eq!(info.progress_duration(), None);
        info.duration_us = Some(1);
        assert_eq!(info.progress_duration(), Some(1));
    }
}

use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Formats accepted by the converter, in the order they are listed to users
pub const SUPPORTED_FORMATS: &[OutputFormat] = &[
    OutputFormat::Mp4,
    OutputFormat::Mp3,
    OutputFormat::Ogg,
    OutputFormat::Wav,
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("Unsupported format: {0}")]
    Unsupported(String),
}

/// Target container of a conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// H.264 video with AAC audio in an MP4 container
    Mp4,
    /// MP3 audio
    Mp3,
    /// Vorbis audio in an Ogg container
    Ogg,
    /// Uncompressed 16-bit PCM in a WAV container
    Wav,
}

/// Whether a conversion carries a video track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    AudioOnly,
    AudioVideo,
}

/// Audio encoders used by the supported formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    PcmS16le,
    Mp3,
    Vorbis,
    Aac,
}

impl AudioCodec {
    /// Get the FFmpeg encoder name for this codec
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            AudioCodec::PcmS16le => "pcm_s16le",
            AudioCodec::Mp3 => "libmp3lame",
            AudioCodec::Vorbis => "libvorbis",
            AudioCodec::Aac => "aac",
        }
    }
}

/// Video encoders used by the supported formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
}

impl VideoCodec {
    /// Get the FFmpeg encoder name for this codec
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "libx264",
        }
    }
}

impl OutputFormat {
    /// Parse a user-supplied format name against the whitelist (case-insensitive)
    pub fn parse(raw: &str) -> Result<Self, FormatError> {
        match raw.trim().to_lowercase().as_str() {
            "mp4" => Ok(OutputFormat::Mp4),
            "mp3" => Ok(OutputFormat::Mp3),
            "ogg" => Ok(OutputFormat::Ogg),
            "wav" => Ok(OutputFormat::Wav),
            other => Err(FormatError::Unsupported(other.to_string())),
        }
    }

    pub fn kind(&self) -> OutputKind {
        match self {
            OutputFormat::Mp4 => OutputKind::AudioVideo,
            OutputFormat::Mp3 | OutputFormat::Ogg | OutputFormat::Wav => OutputKind::AudioOnly,
        }
    }

    /// File extension (without the dot) of the produced artifact
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Mp4 => "mp4",
            OutputFormat::Mp3 => "mp3",
            OutputFormat::Ogg => "ogg",
            OutputFormat::Wav => "wav",
        }
    }

    /// Muxer name passed to ffmpeg's `-f`
    pub fn muxer(&self) -> &'static str {
        // Extensions and muxer names happen to coincide for the whitelist
        self.extension()
    }

    /// Audio encoder for this format
    pub fn audio_codec(&self) -> AudioCodec {
        match self {
            OutputFormat::Wav => AudioCodec::PcmS16le,
            OutputFormat::Mp3 => AudioCodec::Mp3,
            OutputFormat::Ogg => AudioCodec::Vorbis,
            OutputFormat::Mp4 => AudioCodec::Aac,
        }
    }

    /// Video encoder for this format, `None` for audio-only formats
    pub fn video_codec(&self) -> Option<VideoCodec> {
        match self.kind() {
            OutputKind::AudioVideo => Some(VideoCodec::H264),
            OutputKind::AudioOnly => None,
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for OutputFormat {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OutputFormat::parse(s)
    }
}

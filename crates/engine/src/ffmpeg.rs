//! ffmpeg child-process implementation of the media seam.
//!
//! A source is an `ffmpeg` process decoding the input to raw units on its
//! stdout (16-bit PCM for audio-only conversions, yuv420p frames at a constant
//! rate for audio+video ones). A sink is a second `ffmpeg` process encoding raw
//! units from its stdin into the output container.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use crate::config::ConverterConfig;
use crate::ffprobe::{self, DEFAULT_FRAME_RATE};
use crate::format::{OutputKind, SUPPORTED_FORMATS};
use crate::media::{
    AudioBlock, MediaBackend, MediaSink, MediaSource, MediaUnit, SinkConfig, SourceInfo, VideoFrame,
    VideoInfo, DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE,
};

/// Oldest ffmpeg major version the argument sets below are written against
pub const MIN_FFMPEG_MAJOR: u32 = 4;

const BYTES_PER_SAMPLE: usize = 2;

/// FFmpeg version information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FFmpegVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FFmpegVersion {
    pub fn meets_requirement(&self) -> bool {
        self.major >= MIN_FFMPEG_MAJOR
    }

    /// Parse version from FFmpeg version string
    /// Example: "ffmpeg version 6.1.1-3ubuntu5" -> FFmpegVersion { major: 6, minor: 1, patch: 1 }
    pub fn parse(version_str: &str) -> Result<Self> {
        let version_part = version_str
            .split_whitespace()
            .find(|s| s.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false))
            .ok_or_else(|| anyhow!("No version number found in: {}", version_str))?;

        // Distribution builds append suffixes like "-3ubuntu5" or "-static"
        let numeric: String = version_part
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        let mut parts = numeric.split('.').filter(|p| !p.is_empty());

        let major = parts
            .next()
            .ok_or_else(|| anyhow!("No major version in: {}", version_str))?
            .parse::<u32>()
            .with_context(|| format!("Invalid major version in: {}", version_str))?;
        let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);

        Ok(FFmpegVersion { major, minor, patch })
    }
}

/// What `convd check` reports about the installed ffmpeg
#[derive(Debug, Clone)]
pub struct ToolchainReport {
    pub version: FFmpegVersion,
    /// Encoder name and whether this ffmpeg build provides it
    pub encoders: Vec<(&'static str, bool)>,
}

impl ToolchainReport {
    pub fn missing_encoders(&self) -> Vec<&'static str> {
        self.encoders
            .iter()
            .filter(|(_, available)| !available)
            .map(|(name, _)| *name)
            .collect()
    }

    pub fn is_usable(&self) -> bool {
        self.version.meets_requirement() && self.missing_encoders().is_empty()
    }
}

/// Media backend driving the `ffmpeg` and `ffprobe` binaries
#[derive(Debug, Clone)]
pub struct FfmpegBackend {
    ffmpeg_bin: PathBuf,
    ffprobe_bin: PathBuf,
    audio_block_samples: usize,
}

impl FfmpegBackend {
    pub fn new(config: &ConverterConfig) -> Self {
        Self {
            ffmpeg_bin: config.ffmpeg_bin.clone(),
            ffprobe_bin: config.ffprobe_bin.clone(),
            audio_block_samples: config.audio_block_samples.max(1),
        }
    }

    /// Detect the ffmpeg version and the encoders the supported formats need
    pub async fn check(&self) -> Result<ToolchainReport> {
        let output = Command::new(&self.ffmpeg_bin)
            .arg("-version")
            .output()
            .await
            .with_context(|| format!("Failed to execute FFmpeg at: {}", self.ffmpeg_bin.display()))?;
        if !output.status.success() {
            return Err(anyhow!("FFmpeg version check failed"));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let first_line = stdout
            .lines()
            .next()
            .ok_or_else(|| anyhow!("Empty output from FFmpeg -version"))?;
        let version = FFmpegVersion::parse(first_line)?;

        let output = Command::new(&self.ffmpeg_bin)
            .arg("-hide_banner")
            .arg("-encoders")
            .output()
            .await
            .with_context(|| format!("Failed to query FFmpeg encoders at: {}", self.ffmpeg_bin.display()))?;
        if !output.status.success() {
            return Err(anyhow!("FFmpeg encoder query failed"));
        }
        let listing = String::from_utf8_lossy(&output.stdout);

        Ok(ToolchainReport {
            version,
            encoders: required_encoders()
                .into_iter()
                .map(|name| (name, lists_encoder(&listing, name)))
                .collect(),
        })
    }
}

/// Encoder names used by the whitelist, without duplicates
fn required_encoders() -> Vec<&'static str> {
    let mut names = Vec::new();
    for format in SUPPORTED_FORMATS {
        let audio = format.audio_codec().ffmpeg_name();
        if !names.contains(&audio) {
            names.push(audio);
        }
        if let Some(video) = format.video_codec() {
            if !names.contains(&video.ffmpeg_name()) {
                names.push(video.ffmpeg_name());
            }
        }
    }
    names
}

/// `ffmpeg -encoders` lines look like " A....D libmp3lame  libmp3lame MP3 ..."
fn lists_encoder(listing: &str, name: &str) -> bool {
    listing
        .lines()
        .any(|line| line.split_whitespace().nth(1) == Some(name))
}

/// Size of one raw yuv420p picture
pub fn yuv420p_frame_size(width: u32, height: u32) -> usize {
    let (w, h) = (width as usize, height as usize);
    let chroma = w.div_ceil(2) * h.div_ceil(2);
    w * h + 2 * chroma
}

fn format_rate(rate: f64) -> String {
    // ffmpeg accepts decimal rates; trim the noise of 30000/1001-style values
    let rounded = (rate * 1000.0).round() / 1000.0;
    rounded.to_string()
}

/// How the decoder lays units out on its stdout
#[derive(Debug, Clone, Copy, PartialEq)]
enum RawLayout {
    Pcm { sample_rate: u32, channels: u32 },
    Yuv420p { frame_rate: f64 },
}

impl RawLayout {
    /// Bytes the decoder writes per unit read: a block of sample frames, or one picture
    fn unit_bytes(&self, video: Option<&VideoInfo>, audio_block_samples: usize) -> Result<usize> {
        let bytes = match (self, video) {
            (RawLayout::Pcm { channels, .. }, _) => {
                audio_block_samples * *channels as usize * BYTES_PER_SAMPLE
            }
            (RawLayout::Yuv420p { .. }, Some(video)) => yuv420p_frame_size(video.width, video.height),
            (RawLayout::Yuv420p { .. }, None) => return Err(anyhow!("no video stream to decode")),
        };
        if bytes == 0 {
            return Err(anyhow!("decoder layout {:?} has an empty unit", self));
        }
        Ok(bytes)
    }

    /// Presentation time of the unit starting at `position` (sample frames or pictures)
    fn timestamp_us(&self, position: u64) -> i64 {
        match *self {
            RawLayout::Pcm { sample_rate, .. } => (u128::from(position) * 1_000_000)
                .checked_div(u128::from(sample_rate))
                .map_or(0, |ts| ts as i64),
            RawLayout::Yuv420p { frame_rate } => {
                (position as f64 * 1_000_000.0 / frame_rate).round() as i64
            }
        }
    }

    /// Trim a buffer holding `filled` decoded bytes to whole units.
    ///
    /// Returns how many positions the kept bytes cover, or `None` at end of
    /// stream. Trailing partial sample frames and a truncated last picture are
    /// dropped.
    fn take_whole_units(&self, buf: &mut Vec<u8>, filled: usize) -> Option<u64> {
        match *self {
            RawLayout::Pcm { channels, .. } => {
                let frame_bytes = BYTES_PER_SAMPLE * channels as usize;
                if frame_bytes == 0 {
                    return None;
                }
                buf.truncate(filled - filled % frame_bytes);
                if buf.is_empty() {
                    None
                } else {
                    Some((buf.len() / frame_bytes) as u64)
                }
            }
            RawLayout::Yuv420p { .. } => {
                if buf.is_empty() || filled < buf.len() {
                    if filled > 0 {
                        debug!("Dropping truncated trailing frame ({} of {} bytes)", filled, buf.len());
                    }
                    None
                } else {
                    Some(1)
                }
            }
        }
    }
}

fn raw_layout(info: &SourceInfo, kind: OutputKind) -> RawLayout {
    match (kind, info.video.as_ref()) {
        (OutputKind::AudioVideo, Some(video)) => RawLayout::Yuv420p {
            frame_rate: if video.frame_rate > 0.0 { video.frame_rate } else { DEFAULT_FRAME_RATE },
        },
        _ => RawLayout::Pcm {
            sample_rate: info.sample_rate.filter(|r| *r > 0).unwrap_or(DEFAULT_SAMPLE_RATE),
            channels: info.channels.filter(|c| *c > 0).unwrap_or(DEFAULT_CHANNELS),
        },
    }
}

fn decode_args(input: &Path, layout: RawLayout) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-v".into(),
        "error".into(),
        "-nostdin".into(),
        "-i".into(),
        input.to_string_lossy().into_owned(),
    ];

    match layout {
        RawLayout::Pcm { sample_rate, channels } => {
            args.extend([
                "-map".into(),
                "0:a:0".into(),
                "-vn".into(),
                "-sn".into(),
                "-dn".into(),
                "-f".into(),
                "s16le".into(),
                "-acodec".into(),
                "pcm_s16le".into(),
                "-ar".into(),
                sample_rate.to_string(),
                "-ac".into(),
                channels.to_string(),
            ]);
        }
        RawLayout::Yuv420p { frame_rate } => {
            args.extend([
                "-map".into(),
                "0:v:0".into(),
                "-an".into(),
                "-sn".into(),
                "-dn".into(),
                "-f".into(),
                "rawvideo".into(),
                "-pix_fmt".into(),
                "yuv420p".into(),
                "-r".into(),
                format_rate(frame_rate),
            ]);
        }
    }

    args.push("pipe:1".into());
    args
}

fn encode_args(output: &Path, config: &SinkConfig, input: &Path) -> Vec<String> {
    let mut args: Vec<String> = vec!["-v".into(), "error".into(), "-y".into()];

    match &config.video {
        None => {
            args.extend([
                "-f".into(),
                "s16le".into(),
                "-ar".into(),
                config.sample_rate.to_string(),
                "-ac".into(),
                config.channels.to_string(),
                "-i".into(),
                "pipe:0".into(),
            ]);
        }
        Some(video) => {
            args.extend([
                "-f".into(),
                "rawvideo".into(),
                "-pix_fmt".into(),
                "yuv420p".into(),
                "-s".into(),
                format!("{}x{}", video.width, video.height),
                "-r".into(),
                format_rate(video.frame_rate),
                "-i".into(),
                "pipe:0".into(),
                // The audio track comes straight from the source file
                "-i".into(),
                input.to_string_lossy().into_owned(),
                "-map".into(),
                "0:v:0".into(),
                "-map".into(),
                "1:a:0?".into(),
                "-c:v".into(),
                video.codec.ffmpeg_name().into(),
                "-pix_fmt".into(),
                "yuv420p".into(),
            ]);
            if let Some(bitrate) = video.bitrate {
                args.push("-b:v".into());
                args.push(bitrate.to_string());
            }
        }
    }

    args.extend([
        "-c:a".into(),
        config.audio_codec.ffmpeg_name().into(),
        "-ar".into(),
        config.sample_rate.to_string(),
        "-f".into(),
        config.format.muxer().into(),
        output.to_string_lossy().into_owned(),
    ]);
    args
}

/// Collect a child's stderr in the background so the pipe never fills up
fn collect_stderr(child: &mut Child) -> Option<JoinHandle<String>> {
    let stderr = child.stderr.take()?;
    Some(tokio::spawn(async move {
        let mut lines = Vec::new();
        let mut line_stream = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = line_stream.next_line().await {
            lines.push(line);
        }
        lines.join("\n")
    }))
}

async fn stderr_text(handle: Option<JoinHandle<String>>) -> String {
    match handle {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    }
}

/// Read until `buf` is full or the stream ends; returns the bytes read
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn spawn_ffmpeg(ffmpeg_bin: &Path, args: &[String], stdin: Stdio, stdout: Stdio) -> Result<Child> {
    debug!("Executing FFmpeg: {} {}", ffmpeg_bin.display(), args.join(" "));
    Command::new(ffmpeg_bin)
        .args(args)
        .stdin(stdin)
        .stdout(stdout)
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!(
            "Failed to spawn FFmpeg process at: {}. Ensure FFmpeg is installed and accessible.",
            ffmpeg_bin.display()
        ))
}

struct FfmpegSource {
    info: SourceInfo,
    layout: RawLayout,
    child: Child,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<String>>,
    unit_bytes: usize,
    /// Samples per channel (audio) or frames (video) emitted so far
    position: u64,
    finished: bool,
}

impl FfmpegSource {
    async fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let status = self.child.wait().await.context("Failed to wait for FFmpeg decoder")?;
        let stderr = stderr_text(self.stderr.take()).await;
        if !status.success() {
            return Err(anyhow!(
                "FFmpeg decoder failed (exit code: {}): {}",
                status.code().unwrap_or(-1),
                stderr.trim()
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaSource for FfmpegSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    async fn next_unit(&mut self) -> Result<Option<MediaUnit>> {
        if self.finished {
            return Ok(None);
        }

        let mut buf = vec![0u8; self.unit_bytes];
        let filled = read_full(&mut self.stdout, &mut buf)
            .await
            .context("Failed to read from FFmpeg decoder")?;

        let advance = match self.layout.take_whole_units(&mut buf, filled) {
            Some(advance) => advance,
            None => {
                self.finish().await?;
                return Ok(None);
            }
        };
        let timestamp_us = self.layout.timestamp_us(self.position);
        self.position += advance;

        Ok(Some(match self.layout {
            RawLayout::Pcm { sample_rate, channels } => MediaUnit::Audio(AudioBlock {
                timestamp_us,
                sample_rate,
                channels,
                samples: buf,
            }),
            RawLayout::Yuv420p { .. } => MediaUnit::Video(VideoFrame { timestamp_us, data: buf }),
        }))
    }
}

struct FfmpegSink {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr: Option<JoinHandle<String>>,
    carries_video: bool,
}

impl FfmpegSink {
    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("FFmpeg encoder input already closed"))?;
        stdin
            .write_all(bytes)
            .await
            .context("Failed to write to FFmpeg encoder")
    }
}

#[async_trait]
impl MediaSink for FfmpegSink {
    async fn write_samples(&mut self, block: &AudioBlock) -> Result<()> {
        if self.carries_video {
            return Err(anyhow!("audio+video encoder takes its audio from the source file"));
        }
        self.write(&block.samples).await
    }

    async fn write_frame(&mut self, frame: &VideoFrame) -> Result<()> {
        if !self.carries_video {
            return Err(anyhow!("audio-only encoder cannot take video frames"));
        }
        self.write(&frame.data).await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let mut sink = self;
        if let Some(mut stdin) = sink.stdin.take() {
            stdin.shutdown().await.context("Failed to close FFmpeg encoder input")?;
        }

        let status = sink.child.wait().await.context("Failed to wait for FFmpeg encoder")?;
        let stderr = stderr_text(sink.stderr.take()).await;
        if !status.success() {
            return Err(anyhow!(
                "FFmpeg encoding failed (exit code: {}): {}",
                status.code().unwrap_or(-1),
                stderr.trim()
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaBackend for FfmpegBackend {
    async fn open_source(&self, input: &Path, kind: OutputKind) -> Result<Box<dyn MediaSource>> {
        let probe = ffprobe::probe_file(&self.ffprobe_bin, input).await?;
        let info = probe.source_info(kind)?;
        let layout = raw_layout(&info, kind);

        let unit_bytes = layout
            .unit_bytes(info.video.as_ref(), self.audio_block_samples)
            .with_context(|| format!("Cannot decode {}", input.display()))?;

        let mut child = spawn_ffmpeg(
            &self.ffmpeg_bin,
            &decode_args(input, layout),
            Stdio::null(),
            Stdio::piped(),
        )?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Failed to capture FFmpeg decoder stdout"))?;
        let stderr = collect_stderr(&mut child);

        info!(
            "Decoding {} ({:?}, duration {:?} us)",
            input.display(),
            layout,
            info.duration_us
        );

        Ok(Box::new(FfmpegSource {
            info,
            layout,
            child,
            stdout,
            stderr,
            unit_bytes,
            position: 0,
            finished: false,
        }))
    }

    async fn open_sink(
        &self,
        output: &Path,
        config: &SinkConfig,
        input: &Path,
    ) -> Result<Box<dyn MediaSink>> {
        let mut child = spawn_ffmpeg(
            &self.ffmpeg_bin,
            &encode_args(output, config, input),
            Stdio::piped(),
            Stdio::null(),
        )?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("Failed to capture FFmpeg encoder stdin"))?;
        let stderr = collect_stderr(&mut child);

        Ok(Box::new(FfmpegSink {
            child,
            stdin: Some(stdin),
            stderr,
            carries_video: config.video.is_some(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::OutputFormat;
    use proptest::prelude::*;

    fn video_source() -> SourceInfo {
        SourceInfo {
            duration_us: Some(10_000_000),
            sample_rate: Some(44_100),
            channels: Some(2),
            video: Some(VideoInfo {
                width: 1280,
                height: 720,
                frame_rate: 30000.0 / 1001.0,
                bitrate: Some(3_000_000),
            }),
        }
    }

    fn window(args: &[String], flag: &str) -> Option<String> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .cloned()
    }

    #[test]
    fn test_version_parsing() {
        let v1 = FFmpegVersion::parse("ffmpeg version 8.0").unwrap();
        assert_eq!((v1.major, v1.minor, v1.patch), (8, 0, 0));

        let v2 = FFmpegVersion::parse("ffmpeg version 6.1.1-3ubuntu5 Copyright (c) 2000-2023").unwrap();
        assert_eq!((v2.major, v2.minor, v2.patch), (6, 1, 1));

        let v3 = FFmpegVersion::parse("ffmpeg version 4.4.2-0ubuntu0.22.04.1").unwrap();
        assert_eq!((v3.major, v3.minor, v3.patch), (4, 4, 2));

        assert!(FFmpegVersion::parse("ffmpeg version N-").is_err());
    }

    #[test]
    fn test_lists_encoder_matches_whole_names() {
        let listing = " A....D aac                  AAC (Advanced Audio Coding)\n \
                       A....D libmp3lame           libmp3lame MP3 (MPEG audio layer 3)\n \
                       V....D libx264              libx264 H.264 / AVC";
        assert!(lists_encoder(listing, "aac"));
        assert!(lists_encoder(listing, "libmp3lame"));
        assert!(lists_encoder(listing, "libx264"));
        assert!(!lists_encoder(listing, "libvorbis"));
        assert!(!lists_encoder(listing, "mp3"));
    }

    #[test]
    fn test_required_encoders_cover_whitelist() {
        let names = required_encoders();
        for expected in ["libx264", "aac", "libmp3lame", "libvorbis", "pcm_s16le"] {
            assert!(names.contains(&expected), "missing {expected}");
        }
        assert_eq!(names.len(), 5);
    }

    #[test]
    fn test_report_usability() {
        let report = ToolchainReport {
            version: FFmpegVersion { major: 6, minor: 0, patch: 0 },
            encoders: vec![("aac", true), ("libvorbis", false)],
        };
        assert_eq!(report.missing_encoders(), vec!["libvorbis"]);
        assert!(!report.is_usable());
    }

    #[test]
    fn test_audio_decode_args() {
        let info = video_source();
        let layout = raw_layout(&info, OutputKind::AudioOnly);
        assert_eq!(layout, RawLayout::Pcm { sample_rate: 44_100, channels: 2 });

        let args = decode_args(Path::new("/work/input-a.mkv"), layout);
        assert_eq!(window(&args, "-i").as_deref(), Some("/work/input-a.mkv"));
        assert_eq!(window(&args, "-map").as_deref(), Some("0:a:0"));
        assert_eq!(window(&args, "-f").as_deref(), Some("s16le"));
        assert_eq!(window(&args, "-ar").as_deref(), Some("44100"));
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
    }

    #[test]
    fn test_video_decode_args_force_constant_rate() {
        let layout = raw_layout(&video_source(), OutputKind::AudioVideo);
        let args = decode_args(Path::new("in.mp4"), layout);
        assert_eq!(window(&args, "-map").as_deref(), Some("0:v:0"));
        assert_eq!(window(&args, "-pix_fmt").as_deref(), Some("yuv420p"));
        assert_eq!(window(&args, "-r").as_deref(), Some("29.97"));
    }

    #[test]
    fn test_audio_encode_args_per_format() {
        let info = video_source();
        for (format, codec) in [
            (OutputFormat::Wav, "pcm_s16le"),
            (OutputFormat::Mp3, "libmp3lame"),
            (OutputFormat::Ogg, "libvorbis"),
        ] {
            let config = SinkConfig::for_format(format, &info).unwrap();
            let args = encode_args(Path::new("/work/out.x"), &config, Path::new("in.mkv"));
            assert_eq!(window(&args, "-c:a").as_deref(), Some(codec));
            assert_eq!(window(&args, "-i").as_deref(), Some("pipe:0"));
            assert!(!args.contains(&"-c:v".to_string()), "{format} must not configure video");
            assert!(!args.contains(&"in.mkv".to_string()));
            assert_eq!(args[args.len() - 2], format.muxer());
        }
    }

    #[test]
    fn test_video_encode_args() {
        let config = SinkConfig::for_format(OutputFormat::Mp4, &video_source()).unwrap();
        let args = encode_args(Path::new("/work/out.mp4"), &config, Path::new("/work/in.mkv"));
        assert_eq!(window(&args, "-s").as_deref(), Some("1280x720"));
        assert_eq!(window(&args, "-c:v").as_deref(), Some("libx264"));
        assert_eq!(window(&args, "-b:v").as_deref(), Some("3000000"));
        assert_eq!(window(&args, "-c:a").as_deref(), Some("aac"));
        assert!(args.contains(&"/work/in.mkv".to_string()));
        assert!(args.contains(&"1:a:0?".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/work/out.mp4"));
    }

    #[test]
    fn test_video_encode_args_without_bitrate() {
        let mut info = video_source();
        if let Some(video) = info.video.as_mut() {
            video.bitrate = None;
        }
        let config = SinkConfig::for_format(OutputFormat::Mp4, &info).unwrap();
        let args = encode_args(Path::new("out.mp4"), &config, Path::new("in.mkv"));
        assert!(!args.contains(&"-b:v".to_string()));
    }

    #[test]
    fn test_frame_size() {
        assert_eq!(yuv420p_frame_size(4, 2), 8 + 2 * 2);
        assert_eq!(yuv420p_frame_size(1920, 1080), 1920 * 1080 * 3 / 2);
        assert_eq!(yuv420p_frame_size(3, 3), 9 + 2 * 4);
    }

    #[tokio::test]
    async fn test_read_full_stops_at_end_of_stream() {
        let data = vec![7u8; 10];
        let mut reader = &data[..];
        let mut buf = [0u8; 4];
        assert_eq!(read_full(&mut reader, &mut buf).await.unwrap(), 4);
        assert_eq!(read_full(&mut reader, &mut buf).await.unwrap(), 4);
        assert_eq!(read_full(&mut reader, &mut buf).await.unwrap(), 2);
        assert_eq!(read_full(&mut reader, &mut buf).await.unwrap(), 0);
    }

    /// Split a decoded byte stream the way the source does, returning (timestamp, length) per unit
    async fn split_stream(layout: RawLayout, unit_bytes: usize, data: &[u8]) -> Vec<(i64, usize)> {
        let mut reader = data;
        let mut position = 0;
        let mut units = Vec::new();
        loop {
            let mut buf = vec![0u8; unit_bytes];
            let filled = read_full(&mut reader, &mut buf).await.unwrap();
            let Some(advance) = layout.take_whole_units(&mut buf, filled) else {
                break;
            };
            units.push((layout.timestamp_us(position), buf.len()));
            position += advance;
        }
        units
    }

    #[tokio::test]
    async fn test_pcm_blocks_timed_by_sample_count() {
        // 4 sample frames per block, stereo: 16 bytes per block
        let layout = RawLayout::Pcm { sample_rate: 8, channels: 2 };
        let unit_bytes = layout.unit_bytes(None, 4).unwrap();
        assert_eq!(unit_bytes, 16);

        // Two full blocks, then 3 whole frames and one dangling byte
        let data = vec![0u8; 16 * 2 + 12 + 1];
        let units = split_stream(layout, unit_bytes, &data).await;
        assert_eq!(units, vec![(0, 16), (500_000, 16), (1_000_000, 12)]);
    }

    #[tokio::test]
    async fn test_video_frames_timed_by_forced_rate() {
        let layout = RawLayout::Yuv420p { frame_rate: 25.0 };
        let video = VideoInfo { width: 4, height: 2, frame_rate: 25.0, bitrate: None };
        let unit_bytes = layout.unit_bytes(Some(&video), 1024).unwrap();
        assert_eq!(unit_bytes, 12);

        // Three pictures and a truncated fourth that must be dropped
        let data = vec![0u8; 12 * 3 + 5];
        let units = split_stream(layout, unit_bytes, &data).await;
        assert_eq!(units, vec![(0, 12), (40_000, 12), (80_000, 12)]);
    }

    #[test]
    fn test_ntsc_frame_timestamps_round() {
        let layout = RawLayout::Yuv420p { frame_rate: 30000.0 / 1001.0 };
        assert_eq!(layout.timestamp_us(1), 33_367);
        assert_eq!(layout.timestamp_us(30), 1_001_000);
    }

    #[test]
    fn test_zero_audio_parameters_never_divide_by_zero() {
        let info = SourceInfo {
            duration_us: Some(1_000_000),
            sample_rate: Some(0),
            channels: Some(0),
            video: None,
        };
        let layout = raw_layout(&info, OutputKind::AudioOnly);
        assert_eq!(
            layout,
            RawLayout::Pcm { sample_rate: DEFAULT_SAMPLE_RATE, channels: DEFAULT_CHANNELS }
        );

        let broken = RawLayout::Pcm { sample_rate: 0, channels: 0 };
        assert!(broken.unit_bytes(None, 1024).is_err());
        assert_eq!(broken.timestamp_us(10), 0);
        let mut buf = vec![0u8; 8];
        assert_eq!(broken.take_whole_units(&mut buf, 8), None);
    }

    #[test]
    fn test_video_layout_needs_video_info() {
        let layout = RawLayout::Yuv420p { frame_rate: 25.0 };
        assert!(layout.unit_bytes(None, 1024).is_err());
    }

    #[tokio::test]
    async fn test_open_source_with_missing_binary_fails() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.wav");
        std::fs::write(&input, b"RIFF").unwrap();

        let config = ConverterConfig {
            ffprobe_bin: PathBuf::from("/nonexistent/ffprobe"),
            ..Default::default()
        };
        let backend = FfmpegBackend::new(&config);
        assert!(backend.open_source(&input, OutputKind::AudioOnly).await.is_err());
    }

    proptest! {
        /// Frame sizes always hold a full-resolution luma plane plus two
        /// quarter-size chroma planes rounded up.
        #[test]
        fn test_frame_size_bounds(width in 1u32..4096, height in 1u32..4096) {
            let size = yuv420p_frame_size(width, height);
            let luma = (width * height) as usize;
            prop_assert!(size >= luma + luma / 2);
            prop_assert!(size <= luma + 2 * ((width as usize + 1) * (height as usize + 1) / 4) + 1);
        }
    }
}

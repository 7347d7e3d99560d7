use std::path::Path;
use anyhow::{Context, Result};
use log::debug;
use serde::Deserialize;
use tokio::process::Command;
use crate::format::OutputKind;
use crate::media::{SourceInfo, VideoInfo};

/// Frame rate assumed when a video stream does not report a usable one
pub const DEFAULT_FRAME_RATE: f64 = 25.0;

/// Complete ffprobe output structure
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    #[serde(default)]
    pub streams: Vec<FFProbeStream>,
    pub format: Option<FFProbeFormat>,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeFormat {
    pub format_name: Option<String>,
    /// Seconds, as a decimal string
    pub duration: Option<String>,
    pub bit_rate: Option<String>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeStream {
    pub index: i32,
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub avg_frame_rate: Option<String>,
    pub r_frame_rate: Option<String>,
    pub bit_rate: Option<String>,
    pub sample_rate: Option<String>,
    pub channels: Option<u32>,
}

impl FFProbeData {
    pub fn first_stream(&self, codec_type: &str) -> Option<&FFProbeStream> {
        self.streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some(codec_type))
    }

    /// Container duration in microseconds
    pub fn duration_us(&self) -> Option<i64> {
        let secs: f64 = self.format.as_ref()?.duration.as_ref()?.trim().parse().ok()?;
        if secs.is_finite() && secs > 0.0 {
            Some((secs * 1_000_000.0).round() as i64)
        } else {
            None
        }
    }

    /// Reduce the probe to what a conversion of `kind` needs.
    ///
    /// Video properties are only read for audio+video conversions. Fails when
    /// the file has no streams, or lacks the stream the conversion is built on.
    pub fn source_info(&self, kind: OutputKind) -> Result<SourceInfo> {
        if self.streams.is_empty() {
            anyhow::bail!("no media streams found");
        }

        let audio = self.first_stream("audio");
        let video = match kind {
            OutputKind::AudioOnly => {
                if audio.is_none() {
                    anyhow::bail!("no audio stream to convert");
                }
                None
            }
            OutputKind::AudioVideo => {
                let stream = self
                    .first_stream("video")
                    .context("no video stream to convert")?;
                Some(self.video_info(stream)?)
            }
        };

        Ok(SourceInfo {
            duration_us: self.duration_us(),
            sample_rate: audio
                .and_then(|s| s.sample_rate.as_deref())
                .and_then(|r| r.parse().ok())
                .filter(|r: &u32| *r > 0),
            channels: audio.and_then(|s| s.channels).filter(|c| *c > 0),
            video,
        })
    }

    fn video_info(&self, stream: &FFProbeStream) -> Result<VideoInfo> {
        let width = stream.width.filter(|w| *w > 0).context("video stream has no width")?;
        let height = stream.height.filter(|h| *h > 0).context("video stream has no height")?;
        let frame_rate = stream
            .avg_frame_rate
            .as_deref()
            .and_then(parse_frame_rate)
            .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate))
            .unwrap_or(DEFAULT_FRAME_RATE);
        // Streams in many containers carry no bitrate; fall back to the container's
        let bitrate = stream
            .bit_rate
            .as_deref()
            .and_then(|b| b.parse().ok())
            .or_else(|| {
                self.format
                    .as_ref()
                    .and_then(|f| f.bit_rate.as_deref())
                    .and_then(|b| b.parse().ok())
            })
            .filter(|b: &u64| *b > 0);

        Ok(VideoInfo { width, height, frame_rate, bitrate })
    }
}

/// Run ffprobe and parse the JSON output
pub async fn probe_file(ffprobe_bin: &Path, file_path: &Path) -> Result<FFProbeData> {
    if !file_path.exists() {
        anyhow::bail!("File does not exist: {}", file_path.display());
    }

    debug!("Executing FFprobe for: {}", file_path.display());

    let output = Command::new(ffprobe_bin)
        .arg("-v")
        .arg("error")
        .arg("-print_format")
        .arg("json")
        .arg("-show_streams")
        .arg("-show_format")
        .arg(file_path)
        .output()
        .await
        .with_context(|| format!(
            "Failed to execute FFprobe for: {}. Ensure FFprobe is installed and accessible at: {}",
            file_path.display(),
            ffprobe_bin.display()
        ))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "ffprobe failed (exit code {}) for {}: {}",
            output.status.code().unwrap_or(-1),
            file_path.display(),
            stderr.trim()
        );
    }

    let json_str = String::from_utf8(output.stdout)
        .context("ffprobe output is not valid UTF-8")?;

    parse_probe_output(&json_str)
        .with_context(|| format!("Failed to parse ffprobe JSON for: {}", file_path.display()))
}

pub fn parse_probe_output(json: &str) -> Result<FFProbeData> {
    Ok(serde_json::from_str(json)?)
}

/// Parse a frame rate such as "30/1", "30000/1001" or "29.97"
pub fn parse_frame_rate(frame_rate_str: &str) -> Option<f64> {
    if let Some((num, den)) = frame_rate_str.split_once('/') {
        let num: f64 = num.trim().parse().ok()?;
        let den: f64 = den.trim().parse().ok()?;
        if den != 0.0 && num > 0.0 {
            return Some(num / den);
        }
        return None;
    }

    frame_rate_str.trim().parse::<f64>().ok()
        .filter(|&f| f > 0.0 && f < 1000.0)
}

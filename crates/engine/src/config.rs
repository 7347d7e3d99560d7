use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the conversion engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    /// Path to the ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to the ffprobe binary
    pub ffprobe_bin: PathBuf,
    /// Path to the yt-dlp binary used for URL submissions
    pub ytdlp_bin: PathBuf,
    /// Cookie jar passed to yt-dlp when the file exists
    pub cookies_file: Option<PathBuf>,
    /// Directory for staged inputs and produced outputs
    pub work_dir: PathBuf,
    /// Directory yt-dlp downloads into
    pub download_dir: PathBuf,
    /// Number of conversions allowed to run at the same time
    pub max_concurrent_jobs: usize,
    /// Samples per channel in each audio block pulled from the decoder
    pub audio_block_samples: usize,
    /// How often the CLI polls job status, in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl ConverterConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        let tmp = std::env::temp_dir();
        Self {
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            ytdlp_bin: PathBuf::from("yt-dlp"),
            cookies_file: None,
            work_dir: tmp.join("convd-work"),
            download_dir: tmp.join("convd-downloads"),
            max_concurrent_jobs: 2,
            audio_block_samples: 1024,
            poll_interval_ms: 500,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        Ok(config)
    }

    /// Cookie jar to hand to yt-dlp, if one is configured and present
    pub fn usable_cookies_file(&self) -> Option<&Path> {
        self.cookies_file
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty() && p.exists())
    }
}

use std::path::{Path, PathBuf};
use std::process::Stdio;
use anyhow::{Context, Result};
use log::{debug, info, warn};
use tokio::process::Command;
use uuid::Uuid;
use crate::config::ConverterConfig;

/// Name used when a video's title cannot be fetched
pub const DEFAULT_TITLE: &str = "youtube-video";
/// Prefix of every file yt-dlp downloads for us
pub const DOWNLOAD_PREFIX: &str = "ytvideo-";

/// Characters that are not allowed in file names on common filesystems
const FORBIDDEN_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

/// Downloads remote videos with yt-dlp
#[derive(Debug, Clone)]
pub struct UrlFetcher {
    ytdlp_bin: PathBuf,
    cookies_file: Option<PathBuf>,
    download_dir: PathBuf,
}

impl UrlFetcher {
    pub fn new(config: &ConverterConfig) -> Self {
        Self {
            ytdlp_bin: config.ytdlp_bin.clone(),
            cookies_file: config.usable_cookies_file().map(Path::to_path_buf),
            download_dir: config.download_dir.clone(),
        }
    }

    /// Look up the video's title, sanitized for use as a file name.
    ///
    /// Never fails: any problem falls back to [`DEFAULT_TITLE`].
    pub async fn fetch_title(&self, url: &str) -> String {
        let output = Command::new(&self.ytdlp_bin)
            .args(self.title_args(url))
            .stdin(Stdio::null())
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                stdout
                    .lines()
                    .next()
                    .and_then(sanitize_file_name)
                    .unwrap_or_else(|| DEFAULT_TITLE.to_string())
            }
            Ok(output) => {
                warn!(
                    "yt-dlp title lookup failed (exit code {}) for {}",
                    output.status.code().unwrap_or(-1),
                    url
                );
                DEFAULT_TITLE.to_string()
            }
            Err(e) => {
                warn!("Failed to execute yt-dlp at {}: {}", self.ytdlp_bin.display(), e);
                DEFAULT_TITLE.to_string()
            }
        }
    }

    /// Download the best available video+audio of `url` and return the file's path
    pub async fn download(&self, url: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.download_dir)
            .await
            .with_context(|| format!("Failed to create download directory: {}", self.download_dir.display()))?;

        let unique = Uuid::new_v4().to_string();
        let template = self
            .download_dir
            .join(format!("{}{}.%(ext)s", DOWNLOAD_PREFIX, unique));

        info!("Downloading {} with yt-dlp", url);
        let output = Command::new(&self.ytdlp_bin)
            .args(self.download_args(url, &template))
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to execute yt-dlp at: {}", self.ytdlp_bin.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "yt-dlp failed with exit code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }

        let file = find_downloaded_file(&self.download_dir, &unique)?;
        debug!("yt-dlp produced {}", file.display());
        Ok(file)
    }

    fn title_args(&self, url: &str) -> Vec<String> {
        let mut args = self.cookie_args();
        args.push("--get-title".into());
        args.push(url.into());
        args
    }

    fn download_args(&self, url: &str, template: &Path) -> Vec<String> {
        let mut args = self.cookie_args();
        args.extend([
            "--no-playlist".into(),
            "-f".into(),
            "bv*+ba/b".into(),
            "-o".into(),
            template.to_string_lossy().into_owned(),
            url.into(),
        ]);
        args
    }

    fn cookie_args(&self) -> Vec<String> {
        match &self.cookies_file {
            Some(cookies) => vec!["--cookies".into(), cookies.to_string_lossy().into_owned()],
            None => Vec::new(),
        }
    }
}

/// Replace characters that cannot appear in file names (path separators
/// included) and trim the result. Returns `None` for names that end up empty.
pub fn sanitize_file_name(title: &str) -> Option<String> {
    let cleaned: String = title
        .chars()
        .map(|c| if FORBIDDEN_CHARS.contains(&c) { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

/// yt-dlp picks the extension itself, so find the file by its unique prefix
fn find_downloaded_file(dir: &Path, unique: &str) -> Result<PathBuf> {
    let prefix = format!("{}{}", DOWNLOAD_PREFIX, unique);
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to list download directory: {}", dir.display()))?;

    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to read entry in {}", dir.display()))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        // Skip yt-dlp's in-progress fragments
        if name.starts_with(&prefix) && !name.ends_with(".part") {
            return Ok(entry.path());
        }
    }

    anyhow::bail!("Downloaded file not found in {}", dir.display())
}

//! Submission and retrieval around the converter: the part a front end talks to.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use anyhow::{Context, Result};
use log::{error, info, warn};
use uuid::Uuid;
use crate::error::FetchFailed;
use crate::fetch::{sanitize_file_name, UrlFetcher};
use crate::format::OutputFormat;
use crate::job::{JobId, JobRegistry, JobStatus};
use crate::pipeline::{remove_file_logged, Converter, InputSource};

/// Display name used when an upload has no usable file name
pub const DEFAULT_UPLOAD_NAME: &str = "upload";
/// Prefix of staged upload copies in the work directory
pub const INPUT_PREFIX: &str = "input-";

/// A finished artifact handed to the caller
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub path: PathBuf,
    pub file_name: String,
}

/// Front door of the engine: validates submissions, stages inputs, starts
/// conversions, answers status polls and hands out finished files.
#[derive(Clone)]
pub struct ConversionService {
    converter: Converter,
    fetcher: UrlFetcher,
}

impl ConversionService {
    pub fn new(converter: Converter, fetcher: UrlFetcher) -> Self {
        Self { converter, fetcher }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        self.converter.registry()
    }

    /// Submit a local file. The file is copied into the work directory first,
    /// so the caller's copy is never touched.
    ///
    /// `original_name` is the name the user knows the file by; it defaults to
    /// the path's own file name. Characters that are unsafe in file names are
    /// replaced before it is used for staging or as the display name.
    pub async fn submit_file(
        &self,
        path: &Path,
        original_name: Option<&str>,
        format: &str,
    ) -> Result<JobId> {
        let format = OutputFormat::parse(format)?;

        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("Failed to stat upload: {}", path.display()))?;
        if !metadata.is_file() || metadata.len() == 0 {
            anyhow::bail!("No file uploaded: {} is empty or not a file", path.display());
        }

        let original_name = original_name
            .map(str::to_string)
            .or_else(|| path.file_name().map(|n| n.to_string_lossy().into_owned()))
            .and_then(|name| sanitize_file_name(&name))
            .unwrap_or_else(|| DEFAULT_UPLOAD_NAME.to_string());

        let staged = self.stage_upload(path, &original_name).await?;

        let job_id = JobId::generate();
        let registry = self.registry();
        registry.create_job(&job_id);
        registry.set_display_name(&job_id, display_name_from_upload(&original_name));

        info!("Job {}: accepted upload {} as {}", job_id, original_name, format);
        self.converter.convert(InputSource::transient(staged), format, job_id.clone());
        Ok(job_id)
    }

    /// Submit a remote video. The title lookup and download happen before this
    /// returns; a failed download leaves the job at -1 and returns the error
    /// with a [`FetchFailed`] context naming the job.
    pub async fn submit_url(&self, url: &str, format: &str) -> Result<JobId> {
        let format = OutputFormat::parse(format)?;

        let job_id = JobId::generate();
        let registry = self.registry();
        registry.create_job(&job_id);

        let title = self.fetcher.fetch_title(url).await;
        registry.set_display_name(&job_id, title.clone());
        info!("Job {}: fetching \"{}\" from {}", job_id, title, url);

        let downloaded = match self.fetcher.download(url).await {
            Ok(path) => path,
            Err(e) => {
                error!("Job {}: ❌ download failed: {:#}", job_id, e);
                registry.set_failed(&job_id);
                return Err(e.context(FetchFailed { job_id }));
            }
        };

        self.converter.convert(InputSource::transient(downloaded), format, job_id.clone());
        Ok(job_id)
    }

    /// Current status of a job, `None` for unknown or already retrieved jobs
    pub fn status(&self, job_id: &JobId) -> Option<JobStatus> {
        self.registry().get_status(job_id)
    }

    /// Move a finished job's artifact to `dest_dir/<display name>.<ext>` and retire the job.
    ///
    /// Returns `Ok(None)` when the job is unknown or not complete yet. If the
    /// move fails the job is already retired, so the work copy is deleted.
    pub async fn deliver(
        &self,
        job_id: &JobId,
        format: OutputFormat,
        dest_dir: &Path,
    ) -> Result<Option<Delivery>> {
        let status = match self.registry().claim_result(job_id) {
            Some(status) => status,
            None => return Ok(None),
        };
        let source = status
            .result_path
            .clone()
            .context("completed job has no result path")?;

        let file_name = status.download_file_name(format);
        match move_artifact(&source, dest_dir, &file_name).await {
            Ok(dest) => {
                info!("Job {}: delivered {}", job_id, dest.display());
                Ok(Some(Delivery { path: dest, file_name }))
            }
            Err(e) => {
                error!("Job {}: ❌ delivery failed: {:#}", job_id, e);
                remove_file_logged(&source, "undeliverable output");
                Err(e)
            }
        }
    }

    /// Drop the bookkeeping of a job that will not be delivered (e.g. a failed one)
    pub fn discard(&self, job_id: &JobId) {
        if let Some(status) = self.registry().get_status(job_id) {
            if let Some(path) = status.result_path {
                warn!("Job {}: discarding undelivered output {}", job_id, path.display());
                remove_file_logged(&path, "undelivered output");
            }
        }
        self.registry().remove_job(job_id);
    }

    async fn stage_upload(&self, path: &Path, original_name: &str) -> Result<PathBuf> {
        let work_dir = self.converter.work_dir();
        tokio::fs::create_dir_all(work_dir)
            .await
            .with_context(|| format!("Failed to create work directory: {}", work_dir.display()))?;

        let staged = work_dir.join(format!("{}{}-{}", INPUT_PREFIX, Uuid::new_v4(), original_name));
        tokio::fs::copy(path, &staged)
            .await
            .with_context(|| format!("Failed to stage {} into {}", path.display(), staged.display()))?;
        Ok(staged)
    }
}

async fn move_artifact(source: &Path, dest_dir: &Path, file_name: &str) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dest_dir)
        .await
        .with_context(|| format!("Failed to create destination: {}", dest_dir.display()))?;
    let dest = dest_dir.join(file_name);

    if tokio::fs::rename(source, &dest).await.is_err() {
        // Different filesystem: copy, then drop the work copy
        tokio::fs::copy(source, &dest).await.with_context(|| {
            format!("Failed to copy {} to {}", source.display(), dest.display())
        })?;
        remove_file_logged(source, "delivered output");
    }
    Ok(dest)
}

/// Base name of an uploaded file: its name without the last extension
pub fn display_name_from_upload(original_name: &str) -> String {
    let base = match original_name.rfind('.') {
        Some(dot) => &original_name[..dot],
        None => original_name,
    };
    if base.trim().is_empty() {
        DEFAULT_UPLOAD_NAME.to_string()
    } else {
        base.to_string()
    }
}

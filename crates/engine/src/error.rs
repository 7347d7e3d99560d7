use std::path::PathBuf;
use thiserror::Error;
use crate::format::OutputFormat;
use crate::job::JobId;

/// Ways a conversion can fail.
///
/// Callers of the converter never see these directly: every variant ends with
/// the job's progress set to -1. They exist so the log says which stage broke.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("failed to open source {}: {reason}", path.display())]
    SourceOpen { path: PathBuf, reason: String },

    #[error("failed to configure {format} output {}: {reason}", path.display())]
    SinkConfigure {
        format: OutputFormat,
        path: PathBuf,
        reason: String,
    },

    #[error("stream failed after {units} units: {reason}")]
    Stream { units: u64, reason: String },

    #[error("failed to finalize output {}: {reason}", path.display())]
    Finalize { path: PathBuf, reason: String },
}

impl ConvertError {
    /// Short stage label used in log lines
    pub fn stage(&self) -> &'static str {
        match self {
            ConvertError::SourceOpen { .. } => "source-open",
            ConvertError::SinkConfigure { .. } => "sink-configure",
            ConvertError::Stream { .. } => "stream",
            ConvertError::Finalize { .. } => "finalize",
        }
    }
}

/// Context attached to a URL submission whose download failed. The job
/// exists and is already at -1.
#[derive(Debug, Clone, Error)]
#[error("Job {job_id}: download failed")]
pub struct FetchFailed {
    pub job_id: JobId,
}

/// Render an error with its whole context chain on one line
pub(crate) fn reason(err: &anyhow::Error) -> String {
    format!("{:#}", err)
}

pub mod config;
pub mod job;
pub mod format;
pub mod error;
pub mod media;
pub mod pipeline;
pub mod ffprobe;
pub mod ffmpeg;
pub mod fetch;
pub mod service;
pub mod cleanup;

#[cfg(test)]
mod testing;

pub use config::ConverterConfig;
pub use job::{JobId, JobRegistry, JobState, JobStatus};
pub use format::{OutputFormat, SUPPORTED_FORMATS};
pub use error::{ConvertError, FetchFailed};
pub use pipeline::{Converter, InputSource};
pub use ffmpeg::FfmpegBackend;
pub use service::{ConversionService, Delivery};

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use log::{debug, error, info, warn};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use uuid::Uuid;
use crate::error::{reason, ConvertError};
use crate::format::{OutputFormat, OutputKind};
use crate::job::{JobId, JobRegistry, PROGRESS_COMPLETE};
use crate::media::{MediaBackend, MediaUnit, SinkConfig};

/// Highest progress value the transcode loop may report; 100 is reserved for a
/// closed and finalized output.
pub const MAX_LOOP_PROGRESS: i32 = 99;
/// Prefix of conversion outputs in the work directory
pub const OUTPUT_PREFIX: &str = "output-";

/// Input file handed to a conversion.
///
/// A transient input is a copy the converter owns (an upload or a fetched
/// download) and is deleted when this value is dropped, whichever way the
/// conversion ends. A borrowed input is left alone.
#[derive(Debug)]
pub struct InputSource {
    path: PathBuf,
    transient: bool,
}

impl InputSource {
    pub fn transient(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), transient: true }
    }

    pub fn borrowed(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), transient: false }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InputSource {
    fn drop(&mut self) {
        if self.transient {
            remove_file_logged(&self.path, "temporary input");
        }
    }
}

/// Deletes a partially written output unless the conversion finalized it
#[derive(Debug)]
struct OutputGuard {
    path: PathBuf,
    armed: bool,
}

impl OutputGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the output now
    fn discard(&mut self) {
        if self.armed {
            self.armed = false;
            remove_file_logged(&self.path, "partial output");
        }
    }

    /// The output is complete; hand its path over and stop guarding it
    fn keep(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for OutputGuard {
    fn drop(&mut self) {
        if self.armed {
            remove_file_logged(&self.path, "partial output");
        }
    }
}

/// Turns unit timestamps into percentage updates.
///
/// Reports `floor(t / T * 100)` clamped to [`MAX_LOOP_PROGRESS`], and only when
/// that value is strictly greater than the last one reported, so a job sees at
/// most 99 intermediate updates however many units it has. Without a known,
/// positive duration nothing is ever reported.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    duration_us: Option<i64>,
    last_reported: i32,
}

impl ProgressTracker {
    pub fn new(duration_us: Option<i64>) -> Self {
        Self {
            duration_us: duration_us.filter(|d| *d > 0),
            last_reported: 0,
        }
    }

    /// Returns the value to publish for a unit at `timestamp_us`, if any
    pub fn observe(&mut self, timestamp_us: i64) -> Option<i32> {
        let duration = self.duration_us?;
        if timestamp_us < 0 {
            return None;
        }

        let percent = (i128::from(timestamp_us) * 100 / i128::from(duration))
            .min(i128::from(MAX_LOOP_PROGRESS)) as i32;

        if percent > self.last_reported {
            self.last_reported = percent;
            Some(percent)
        } else {
            None
        }
    }

    pub fn last_reported(&self) -> i32 {
        self.last_reported
    }

    pub fn has_duration(&self) -> bool {
        self.duration_us.is_some()
    }
}

/// Runs conversions in the background and reports them into a [`JobRegistry`].
///
/// Each call to [`Converter::convert`] becomes its own tokio task; at most
/// `max_concurrent_jobs` of them transcode at once and the rest wait for a
/// permit with their progress still at 0. There is no cancellation.
#[derive(Clone)]
pub struct Converter {
    registry: Arc<JobRegistry>,
    backend: Arc<dyn MediaBackend>,
    work_dir: PathBuf,
    permits: Arc<Semaphore>,
}

impl Converter {
    pub fn new(
        registry: Arc<JobRegistry>,
        backend: Arc<dyn MediaBackend>,
        work_dir: impl Into<PathBuf>,
        max_concurrent_jobs: usize,
    ) -> Self {
        Self {
            registry,
            backend,
            work_dir: absolutize(work_dir.into()),
            permits: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Directory where outputs are written
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Start converting `input` to `format` for an already registered job.
    ///
    /// Returns immediately. The outcome is only observable through the
    /// registry: progress 100 with a result path, or -1. The handle may be
    /// dropped; awaiting it just waits for the job to settle.
    pub fn convert(&self, input: InputSource, format: OutputFormat, job_id: JobId) -> JoinHandle<()> {
        let worker = self.clone();
        tokio::spawn(async move { worker.run(input, format, job_id).await })
    }

    async fn run(self, input: InputSource, format: OutputFormat, job_id: JobId) {
        let _permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                error!("Job {}: worker pool unavailable: {}", job_id, e);
                self.registry.set_failed(&job_id);
                return;
            }
        };

        // A panic inside the conversion unwinds its guards (input and partial
        // output are still deleted) and surfaces here as a JoinError.
        let task = tokio::spawn(self.clone().convert_job(input, format, job_id.clone()));
        if let Err(e) = task.await {
            error!("Job {}: ❌ conversion task aborted: {}", job_id, e);
            self.fail_unless_complete(&job_id);
        }
    }

    async fn convert_job(self, input: InputSource, format: OutputFormat, job_id: JobId) {
        let output = self
            .work_dir
            .join(format!("{}{}.{}", OUTPUT_PREFIX, Uuid::new_v4(), format.extension()));
        let mut guard = OutputGuard::new(output);

        info!("Job {}: converting {} to {}", job_id, input.path().display(), format);

        match self.transcode(input.path(), guard.path(), format, &job_id).await {
            Ok(()) => {
                let result_path = guard.keep();
                if self.registry.set_completed(&job_id, result_path.clone()) {
                    info!("Job {}: ✅ conversion complete: {}", job_id, result_path.display());
                } else {
                    warn!(
                        "Job {}: job was removed while converting, discarding {}",
                        job_id,
                        result_path.display()
                    );
                    remove_file_logged(&result_path, "unclaimed output");
                }
            }
            Err(e) => {
                error!("Job {}: ❌ conversion failed ({}): {}", job_id, e.stage(), e);
                guard.discard();
                self.registry.set_failed(&job_id);
            }
        }

        // Explicit so the input outlives the sink, which may still be reading from it
        drop(input);
    }

    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        format: OutputFormat,
        job_id: &JobId,
    ) -> Result<(), ConvertError> {
        let mut source = self
            .backend
            .open_source(input, format.kind())
            .await
            .map_err(|e| ConvertError::SourceOpen {
                path: input.to_path_buf(),
                reason: reason(&e),
            })?;

        let info = source.info().clone();
        debug!("Job {}: source info: {:?}", job_id, info);

        let config = SinkConfig::for_format(format, &info).map_err(|e| ConvertError::SourceOpen {
            path: input.to_path_buf(),
            reason: reason(&e),
        })?;

        let sink_error = |reason: String| ConvertError::SinkConfigure {
            format,
            path: output.to_path_buf(),
            reason,
        };
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| sink_error(format!("cannot create {}: {}", parent.display(), e)))?;
        }
        let mut sink = self
            .backend
            .open_sink(output, &config, input)
            .await
            .map_err(|e| sink_error(reason(&e)))?;

        let mut tracker = ProgressTracker::new(info.progress_duration());
        if !tracker.has_duration() {
            debug!("Job {}: source duration unknown, no intermediate progress", job_id);
        }

        let mut units: u64 = 0;
        loop {
            let unit = match source.next_unit().await {
                Ok(Some(unit)) => unit,
                Ok(None) => break,
                Err(e) => return Err(ConvertError::Stream { units, reason: reason(&e) }),
            };

            let written = match (&unit, format.kind()) {
                (MediaUnit::Audio(block), _) => sink.write_samples(block).await,
                (MediaUnit::Video(frame), OutputKind::AudioVideo) => sink.write_frame(frame).await,
                (MediaUnit::Video(_), OutputKind::AudioOnly) => Ok(()),
            };
            written.map_err(|e| ConvertError::Stream { units, reason: reason(&e) })?;
            units += 1;

            if let Some(progress) = tracker.observe(unit.timestamp_us()) {
                debug!("Job {}: {}%", job_id, progress);
                self.registry.set_progress(job_id, progress);
            }
        }

        sink.close().await.map_err(|e| ConvertError::Finalize {
            path: output.to_path_buf(),
            reason: reason(&e),
        })?;

        debug!("Job {}: transcoded {} units", job_id, units);
        Ok(())
    }

    fn fail_unless_complete(&self, job_id: &JobId) {
        match self.registry.get_status(job_id) {
            Some(status) if status.progress == PROGRESS_COMPLETE => {}
            Some(_) => {
                self.registry.set_failed(job_id);
            }
            None => {}
        }
    }
}

/// Delete a file, logging instead of failing. Missing files are not an error.
pub(crate) fn remove_file_logged(path: &Path, what: &str) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Deleted {}: {}", what, path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to delete {} {}: {}", what, path.display(), e),
    }
}

fn absolutize(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path,
    }
}

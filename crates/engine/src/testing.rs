//! Scripted in-memory media backend for pipeline tests.

use std::collections::VecDeque;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use crate::format::OutputKind;
use crate::job::{JobId, JobRegistry};
use crate::media::{
    AudioBlock, MediaBackend, MediaSink, MediaSource, MediaUnit, SinkConfig, SourceInfo, VideoFrame,
    VideoInfo,
};

/// What the scripted sink saw
#[derive(Debug, Clone, Default)]
pub struct SinkLog {
    pub sink_opened: bool,
    pub config: Option<SinkConfig>,
    pub samples_written: usize,
    pub frames_written: usize,
    /// Registry progress of the observed job at each write
    pub observed_progress: Vec<i32>,
}

#[derive(Clone)]
pub struct ScriptedBackend {
    info: SourceInfo,
    timestamps: Vec<i64>,
    fail_open: bool,
    fail_sink_open: bool,
    fail_read_at: Option<usize>,
    fail_write_at: Option<usize>,
    panic_write_at: Option<usize>,
    fail_close: bool,
    observer: Option<(Arc<JobRegistry>, JobId)>,
    log: Arc<Mutex<SinkLog>>,
}

impl ScriptedBackend {
    /// A source with only an audio stream
    pub fn audio(duration_us: Option<i64>, timestamps: Vec<i64>) -> Self {
        Self::with_info(
            SourceInfo {
                duration_us,
                sample_rate: Some(48_000),
                channels: Some(2),
                video: None,
            },
            timestamps,
        )
    }

    /// A source with audio and a 640x360 video stream
    pub fn audio_video(duration_us: Option<i64>, timestamps: Vec<i64>) -> Self {
        Self::with_info(
            SourceInfo {
                duration_us,
                sample_rate: Some(48_000),
                channels: Some(2),
                video: Some(VideoInfo {
                    width: 640,
                    height: 360,
                    frame_rate: 25.0,
                    bitrate: Some(800_000),
                }),
            },
            timestamps,
        )
    }

    fn with_info(info: SourceInfo, timestamps: Vec<i64>) -> Self {
        Self {
            info,
            timestamps,
            fail_open: false,
            fail_sink_open: false,
            fail_read_at: None,
            fail_write_at: None,
            panic_write_at: None,
            fail_close: false,
            observer: None,
            log: Arc::new(Mutex::new(SinkLog::default())),
        }
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn failing_sink_open(mut self) -> Self {
        self.fail_sink_open = true;
        self
    }

    pub fn failing_read_at(mut self, unit: usize) -> Self {
        self.fail_read_at = Some(unit);
        self
    }

    pub fn failing_write_at(mut self, write: usize) -> Self {
        self.fail_write_at = Some(write);
        self
    }

    pub fn panicking_write_at(mut self, write: usize) -> Self {
        self.panic_write_at = Some(write);
        self
    }

    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    /// Record the job's registry progress on every sink write
    pub fn observing(mut self, registry: Arc<JobRegistry>, id: JobId) -> Self {
        self.observer = Some((registry, id));
        self
    }

    pub fn log(&self) -> Arc<Mutex<SinkLog>> {
        Arc::clone(&self.log)
    }
}

struct ScriptedSource {
    info: SourceInfo,
    units: VecDeque<MediaUnit>,
    fail_read_at: Option<usize>,
    reads: usize,
}

#[async_trait]
impl MediaSource for ScriptedSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    async fn next_unit(&mut self) -> Result<Option<MediaUnit>> {
        if self.fail_read_at == Some(self.reads) {
            return Err(anyhow!("scripted decode error at unit {}", self.reads));
        }
        self.reads += 1;
        Ok(self.units.pop_front())
    }
}

struct ScriptedSink {
    file: File,
    backend: ScriptedBackend,
    writes: usize,
}

impl ScriptedSink {
    fn record(&mut self, bytes: &[u8]) -> Result<()> {
        if self.backend.panic_write_at == Some(self.writes) {
            panic!("scripted panic at write {}", self.writes);
        }
        if self.backend.fail_write_at == Some(self.writes) {
            return Err(anyhow!("scripted encode error at write {}", self.writes));
        }
        self.writes += 1;
        self.file.write_all(bytes).context("scripted sink write")?;

        let observed = self
            .backend
            .observer
            .as_ref()
            .and_then(|(registry, id)| registry.get_status(id))
            .map(|status| status.progress);
        if let Some(progress) = observed {
            self.backend.log.lock().unwrap().observed_progress.push(progress);
        }
        Ok(())
    }
}

#[async_trait]
impl MediaSink for ScriptedSink {
    async fn write_samples(&mut self, block: &AudioBlock) -> Result<()> {
        self.record(&block.samples)?;
        self.backend.log.lock().unwrap().samples_written += 1;
        Ok(())
    }

    async fn write_frame(&mut self, frame: &VideoFrame) -> Result<()> {
        self.record(&frame.data)?;
        self.backend.log.lock().unwrap().frames_written += 1;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let mut sink = self;
        if sink.backend.fail_close {
            return Err(anyhow!("scripted trailer write failure"));
        }
        sink.file.flush().context("scripted sink flush")?;
        Ok(())
    }
}

#[async_trait]
impl MediaBackend for ScriptedBackend {
    async fn open_source(&self, input: &Path, kind: OutputKind) -> Result<Box<dyn MediaSource>> {
        if self.fail_open || !input.exists() {
            return Err(anyhow!("cannot decode {}", input.display()));
        }

        let units = self
            .timestamps
            .iter()
            .map(|&timestamp_us| match kind {
                OutputKind::AudioOnly => MediaUnit::Audio(AudioBlock {
                    timestamp_us,
                    sample_rate: 48_000,
                    channels: 2,
                    samples: vec![0u8; 16],
                }),
                OutputKind::AudioVideo => MediaUnit::Video(VideoFrame {
                    timestamp_us,
                    data: vec![0u8; 24],
                }),
            })
            .collect();

        Ok(Box::new(ScriptedSource {
            info: self.info.clone(),
            units,
            fail_read_at: self.fail_read_at,
            reads: 0,
        }))
    }

    async fn open_sink(
        &self,
        output: &Path,
        config: &SinkConfig,
        _input: &Path,
    ) -> Result<Box<dyn MediaSink>> {
        if self.fail_sink_open {
            return Err(anyhow!("no encoder for {}", config.format));
        }
        let file = File::create(output)
            .with_context(|| format!("Failed to create {}", output.display()))?;
        {
            let mut log = self.log.lock().unwrap();
            log.sink_opened = true;
            log.config = Some(config.clone());
        }
        Ok(Box::new(ScriptedSink {
            file,
            backend: self.clone(),
            writes: 0,
        }))
    }
}

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use engine::{
    cleanup::sweep_orphaned_temp_files,
    fetch::UrlFetcher,
    job::{JobId, JobState},
    ConversionService, Converter, ConverterConfig, FetchFailed, FfmpegBackend, JobRegistry,
    OutputFormat, SUPPORTED_FORMATS,
};
use humansize::{format_size, DECIMAL};
use log::{debug, error, info, warn, LevelFilter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Media conversion engine
#[derive(Parser, Debug)]
#[command(name = "convd", author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert a local file
    Convert {
        input: PathBuf,
        /// Target format (mp4, mp3, ogg, wav)
        #[arg(short, long)]
        format: String,
        /// Directory to place the converted file in
        #[arg(short, long, default_value = ".")]
        dest: PathBuf,
        /// Print progress as JSON snapshots
        #[arg(long)]
        json: bool,
    },
    /// Download a video with yt-dlp and convert it
    Fetch {
        url: String,
        #[arg(short, long)]
        format: String,
        #[arg(short, long, default_value = ".")]
        dest: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Check the installed ffmpeg and its encoders
    Check,
    /// List supported output formats
    Formats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise info, or debug with --verbose
    let mut logger = env_logger::Builder::new();
    logger.filter_level(if args.verbose { LevelFilter::Debug } else { LevelFilter::Info });
    logger.parse_default_env().format_timestamp_secs().init();

    let cfg = ConverterConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    debug!("Configuration: {:?}", cfg);

    match args.command {
        Command::Formats => {
            for format in SUPPORTED_FORMATS {
                println!("{}", format);
            }
            Ok(())
        }
        Command::Check => check_toolchain(&cfg).await,
        Command::Convert { input, format, dest, json } => {
            let service = build_service(&cfg).await?;
            let original_name = input.file_name().map(|n| n.to_string_lossy().into_owned());
            let job_id = service
                .submit_file(&input, original_name.as_deref(), &format)
                .await
                .with_context(|| format!("Failed to submit {}", input.display()))?;
            follow_job(&service, &cfg, &job_id, &format, &dest, json).await
        }
        Command::Fetch { url, format, dest, json } => {
            let service = build_service(&cfg).await?;
            let job_id = match service.submit_url(&url, &format).await {
                Ok(job_id) => job_id,
                Err(e) => {
                    if let Some(failed) = e.downcast_ref::<FetchFailed>() {
                        service.discard(&failed.job_id);
                    }
                    return Err(e.context(format!("Failed to fetch {}", url)));
                }
            };
            follow_job(&service, &cfg, &job_id, &format, &dest, json).await
        }
    }
}

async fn check_toolchain(cfg: &ConverterConfig) -> Result<()> {
    let report = FfmpegBackend::new(cfg)
        .check()
        .await
        .context("FFmpeg toolchain check failed")?;

    println!(
        "ffmpeg {}.{}.{} ({})",
        report.version.major,
        report.version.minor,
        report.version.patch,
        if report.version.meets_requirement() { "ok" } else { "too old" }
    );
    for (name, available) in &report.encoders {
        println!("  {:<12} {}", name, if *available { "✅" } else { "❌ missing" });
    }

    if !report.is_usable() {
        anyhow::bail!("ffmpeg cannot produce every supported format");
    }
    Ok(())
}

async fn build_service(cfg: &ConverterConfig) -> Result<ConversionService> {
    // Nothing is running yet, so anything carrying our prefixes is left over
    let mut cleaned_count = 0;
    for dir in [&cfg.work_dir, &cfg.download_dir] {
        cleaned_count += sweep_orphaned_temp_files(dir)
            .await
            .with_context(|| format!("Failed to clean up {}", dir.display()))?;
    }
    if cleaned_count > 0 {
        info!("🧹 Startup cleanup removed {} orphaned temp file(s)", cleaned_count);
    }

    let registry = Arc::new(JobRegistry::new());
    let converter = Converter::new(
        registry,
        Arc::new(FfmpegBackend::new(cfg)),
        &cfg.work_dir,
        cfg.max_concurrent_jobs,
    );
    Ok(ConversionService::new(converter, UrlFetcher::new(cfg)))
}

/// Poll the job until it settles, then deliver or report the failure
async fn follow_job(
    service: &ConversionService,
    cfg: &ConverterConfig,
    job_id: &JobId,
    format: &str,
    dest: &Path,
    json: bool,
) -> Result<()> {
    // Already validated by the submission
    let format = OutputFormat::parse(format)?;
    let interval = Duration::from_millis(cfg.poll_interval_ms.max(10));
    let mut last_progress = None;

    loop {
        let status = service
            .status(job_id)
            .with_context(|| format!("Job {} disappeared from the registry", job_id))?;

        if last_progress != Some(status.progress) {
            last_progress = Some(status.progress);
            if json {
                let snapshot = serde_json::json!({ "job_id": job_id, "status": &status });
                println!("{}", serde_json::to_string(&snapshot)?);
            } else if status.state() == JobState::Running {
                info!("Job {}: {} {}%", job_id, status.display_name, status.progress);
            }
        }

        match status.state() {
            JobState::Running => tokio::time::sleep(interval).await,
            JobState::Completed => break,
            JobState::Failed => {
                error!("Job {}: ❌ conversion of {} failed", job_id, status.display_name);
                service.discard(job_id);
                anyhow::bail!("Conversion failed");
            }
        }
    }

    let delivery = service
        .deliver(job_id, format, dest)
        .await?
        .with_context(|| format!("Job {} finished but has no result", job_id))?;

    let size = match tokio::fs::metadata(&delivery.path).await {
        Ok(meta) => format_size(meta.len(), DECIMAL),
        Err(e) => {
            warn!("Could not stat {}: {}", delivery.path.display(), e);
            "unknown size".to_string()
        }
    };
    info!("✅ {} ({})", delivery.path.display(), size);
    if json {
        let done = serde_json::json!({
            "job_id": job_id,
            "path": delivery.path,
            "file_name": delivery.file_name,
        });
        println!("{}", serde_json::to_string(&done)?);
    }
    Ok(())
}

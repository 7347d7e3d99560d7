use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use crate::fetch::DOWNLOAD_PREFIX;
use crate::pipeline::OUTPUT_PREFIX;
use crate::service::INPUT_PREFIX;

/// Whether a file name looks like something the engine left behind
pub fn is_engine_temp_file(file_name: &str) -> bool {
    [INPUT_PREFIX, OUTPUT_PREFIX, DOWNLOAD_PREFIX]
        .iter()
        .any(|prefix| file_name.starts_with(prefix))
}

/// Delete staged inputs, outputs and downloads left in `dir` by a previous run.
///
/// Only the top level of `dir` is scanned. Must run before any job is
/// submitted, since live jobs use the same names. Returns the number of files removed.
pub async fn sweep_orphaned_temp_files(dir: &Path) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    debug!("🔍 Checking for orphaned temp files in {}", dir.display());

    let temp_files = tokio::task::spawn_blocking({
        let dir = dir.to_path_buf();
        move || {
            let mut temp_files: Vec<PathBuf> = Vec::new();
            for entry in walkdir::WalkDir::new(&dir)
                .min_depth(1)
                .max_depth(1)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                if let Some(file_name) = entry.file_name().to_str() {
                    if is_engine_temp_file(file_name) {
                        temp_files.push(entry.into_path());
                    }
                }
            }
            temp_files
        }
    })
    .await
    .context("Failed to scan for temp files")?;

    let mut cleaned_count = 0;
    for temp_file in temp_files {
        match tokio::fs::remove_file(&temp_file).await {
            Ok(()) => {
                info!("🧹 Removed orphaned temp file: {}", temp_file.display());
                cleaned_count += 1;
            }
            Err(e) => warn!("Failed to remove orphaned temp file {}: {}", temp_file.display(), e),
        }
    }

    Ok(cleaned_count)
}

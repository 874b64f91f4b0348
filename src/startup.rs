use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::ServerConfig;
use crate::engine::FfmpegEngine;

/// Outcome of a successful validation pass
#[derive(Debug, Clone)]
pub struct StartupReport {
    pub work_dir: PathBuf,
    pub ffmpeg_version: String,
}

pub struct StartupValidator {
    work_dir: PathBuf,
    engine: FfmpegEngine,
}

impl StartupValidator {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            work_dir: config.work_dir.clone(),
            engine: FfmpegEngine::new(config.ffmpeg_path.clone(), config.gif_fps),
        }
    }

    pub async fn validate(&self) -> Result<StartupReport> {
        info!("🔍 Starting validation");

        info!("Step 1: Checking work directory...");
        verify_writable(&self.work_dir).await?;
        info!("✅ Work directory {:?} is writable", self.work_dir);

        info!("Step 2: Probing ffmpeg...");
        let ffmpeg_version = self.engine.version().await?;
        info!("✅ {}", ffmpeg_version);

        info!("🎉 Validation complete");
        Ok(StartupReport {
            work_dir: self.work_dir.clone(),
            ffmpeg_version,
        })
    }
}

async fn verify_writable(dir: &Path) -> Result<()> {
    let meta = tokio::fs::metadata(dir)
        .await
        .with_context(|| format!("work directory {:?} is missing", dir))?;
    if !meta.is_dir() {
        anyhow::bail!("{:?} is not a directory", dir);
    }

    let scratch = dir.join(format!(".write-check-{:08x}", rand::random::<u32>()));
    tokio::fs::write(&scratch, b"ok")
        .await
        .with_context(|| format!("work directory {:?} is not writable", dir))?;
    tokio::fs::remove_file(&scratch).await?;
    Ok(())
}

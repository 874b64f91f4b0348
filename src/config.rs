use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::{
    ChannelOptions, CHUNK_SIZE, DEFAULT_GIF_FPS, DEFAULT_MAX_FRAME_SIZE, DEFAULT_PORT,
    DEFAULT_RSA_BITS,
};

pub const DEFAULT_CONFIG_FILE: &str = "mediaconv.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_address: String,
    pub work_dir: PathBuf,
    pub rsa_bits: usize,
    pub chunk_size: usize,
    pub max_frame_size: usize,
    pub io_timeout_secs: u64,
    pub encryption: bool,
    pub ffmpeg_path: PathBuf,
    pub gif_fps: u32,
    pub audit_log: Option<PathBuf>,
    pub metrics_address: Option<String>,
    pub auto_create_directories: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: format!("0.0.0.0:{}", DEFAULT_PORT),
            work_dir: PathBuf::from("processed"),
            rsa_bits: DEFAULT_RSA_BITS,
            chunk_size: CHUNK_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            io_timeout_secs: 300,
            encryption: true,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            gif_fps: DEFAULT_GIF_FPS,
            audit_log: None,
            metrics_address: None,
            auto_create_directories: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_address: String,
    pub download_dir: PathBuf,
    pub chunk_size: usize,
    pub max_frame_size: usize,
    pub connect_timeout_secs: u64,
    pub io_timeout_secs: u64,
    /// Wait for the server's response after the upload was acknowledged;
    /// covers the transform time. Zero waits indefinitely.
    pub response_timeout_secs: u64,
    pub encryption: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: format!("127.0.0.1:{}", DEFAULT_PORT),
            download_dir: PathBuf::from("receive"),
            chunk_size: CHUNK_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            connect_timeout_secs: 10,
            io_timeout_secs: 300,
            response_timeout_secs: 0,
            encryption: true,
        }
    }
}

/// Zero disables the timeout
fn timeout_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl ServerConfig {
    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            max_frame_size: self.max_frame_size,
            io_timeout: timeout_from_secs(self.io_timeout_secs),
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        if self.auto_create_directories && !self.work_dir.exists() {
            std::fs::create_dir_all(&self.work_dir)
                .with_context(|| format!("creating work directory {:?}", self.work_dir))?;
            tracing::info!("Created work directory: {:?}", self.work_dir);
        }
        Ok(())
    }
}

impl ClientConfig {
    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            max_frame_size: self.max_frame_size,
            io_timeout: timeout_from_secs(self.io_timeout_secs),
        }
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        timeout_from_secs(self.connect_timeout_secs)
    }

    pub fn response_timeout(&self) -> Option<Duration> {
        timeout_from_secs(self.response_timeout_secs)
    }
}

impl AppConfig {
    /// Read the config file, writing the defaults out first if it does not exist.
    pub fn load_or_create(config_path: Option<&Path>) -> Result<Self> {
        let config_file = config_path.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));

        if config_file.exists() {
            let content = std::fs::read_to_string(config_file)
                .with_context(|| format!("reading {:?}", config_file))?;
            let config: AppConfig = toml::from_str(&content)
                .with_context(|| format!("parsing {:?}", config_file))?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save(config_file)?;
            Ok(config)
        }
    }

    pub fn save(&self, config_path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content).with_context(|| format!("writing {:?}", config_path))?;
        Ok(())
    }
}

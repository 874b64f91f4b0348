pub mod ffmpeg;

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::protocol::Operation;

pub use ffmpeg::FfmpegEngine;

/// Performs the media operation on a received file.
///
/// Returns the path of the produced file. Any error is reported back to the
/// client using its display text as the message.
#[async_trait]
pub trait TransformEngine: Send + Sync {
    async fn transform(
        &self,
        input: &Path,
        file_name: &str,
        operation: &Operation,
    ) -> anyhow::Result<PathBuf>;
}

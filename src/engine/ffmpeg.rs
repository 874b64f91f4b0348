use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::engine::TransformEngine;
use crate::protocol::Operation;

/// Runs the `ffmpeg` binary. Output lands next to the input file.
#[derive(Debug, Clone)]
pub struct FfmpegEngine {
    ffmpeg_path: PathBuf,
    gif_fps: u32,
}

impl FfmpegEngine {
    pub fn new(ffmpeg_path: impl Into<PathBuf>, gif_fps: u32) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            gif_fps,
        }
    }

    /// First line of `ffmpeg -version`
    pub async fn version(&self) -> Result<String> {
        let output = Command::new(&self.ffmpeg_path)
            .arg("-version")
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("failed to run {:?}", self.ffmpeg_path))?;
        if !output.status.success() {
            return Err(anyhow!("{:?} -version exited with {}", self.ffmpeg_path, output.status));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().next().unwrap_or_default().to_string())
    }
}

fn stem(file_name: &str) -> &str {
    Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name)
}

/// Result file name for an operation on `file_name`
pub fn output_name(file_name: &str, operation: &Operation) -> String {
    match operation {
        Operation::Compress { .. } => format!("compressed_{}", file_name),
        Operation::Resize { .. } => format!("changed_resolution_{}", file_name),
        Operation::AspectRatio { .. } => format!("changed_aspect_ratio_{}", file_name),
        Operation::ExtractAudio => format!("converted_to_audio_{}.mp3", stem(file_name)),
        Operation::Gif { .. } => format!("created_gif_{}.gif", stem(file_name)),
    }
}

pub fn ffmpeg_args(
    input: &Path,
    output: &Path,
    operation: &Operation,
    default_fps: u32,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-y".into(),
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
    ];

    if let Operation::Gif { start_time, duration, .. } = operation {
        args.push("-ss".into());
        args.push(start_time.to_string().into());
        args.push("-t".into());
        args.push(duration.to_string().into());
    }
    args.push("-i".into());
    args.push(input.as_os_str().to_owned());

    match operation {
        Operation::Compress { bitrate } => {
            args.push("-b:v".into());
            args.push(bitrate.into());
        }
        Operation::Resize { width, .. } => {
            args.push("-vf".into());
            args.push(format!("scale={}:-2", width).into());
        }
        Operation::AspectRatio { width, height } => {
            args.push("-vf".into());
            args.push(format!("setdar={}/{}", width, height).into());
        }
        Operation::ExtractAudio => {
            args.push("-vn".into());
            args.push("-acodec".into());
            args.push("mp3".into());
        }
        Operation::Gif { fps, .. } => {
            args.push("-vf".into());
            let fps = fps.unwrap_or(default_fps);
            args.push(format!("fps={},scale=320:-1:flags=lanczos", fps).into());
            args.push("-loop".into());
            args.push("0".into());
        }
    }

    args.push(output.as_os_str().to_owned());
    args
}

#[async_trait]
impl TransformEngine for FfmpegEngine {
    async fn transform(
        &self,
        input: &Path,
        file_name: &str,
        operation: &Operation,
    ) -> Result<PathBuf> {
        let dir = input.parent().unwrap_or_else(|| Path::new("."));
        let output = dir.join(output_name(file_name, operation));
        let args = ffmpeg_args(input, &output, operation, self.gif_fps);
        debug!("Running {:?} {:?}", self.ffmpeg_path, args);

        let result = Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("failed to run {:?}", self.ffmpeg_path))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let reason = stderr
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .unwrap_or("no diagnostic output");
            return Err(anyhow!("ffmpeg {} failed: {}", operation.name(), reason.trim()));
        }

        if let Err(e) = tokio::fs::remove_file(input).await {
            warn!("Could not remove input {:?}: {}", input, e);
        }
        info!("{} produced {:?}", operation, output);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_of(operation: &Operation) -> Vec<String> {
        ffmpeg_args(Path::new("in.mp4"), Path::new("out"), operation, 10)
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_output_names() {
        let name = "holiday.mp4";
        assert_eq!(
            output_name(name, &Operation::Compress { bitrate: "1M".into() }),
            "compressed_holiday.mp4"
        );
        assert_eq!(
            output_name(name, &Operation::Resize { width: 640, height: 360 }),
            "changed_resolution_holiday.mp4"
        );
        assert_eq!(
            output_name(name, &Operation::AspectRatio { width: 4, height: 3 }),
            "changed_aspect_ratio_holiday.mp4"
        );
        assert_eq!(output_name(name, &Operation::ExtractAudio), "converted_to_audio_holiday.mp3");
        assert_eq!(
            output_name(name, &Operation::Gif { start_time: 0.0, duration: 1.0, fps: None }),
            "created_gif_holiday.gif"
        );
    }

    #[test]
    fn test_resize_keeps_aspect() {
        let args = args_of(&Operation::Resize { width: 1280, height: 720 });
        assert!(args.windows(2).any(|w| w == ["-vf", "scale=1280:-2"]));
    }

    #[test]
    fn test_gif_seeks_before_input() {
        let args = args_of(&Operation::Gif { start_time: 2.5, duration: 3.0, fps: None });
        let ss = args.iter().position(|a| a == "-ss").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert!(ss < input);
        assert_eq!(args[ss + 1], "2.5");
        assert!(args.contains(&"fps=10,scale=320:-1:flags=lanczos".to_string()));
        assert_eq!(args.last().unwrap(), "out");
    }

    #[test]
    fn test_compress_bitrate() {
        let args = args_of(&Operation::Compress { bitrate: "750k".into() });
        assert!(args.windows(2).any(|w| w == ["-b:v", "750k"]));
    }

    #[tokio::test]
    async fn test_missing_binary_reports_error() {
        let engine = FfmpegEngine::new("/nonexistent/ffmpeg-binary", 10);
        let err = engine
            .transform(Path::new("/tmp/in.mp4"), "in.mp4", &Operation::ExtractAudio)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to run"));
        assert!(engine.version().await.is_err());
    }
}

//! Audio pipeline to the channel's voice codec: ffmpeg resamples the
//! source to mono PCM, the silk encoder produces the gateway format, and
//! the duration falls out of the PCM byte length.
//!
//! Every intermediate file is uuid-named and deleted individually; nothing
//! here ever purges a whole directory.

use crate::config::VoiceConfig;
use crate::error::BridgeError;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use uuid::Uuid;

/// Deletes its tracked files when dropped, so temp artifacts are released
/// on every exit path including failures mid-pipeline.
#[derive(Default)]
pub struct ScopedFiles {
    paths: Vec<PathBuf>,
}

impl ScopedFiles {
    pub fn track(&mut self, path: impl Into<PathBuf>) {
        self.paths.push(path.into());
    }
}

impl Drop for ScopedFiles {
    fn drop(&mut self) {
        for path in &self.paths {
            let _ = std::fs::remove_file(path);
        }
    }
}

pub fn tmp_dir(config: &VoiceConfig) -> PathBuf {
    config
        .tmp_dir
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
}

pub fn tmp_path(config: &VoiceConfig, extension: &str) -> PathBuf {
    tmp_dir(config).join(format!("wxbridge-{}.{extension}", Uuid::new_v4().simple()))
}

/// Transcodes `source` to the channel codec. Returns the encoded file and
/// its duration in milliseconds; the caller owns (and must delete) the
/// returned file, intermediates are cleaned up here.
pub async fn to_channel_codec(
    config: &VoiceConfig,
    source: &Path,
) -> Result<(PathBuf, u64), BridgeError> {
    let mut intermediates = ScopedFiles::default();
    let pcm_path = tmp_path(config, "pcm");
    intermediates.track(&pcm_path);

    run_tool(
        config,
        &config.ffmpeg_path,
        &[
            "-y".as_ref(),
            "-i".as_ref(),
            source.as_os_str(),
            "-ar".as_ref(),
            config.sample_rate.to_string().as_ref(),
            "-ac".as_ref(),
            "1".as_ref(),
            "-f".as_ref(),
            "s16le".as_ref(),
            pcm_path.as_os_str(),
        ],
    )
    .await?;

    let pcm_bytes = std::fs::metadata(&pcm_path)
        .map_err(|err| BridgeError::transcode(format!("pcm output missing: {err}")))?
        .len();
    if pcm_bytes == 0 {
        return Err(BridgeError::transcode("ffmpeg produced empty pcm"));
    }
    // 16-bit mono samples.
    let duration_ms = pcm_bytes * 1000 / (u64::from(config.sample_rate) * 2);

    let silk_path = tmp_path(config, "silk");
    let encode_result = run_tool(
        config,
        &config.silk_encoder_path,
        &[
            pcm_path.as_os_str(),
            silk_path.as_os_str(),
            "-Fs_API".as_ref(),
            config.sample_rate.to_string().as_ref(),
            "-tencent".as_ref(),
        ],
    )
    .await;
    if let Err(err) = encode_result {
        let _ = std::fs::remove_file(&silk_path);
        return Err(err);
    }

    Ok((silk_path, duration_ms))
}

async fn run_tool(
    config: &VoiceConfig,
    program: &str,
    args: &[&std::ffi::OsStr],
) -> Result<(), BridgeError> {
    let timeout = Duration::from_secs(config.timeout_s.max(1));
    let output = tokio::time::timeout(
        timeout,
        Command::new(program).args(args).kill_on_drop(true).output(),
    )
    .await
    .map_err(|_| BridgeError::transcode(format!("{program} timed out after {timeout:?}")))?
    .map_err(|err| BridgeError::transcode(format!("{program} failed to start: {err}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: String = stderr
            .lines()
            .rev()
            .take(3)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join(" | ");
        return Err(BridgeError::transcode(format!(
            "{program} exited with {}: {tail}",
            output.status
        )));
    }
    Ok(())
}

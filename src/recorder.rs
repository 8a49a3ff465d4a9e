// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Optional session recorder.
//!
//! Spawns an independent ffmpeg re-encoder that reads the same source URL
//! and writes H.264 + AAC into an MP4 with streaming-friendly flags. The
//! recorder is never consulted for frames; its failure only nulls the
//! recorded-path field.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::Local;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::error::{MonitorError, Result};

/// Grace period between the quit request and SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(3);

/// Handle to a running ffmpeg recording child.
pub struct Recorder {
    child: Child,
    /// Absolute output path.
    pub path: PathBuf,
    /// Path relative to the record root's parent, the form persisted to
    /// the database so a static server rooted one level up serves it
    /// unchanged.
    pub rel_path: String,
}

impl Recorder {
    /// Start recording `input_url` under `<record_root>/<camera>/<ts>.mp4`.
    /// `fps` optionally caps the output frame rate.
    pub fn spawn(
        record_root: &Path,
        camera_id: &str,
        input_url: &str,
        fps: Option<u32>,
    ) -> Result<Self> {
        let camera = if camera_id.is_empty() { "unknown" } else { camera_id };
        let dir = record_root.join(camera);
        std::fs::create_dir_all(&dir)?;

        let file_name = format!("{}.mp4", Local::now().format("%Y%m%d_%H%M%S"));
        let path = dir.join(&file_name);

        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-loglevel", "error", "-y", "-i", input_url]);
        if let Some(fps) = fps.filter(|f| *f > 0) {
            cmd.args(["-r", &fps.to_string()]);
        }
        cmd.args([
            "-c:v", "libx264",
            "-preset", "veryfast",
            "-pix_fmt", "yuv420p",
            "-c:a", "aac",
            "-b:a", "128k",
            "-movflags", "+faststart",
        ])
        .arg(&path)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            MonitorError::Io(std::io::Error::new(
                e.kind(),
                format!("ffmpeg recorder spawn: {e}"),
            ))
        })?;

        let root_name = record_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "records".into());
        let rel_path = format!("{root_name}/{camera}/{file_name}");

        info!(path = %path.display(), "Recorder started");
        Ok(Recorder { child, path, rel_path })
    }

    /// Ask ffmpeg to finalise the container (`q` on stdin), wait out the
    /// grace period, then kill.
    pub async fn stop(mut self) {
        if let Some(mut stdin) = self.child.stdin.take() {
            let _ = stdin.write_all(b"q").await;
            let _ = stdin.shutdown().await;
        }
        match tokio::time::timeout(STOP_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(?status, path = %self.path.display(), "Recorder stopped");
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Recorder wait failed");
            }
            Err(_) => {
                warn!(path = %self.path.display(), "Recorder did not exit in time, killing");
                let _ = self.child.kill().await;
            }
        }
    }
}

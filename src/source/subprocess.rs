// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Out-of-process decoder for HLS manifests.
//!
//! Spawns ffmpeg to pull the stream, drop audio and emit raw BGR24 frames
//! at a fixed scaled resolution on stdout. The parent reads exact
//! `W·H·3`-byte packets; a short read ends the stream.

use std::process::Stdio;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, warn};

use super::{Frame, FrameStream, DEFAULT_FPS};
use crate::error::{MonitorError, Result};

/// Fixed decode resolution for HLS streams.
pub const HLS_WIDTH: u32 = 640;
pub const HLS_HEIGHT: u32 = 360;

/// Handle to a running ffmpeg decode child.
pub struct SubprocessSource {
    child: Child,
    stdout: BufReader<ChildStdout>,
    width: u32,
    height: u32,
    frame_index: u64,
    finished: bool,
}

impl SubprocessSource {
    pub fn spawn(url: &str) -> Result<Self> {
        let mut child = Command::new("ffmpeg")
            .args([
                "-loglevel", "error",
                "-i", url,
                "-an",
                "-f", "rawvideo",
                "-pix_fmt", "bgr24",
                "-vf", &format!("scale={HLS_WIDTH}:{HLS_HEIGHT}"),
                "-",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MonitorError::SourceOpen {
                url: url.to_string(),
                reason: format!("ffmpeg spawn: {e}"),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| MonitorError::SourceOpen {
            url: url.to_string(),
            reason: "ffmpeg stdout not captured".into(),
        })?;

        debug!(url, width = HLS_WIDTH, height = HLS_HEIGHT, "HLS decoder started");

        Ok(SubprocessSource {
            child,
            stdout: BufReader::new(stdout),
            width: HLS_WIDTH,
            height: HLS_HEIGHT,
            frame_index: 0,
            finished: false,
        })
    }
}

#[async_trait]
impl FrameStream for SubprocessSource {
    async fn next_frame(&mut self) -> Option<Frame> {
        if self.finished {
            return None;
        }
        let frame_bytes = (self.width * self.height * 3) as usize;
        let mut buf = BytesMut::zeroed(frame_bytes);
        match self.stdout.read_exact(&mut buf).await {
            Ok(_) => {
                self.frame_index += 1;
                Some(Frame { width: self.width, height: self.height, data: buf.freeze() })
            }
            Err(e) => {
                if e.kind() != std::io::ErrorKind::UnexpectedEof {
                    warn!(error = %e, "HLS decoder read failed");
                }
                self.finished = true;
                None
            }
        }
    }

    fn frame_index(&self) -> u64 {
        self.frame_index
    }

    fn nominal_fps(&self) -> f64 {
        DEFAULT_FPS
    }

    fn is_live(&self) -> bool {
        true
    }

    fn close(&mut self) {
        let _ = self.child.start_kill();
    }
}

impl Drop for SubprocessSource {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}

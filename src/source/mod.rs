// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Frame ingestion.
//!
//! Two variants behind one trait: an in-process GStreamer decode pipeline
//! for files and HTTP/MJPEG, and an ffmpeg child process piping raw BGR24
//! frames for HLS manifests, whose segment/timestamp handling the external
//! tool is far better at.

pub mod direct;
pub mod subprocess;

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Nominal frame rate assumed when the source does not report one.
pub const DEFAULT_FPS: f64 = 30.0;

/// One decoded frame, tightly packed BGR24.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

/// A stream of decoded frames with a running frame index.
#[async_trait]
pub trait FrameStream: Send {
    /// Next decoded frame, or `None` at end of stream.
    async fn next_frame(&mut self) -> Option<Frame>;

    /// Advance past `n` frames without handing them out.
    /// Returns false when the stream ended while skipping.
    async fn skip_frames(&mut self, n: u64) -> bool {
        for _ in 0..n {
            if self.next_frame().await.is_none() {
                return false;
            }
        }
        true
    }

    /// Absolute index of the last frame yielded.
    fn frame_index(&self) -> u64;

    /// Source nominal fps (fallback [`DEFAULT_FPS`]).
    fn nominal_fps(&self) -> f64;

    /// Live sources arrive in real time and are paced by the source itself.
    fn is_live(&self) -> bool;

    /// Release decoder resources; also runs on drop.
    fn close(&mut self) {}
}

/// Select and open the right variant for an already-resolved source.
pub async fn open(resolved: &str) -> Result<Box<dyn FrameStream>> {
    if is_hls_url(resolved) {
        Ok(Box::new(subprocess::SubprocessSource::spawn(resolved)?))
    } else {
        let url = resolved.to_string();
        let source = tokio::task::spawn_blocking(move || direct::DirectSource::open(&url))
            .await
            .map_err(|e| crate::error::MonitorError::SourceOpen {
                url: resolved.to_string(),
                reason: format!("decoder task failed: {e}"),
            })??;
        Ok(Box::new(source))
    }
}

/// Map a client-supplied URL to something the decoders can open:
/// `/video/...` and bare relative names resolve into `video_root`;
/// http(s) URLs and absolute paths pass through.
pub fn resolve_source_url(url: &str, video_root: &Path) -> String {
    let url = url.trim();
    if url.is_empty() {
        return String::new();
    }

    if url.starts_with("/video/") || url.starts_with("/videos/") {
        if let Some(name) = Path::new(url).file_name() {
            return video_root.join(name).to_string_lossy().into_owned();
        }
    }

    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_string();
    }

    let path = Path::new(url);
    if path.is_absolute() {
        return url.to_string();
    }
    match path.file_name() {
        Some(name) => video_root.join(name).to_string_lossy().into_owned(),
        None => url.to_string(),
    }
}

/// HLS is detected by scheme plus a `.m3u8` manifest anywhere in the URL.
pub fn is_hls_url(url: &str) -> bool {
    (url.starts_with("http://") || url.starts_with("https://"))
        && url.to_ascii_lowercase().contains(".m3u8")
}

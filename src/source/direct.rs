//! In-process decoder for files and HTTP/MJPEG sources.
//!
//! Pipeline: `uridecodebin → videoconvert → BGR appsink`. The appsink is
//! capped at two queued buffers with `drop=false`, so a slow consumer
//! backpressures the decoder instead of queueing frames without bound.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Frame, FrameStream, DEFAULT_FPS};
use crate::error::{MonitorError, Result};

enum SourceEvent {
    Frame(Frame),
    Eos,
}

/// Decoder handle for one file or MJPEG source.
pub struct DirectSource {
    pipeline: gst::Pipeline,
    rx: mpsc::Receiver<SourceEvent>,
    fps: f64,
    frame_index: u64,
    finished: bool,
}

impl DirectSource {
    /// Build and start the pipeline. Blocking: waits for the pipeline to
    /// reach PLAYING (or fail), so call it from a worker thread.
    pub fn open(resolved: &str) -> Result<Self> {
        gst::init().map_err(|e| MonitorError::GStreamer(format!("gst::init: {e}")))?;

        let uri = to_uri(resolved)?;
        let pipeline_str = format!(
            "uridecodebin uri={uri} ! videoconvert ! video/x-raw,format=BGR ! \
             appsink name=sink max-buffers=2 drop=false sync=false emit-signals=true"
        );

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| MonitorError::GStreamer(format!("parse_launch: {e}")))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| MonitorError::GStreamer("Not a pipeline".into()))?;

        let appsink: gst_app::AppSink = pipeline
            .by_name("sink")
            .ok_or_else(|| MonitorError::GStreamer("appsink not found".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| MonitorError::GStreamer("Cast to AppSink failed".into()))?;

        let (tx, rx) = mpsc::channel::<SourceEvent>(4);

        let frame_tx = tx.clone();
        let eos_tx = tx.clone();
        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Error)?;
                    let frame = sample_to_frame(&sample).ok_or(gst::FlowError::Error)?;
                    // Blocking send from the streaming thread backpressures
                    // the decoder; a dropped receiver means teardown.
                    if frame_tx.blocking_send(SourceEvent::Frame(frame)).is_err() {
                        return Err(gst::FlowError::Flushing);
                    }
                    Ok(gst::FlowSuccess::Ok)
                })
                .eos(move |_| {
                    // The channel may be full of undelivered frames; the
                    // EOS marker must still arrive or the reader hangs.
                    let _ = eos_tx.blocking_send(SourceEvent::Eos);
                })
                .build(),
        );

        // Mid-stream decode errors surface on the bus, not the appsink.
        if let Some(bus) = pipeline.bus() {
            let err_tx = tx;
            bus.set_sync_handler(move |_, msg| {
                if let gst::MessageView::Error(err) = msg.view() {
                    warn!(error = %err.error(), "Decode pipeline error");
                    if err_tx.try_send(SourceEvent::Eos).is_err() {
                        // Queue full of frames; deliver the marker without
                        // blocking the posting thread.
                        let tx = err_tx.clone();
                        std::thread::spawn(move || {
                            let _ = tx.blocking_send(SourceEvent::Eos);
                        });
                    }
                }
                gst::BusSyncReply::Drop
            });
        }

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| MonitorError::SourceOpen {
                url: resolved.to_string(),
                reason: format!("set_state Playing: {e}"),
            })?;

        // Wait out the async state change; a bad URL fails here.
        let (res, _, _) = pipeline.state(gst::ClockTime::from_seconds(5));
        if res.is_err() {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(MonitorError::SourceOpen {
                url: resolved.to_string(),
                reason: "pipeline failed to reach PLAYING".into(),
            });
        }

        let fps = negotiated_fps(&appsink).unwrap_or(DEFAULT_FPS);
        debug!(url = resolved, fps, "Direct decoder started");

        Ok(DirectSource { pipeline, rx, fps, frame_index: 0, finished: false })
    }
}

#[async_trait]
impl FrameStream for DirectSource {
    async fn next_frame(&mut self) -> Option<Frame> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(SourceEvent::Frame(frame)) => {
                self.frame_index += 1;
                Some(frame)
            }
            Some(SourceEvent::Eos) | None => {
                self.finished = true;
                None
            }
        }
    }

    fn frame_index(&self) -> u64 {
        self.frame_index
    }

    fn nominal_fps(&self) -> f64 {
        self.fps
    }

    fn is_live(&self) -> bool {
        false
    }

    fn close(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
        self.rx.close();
    }
}

impl Drop for DirectSource {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

fn to_uri(resolved: &str) -> Result<String> {
    if resolved.starts_with("http://") || resolved.starts_with("https://") {
        return Ok(resolved.to_string());
    }
    gst::glib::filename_to_uri(resolved, None)
        .map(|u| u.to_string())
        .map_err(|e| MonitorError::SourceOpen {
            url: resolved.to_string(),
            reason: format!("not a usable path: {e}"),
        })
}

/// Copy one sample into a tightly packed BGR frame, dropping any row
/// padding the converter added.
fn sample_to_frame(sample: &gst::Sample) -> Option<Frame> {
    let buffer = sample.buffer()?;
    let caps = sample.caps()?;
    let info = gst_video::VideoInfo::from_caps(caps).ok()?;
    let map = buffer.map_readable().ok()?;

    let width = info.width();
    let height = info.height();
    let stride = info.stride()[0] as usize;
    let row_bytes = width as usize * 3;
    let data = map.as_slice();
    if data.len() < stride * (height as usize - 1) + row_bytes {
        return None;
    }

    let mut packed = BytesMut::with_capacity(row_bytes * height as usize);
    for y in 0..height as usize {
        let start = y * stride;
        packed.extend_from_slice(&data[start..start + row_bytes]);
    }

    Some(Frame { width, height, data: Bytes::from(packed) })
}

fn negotiated_fps(appsink: &gst_app::AppSink) -> Option<f64> {
    let caps = appsink.static_pad("sink")?.current_caps()?;
    let info = gst_video::VideoInfo::from_caps(&caps).ok()?;
    let fps = info.fps();
    if fps.numer() > 0 && fps.denom() > 0 {
        Some(fps.numer() as f64 / fps.denom() as f64)
    } else {
        None
    }
}

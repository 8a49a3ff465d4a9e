// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Per-session pacing loop.
//!
//! Two pacing disciplines share one tick body. Files and MJPEG are
//! wall-clock paced: the loop sleeps to the configured tick rate and
//! skips source frames to keep up with the nominal fps. HLS streams are
//! source-paced: the decode child already delivers frames in real time,
//! so every received frame is a tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::db::{Db, TickRow};
use crate::infer;
use crate::model::SharedModels;
use crate::params::{ParamStore, Params};
use crate::protocol::{Outbound, TickPayload};
use crate::session::{SessionState, SessionStatus};
use crate::source::{Frame, FrameStream};

/// Persistence target for one session's ticks.
pub struct TickSink {
    pub db: Db,
    pub session_id: i64,
}

enum FrameStep {
    Frame(Frame),
    Eof,
    Stopped,
}

/// Drive the source until EOF, stop, or a terminal send failure.
/// Owns the source and releases it before returning.
pub async fn run(
    mut source: Box<dyn FrameStream>,
    models: SharedModels,
    params: Arc<ParamStore>,
    state: Arc<SessionState>,
    out_tx: mpsc::Sender<Outbound>,
    sink: Option<TickSink>,
) {
    let mut ctx = TickCtx {
        models,
        state: state.clone(),
        out_tx,
        sink,
        tick_idx: 0,
        last_mask_b64: None,
        eof_sent: false,
    };

    if source.is_live() {
        run_source_paced(&mut source, &params, &state, &mut ctx).await;
    } else {
        run_wall_clock(&mut source, &params, &state, &mut ctx).await;
    }

    source.close();
    debug!(ticks = ctx.tick_idx, status = ?state.status(), "Pacing loop finished");
}

/// File/MJPEG variant: wall-clock paced with source frame-skipping.
/// `video_sec` follows the decoder's frame counter, not the wall clock.
async fn run_wall_clock(
    source: &mut Box<dyn FrameStream>,
    params: &ParamStore,
    state: &SessionState,
    ctx: &mut TickCtx,
) {
    let src_fps = source.nominal_fps().max(1.0);
    let mut next_wall = Instant::now();

    loop {
        if state.stop_requested() {
            break;
        }
        let p = params.snapshot();
        let tick_period = Duration::from_secs_f64(1.0 / p.fps as f64);
        let frames_per_tick = ((src_fps / p.fps as f64).round() as u64).max(1);

        tokio::time::sleep_until(next_wall).await;
        if state.stop_requested() {
            break;
        }

        let step = tokio::select! {
            step = read_tick_frame(source, frames_per_tick - 1) => step,
            _ = state.wait_stop() => FrameStep::Stopped,
        };
        let frame = match step {
            FrameStep::Frame(frame) => frame,
            FrameStep::Eof => {
                ctx.emit_eof().await;
                break;
            }
            FrameStep::Stopped => break,
        };

        let video_sec = source.frame_index() as f64 / src_fps;
        let need_mask = p.send_mask_every > 0 && ctx.tick_idx % p.send_mask_every as u64 == 0;
        if !ctx.step(frame, &p, need_mask, video_sec).await {
            break;
        }

        next_wall += tick_period;
        // More than one period behind: resync instead of bursting.
        if next_wall + tick_period < Instant::now() {
            next_wall = Instant::now();
        }
    }
}

/// Grab-skip past the frames between ticks, then decode one.
async fn read_tick_frame(source: &mut Box<dyn FrameStream>, skip: u64) -> FrameStep {
    if !source.skip_frames(skip).await {
        return FrameStep::Eof;
    }
    match source.next_frame().await {
        Some(frame) => FrameStep::Frame(frame),
        None => FrameStep::Eof,
    }
}

/// HLS variant: the subprocess stream arrives in real time, every frame
/// is a tick, and `video_sec` is monotonic elapsed wall time.
async fn run_source_paced(
    source: &mut Box<dyn FrameStream>,
    params: &ParamStore,
    state: &SessionState,
    ctx: &mut TickCtx,
) {
    let started = Instant::now();

    loop {
        if state.stop_requested() {
            break;
        }
        let step = tokio::select! {
            frame = source.next_frame() => match frame {
                Some(frame) => FrameStep::Frame(frame),
                None => FrameStep::Eof,
            },
            _ = state.wait_stop() => FrameStep::Stopped,
        };
        let frame = match step {
            FrameStep::Frame(frame) => frame,
            FrameStep::Eof => {
                ctx.emit_eof().await;
                break;
            }
            FrameStep::Stopped => break,
        };

        let p = params.snapshot();
        let video_sec = started.elapsed().as_secs_f64();
        // Compute the mask on every tick so the cache stays warm; the
        // gate in the tick body decides transmission.
        let want_mask = p.send_mask_every > 0;
        if !ctx.step(frame, &p, want_mask, video_sec).await {
            break;
        }
    }
}

/// Shared per-tick state and body.
struct TickCtx {
    models: SharedModels,
    state: Arc<SessionState>,
    out_tx: mpsc::Sender<Outbound>,
    sink: Option<TickSink>,
    tick_idx: u64,
    last_mask_b64: Option<String>,
    eof_sent: bool,
}

impl TickCtx {
    /// Run inference, apply the mask cache policy, persist, send.
    /// Returns false when the loop must exit.
    async fn step(&mut self, frame: Frame, p: &Params, want_mask: bool, video_sec: f64) -> bool {
        let models = self.models.clone();
        let snapshot = p.clone();
        let handle = tokio::task::spawn_blocking(move || {
            infer::run_tick(models.as_ref(), &frame, &snapshot, want_mask)
        });

        let mut result = match handle.await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                // Tick skipped; repeated failures do not end the session.
                warn!(tick = self.tick_idx, error = %e, "Inference failed, skipping tick");
                return true;
            }
            Err(e) => {
                error!(error = %e, "Inference worker panicked");
                return true;
            }
        };

        // Mask cache: remember any computed mask, attach only on gated
        // ticks, and forget everything while transport is disabled.
        let send_every = p.send_mask_every as u64;
        if send_every == 0 {
            self.last_mask_b64 = None;
            result.water.mask_png_b64 = None;
        } else {
            if let Some(mask) = result.water.mask_png_b64.take() {
                self.last_mask_b64 = Some(mask);
            }
            if self.tick_idx % send_every == 0 {
                result.water.mask_png_b64 = self.last_mask_b64.clone();
            }
        }

        let ts_ms = (video_sec * 1000.0) as i64;

        // Persist before the client send; failures stay local.
        if let Some(sink) = &self.sink {
            let row = TickRow {
                ts_ms,
                video_sec,
                water_percent: result.pct.round() as i64,
                risk_level: result.level as i64,
                mask_h: result.water.image_h as i64,
                mask_w: result.water.image_w as i64,
                water_polys: if result.water.polygons.is_empty() {
                    None
                } else {
                    serde_json::to_string(&result.water.polygons).ok()
                },
                risk_boxes: result
                    .risk
                    .det
                    .as_ref()
                    .filter(|d| !d.boxes_norm.is_empty())
                    .and_then(|d| serde_json::to_string(&d.boxes_norm).ok()),
            };
            if let Err(e) = sink.db.save_tick(sink.session_id, &row).await {
                warn!(session = sink.session_id, error = %e, "Tick persist failed");
            }
        }

        let payload = TickPayload {
            tick_idx: self.tick_idx,
            ts: ts_ms,
            pct: result.pct,
            level: result.level,
            water: result.water,
            risk: result.risk,
            params: p.clone(),
        };
        if self.out_tx.send(Outbound::Tick(payload)).await.is_err() {
            self.state.request_stop(SessionStatus::Stopped);
            return false;
        }

        self.tick_idx += 1;
        true
    }

    async fn emit_eof(&mut self) {
        if self.eof_sent {
            return;
        }
        self.eof_sent = true;
        let _ = self.out_tx.send(Outbound::Eof).await;
        self.state.finish(SessionStatus::Done);
    }
}

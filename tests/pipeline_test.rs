// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Pipeline integration tests: pacing loop + inference stage + mask
//! gating + persistence coupling, driven by a scripted frame source and
//! synthetic models.
//!
//! Run with: `cargo test`

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use image::GrayImage;
use tokio::sync::mpsc;

use floodwatch::db::Db;
use floodwatch::infer;
use floodwatch::model::{DetBox, FloodModels, RiskOptions, RiskOutput, WaterOptions, WaterOutput};
use floodwatch::pacing::{self, TickSink};
use floodwatch::params::{ParamStore, Params, ParamUpdate};
use floodwatch::protocol::{Outbound, TickPayload};
use floodwatch::session::{handle_inbound, SessionState, SessionStatus};
use floodwatch::source::{Frame, FrameStream};

const W: u32 = 64;
const H: u32 = 64;

fn test_frame() -> Frame {
    Frame { width: W, height: H, data: Bytes::from(vec![0u8; (W * H * 3) as usize]) }
}

/// Deterministic in-memory frame source.
struct ScriptedSource {
    frames: u64,
    served: u64,
    fps: f64,
    live: bool,
}

impl ScriptedSource {
    fn file(frames: u64, fps: f64) -> Self {
        Self { frames, served: 0, fps, live: false }
    }

    fn live(frames: u64) -> Self {
        Self { frames, served: 0, fps: 30.0, live: true }
    }
}

#[async_trait]
impl FrameStream for ScriptedSource {
    async fn next_frame(&mut self) -> Option<Frame> {
        if self.served >= self.frames {
            return None;
        }
        self.served += 1;
        Some(test_frame())
    }

    fn frame_index(&self) -> u64 {
        self.served
    }

    fn nominal_fps(&self) -> f64 {
        self.fps
    }

    fn is_live(&self) -> bool {
        self.live
    }
}

/// Synthetic models: the top `water_rows` rows of the frame are water,
/// and every frame carries one detection with the given class name.
struct FakeModels {
    water_rows: u32,
    risk_class: Option<&'static str>,
}

impl FloodModels for FakeModels {
    fn infer_water(&self, frame: &Frame, _opts: &WaterOptions) -> floodwatch::error::Result<WaterOutput> {
        let rows = self.water_rows;
        let mask = GrayImage::from_fn(frame.width, frame.height, |_, y| {
            if y < rows { image::Luma([255u8]) } else { image::Luma([0u8]) }
        });
        Ok(WaterOutput { mask, objects: Vec::new() })
    }

    fn infer_risk(&self, _frame: &Frame, _opts: &RiskOptions) -> floodwatch::error::Result<RiskOutput> {
        let boxes = self
            .risk_class
            .map(|name| {
                vec![DetBox {
                    cls_idx: 0,
                    cls_name: name.to_string(),
                    conf: 0.9,
                    xyxyn: [0.1, 0.1, 0.5, 0.5],
                }]
            })
            .unwrap_or_default();
        Ok(RiskOutput { cls: None, boxes, n_classes: 3 })
    }
}

fn default_params(overrides: ParamUpdate) -> Params {
    let mut p = Params::from_defaults(&floodwatch::config::DefaultParams::default());
    p.apply(&overrides);
    p
}

struct Run {
    ticks: Vec<TickPayload>,
    trailing: Vec<Outbound>,
    state: Arc<SessionState>,
}

/// Drive the pacing loop to completion and collect everything it sent.
async fn run_pipeline(source: ScriptedSource, params: Params, sink: Option<TickSink>) -> Run {
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(64);
    let state = Arc::new(SessionState::new());
    let store = Arc::new(ParamStore::new(params));

    let handle = tokio::spawn(pacing::run(
        Box::new(source),
        Arc::new(FakeModels { water_rows: H / 4, risk_class: Some("high") }),
        store,
        state.clone(),
        out_tx,
        sink,
    ));

    let mut ticks = Vec::new();
    let mut trailing = Vec::new();
    while let Some(msg) = out_rx.recv().await {
        match msg {
            Outbound::Tick(tick) if trailing.is_empty() => ticks.push(tick),
            other => trailing.push(other),
        }
    }
    handle.await.unwrap();
    Run { ticks, trailing, state }
}

#[tokio::test(start_paused = true)]
async fn file_source_runs_to_eof_with_contiguous_ticks() {
    // 20 source frames at 30 fps, sampled at 10 ticks/s: 3 frames per
    // tick, so 6 full ticks fit before the source runs dry.
    let params = default_params(ParamUpdate { fps: Some(10), ..Default::default() });
    let run = run_pipeline(ScriptedSource::file(20, 30.0), params, None).await;

    assert_eq!(run.ticks.len(), 6);
    for (i, tick) in run.ticks.iter().enumerate() {
        assert_eq!(tick.tick_idx, i as u64);
    }
    for pair in run.ticks.windows(2) {
        assert!(pair[0].ts <= pair[1].ts, "ts must be non-decreasing");
    }
    // video_sec basis: frame_index / src_fps → first tick at frame 3.
    assert_eq!(run.ticks[0].ts, 100);

    assert_eq!(run.trailing.len(), 1);
    assert!(matches!(run.trailing[0], Outbound::Eof));
    assert_eq!(run.state.status(), SessionStatus::Done);
}

#[tokio::test(start_paused = true)]
async fn live_source_ticks_every_frame() {
    let params = default_params(ParamUpdate { fps: Some(5), ..Default::default() });
    let run = run_pipeline(ScriptedSource::live(8), params, None).await;

    assert_eq!(run.ticks.len(), 8);
    for pair in run.ticks.windows(2) {
        assert!(pair[0].ts <= pair[1].ts);
    }
    assert!(matches!(run.trailing[0], Outbound::Eof));
    assert_eq!(run.state.status(), SessionStatus::Done);
}

#[tokio::test(start_paused = true)]
async fn masks_appear_only_on_gated_ticks() {
    let params = default_params(ParamUpdate {
        fps: Some(30),
        send_mask_every: Some(3),
        ..Default::default()
    });
    let run = run_pipeline(ScriptedSource::file(10, 30.0), params, None).await;

    assert_eq!(run.ticks.len(), 10);
    for tick in &run.ticks {
        let expected = tick.tick_idx % 3 == 0;
        assert_eq!(
            tick.water.mask_png_b64.is_some(),
            expected,
            "tick {} mask presence",
            tick.tick_idx
        );
    }
}

#[tokio::test(start_paused = true)]
async fn zero_send_mask_every_disables_masks() {
    let params = default_params(ParamUpdate {
        fps: Some(30),
        send_mask_every: Some(0),
        ..Default::default()
    });
    let run = run_pipeline(ScriptedSource::file(6, 30.0), params, None).await;

    assert_eq!(run.ticks.len(), 6);
    assert!(run.ticks.iter().all(|t| t.water.mask_png_b64.is_none()));
}

#[tokio::test(start_paused = true)]
async fn stop_request_ends_the_loop_promptly() {
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(64);
    let state = Arc::new(SessionState::new());
    let store = Arc::new(ParamStore::new(default_params(ParamUpdate {
        fps: Some(10),
        ..Default::default()
    })));

    let handle = tokio::spawn(pacing::run(
        Box::new(ScriptedSource::file(10_000, 30.0)),
        Arc::new(FakeModels { water_rows: 8, risk_class: None }),
        store,
        state.clone(),
        out_tx,
        None,
    ));

    let mut seen = 0u64;
    let mut after_stop = 0u64;
    let mut stopped = false;
    while let Some(msg) = out_rx.recv().await {
        if let Outbound::Tick(_) = msg {
            seen += 1;
            if stopped {
                after_stop += 1;
            }
            if seen == 3 {
                state.request_stop(SessionStatus::Stopped);
                stopped = true;
            }
        }
    }
    handle.await.unwrap();

    assert!(after_stop <= 1, "at most one tick after stop, got {after_stop}");
    assert_eq!(run_status(&state), "stopped");
}

fn run_status(state: &SessionState) -> &'static str {
    state.status().as_str()
}

#[tokio::test(start_paused = true)]
async fn dropped_client_channel_transitions_to_stopped() {
    let (out_tx, out_rx) = mpsc::channel::<Outbound>(1);
    let state = Arc::new(SessionState::new());
    let store = Arc::new(ParamStore::new(default_params(ParamUpdate {
        fps: Some(30),
        ..Default::default()
    })));

    // The client goes away immediately.
    drop(out_rx);

    pacing::run(
        Box::new(ScriptedSource::file(100, 30.0)),
        Arc::new(FakeModels { water_rows: 8, risk_class: None }),
        store,
        state.clone(),
        out_tx,
        None,
    )
    .await;

    assert_eq!(state.status(), SessionStatus::Stopped);
}

#[tokio::test(start_paused = true)]
async fn ticks_are_persisted_before_eof() {
    let db = Db::connect("sqlite::memory:").await.expect("connect");
    let meta = floodwatch::db::SessionMeta {
        camera_id: "cam1",
        camera_name: "North bridge",
        location: "riverside",
        source_type: "video",
        source_url: "/video/flood.mp4",
    };
    let params = default_params(ParamUpdate { fps: Some(30), ..Default::default() });
    let session_id = db.create_session(&meta, &params).await.expect("create");

    let run = run_pipeline(
        ScriptedSource::file(5, 30.0),
        params,
        Some(TickSink { db: db.clone(), session_id }),
    )
    .await;
    assert_eq!(run.ticks.len(), 5);

    // The supervisor stamps the terminal status after the loop.
    db.finish_session(session_id, run.state.status().as_str()).await.expect("finish");

    let rows = db.list_ticks(session_id, 0).await.expect("list");
    assert_eq!(rows.len(), 5);
    for pair in rows.windows(2) {
        assert!(pair[0].video_sec <= pair[1].video_sec);
        assert!(pair[0].ts_ms <= pair[1].ts_ms);
    }
    // FakeModels floods the top quarter of the frame.
    assert!(rows.iter().all(|r| r.water_percent == 25));
    assert!(rows.iter().all(|r| r.risk_level == 5));

    let status = db.session_status(session_id).await.expect("status");
    assert_eq!(status.as_deref(), Some("done"));
}

#[tokio::test(start_paused = true)]
async fn database_outage_does_not_break_the_stream() {
    let db = Db::connect("sqlite::memory:").await.expect("connect");
    let meta = floodwatch::db::SessionMeta {
        camera_id: "cam1",
        camera_name: "",
        location: "",
        source_type: "video",
        source_url: "x.mp4",
    };
    let params = default_params(ParamUpdate { fps: Some(30), ..Default::default() });
    let session_id = db.create_session(&meta, &params).await.expect("create");

    // Outage right after session creation: every tick insert fails.
    db.close().await;

    let run = run_pipeline(
        ScriptedSource::file(4, 30.0),
        params,
        Some(TickSink { db, session_id }),
    )
    .await;

    assert_eq!(run.ticks.len(), 4, "ticks must keep flowing to the client");
    assert!(matches!(run.trailing[0], Outbound::Eof));
    assert_eq!(run.state.status(), SessionStatus::Done);
}

// ──────────────── inference stage properties ──────────────────────────────

#[test]
fn water_percent_matches_synthetic_coverage() {
    let models = FakeModels { water_rows: H / 2, risk_class: None };
    let params = default_params(ParamUpdate::default());
    let result = infer::run_tick(&models, &test_frame(), &params, false).expect("tick");
    assert!((result.pct - 50.0).abs() < 0.5, "pct = {}", result.pct);
}

#[test]
fn polygons_are_normalised_rings() {
    let models = FakeModels { water_rows: H / 2, risk_class: None };
    let params = default_params(ParamUpdate::default());
    let result = infer::run_tick(&models, &test_frame(), &params, false).expect("tick");

    assert!(!result.water.polygons.is_empty());
    for poly in &result.water.polygons {
        assert!(poly.outer.len() >= 3);
        for [x, y] in &poly.outer {
            assert!((0.0..=1.0).contains(x) && (0.0..=1.0).contains(y));
        }
        for hole in &poly.holes {
            assert!(hole.len() >= 3);
        }
    }
}

#[test]
fn named_high_detection_yields_level_five() {
    let models = FakeModels { water_rows: 0, risk_class: Some("high") };
    let params = default_params(ParamUpdate::default());
    let result = infer::run_tick(&models, &test_frame(), &params, false).expect("tick");
    assert_eq!(result.level, 5);
    let det = result.risk.det.expect("det head");
    assert_eq!(det.boxes_norm.len(), 1);
    assert_eq!(det.boxes_norm[0].4, 5);
}

#[test]
fn no_detections_yield_level_zero() {
    let models = FakeModels { water_rows: 0, risk_class: None };
    let params = default_params(ParamUpdate::default());
    let result = infer::run_tick(&models, &test_frame(), &params, false).expect("tick");
    assert_eq!(result.level, 0);
    assert_eq!(result.pct, 0.0);
    assert!(result.risk.det.is_none() && result.risk.cls.is_none());
}

// ──────────────── control-channel handling ────────────────────────────────

#[tokio::test]
async fn set_params_acks_with_accepted_keys_and_snapshot() {
    let state = SessionState::new();
    let store = ParamStore::new(default_params(ParamUpdate::default()));
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(4);

    handle_inbound(
        r#"{"type": "set_params", "fps": 99, "send_mask_every": 3, "bogus": true}"#,
        &state,
        &store,
        &out_tx,
    )
    .await;

    match out_rx.recv().await.expect("ack") {
        Outbound::Ack { updated, params } => {
            assert!(updated.contains(&"fps".to_string()));
            assert!(updated.contains(&"send_mask_every".to_string()));
            assert!(!updated.iter().any(|k| k == "bogus"));
            assert_eq!(params.fps, 30, "fps must be clipped to 30");
            assert_eq!(params.send_mask_every, 3);
        }
        other => panic!("expected ack, got {other:?}"),
    }
    assert!(!state.stop_requested());
}

#[tokio::test]
async fn stop_record_flags_the_session() {
    let state = SessionState::new();
    let store = ParamStore::new(default_params(ParamUpdate::default()));
    let (out_tx, _out_rx) = mpsc::channel::<Outbound>(4);

    handle_inbound(r#"{"type": "stop"}"#, &state, &store, &out_tx).await;
    assert!(state.stop_requested());
    assert_eq!(state.status(), SessionStatus::Stopped);
}

#[tokio::test]
async fn malformed_inbound_records_are_ignored() {
    let state = SessionState::new();
    let store = ParamStore::new(default_params(ParamUpdate::default()));
    let before = store.snapshot();
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(4);

    handle_inbound("not json at all", &state, &store, &out_tx).await;
    handle_inbound(r#"{"type": "unknown_thing"}"#, &state, &store, &out_tx).await;

    assert!(!state.stop_requested());
    assert_eq!(store.snapshot(), before);
    assert!(out_rx.try_recv().is_err(), "no ack for garbage");
}
